use modelgraph::{
    Feature, Instance, MemoryStore, Metamodel, ModelClass, ModelStore, PersistError, RootEntry,
    Slot, StoreConnector, StoreSchema, Value, ValueType, PROXY_CLASS, REF_EDGE_CLASS, ROOT_CLASS,
};
use std::sync::Arc;

fn publishing_metamodel() -> Metamodel {
    let mut mm = Metamodel::new();
    mm.register(
        ModelClass::new("pub", "Media")
            .abstract_class()
            .feature(Feature::attribute("ean", ValueType::String)),
    )
    .unwrap();
    mm.register(
        ModelClass::new("pub", "Book")
            .extends("Media")
            .feature(Feature::attribute("isbn", ValueType::String).id())
            .feature(
                Feature::attribute("title", ValueType::String).annotate("qname", "true"),
            )
            .feature(
                Feature::attribute("blurb", ValueType::String).annotate("indexKind", "fulltext"),
            )
            .feature(Feature::containment("chapters", "Chapter").many())
            .feature(Feature::reference("cites", "Book").many()),
    )
    .unwrap();
    mm.register(
        ModelClass::new("pub", "Chapter")
            .feature(Feature::attribute("heading", ValueType::String))
            .feature(Feature::container("book", "Book")),
    )
    .unwrap();
    mm.register(
        ModelClass::new("pub", "Archive")
            .annotate("storageClass", "vault")
            .feature(Feature::attribute("site", ValueType::String).annotate("indexKind", "spatial")),
    )
    .unwrap();
    mm
}

fn open_engine() -> (MemoryStore, ModelStore) {
    let backend = MemoryStore::new();
    let engine = ModelStore::new(Arc::new(backend.clone()), publishing_metamodel());
    engine.ensure_schema().unwrap();
    (backend, engine)
}

#[test]
fn classes_inheritance_and_builtins_are_created() {
    let (backend, _engine) = open_engine();
    let schema = backend.open_session().unwrap();

    for class in [ROOT_CLASS, PROXY_CLASS, REF_EDGE_CLASS, "pub_Media", "pub_Book", "pub_Chapter", "vault"] {
        assert!(schema.has_class(class), "{class} missing");
    }
    assert!(schema.is_subclass_of("pub_Book", "pub_Media"));
    assert!(schema.is_subclass_of("pub_Book", ROOT_CLASS));
    // classes without declared supertypes root under the universal class
    assert!(schema.is_subclass_of("pub_Media", ROOT_CLASS));
    assert!(schema.is_subclass_of(PROXY_CLASS, ROOT_CLASS));
    assert!(schema.has_property(PROXY_CLASS, "address"));
    for prop in ["from_fragment", "feature", "to_fragment", "index", "declared_class"] {
        assert!(schema.has_property(REF_EDGE_CLASS, prop), "{prop} missing");
    }
}

#[test]
fn properties_follow_feature_kinds() {
    let (backend, _engine) = open_engine();
    let schema = backend.open_session().unwrap();

    assert!(schema.has_property("pub_Book", "isbn"));
    assert!(schema.has_property("pub_Book", "chapters"));
    // cross-references become edges, never schema properties
    assert!(!schema.has_property("pub_Book", "cites"));
    // container features (the inverse of a containment) are not persisted
    assert!(!schema.has_property("pub_Chapter", "book"));
    // inherited features stay on the declaring class
    assert!(schema.has_property("pub_Media", "ean"));
    assert!(!schema.has_property("pub_Book", "ean"));
}

#[test]
fn indexes_cover_ids_qnames_and_annotations() {
    let (backend, _engine) = open_engine();
    let schema = backend.open_session().unwrap();

    assert!(schema.has_index("pub_Book", "pub_Book_isbn_pk"));
    assert!(schema.has_index("pub_Book", "pub_Book_title_ak"));
    assert!(schema.has_index("pub_Book", "pub_Book_blurb_ie"));
    assert!(schema.has_index("vault", "vault_site_ie"));
}

#[test]
fn synchronization_is_idempotent_across_restarts() {
    let (backend, engine) = open_engine();
    engine.ensure_schema().unwrap();
    engine.ensure_schema().unwrap();

    let schema = backend.open_session().unwrap();
    assert!(schema.has_index("pub_Book", "pub_Book_isbn_pk"));
    assert!(schema.is_subclass_of("pub_Book", "pub_Media"));
}

#[test]
fn abstract_classes_are_not_instantiable() {
    let (_backend, engine) = open_engine();
    let mut session = engine.session().unwrap();
    let mut entry = RootEntry::from_instance(
        Instance::new("Media").with("ean", Slot::Value(Value::str("123"))),
    );
    let err = session.save(&mut entry).unwrap_err();
    assert!(matches!(err, PersistError::InvalidArgument(_)));
}

#[test]
fn forced_abstract_annotation_propagates_to_subclasses() {
    let mut mm = Metamodel::new();
    mm.register(ModelClass::new("x", "Sealed").annotate("abstract", "true"))
        .unwrap();
    mm.register(ModelClass::new("x", "Leaf").extends("Sealed"))
        .unwrap();
    let backend = MemoryStore::new();
    let engine = ModelStore::new(Arc::new(backend), mm);
    engine.ensure_schema().unwrap();

    let mut session = engine.session().unwrap();
    let mut entry = RootEntry::from_instance(Instance::new("Leaf"));
    let err = session.save(&mut entry).unwrap_err();
    assert!(matches!(err, PersistError::InvalidArgument(_)));
}

#[test]
fn id_uniqueness_is_enforced_through_the_engine() {
    let (_backend, engine) = open_engine();
    let mut session = engine.session().unwrap();

    let book = |isbn: &str, title: &str| {
        RootEntry::from_instance(
            Instance::new("Book")
                .with("isbn", Slot::Value(Value::str(isbn)))
                .with("title", Slot::Value(Value::str(title))),
        )
    };
    session.save(&mut book("1", "first")).unwrap();
    let err = session.save(&mut book("1", "second")).unwrap_err();
    assert!(matches!(err, PersistError::InvalidArgument(_)));
    // the qualified-name index is unique too
    let err = session.save(&mut book("2", "first")).unwrap_err();
    assert!(matches!(err, PersistError::InvalidArgument(_)));
    session.save(&mut book("2", "another")).unwrap();
}

#[test]
fn unknown_stored_classes_are_fatal_on_hydration() {
    let (backend, engine) = open_engine();
    let mut session = engine.session().unwrap();
    let mut entry = RootEntry::from_instance(
        Instance::new("Book")
            .with("isbn", Slot::Value(Value::str("1")))
            .with("title", Slot::Value(Value::str("t"))),
    );
    session.save(&mut entry).unwrap();
    let address = entry.address.clone().unwrap();

    // a store written by a richer metamodel: the vertex class exists in
    // the schema but not in the registered metamodel
    let reduced = {
        let mut mm = Metamodel::new();
        mm.register(
            ModelClass::new("other", "Thing")
                .feature(Feature::attribute("x", ValueType::Int)),
        )
        .unwrap();
        mm
    };
    let foreign = ModelStore::new(Arc::new(backend), reduced);
    let session = foreign.session().unwrap();
    let err = session.load(&address).unwrap_err();
    assert!(matches!(err, PersistError::Schema(_)));
}
