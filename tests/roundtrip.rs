use modelgraph::{
    Address, Feature, Fragment, Instance, MemoryStore, Metamodel, ModelClass, ModelStore,
    PropValue, QueryParams, RefTarget, RootEntry, Slot, StoreConnector, StoreSession, Value,
    ValueType, REF_EDGE_CLASS,
};
use std::sync::Arc;
use time::macros::datetime;

fn library_metamodel() -> Metamodel {
    let mut mm = Metamodel::new();
    mm.register(
        ModelClass::new("lib", "Library")
            .feature(Feature::attribute("name", ValueType::String).id())
            .feature(Feature::attribute("tags", ValueType::String).many())
            .feature(Feature::attribute("established", ValueType::Timestamp))
            .feature(Feature::attribute("rating", ValueType::Float))
            .feature(Feature::attribute("open", ValueType::Bool))
            .feature(Feature::attribute("motto", ValueType::Bytes))
            .feature(Feature::attribute("visits", ValueType::Int))
            .feature(Feature::attribute("summary", ValueType::String).derived())
            .feature(Feature::attribute("scratch", ValueType::String).transient())
            .feature(Feature::containment("shelves", "Shelf").many())
            .feature(Feature::containment("featured", "Book"))
            .feature(Feature::reference("favorite", "Book")),
    )
    .unwrap();
    mm.register(
        ModelClass::new("lib", "Shelf")
            .feature(Feature::attribute("label", ValueType::String))
            .feature(Feature::containment("books", "Book").many()),
    )
    .unwrap();
    mm.register(
        ModelClass::new("lib", "Book")
            .feature(Feature::attribute("title", ValueType::String))
            .feature(Feature::attribute("pages", ValueType::Int))
            .feature(Feature::reference("sequel", "Book"))
            .feature(Feature::reference("related", "Book").many()),
    )
    .unwrap();
    mm
}

fn open_engine() -> (MemoryStore, ModelStore) {
    let backend = MemoryStore::new();
    let engine = ModelStore::new(Arc::new(backend.clone()), library_metamodel());
    engine.ensure_schema().unwrap();
    (backend, engine)
}

fn sample_library() -> Instance {
    let dune = Instance::new("Book")
        .with("title", Slot::Value(Value::str("Dune")))
        .with("pages", Slot::Value(Value::Int(412)))
        .with(
            "sequel",
            Slot::Ref(RefTarget::Local(Fragment::new(
                0,
                "shelves.0/books.1".parse().unwrap(),
            ))),
        )
        .with(
            "related",
            Slot::Refs(vec![
                RefTarget::Local(Fragment::new(0, "shelves.0/books.1".parse().unwrap())),
                RefTarget::Local(Fragment::new(0, "featured".parse().unwrap())),
            ]),
        );
    let messiah = Instance::new("Book").with("title", Slot::Value(Value::str("Messiah")));
    let shelf = Instance::new("Shelf")
        .with("label", Slot::Value(Value::str("scifi")))
        .with("books", Slot::Children(vec![dune, messiah]));
    Instance::new("Library")
        .with("name", Slot::Value(Value::str("central")))
        .with(
            "tags",
            Slot::Values(vec![Value::str("public"), Value::str("brick")]),
        )
        .with(
            "established",
            Slot::Value(Value::Timestamp(datetime!(1901-05-03 9:00 UTC))),
        )
        .with("rating", Slot::Value(Value::Float(4.5)))
        .with("open", Slot::Value(Value::Bool(true)))
        .with("motto", Slot::Value(Value::Bytes(vec![0x6d, 0x67])))
        .with("shelves", Slot::Children(vec![shelf]))
        .with(
            "featured",
            Slot::Child(Box::new(
                Instance::new("Book").with("title", Slot::Value(Value::str("Sands"))),
            )),
        )
        .with(
            "favorite",
            Slot::Ref(RefTarget::Local(Fragment::new(
                0,
                "shelves.0/books.0".parse().unwrap(),
            ))),
        )
}

#[test]
fn full_graph_round_trips_structurally() {
    let (_backend, engine) = open_engine();
    let mut session = engine.session().unwrap();

    let mut entry = RootEntry::from_instance(sample_library());
    session.save(&mut entry).unwrap();
    let address = entry.address.clone().unwrap();

    let loaded = session.load(&address).unwrap();
    assert_eq!(loaded.contents, entry.contents);
    assert_eq!(loaded.address.unwrap().roots, address.roots);
}

#[test]
fn derived_and_transient_features_are_not_persisted() {
    let (_backend, engine) = open_engine();
    let mut session = engine.session().unwrap();

    let mut library = sample_library();
    library.set("summary", Slot::Value(Value::str("computed")));
    library.set("scratch", Slot::Value(Value::str("temp")));
    let mut entry = RootEntry::from_instance(library);
    session.save(&mut entry).unwrap();

    let loaded = session.load(entry.address.as_ref().unwrap()).unwrap();
    assert!(loaded.contents[0].slot("summary").is_none());
    assert!(loaded.contents[0].slot("scratch").is_none());
}

#[test]
fn versions_increase_by_one_per_save_and_stale_saves_fail() {
    let (_backend, engine) = open_engine();
    let mut session = engine.session().unwrap();

    let mut entry = RootEntry::from_instance(sample_library());
    session.save(&mut entry).unwrap();
    let first_address = entry.address.clone().unwrap();
    assert_eq!(first_address.roots[0].1, 1);

    // A second reader captures version 1 before the writer moves on.
    let mut stale = session.load(&first_address).unwrap();

    session.save(&mut entry).unwrap();
    session.save(&mut entry).unwrap();
    assert_eq!(entry.address.as_ref().unwrap().roots[0].1, 3);

    stale.contents[0].set("visits", Slot::Value(Value::Int(1)));
    let err = session.save(&mut stale).unwrap_err();
    assert!(err.is_concurrency());

    // The failed save mutated nothing.
    let reloaded = session.load(&first_address).unwrap();
    assert_eq!(reloaded.address.unwrap().roots[0].1, 3);
    assert!(reloaded.contents[0].value("visits").is_none());
}

#[test]
fn unchanged_second_save_touches_no_edges() {
    let (backend, engine) = open_engine();
    let mut session = engine.session().unwrap();

    let mut entry = RootEntry::from_instance(sample_library());
    session.save(&mut entry).unwrap();
    let vertex = entry.address.as_ref().unwrap().roots[0].0;

    let raw = backend.open_session().unwrap();
    let before: Vec<u64> = raw
        .out_edges(vertex, REF_EDGE_CLASS)
        .unwrap()
        .iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(before.len(), 4);

    session.save(&mut entry).unwrap();
    let after: Vec<u64> = raw
        .out_edges(vertex, REF_EDGE_CLASS)
        .unwrap()
        .iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(before, after);
    assert_eq!(backend.edge_count(), before.len());
}

#[test]
fn unset_features_drop_their_stored_properties() {
    let (_backend, engine) = open_engine();
    let mut session = engine.session().unwrap();

    let mut entry = RootEntry::from_instance(sample_library());
    session.save(&mut entry).unwrap();

    entry.contents[0].unset("rating");
    entry.contents[0].unset("tags");
    session.save(&mut entry).unwrap();

    let loaded = session.load(entry.address.as_ref().unwrap()).unwrap();
    assert!(loaded.contents[0].value("rating").is_none());
    assert!(loaded.contents[0].values("tags").is_none());
    assert_eq!(
        loaded.contents[0].value("name").unwrap().as_str(),
        Some("central")
    );
}

#[test]
fn empty_lists_survive_round_trips() {
    let (_backend, engine) = open_engine();
    let mut session = engine.session().unwrap();

    let library = Instance::new("Library")
        .with("name", Slot::Value(Value::str("empty")))
        .with("tags", Slot::Values(Vec::new()))
        .with("shelves", Slot::Children(Vec::new()));
    let mut entry = RootEntry::from_instance(library);
    session.save(&mut entry).unwrap();

    let loaded = session.load(entry.address.as_ref().unwrap()).unwrap();
    assert_eq!(loaded.contents[0].values("tags").unwrap().len(), 0);
    assert_eq!(loaded.contents[0].children("shelves").unwrap().len(), 0);
}

#[test]
fn sibling_references_hydrate_as_proxies_onto_the_sibling_vertex() {
    let (_backend, engine) = open_engine();
    let mut session = engine.session().unwrap();

    let first = Instance::new("Library")
        .with("name", Slot::Value(Value::str("west")))
        .with(
            "favorite",
            Slot::Ref(RefTarget::Local(Fragment::new(
                1,
                "featured".parse().unwrap(),
            ))),
        );
    let second = Instance::new("Library")
        .with("name", Slot::Value(Value::str("east")))
        .with(
            "featured",
            Slot::Child(Box::new(
                Instance::new("Book").with("title", Slot::Value(Value::str("Atlas"))),
            )),
        );
    let mut entry = RootEntry::new();
    entry.push(first);
    entry.push(second);
    session.save(&mut entry).unwrap();
    let address = entry.address.clone().unwrap();

    let loaded = session.load(&address).unwrap();
    match loaded.contents[0].reference("favorite").unwrap() {
        RefTarget::Proxy {
            class,
            address: target,
        } => {
            assert_eq!(class, "Book");
            assert_eq!(target.roots[0].0, address.roots[1].0);
            assert_eq!(
                target.fragment.as_ref().unwrap().path.to_string(),
                "featured"
            );
            let resolved = session.resolve(target).unwrap();
            assert_eq!(resolved.value("title").unwrap().as_str(), Some("Atlas"));
        }
        other => panic!("expected proxy, got {other:?}"),
    }
}

#[test]
fn queries_materialize_lazily_per_matching_vertex() {
    let (_backend, engine) = open_engine();
    let mut session = engine.session().unwrap();

    for name in ["a", "b", "c"] {
        let mut entry = RootEntry::from_instance(
            Instance::new("Library").with("name", Slot::Value(Value::str(name))),
        );
        session.save(&mut entry).unwrap();
    }

    let results = session.query("lib_Library", &QueryParams::None).unwrap();
    assert_eq!(results.remaining(), 3);
    let names: Vec<String> = results
        .map(|entry| {
            entry.unwrap().contents[0]
                .value("name")
                .unwrap()
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect();
    assert_eq!(names, ["a", "b", "c"]);

    let hits: Vec<RootEntry> = session
        .query(
            "lib_Library where name = $0",
            &QueryParams::positional([PropValue::str("b")]),
        )
        .unwrap()
        .collect::<modelgraph::Result<_>>()
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].contents[0].value("name").unwrap().as_str(), Some("b"));
}

#[test]
fn addresses_are_opaque_strings_that_round_trip() {
    let (_backend, engine) = open_engine();
    let mut session = engine.session().unwrap();

    let mut entry = RootEntry::from_instance(sample_library());
    session.save(&mut entry).unwrap();
    let address = entry.address.clone().unwrap();

    let reparsed = Address::parse(&address.to_string()).unwrap();
    assert_eq!(reparsed, address);
    let loaded = session.load(&reparsed).unwrap();
    assert_eq!(loaded.contents, entry.contents);
}
