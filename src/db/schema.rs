//! Schema synchronizer: makes the store's schema match the metamodel.
//!
//! Every operation is an idempotent upsert, so synchronization runs on
//! every process start and tolerates concurrent first-use callers racing
//! each other.

use crate::error::{PersistError, Result};
use crate::meta::{Feature, FeatureKind, Metamodel, ValueType, ANN_INDEX_KIND};
use crate::store::{IndexKind, IndexSpec, StorageType, StoreSession};
use tracing::{debug, info};

/// Universal root class every class without declared supertypes attaches
/// to.
pub const ROOT_CLASS: &str = "ModelObject";
/// Sentinel vertex class standing in for objects of unresolved roots; its
/// only property is the external address.
pub const PROXY_CLASS: &str = "ModelProxy";
/// Shared edge class carrying every cross-reference.
pub const REF_EDGE_CLASS: &str = "ModelRef";

/// Edge property names of [`REF_EDGE_CLASS`].
pub(crate) const EDGE_FROM_FRAGMENT: &str = "from_fragment";
pub(crate) const EDGE_FEATURE: &str = "feature";
pub(crate) const EDGE_TO_FRAGMENT: &str = "to_fragment";
pub(crate) const EDGE_INDEX: &str = "index";
pub(crate) const EDGE_DECLARED_CLASS: &str = "declared_class";

/// Property of [`PROXY_CLASS`] holding the external address string.
pub(crate) const PROXY_ADDRESS: &str = "address";

const DEFAULT_ANALYZER: &str = "standard";

/// Idempotently creates schema classes, inheritance links, properties and
/// indexes for every class reachable from the metamodel.
pub(crate) fn ensure_schema(metamodel: &Metamodel, store: &mut dyn StoreSession) -> Result<()> {
    store.ensure_vertex_class(ROOT_CLASS, true)?;
    store.ensure_vertex_class(PROXY_CLASS, false)?;
    store.ensure_superclass(PROXY_CLASS, ROOT_CLASS)?;
    store.ensure_property(PROXY_CLASS, PROXY_ADDRESS, StorageType::String, None)?;

    store.ensure_edge_class(REF_EDGE_CLASS)?;
    for prop in [
        EDGE_FROM_FRAGMENT,
        EDGE_FEATURE,
        EDGE_TO_FRAGMENT,
        EDGE_DECLARED_CLASS,
    ] {
        store.ensure_property(REF_EDGE_CLASS, prop, StorageType::String, None)?;
    }
    store.ensure_property(REF_EDGE_CLASS, EDGE_INDEX, StorageType::Int, None)?;

    for name in metamodel.class_names() {
        ensure_class(metamodel, store, name)?;
    }
    Ok(())
}

fn ensure_class(metamodel: &Metamodel, store: &mut dyn StoreSession, name: &str) -> Result<()> {
    let shape = metamodel.shape(name)?;
    let class = metamodel
        .class(name)
        .expect("shape resolution verified registration");
    store.ensure_vertex_class(&shape.storage_class, shape.is_abstract)?;

    if class.supertypes.is_empty() {
        store.ensure_superclass(&shape.storage_class, ROOT_CLASS)?;
    }
    for super_name in &class.supertypes {
        let super_shape = metamodel.shape(super_name)?;
        store.ensure_vertex_class(&super_shape.storage_class, super_shape.is_abstract)?;
        store.ensure_superclass(&shape.storage_class, &super_shape.storage_class)?;
    }

    let mut id_attribute: Option<&Feature> = None;
    for feature in shape.declared_features() {
        if !feature.is_persisted() {
            continue;
        }
        match &feature.kind {
            // Cross-references become edges, created lazily; no property.
            FeatureKind::Reference { .. } => continue,
            FeatureKind::Container { .. } => continue,
            FeatureKind::Containment { target } => {
                let target_shape = metamodel.shape(target)?;
                store.ensure_vertex_class(&target_shape.storage_class, target_shape.is_abstract)?;
                let storage = if feature.many {
                    StorageType::EmbeddedList
                } else {
                    StorageType::Embedded
                };
                store.ensure_property(
                    &shape.storage_class,
                    &feature.name,
                    storage,
                    Some(&target_shape.storage_class),
                )?;
            }
            FeatureKind::Attribute { value_type, is_id } => {
                let storage = if feature.many {
                    StorageType::EmbeddedList
                } else {
                    attribute_storage(*value_type)
                };
                store.ensure_property(&shape.storage_class, &feature.name, storage, None)?;
                if *is_id {
                    id_attribute = Some(feature);
                }
                if let Some(kind) = feature.annotation(ANN_INDEX_KIND) {
                    ensure_annotated_index(store, &shape.storage_class, feature, kind)?;
                }
            }
        }
    }

    if let Some(id) = id_attribute {
        ensure_unique_index(store, &shape.storage_class, &id.name, "pk")?;
    }
    // A qualified-name feature gets its own uniqueness index, scoped to
    // the declaring class only and skipped when it doubles as the id.
    if let Some(qname) = shape.qname_feature() {
        let declared_here = shape.declared_features().iter().any(|f| f.name == qname.name);
        let is_id = id_attribute.is_some_and(|id| id.name == qname.name);
        if declared_here && !is_id {
            ensure_unique_index(store, &shape.storage_class, &qname.name, "ak")?;
        }
    }
    debug!(class = name, storage = %shape.storage_class, "schema class synchronized");
    Ok(())
}

fn ensure_unique_index(
    store: &mut dyn StoreSession,
    storage_class: &str,
    field: &str,
    suffix: &str,
) -> Result<()> {
    let name = format!("{storage_class}_{field}_{suffix}");
    if !store.has_index(storage_class, &name) {
        info!(index = %name, "creating unique index");
        store.ensure_index(
            storage_class,
            IndexSpec {
                name,
                kind: IndexKind::Unique,
                fields: vec![field.to_string()],
                analyzer: None,
            },
        )?;
    }
    Ok(())
}

fn ensure_annotated_index(
    store: &mut dyn StoreSession,
    storage_class: &str,
    feature: &Feature,
    kind: &str,
) -> Result<()> {
    let name = format!("{storage_class}_{}_ie", feature.name);
    if store.has_index(storage_class, &name) {
        return Ok(());
    }
    let (kind, analyzer) = match kind {
        "plain" => (IndexKind::Plain, None),
        "fulltext" => (IndexKind::FullText, Some(DEFAULT_ANALYZER.to_string())),
        "spatial" => (IndexKind::Spatial, Some(DEFAULT_ANALYZER.to_string())),
        other => {
            return Err(PersistError::InvalidArgument(format!(
                "unknown index kind `{other}` on feature {}",
                feature.name
            )))
        }
    };
    info!(index = %name, ?kind, "creating index");
    store.ensure_index(
        storage_class,
        IndexSpec {
            name,
            kind,
            fields: vec![feature.name.clone()],
            analyzer,
        },
    )
}

/// Storage type of a single-valued attribute. Timestamps travel as
/// strings and are converted at the hydration boundary.
pub(crate) fn attribute_storage(value_type: ValueType) -> StorageType {
    match value_type {
        ValueType::Bool => StorageType::Bool,
        ValueType::Int => StorageType::Int,
        ValueType::Float => StorageType::Float,
        ValueType::String => StorageType::String,
        ValueType::Bytes => StorageType::Bytes,
        ValueType::Timestamp => StorageType::String,
    }
}
