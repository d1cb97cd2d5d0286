//! Graph hydrator: reconstructs typed object graphs from store elements.

use crate::address::{Address, Fragment};
use crate::db::events::Events;
use crate::db::schema::{PROXY_ADDRESS, PROXY_CLASS, REF_EDGE_CLASS};
use crate::db::RefEdgeData;
use crate::error::{PersistError, Result};
use crate::instance::{Instance, RefTarget, RootEntry, Slot, Value};
use crate::meta::{FeatureKind, Metamodel, ValueType};
use crate::model::{Document, PropValue, VertexRecord};
use crate::store::StoreSession;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

/// Loads a root entry by address. Versions carried by the address are
/// ignored; the returned entry captures the versions currently stored.
pub(crate) fn load_entry(
    store: &dyn StoreSession,
    metamodel: &Metamodel,
    events: &Events,
    address: &Address,
) -> Result<RootEntry> {
    let mut entry = RootEntry::new();
    let mut roots = Vec::with_capacity(address.roots.len());
    for (index, &(id, _)) in address.roots.iter().enumerate() {
        let record = store.read_vertex(id)?.ok_or_else(|| {
            PersistError::AddressResolution(format!("vertex {id} not found"))
        })?;
        entry.contents.push(hydrate_instance(store, metamodel, &record, index)?);
        roots.push((id, record.version));
    }
    entry.address = Some(Address::for_vertices(roots));
    debug!(address = %address, contents = entry.contents.len(), "loaded entry");
    events.fire_after_load(&entry);
    Ok(entry)
}

/// Reconstructs one top-level instance: embedded containment tree first,
/// then the reference edges attached to its vertex.
pub(crate) fn hydrate_instance(
    store: &dyn StoreSession,
    metamodel: &Metamodel,
    record: &VertexRecord,
    entry_index: usize,
) -> Result<Instance> {
    let mut instance = instance_from_document(metamodel, &record.doc)?;
    apply_reference_edges(store, metamodel, record, entry_index, &mut instance)?;
    Ok(instance)
}

fn instance_from_document(metamodel: &Metamodel, doc: &Document) -> Result<Instance> {
    // Unknown storage classes are fatal: the store holds data this
    // metamodel cannot describe.
    let shape = metamodel.shape_by_storage_class(&doc.class)?;
    let mut instance = Instance::new(&shape.name);
    for feature in shape.features() {
        if !feature.is_persisted() {
            continue;
        }
        let Some(stored) = doc.get(&feature.name) else {
            continue;
        };
        let slot = match &feature.kind {
            FeatureKind::Attribute { value_type, .. } => {
                if feature.many {
                    let PropValue::List(items) = stored else {
                        return Err(type_mismatch(&shape.name, &feature.name));
                    };
                    let values = items
                        .iter()
                        .map(|item| prop_to_value(*value_type, item))
                        .collect::<Result<Vec<_>>>()
                        .map_err(|_| type_mismatch(&shape.name, &feature.name))?;
                    Slot::Values(values)
                } else {
                    Slot::Value(
                        prop_to_value(*value_type, stored)
                            .map_err(|_| type_mismatch(&shape.name, &feature.name))?,
                    )
                }
            }
            FeatureKind::Containment { .. } => {
                if feature.many {
                    let PropValue::List(items) = stored else {
                        return Err(type_mismatch(&shape.name, &feature.name));
                    };
                    let children = items
                        .iter()
                        .map(|item| match item {
                            PropValue::Doc(doc) => instance_from_document(metamodel, doc),
                            _ => Err(type_mismatch(&shape.name, &feature.name)),
                        })
                        .collect::<Result<Vec<_>>>()?;
                    Slot::Children(children)
                } else {
                    let PropValue::Doc(child) = stored else {
                        return Err(type_mismatch(&shape.name, &feature.name));
                    };
                    Slot::Child(Box::new(instance_from_document(metamodel, child)?))
                }
            }
            // Cross-references live on edges; a stray stored property is
            // stale data and is ignored.
            FeatureKind::Reference { .. } | FeatureKind::Container { .. } => continue,
        };
        instance.set(feature.name.clone(), slot);
    }
    Ok(instance)
}

fn apply_reference_edges(
    store: &dyn StoreSession,
    metamodel: &Metamodel,
    record: &VertexRecord,
    entry_index: usize,
    instance: &mut Instance,
) -> Result<()> {
    let mut edges = Vec::new();
    for edge in store.out_edges(record.id, REF_EDGE_CLASS)? {
        let data = RefEdgeData::decode(&edge)?;
        edges.push((data, edge));
    }
    // Multi-valued features reassemble by ascending position; -1 singles
    // sort ahead and don't care.
    edges.sort_by_key(|(data, edge)| (data.index, edge.id));

    for (data, edge) in edges {
        let target = if edge.to == record.id {
            RefTarget::Local(Fragment::new(entry_index, data.to_fragment.clone()))
        } else {
            let to_record = store.read_vertex(edge.to)?.ok_or_else(|| {
                PersistError::Corruption(format!(
                    "edge {} points at missing vertex {}",
                    edge.id, edge.to
                ))
            })?;
            let address = if store.is_subclass_of(&to_record.class, PROXY_CLASS) {
                // Proxy vertices carry their external address verbatim.
                let stored = to_record
                    .doc
                    .get(PROXY_ADDRESS)
                    .and_then(PropValue::as_str)
                    .ok_or_else(|| {
                        PersistError::Corruption(format!(
                            "proxy vertex {} has no address",
                            to_record.id
                        ))
                    })?;
                Address::parse(stored)?
            } else {
                Address::for_vertex(to_record.id, to_record.version)
                    .with_fragment(Fragment::new(0, data.to_fragment.clone()))
            };
            RefTarget::Proxy {
                class: data.declared_class.clone(),
                address,
            }
        };

        let owner = instance.navigate_mut(&data.from_fragment).ok_or_else(|| {
            PersistError::Corruption(format!(
                "reference owner `{}` not found for feature {}",
                data.from_fragment, data.feature
            ))
        })?;
        let shape = metamodel.shape(&owner.class)?;
        // Schema drift tolerance: an edge for a feature the metamodel no
        // longer declares as a cross-reference is skipped, not an error.
        let Some(feature) = shape.feature(&data.feature) else {
            continue;
        };
        if !feature.is_cross_reference() {
            continue;
        }
        if feature.many {
            if !matches!(owner.slots.get(&data.feature), Some(Slot::Refs(_))) {
                owner.set(data.feature.clone(), Slot::Refs(Vec::new()));
            }
            if let Some(Slot::Refs(refs)) = owner.slots.get_mut(&data.feature) {
                refs.push(target);
            }
        } else {
            owner.set(data.feature.clone(), Slot::Ref(target));
        }
    }
    Ok(())
}

fn type_mismatch(class: &str, feature: &str) -> PersistError {
    PersistError::Corruption(format!(
        "stored value for {class}.{feature} has an unexpected type"
    ))
}

/// Converts a stored property value back to its model-typed
/// representation, including timestamp parsing.
pub(crate) fn prop_to_value(value_type: ValueType, stored: &PropValue) -> Result<Value> {
    let value = match (value_type, stored) {
        (ValueType::Bool, PropValue::Bool(b)) => Value::Bool(*b),
        (ValueType::Int, PropValue::Int(i)) => Value::Int(*i),
        (ValueType::Float, PropValue::Float(f)) => Value::Float(*f),
        (ValueType::String, PropValue::Str(s)) => Value::Str(s.clone()),
        (ValueType::Bytes, PropValue::Bytes(b)) => Value::Bytes(b.clone()),
        (ValueType::Timestamp, PropValue::Str(s)) => Value::Timestamp(
            OffsetDateTime::parse(s, &Rfc3339).map_err(|e| {
                PersistError::Corruption(format!("malformed stored timestamp `{s}`: {e}"))
            })?,
        ),
        _ => {
            return Err(PersistError::Corruption(
                "stored value does not match its attribute type".into(),
            ))
        }
    };
    Ok(value)
}
