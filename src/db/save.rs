//! Graph materializer: serializes rooted object graphs into vertices,
//! embedded documents and reference edges.
//!
//! Every save and delete validates all top-level instances (version,
//! dependencies, document shape) before the first mutation, preserving
//! all-or-nothing behavior at root-entry granularity. Only store-level
//! I/O failures can interrupt the mutation phase.

use crate::address::{Address, FragmentPath};
use crate::db::depend::{self, element_label};
use crate::db::events::Events;
use crate::db::load;
use crate::db::schema::{PROXY_ADDRESS, PROXY_CLASS, REF_EDGE_CLASS};
use crate::db::RefEdgeData;
use crate::error::{PersistError, Result};
use crate::instance::{Instance, RefTarget, RootEntry, Slot, Value};
use crate::meta::{FeatureKind, Metamodel, ValueType};
use crate::model::{Document, PropValue, VertexId, VertexRecord};
use crate::store::StoreSession;
use std::collections::BTreeSet;
use time::format_description::well_known::Rfc3339;
use tracing::debug;

enum Planned {
    Create { storage_class: String },
    Update { record: VertexRecord },
}

pub(crate) fn save_entry(
    store: &mut dyn StoreSession,
    metamodel: &Metamodel,
    events: &Events,
    entry: &mut RootEntry,
) -> Result<()> {
    let captured: Vec<(VertexId, u64)> = entry
        .address
        .as_ref()
        .map(|a| a.roots.clone())
        .unwrap_or_default();

    // Validation phase: nothing below may mutate the store.
    let mut plan = Vec::with_capacity(entry.contents.len());
    let mut old_entry = RootEntry::new();
    for (index, instance) in entry.contents.iter().enumerate() {
        let shape = metamodel.shape(&instance.class)?;
        if shape.is_abstract {
            return Err(PersistError::InvalidArgument(format!(
                "class {} is abstract and not instantiable",
                instance.class
            )));
        }
        match captured.get(index).copied() {
            None => plan.push(Planned::Create {
                storage_class: shape.storage_class.clone(),
            }),
            Some((id, version)) => {
                let record = store.read_vertex(id)?.ok_or_else(|| {
                    PersistError::AddressResolution(format!(
                        "can't save over vertex {id}: not found"
                    ))
                })?;
                check_version(version, &record)?;
                if record.class != shape.storage_class {
                    return Err(PersistError::InvalidArgument(format!(
                        "can't change stored class of vertex {id} from {} to {}",
                        record.class, shape.storage_class
                    )));
                }
                let blockers = depend::blocking_for_overwrite(&*store, &record, instance)?;
                if !blockers.is_empty() {
                    return Err(PersistError::Integrity {
                        action: "save",
                        element: element_label(&record),
                        blockers,
                    });
                }
                old_entry
                    .contents
                    .push(load::hydrate_instance(&*store, metamodel, &record, index)?);
                plan.push(Planned::Update { record });
            }
        }
    }

    // Documents and cross-reference sets are computed up front as well;
    // they validate slot shapes without touching the store.
    let mut docs = Vec::with_capacity(entry.contents.len());
    let mut cross_refs = Vec::with_capacity(entry.contents.len());
    for instance in &entry.contents {
        docs.push(build_document(metamodel, instance)?);
        let mut refs = Vec::new();
        collect_cross_refs(metamodel, entry, instance, &FragmentPath::root(), &mut refs)?;
        cross_refs.push(refs);
    }
    old_entry.address = entry.address.clone();

    events.fire_before_save(&old_entry, entry)?;

    // Mutation phase.
    let mut saved = Vec::with_capacity(entry.contents.len());
    for (doc, planned) in docs.into_iter().zip(&plan) {
        let record = match planned {
            Planned::Create { storage_class } => store.create_vertex(storage_class, doc)?,
            Planned::Update { record } => store.update_vertex(record.id, doc, record.version)?,
        };
        saved.push(record);
    }
    let sibling_ids: Vec<VertexId> = saved.iter().map(|r| r.id).collect();
    for (record, refs) in saved.iter().zip(cross_refs) {
        sync_reference_edges(store, record.id, refs, &sibling_ids)?;
    }
    debug!(
        contents = saved.len(),
        first = saved.first().map(|r| r.id),
        "saved entry"
    );

    events.fire_after_save(&old_entry, entry);
    entry.address = Some(Address::for_vertices(
        saved.iter().map(|r| (r.id, r.version)).collect(),
    ));
    Ok(())
}

pub(crate) fn delete_entry(
    store: &mut dyn StoreSession,
    metamodel: &Metamodel,
    events: &Events,
    address: &Address,
) -> Result<()> {
    let mut entry = RootEntry::new();
    let mut victims = Vec::with_capacity(address.roots.len());
    for (index, &(id, version)) in address.roots.iter().enumerate() {
        let record = store.read_vertex(id)?.ok_or_else(|| {
            PersistError::AddressResolution(format!("can't delete vertex {id}: not found"))
        })?;
        check_version(version, &record)?;
        let blockers = depend::blocking_for_delete(&*store, &record)?;
        if !blockers.is_empty() {
            return Err(PersistError::Integrity {
                action: "delete",
                element: element_label(&record),
                blockers,
            });
        }
        entry
            .contents
            .push(load::hydrate_instance(&*store, metamodel, &record, index)?);
        victims.push(record);
    }
    entry.address = Some(address.clone());

    events.fire_before_delete(&entry)?;

    for record in &victims {
        // Incident edges go first; the id set tolerates self-links that
        // show up in both directions.
        let mut edge_ids = BTreeSet::new();
        for edge in store.in_edges(record.id)? {
            edge_ids.insert(edge.id);
        }
        for edge in store.out_edges(record.id, REF_EDGE_CLASS)? {
            edge_ids.insert(edge.id);
        }
        for edge_id in edge_ids {
            store.delete_edge(edge_id)?;
        }
        store.delete_vertex(record.id)?;
    }
    debug!(address = %address, "deleted entry");
    Ok(())
}

fn check_version(captured: u64, record: &VertexRecord) -> Result<()> {
    if record.version != captured {
        return Err(PersistError::Concurrency {
            stored: record.version,
            captured,
        });
    }
    Ok(())
}

/// Builds the full property document of an instance, depth-first through
/// its containment tree. Replacing the stored document wholesale is what
/// removes properties of now-unset features.
fn build_document(metamodel: &Metamodel, instance: &Instance) -> Result<Document> {
    let shape = metamodel.shape(&instance.class)?;
    for name in instance.slots.keys() {
        if shape.feature(name).is_none() {
            return Err(PersistError::InvalidArgument(format!(
                "class {} has no feature {name}",
                instance.class
            )));
        }
    }
    let mut doc = Document::new(&shape.storage_class);
    for feature in shape.features() {
        if !feature.is_persisted() {
            continue;
        }
        let Some(slot) = instance.slot(&feature.name) else {
            continue;
        };
        match (&feature.kind, slot) {
            (FeatureKind::Attribute { value_type, .. }, Slot::Value(value)) if !feature.many => {
                doc.set(
                    feature.name.clone(),
                    value_to_prop(&instance.class, &feature.name, *value_type, value)?,
                );
            }
            (FeatureKind::Attribute { value_type, .. }, Slot::Values(values)) if feature.many => {
                let items = values
                    .iter()
                    .map(|v| value_to_prop(&instance.class, &feature.name, *value_type, v))
                    .collect::<Result<Vec<_>>>()?;
                doc.set(feature.name.clone(), PropValue::List(items));
            }
            (FeatureKind::Containment { target }, Slot::Child(child)) if !feature.many => {
                check_conforms(metamodel, child, target, &feature.name)?;
                doc.set(
                    feature.name.clone(),
                    PropValue::Doc(Box::new(build_document(metamodel, child)?)),
                );
            }
            (FeatureKind::Containment { target }, Slot::Children(children)) if feature.many => {
                let mut items = Vec::with_capacity(children.len());
                for child in children {
                    check_conforms(metamodel, child, target, &feature.name)?;
                    items.push(PropValue::Doc(Box::new(build_document(metamodel, child)?)));
                }
                doc.set(feature.name.clone(), PropValue::List(items));
            }
            // Cross-references are carried by edges, not properties.
            (FeatureKind::Reference { .. }, Slot::Ref(_)) if !feature.many => {}
            (FeatureKind::Reference { .. }, Slot::Refs(_)) if feature.many => {}
            _ => {
                return Err(PersistError::InvalidArgument(format!(
                    "slot {}.{} does not match its feature declaration",
                    instance.class, feature.name
                )))
            }
        }
    }
    Ok(doc)
}

fn check_conforms(
    metamodel: &Metamodel,
    child: &Instance,
    target: &str,
    feature: &str,
) -> Result<()> {
    let shape = metamodel.shape(&child.class)?;
    if shape.name != target && !shape.supertypes.iter().any(|s| s == target) {
        return Err(PersistError::InvalidArgument(format!(
            "containment {feature} expects {target}, got {}",
            child.class
        )));
    }
    Ok(())
}

fn value_to_prop(
    class: &str,
    feature: &str,
    value_type: ValueType,
    value: &Value,
) -> Result<PropValue> {
    let prop = match (value_type, value) {
        (ValueType::Bool, Value::Bool(b)) => PropValue::Bool(*b),
        (ValueType::Int, Value::Int(i)) => PropValue::Int(*i),
        (ValueType::Float, Value::Float(f)) => PropValue::Float(*f),
        (ValueType::String, Value::Str(s)) => PropValue::Str(s.clone()),
        (ValueType::Bytes, Value::Bytes(b)) => PropValue::Bytes(b.clone()),
        (ValueType::Timestamp, Value::Timestamp(ts)) => {
            PropValue::Str(ts.format(&Rfc3339).map_err(|e| {
                PersistError::InvalidArgument(format!(
                    "unformattable timestamp in {class}.{feature}: {e}"
                ))
            })?)
        }
        _ => {
            return Err(PersistError::InvalidArgument(format!(
                "value for {class}.{feature} does not match its declared type"
            )))
        }
    };
    Ok(prop)
}

/// One computed cross-reference of an instance tree.
struct CrossRef {
    from_fragment: FragmentPath,
    feature: String,
    index: i64,
    declared_class: String,
    target: RefTarget,
}

/// Explicit recursive traversal collecting every cross-reference of the
/// subtree rooted at `instance`, in feature declaration order.
fn collect_cross_refs(
    metamodel: &Metamodel,
    entry: &RootEntry,
    instance: &Instance,
    path: &FragmentPath,
    out: &mut Vec<CrossRef>,
) -> Result<()> {
    let shape = metamodel.shape(&instance.class)?;
    for feature in shape.features() {
        if !feature.is_persisted() {
            continue;
        }
        let Some(slot) = instance.slot(&feature.name) else {
            continue;
        };
        match (&feature.kind, slot) {
            (FeatureKind::Containment { .. }, Slot::Child(child)) => {
                collect_cross_refs(
                    metamodel,
                    entry,
                    child,
                    &path.child(&feature.name, None),
                    out,
                )?;
            }
            (FeatureKind::Containment { .. }, Slot::Children(children)) => {
                for (i, child) in children.iter().enumerate() {
                    collect_cross_refs(
                        metamodel,
                        entry,
                        child,
                        &path.child(&feature.name, Some(i)),
                        out,
                    )?;
                }
            }
            (FeatureKind::Reference { .. }, Slot::Ref(target)) => {
                out.push(CrossRef {
                    from_fragment: path.clone(),
                    feature: feature.name.clone(),
                    index: -1,
                    declared_class: declared_class_of(entry, target, &feature.name)?,
                    target: target.clone(),
                });
            }
            (FeatureKind::Reference { .. }, Slot::Refs(targets)) => {
                for (i, target) in targets.iter().enumerate() {
                    out.push(CrossRef {
                        from_fragment: path.clone(),
                        feature: feature.name.clone(),
                        index: i as i64,
                        declared_class: declared_class_of(entry, target, &feature.name)?,
                        target: target.clone(),
                    });
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn declared_class_of(entry: &RootEntry, target: &RefTarget, feature: &str) -> Result<String> {
    match target {
        RefTarget::Local(fragment) => entry
            .resolve(fragment)
            .map(|instance| instance.class.clone())
            .ok_or_else(|| {
                PersistError::InvalidArgument(format!(
                    "reference {feature} points at unresolved local fragment {fragment}"
                ))
            }),
        RefTarget::Proxy { class, .. } => Ok(class.clone()),
    }
}

/// Diffs the stored edge set of a vertex against the newly computed one.
/// Matching edges are untouched, stale edges deleted (garbage-collecting
/// proxy targets left without inbound edges), missing edges created.
fn sync_reference_edges(
    store: &mut dyn StoreSession,
    vertex_id: VertexId,
    computed: Vec<CrossRef>,
    sibling_ids: &[VertexId],
) -> Result<()> {
    let existing = store.out_edges(vertex_id, REF_EDGE_CLASS)?;
    let mut existing_keys = Vec::with_capacity(existing.len());
    for edge in &existing {
        existing_keys.push((RefEdgeData::decode(edge)?, edge.to));
    }
    let mut matched = vec![false; existing.len()];

    for cross_ref in computed {
        let (to, to_fragment) = resolve_target(store, &cross_ref.target, sibling_ids)?;
        let key = RefEdgeData {
            from_fragment: cross_ref.from_fragment,
            feature: cross_ref.feature,
            to_fragment,
            index: cross_ref.index,
            declared_class: cross_ref.declared_class,
        };
        let found = existing_keys
            .iter()
            .enumerate()
            .find(|(i, (data, edge_to))| !matched[*i] && *edge_to == to && *data == key)
            .map(|(i, _)| i);
        match found {
            Some(i) => matched[i] = true,
            None => {
                store.create_edge(REF_EDGE_CLASS, vertex_id, to, key.encode())?;
            }
        }
    }

    for (i, edge) in existing.iter().enumerate() {
        if matched[i] {
            continue;
        }
        store.delete_edge(edge.id)?;
        if let Some(target) = store.read_vertex(edge.to)? {
            if store.is_subclass_of(&target.class, PROXY_CLASS)
                && store.in_edges(edge.to)?.is_empty()
            {
                debug!(proxy = edge.to, "garbage-collecting orphaned proxy vertex");
                store.delete_vertex(edge.to)?;
            }
        }
    }
    Ok(())
}

/// Resolves a reference target to the vertex its edge must point at.
/// Targets inside the entry use the in-progress sibling vertices; external
/// targets use the addressed vertex when it exists, else a proxy vertex
/// keyed by the normalized address.
fn resolve_target(
    store: &mut dyn StoreSession,
    target: &RefTarget,
    sibling_ids: &[VertexId],
) -> Result<(VertexId, FragmentPath)> {
    match target {
        RefTarget::Local(fragment) => {
            let id = sibling_ids.get(fragment.entry).copied().ok_or_else(|| {
                PersistError::InvalidArgument(format!(
                    "local reference to missing content {}",
                    fragment.entry
                ))
            })?;
            Ok((id, fragment.path.clone()))
        }
        RefTarget::Proxy { address, .. } => {
            let root = address.target_root()?;
            let path = address
                .fragment
                .as_ref()
                .map(|f| f.path.clone())
                .unwrap_or_default();
            if store.read_vertex(root)?.is_some() {
                return Ok((root, path));
            }
            let value = PropValue::Str(address.normalized().to_string());
            let id = match store
                .find_vertices(PROXY_CLASS, PROXY_ADDRESS, &value)?
                .first()
            {
                Some(&id) => id,
                None => {
                    let mut doc = Document::new(PROXY_CLASS);
                    doc.set(PROXY_ADDRESS, value);
                    store.create_vertex(PROXY_CLASS, doc)?.id
                }
            };
            Ok((id, path))
        }
    }
}
