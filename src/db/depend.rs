//! Dependency analysis over inbound reference edges.
//!
//! Decides whether a delete or overwrite is safe. Self-references are
//! always permitted. Violations name every blocking edge, not just the
//! first one found.

use crate::db::RefEdgeData;
use crate::error::Result;
use crate::instance::Instance;
use crate::model::{EdgeRecord, VertexRecord};
use crate::store::StoreSession;

/// Human label for a stored vertex: `Class(id)`.
pub(crate) fn element_label(record: &VertexRecord) -> String {
    format!("{}({})", record.class, record.id)
}

fn edge_label(store: &dyn StoreSession, edge: &EdgeRecord, data: &RefEdgeData) -> String {
    let owner = match store.read_vertex(edge.from) {
        Ok(Some(rec)) => element_label(&rec),
        _ => format!("?({})", edge.from),
    };
    format!(
        "{owner}{}.{}->{}({})",
        data.from_fragment, data.feature, data.declared_class, data.to_fragment
    )
}

/// Every inbound reference that blocks deleting this vertex: any edge
/// whose source is another vertex.
pub(crate) fn blocking_for_delete(
    store: &dyn StoreSession,
    vertex: &VertexRecord,
) -> Result<Vec<String>> {
    let mut blockers = Vec::new();
    for edge in store.in_edges(vertex.id)? {
        if edge.from == vertex.id {
            continue;
        }
        let data = RefEdgeData::decode(&edge)?;
        blockers.push(edge_label(store, &edge, &data));
    }
    Ok(blockers)
}

/// Every inbound reference the replacement tree would break: an edge
/// blocks only when its recorded target fragment no longer resolves to
/// an object of the recorded declared class. Edges that still resolve
/// are not blocking even though the owning object changed.
pub(crate) fn blocking_for_overwrite(
    store: &dyn StoreSession,
    vertex: &VertexRecord,
    replacement: &Instance,
) -> Result<Vec<String>> {
    let mut blockers = Vec::new();
    for edge in store.in_edges(vertex.id)? {
        if edge.from == vertex.id {
            continue;
        }
        let data = RefEdgeData::decode(&edge)?;
        let target = if data.to_fragment.is_root() {
            Some(replacement)
        } else {
            replacement.navigate(&data.to_fragment)
        };
        let broken = match target {
            None => true,
            Some(instance) => instance.class != data.declared_class,
        };
        if broken {
            blockers.push(edge_label(store, &edge, &data));
        }
    }
    Ok(blockers)
}
