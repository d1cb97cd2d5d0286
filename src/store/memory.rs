//! In-memory reference backend.
//!
//! State lives behind a shared lock so every session opened from one
//! [`MemoryStore`] observes the same graph — which is exactly what the
//! optimistic-concurrency checks need to be exercised against. Unique
//! index enforcement and property lookups scan the class extent; this
//! backend favors obviousness over throughput.
//!
//! Query text is interpreted only here, never by the engine. The format
//! is `<Class>` (class-polymorphic scan) optionally followed by
//! `where <property> = $<param>` with a positional (`$0`) or named
//! (`$name`) parameter.

use crate::error::{PersistError, Result};
use crate::model::{Document, EdgeId, EdgeRecord, PropValue, VertexId, VertexRecord};
use crate::store::{
    IndexKind, IndexSpec, QueryParams, StorageType, StoreConnector, StoreSchema, StoreSession,
};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
struct PropertyRec {
    #[allow(dead_code)]
    storage: StorageType,
    #[allow(dead_code)]
    linked_class: Option<String>,
}

#[derive(Debug, Default)]
struct SchemaClassRec {
    is_abstract: bool,
    is_edge: bool,
    supers: Vec<String>,
    properties: FxHashMap<String, PropertyRec>,
    indexes: FxHashMap<String, IndexSpec>,
}

#[derive(Default)]
struct StoreState {
    classes: BTreeMap<String, SchemaClassRec>,
    vertices: BTreeMap<VertexId, VertexRecord>,
    edges: BTreeMap<EdgeId, EdgeRecord>,
    class_index: FxHashMap<String, BTreeSet<VertexId>>,
    out_adjacency: FxHashMap<VertexId, Vec<EdgeId>>,
    in_adjacency: FxHashMap<VertexId, Vec<EdgeId>>,
    next_vertex_id: VertexId,
    next_edge_id: EdgeId,
}

impl StoreState {
    fn class_rec(&self, name: &str) -> Result<&SchemaClassRec> {
        self.classes
            .get(name)
            .ok_or_else(|| PersistError::Schema(format!("unknown schema class {name}")))
    }

    fn is_subclass_of(&self, class: &str, ancestor: &str) -> bool {
        if class == ancestor {
            return true;
        }
        let Some(rec) = self.classes.get(class) else {
            return false;
        };
        rec.supers
            .iter()
            .any(|s| self.is_subclass_of(s, ancestor))
    }

    /// Ids of every vertex whose class is `class` or a subclass of it.
    fn extent(&self, class: &str) -> Vec<VertexId> {
        let mut ids = Vec::new();
        for (name, set) in self.class_index.iter() {
            if self.is_subclass_of(name, class) {
                ids.extend(set.iter().copied());
            }
        }
        ids.sort_unstable();
        ids
    }

    /// Unique indexes applicable to a vertex of `class`, walking the
    /// class and all its ancestors.
    fn unique_indexes_for(&self, class: &str) -> Vec<(String, IndexSpec)> {
        let mut found = Vec::new();
        let mut pending = vec![class.to_string()];
        let mut seen = BTreeSet::new();
        while let Some(name) = pending.pop() {
            if !seen.insert(name.clone()) {
                continue;
            }
            if let Some(rec) = self.classes.get(&name) {
                for spec in rec.indexes.values() {
                    if spec.kind == IndexKind::Unique {
                        found.push((name.clone(), spec.clone()));
                    }
                }
                pending.extend(rec.supers.iter().cloned());
            }
        }
        found
    }

    fn check_unique(&self, class: &str, doc: &Document, exclude: Option<VertexId>) -> Result<()> {
        for (owner, spec) in self.unique_indexes_for(class) {
            let field = &spec.fields[0];
            let Some(value) = doc.get(field) else {
                continue;
            };
            for id in self.extent(&owner) {
                if Some(id) == exclude {
                    continue;
                }
                let other = &self.vertices[&id];
                if other.doc.get(field) == Some(value) {
                    return Err(PersistError::InvalidArgument(format!(
                        "unique index {} rejects duplicate value for {field}",
                        spec.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn edges_of(&self, adjacency: &FxHashMap<VertexId, Vec<EdgeId>>, id: VertexId) -> Vec<EdgeRecord> {
        adjacency
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|eid| self.edges.get(eid))
            .cloned()
            .collect()
    }
}

/// Shared-state in-memory store; cheap to clone, every clone and every
/// session sees the same graph.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: total number of vertices.
    pub fn vertex_count(&self) -> usize {
        self.state.read().vertices.len()
    }

    /// Test hook: total number of edges.
    pub fn edge_count(&self) -> usize {
        self.state.read().edges.len()
    }

    /// Test hook: number of vertices whose exact class is `class`.
    pub fn vertex_count_of(&self, class: &str) -> usize {
        self.state
            .read()
            .class_index
            .get(class)
            .map_or(0, BTreeSet::len)
    }
}

impl StoreConnector for MemoryStore {
    fn open_session(&self) -> Result<Box<dyn StoreSession>> {
        Ok(Box::new(MemorySession {
            state: self.state.clone(),
        }))
    }
}

/// One unit-of-work handle onto a [`MemoryStore`].
pub struct MemorySession {
    state: Arc<RwLock<StoreState>>,
}

impl StoreSchema for MemorySession {
    fn has_class(&self, name: &str) -> bool {
        self.state.read().classes.contains_key(name)
    }

    fn ensure_vertex_class(&mut self, name: &str, is_abstract: bool) -> Result<()> {
        let mut state = self.state.write();
        if !state.classes.contains_key(name) {
            debug!(class = name, is_abstract, "creating vertex class");
            state.classes.insert(
                name.to_string(),
                SchemaClassRec {
                    is_abstract,
                    ..SchemaClassRec::default()
                },
            );
        }
        Ok(())
    }

    fn ensure_edge_class(&mut self, name: &str) -> Result<()> {
        let mut state = self.state.write();
        if !state.classes.contains_key(name) {
            debug!(class = name, "creating edge class");
            state.classes.insert(
                name.to_string(),
                SchemaClassRec {
                    is_edge: true,
                    ..SchemaClassRec::default()
                },
            );
        }
        Ok(())
    }

    fn ensure_superclass(&mut self, class: &str, superclass: &str) -> Result<()> {
        let mut state = self.state.write();
        state.class_rec(superclass)?;
        let rec = state
            .classes
            .get_mut(class)
            .ok_or_else(|| PersistError::Schema(format!("unknown schema class {class}")))?;
        if !rec.supers.iter().any(|s| s == superclass) {
            rec.supers.push(superclass.to_string());
        }
        Ok(())
    }

    fn is_subclass_of(&self, class: &str, ancestor: &str) -> bool {
        self.state.read().is_subclass_of(class, ancestor)
    }

    fn has_property(&self, class: &str, property: &str) -> bool {
        self.state
            .read()
            .classes
            .get(class)
            .is_some_and(|rec| rec.properties.contains_key(property))
    }

    fn ensure_property(
        &mut self,
        class: &str,
        property: &str,
        storage: StorageType,
        linked_class: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.write();
        let rec = state
            .classes
            .get_mut(class)
            .ok_or_else(|| PersistError::Schema(format!("unknown schema class {class}")))?;
        rec.properties.entry(property.to_string()).or_insert_with(|| PropertyRec {
            storage,
            linked_class: linked_class.map(str::to_string),
        });
        Ok(())
    }

    fn has_index(&self, class: &str, name: &str) -> bool {
        self.state
            .read()
            .classes
            .get(class)
            .is_some_and(|rec| rec.indexes.contains_key(name))
    }

    fn ensure_index(&mut self, class: &str, spec: IndexSpec) -> Result<()> {
        if matches!(spec.kind, IndexKind::FullText | IndexKind::Spatial)
            && spec.analyzer.is_none()
        {
            return Err(PersistError::InvalidArgument(format!(
                "index {} requires an analyzer configuration",
                spec.name
            )));
        }
        if spec.fields.is_empty() {
            return Err(PersistError::InvalidArgument(format!(
                "index {} has no fields",
                spec.name
            )));
        }
        let mut state = self.state.write();
        let rec = state
            .classes
            .get_mut(class)
            .ok_or_else(|| PersistError::Schema(format!("unknown schema class {class}")))?;
        rec.indexes.entry(spec.name.clone()).or_insert(spec);
        Ok(())
    }
}

impl StoreSession for MemorySession {
    fn create_vertex(&mut self, class: &str, doc: Document) -> Result<VertexRecord> {
        let mut state = self.state.write();
        let rec = state.class_rec(class)?;
        if rec.is_edge {
            return Err(PersistError::InvalidArgument(format!(
                "{class} is an edge class"
            )));
        }
        if rec.is_abstract {
            return Err(PersistError::InvalidArgument(format!(
                "class {class} is abstract and not instantiable"
            )));
        }
        state.check_unique(class, &doc, None)?;
        state.next_vertex_id += 1;
        let id = state.next_vertex_id;
        let record = VertexRecord {
            id,
            class: class.to_string(),
            version: 1,
            doc,
        };
        state.vertices.insert(id, record.clone());
        state
            .class_index
            .entry(class.to_string())
            .or_default()
            .insert(id);
        debug!(id, class, "created vertex");
        Ok(record)
    }

    fn read_vertex(&self, id: VertexId) -> Result<Option<VertexRecord>> {
        Ok(self.state.read().vertices.get(&id).cloned())
    }

    fn update_vertex(
        &mut self,
        id: VertexId,
        doc: Document,
        expected_version: u64,
    ) -> Result<VertexRecord> {
        let mut state = self.state.write();
        let (class, stored) = match state.vertices.get(&id) {
            Some(rec) => (rec.class.clone(), rec.version),
            None => {
                return Err(PersistError::Corruption(format!(
                    "update of missing vertex {id}"
                )))
            }
        };
        if stored != expected_version {
            return Err(PersistError::Concurrency {
                stored,
                captured: expected_version,
            });
        }
        state.check_unique(&class, &doc, Some(id))?;
        let rec = state.vertices.get_mut(&id).expect("vertex checked above");
        rec.version += 1;
        rec.doc = doc;
        Ok(rec.clone())
    }

    fn delete_vertex(&mut self, id: VertexId) -> Result<()> {
        let mut state = self.state.write();
        let has_edges = state.out_adjacency.get(&id).is_some_and(|e| !e.is_empty())
            || state.in_adjacency.get(&id).is_some_and(|e| !e.is_empty());
        if has_edges {
            return Err(PersistError::InvalidArgument(format!(
                "vertex {id} still has incident edges"
            )));
        }
        let Some(rec) = state.vertices.remove(&id) else {
            return Err(PersistError::Corruption(format!(
                "delete of missing vertex {id}"
            )));
        };
        if let Some(set) = state.class_index.get_mut(&rec.class) {
            set.remove(&id);
        }
        state.out_adjacency.remove(&id);
        state.in_adjacency.remove(&id);
        debug!(id, class = %rec.class, "deleted vertex");
        Ok(())
    }

    fn create_edge(
        &mut self,
        class: &str,
        from: VertexId,
        to: VertexId,
        props: BTreeMap<String, PropValue>,
    ) -> Result<EdgeId> {
        let mut state = self.state.write();
        if !state.class_rec(class)?.is_edge {
            return Err(PersistError::InvalidArgument(format!(
                "{class} is not an edge class"
            )));
        }
        if !state.vertices.contains_key(&from) || !state.vertices.contains_key(&to) {
            return Err(PersistError::InvalidArgument(format!(
                "edge endpoints {from}->{to} must exist"
            )));
        }
        state.next_edge_id += 1;
        let id = state.next_edge_id;
        state.edges.insert(
            id,
            EdgeRecord {
                id,
                class: class.to_string(),
                from,
                to,
                props,
            },
        );
        state.out_adjacency.entry(from).or_default().push(id);
        state.in_adjacency.entry(to).or_default().push(id);
        Ok(id)
    }

    fn delete_edge(&mut self, id: EdgeId) -> Result<()> {
        let mut state = self.state.write();
        let Some(edge) = state.edges.remove(&id) else {
            return Err(PersistError::Corruption(format!(
                "delete of missing edge {id}"
            )));
        };
        if let Some(out) = state.out_adjacency.get_mut(&edge.from) {
            out.retain(|eid| *eid != id);
        }
        if let Some(incoming) = state.in_adjacency.get_mut(&edge.to) {
            incoming.retain(|eid| *eid != id);
        }
        Ok(())
    }

    fn out_edges(&self, id: VertexId, class: &str) -> Result<Vec<EdgeRecord>> {
        let state = self.state.read();
        let mut edges: Vec<EdgeRecord> = state
            .edges_of(&state.out_adjacency, id)
            .into_iter()
            .filter(|e| e.class == class)
            .collect();
        edges.sort_by_key(|e| e.id);
        Ok(edges)
    }

    fn in_edges(&self, id: VertexId) -> Result<Vec<EdgeRecord>> {
        let state = self.state.read();
        let mut edges = state.edges_of(&state.in_adjacency, id);
        edges.sort_by_key(|e| e.id);
        Ok(edges)
    }

    fn find_vertices(
        &self,
        class: &str,
        property: &str,
        value: &PropValue,
    ) -> Result<Vec<VertexId>> {
        let state = self.state.read();
        state.class_rec(class)?;
        Ok(state
            .extent(class)
            .into_iter()
            .filter(|id| state.vertices[id].doc.get(property) == Some(value))
            .collect())
    }

    fn query(&self, text: &str, params: &QueryParams) -> Result<Vec<VertexId>> {
        let (class, filter) = parse_query(text)?;
        let state = self.state.read();
        state.class_rec(&class)?;
        let ids = state.extent(&class);
        match filter {
            None => Ok(ids),
            Some((property, param)) => {
                let value = resolve_param(&param, params)?;
                Ok(ids
                    .into_iter()
                    .filter(|id| state.vertices[id].doc.get(&property) == Some(&value))
                    .collect())
            }
        }
    }
}

/// Parses `<Class>` or `<Class> where <prop> = $<param>`.
fn parse_query(text: &str) -> Result<(String, Option<(String, String)>)> {
    let bad = || PersistError::InvalidArgument(format!("malformed query `{text}`"));
    let mut parts = text.split_whitespace();
    let class = parts.next().ok_or_else(bad)?.to_string();
    match parts.next() {
        None => Ok((class, None)),
        Some(kw) if kw.eq_ignore_ascii_case("where") => {
            let property = parts.next().ok_or_else(bad)?.to_string();
            if parts.next() != Some("=") {
                return Err(bad());
            }
            let param = parts
                .next()
                .and_then(|p| p.strip_prefix('$'))
                .ok_or_else(bad)?
                .to_string();
            if parts.next().is_some() {
                return Err(bad());
            }
            Ok((class, Some((property, param))))
        }
        Some(_) => Err(bad()),
    }
}

fn resolve_param(key: &str, params: &QueryParams) -> Result<PropValue> {
    let missing = || PersistError::InvalidArgument(format!("missing query parameter ${key}"));
    match params {
        QueryParams::None => Err(missing()),
        QueryParams::Positional(values) => key
            .parse::<usize>()
            .ok()
            .and_then(|i| values.get(i).cloned())
            .ok_or_else(missing),
        QueryParams::Named(map) => map.get(key).cloned().ok_or_else(missing),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with_classes() -> (MemoryStore, Box<dyn StoreSession>) {
        let store = MemoryStore::new();
        let mut session = store.open_session().unwrap();
        session.ensure_vertex_class("Base", true).unwrap();
        session.ensure_vertex_class("Thing", false).unwrap();
        session.ensure_superclass("Thing", "Base").unwrap();
        (store, session)
    }

    #[test]
    fn schema_upserts_are_idempotent() {
        let (_store, mut session) = session_with_classes();
        session.ensure_vertex_class("Thing", false).unwrap();
        session.ensure_superclass("Thing", "Base").unwrap();
        session
            .ensure_property("Thing", "name", StorageType::String, None)
            .unwrap();
        session
            .ensure_property("Thing", "name", StorageType::String, None)
            .unwrap();
        assert!(session.has_property("Thing", "name"));
        assert!(session.is_subclass_of("Thing", "Base"));
        assert!(!session.is_subclass_of("Base", "Thing"));
    }

    #[test]
    fn abstract_classes_are_not_instantiable() {
        let (_store, mut session) = session_with_classes();
        let err = session
            .create_vertex("Base", Document::new("Base"))
            .unwrap_err();
        assert!(matches!(err, PersistError::InvalidArgument(_)));
    }

    #[test]
    fn versions_start_at_one_and_bump_by_one() {
        let (_store, mut session) = session_with_classes();
        let rec = session
            .create_vertex("Thing", Document::new("Thing"))
            .unwrap();
        assert_eq!(rec.version, 1);
        let rec = session
            .update_vertex(rec.id, Document::new("Thing"), 1)
            .unwrap();
        assert_eq!(rec.version, 2);
        let err = session
            .update_vertex(rec.id, Document::new("Thing"), 1)
            .unwrap_err();
        assert!(err.is_concurrency());
    }

    #[test]
    fn unique_index_rejects_duplicates() {
        let (_store, mut session) = session_with_classes();
        session
            .ensure_property("Thing", "name", StorageType::String, None)
            .unwrap();
        session
            .ensure_index(
                "Thing",
                IndexSpec {
                    name: "Thing_name_pk".into(),
                    kind: IndexKind::Unique,
                    fields: vec!["name".into()],
                    analyzer: None,
                },
            )
            .unwrap();
        let mut doc = Document::new("Thing");
        doc.set("name", PropValue::str("a"));
        session.create_vertex("Thing", doc.clone()).unwrap();
        let err = session.create_vertex("Thing", doc).unwrap_err();
        assert!(matches!(err, PersistError::InvalidArgument(_)));
    }

    #[test]
    fn query_scans_are_polymorphic_and_parameterized() {
        let (_store, mut session) = session_with_classes();
        session.ensure_vertex_class("Other", false).unwrap();
        let mut doc = Document::new("Thing");
        doc.set("n", PropValue::Int(7));
        let a = session.create_vertex("Thing", doc).unwrap();
        session
            .create_vertex("Thing", Document::new("Thing"))
            .unwrap();
        session
            .create_vertex("Other", Document::new("Other"))
            .unwrap();

        assert_eq!(session.query("Base", &QueryParams::None).unwrap().len(), 2);
        let hits = session
            .query(
                "Thing where n = $0",
                &QueryParams::positional([PropValue::Int(7)]),
            )
            .unwrap();
        assert_eq!(hits, vec![a.id]);
        let hits = session
            .query(
                "Thing where n = $n",
                &QueryParams::named([("n".to_string(), PropValue::Int(7))]),
            )
            .unwrap();
        assert_eq!(hits, vec![a.id]);
        assert!(session.query("Thing where", &QueryParams::None).is_err());
    }

    #[test]
    fn edges_maintain_adjacency() {
        let (_store, mut session) = session_with_classes();
        session.ensure_edge_class("Link").unwrap();
        let a = session
            .create_vertex("Thing", Document::new("Thing"))
            .unwrap();
        let b = session
            .create_vertex("Thing", Document::new("Thing"))
            .unwrap();
        let e = session
            .create_edge("Link", a.id, b.id, BTreeMap::new())
            .unwrap();
        assert_eq!(session.out_edges(a.id, "Link").unwrap().len(), 1);
        assert_eq!(session.in_edges(b.id).unwrap().len(), 1);
        let err = session.delete_vertex(b.id).unwrap_err();
        assert!(matches!(err, PersistError::InvalidArgument(_)));
        session.delete_edge(e).unwrap();
        assert!(session.in_edges(b.id).unwrap().is_empty());
        session.delete_vertex(b.id).unwrap();
    }
}
