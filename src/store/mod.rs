//! Boundary with the property-graph store.
//!
//! The engine never opens network listeners or manages the store process;
//! it consumes a [`StoreConnector`] that produces a fresh [`StoreSession`]
//! per unit of work. Schema manipulation goes through the session's
//! [`StoreSchema`] facet, whose operations are idempotent upserts — safe
//! to race from concurrent first-use callers.

pub mod memory;

use crate::error::Result;
use crate::model::{Document, EdgeId, EdgeRecord, PropValue, VertexId, VertexRecord};
use std::collections::BTreeMap;

/// Storage type of a schema property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Bool,
    Int,
    Float,
    String,
    Bytes,
    /// A single embedded document.
    Embedded,
    /// An ordered list (of scalars or embedded documents).
    EmbeddedList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Unique,
    Plain,
    FullText,
    Spatial,
}

/// A requested index. `FullText` and `Spatial` kinds must carry an
/// analyzer configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    pub name: String,
    pub kind: IndexKind,
    pub fields: Vec<String>,
    pub analyzer: Option<String>,
}

/// Positional or named parameters for an opaque store query.
#[derive(Debug, Clone, Default)]
pub enum QueryParams {
    #[default]
    None,
    Positional(Vec<PropValue>),
    Named(BTreeMap<String, PropValue>),
}

impl QueryParams {
    pub fn positional(values: impl IntoIterator<Item = PropValue>) -> Self {
        QueryParams::Positional(values.into_iter().collect())
    }

    pub fn named(pairs: impl IntoIterator<Item = (String, PropValue)>) -> Self {
        QueryParams::Named(pairs.into_iter().collect())
    }
}

/// Live schema handle of a store. Every `ensure_*` operation is a no-op
/// when the target object already exists; "already exists" outcomes are
/// never errors.
pub trait StoreSchema {
    fn has_class(&self, name: &str) -> bool;

    fn ensure_vertex_class(&mut self, name: &str, is_abstract: bool) -> Result<()>;

    fn ensure_edge_class(&mut self, name: &str) -> Result<()>;

    /// Attaches `class` under `superclass`. Adds the link if absent,
    /// never removes one.
    fn ensure_superclass(&mut self, class: &str, superclass: &str) -> Result<()>;

    /// True when `class` equals `ancestor` or inherits from it.
    fn is_subclass_of(&self, class: &str, ancestor: &str) -> bool;

    fn has_property(&self, class: &str, property: &str) -> bool;

    fn ensure_property(
        &mut self,
        class: &str,
        property: &str,
        storage: StorageType,
        linked_class: Option<&str>,
    ) -> Result<()>;

    fn has_index(&self, class: &str, name: &str) -> bool;

    fn ensure_index(&mut self, class: &str, spec: IndexSpec) -> Result<()>;
}

/// A store session bound to one unit of work. Not safe for concurrent use
/// by multiple in-flight operations; independent sessions proceed in
/// parallel with no in-process locking.
pub trait StoreSession: StoreSchema {
    /// Creates a vertex with version 1. Abstract classes are not
    /// instantiable.
    fn create_vertex(&mut self, class: &str, doc: Document) -> Result<VertexRecord>;

    fn read_vertex(&self, id: VertexId) -> Result<Option<VertexRecord>>;

    /// Replaces the stored document and bumps the version by exactly one.
    /// Compare-on-write: fails with a concurrency error when the stored
    /// version no longer equals `expected_version`, without mutating.
    fn update_vertex(
        &mut self,
        id: VertexId,
        doc: Document,
        expected_version: u64,
    ) -> Result<VertexRecord>;

    /// Deletes a vertex. The caller removes incident edges first.
    fn delete_vertex(&mut self, id: VertexId) -> Result<()>;

    fn create_edge(
        &mut self,
        class: &str,
        from: VertexId,
        to: VertexId,
        props: BTreeMap<String, PropValue>,
    ) -> Result<EdgeId>;

    fn delete_edge(&mut self, id: EdgeId) -> Result<()>;

    /// Outgoing edges of the given edge class, in stable order.
    fn out_edges(&self, id: VertexId, class: &str) -> Result<Vec<EdgeRecord>>;

    /// All inbound edges, in stable order.
    fn in_edges(&self, id: VertexId) -> Result<Vec<EdgeRecord>>;

    /// Vertices of a class (or its subclasses) holding the given property
    /// value.
    fn find_vertices(
        &self,
        class: &str,
        property: &str,
        value: &PropValue,
    ) -> Result<Vec<VertexId>>;

    /// Executes an opaque query and returns matching vertex ids. The
    /// engine never interprets the text.
    fn query(&self, text: &str, params: &QueryParams) -> Result<Vec<VertexId>>;
}

/// Produces fresh sessions on demand. The engine's only handle on the
/// store.
pub trait StoreConnector: Send + Sync {
    fn open_session(&self) -> Result<Box<dyn StoreSession>>;
}
