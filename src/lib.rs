//! modelgraph persists instances of a user-defined metamodel into a
//! property-graph store and reconstructs typed object graphs from it.
//!
//! The engine performs a lossless, bidirectional transform between a
//! tree-with-cross-links object model and a property-graph storage model:
//! containment is embedded as nested documents, cross-references become
//! labeled edges, and every write runs optimistic version and referential
//! integrity checks before touching the store.
//!
//! The store itself stays behind the [`store::StoreConnector`] boundary;
//! [`store::memory::MemoryStore`] ships as the in-memory reference
//! backend. Register a [`meta::Metamodel`], run
//! [`db::ModelStore::ensure_schema`] on startup, then save, load, query
//! and delete [`instance::RootEntry`] values through per-unit-of-work
//! [`db::Session`]s.

#![forbid(unsafe_code)]

pub mod address;
pub mod db;
pub mod error;
pub mod instance;
pub mod logging;
pub mod meta;
pub mod model;
pub mod store;

pub use address::{Address, Fragment, FragmentPath, Step};
pub use db::{Events, ModelStore, QueryResults, Session, PROXY_CLASS, REF_EDGE_CLASS, ROOT_CLASS};
pub use error::{PersistError, Result};
pub use instance::{Instance, RefTarget, RootEntry, Slot, Value};
pub use meta::{Feature, FeatureKind, Metamodel, ModelClass, ValueType};
pub use model::{Document, EdgeId, EdgeRecord, PropValue, VertexId, VertexRecord};
pub use store::memory::MemoryStore;
pub use store::{IndexKind, IndexSpec, QueryParams, StorageType, StoreConnector, StoreSchema, StoreSession};
