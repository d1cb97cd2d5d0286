//! Persistence facade: [`ModelStore`] owns the connector, metamodel and
//! hook registry; a [`Session`] is one unit of work with its own store
//! session, released when dropped.

mod depend;
mod events;
mod load;
mod save;
mod schema;

pub use events::Events;
pub use schema::{PROXY_CLASS, REF_EDGE_CLASS, ROOT_CLASS};

use crate::address::{Address, FragmentPath};
use crate::error::{PersistError, Result};
use crate::instance::{Instance, RefTarget, RootEntry};
use crate::meta::Metamodel;
use crate::model::{EdgeRecord, PropValue, VertexId};
use crate::store::{QueryParams, StoreConnector, StoreSession};
use rustc_hash::FxHashSet;
use schema::{
    EDGE_DECLARED_CLASS, EDGE_FEATURE, EDGE_FROM_FRAGMENT, EDGE_INDEX, EDGE_TO_FRAGMENT,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Engine entry point. Cheap to share; every operation runs through a
/// [`Session`] scoped to the calling unit of work.
pub struct ModelStore {
    connector: Arc<dyn StoreConnector>,
    metamodel: Arc<Metamodel>,
    events: Arc<Events>,
}

impl ModelStore {
    pub fn new(connector: Arc<dyn StoreConnector>, metamodel: Metamodel) -> Self {
        Self {
            connector,
            metamodel: Arc::new(metamodel),
            events: Arc::new(Events::default()),
        }
    }

    pub fn metamodel(&self) -> &Metamodel {
        &self.metamodel
    }

    /// Hook registry shared by every session.
    pub fn events(&self) -> &Events {
        &self.events
    }

    /// Synchronizes the store schema with the metamodel. Idempotent;
    /// meant to run on every process start and safe to race.
    pub fn ensure_schema(&self) -> Result<()> {
        let mut session = self.connector.open_session()?;
        schema::ensure_schema(&self.metamodel, session.as_mut())?;
        debug!("schema synchronized");
        Ok(())
    }

    /// Acquires a fresh store session bound to one unit of work.
    pub fn session(&self) -> Result<Session> {
        Ok(Session {
            store: self.connector.open_session()?,
            metamodel: self.metamodel.clone(),
            events: self.events.clone(),
        })
    }
}

/// One unit of work against the store. Reads take `&self`, mutations
/// `&mut self`; the underlying store session is released on drop, on
/// every exit path.
pub struct Session {
    store: Box<dyn StoreSession>,
    metamodel: Arc<Metamodel>,
    events: Arc<Events>,
}

impl Session {
    /// Persists a root entry: validates version and dependency state for
    /// every top-level instance, then mutates, then assigns the entry's
    /// new address. No automatic retry — a
    /// [`Concurrency`](PersistError::Concurrency) failure means re-read
    /// and try again.
    pub fn save(&mut self, entry: &mut RootEntry) -> Result<()> {
        save::save_entry(self.store.as_mut(), &self.metamodel, &self.events, entry)
    }

    /// Loads a root entry. The version numbers carried by the address are
    /// ignored; the returned entry captures the currently stored ones.
    pub fn load(&self, address: &Address) -> Result<RootEntry> {
        load::load_entry(self.store.as_ref(), &self.metamodel, &self.events, address)
    }

    /// Deletes a root entry after version and dependency checks.
    pub fn delete(&mut self, address: &Address) -> Result<()> {
        save::delete_entry(self.store.as_mut(), &self.metamodel, &self.events, address)
    }

    /// Runs an opaque store query. Results hydrate lazily, one root entry
    /// per matching vertex; abandoning the iterator early is free.
    pub fn query(&self, text: &str, params: &QueryParams) -> Result<QueryResults<'_>> {
        let ids = self.store.query(text, params)?;
        Ok(QueryResults {
            session: self,
            pending: ids.into(),
        })
    }

    /// Everything holding a reference edge into any vertex of the given
    /// address, excluding the address's own vertices. Each distinct
    /// dependent hydrates exactly once.
    pub fn dependents_of(&self, address: &Address) -> Result<QueryResults<'_>> {
        let mut seen = FxHashSet::default();
        let mut ids = VecDeque::new();
        for &(id, _) in &address.roots {
            for edge in self.store.in_edges(id)? {
                let is_self = address.roots.iter().any(|&(root, _)| root == edge.from);
                if !is_self && seen.insert(edge.from) {
                    ids.push_back(edge.from);
                }
            }
        }
        Ok(QueryResults {
            session: self,
            pending: ids,
        })
    }

    /// Resolves an address to a single instance: the addressed top-level
    /// object or the sub-object its fragment names. This is how proxies
    /// resolve, lazily, at access time.
    pub fn resolve(&self, address: &Address) -> Result<Instance> {
        let entry = self.load(address)?;
        match &address.fragment {
            None => entry.contents.first().cloned().ok_or_else(|| {
                PersistError::AddressResolution(format!("address {address} has no contents"))
            }),
            Some(fragment) => entry.resolve(fragment).cloned().ok_or_else(|| {
                PersistError::AddressResolution(format!(
                    "fragment {fragment} not found at {address}"
                ))
            }),
        }
    }

    /// Resolves a reference target: local targets against the given
    /// entry, proxies through the store.
    pub fn resolve_target(&self, target: &RefTarget, entry: &RootEntry) -> Result<Instance> {
        match target {
            RefTarget::Local(fragment) => entry.resolve(fragment).cloned().ok_or_else(|| {
                PersistError::AddressResolution(format!(
                    "local fragment {fragment} not found in entry"
                ))
            }),
            RefTarget::Proxy { address, .. } => self.resolve(address),
        }
    }
}

/// Lazy, pull-based sequence of hydrated root entries. Each `next()`
/// materializes one result; dropping the iterator abandons the rest
/// without penalty.
pub struct QueryResults<'a> {
    session: &'a Session,
    pending: VecDeque<VertexId>,
}

impl Iterator for QueryResults<'_> {
    type Item = Result<RootEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.pending.pop_front()?;
        Some(load::load_entry(
            self.session.store.as_ref(),
            &self.session.metamodel,
            &self.session.events,
            &Address::for_vertex(id, 0),
        ))
    }
}

impl QueryResults<'_> {
    /// Number of results not yet materialized.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

/// Typed view of a reference edge's five properties.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RefEdgeData {
    pub from_fragment: FragmentPath,
    pub feature: String,
    pub to_fragment: FragmentPath,
    /// Position within a multi-valued feature; -1 when single-valued.
    pub index: i64,
    pub declared_class: String,
}

impl RefEdgeData {
    pub(crate) fn decode(edge: &EdgeRecord) -> Result<Self> {
        Ok(Self {
            from_fragment: edge_str(edge, EDGE_FROM_FRAGMENT)?.parse()?,
            feature: edge_str(edge, EDGE_FEATURE)?.to_string(),
            to_fragment: edge_str(edge, EDGE_TO_FRAGMENT)?.parse()?,
            index: edge
                .props
                .get(EDGE_INDEX)
                .and_then(PropValue::as_int)
                .ok_or_else(|| missing_edge_prop(edge.id, EDGE_INDEX))?,
            declared_class: edge_str(edge, EDGE_DECLARED_CLASS)?.to_string(),
        })
    }

    pub(crate) fn encode(&self) -> BTreeMap<String, PropValue> {
        BTreeMap::from([
            (
                EDGE_FROM_FRAGMENT.to_string(),
                PropValue::Str(self.from_fragment.to_string()),
            ),
            (EDGE_FEATURE.to_string(), PropValue::Str(self.feature.clone())),
            (
                EDGE_TO_FRAGMENT.to_string(),
                PropValue::Str(self.to_fragment.to_string()),
            ),
            (EDGE_INDEX.to_string(), PropValue::Int(self.index)),
            (
                EDGE_DECLARED_CLASS.to_string(),
                PropValue::Str(self.declared_class.clone()),
            ),
        ])
    }
}

fn edge_str<'a>(edge: &'a EdgeRecord, key: &str) -> Result<&'a str> {
    edge.props
        .get(key)
        .and_then(PropValue::as_str)
        .ok_or_else(|| missing_edge_prop(edge.id, key))
}

fn missing_edge_prop(edge: u64, key: &str) -> PersistError {
    PersistError::Corruption(format!("reference edge {edge} lacks property {key}"))
}
