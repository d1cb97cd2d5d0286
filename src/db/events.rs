//! Lifecycle notifications dispatched around store operations.
//!
//! Listeners run synchronously, in registration order. A failing
//! before-* listener aborts the enclosing operation before any mutation;
//! failures in after-* listeners are reported in the log without undoing
//! the already-committed mutation.

use crate::error::{PersistError, Result};
use crate::instance::RootEntry;
use parking_lot::RwLock;
use tracing::warn;

pub type SaveListener = Box<dyn Fn(&RootEntry, &RootEntry) -> Result<()> + Send + Sync>;
pub type EntryListener = Box<dyn Fn(&RootEntry) -> Result<()> + Send + Sync>;

/// Ordered listener registry shared by every session of a
/// [`crate::db::ModelStore`].
#[derive(Default)]
pub struct Events {
    before_save: RwLock<Vec<SaveListener>>,
    after_save: RwLock<Vec<SaveListener>>,
    before_delete: RwLock<Vec<EntryListener>>,
    after_load: RwLock<Vec<EntryListener>>,
}

impl Events {
    /// Registers a listener receiving the old and new snapshots before
    /// any save mutation. An error aborts the save.
    pub fn on_before_save(
        &self,
        listener: impl Fn(&RootEntry, &RootEntry) -> Result<()> + Send + Sync + 'static,
    ) {
        self.before_save.write().push(Box::new(listener));
    }

    pub fn on_after_save(
        &self,
        listener: impl Fn(&RootEntry, &RootEntry) -> Result<()> + Send + Sync + 'static,
    ) {
        self.after_save.write().push(Box::new(listener));
    }

    /// Registers a listener receiving the hydrated entry before its
    /// deletion. An error aborts the delete.
    pub fn on_before_delete(
        &self,
        listener: impl Fn(&RootEntry) -> Result<()> + Send + Sync + 'static,
    ) {
        self.before_delete.write().push(Box::new(listener));
    }

    pub fn on_after_load(
        &self,
        listener: impl Fn(&RootEntry) -> Result<()> + Send + Sync + 'static,
    ) {
        self.after_load.write().push(Box::new(listener));
    }

    pub(crate) fn fire_before_save(&self, old: &RootEntry, new: &RootEntry) -> Result<()> {
        for listener in self.before_save.read().iter() {
            listener(old, new).map_err(|e| hook_error("before_save", e))?;
        }
        Ok(())
    }

    pub(crate) fn fire_after_save(&self, old: &RootEntry, new: &RootEntry) {
        for listener in self.after_save.read().iter() {
            if let Err(e) = listener(old, new) {
                warn!(error = %e, "after_save listener failed");
            }
        }
    }

    pub(crate) fn fire_before_delete(&self, entry: &RootEntry) -> Result<()> {
        for listener in self.before_delete.read().iter() {
            listener(entry).map_err(|e| hook_error("before_delete", e))?;
        }
        Ok(())
    }

    pub(crate) fn fire_after_load(&self, entry: &RootEntry) {
        for listener in self.after_load.read().iter() {
            if let Err(e) = listener(entry) {
                warn!(error = %e, "after_load listener failed");
            }
        }
    }
}

fn hook_error(hook: &'static str, source: PersistError) -> PersistError {
    PersistError::Hook {
        hook,
        message: source.to_string(),
    }
}
