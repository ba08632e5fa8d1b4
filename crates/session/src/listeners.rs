//! Save listeners
//!
//! Listeners registered on a [`DocumentStore`](crate::DocumentStore) see
//! every write its sessions send. Store listeners run once per put, just
//! before the batch leaves the session, and may rewrite the outgoing body
//! and metadata. Delete listeners run for deletes of tracked entities.
//! Deletes issued by key through
//! [`delete_by_key`](crate::DocumentSession::delete_by_key) or
//! [`defer`](crate::DocumentSession::defer) bypass them.
//!
//! An error from a listener aborts the save before anything is sent.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};

use docstore_core::{DocStoreResult, Metadata};

/// Hook around puts
pub trait DocumentStoreListener: Send + Sync {
    /// Called before `key` is written; `original` is the body as last
    /// acknowledged, empty for new documents
    fn before_store(
        &self,
        key: &str,
        document: &mut Map<String, Value>,
        metadata: &mut Metadata,
        original: &Map<String, Value>,
    ) -> DocStoreResult<()>;

    /// Called once the server acknowledged the put of `key`
    fn after_store(&self, _key: &str, _metadata: &Metadata) {}
}

/// Hook before deletes of tracked entities
pub trait DocumentDeleteListener: Send + Sync {
    /// Called before `key` is deleted
    fn before_delete(&self, key: &str, metadata: &Metadata) -> DocStoreResult<()>;
}

/// Listeners registered on one store
#[derive(Default)]
pub(crate) struct Listeners {
    store: RwLock<Vec<Arc<dyn DocumentStoreListener>>>,
    delete: RwLock<Vec<Arc<dyn DocumentDeleteListener>>>,
}

impl Listeners {
    pub fn add_store(&self, listener: Arc<dyn DocumentStoreListener>) {
        self.store.write().push(listener);
    }

    pub fn add_delete(&self, listener: Arc<dyn DocumentDeleteListener>) {
        self.delete.write().push(listener);
    }

    pub fn store_listeners(&self) -> Vec<Arc<dyn DocumentStoreListener>> {
        self.store.read().clone()
    }

    pub fn delete_listeners(&self) -> Vec<Arc<dyn DocumentDeleteListener>> {
        self.delete.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty() && self.delete.read().is_empty()
    }
}
