//! Transport contract
//!
//! [`DatabaseCommands`] is everything the session, query and HiLo layers
//! need from the server. It is object-safe and shared across threads; a
//! remote HTTP client and the embedded server both implement it.

use std::sync::Arc;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::commands::{BatchResult, CommandData, MultiLoadResult, PutResult};
use crate::document::JsonDocument;
use crate::error::DocStoreResult;
use crate::etag::Etag;
use crate::metadata::Metadata;
use crate::multiget::{GetRequest, GetResponse};
use crate::query::{IndexQuery, QueryResult};

/// Operations against one database
pub trait DatabaseCommands: Send + Sync {
    /// Fetch one document; `Ok(None)` when missing
    ///
    /// Fails with `DocumentConflict` when the document has conflicting
    /// replicated versions.
    fn get(&self, key: &str) -> DocStoreResult<Option<JsonDocument>>;

    /// Fetch several documents in one round trip
    ///
    /// Results are aligned with `keys`. Documents referenced by the
    /// `includes` paths of the results are returned alongside.
    fn get_many(&self, keys: &[String], includes: &[String]) -> DocStoreResult<MultiLoadResult>;

    /// Store one document
    ///
    /// `etag` of `None` skips the concurrency check; [`Etag::empty`] requires
    /// that the document does not exist yet. Fails with
    /// `ConcurrencyConflict` on mismatch.
    fn put(
        &self,
        key: &str,
        etag: Option<Etag>,
        data: Map<String, Value>,
        metadata: Metadata,
    ) -> DocStoreResult<PutResult>;

    /// Apply a write batch atomically; one result per command, in order
    fn batch(&self, commands: &[CommandData]) -> DocStoreResult<Vec<BatchResult>>;

    /// Query an index
    fn query(
        &self,
        index: &str,
        query: &IndexQuery,
        includes: &[String],
    ) -> DocStoreResult<QueryResult>;

    /// Execute several GET-like requests in one round trip
    fn multi_get(&self, requests: &[GetRequest]) -> DocStoreResult<Vec<GetResponse>>;

    /// Handle scoped to `database`, tagging requests with `session_id`
    fn for_session(&self, database: &str, session_id: Uuid) -> Arc<dyn DatabaseCommands>;

    /// Route reads to the primary node instead of a replica
    fn set_read_from_master(&self, _enabled: bool) {}
}

/// Forces primary reads until dropped
///
/// ```ignore
/// let _scope = MasterReadScope::new(commands.as_ref());
/// let ledger = commands.get("Raven/Hilo/users")?;
/// ```
pub struct MasterReadScope<'a> {
    commands: &'a dyn DatabaseCommands,
}

impl<'a> MasterReadScope<'a> {
    /// Enable primary reads on `commands`
    pub fn new(commands: &'a dyn DatabaseCommands) -> Self {
        commands.set_read_from_master(true);
        MasterReadScope { commands }
    }
}

impl Drop for MasterReadScope<'_> {
    fn drop(&mut self) {
        self.commands.set_read_from_master(false);
    }
}
