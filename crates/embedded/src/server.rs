//! The embedded server and its `DatabaseCommands` handles

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use uuid::Uuid;

use docstore_core::metadata::{self, Metadata};
use docstore_core::{
    BatchResult, CommandData, DatabaseCommands, DocStoreError, DocStoreResult, Etag, GetRequest,
    GetResponse, IndexQuery, JsonDocument, MultiLoadResult, PutResult, QueryResult,
};

use crate::database::DatabaseState;
use crate::index::IndexDefinition;
use crate::requests::{RequestKind, RequestRecord};
use crate::routes;

struct ServerInner {
    databases: DashMap<String, Arc<Mutex<DatabaseState>>>,
    requests: Mutex<Vec<RequestRecord>>,
    failures: Mutex<Vec<(RequestKind, String)>>,
}

/// In-process document server
///
/// Cloning is cheap; clones share all databases and the request log.
#[derive(Clone)]
pub struct EmbeddedServer {
    inner: Arc<ServerInner>,
}

impl Default for EmbeddedServer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EmbeddedServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedServer")
            .field("databases", &self.inner.databases.len())
            .field("requests", &self.inner.requests.lock().len())
            .finish()
    }
}

fn object(value: Value) -> DocStoreResult<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(DocStoreError::invalid_input(format!(
            "expected a JSON object, got {}",
            other
        ))),
    }
}

impl EmbeddedServer {
    /// Server with no databases; databases are created on first use
    pub fn new() -> Self {
        EmbeddedServer {
            inner: Arc::new(ServerInner {
                databases: DashMap::new(),
                requests: Mutex::new(Vec::new()),
                failures: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Handle on `database` not bound to any session
    pub fn commands(&self, database: &str) -> Arc<dyn DatabaseCommands> {
        Arc::new(EmbeddedCommands {
            server: self.clone(),
            database: database.to_string(),
            session_id: None,
            read_from_master: AtomicBool::new(false),
        })
    }

    fn database(&self, name: &str) -> Arc<Mutex<DatabaseState>> {
        if let Some(db) = self.inner.databases.get(name) {
            return Arc::clone(db.value());
        }
        let entry = self
            .inner
            .databases
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(target: "docstore::embedded", database = name, "Creating database");
                Arc::new(Mutex::new(DatabaseState::default()))
            });
        Arc::clone(entry.value())
    }

    // =========================================================================
    // Administration (not recorded as requests)
    // =========================================================================

    /// Write a document directly
    pub fn seed(&self, database: &str, key: &str, data: Value, meta: Metadata) -> DocStoreResult<Etag> {
        let data = object(data)?;
        Ok(self.database(database).lock().put(key, None, data, meta)?.etag)
    }

    /// Read a document directly
    pub fn document(&self, database: &str, key: &str) -> Option<JsonDocument> {
        self.database(database)
            .lock()
            .find(key)
            .map(|doc| doc.to_document())
    }

    /// Number of stored documents, system documents included
    pub fn document_count(&self, database: &str) -> usize {
        self.database(database).lock().docs.len()
    }

    /// Etag of the latest write
    pub fn last_etag(&self, database: &str) -> Etag {
        self.database(database).lock().current_etag()
    }

    /// Set the `ServerPrefix` embedded into HiLo keys
    pub fn set_server_prefix(&self, database: &str, prefix: &str) -> DocStoreResult<()> {
        let mut data = Map::new();
        data.insert("ServerPrefix".to_string(), Value::String(prefix.to_string()));
        self.database(database).lock().put(
            "Raven/ServerPrefixForHilo",
            None,
            data,
            Metadata::new(),
        )?;
        Ok(())
    }

    /// Turn `key` into a conflict between `versions`; returns the conflict etag
    pub fn create_conflict(&self, database: &str, key: &str, versions: Vec<Value>) -> DocStoreResult<Etag> {
        let versions = versions
            .into_iter()
            .map(object)
            .collect::<DocStoreResult<Vec<_>>>()?;
        Ok(self.database(database).lock().create_conflict(key, versions))
    }

    /// Make reads of `key` fail with a read veto
    pub fn set_read_veto(&self, database: &str, key: &str, trigger: &str, reason: &str) {
        let db = self.database(database);
        let mut state = db.lock();
        let folded = key.to_lowercase();
        if let Some(doc) = state.docs.get_mut(&folded) {
            doc.metadata.insert(
                metadata::READ_VETO.to_string(),
                serde_json::json!({ "Trigger": trigger, "Reason": reason }),
            );
        }
    }

    /// The next `reads` reads of `key` report non-authoritative information
    pub fn set_non_authoritative(&self, database: &str, key: &str, reads: usize) {
        let db = self.database(database);
        let mut state = db.lock();
        if let Some(doc) = state.docs.get_mut(&key.to_lowercase()) {
            doc.non_authoritative_reads = reads;
        }
    }

    /// Report non-authoritative query hits on each document only, leaving
    /// the result-level flag unset
    pub fn report_non_authoritative_per_document(&self, database: &str, enabled: bool) {
        self.database(database)
            .lock()
            .index
            .per_document_non_authoritative = enabled;
    }

    /// Register a named index
    pub fn define_index(&self, database: &str, name: &str, definition: IndexDefinition) {
        self.database(database)
            .lock()
            .index
            .definitions
            .insert(name.to_string(), definition);
    }

    /// Stop indexing; queries see only documents written so far
    pub fn pause_indexing(&self, database: &str) {
        self.database(database).lock().index.paused = true;
    }

    /// Catch up and keep indexing
    pub fn resume_indexing(&self, database: &str) {
        let db = self.database(database);
        let mut state = db.lock();
        let current = state.current_etag();
        state.index.resume(current);
    }

    /// The next `count` queries report stale results
    pub fn force_stale_queries(&self, database: &str, count: usize) {
        self.database(database).lock().index.forced_stale_queries = count;
    }

    /// Fail the next request of `kind` with a transport error
    pub fn fail_next(&self, kind: RequestKind, message: &str) {
        self.inner.failures.lock().push((kind, message.to_string()));
    }

    // =========================================================================
    // Request log
    // =========================================================================

    /// All recorded requests, oldest first
    pub fn requests(&self) -> Vec<RequestRecord> {
        self.inner.requests.lock().clone()
    }

    /// Number of recorded requests
    pub fn request_count(&self) -> usize {
        self.inner.requests.lock().len()
    }

    /// Number of recorded requests of `kind`
    pub fn count_requests(&self, kind: RequestKind) -> usize {
        self.inner
            .requests
            .lock()
            .iter()
            .filter(|r| r.kind == kind)
            .count()
    }

    /// Forget recorded requests
    pub fn clear_requests(&self) {
        self.inner.requests.lock().clear();
    }
}

/// [`DatabaseCommands`] bound to one database of an [`EmbeddedServer`]
pub struct EmbeddedCommands {
    server: EmbeddedServer,
    database: String,
    session_id: Option<Uuid>,
    read_from_master: AtomicBool,
}

impl EmbeddedCommands {
    fn record(&self, kind: RequestKind, detail: String) -> DocStoreResult<()> {
        {
            let mut failures = self.server.inner.failures.lock();
            if let Some(pos) = failures.iter().position(|(k, _)| *k == kind) {
                let (_, message) = failures.remove(pos);
                return Err(DocStoreError::transport(message));
            }
        }
        tracing::debug!(
            target: "docstore::embedded",
            database = %self.database,
            kind = ?kind,
            detail = %detail,
            "Request"
        );
        self.server.inner.requests.lock().push(RequestRecord {
            kind,
            database: self.database.clone(),
            session_id: self.session_id,
            from_master: self.read_from_master.load(Ordering::SeqCst),
            detail,
            at: Instant::now(),
        });
        Ok(())
    }

    fn state(&self) -> Arc<Mutex<DatabaseState>> {
        self.server.database(&self.database)
    }
}

impl DatabaseCommands for EmbeddedCommands {
    fn get(&self, key: &str) -> DocStoreResult<Option<JsonDocument>> {
        self.record(RequestKind::Get, key.to_string())?;
        self.state().lock().read(key)
    }

    fn get_many(&self, keys: &[String], includes: &[String]) -> DocStoreResult<MultiLoadResult> {
        self.record(RequestKind::GetMany, keys.join(","))?;
        let db = self.state();
        let mut state = db.lock();
        routes::load_many(&mut state, keys, includes)
    }

    fn put(
        &self,
        key: &str,
        etag: Option<Etag>,
        data: Map<String, Value>,
        metadata: Metadata,
    ) -> DocStoreResult<PutResult> {
        self.record(RequestKind::Put, key.to_string())?;
        self.state().lock().put(key, etag, data, metadata)
    }

    fn batch(&self, commands: &[CommandData]) -> DocStoreResult<Vec<BatchResult>> {
        let detail = commands
            .iter()
            .map(|c| format!("{} {}", c.method(), c.key()))
            .collect::<Vec<_>>()
            .join(", ");
        self.record(RequestKind::Batch, detail)?;
        self.state().lock().batch(commands)
    }

    fn query(
        &self,
        index: &str,
        query: &IndexQuery,
        includes: &[String],
    ) -> DocStoreResult<QueryResult> {
        self.record(RequestKind::Query, index.to_string())?;
        let db = self.state();
        let mut state = db.lock();
        state.query(index, query, includes)?.ok_or_else(|| DocStoreError::Server {
            status: 404,
            message: format!("There is no index named: {}", index),
        })
    }

    fn multi_get(&self, requests: &[GetRequest]) -> DocStoreResult<Vec<GetResponse>> {
        let detail = requests
            .iter()
            .map(GetRequest::url_and_query)
            .collect::<Vec<_>>()
            .join(" | ");
        self.record(RequestKind::MultiGet, detail)?;
        let db = self.state();
        let mut state = db.lock();
        Ok(requests
            .iter()
            .map(|request| routes::handle(&mut state, request))
            .collect())
    }

    fn for_session(&self, database: &str, session_id: Uuid) -> Arc<dyn DatabaseCommands> {
        Arc::new(EmbeddedCommands {
            server: self.server.clone(),
            database: database.to_string(),
            session_id: Some(session_id),
            read_from_master: AtomicBool::new(false),
        })
    }

    fn set_read_from_master(&self, enabled: bool) {
        self.read_from_master.store(enabled, Ordering::SeqCst);
    }
}
