//! Document store
//!
//! The store is the long-lived, thread-safe half of the client: it owns the
//! configuration, the naming conventions, the HiLo generators shared by all
//! sessions, and the last etag any of its sessions wrote. Sessions are cheap
//! and short lived; open one per unit of work.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use docstore_core::{
    ClientConfig, DatabaseCommands, DocStoreResult, DocumentConventions, Etag,
};
use docstore_hilo::{HiLoOptions, MultiDatabaseHiLoGenerator};

use crate::listeners::{DocumentDeleteListener, DocumentStoreListener, Listeners};
use crate::session::DocumentSession;

struct StoreInner {
    config: ClientConfig,
    conventions: DocumentConventions,
    commands: Arc<dyn DatabaseCommands>,
    hilo: MultiDatabaseHiLoGenerator,
    last_written_etag: Mutex<Option<Etag>>,
    listeners: Listeners,
}

/// Entry point of the client
///
/// Cloning is cheap and clones share all state.
#[derive(Clone)]
pub struct DocumentStore {
    inner: Arc<StoreInner>,
}

impl DocumentStore {
    /// Store over `commands`, configured by `config`
    pub fn new(commands: Arc<dyn DatabaseCommands>, config: ClientConfig) -> DocStoreResult<Self> {
        let options = HiLoOptions::from_config(&config);
        Self::with_hilo_options(commands, config, options)
    }

    /// Store with explicit HiLo settings (e.g. a manual clock)
    pub fn with_hilo_options(
        commands: Arc<dyn DatabaseCommands>,
        config: ClientConfig,
        hilo: HiLoOptions,
    ) -> DocStoreResult<Self> {
        config.validate()?;
        tracing::info!(
            target: "docstore::session",
            database = %config.database,
            max_requests_per_session = config.max_requests_per_session,
            hilo_capacity = hilo.capacity,
            "Document store initialized"
        );
        Ok(DocumentStore {
            inner: Arc::new(StoreInner {
                conventions: DocumentConventions::from_config(&config),
                config,
                commands,
                hilo: MultiDatabaseHiLoGenerator::new(hilo),
                last_written_etag: Mutex::new(None),
                listeners: Listeners::default(),
            }),
        })
    }

    /// Client configuration
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Naming conventions
    pub fn conventions(&self) -> &DocumentConventions {
        &self.inner.conventions
    }

    /// Transport shared by every session
    pub fn commands(&self) -> &Arc<dyn DatabaseCommands> {
        &self.inner.commands
    }

    /// Session on the configured default database
    pub fn open_session(&self) -> DocumentSession {
        DocumentSession::new(self.clone(), &self.inner.config.database)
    }

    /// Session on `database`
    pub fn open_session_for(&self, database: &str) -> DocumentSession {
        DocumentSession::new(self.clone(), database)
    }

    /// Highest etag written by any session of this store
    pub fn last_written_etag(&self) -> Option<Etag> {
        *self.inner.last_written_etag.lock()
    }

    /// Raise the last written etag to `etag`; lower values are ignored
    pub fn update_last_written_etag(&self, etag: Etag) {
        let mut last = self.inner.last_written_etag.lock();
        match *last {
            Some(current) if current >= etag => {}
            _ => *last = Some(etag),
        }
    }

    /// Run `listener` before every put sent by this store's sessions
    pub fn register_store_listener(&self, listener: Arc<dyn DocumentStoreListener>) {
        self.inner.listeners.add_store(listener);
    }

    /// Run `listener` before every delete of a tracked entity
    pub fn register_delete_listener(&self, listener: Arc<dyn DocumentDeleteListener>) {
        self.inner.listeners.add_delete(listener);
    }

    pub(crate) fn listeners(&self) -> &Listeners {
        &self.inner.listeners
    }

    /// Next HiLo key for `type_tag` in `database`
    pub fn generate_document_key(
        &self,
        database: &str,
        commands: &dyn DatabaseCommands,
        type_tag: &str,
    ) -> DocStoreResult<String> {
        self.inner.hilo.generate_document_key(
            database,
            commands,
            &self.inner.conventions,
            type_tag,
        )
    }
}

impl fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentStore")
            .field("database", &self.inner.config.database)
            .field("last_written_etag", &self.last_written_etag())
            .finish()
    }
}
