//! Error types for the docstore client
//!
//! This module defines all error types surfaced by the session, query,
//! lazy-batching and HiLo layers. We use `thiserror` for automatic
//! `Display` and `Error` trait implementations.
//!
//! ## Propagation
//!
//! - Concurrency, collision and budget errors are surfaced synchronously to
//!   the caller that triggered them.
//! - `DocumentConflict` is raised by the transport when a document has
//!   divergent replicated versions. The HiLo layer resolves these internally
//!   and only reports `DistributedAllocationConflict` if resolution fails.
//! - Staleness timeouts surface only after the full configured wait elapsed.

use crate::etag::Etag;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for docstore operations
pub type DocStoreResult<T> = std::result::Result<T, DocStoreError>;

/// Error taxonomy for the docstore client
#[derive(Debug, Error)]
pub enum DocStoreError {
    /// Optimistic concurrency violation (etag mismatch on write)
    ///
    /// Never retried automatically by the session.
    #[error("concurrency conflict on '{key}': expected etag {expected:?}, actual etag {actual:?}")]
    ConcurrencyConflict {
        /// Document key the write targeted
        key: String,
        /// Etag the client sent with the write
        expected: Option<Etag>,
        /// Etag the server currently holds (None if the document is missing)
        actual: Option<Etag>,
    },

    /// Two distinct entity instances claim the same document key
    #[error("attempted to associate a different object with id '{key}'")]
    IdentifierCollision {
        /// The contested key
        key: String,
    },

    /// Operation on an entity that this session never tracked
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    /// The per-session cap on remote calls was exceeded
    #[error(
        "the maximum number of requests ({max}) allowed for this session has been reached; \
         sessions are expected to be short lived, batch loads and save once"
    )]
    RequestBudgetExceeded {
        /// Configured cap
        max: usize,
    },

    /// A cutoff-bounded query did not become non-stale in time
    #[error("waited for {waited:?} for the query on index '{index}' to return non stale results")]
    StalenessTimeout {
        /// Index that was queried
        index: String,
        /// How long the client waited before giving up
        waited: Duration,
    },

    /// The server refused to return a document because of a read trigger
    #[error("document '{key}' could not be read because of a read veto by '{trigger}': {reason}")]
    ReadVetoed {
        /// Document key
        key: String,
        /// Trigger that vetoed the read
        trigger: String,
        /// Veto reason
        reason: String,
    },

    /// HiLo ledger conflict that could not be resolved internally
    #[error("hilo allocation conflict for tag '{tag}': {message}")]
    DistributedAllocationConflict {
        /// Tag whose ledger is conflicted
        tag: String,
        /// Detail of the failed resolution
        message: String,
    },

    /// The document has conflicting replicated versions
    #[error("conflict detected on '{key}', conflicted versions: {conflicted_version_ids:?}")]
    DocumentConflict {
        /// Conflicted document key
        key: String,
        /// Keys of the conflicting versions
        conflicted_version_ids: Vec<String>,
        /// Etag to use when writing a resolution
        etag: Etag,
    },

    /// A document was modified by an uncommitted transaction and the session
    /// does not accept non-authoritative information
    #[error("document '{key}' returned non authoritative information")]
    NonAuthoritativeInformation {
        /// Document key (or index name for queries)
        key: String,
    },

    /// Document is expected to exist but doesn't
    #[error("document '{0}' no longer exists and was probably deleted")]
    DocumentNotFound(String),

    /// Invalid operation or session state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Invalid argument
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Server returned an error response
    #[error("server error (status {status}): {message}")]
    Server {
        /// HTTP-like status code
        status: u16,
        /// Response body or message
        message: String,
    },

    /// Transport failure (also wraps non-concurrency save failures)
    #[error("transport error: {0}")]
    Transport(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl DocStoreError {
    /// Create an `InvalidOperation` error
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        DocStoreError::InvalidOperation(message.into())
    }

    /// Create an `InvalidInput` error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        DocStoreError::InvalidInput(message.into())
    }

    /// Create an `UnknownEntity` error
    pub fn unknown_entity(message: impl Into<String>) -> Self {
        DocStoreError::UnknownEntity(message.into())
    }

    /// Create a `Transport` error
    pub fn transport(message: impl Into<String>) -> Self {
        DocStoreError::Transport(message.into())
    }

    /// Create a `Config` error
    pub fn config(message: impl Into<String>) -> Self {
        DocStoreError::Config(message.into())
    }

    /// True for optimistic concurrency violations
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, DocStoreError::ConcurrencyConflict { .. })
    }

    /// True for replicated-version conflicts reported by the transport
    pub fn is_document_conflict(&self) -> bool {
        matches!(self, DocStoreError::DocumentConflict { .. })
    }

    /// True if repeating the same operation may succeed
    ///
    /// Only non-authoritative reads qualify. Concurrency conflicts are
    /// deliberately excluded: the caller must reload and decide.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DocStoreError::NonAuthoritativeInformation { .. })
    }
}
