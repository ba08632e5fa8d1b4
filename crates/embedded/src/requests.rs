//! Request log
//!
//! Every call that would be a network round trip against a remote server is
//! recorded, so callers can assert how many round trips an operation took
//! and how they were spaced.

use std::time::Instant;

use uuid::Uuid;

/// Kind of round trip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Single document fetch
    Get,
    /// Multi-document fetch
    GetMany,
    /// Single document write
    Put,
    /// Write batch
    Batch,
    /// Index query
    Query,
    /// Bundle of GET-like requests
    MultiGet,
}

/// One recorded round trip
#[derive(Debug, Clone)]
pub struct RequestRecord {
    /// What kind of call it was
    pub kind: RequestKind,
    /// Target database
    pub database: String,
    /// Session that issued it, if any
    pub session_id: Option<Uuid>,
    /// Whether it was forced to the primary node
    pub from_master: bool,
    /// Key, index name or route list
    pub detail: String,
    /// When it arrived
    pub at: Instant,
}
