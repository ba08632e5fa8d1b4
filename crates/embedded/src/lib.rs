//! Embedded document server
//!
//! An in-process implementation of [`DatabaseCommands`] with the server
//! behaviors the client depends on:
//!
//! - etags and optimistic concurrency (`Etag::empty()` means "must not exist")
//! - atomic write batches
//! - replication-style conflicts on a document
//! - indexes that can be paused or forced stale
//! - multi-get routing for lazy operations
//! - read vetoes and non-authoritative reads
//!
//! Every round trip is recorded in a request log for inspection.
//!
//! [`DatabaseCommands`]: docstore_core::DatabaseCommands

#![warn(missing_docs)]
#![warn(clippy::all)]

mod database;
mod index;
mod requests;
mod routes;
mod server;

pub use index::IndexDefinition;
pub use requests::{RequestKind, RequestRecord};
pub use server::{EmbeddedCommands, EmbeddedServer};
