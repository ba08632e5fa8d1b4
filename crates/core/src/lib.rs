//! Core types and traits for the docstore client
//!
//! This crate defines the foundational types shared by every layer:
//! - Etag: 16-byte version stamp used for concurrency checks and staleness cutoffs
//! - Document: capability trait that exposes an entity's identifier
//! - JsonDocument / Metadata: server-side document representation
//! - Commands: write-batch commands and their per-command results
//! - IndexQuery / QueryResult: query parameters and responses
//! - GetRequest / GetResponse: multi-get sub requests used for lazy batching
//! - DatabaseCommands: the transport contract consumed by the session and HiLo layers
//! - DocumentConventions / ClientConfig: naming rules and tunables
//! - DocStoreError: error taxonomy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod commands;
pub mod config;
pub mod conventions;
pub mod document;
pub mod error;
pub mod etag;
pub mod metadata;
pub mod multiget;
pub mod query;
pub mod transport;

pub use commands::{
    BatchResult, CommandData, DeleteCommandData, MultiLoadResult, PutCommandData, PutResult,
};
pub use config::{ClientConfig, QueryConsistency, CONFIG_FILE_NAME};
pub use conventions::{default_type_tag, pluralize, DocumentConventions};
pub use document::{Document, JsonDocument};
pub use error::{DocStoreError, DocStoreResult};
pub use etag::Etag;
pub use metadata::Metadata;
pub use multiget::{
    escape_data_string, unescape_data_string, GetRequest, GetResponse, REQUEST_TIME_HEADER,
};
pub use query::{IndexQuery, QueryResult, DEFAULT_PAGE_SIZE};
pub use transport::{DatabaseCommands, MasterReadScope};
