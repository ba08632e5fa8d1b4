//! Unit-of-work sessions over a document database
//!
//! This crate holds the client-side half of the docstore runtime:
//! - DocumentStore: shared configuration, conventions, HiLo generators and
//!   the last written etag
//! - DocumentSession: identity map, change tracking and load/refresh
//! - save_changes: diffing tracked entities into one atomic write batch
//! - DocumentQuery: staleness-aware queries
//! - Lazy: deferred loads and queries resolved in one multi-get
//! - listeners: hooks run over every put and delete a save sends
//!
//! ```ignore
//! let store = DocumentStore::new(commands, ClientConfig::default())?;
//! let mut session = store.open_session();
//!
//! let user = Tracked::new(User { id: None, name: "Ayende".into() });
//! session.store(&user)?;
//! session.save_changes()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod entity;
mod lazy;
mod listeners;
mod operations;
mod query;
mod save;
mod session;
mod store;
mod tracking;

pub use entity::Tracked;
pub use lazy::{Lazy, LazySessionOperations, ResponseTimeInformation, ResponseTimeItem};
pub use listeners::{DocumentDeleteListener, DocumentStoreListener};
pub use query::DocumentQuery;
pub use session::DocumentSession;
pub use store::DocumentStore;
pub use tracking::DocumentMetadata;
