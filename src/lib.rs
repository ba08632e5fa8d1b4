//! Docstore - unit-of-work client runtime for a remote document database
//!
//! The client keeps an identity map of loaded entities, diffs them against
//! their last acknowledged state and writes every change in one atomic
//! batch. New entities get keys from a HiLo generator without a round trip
//! per insert; queries can wait for indexes to catch up with a write; and
//! independent loads and queries can be deferred and resolved together.
//!
//! # Quick Start
//!
//! ```ignore
//! use docstore::{ClientConfig, DocumentStore, EmbeddedServer, Tracked};
//!
//! let server = EmbeddedServer::new();
//! let store = DocumentStore::new(server.commands("northwind"), ClientConfig::default())?;
//!
//! let mut session = store.open_session_for("northwind");
//! let user = Tracked::new(User { id: None, name: "Ayende".into() });
//! session.store(&user)?;          // key "users/1" from the HiLo generator
//! session.save_changes()?;        // one batch round trip
//!
//! let found = session
//!     .query::<User>()
//!     .where_equals("name", "Ayende")
//!     .wait_for_non_stale_results_as_of_last_write()
//!     .to_list()?;
//! ```
//!
//! # Architecture
//!
//! - `docstore-core`: shared types, the transport contract, configuration
//! - `docstore-hilo`: distributed key generation
//! - `docstore-session`: store, session, queries, lazy batching
//! - `docstore-embedded`: in-process server implementing the transport

pub use docstore_core::*;
pub use docstore_embedded::{EmbeddedServer, IndexDefinition, RequestKind, RequestRecord};
pub use docstore_hilo::{HiLoKeyGenerator, HiLoOptions, ManualClock, MultiTypeHiLoKeyGenerator};
pub use docstore_session::*;
