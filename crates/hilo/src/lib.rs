//! HiLo document key generation
//!
//! A client reserves a numeric range ("hi") from a shared ledger document and
//! dispenses individual values ("lo") from it locally, so inserts don't need
//! a server round trip per document.
//!
//! ## Components
//!
//! - [`RangeValue`]: immutable bounds plus an atomic cursor
//! - [`CapacityPolicy`]: adaptive range sizing
//! - [`HiLoKeyGenerator`]: one tag, shared across threads
//! - [`MultiTypeHiLoKeyGenerator`]: one generator per tag, created on first use
//! - [`MultiDatabaseHiLoGenerator`]: one multi-type generator per database
//!
//! ## Guarantees
//!
//! - No two callers ever receive the same id for the same tag, across
//!   threads and across clients sharing the ledger.
//! - A dispensed id never exceeds the `max` of the range that produced it.
//! - Ledger conflicts between replicated versions are resolved by taking the
//!   highest `Max`, never the lowest.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod capacity;
pub mod clock;
pub mod generator;
pub mod ledger;
pub mod multi;
pub mod range;

pub use capacity::CapacityPolicy;
pub use clock::{Clock, ManualClock, SystemClock};
pub use generator::{HiLoKeyGenerator, HiLoOptions};
pub use multi::{MultiDatabaseHiLoGenerator, MultiTypeHiLoKeyGenerator};
pub use range::RangeValue;
