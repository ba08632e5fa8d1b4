//! Single-tag HiLo generator
//!
//! ## Fast path
//!
//! `next_id` clones the current range pointer and bumps its cursor. No lock
//! is taken while the range has values left.
//!
//! ## Refill
//!
//! When the range runs out, the caller takes the refill lock and checks
//! whether another thread already swapped the range in the meantime
//! (pointer comparison). If not, it reserves a new block from the ledger:
//!
//! 1. Read the ledger and the server prefix from the primary node.
//! 2. On a replication conflict, write back the highest `Max` across the
//!    conflicting versions and start over.
//! 3. Write `Max = old max + capacity` with an etag check; on a concurrency
//!    conflict start over.
//!
//! Attempts are bounded; running out surfaces `DistributedAllocationConflict`.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use docstore_core::{
    ClientConfig, DatabaseCommands, DocStoreError, DocStoreResult, DocumentConventions,
    MasterReadScope,
};

use crate::capacity::CapacityPolicy;
use crate::clock::{Clock, SystemClock};
use crate::ledger;
use crate::range::RangeValue;

/// Upper bound on ledger round trips for one refill
pub const DEFAULT_MAX_REFILL_ATTEMPTS: usize = 64;

/// Generator settings
#[derive(Clone)]
pub struct HiLoOptions {
    /// Initial and minimum range size
    pub capacity: u64,
    /// Keep the range size fixed
    pub disable_capacity_changes: bool,
    /// Time source for capacity adaptation
    pub clock: Arc<dyn Clock>,
    /// Ledger round trips allowed per refill
    pub max_refill_attempts: usize,
}

impl Default for HiLoOptions {
    fn default() -> Self {
        HiLoOptions {
            capacity: 32,
            disable_capacity_changes: false,
            clock: Arc::new(SystemClock::new()),
            max_refill_attempts: DEFAULT_MAX_REFILL_ATTEMPTS,
        }
    }
}

impl std::fmt::Debug for HiLoOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HiLoOptions")
            .field("capacity", &self.capacity)
            .field("disable_capacity_changes", &self.disable_capacity_changes)
            .field("max_refill_attempts", &self.max_refill_attempts)
            .finish()
    }
}

impl HiLoOptions {
    /// Options taken from the client configuration
    pub fn from_config(config: &ClientConfig) -> Self {
        HiLoOptions {
            capacity: config.hilo_capacity,
            disable_capacity_changes: config.hilo_disable_capacity_changes,
            ..Default::default()
        }
    }

    /// Same options with a different clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn policy(&self) -> CapacityPolicy {
        if self.disable_capacity_changes {
            CapacityPolicy::fixed(self.capacity)
        } else {
            CapacityPolicy::new(self.capacity)
        }
    }
}

/// HiLo generator for one tag
///
/// Shared across threads and sessions.
pub struct HiLoKeyGenerator {
    tag: String,
    range: RwLock<Arc<RangeValue>>,
    refill: Mutex<CapacityPolicy>,
    clock: Arc<dyn Clock>,
    max_refill_attempts: usize,
}

impl HiLoKeyGenerator {
    /// Generator for `tag` (the document-key prefix, e.g. `users`)
    pub fn new(tag: impl Into<String>, options: &HiLoOptions) -> Self {
        HiLoKeyGenerator {
            tag: tag.into(),
            range: RwLock::new(Arc::new(RangeValue::empty())),
            refill: Mutex::new(options.policy()),
            clock: Arc::clone(&options.clock),
            max_refill_attempts: options.max_refill_attempts.max(1),
        }
    }

    /// Tag this generator allocates for
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Capacity that the next refill starts from
    pub fn capacity(&self) -> u64 {
        self.refill.lock().capacity()
    }

    /// Snapshot of the active range
    pub fn current_range(&self) -> Arc<RangeValue> {
        Arc::clone(&*self.range.read())
    }

    /// Next numeric id
    pub fn next_id(&self, commands: &dyn DatabaseCommands) -> DocStoreResult<u64> {
        self.next(commands).map(|(id, _)| id)
    }

    /// Next document key: `{tag}{separator}{server prefix}{id}`
    pub fn generate_document_key(
        &self,
        commands: &dyn DatabaseCommands,
        conventions: &DocumentConventions,
    ) -> DocStoreResult<String> {
        let (id, range) = self.next(commands)?;
        let value = format!("{}{}", range.server_prefix(), id);
        Ok(conventions.full_document_key(&self.tag, &value))
    }

    fn next(&self, commands: &dyn DatabaseCommands) -> DocStoreResult<(u64, Arc<RangeValue>)> {
        loop {
            let range = self.current_range();
            if let Some(id) = range.next() {
                return Ok((id, range));
            }

            let mut policy = self.refill.lock();
            let latest = self.current_range();
            if !Arc::ptr_eq(&latest, &range) {
                // another caller refilled while we waited for the lock
                continue;
            }
            let fresh = self.fetch_next_range(commands, &mut policy, range.max())?;
            *self.range.write() = Arc::new(fresh);
        }
    }

    fn fetch_next_range(
        &self,
        commands: &dyn DatabaseCommands,
        policy: &mut CapacityPolicy,
        floor: u64,
    ) -> DocStoreResult<RangeValue> {
        let _primary = MasterReadScope::new(commands);
        let capacity = policy.on_refill(self.clock.now_millis());

        for attempt in 1..=self.max_refill_attempts {
            let read = match ledger::read(commands, &self.tag) {
                Ok(read) => read,
                Err(DocStoreError::DocumentConflict {
                    conflicted_version_ids,
                    etag,
                    ..
                }) => {
                    let highest = ledger::highest_conflicting_max(
                        commands,
                        &self.tag,
                        &conflicted_version_ids,
                        capacity,
                        floor,
                    )?;
                    tracing::warn!(
                        target: "docstore::hilo",
                        tag = %self.tag,
                        versions = conflicted_version_ids.len(),
                        resolved_max = highest,
                        "Resolving conflicted hilo ledger with the highest max"
                    );
                    let mut resolved = ledger::fresh(highest);
                    resolved.etag = Some(etag);
                    match ledger::write(commands, &self.tag, &resolved) {
                        Ok(()) => continue,
                        Err(e) if e.is_concurrency_conflict() => continue,
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            };

            let (min, max, next_ledger) = match read.ledger {
                None => {
                    let max = floor.saturating_add(capacity);
                    (floor.saturating_add(1), max, ledger::fresh(max))
                }
                Some(mut existing) => {
                    let old_max = existing.max(capacity, floor);
                    let max = old_max.saturating_add(capacity);
                    existing.set_max(max);
                    (old_max.saturating_add(1), max, existing)
                }
            };

            match ledger::write(commands, &self.tag, &next_ledger) {
                Ok(()) => {
                    tracing::info!(
                        target: "docstore::hilo",
                        tag = %self.tag,
                        min,
                        max,
                        capacity,
                        "Reserved hilo range"
                    );
                    return Ok(RangeValue::with_prefix(min, max, read.server_prefix));
                }
                Err(e) if e.is_concurrency_conflict() => {
                    tracing::debug!(
                        target: "docstore::hilo",
                        tag = %self.tag,
                        attempt,
                        "Hilo ledger changed concurrently, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(DocStoreError::DistributedAllocationConflict {
            tag: self.tag.clone(),
            message: format!(
                "ledger still contended after {} attempts",
                self.max_refill_attempts
            ),
        })
    }
}

impl std::fmt::Debug for HiLoKeyGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let range = self.current_range();
        f.debug_struct("HiLoKeyGenerator")
            .field("tag", &self.tag)
            .field("min", &range.min())
            .field("max", &range.max())
            .field("current", &range.current())
            .finish()
    }
}
