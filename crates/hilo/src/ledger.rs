//! The HiLo ledger document
//!
//! Each tag has a ledger at `Raven/Hilo/{tag}` whose `Max` field is the
//! highest value reserved by any client. A second document,
//! `Raven/ServerPrefixForHilo`, optionally holds a `ServerPrefix` string
//! embedded into every generated key.

use serde_json::{Map, Value};

use docstore_core::metadata::{self, Metadata};
use docstore_core::{DatabaseCommands, DocStoreError, DocStoreResult, Etag, JsonDocument};

/// Prefix of ledger document keys
pub const HILO_KEY_PREFIX: &str = "Raven/Hilo/";
/// Key of the server prefix document
pub const SERVER_PREFIX_KEY: &str = "Raven/ServerPrefixForHilo";
/// Current ledger field
pub const MAX_FIELD: &str = "Max";
/// Legacy ledger field, converted to `Max` on read
pub const LEGACY_HI_FIELD: &str = "ServerHi";
/// Field of the server prefix document
pub const SERVER_PREFIX_FIELD: &str = "ServerPrefix";

/// Ledger key for `tag`
pub fn ledger_key(tag: &str) -> String {
    format!("{}{}", HILO_KEY_PREFIX, tag)
}

/// A ledger document as read from the server
#[derive(Debug, Clone)]
pub struct Ledger {
    /// Body, with legacy fields already migrated
    pub data: Map<String, Value>,
    /// Metadata without server-reserved `@` entries
    pub metadata: Metadata,
    /// Etag to write back with
    pub etag: Option<Etag>,
}

impl Ledger {
    fn from_document(mut doc: JsonDocument) -> Ledger {
        metadata::strip_reserved(&mut doc.metadata);
        Ledger {
            data: doc.data,
            metadata: doc.metadata,
            etag: doc.etag,
        }
    }

    /// Reserved maximum, migrating a legacy `ServerHi` field in place
    ///
    /// A legacy ledger stored the next "hi" block number; it maps to
    /// `(hi - 1) * capacity`. The result is never below `floor`.
    pub fn max(&mut self, capacity: u64, floor: u64) -> u64 {
        if let Some(hi) = self.data.remove(LEGACY_HI_FIELD).and_then(|v| v.as_u64()) {
            let migrated = hi.saturating_sub(1).saturating_mul(capacity);
            self.data.insert(MAX_FIELD.to_string(), Value::from(migrated));
        }
        let stored = self
            .data
            .get(MAX_FIELD)
            .and_then(Value::as_u64)
            .unwrap_or(0);
        stored.max(floor)
    }

    /// Record a new reserved maximum
    pub fn set_max(&mut self, max: u64) {
        self.data.insert(MAX_FIELD.to_string(), Value::from(max));
    }
}

/// Result of reading the ledger and the server prefix in one round trip
#[derive(Debug, Clone)]
pub struct LedgerRead {
    /// The ledger, if one exists
    pub ledger: Option<Ledger>,
    /// Server prefix, empty when not configured
    pub server_prefix: String,
}

/// Fetch the ledger for `tag` together with the server prefix
///
/// Fails with `DocumentConflict` when the ledger has conflicting versions.
pub fn read(commands: &dyn DatabaseCommands, tag: &str) -> DocStoreResult<LedgerRead> {
    let keys = [ledger_key(tag), SERVER_PREFIX_KEY.to_string()];
    let mut result = commands.get_many(&keys, &[])?;

    let server_prefix = result
        .results
        .get(1)
        .and_then(Option::as_ref)
        .and_then(|doc| doc.data.get(SERVER_PREFIX_FIELD))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let ledger = if result.results.is_empty() {
        None
    } else {
        result.results.swap_remove(0).map(Ledger::from_document)
    };

    Ok(LedgerRead {
        ledger,
        server_prefix,
    })
}

/// Highest `Max` across the conflicting versions of a ledger
pub fn highest_conflicting_max(
    commands: &dyn DatabaseCommands,
    tag: &str,
    version_ids: &[String],
    capacity: u64,
    floor: u64,
) -> DocStoreResult<u64> {
    let mut highest = 0;
    for id in version_ids {
        let version = commands.get(id)?.ok_or_else(|| {
            DocStoreError::DistributedAllocationConflict {
                tag: tag.to_string(),
                message: format!("conflicting ledger version '{}' disappeared", id),
            }
        })?;
        let max = Ledger::from_document(version).max(capacity, floor);
        highest = highest.max(max);
    }
    Ok(highest)
}

/// Write `ledger` back, checking its etag
pub fn write(commands: &dyn DatabaseCommands, tag: &str, ledger: &Ledger) -> DocStoreResult<()> {
    commands.put(
        &ledger_key(tag),
        ledger.etag,
        ledger.data.clone(),
        ledger.metadata.clone(),
    )?;
    Ok(())
}

/// A ledger for a tag that has none yet; must not exist when written
pub fn fresh(max: u64) -> Ledger {
    let mut data = Map::new();
    data.insert(MAX_FIELD.to_string(), Value::from(max));
    Ledger {
        data,
        metadata: Metadata::new(),
        etag: Some(Etag::empty()),
    }
}
