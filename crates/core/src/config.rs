//! Client configuration via `docstore.toml`
//!
//! Every knob has a default; a missing file or an empty file yields the
//! defaults. To change settings, edit the file and open a new store.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{DocStoreError, DocStoreResult};

/// Config file name looked up by the client.
pub const CONFIG_FILE_NAME: &str = "docstore.toml";

/// Consistency applied to queries that don't ask for one explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueryConsistency {
    /// Accept whatever the index has, stale or not
    #[default]
    None,
    /// Wait until the index has caught up with this store's last write
    WaitForLastWrite,
}

/// Client configuration loaded from `docstore.toml`.
///
/// # Example
///
/// ```toml
/// database = "northwind"
/// max_requests_per_session = 30
/// use_optimistic_concurrency = true
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Database sessions open against when none is named.
    pub database: String,
    /// Cap on remote calls per session.
    pub max_requests_per_session: usize,
    /// Send etags with every put and delete.
    pub use_optimistic_concurrency: bool,
    /// Separator between key parts.
    pub identity_parts_separator: String,
    /// Initial (and minimum) HiLo range size.
    pub hilo_capacity: u64,
    /// Keep the HiLo range size fixed.
    pub hilo_disable_capacity_changes: bool,
    /// How long a query waits for non-stale results.
    pub query_timeout_ms: u64,
    /// Sleep between staleness polls.
    pub staleness_poll_interval_ms: u64,
    /// Sleep before re-running a lazy batch that asked for a retry.
    pub lazy_retry_interval_ms: u64,
    /// Consistency applied to queries by default.
    pub default_query_consistency: QueryConsistency,
    /// Accept documents touched by uncommitted transactions.
    pub allow_non_authoritative_information: bool,
    /// How long loads retry while getting non-authoritative documents.
    pub non_authoritative_information_timeout_ms: u64,
    /// Allow `__document_id` clauses on dynamic indexes.
    pub allow_queries_on_id: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            database: "default".to_string(),
            max_requests_per_session: 30,
            use_optimistic_concurrency: false,
            identity_parts_separator: "/".to_string(),
            hilo_capacity: 32,
            hilo_disable_capacity_changes: false,
            query_timeout_ms: 15_000,
            staleness_poll_interval_ms: 100,
            lazy_retry_interval_ms: 100,
            default_query_consistency: QueryConsistency::None,
            allow_non_authoritative_information: true,
            non_authoritative_information_timeout_ms: 15_000,
            allow_queries_on_id: false,
        }
    }
}

impl ClientConfig {
    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Docstore client configuration
#
# Database used by sessions that don't name one
database = "default"

# Maximum number of remote calls a single session may make (default: 30)
# Sessions are meant to be short lived; raise this only after batching loads.
max_requests_per_session = 30

# Send etags with every write so concurrent modifications fail (default: false)
use_optimistic_concurrency = false

# Separator between document key parts (default: "/")
identity_parts_separator = "/"

# HiLo key generation
#   hilo_capacity                 = initial and minimum range size
#   hilo_disable_capacity_changes = keep the range size fixed
hilo_capacity = 32
hilo_disable_capacity_changes = false

# Staleness handling for queries
#   query_timeout_ms           = give up waiting for non-stale results after this
#   staleness_poll_interval_ms = sleep between polls
query_timeout_ms = 15000
staleness_poll_interval_ms = 100

# Sleep before re-running a lazy batch that asked for a retry
lazy_retry_interval_ms = 100

# Default query consistency: "none" or "wait_for_last_write"
default_query_consistency = "none"

# Non-authoritative documents (touched by an uncommitted transaction)
allow_non_authoritative_information = true
non_authoritative_information_timeout_ms = 15000

# Allow __document_id clauses on dynamic indexes
allow_queries_on_id = false
"#
    }

    /// Parse config from TOML text and validate it.
    pub fn from_toml_str(content: &str) -> DocStoreResult<Self> {
        let config: ClientConfig = toml::from_str(content)
            .map_err(|e| DocStoreError::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> DocStoreResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DocStoreError::config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: ClientConfig = toml::from_str(&content).map_err(|e| {
            DocStoreError::config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> DocStoreResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                DocStoreError::config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> DocStoreResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| DocStoreError::config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            DocStoreError::config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Reject values the client cannot work with.
    pub fn validate(&self) -> DocStoreResult<()> {
        if self.database.is_empty() {
            return Err(DocStoreError::config("database name cannot be empty"));
        }
        if self.max_requests_per_session == 0 {
            return Err(DocStoreError::config(
                "max_requests_per_session must be at least 1",
            ));
        }
        if self.identity_parts_separator.is_empty() {
            return Err(DocStoreError::config(
                "identity_parts_separator cannot be empty",
            ));
        }
        if self.hilo_capacity == 0 {
            return Err(DocStoreError::config("hilo_capacity must be at least 1"));
        }
        if self.staleness_poll_interval_ms == 0 {
            return Err(DocStoreError::config(
                "staleness_poll_interval_ms must be at least 1",
            ));
        }
        Ok(())
    }

    /// Query staleness timeout.
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Sleep between staleness polls.
    pub fn staleness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.staleness_poll_interval_ms)
    }

    /// Sleep before a lazy batch retry.
    pub fn lazy_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lazy_retry_interval_ms)
    }

    /// Non-authoritative retry window.
    pub fn non_authoritative_information_timeout(&self) -> Duration {
        Duration::from_millis(self.non_authoritative_information_timeout_ms)
    }
}
