//! Index query parameters and results
//!
//! The query text itself is opaque here; this module only carries paging and
//! the staleness cutoff through to the server and back.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DocStoreError, DocStoreResult};
use crate::etag::Etag;
use crate::multiget::{escape_data_string, unescape_data_string};

/// Default page size sent when the caller did not pick one
pub const DEFAULT_PAGE_SIZE: usize = 128;

/// Parameters of an index query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexQuery {
    /// Query text, e.g. `Name:Ayende AND Age:30`
    pub query: String,
    /// Number of results to skip
    pub start: usize,
    /// Maximum number of results; `None` means the server default
    pub page_size: Option<usize>,
    /// Staleness cutoff as a timestamp: writes after this instant don't count
    pub cutoff: Option<DateTime<Utc>>,
    /// Staleness cutoff as an etag: writes after this etag don't count
    pub cutoff_etag: Option<Etag>,
}

impl IndexQuery {
    /// Query with the given text and default paging
    pub fn new(query: impl Into<String>) -> Self {
        IndexQuery {
            query: query.into(),
            ..Default::default()
        }
    }

    /// Page size that will actually be applied
    pub fn effective_page_size(&self) -> usize {
        self.page_size.unwrap_or(DEFAULT_PAGE_SIZE)
    }

    /// URL query string, starting with `?`
    pub fn to_query_string(&self) -> String {
        let mut out = String::from("?");
        out.push_str("query=");
        out.push_str(&escape_data_string(&self.query));
        if self.start != 0 {
            out.push_str(&format!("&start={}", self.start));
        }
        out.push_str(&format!("&pageSize={}", self.effective_page_size()));
        if let Some(cutoff) = self.cutoff {
            out.push_str("&cutOff=");
            out.push_str(&escape_data_string(
                &cutoff.to_rfc3339_opts(SecondsFormat::Micros, true),
            ));
        }
        if let Some(etag) = self.cutoff_etag {
            out.push_str(&format!("&cutOffEtag={}", etag));
        }
        out
    }

    /// Parse the output of [`IndexQuery::to_query_string`]
    ///
    /// Unknown parameters are ignored.
    pub fn from_query_string(text: &str) -> DocStoreResult<IndexQuery> {
        let mut query = IndexQuery::default();
        let text = text.strip_prefix('?').unwrap_or(text);
        for pair in text.split('&').filter(|p| !p.is_empty()) {
            let (name, raw) = pair.split_once('=').unwrap_or((pair, ""));
            let value = unescape_data_string(raw);
            match name {
                "query" => query.query = value,
                "start" => query.start = parse_number(name, &value)?,
                "pageSize" => query.page_size = Some(parse_number(name, &value)?),
                "cutOff" => {
                    let ts = DateTime::parse_from_rfc3339(&value).map_err(|e| {
                        DocStoreError::invalid_input(format!("bad cutOff '{}': {}", value, e))
                    })?;
                    query.cutoff = Some(ts.with_timezone(&Utc));
                }
                "cutOffEtag" => query.cutoff_etag = Some(Etag::parse(&value)?),
                _ => {}
            }
        }
        Ok(query)
    }
}

fn parse_number(name: &str, value: &str) -> DocStoreResult<usize> {
    value
        .parse()
        .map_err(|_| DocStoreError::invalid_input(format!("bad {} '{}'", name, value)))
}

/// Result of an index query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueryResult {
    /// Matching documents in wire form (body plus `@metadata`)
    #[serde(default)]
    pub results: Vec<Value>,
    /// Included documents in wire form
    #[serde(default)]
    pub includes: Vec<Value>,
    /// Whether the index had not caught up with the cutoff
    #[serde(default)]
    pub is_stale: bool,
    /// Last etag the index has processed
    #[serde(default)]
    pub index_etag: Option<Etag>,
    /// Last time the index was updated
    #[serde(default)]
    pub index_timestamp: Option<DateTime<Utc>>,
    /// Total number of matches, ignoring paging
    #[serde(default)]
    pub total_results: usize,
    /// Results skipped by the server
    #[serde(default)]
    pub skipped_results: usize,
    /// Name of the index that answered
    #[serde(default)]
    pub index_name: String,
    /// Whether any result was touched by an uncommitted transaction
    #[serde(default)]
    pub non_authoritative_information: bool,
}
