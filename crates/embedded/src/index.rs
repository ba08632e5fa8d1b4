//! Index simulation
//!
//! Indexes here are filters over the document store rather than real
//! inverted indexes. What matters is staleness: indexing can be paused, in
//! which case queries only see documents written before the pause and report
//! themselves stale relative to the requested cutoff.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use docstore_core::metadata;
use docstore_core::{DocStoreResult, Etag, IndexQuery, JsonDocument, QueryResult};

use crate::database::{fold, lookup_path, DatabaseState, StoredDocument};

/// A named index: every document, or documents of one entity name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexDefinition {
    /// Restrict to documents whose `Raven-Entity-Name` matches
    pub entity_name: Option<String>,
}

impl IndexDefinition {
    /// Index over documents of `entity_name`
    pub fn for_entity(entity_name: impl Into<String>) -> Self {
        IndexDefinition {
            entity_name: Some(entity_name.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct IndexState {
    pub paused: bool,
    pub indexed_etag: Etag,
    pub indexed_timestamp: DateTime<Utc>,
    pub forced_stale_queries: usize,
    /// Leave the result-level non-authoritative flag unset and report it
    /// only on the documents themselves
    pub per_document_non_authoritative: bool,
    pub definitions: HashMap<String, IndexDefinition>,
}

impl Default for IndexState {
    fn default() -> Self {
        IndexState {
            paused: false,
            indexed_etag: Etag::empty(),
            indexed_timestamp: Utc::now(),
            forced_stale_queries: 0,
            per_document_non_authoritative: false,
            definitions: HashMap::new(),
        }
    }
}

impl IndexState {
    pub fn on_write(&mut self, etag: Etag, at: DateTime<Utc>) {
        if !self.paused {
            self.indexed_etag = etag;
            self.indexed_timestamp = at;
        }
    }

    pub fn resume(&mut self, current: Etag) {
        self.paused = false;
        self.indexed_etag = current;
        self.indexed_timestamp = Utc::now();
    }

    fn scope(&self, index: &str) -> Option<Option<String>> {
        if index.eq_ignore_ascii_case("dynamic") {
            return Some(None);
        }
        if let Some(tag) = index.strip_prefix("dynamic/") {
            return Some(Some(tag.to_string()));
        }
        self.definitions
            .get(index)
            .map(|definition| definition.entity_name.clone())
    }
}

fn is_system(doc: &StoredDocument) -> bool {
    doc.key
        .get(..6)
        .map_or(false, |prefix| prefix.eq_ignore_ascii_case("Raven/"))
}

fn in_scope(doc: &StoredDocument, entity_name: &Option<String>) -> bool {
    if is_system(doc) {
        return false;
    }
    match entity_name {
        None => true,
        Some(wanted) => doc
            .metadata
            .get(metadata::ENTITY_NAME)
            .and_then(Value::as_str)
            .map(|name| name.eq_ignore_ascii_case(wanted))
            .unwrap_or(false),
    }
}

fn value_matches(value: &Value, expected: &str) -> bool {
    match value {
        Value::String(s) => s.eq_ignore_ascii_case(expected),
        Value::Number(n) => n.to_string() == expected,
        Value::Bool(b) => b.to_string().eq_ignore_ascii_case(expected),
        Value::Null => expected == "NULL_VALUE" || expected.eq_ignore_ascii_case("null"),
        Value::Array(items) => items.iter().any(|item| value_matches(item, expected)),
        Value::Object(_) => false,
    }
}

/// `field:value` clauses joined by ` AND `
fn matches_query(doc: &StoredDocument, query: &str) -> bool {
    query
        .split(" AND ")
        .map(str::trim)
        .filter(|clause| !clause.is_empty() && *clause != "*:*")
        .all(|clause| {
            let Some((field, raw)) = clause.split_once(':') else {
                return false;
            };
            let expected = raw.trim().trim_matches('"');
            if field == "__document_id" {
                return doc.key.eq_ignore_ascii_case(expected);
            }
            lookup_path(&doc.data, field)
                .map(|value| value_matches(value, expected))
                .unwrap_or(false)
        })
}

impl DatabaseState {
    /// Run `query` against `index`; `Ok(None)` if no such index exists
    pub fn query(
        &mut self,
        index: &str,
        query: &IndexQuery,
        includes: &[String],
    ) -> DocStoreResult<Option<QueryResult>> {
        let Some(scope) = self.index.scope(index) else {
            return Ok(None);
        };

        let indexed_etag = self.index.indexed_etag;
        let mut is_stale = self.docs.values().any(|doc| {
            in_scope(doc, &scope)
                && doc.etag > indexed_etag
                && match (query.cutoff_etag, query.cutoff) {
                    (Some(cutoff), _) => doc.etag <= cutoff,
                    (None, Some(cutoff)) => doc.last_modified <= cutoff,
                    (None, None) => true,
                }
        });
        if self.index.forced_stale_queries > 0 {
            self.index.forced_stale_queries -= 1;
            is_stale = true;
        }

        let mut matched: Vec<&StoredDocument> = self
            .docs
            .values()
            .filter(|doc| in_scope(doc, &scope) && doc.etag <= indexed_etag)
            .filter(|doc| matches_query(doc, &query.query))
            .collect();
        matched.sort_by_key(|doc| doc.etag);

        let total_results = matched.len();
        let page: Vec<JsonDocument> = matched
            .into_iter()
            .skip(query.start)
            .take(query.effective_page_size())
            .map(StoredDocument::to_document)
            .collect();
        for doc in page.iter().filter(|d| d.non_authoritative_information) {
            if let Some(stored) = self.docs.get_mut(&fold(&doc.key)) {
                stored.non_authoritative_reads = stored.non_authoritative_reads.saturating_sub(1);
            }
        }
        let non_authoritative_information = !self.index.per_document_non_authoritative
            && page.iter().any(|d| d.non_authoritative_information);

        let mut included = Vec::new();
        for doc in &page {
            self.includes_of(doc, includes, &mut included)?;
        }

        Ok(Some(QueryResult {
            results: page.iter().map(JsonDocument::to_json).collect(),
            includes: included.iter().map(JsonDocument::to_json).collect(),
            is_stale,
            index_etag: Some(indexed_etag),
            index_timestamp: Some(self.index.indexed_timestamp),
            total_results,
            skipped_results: 0,
            index_name: index.to_string(),
            non_authoritative_information,
        }))
    }
}
