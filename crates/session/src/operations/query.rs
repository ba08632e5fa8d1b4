use std::time::{Duration, Instant};

use serde_json::Value;

use docstore_core::metadata;
use docstore_core::{
    DocStoreError, DocStoreResult, Document, IndexQuery, JsonDocument, QueryResult,
};

use crate::entity::Tracked;
use crate::session::DocumentSession;

/// One logical query, across however many polls it takes
pub(crate) struct QueryOperation {
    index_name: String,
    query: IndexQuery,
    includes: Vec<String>,
    wait_for_non_stale_results: bool,
    timeout: Duration,
    no_tracking: bool,
    started: Option<Instant>,
}

/// `__document_id:<value>` with nothing else, the shape of a load in disguise
fn id_only_clause(query: &str) -> Option<&str> {
    let rest = query.trim().strip_prefix("__document_id")?;
    let value = rest.trim_start().strip_prefix(':')?.trim();
    let allowed = |c: char| c.is_alphanumeric() || "_-/\\.".contains(c);
    if !value.is_empty() && value.chars().all(allowed) {
        Some(value)
    } else {
        None
    }
}

impl QueryOperation {
    pub fn new(
        session: &DocumentSession,
        index_name: String,
        query: IndexQuery,
        includes: Vec<String>,
        wait_for_non_stale_results: bool,
        timeout: Duration,
        no_tracking: bool,
    ) -> DocStoreResult<Self> {
        let operation = QueryOperation {
            index_name,
            query,
            includes,
            wait_for_non_stale_results,
            timeout,
            no_tracking,
            started: None,
        };
        operation.assert_not_query_by_id(session)?;
        Ok(operation)
    }

    fn assert_not_query_by_id(&self, session: &DocumentSession) -> DocStoreResult<()> {
        let dynamic = self.index_name.eq_ignore_ascii_case("dynamic")
            || self.index_name.to_lowercase().starts_with("dynamic/");
        if !dynamic || session.conventions().allow_queries_on_id {
            return Ok(());
        }
        match id_only_clause(&self.query.query) {
            Some(id) => Err(DocStoreError::invalid_operation(format!(
                "querying by id only is blocked, load '{}' instead \
                 (allow_queries_on_id turns this check off)",
                id
            ))),
            None => Ok(()),
        }
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn index_query(&self) -> &IndexQuery {
        &self.query
    }

    pub fn includes(&self) -> &[String] {
        &self.includes
    }

    /// Start the timeout clocks on the first issuance
    pub fn enter(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
            tracing::debug!(
                target: "docstore::query",
                index = %self.index_name,
                query = %self.query.query,
                "Executing query"
            );
        }
    }

    fn elapsed(&self) -> Duration {
        self.started.map(|s| s.elapsed()).unwrap_or_default()
    }

    /// Whether `result` can be returned, or the query must be sent again
    ///
    /// Fails once the relevant timeout has passed instead of asking for
    /// another retry.
    pub fn is_acceptable(
        &self,
        session: &DocumentSession,
        result: &QueryResult,
    ) -> DocStoreResult<bool> {
        if !session.allow_non_authoritative_information() && result.non_authoritative_information
        {
            if self.elapsed() > session.non_authoritative_information_timeout() {
                return Err(DocStoreError::NonAuthoritativeInformation {
                    key: self.index_name.clone(),
                });
            }
            tracing::debug!(
                target: "docstore::query",
                index = %self.index_name,
                index_etag = ?result.index_etag,
                "Non authoritative query results, query will be retried"
            );
            return Ok(false);
        }

        if self.wait_for_non_stale_results && result.is_stale {
            let waited = self.elapsed();
            if waited > self.timeout {
                tracing::warn!(
                    target: "docstore::query",
                    index = %self.index_name,
                    waited_ms = waited.as_millis() as u64,
                    "Gave up waiting for non stale results"
                );
                return Err(DocStoreError::StalenessTimeout {
                    index: self.index_name.clone(),
                    waited,
                });
            }
            tracing::debug!(
                target: "docstore::query",
                index = %self.index_name,
                index_etag = ?result.index_etag,
                "Stale query results, query will be retried"
            );
            return Ok(false);
        }

        tracing::debug!(
            target: "docstore::query",
            index = %self.index_name,
            returned = result.results.len(),
            total = result.total_results,
            stale = result.is_stale,
            "Query returned results"
        );
        Ok(true)
    }

    /// Whether a non-authoritative failure while reading results may be
    /// answered by sending the whole query again
    pub fn should_query_again(&self, session: &DocumentSession, error: &DocStoreError) -> bool {
        matches!(error, DocStoreError::NonAuthoritativeInformation { .. })
            && self.elapsed() <= session.non_authoritative_information_timeout()
    }

    /// Fold an accepted result into the session and materialize entities
    pub fn complete<T: Document>(
        &self,
        session: &mut DocumentSession,
        result: &QueryResult,
    ) -> DocStoreResult<Vec<Tracked<T>>> {
        for include in &result.includes {
            let doc = JsonDocument::from_json(include.clone())?;
            if !doc.key.is_empty() {
                session.register_included(doc);
            }
        }

        let mut list = Vec::with_capacity(result.results.len());
        for value in &result.results {
            list.push(self.deserialize::<T>(session, value)?);
        }
        Ok(list)
    }

    fn deserialize<T: Document>(
        &self,
        session: &mut DocumentSession,
        value: &Value,
    ) -> DocStoreResult<Tracked<T>> {
        let has_id = value
            .get(metadata::METADATA)
            .and_then(|m| m.get(metadata::ID))
            .and_then(Value::as_str)
            .map_or(false, |id| !id.is_empty());

        if has_id {
            let doc = JsonDocument::from_json(value.clone())?;
            let key = doc.key.clone();
            return session
                .track_entity::<T>(doc, self.no_tracking)?
                .ok_or(DocStoreError::DocumentNotFound(key));
        }

        // projections carry no identity and are never tracked
        let mut body = value.clone();
        if let Value::Object(map) = &mut body {
            map.remove(metadata::METADATA);
        }
        Ok(Tracked::new(serde_json::from_value(body)?))
    }
}
