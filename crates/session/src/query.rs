//! Staleness-aware queries
//!
//! A query may carry a consistency cutoff: a timestamp, an etag, or "as of
//! the last write this store performed". Without one, whatever the index
//! returns is accepted. With one, the query is sent again every poll
//! interval until the index reports itself non-stale as of the cutoff, or
//! the timeout elapses and the call fails with `StalenessTimeout`.
//!
//! Only the first issuance counts against the session's request budget;
//! polls and non-authoritative re-issues belong to the same logical call.
//!
//! ```ignore
//! let active = session
//!     .query::<User>()
//!     .where_equals("active", true)
//!     .wait_for_non_stale_results_as_of_last_write()
//!     .to_list()?;
//! ```

use std::marker::PhantomData;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use docstore_core::{
    DocStoreError, DocStoreResult, Document, Etag, IndexQuery, QueryConsistency, QueryResult,
};

use crate::entity::Tracked;
use crate::lazy::{Lazy, LazyQueryKind, LazyQueryOperation};
use crate::operations::QueryOperation;
use crate::session::DocumentSession;

/// Query builder bound to a session
#[must_use = "a query does nothing until a terminal operation runs it"]
pub struct DocumentQuery<'s, T: Document> {
    session: &'s mut DocumentSession,
    index_name: String,
    clauses: Vec<String>,
    includes: Vec<String>,
    start: usize,
    page_size: Option<usize>,
    cutoff: Option<DateTime<Utc>>,
    cutoff_etag: Option<Etag>,
    wait_for_non_stale_results: bool,
    timeout: Duration,
    no_tracking: bool,
    _entity: PhantomData<fn() -> T>,
}

impl DocumentSession {
    /// Query the dynamic index of `T` (`dynamic/{tag}`)
    pub fn query<T: Document>(&mut self) -> DocumentQuery<'_, T> {
        let index = self.conventions().dynamic_index_name(&T::type_tag());
        DocumentQuery::new(self, index)
    }

    /// Query the named index
    pub fn query_index<T: Document>(&mut self, index_name: &str) -> DocumentQuery<'_, T> {
        DocumentQuery::new(self, index_name.to_string())
    }
}

fn clause_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl<'s, T: Document> DocumentQuery<'s, T> {
    fn new(session: &'s mut DocumentSession, index_name: String) -> Self {
        let config = session.document_store().config();
        let timeout = config.query_timeout();
        let default_consistency = config.default_query_consistency;
        let query = DocumentQuery {
            session,
            index_name,
            clauses: Vec::new(),
            includes: Vec::new(),
            start: 0,
            page_size: None,
            cutoff: None,
            cutoff_etag: None,
            wait_for_non_stale_results: false,
            timeout,
            no_tracking: false,
            _entity: PhantomData,
        };
        match default_consistency {
            QueryConsistency::None => query,
            QueryConsistency::WaitForLastWrite => query.wait_for_non_stale_results_as_of_last_write(),
        }
    }

    // =========================================================================
    // Filtering and paging
    // =========================================================================

    /// Match documents whose `field` equals `value`
    pub fn where_equals(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.clauses
            .push(format!("{}:{}", field, clause_value(&value.into())));
        self
    }

    /// Add a clause in the server's query syntax
    pub fn where_raw(mut self, clause: &str) -> Self {
        self.clauses.push(clause.to_string());
        self
    }

    /// Also fetch documents referenced by `path`
    pub fn include(mut self, path: &str) -> Self {
        self.includes.push(path.to_string());
        self
    }

    /// Skip the first `count` results
    pub fn skip(mut self, count: usize) -> Self {
        self.start = count;
        self
    }

    /// Return at most `count` results
    pub fn take(mut self, count: usize) -> Self {
        self.page_size = Some(count);
        self
    }

    /// Materialize results without tracking them
    pub fn no_tracking(mut self) -> Self {
        self.no_tracking = true;
        self
    }

    // =========================================================================
    // Consistency
    // =========================================================================

    /// Wait until the index has no pending work at all
    pub fn wait_for_non_stale_results(mut self) -> Self {
        self.wait_for_non_stale_results = true;
        self
    }

    /// Same as [`wait_for_non_stale_results`](Self::wait_for_non_stale_results) with a timeout
    pub fn wait_for_non_stale_results_with_timeout(mut self, timeout: Duration) -> Self {
        self.wait_for_non_stale_results = true;
        self.timeout = timeout;
        self
    }

    /// Wait until the index covers writes made up to `cutoff`
    pub fn wait_for_non_stale_results_as_of(mut self, cutoff: DateTime<Utc>) -> Self {
        self.wait_for_non_stale_results = true;
        self.cutoff = Some(cutoff);
        self
    }

    /// Wait until the index covers writes up to `etag`
    pub fn wait_for_non_stale_results_as_of_etag(mut self, etag: Etag) -> Self {
        self.wait_for_non_stale_results = true;
        self.cutoff_etag = Some(etag);
        self
    }

    /// Wait until the index covers writes made before this call
    pub fn wait_for_non_stale_results_as_of_now(self) -> Self {
        self.wait_for_non_stale_results_as_of(Utc::now())
    }

    /// Wait until the index covers the last write of this store
    ///
    /// With no write yet there is nothing to wait for.
    pub fn wait_for_non_stale_results_as_of_last_write(self) -> Self {
        let etag = self
            .session
            .document_store()
            .last_written_etag()
            .unwrap_or_else(Etag::empty);
        self.wait_for_non_stale_results_as_of_etag(etag)
    }

    /// Override the staleness timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    // =========================================================================
    // Execution
    // =========================================================================

    fn index_query(&self) -> IndexQuery {
        IndexQuery {
            query: self.clauses.join(" AND "),
            start: self.start,
            page_size: self.page_size,
            cutoff: self.cutoff,
            cutoff_etag: self.cutoff_etag,
        }
    }

    fn into_operation(self) -> DocStoreResult<(&'s mut DocumentSession, QueryOperation)> {
        let query = self.index_query();
        let operation = QueryOperation::new(
            self.session,
            self.index_name,
            query,
            self.includes,
            self.wait_for_non_stale_results,
            self.timeout,
            self.no_tracking,
        )?;
        Ok((self.session, operation))
    }

    fn execute(self) -> DocStoreResult<(Vec<Tracked<T>>, QueryResult)> {
        let (session, mut operation) = self.into_operation()?;
        session.increment_request_count()?;
        operation.enter();

        loop {
            let result = poll_until_acceptable(session, &operation)?;
            match operation.complete::<T>(session, &result) {
                Ok(list) => return Ok((list, result)),
                Err(e) if operation.should_query_again(session, &e) => {
                    // same logical query, not counted again
                    tracing::debug!(
                        target: "docstore::query",
                        index = %operation.index_name(),
                        "Re-issuing query after non authoritative result"
                    );
                    thread::sleep(session.document_store().config().staleness_poll_interval());
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// All results of the current page
    pub fn to_list(self) -> DocStoreResult<Vec<Tracked<T>>> {
        self.execute().map(|(list, _)| list)
    }

    /// Results together with the raw query statistics
    pub fn query_result(self) -> DocStoreResult<(Vec<Tracked<T>>, QueryResult)> {
        self.execute()
    }

    /// First result; fails when there is none
    pub fn first(self) -> DocStoreResult<Tracked<T>> {
        let index = self.index_name.clone();
        self.first_or_default()?.ok_or_else(|| {
            DocStoreError::invalid_operation(format!("query on '{}' returned no results", index))
        })
    }

    /// First result, if any
    pub fn first_or_default(self) -> DocStoreResult<Option<Tracked<T>>> {
        let list = self.take(1).to_list()?;
        Ok(list.into_iter().next())
    }

    /// The only result; fails on zero or several
    pub fn single(self) -> DocStoreResult<Tracked<T>> {
        let index = self.index_name.clone();
        self.single_or_default()?.ok_or_else(|| {
            DocStoreError::invalid_operation(format!("query on '{}' returned no results", index))
        })
    }

    /// The only result, if any; fails on several
    pub fn single_or_default(self) -> DocStoreResult<Option<Tracked<T>>> {
        let index = self.index_name.clone();
        let mut list = self.take(2).to_list()?;
        if list.len() > 1 {
            return Err(DocStoreError::invalid_operation(format!(
                "query on '{}' returned more than one result",
                index
            )));
        }
        Ok(list.pop())
    }

    /// Number of matches, without materializing any
    pub fn count(self) -> DocStoreResult<usize> {
        self.take(0).execute().map(|(_, result)| result.total_results)
    }

    /// Defer the query into the session's next lazy batch
    pub fn lazily(self) -> DocStoreResult<Lazy<Vec<Tracked<T>>>> {
        self.lazily_with_callback(|_| {})
    }

    /// Defer the query and run `on_eval` once its results are in
    pub fn lazily_with_callback(
        self,
        on_eval: impl FnOnce(&Vec<Tracked<T>>) + 'static,
    ) -> DocStoreResult<Lazy<Vec<Tracked<T>>>> {
        let (session, operation) = self.into_operation()?;
        let (op, lazy) = LazyQueryOperation::<T, Vec<Tracked<T>>>::new(
            operation,
            LazyQueryKind::list(),
            Box::new(on_eval),
        );
        session.add_lazy_operation(Box::new(op));
        Ok(lazy)
    }

    /// Defer a count of the matches into the session's next lazy batch
    pub fn count_lazily(self) -> DocStoreResult<Lazy<usize>> {
        let (session, operation) = self.take(0).into_operation()?;
        let (op, lazy) = LazyQueryOperation::<T, usize>::new(
            operation,
            LazyQueryKind::count(),
            Box::new(|_: &usize| {}),
        );
        session.add_lazy_operation(Box::new(op));
        Ok(lazy)
    }
}

/// Send the query until an answer is acceptable or a timeout fails it
fn poll_until_acceptable(
    session: &DocumentSession,
    operation: &QueryOperation,
) -> DocStoreResult<QueryResult> {
    let interval = session.document_store().config().staleness_poll_interval();
    loop {
        let result = session.commands().query(
            operation.index_name(),
            operation.index_query(),
            operation.includes(),
        )?;
        if operation.is_acceptable(session, &result)? {
            return Ok(result);
        }
        thread::sleep(interval);
    }
}
