//! Lazy operation batching
//!
//! Loads and queries registered through [`DocumentSession::lazily`] or a
//! query's `lazily()` are not sent right away. The first time any
//! [`Lazy`] handle is observed, every pending operation of the session is
//! resolved together in one multi-get round trip.
//!
//! ## Resolution
//!
//! 1. One request per pending operation, sent as a single multi-get
//! 2. Any error response fails the whole batch
//! 3. If any operation asks for a retry (stale index, non-authoritative
//!    document), all of them are sent again after a short sleep
//! 4. Results are published and callbacks run, in registration order
//!
//! The whole resolution counts as one request against the session budget.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use docstore_core::{
    escape_data_string, DocStoreError, DocStoreResult, Document, GetRequest, GetResponse,
    JsonDocument, MultiLoadResult, QueryResult,
};

use crate::entity::Tracked;
use crate::operations::{LoadOperation, MultiLoadOperation, QueryOperation};
use crate::session::DocumentSession;

/// A deferred request and its response handler
pub(crate) trait LazyOperation {
    /// Sub-request to put in the next multi-get
    fn create_request(&self) -> GetRequest;

    /// Fold `response` into the session; `Ok(true)` asks for a retry
    fn handle_response(
        &mut self,
        session: &mut DocumentSession,
        response: &GetResponse,
    ) -> DocStoreResult<bool>;

    /// Hand the result to its [`Lazy`] handle and run the callback
    fn publish(&mut self);
}

type Callback<V> = Box<dyn FnOnce(&V)>;

// =============================================================================
// Handles
// =============================================================================

/// Value that becomes available once the session's pending batch runs
pub struct Lazy<V> {
    slot: Rc<RefCell<Option<V>>>,
}

impl<V> Clone for Lazy<V> {
    fn clone(&self) -> Self {
        Lazy {
            slot: Rc::clone(&self.slot),
        }
    }
}

impl<V> std::fmt::Debug for Lazy<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lazy")
            .field("value_created", &self.is_value_created())
            .finish()
    }
}

impl<V> Lazy<V> {
    /// Whether the value is already available
    pub fn is_value_created(&self) -> bool {
        self.slot.borrow().is_some()
    }
}

impl<V: Clone> Lazy<V> {
    fn pending() -> (Self, Rc<RefCell<Option<V>>>) {
        let slot = Rc::new(RefCell::new(None));
        (
            Lazy {
                slot: Rc::clone(&slot),
            },
            slot,
        )
    }

    fn ready(value: V) -> Self {
        Lazy {
            slot: Rc::new(RefCell::new(Some(value))),
        }
    }

    /// The value, resolving every pending lazy operation of `session` first
    /// if needed
    pub fn value(&self, session: &mut DocumentSession) -> DocStoreResult<V> {
        if !self.is_value_created() {
            session.execute_all_pending_lazy_operations()?;
        }
        self.slot.borrow().clone().ok_or_else(|| {
            DocStoreError::invalid_operation(
                "lazy value was not produced; it belongs to another session or its batch failed",
            )
        })
    }
}

/// Result slot shared between an operation and its handle
struct Resolution<V> {
    result: Option<V>,
    slot: Rc<RefCell<Option<V>>>,
    on_eval: Option<Callback<V>>,
}

impl<V: Clone> Resolution<V> {
    fn new(on_eval: Callback<V>) -> (Self, Lazy<V>) {
        let (lazy, slot) = Lazy::pending();
        (
            Resolution {
                result: None,
                slot,
                on_eval: Some(on_eval),
            },
            lazy,
        )
    }

    fn publish(&mut self) {
        let Some(value) = self.result.take() else {
            return;
        };
        if let Some(on_eval) = self.on_eval.take() {
            on_eval(&value);
        }
        *self.slot.borrow_mut() = Some(value);
    }
}

// =============================================================================
// Operations
// =============================================================================

struct LazyLoadOperation<T: Document> {
    load: LoadOperation,
    resolution: Resolution<Option<Tracked<T>>>,
}

impl<T: Document> LazyOperation for LazyLoadOperation<T> {
    fn create_request(&self) -> GetRequest {
        GetRequest::new(
            "/docs",
            Some(format!("id={}", escape_data_string(self.load.key()))),
        )
    }

    fn handle_response(
        &mut self,
        session: &mut DocumentSession,
        response: &GetResponse,
    ) -> DocStoreResult<bool> {
        self.load.enter();
        if response.status == 404 {
            self.resolution.result = Some(self.load.complete::<T>(session, None)?);
            return Ok(false);
        }

        let mut doc = JsonDocument::from_json(response.result.clone())?;
        if response.status == 203 {
            doc.non_authoritative_information = true;
        }
        if doc.key.is_empty() {
            doc.key = self.load.key().to_string();
        }
        if self.load.needs_retry(session, Some(&doc)) {
            return Ok(true);
        }
        self.resolution.result = Some(self.load.complete::<T>(session, Some(doc))?);
        Ok(false)
    }

    fn publish(&mut self) {
        self.resolution.publish();
    }
}

struct LazyMultiLoadOperation<T: Document, V> {
    load: MultiLoadOperation,
    project: fn(Vec<Option<Tracked<T>>>) -> V,
    resolution: Resolution<V>,
}

impl<T: Document, V: Clone + 'static> LazyOperation for LazyMultiLoadOperation<T, V> {
    fn create_request(&self) -> GetRequest {
        let query = self
            .load
            .keys()
            .iter()
            .map(|k| format!("id={}", escape_data_string(k)))
            .chain(
                self.load
                    .includes()
                    .iter()
                    .map(|i| format!("include={}", escape_data_string(i))),
            )
            .collect::<Vec<_>>()
            .join("&");
        GetRequest::new("/queries/", Some(query))
    }

    fn handle_response(
        &mut self,
        session: &mut DocumentSession,
        response: &GetResponse,
    ) -> DocStoreResult<bool> {
        self.load.enter();
        let result = MultiLoadResult::from_json(&response.result)?;
        if self.load.needs_retry(session, &result) {
            return Ok(true);
        }
        let list = self.load.complete::<T>(session, result)?;
        self.resolution.result = Some((self.project)(list));
        Ok(false)
    }

    fn publish(&mut self) {
        self.resolution.publish();
    }
}

/// What a lazy query produces from an accepted result
pub(crate) struct LazyQueryKind<T, V> {
    produce: fn(&mut DocumentSession, &QueryOperation, &QueryResult) -> DocStoreResult<V>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Document> LazyQueryKind<T, Vec<Tracked<T>>> {
    pub fn list() -> Self {
        LazyQueryKind {
            produce: |session, operation, result| operation.complete::<T>(session, result),
            _entity: PhantomData,
        }
    }
}

impl<T: Document> LazyQueryKind<T, usize> {
    pub fn count() -> Self {
        LazyQueryKind {
            produce: |_, _, result| Ok(result.total_results),
            _entity: PhantomData,
        }
    }
}

pub(crate) struct LazyQueryOperation<T: Document, V> {
    query: QueryOperation,
    kind: LazyQueryKind<T, V>,
    resolution: Resolution<V>,
}

impl<T: Document, V: Clone + 'static> LazyQueryOperation<T, V> {
    pub fn new(
        query: QueryOperation,
        kind: LazyQueryKind<T, V>,
        on_eval: Callback<V>,
    ) -> (Self, Lazy<V>) {
        let (resolution, lazy) = Resolution::new(on_eval);
        (
            LazyQueryOperation {
                query,
                kind,
                resolution,
            },
            lazy,
        )
    }
}

impl<T: Document, V: Clone + 'static> LazyOperation for LazyQueryOperation<T, V> {
    fn create_request(&self) -> GetRequest {
        let mut query = self
            .query
            .index_query()
            .to_query_string()
            .trim_start_matches('?')
            .to_string();
        for include in self.query.includes() {
            query.push_str("&include=");
            query.push_str(&escape_data_string(include));
        }
        GetRequest::new(format!("/indexes/{}", self.query.index_name()), Some(query))
    }

    fn handle_response(
        &mut self,
        session: &mut DocumentSession,
        response: &GetResponse,
    ) -> DocStoreResult<bool> {
        self.query.enter();
        if response.status == 404 {
            return Err(DocStoreError::invalid_operation(format!(
                "There is no index named: {}",
                self.query.index_name()
            )));
        }
        let result: QueryResult = serde_json::from_value(response.result.clone())?;
        if !self.query.is_acceptable(session, &result)? {
            return Ok(true);
        }
        match (self.kind.produce)(session, &self.query, &result) {
            Ok(value) => {
                self.resolution.result = Some(value);
                Ok(false)
            }
            Err(e) if self.query.should_query_again(session, &e) => Ok(true),
            Err(e) => Err(e),
        }
    }

    fn publish(&mut self) {
        self.resolution.publish();
    }
}

// =============================================================================
// Session API
// =============================================================================

/// Per-request timing of one lazy resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseTimeItem {
    /// Route and query string of the sub-request
    pub url: String,
    /// Server-side processing time
    pub duration: Duration,
}

/// Timing of one lazy resolution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseTimeInformation {
    /// Wall-clock time spent on the client, retries included
    pub total_client_duration: Duration,
    /// Server-side time per sub-request of the last round trip
    pub duration_breakdown: Vec<ResponseTimeItem>,
}

impl ResponseTimeInformation {
    /// Sum of the server-side durations
    pub fn total_server_duration(&self) -> Duration {
        self.duration_breakdown.iter().map(|i| i.duration).sum()
    }
}

/// Lazy variants of the session's load operations
pub struct LazySessionOperations<'s> {
    session: &'s mut DocumentSession,
    includes: Vec<String>,
}

impl<'s> LazySessionOperations<'s> {
    /// Also fetch documents referenced by `path`
    pub fn include(mut self, path: &str) -> Self {
        self.includes.push(path.to_string());
        self
    }

    /// Defer loading `key`
    pub fn load<T: Document>(self, key: &str) -> DocStoreResult<Lazy<Option<Tracked<T>>>> {
        self.load_with_callback(key, |_| {})
    }

    /// Defer loading `key` and run `on_eval` with the result
    ///
    /// A key the session can already answer resolves immediately, without
    /// a request, and runs `on_eval` right away.
    pub fn load_with_callback<T: Document>(
        self,
        key: &str,
        on_eval: impl FnOnce(&Option<Tracked<T>>) + 'static,
    ) -> DocStoreResult<Lazy<Option<Tracked<T>>>> {
        if !self.includes.is_empty() {
            // includes need the multi-load route
            let (resolution, lazy) = Resolution::<Option<Tracked<T>>>::new(Box::new(on_eval));
            self.session.add_lazy_operation(Box::new(LazyMultiLoadOperation::<T, _> {
                load: MultiLoadOperation::new(vec![key.to_string()], self.includes),
                project: |list: Vec<Option<Tracked<T>>>| list.into_iter().next().flatten(),
                resolution,
            }));
            return Ok(lazy);
        }

        if let Some(known) = self.session.load_from_session::<T>(key)? {
            on_eval(&known);
            return Ok(Lazy::ready(known));
        }
        let (resolution, lazy) = Resolution::<Option<Tracked<T>>>::new(Box::new(on_eval));
        self.session.add_lazy_operation(Box::new(LazyLoadOperation::<T> {
            load: LoadOperation::new(key),
            resolution,
        }));
        Ok(lazy)
    }

    /// Defer loading several keys in one sub-request
    pub fn load_many<T: Document, K: AsRef<str>>(
        self,
        keys: &[K],
    ) -> DocStoreResult<Lazy<Vec<Option<Tracked<T>>>>> {
        self.load_many_with_callback(keys, |_| {})
    }

    /// Defer loading several keys and run `on_eval` with the results
    ///
    /// When every key is already tracked or known missing the handle
    /// resolves immediately.
    pub fn load_many_with_callback<T: Document, K: AsRef<str>>(
        self,
        keys: &[K],
        on_eval: impl FnOnce(&Vec<Option<Tracked<T>>>) + 'static,
    ) -> DocStoreResult<Lazy<Vec<Option<Tracked<T>>>>> {
        let all_known = keys.iter().all(|k| {
            let k = k.as_ref();
            self.session.is_loaded(k) || self.session.is_deleted(k)
        });
        if all_known && self.includes.is_empty() {
            let list = self.session.load_many::<T, K>(keys)?;
            on_eval(&list);
            return Ok(Lazy::ready(list));
        }

        let keys = keys.iter().map(|k| k.as_ref().to_string()).collect();
        let (resolution, lazy) = Resolution::<Vec<Option<Tracked<T>>>>::new(Box::new(on_eval));
        self.session.add_lazy_operation(Box::new(LazyMultiLoadOperation::<T, _> {
            load: MultiLoadOperation::new(keys, self.includes),
            project: |list: Vec<Option<Tracked<T>>>| list,
            resolution,
        }));
        Ok(lazy)
    }
}

impl DocumentSession {
    /// Lazy variants of the load operations
    pub fn lazily(&mut self) -> LazySessionOperations<'_> {
        LazySessionOperations {
            session: self,
            includes: Vec::new(),
        }
    }

    /// Number of operations waiting for the next lazy resolution
    pub fn pending_lazy_operations(&self) -> usize {
        self.pending_lazy.len()
    }

    pub(crate) fn add_lazy_operation(&mut self, operation: Box<dyn LazyOperation>) {
        self.pending_lazy.push(operation);
        tracing::debug!(
            target: "docstore::lazy",
            session = %self.id(),
            pending = self.pending_lazy.len(),
            "Registered lazy operation"
        );
    }

    /// Resolve every pending lazy operation in one round trip
    ///
    /// The pending list is empty afterwards, whether or not resolution
    /// succeeded. With nothing pending no request is made.
    pub fn execute_all_pending_lazy_operations(
        &mut self,
    ) -> DocStoreResult<ResponseTimeInformation> {
        let mut pending = std::mem::take(&mut self.pending_lazy);
        if pending.is_empty() {
            return Ok(ResponseTimeInformation::default());
        }

        self.increment_request_count()?;
        let started = Instant::now();
        let retry_interval = self.document_store().config().lazy_retry_interval();

        let mut round_trips = 0usize;
        let breakdown = loop {
            round_trips += 1;
            let (retry, items) = self.execute_lazy_operations_single_step(&mut pending)?;
            if !retry {
                break items;
            }
            tracing::debug!(
                target: "docstore::lazy",
                session = %self.id(),
                round_trips,
                "Lazy operation asked for a retry, re-sending the batch"
            );
            thread::sleep(retry_interval);
        };

        for operation in &mut pending {
            operation.publish();
        }

        let info = ResponseTimeInformation {
            total_client_duration: started.elapsed(),
            duration_breakdown: breakdown,
        };
        tracing::debug!(
            target: "docstore::lazy",
            session = %self.id(),
            operations = pending.len(),
            round_trips,
            client_ms = info.total_client_duration.as_millis() as u64,
            "Lazy operations resolved"
        );
        Ok(info)
    }

    fn execute_lazy_operations_single_step(
        &mut self,
        pending: &mut [Box<dyn LazyOperation>],
    ) -> DocStoreResult<(bool, Vec<ResponseTimeItem>)> {
        let requests: Vec<GetRequest> = pending.iter().map(|op| op.create_request()).collect();
        let responses = self.commands().multi_get(&requests)?;
        if responses.len() != requests.len() {
            return Err(DocStoreError::Transport(format!(
                "multi-get returned {} responses for {} requests",
                responses.len(),
                requests.len()
            )));
        }

        if let Some((request, failed)) = requests
            .iter()
            .zip(&responses)
            .find(|(_, response)| response.request_has_errors())
        {
            tracing::warn!(
                target: "docstore::lazy",
                url = %request.url_and_query(),
                status = failed.status,
                "Lazy sub-request failed"
            );
            return Err(DocStoreError::Server {
                status: failed.status,
                message: format!(
                    "got an error from the server for {}: {}",
                    request.url_and_query(),
                    failed.result
                ),
            });
        }

        let mut retry = false;
        let mut items = Vec::with_capacity(responses.len());
        for ((operation, request), response) in pending.iter_mut().zip(&requests).zip(&responses) {
            items.push(ResponseTimeItem {
                url: request.url_and_query(),
                duration: Duration::from_millis(response.request_time_ms().unwrap_or(0)),
            });
            if operation.handle_response(self, response)? {
                retry = true;
            }
        }
        Ok((retry, items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Opaque;

    #[test]
    fn debug_reports_whether_the_value_exists() {
        let pending: Lazy<Opaque> = Lazy {
            slot: Rc::new(RefCell::new(None)),
        };
        assert_eq!(format!("{:?}", pending), "Lazy { value_created: false }");

        *pending.slot.borrow_mut() = Some(Opaque);
        assert!(pending.clone().is_value_created());
        assert_eq!(format!("{:?}", pending), "Lazy { value_created: true }");
    }
}
