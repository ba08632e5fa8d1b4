//! Document session
//!
//! A session is a unit of work over one database. It keeps an identity map
//! (one instance per document key), detects changes by diffing each
//! entity's serialized form against the last acknowledged server state, and
//! writes everything in one batch on [`DocumentSession::save_changes`].
//!
//! # Ownership
//!
//! A session is single-owner and not `Send`: the identity map, the deferred
//! command list and the pending lazy operations are unsynchronized. Open one
//! session per unit of work from the shared [`DocumentStore`].
//!
//! # Request budget
//!
//! Every round trip the session makes on behalf of the application counts
//! against `max_requests_per_session`. Exceeding it fails the operation with
//! `RequestBudgetExceeded`. HiLo refills and in-operation retries do not
//! count.

use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::{Map, Value};
use uuid::Uuid;

use docstore_core::metadata::{self, Metadata};
use docstore_core::{
    CommandData, DatabaseCommands, DocStoreError, DocStoreResult, Document, DocumentConventions,
    Etag, JsonDocument,
};

use crate::entity::{extra_fields, materialize, with_extras, EntityId, Tracked};
use crate::lazy::LazyOperation;
use crate::operations::{LoadOperation, MultiLoadOperation};
use crate::store::DocumentStore;
use crate::tracking::{same_key, DocumentMetadata, IdentityMap, TrackedEntry};

/// Unit of work over one database
pub struct DocumentSession {
    id: Uuid,
    database: String,
    store: DocumentStore,
    commands: Arc<dyn DatabaseCommands>,
    pub(crate) map: IdentityMap,
    pub(crate) pending_lazy: Vec<Box<dyn LazyOperation>>,

    number_of_requests: usize,
    max_number_of_requests: usize,
    use_optimistic_concurrency: bool,
    allow_non_authoritative_information: bool,
    non_authoritative_information_timeout: Duration,
}

impl DocumentSession {
    pub(crate) fn new(store: DocumentStore, database: &str) -> Self {
        let id = Uuid::new_v4();
        let commands = store.commands().for_session(database, id);
        let config = store.config();
        let session = DocumentSession {
            id,
            database: database.to_string(),
            commands,
            map: IdentityMap::default(),
            pending_lazy: Vec::new(),
            number_of_requests: 0,
            max_number_of_requests: config.max_requests_per_session,
            use_optimistic_concurrency: config.use_optimistic_concurrency,
            allow_non_authoritative_information: config.allow_non_authoritative_information,
            non_authoritative_information_timeout: config.non_authoritative_information_timeout(),
            store,
        };
        tracing::debug!(
            target: "docstore::session",
            session = %session.id,
            database = %session.database,
            "Opened session"
        );
        session
    }

    // =========================================================================
    // Session properties
    // =========================================================================

    /// Session identifier, passed to the transport
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Database this session works on
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Store that opened this session
    pub fn document_store(&self) -> &DocumentStore {
        &self.store
    }

    /// Naming conventions of the store
    pub fn conventions(&self) -> &DocumentConventions {
        self.store.conventions()
    }

    pub(crate) fn commands(&self) -> &Arc<dyn DatabaseCommands> {
        &self.commands
    }

    /// Round trips made so far
    pub fn number_of_requests(&self) -> usize {
        self.number_of_requests
    }

    /// Cap on round trips
    pub fn max_number_of_requests(&self) -> usize {
        self.max_number_of_requests
    }

    /// Change the cap on round trips
    pub fn set_max_number_of_requests(&mut self, max: usize) {
        self.max_number_of_requests = max;
    }

    /// Whether puts and deletes carry etags
    pub fn use_optimistic_concurrency(&self) -> bool {
        self.use_optimistic_concurrency
    }

    /// Send etags with every put and delete
    pub fn set_use_optimistic_concurrency(&mut self, enabled: bool) {
        self.use_optimistic_concurrency = enabled;
    }

    /// Whether documents touched by uncommitted transactions are accepted
    pub fn allow_non_authoritative_information(&self) -> bool {
        self.allow_non_authoritative_information
    }

    /// Accept or reject non-authoritative documents
    pub fn set_allow_non_authoritative_information(&mut self, allow: bool) {
        self.allow_non_authoritative_information = allow;
    }

    /// How long loads and queries retry while getting non-authoritative data
    pub fn non_authoritative_information_timeout(&self) -> Duration {
        self.non_authoritative_information_timeout
    }

    /// Change the non-authoritative retry window
    pub fn set_non_authoritative_information_timeout(&mut self, timeout: Duration) {
        self.non_authoritative_information_timeout = timeout;
    }

    /// Number of tracked entities
    pub fn number_of_entities_in_unit_of_work(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn increment_request_count(&mut self) -> DocStoreResult<()> {
        self.number_of_requests += 1;
        if self.number_of_requests > self.max_number_of_requests {
            return Err(DocStoreError::RequestBudgetExceeded {
                max: self.max_number_of_requests,
            });
        }
        Ok(())
    }

    pub(crate) fn retry_interval(&self) -> Duration {
        self.store.config().staleness_poll_interval()
    }

    // =========================================================================
    // Store
    // =========================================================================

    /// Track `entity` for insertion or update
    ///
    /// An entity without an identifier gets a HiLo key and is written with
    /// a "must not exist" check. Storing an already tracked entity again
    /// only resets its concurrency controls.
    pub fn store<T: Document>(&mut self, entity: &Tracked<T>) -> DocStoreResult<()> {
        let has_id = entity.borrow().id().map_or(false, |id| !id.is_empty());
        self.store_internal(entity, None, None, !has_id)
    }

    /// Track `entity` and check `etag` when it is written
    pub fn store_with_etag<T: Document>(
        &mut self,
        entity: &Tracked<T>,
        etag: Etag,
    ) -> DocStoreResult<()> {
        self.store_internal(entity, Some(etag), None, true)
    }

    /// Track `entity` under `id`, overwriting whatever the server holds
    pub fn store_with_id<T: Document>(&mut self, entity: &Tracked<T>, id: &str) -> DocStoreResult<()> {
        self.store_internal(entity, None, Some(id), false)
    }

    /// Track `entity` under `id` and check `etag` when it is written
    pub fn store_with_etag_and_id<T: Document>(
        &mut self,
        entity: &Tracked<T>,
        etag: Etag,
        id: &str,
    ) -> DocStoreResult<()> {
        self.store_internal(entity, Some(etag), Some(id), true)
    }

    fn store_internal<T: Document>(
        &mut self,
        entity: &Tracked<T>,
        etag: Option<Etag>,
        id: Option<&str>,
        force_concurrency_check: bool,
    ) -> DocStoreResult<()> {
        let eid = entity.entity_id();
        if let Some(entry) = self.map.get_mut(eid) {
            if etag.is_some() {
                entry.meta.etag = etag;
            }
            entry.meta.force_concurrency_check = force_concurrency_check;
            return Ok(());
        }

        let own_id = entity
            .borrow()
            .id()
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        let key = match (id, own_id) {
            (Some(id), _) => id.to_string(),
            (None, Some(own)) => own,
            (None, None) => self.store.generate_document_key(
                &self.database,
                self.commands.as_ref(),
                &T::type_tag(),
            )?,
        };

        if self.map.has_deferred_delete(&key) {
            return Err(DocStoreError::invalid_operation(format!(
                "can't store '{}': it was deleted in this session",
                key
            )));
        }
        self.assert_no_non_unique_instance(eid, &key)?;

        entity.borrow_mut().set_id(&key);

        let mut meta = Metadata::new();
        meta.insert(metadata::ENTITY_NAME.to_string(), Value::String(T::type_tag()));

        self.map.forget_missing(&key);
        tracing::debug!(target: "docstore::session", key = %key, "Storing entity");
        self.map.insert(
            eid,
            entity.erased(),
            DocumentMetadata {
                key,
                etag,
                metadata: meta,
                original_metadata: Metadata::new(),
                original_value: Map::new(),
                force_concurrency_check,
            },
            Map::new(),
        );
        Ok(())
    }

    fn assert_no_non_unique_instance(&self, eid: EntityId, key: &str) -> DocStoreResult<()> {
        if self.conventions().is_server_generated_key(key) {
            return Ok(());
        }
        match self.map.find_by_key(key) {
            Some(other) if other != eid => Err(DocStoreError::IdentifierCollision {
                key: key.to_string(),
            }),
            _ => Ok(()),
        }
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Delete a tracked entity on the next save
    pub fn delete<T: Document>(&mut self, entity: &Tracked<T>) -> DocStoreResult<()> {
        let eid = entity.entity_id();
        let entry = self.map.get(eid).ok_or_else(|| {
            DocStoreError::unknown_entity(format!(
                "{} is not associated with the session, cannot delete unknown entity instance",
                std::any::type_name::<T>()
            ))
        })?;
        if metadata::is_read_only(&entry.meta.original_metadata) {
            return Err(DocStoreError::invalid_operation(format!(
                "'{}' is marked as read only and cannot be deleted",
                entry.meta.key
            )));
        }
        let key = entry.meta.key.clone();
        self.map.mark_deleted(eid);
        self.map.register_missing(&key);
        Ok(())
    }

    /// Delete a document by key on the next save
    ///
    /// A tracked entity for the key is detached, unless it has unsaved
    /// changes: those must go through [`DocumentSession::delete`].
    pub fn delete_by_key(&mut self, key: &str) -> DocStoreResult<()> {
        if let Some(eid) = self.map.find_by_key(key) {
            if let Some(entry) = self.map.get(eid) {
                if self.entity_changed(entry)? {
                    return Err(DocStoreError::invalid_operation(format!(
                        "can't delete changed entity '{}' using its identifier, delete the entity instead",
                        key
                    )));
                }
            }
            self.map.remove(eid);
        }
        self.map.register_missing(key);
        self.map.defer(CommandData::delete(key, None));
        Ok(())
    }

    // =========================================================================
    // Change tracking
    // =========================================================================

    pub(crate) fn entity_changed(&self, entry: &TrackedEntry) -> DocStoreResult<bool> {
        if let Some(id) = entry.entity.document_id() {
            if !same_key(&id, &entry.meta.key) {
                return Ok(true);
            }
        }
        if metadata::is_read_only(&entry.meta.original_metadata)
            && metadata::is_read_only(&entry.meta.metadata)
        {
            return Ok(false);
        }
        let current = with_extras(entry.entity.to_json()?, &entry.extras);
        Ok(current != entry.meta.original_value
            || entry.meta.metadata != entry.meta.original_metadata)
    }

    /// Whether `entity` differs from its last acknowledged state
    ///
    /// Untracked entities report `false`.
    pub fn has_changed<T: Document>(&self, entity: &Tracked<T>) -> DocStoreResult<bool> {
        match self.map.get(entity.entity_id()) {
            Some(entry) => self.entity_changed(entry),
            None => Ok(false),
        }
    }

    /// Whether the next save would write anything
    pub fn has_changes(&self) -> DocStoreResult<bool> {
        if !self.map.deleted().is_empty() || !self.map.deferred().is_empty() {
            return Ok(true);
        }
        for (_, entry) in self.map.ordered() {
            if self.entity_changed(entry)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Stop tracking `entity` without deleting it
    pub fn evict<T: Document>(&mut self, entity: &Tracked<T>) {
        self.map.remove(entity.entity_id());
    }

    /// Stop tracking everything; deferred commands stay queued
    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Queue raw commands for the next save, ahead of entity changes
    pub fn defer(&mut self, commands: impl IntoIterator<Item = CommandData>) {
        for command in commands {
            self.map.defer(command);
        }
    }

    // =========================================================================
    // Metadata access
    // =========================================================================

    fn entry_for<T: Document>(&self, entity: &Tracked<T>) -> DocStoreResult<&TrackedEntry> {
        self.map.get(entity.entity_id()).ok_or_else(|| {
            DocStoreError::unknown_entity(format!(
                "{} is not associated with the session",
                std::any::type_name::<T>()
            ))
        })
    }

    /// Etag of `entity` as last acknowledged
    pub fn get_etag_for<T: Document>(&self, entity: &Tracked<T>) -> DocStoreResult<Option<Etag>> {
        Ok(self.entry_for(entity)?.meta.etag)
    }

    /// Metadata of `entity`
    pub fn get_metadata_for<T: Document>(&self, entity: &Tracked<T>) -> DocStoreResult<Metadata> {
        Ok(self.entry_for(entity)?.meta.metadata.clone())
    }

    /// Mutable metadata of `entity`; changes are written on the next save
    pub fn metadata_for_mut<T: Document>(
        &mut self,
        entity: &Tracked<T>,
    ) -> DocStoreResult<&mut Metadata> {
        let eid = entity.entity_id();
        match self.map.get_mut(eid) {
            Some(entry) => Ok(&mut entry.meta.metadata),
            None => Err(DocStoreError::unknown_entity(format!(
                "{} is not associated with the session",
                std::any::type_name::<T>()
            ))),
        }
    }

    /// Tracking state of `entity`
    pub fn document_metadata<T: Document>(
        &self,
        entity: &Tracked<T>,
    ) -> DocStoreResult<DocumentMetadata> {
        Ok(self.entry_for(entity)?.meta.clone())
    }

    /// Key `entity` is tracked under
    pub fn get_document_id<T: Document>(&self, entity: &Tracked<T>) -> Option<String> {
        self.map
            .get(entity.entity_id())
            .map(|entry| entry.meta.key.clone())
    }

    /// Whether `key` is tracked or was included by an earlier round trip
    pub fn is_loaded(&self, key: &str) -> bool {
        self.map.find_by_key(key).is_some() || self.map.is_included(key)
    }

    /// Whether `key` is deleted in this session or known to be missing
    pub fn is_deleted(&self, key: &str) -> bool {
        self.map.is_known_missing(key)
    }

    /// Exclude `entity` from change tracking from now on
    ///
    /// The marker itself is written on the next save.
    pub fn mark_read_only<T: Document>(&mut self, entity: &Tracked<T>) -> DocStoreResult<()> {
        self.metadata_for_mut(entity)?
            .insert(metadata::READ_ONLY.to_string(), Value::Bool(true));
        Ok(())
    }

    /// Ask the server to create a revision when `entity` is next saved
    pub fn explicitly_version<T: Document>(&mut self, entity: &Tracked<T>) -> DocStoreResult<()> {
        self.metadata_for_mut(entity)?
            .insert(metadata::CREATE_VERSION.to_string(), Value::Bool(true));
        Ok(())
    }

    // =========================================================================
    // Tracking loaded documents
    // =========================================================================

    fn existing<T: Document>(&self, eid: EntityId, key: &str) -> DocStoreResult<Tracked<T>> {
        let entry = self
            .map
            .get(eid)
            .ok_or_else(|| DocStoreError::unknown_entity(key.to_string()))?;
        Tracked::from_erased(Rc::clone(&entry.entity)).ok_or_else(|| {
            DocStoreError::invalid_operation(format!(
                "'{}' is already loaded as {}, not {}",
                key,
                entry.entity.type_name(),
                std::any::type_name::<T>()
            ))
        })
    }

    /// Materialize `doc` and add it to the identity map
    ///
    /// Returns the already tracked instance when the key is known. A
    /// "does not exist" marker yields `None`.
    pub(crate) fn track_entity<T: Document>(
        &mut self,
        doc: JsonDocument,
        no_tracking: bool,
    ) -> DocStoreResult<Option<Tracked<T>>> {
        if doc.non_authoritative_information && !self.allow_non_authoritative_information {
            return Err(DocStoreError::NonAuthoritativeInformation { key: doc.key });
        }
        if metadata::does_not_exist(&doc.metadata) {
            return Ok(None);
        }

        let mut meta = doc.metadata;
        if let Some(etag) = doc.etag {
            meta.insert(metadata::ETAG.to_string(), Value::String(etag.to_string()));
        }
        if let Some(ts) = doc.last_modified {
            meta.insert(metadata::LAST_MODIFIED.to_string(), Value::String(ts.to_rfc3339()));
        }
        metadata::ensure_not_read_vetoed(&doc.key, &meta)?;

        if let Some(eid) = self.map.find_by_key(&doc.key) {
            return self.existing::<T>(eid, &doc.key).map(Some);
        }

        let tracked = Tracked::new(materialize::<T>(&doc.key, &doc.data)?);
        if no_tracking {
            return Ok(Some(tracked));
        }

        let serialized = tracked.erased().to_json()?;
        let extras = extra_fields(&doc.data, &serialized);
        let original_value = with_extras(serialized, &extras);

        self.map.forget_missing(&doc.key);
        self.map.take_included(&doc.key);
        self.map.insert(
            tracked.entity_id(),
            tracked.erased(),
            DocumentMetadata {
                key: doc.key,
                etag: doc.etag,
                original_metadata: meta.clone(),
                metadata: meta,
                original_value,
                force_concurrency_check: false,
            },
            extras,
        );
        Ok(Some(tracked))
    }

    /// Remember a document fetched alongside a load or query
    pub(crate) fn register_included(&mut self, doc: JsonDocument) {
        if self.map.find_by_key(&doc.key).is_none() {
            self.map.include(doc);
        }
    }

    pub(crate) fn register_missing(&mut self, key: &str) {
        self.map.register_missing(key);
    }

    /// Answer a load from session state alone
    ///
    /// `Some(None)` means "known missing", `None` means a round trip is needed.
    pub(crate) fn load_from_session<T: Document>(
        &mut self,
        key: &str,
    ) -> DocStoreResult<Option<Option<Tracked<T>>>> {
        if self.map.is_known_missing(key) {
            return Ok(Some(None));
        }
        if let Some(eid) = self.map.find_by_key(key) {
            return self.existing::<T>(eid, key).map(|t| Some(Some(t)));
        }
        if let Some(doc) = self.map.take_included(key) {
            return self.track_entity::<T>(doc, false).map(Some);
        }
        Ok(None)
    }

    // =========================================================================
    // Load
    // =========================================================================

    /// Load the document with `key`
    ///
    /// Known-missing keys and tracked entities are answered without a round
    /// trip. A missing document yields `None` and is remembered as missing.
    pub fn load<T: Document>(&mut self, key: &str) -> DocStoreResult<Option<Tracked<T>>> {
        if let Some(answer) = self.load_from_session::<T>(key)? {
            return Ok(answer);
        }

        self.increment_request_count()?;
        let mut operation = LoadOperation::new(key);
        loop {
            operation.enter();
            tracing::debug!(
                target: "docstore::session",
                key = %key,
                database = %self.database,
                "Loading document"
            );
            let doc = self.commands.get(key)?;
            if operation.needs_retry(self, doc.as_ref()) {
                thread::sleep(self.retry_interval());
                continue;
            }
            return operation.complete(self, doc);
        }
    }

    /// Load several documents in one round trip
    ///
    /// Only keys that are neither tracked nor known missing are fetched.
    /// Results line up with `keys`.
    pub fn load_many<T: Document, K: AsRef<str>>(
        &mut self,
        keys: &[K],
    ) -> DocStoreResult<Vec<Option<Tracked<T>>>> {
        let mut to_fetch: Vec<String> = Vec::new();
        for key in keys {
            let key = key.as_ref();
            let known = self.map.is_known_missing(key)
                || self.map.find_by_key(key).is_some()
                || self.map.is_included(key);
            if !known && !to_fetch.iter().any(|k| same_key(k, key)) {
                to_fetch.push(key.to_string());
            }
        }

        if !to_fetch.is_empty() {
            self.increment_request_count()?;
            let mut operation = MultiLoadOperation::new(to_fetch.clone(), Vec::new());
            loop {
                operation.enter();
                tracing::debug!(
                    target: "docstore::session",
                    keys = %to_fetch.join(", "),
                    database = %self.database,
                    "Bulk loading documents"
                );
                let result = self.commands.get_many(&to_fetch, &[])?;
                if operation.needs_retry(self, &result) {
                    thread::sleep(self.retry_interval());
                    continue;
                }
                operation.complete::<T>(self, result)?;
                break;
            }
        }

        keys.iter()
            .map(|key| Ok(self.load_from_session::<T>(key.as_ref())?.flatten()))
            .collect()
    }

    /// Re-read `entity` from the server, discarding local changes
    pub fn refresh<T: Document>(&mut self, entity: &Tracked<T>) -> DocStoreResult<()> {
        let eid = entity.entity_id();
        let key = match self.map.get(eid) {
            Some(entry) => entry.meta.key.clone(),
            None => {
                return Err(DocStoreError::unknown_entity(
                    "cannot refresh a transient instance",
                ))
            }
        };

        self.increment_request_count()?;
        let doc = self
            .commands
            .get(&key)?
            .ok_or_else(|| DocStoreError::DocumentNotFound(key.clone()))?;

        let mut meta = doc.metadata;
        if let Some(etag) = doc.etag {
            meta.insert(metadata::ETAG.to_string(), Value::String(etag.to_string()));
        }
        if let Some(ts) = doc.last_modified {
            meta.insert(metadata::LAST_MODIFIED.to_string(), Value::String(ts.to_rfc3339()));
        }
        metadata::ensure_not_read_vetoed(&key, &meta)?;

        entity.erased().replace_from_json(&key, &doc.data)?;
        let serialized = entity.erased().to_json()?;
        let extras = extra_fields(&doc.data, &serialized);

        if let Some(entry) = self.map.get_mut(eid) {
            entry.meta.etag = doc.etag;
            entry.meta.original_metadata = meta.clone();
            entry.meta.metadata = meta;
            entry.meta.original_value = with_extras(serialized, &extras);
            entry.extras = extras;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DocumentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSession")
            .field("id", &self.id)
            .field("database", &self.database)
            .field("entities", &self.map.len())
            .field("number_of_requests", &self.number_of_requests)
            .finish()
    }
}
