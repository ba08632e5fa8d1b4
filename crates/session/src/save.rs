//! Save-changes transaction builder
//!
//! `save_changes` turns the session's pending work into one ordered write
//! batch: deferred commands first, then deletes of tracked entities, then
//! puts for every changed entity. The server applies the batch atomically.
//!
//! Building the batch reads session state but never writes it. Only once
//! the server has acknowledged every command are the results folded back:
//! keys and etags adopted, originals reset, deleted entities dropped and
//! deferred commands cleared. A failed save leaves the session exactly as
//! it was, so the caller can fix the cause and call `save_changes` again.
//!
//! Registered listeners run between the two steps, over the outgoing batch
//! only, so what they rewrite is sent but never folded into the session.

use docstore_core::metadata::{self, Metadata};
use docstore_core::{BatchResult, CommandData, DocStoreError, DocStoreResult, Etag};

use crate::entity::{with_extras, EntityId};
use crate::session::DocumentSession;
use crate::tracking::{same_key, TrackedEntry};

/// A batch ready to be sent, and what each put in it belongs to
pub(crate) struct SaveChangesData {
    pub commands: Vec<CommandData>,
    /// Number of deferred commands at the front of `commands`
    pub deferred_count: usize,
    /// Entities whose puts appear in `commands`, in the same order
    pub puts: Vec<EntityId>,
}

impl DocumentSession {
    /// Write every pending change in one atomic batch
    ///
    /// Nothing is sent when nothing changed. Concurrency conflicts surface
    /// as [`DocStoreError::ConcurrencyConflict`]; every other failure is
    /// wrapped as a transport error. Either way the session is unchanged.
    pub fn save_changes(&mut self) -> DocStoreResult<()> {
        let mut data = self.prepare_for_save_changes()?;
        if data.commands.is_empty() {
            return Ok(());
        }
        self.run_before_listeners(&mut data)?;

        self.increment_request_count()?;
        tracing::debug!(
            target: "docstore::save",
            session = %self.id(),
            database = %self.database(),
            commands = data.commands.len(),
            deferred = data.deferred_count,
            puts = data.puts.len(),
            "Saving changes"
        );

        let results = match self.commands().batch(&data.commands) {
            Ok(results) => results,
            Err(e @ DocStoreError::ConcurrencyConflict { .. }) => {
                tracing::debug!(target: "docstore::save", error = %e, "Save rejected");
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(target: "docstore::save", error = %e, "Save failed");
                return Err(DocStoreError::Transport(format!(
                    "unable to save changes: {}",
                    e
                )));
            }
        };

        self.update_batch_results(&data, &results)
    }

    /// Commands the next save would send, without touching session state
    pub(crate) fn prepare_for_save_changes(&self) -> DocStoreResult<SaveChangesData> {
        let mut commands: Vec<CommandData> = self.map.deferred().to_vec();
        let deferred_count = commands.len();

        for &eid in self.map.deleted() {
            let Some(entry) = self.map.get(eid) else {
                continue;
            };
            if metadata::is_read_only(&entry.meta.original_metadata) {
                continue;
            }
            let etag = if self.use_optimistic_concurrency() {
                entry.meta.etag
            } else {
                None
            };
            commands.push(CommandData::delete(entry.meta.key.clone(), etag));
        }

        let mut puts = Vec::new();
        for (eid, entry) in self.map.ordered() {
            if self.map.is_marked_deleted(eid) || !self.entity_changed(entry)? {
                continue;
            }
            commands.push(self.create_put(entry)?);
            puts.push(eid);
        }

        Ok(SaveChangesData {
            commands,
            deferred_count,
            puts,
        })
    }

    /// Let registered listeners see, and rewrite, the puts and tracked
    /// deletes of `data`
    fn run_before_listeners(&self, data: &mut SaveChangesData) -> DocStoreResult<()> {
        let listeners = self.document_store().listeners();
        if listeners.is_empty() {
            return Ok(());
        }
        let store_listeners = listeners.store_listeners();
        let delete_listeners = listeners.delete_listeners();

        let mut puts = data.puts.iter();
        for command in data.commands.iter_mut().skip(data.deferred_count) {
            match command {
                CommandData::Put(put) => {
                    let Some(entry) = puts.next().and_then(|&eid| self.map.get(eid)) else {
                        continue;
                    };
                    for listener in &store_listeners {
                        listener.before_store(
                            &put.key,
                            &mut put.document,
                            &mut put.metadata,
                            &entry.meta.original_value,
                        )?;
                    }
                }
                CommandData::Delete(delete) => {
                    let meta = self
                        .map
                        .find_by_key(&delete.key)
                        .and_then(|eid| self.map.get(eid))
                        .map(|entry| entry.meta.metadata.clone())
                        .unwrap_or_default();
                    for listener in &delete_listeners {
                        listener.before_delete(&delete.key, &meta)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn create_put(&self, entry: &TrackedEntry) -> DocStoreResult<CommandData> {
        let key = &entry.meta.key;
        if let Some(id) = entry.entity.document_id() {
            if !same_key(&id, key) && !self.conventions().is_server_generated_key(key) {
                return Err(DocStoreError::invalid_operation(format!(
                    "entity {} had document key '{}' but now has key property '{}'; \
                     changing the key of a stored entity is not supported, evict it and store a new one",
                    entry.entity.type_name(),
                    key,
                    id
                )));
            }
        }

        let etag = if self.use_optimistic_concurrency() || entry.meta.force_concurrency_check {
            Some(entry.meta.etag.unwrap_or_else(Etag::empty))
        } else {
            None
        };

        let mut meta: Metadata = entry.meta.metadata.clone();
        metadata::strip_reserved(&mut meta);
        let document = with_extras(entry.entity.to_json()?, &entry.extras);

        Ok(CommandData::put(key.clone(), etag, document, meta))
    }

    /// Fold acknowledged results back into the identity map
    fn update_batch_results(
        &mut self,
        data: &SaveChangesData,
        results: &[BatchResult],
    ) -> DocStoreResult<()> {
        let put_results = results
            .iter()
            .skip(data.deferred_count)
            .filter(|r| r.is_put());

        let store_listeners = self.document_store().listeners().store_listeners();
        for (&eid, result) in data.puts.iter().zip(put_results) {
            let Some(entry) = self.map.get(eid) else {
                continue;
            };
            if !same_key(&entry.meta.key, &result.key) {
                self.map.rekey(eid, &result.key);
            }

            let Some(entry) = self.map.get_mut(eid) else {
                continue;
            };
            entry.entity.set_document_id(&result.key);
            entry.meta.key = result.key.clone();
            entry.meta.etag = result.etag;
            entry.meta.metadata = result.metadata.clone();
            entry.meta.original_metadata = result.metadata.clone();
            entry.meta.original_value = with_extras(entry.entity.to_json()?, &entry.extras);
            for listener in &store_listeners {
                listener.after_store(&result.key, &result.metadata);
            }
        }

        // deferred puts count as writes too
        if let Some(etag) = results.iter().filter_map(|r| r.etag).max() {
            self.document_store().update_last_written_etag(etag);
        }

        self.map.complete_save();
        tracing::debug!(
            target: "docstore::save",
            session = %self.id(),
            results = results.len(),
            "Changes saved"
        );
        Ok(())
    }

    /// Commands the next [`save_changes`](Self::save_changes) would send
    ///
    /// Useful for inspection; the session is not modified.
    pub fn pending_commands(&self) -> DocStoreResult<Vec<CommandData>> {
        self.prepare_for_save_changes().map(|data| data.commands)
    }
}
