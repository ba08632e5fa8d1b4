//! Per-database document storage
//!
//! Keys are compared case-insensitively and keep the casing of their first
//! write. Every write bumps a database-wide etag counter, so etags order
//! writes.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use docstore_core::metadata::{self, Metadata};
use docstore_core::{
    BatchResult, CommandData, DocStoreError, DocStoreResult, Etag, JsonDocument, PutResult,
};

use crate::index::IndexState;

/// A stored document
#[derive(Debug, Clone)]
pub(crate) struct StoredDocument {
    pub key: String,
    pub data: Map<String, Value>,
    pub metadata: Metadata,
    pub etag: Etag,
    pub last_modified: DateTime<Utc>,
    /// Reads left that report the document as non-authoritative
    pub non_authoritative_reads: usize,
}

impl StoredDocument {
    pub fn to_document(&self) -> JsonDocument {
        let mut meta = self.metadata.clone();
        meta.insert(metadata::ETAG.to_string(), Value::String(self.etag.to_string()));
        JsonDocument {
            key: self.key.clone(),
            data: self.data.clone(),
            metadata: meta,
            etag: Some(self.etag),
            last_modified: Some(self.last_modified),
            non_authoritative_information: self.non_authoritative_reads > 0,
        }
    }
}

/// A document with divergent replicated versions
#[derive(Debug, Clone)]
pub(crate) struct Conflict {
    pub version_ids: Vec<String>,
    pub etag: Etag,
}

/// All state of one database
#[derive(Debug, Default)]
pub(crate) struct DatabaseState {
    pub docs: BTreeMap<String, StoredDocument>,
    pub last_etag: u64,
    pub identities: HashMap<String, u64>,
    pub conflicts: HashMap<String, Conflict>,
    pub index: IndexState,
}

pub(crate) fn fold(key: &str) -> String {
    key.to_lowercase()
}

impl DatabaseState {
    fn next_etag(&mut self) -> Etag {
        self.last_etag += 1;
        Etag::new(0, self.last_etag)
    }

    pub fn current_etag(&self) -> Etag {
        Etag::new(0, self.last_etag)
    }

    pub fn find(&self, key: &str) -> Option<&StoredDocument> {
        self.docs.get(&fold(key))
    }

    /// Read a document, consuming one non-authoritative read if pending
    pub fn read(&mut self, key: &str) -> DocStoreResult<Option<JsonDocument>> {
        let folded = fold(key);
        if let Some(conflict) = self.conflicts.get(&folded) {
            return Err(DocStoreError::DocumentConflict {
                key: key.to_string(),
                conflicted_version_ids: conflict.version_ids.clone(),
                etag: conflict.etag,
            });
        }
        Ok(self.docs.get_mut(&folded).map(|doc| {
            let out = doc.to_document();
            doc.non_authoritative_reads = doc.non_authoritative_reads.saturating_sub(1);
            out
        }))
    }

    /// Documents referenced by `paths` of `doc`, skipping ones already seen
    pub fn includes_of(
        &mut self,
        doc: &JsonDocument,
        paths: &[String],
        out: &mut Vec<JsonDocument>,
    ) -> DocStoreResult<()> {
        for path in paths {
            let mut referenced = Vec::new();
            collect_strings(lookup_path(&doc.data, path), &mut referenced);
            for key in referenced {
                if out.iter().any(|d| d.key.eq_ignore_ascii_case(&key)) {
                    continue;
                }
                if let Some(found) = self.read(&key)? {
                    out.push(found);
                }
            }
        }
        Ok(())
    }

    fn check_etag(&self, key: &str, expected: Option<Etag>) -> DocStoreResult<()> {
        let Some(expected) = expected else {
            return Ok(());
        };
        let folded = fold(key);
        if let Some(conflict) = self.conflicts.get(&folded) {
            if conflict.etag == expected {
                return Ok(());
            }
            return Err(DocStoreError::ConcurrencyConflict {
                key: key.to_string(),
                expected: Some(expected),
                actual: Some(conflict.etag),
            });
        }
        let actual = self.docs.get(&folded).map(|d| d.etag);
        let ok = match actual {
            None => expected.is_empty(),
            Some(current) => current == expected,
        };
        if ok {
            Ok(())
        } else {
            Err(DocStoreError::ConcurrencyConflict {
                key: key.to_string(),
                expected: Some(expected),
                actual,
            })
        }
    }

    fn complete_key(&mut self, key: &str) -> String {
        if !key.ends_with('/') {
            return key.to_string();
        }
        let counter = self.identities.entry(fold(key)).or_insert(0);
        *counter += 1;
        format!("{}{}", key, counter)
    }

    /// Store a document after checking `expected`
    pub fn put(
        &mut self,
        key: &str,
        expected: Option<Etag>,
        data: Map<String, Value>,
        mut meta: Metadata,
    ) -> DocStoreResult<PutResult> {
        self.check_etag(key, expected)?;
        let key = self.complete_key(key);
        let folded = fold(&key);

        metadata::strip_reserved(&mut meta);
        let now = Utc::now();
        meta.insert(metadata::LAST_MODIFIED.to_string(), Value::String(now.to_rfc3339()));
        meta.insert(metadata::RAVEN_LAST_MODIFIED.to_string(), Value::String(now.to_rfc3339()));

        let etag = self.next_etag();
        let stored_key = self
            .docs
            .get(&folded)
            .map(|d| d.key.clone())
            .unwrap_or_else(|| key.clone());
        self.conflicts.remove(&folded);
        self.docs.insert(
            folded,
            StoredDocument {
                key: stored_key.clone(),
                data,
                metadata: meta,
                etag,
                last_modified: now,
                non_authoritative_reads: 0,
            },
        );
        self.index.on_write(etag, now);
        Ok(PutResult {
            key: stored_key,
            etag,
        })
    }

    /// Delete a document after checking `expected`; true if it existed
    pub fn delete(&mut self, key: &str, expected: Option<Etag>) -> DocStoreResult<bool> {
        self.check_etag(key, expected)?;
        let folded = fold(key);
        let existed = self.docs.remove(&folded).is_some() | self.conflicts.remove(&folded).is_some();
        if existed {
            let etag = self.next_etag();
            self.index.on_write(etag, Utc::now());
        }
        Ok(existed)
    }

    /// Apply `commands` all-or-nothing
    pub fn batch(&mut self, commands: &[CommandData]) -> DocStoreResult<Vec<BatchResult>> {
        let docs = self.docs.clone();
        let last_etag = self.last_etag;
        let identities = self.identities.clone();
        let conflicts = self.conflicts.clone();
        let index = self.index.clone();

        match self.apply_all(commands) {
            Ok(results) => Ok(results),
            Err(e) => {
                self.docs = docs;
                self.last_etag = last_etag;
                self.identities = identities;
                self.conflicts = conflicts;
                self.index = index;
                Err(e)
            }
        }
    }

    fn apply_all(&mut self, commands: &[CommandData]) -> DocStoreResult<Vec<BatchResult>> {
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            match command {
                CommandData::Put(put) => {
                    let stored = self.put(
                        &put.key,
                        put.etag,
                        put.document.clone(),
                        put.metadata.clone(),
                    )?;
                    let meta = self
                        .find(&stored.key)
                        .map(|d| d.metadata.clone())
                        .unwrap_or_default();
                    results.push(BatchResult {
                        method: "PUT".to_string(),
                        key: stored.key,
                        etag: Some(stored.etag),
                        metadata: meta,
                        deleted: None,
                    });
                }
                CommandData::Delete(delete) => {
                    let deleted = self.delete(&delete.key, delete.etag)?;
                    results.push(BatchResult {
                        method: "DELETE".to_string(),
                        key: delete.key.clone(),
                        etag: None,
                        metadata: Metadata::new(),
                        deleted: Some(deleted),
                    });
                }
            }
        }
        Ok(results)
    }

    /// Replace `key` with conflicting versions stored at `{key}/conflicts/{n}`
    pub fn create_conflict(&mut self, key: &str, versions: Vec<Map<String, Value>>) -> Etag {
        let mut ids = Vec::with_capacity(versions.len());
        for (i, data) in versions.into_iter().enumerate() {
            let id = format!("{}/conflicts/{}", key, i + 1);
            let etag = self.next_etag();
            let now = Utc::now();
            self.docs.insert(
                fold(&id),
                StoredDocument {
                    key: id.clone(),
                    data,
                    metadata: Metadata::new(),
                    etag,
                    last_modified: now,
                    non_authoritative_reads: 0,
                },
            );
            ids.push(id);
        }
        let etag = self.next_etag();
        let folded = fold(key);
        self.docs.remove(&folded);
        self.conflicts.insert(
            folded,
            Conflict {
                version_ids: ids,
                etag,
            },
        );
        etag
    }
}

/// Value at a dotted path such as `Address.City`
pub(crate) fn lookup_path<'a>(data: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = data.get(first)?;
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}

fn collect_strings(value: Option<&Value>, out: &mut Vec<String>) {
    match value {
        Some(Value::String(s)) => out.push(s.clone()),
        Some(Value::Array(items)) => {
            for item in items {
                collect_strings(Some(item), out);
            }
        }
        _ => {}
    }
}
