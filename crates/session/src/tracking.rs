//! Identity map and change tracking state
//!
//! Two co-maintained structures:
//!
//! - `entries`: entity identity → [`TrackedEntry`] (the entity plus its
//!   [`DocumentMetadata`])
//! - `by_key`: case-folded document key → entity identity
//!
//! Every entry is mirrored in `by_key` and vice versa; all mutation goes
//! through [`IdentityMap`] methods that keep the two in step.
//!
//! The remaining per-session sets live next to them: entities pending
//! deletion, keys known to be missing on the server, deferred raw commands
//! and included documents fetched alongside a load or query.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use serde_json::{Map, Value};

use docstore_core::{CommandData, Etag, JsonDocument, Metadata};

use crate::entity::{EntityId, ErasedEntity};

/// Last acknowledged server state of a tracked entity
///
/// `original_value` and `original_metadata` are replaced wholesale after
/// every successful round trip and never edited in place.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentMetadata {
    /// Document key
    pub key: String,
    /// Etag the server last reported
    pub etag: Option<Etag>,
    /// Metadata the next put will send
    pub metadata: Metadata,
    /// Metadata as last acknowledged
    pub original_metadata: Metadata,
    /// Body as last acknowledged
    pub original_value: Map<String, Value>,
    /// Send an etag with the next write regardless of the session policy
    pub force_concurrency_check: bool,
}

pub(crate) struct TrackedEntry {
    pub entity: Rc<dyn ErasedEntity>,
    pub meta: DocumentMetadata,
    /// Stored fields the entity type does not serialize
    pub extras: Map<String, Value>,
    /// Insertion order, used to emit puts deterministically
    pub seq: u64,
}

fn fold(key: &str) -> String {
    key.to_lowercase()
}

/// Whether two document keys name the same document
pub(crate) fn same_key(a: &str, b: &str) -> bool {
    a == b || fold(a) == fold(b)
}

#[derive(Default)]
pub(crate) struct IdentityMap {
    entries: HashMap<EntityId, TrackedEntry>,
    by_key: HashMap<String, EntityId>,
    next_seq: u64,

    deleted: Vec<EntityId>,
    known_missing: HashSet<String>,
    deferred: Vec<CommandData>,
    included: HashMap<String, JsonDocument>,
}

impl IdentityMap {
    // =========================================================================
    // Entities
    // =========================================================================

    pub fn insert(
        &mut self,
        id: EntityId,
        entity: Rc<dyn ErasedEntity>,
        meta: DocumentMetadata,
        extras: Map<String, Value>,
    ) {
        self.by_key.insert(fold(&meta.key), id);
        self.next_seq += 1;
        self.entries.insert(
            id,
            TrackedEntry {
                entity,
                meta,
                extras,
                seq: self.next_seq,
            },
        );
    }

    pub fn get(&self, id: EntityId) -> Option<&TrackedEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut TrackedEntry> {
        self.entries.get_mut(&id)
    }

    pub fn find_by_key(&self, key: &str) -> Option<EntityId> {
        self.by_key.get(&fold(key)).copied()
    }

    /// Stop tracking an entity; drops any pending deletion of it
    pub fn remove(&mut self, id: EntityId) -> Option<TrackedEntry> {
        let entry = self.entries.remove(&id)?;
        let folded = fold(&entry.meta.key);
        if self.by_key.get(&folded) == Some(&id) {
            self.by_key.remove(&folded);
        }
        self.deleted.retain(|d| *d != id);
        Some(entry)
    }

    /// Move an entity to a new key
    pub fn rekey(&mut self, id: EntityId, new_key: &str) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        let old = fold(&entry.meta.key);
        if self.by_key.get(&old) == Some(&id) {
            self.by_key.remove(&old);
        }
        entry.meta.key = new_key.to_string();
        self.by_key.insert(fold(new_key), id);
    }

    /// Entries in insertion order
    pub fn ordered(&self) -> Vec<(EntityId, &TrackedEntry)> {
        let mut all: Vec<_> = self.entries.iter().map(|(id, e)| (*id, e)).collect();
        all.sort_by_key(|(_, e)| e.seq);
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    // =========================================================================
    // Deletions and misses
    // =========================================================================

    pub fn mark_deleted(&mut self, id: EntityId) {
        if !self.deleted.contains(&id) {
            self.deleted.push(id);
        }
    }

    pub fn deleted(&self) -> &[EntityId] {
        &self.deleted
    }

    pub fn is_marked_deleted(&self, id: EntityId) -> bool {
        self.deleted.contains(&id)
    }

    pub fn register_missing(&mut self, key: &str) {
        self.known_missing.insert(fold(key));
    }

    pub fn forget_missing(&mut self, key: &str) {
        self.known_missing.remove(&fold(key));
    }

    pub fn is_known_missing(&self, key: &str) -> bool {
        self.known_missing.contains(&fold(key))
    }

    // =========================================================================
    // Deferred commands
    // =========================================================================

    pub fn defer(&mut self, command: CommandData) {
        self.deferred.push(command);
    }

    pub fn deferred(&self) -> &[CommandData] {
        &self.deferred
    }

    pub fn has_deferred_delete(&self, key: &str) -> bool {
        self.deferred
            .iter()
            .any(|c| c.is_delete() && same_key(c.key(), key))
    }

    // =========================================================================
    // Included documents
    // =========================================================================

    pub fn include(&mut self, doc: JsonDocument) {
        self.included.insert(fold(&doc.key), doc);
    }

    pub fn is_included(&self, key: &str) -> bool {
        self.included.contains_key(&fold(key))
    }

    pub fn take_included(&mut self, key: &str) -> Option<JsonDocument> {
        self.included.remove(&fold(key))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Forget everything a save acknowledged: deferred commands and deleted entities
    pub fn complete_save(&mut self) {
        self.deferred.clear();
        for id in std::mem::take(&mut self.deleted) {
            if let Some(entry) = self.entries.remove(&id) {
                let folded = fold(&entry.meta.key);
                if self.by_key.get(&folded) == Some(&id) {
                    self.by_key.remove(&folded);
                }
            }
        }
    }

    /// Drop all tracking state; deferred commands stay queued
    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_key.clear();
        self.deleted.clear();
        self.known_missing.clear();
        self.included.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Tracked;
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Item {
        id: Option<String>,
    }

    impl docstore_core::Document for Item {
        fn id(&self) -> Option<&str> {
            self.id.as_deref()
        }
        fn set_id(&mut self, id: &str) {
            self.id = Some(id.to_string());
        }
    }

    fn meta(key: &str) -> DocumentMetadata {
        DocumentMetadata {
            key: key.to_string(),
            etag: None,
            metadata: Metadata::new(),
            original_metadata: Metadata::new(),
            original_value: Map::new(),
            force_concurrency_check: false,
        }
    }

    fn track(map: &mut IdentityMap, key: &str) -> (Tracked<Item>, EntityId) {
        let item = Tracked::new(Item { id: None });
        let id = item.entity_id();
        map.insert(id, item.erased(), meta(key), Map::new());
        (item, id)
    }

    #[test]
    fn keys_are_case_insensitive() {
        let mut map = IdentityMap::default();
        let (_item, id) = track(&mut map, "Items/1");
        assert_eq!(map.find_by_key("items/1"), Some(id));
        assert_eq!(map.find_by_key("ITEMS/1"), Some(id));
    }

    #[test]
    fn remove_keeps_structures_mirrored() {
        let mut map = IdentityMap::default();
        let (_item, id) = track(&mut map, "items/1");
        map.mark_deleted(id);
        assert!(map.remove(id).is_some());
        assert_eq!(map.find_by_key("items/1"), None);
        assert!(map.deleted().is_empty());
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn rekey_moves_the_key_mapping() {
        let mut map = IdentityMap::default();
        let (_item, id) = track(&mut map, "items/");
        map.rekey(id, "items/7");
        assert_eq!(map.find_by_key("items/"), None);
        assert_eq!(map.find_by_key("items/7"), Some(id));
        assert_eq!(map.get(id).unwrap().meta.key, "items/7");
    }

    #[test]
    fn ordered_follows_insertion() {
        let mut map = IdentityMap::default();
        let (_a, a) = track(&mut map, "items/2");
        let (_b, b) = track(&mut map, "items/1");
        let order: Vec<_> = map.ordered().into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![a, b]);
    }

    #[test]
    fn complete_save_drops_deleted_and_deferred() {
        let mut map = IdentityMap::default();
        let (_a, a) = track(&mut map, "items/1");
        let (_b, b) = track(&mut map, "items/2");
        map.mark_deleted(a);
        map.defer(CommandData::delete("items/3", None));
        assert!(map.has_deferred_delete("ITEMS/3"));

        map.complete_save();
        assert!(map.get(a).is_none());
        assert!(map.get(b).is_some());
        assert!(map.deferred().is_empty());
    }

    #[test]
    fn clear_keeps_deferred_commands() {
        let mut map = IdentityMap::default();
        track(&mut map, "items/1");
        map.register_missing("items/9");
        map.defer(CommandData::delete("items/3", None));
        map.clear();
        assert_eq!(map.len(), 0);
        assert!(!map.is_known_missing("items/9"));
        assert_eq!(map.deferred().len(), 1);
    }

    #[test]
    fn deferred_deletes_fold_like_the_key_index() {
        let mut map = IdentityMap::default();
        map.defer(CommandData::delete("ÄRGER/1", None));
        assert!(map.has_deferred_delete("ärger/1"));
        assert!(map.has_deferred_delete("Ärger/1"));
        assert!(!map.has_deferred_delete("ärger/2"));
        assert!(same_key("ÄRGER/1", "ärger/1"));
    }

    #[derive(Debug, Clone)]
    enum Step {
        Insert,
        Remove(usize),
        Rekey(usize),
        Delete(usize),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            Just(Step::Insert),
            any::<usize>().prop_map(Step::Remove),
            any::<usize>().prop_map(Step::Rekey),
            any::<usize>().prop_map(Step::Delete),
        ]
    }

    proptest! {
        #[test]
        fn prop_key_index_mirrors_entries(steps in prop::collection::vec(step(), 1..40)) {
            let mut map = IdentityMap::default();
            let mut live: Vec<(Tracked<Item>, EntityId)> = Vec::new();

            for (n, step) in steps.into_iter().enumerate() {
                match step {
                    Step::Insert => live.push(track(&mut map, &format!("Items/{}", n))),
                    Step::Remove(i) if !live.is_empty() => {
                        let (_, id) = live.remove(i % live.len());
                        map.remove(id);
                    }
                    Step::Rekey(i) if !live.is_empty() => {
                        let id = live[i % live.len()].1;
                        map.rekey(id, &format!("moved/{}", n));
                    }
                    Step::Delete(i) if !live.is_empty() => {
                        map.mark_deleted(live[i % live.len()].1);
                    }
                    _ => {}
                }

                prop_assert_eq!(map.entries.len(), live.len());
                prop_assert_eq!(map.by_key.len(), live.len());
                for (_, id) in &live {
                    let key = map.get(*id).map(|e| e.meta.key.to_uppercase());
                    prop_assert!(key.is_some());
                    prop_assert_eq!(map.find_by_key(&key.unwrap_or_default()), Some(*id));
                }
                prop_assert!(map.deleted().iter().all(|d| map.get(*d).is_some()));
            }
        }
    }
}
