//! Naming conventions
//!
//! Conventions decide how entity types map to tags, how tags map to
//! document-key prefixes, and which index a dynamic query targets.

use std::any::TypeId;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::config::ClientConfig;

static TYPE_TAG_CACHE: Lazy<DashMap<TypeId, String>> = Lazy::new(DashMap::new);

/// Pluralized short type name, e.g. `Users` for `app::model::User`
///
/// Computed once per type and cached process-wide.
pub fn default_type_tag<T: 'static>() -> String {
    let id = TypeId::of::<T>();
    if let Some(tag) = TYPE_TAG_CACHE.get(&id) {
        return tag.clone();
    }
    let full = std::any::type_name::<T>();
    let without_generics = full.split('<').next().unwrap_or(full);
    let short = without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics);
    let tag = pluralize(short);
    TYPE_TAG_CACHE.insert(id, tag.clone());
    tag
}

/// English plural of a type name
pub fn pluralize(word: &str) -> String {
    if word.is_empty() {
        return String::new();
    }
    let lower = word.to_ascii_lowercase();
    if lower.ends_with('y') {
        let before = lower.chars().rev().nth(1);
        if matches!(before, Some(c) if !"aeiou".contains(c)) {
            return format!("{}ies", &word[..word.len() - 1]);
        }
    }
    if ["s", "x", "z", "ch", "sh"].iter().any(|s| lower.ends_with(s)) {
        return format!("{}es", word);
    }
    format!("{}s", word)
}

/// Naming rules shared by a store and its sessions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentConventions {
    /// Separator between key parts, `/` by default
    pub identity_parts_separator: String,
    /// Allow `__document_id` clauses on dynamic indexes
    pub allow_queries_on_id: bool,
}

impl Default for DocumentConventions {
    fn default() -> Self {
        DocumentConventions {
            identity_parts_separator: "/".to_string(),
            allow_queries_on_id: false,
        }
    }
}

impl DocumentConventions {
    /// Conventions derived from a client configuration
    pub fn from_config(config: &ClientConfig) -> Self {
        DocumentConventions {
            identity_parts_separator: config.identity_parts_separator.clone(),
            allow_queries_on_id: config.allow_queries_on_id,
        }
    }

    /// Key prefix for a tag: lower-cased when it has at most one capital
    ///
    /// `Users` becomes `users`, `OrderLines` stays `OrderLines`.
    pub fn document_key_prefix(&self, tag: &str) -> String {
        let capitals = tag.chars().filter(|c| c.is_uppercase()).count();
        if capitals <= 1 {
            tag.to_lowercase()
        } else {
            tag.to_string()
        }
    }

    /// Full key from a tag and a value part, e.g. `users/12`
    ///
    /// `tag` may already be a key prefix; prefixes map to themselves.
    pub fn full_document_key(&self, tag: &str, id: &str) -> String {
        format!(
            "{}{}{}",
            self.document_key_prefix(tag),
            self.identity_parts_separator,
            id
        )
    }

    /// Index name used by queries without an explicit index
    pub fn dynamic_index_name(&self, tag: &str) -> String {
        format!("dynamic/{}", tag)
    }

    /// True when the server should complete the key (trailing separator)
    pub fn is_server_generated_key(&self, key: &str) -> bool {
        key.ends_with(self.identity_parts_separator.as_str())
    }
}
