//! Generators keyed by tag and by database
//!
//! Both maps create their child generator at most once per key, even when
//! many threads hit a new key at the same time: a lock-free lookup first,
//! then an entry-locked insert that re-checks for a concurrent winner.

use std::sync::Arc;

use dashmap::DashMap;

use docstore_core::{DatabaseCommands, DocStoreResult, DocumentConventions};

use crate::generator::{HiLoKeyGenerator, HiLoOptions};

/// One [`HiLoKeyGenerator`] per tag
#[derive(Debug)]
pub struct MultiTypeHiLoKeyGenerator {
    options: HiLoOptions,
    generators: DashMap<String, Arc<HiLoKeyGenerator>>,
}

impl MultiTypeHiLoKeyGenerator {
    /// Empty map; generators are created with `options`
    pub fn new(options: HiLoOptions) -> Self {
        MultiTypeHiLoKeyGenerator {
            options,
            generators: DashMap::new(),
        }
    }

    /// Generator for `tag`, created on first use
    pub fn generator_for(&self, tag: &str) -> Arc<HiLoKeyGenerator> {
        if let Some(existing) = self.generators.get(tag) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .generators
            .entry(tag.to_string())
            .or_insert_with(|| {
                tracing::debug!(target: "docstore::hilo", tag, "Creating hilo generator");
                Arc::new(HiLoKeyGenerator::new(tag, &self.options))
            });
        Arc::clone(entry.value())
    }

    /// Next key for the entity type tagged `type_tag`
    ///
    /// The tag is first turned into its document-key prefix, so `Users`
    /// allocates from the `users` ledger and yields keys like `users/1`.
    pub fn generate_document_key(
        &self,
        commands: &dyn DatabaseCommands,
        conventions: &DocumentConventions,
        type_tag: &str,
    ) -> DocStoreResult<String> {
        let prefix = conventions.document_key_prefix(type_tag);
        self.generator_for(&prefix)
            .generate_document_key(commands, conventions)
    }

    /// Number of tags seen so far
    pub fn len(&self) -> usize {
        self.generators.len()
    }

    /// True before the first key was generated
    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }
}

/// One [`MultiTypeHiLoKeyGenerator`] per database
#[derive(Debug)]
pub struct MultiDatabaseHiLoGenerator {
    options: HiLoOptions,
    databases: DashMap<String, Arc<MultiTypeHiLoKeyGenerator>>,
}

impl MultiDatabaseHiLoGenerator {
    /// Empty map; generators are created with `options`
    pub fn new(options: HiLoOptions) -> Self {
        MultiDatabaseHiLoGenerator {
            options,
            databases: DashMap::new(),
        }
    }

    /// Generator for `database`, created on first use
    pub fn generator_for(&self, database: &str) -> Arc<MultiTypeHiLoKeyGenerator> {
        if let Some(existing) = self.databases.get(database) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .databases
            .entry(database.to_string())
            .or_insert_with(|| Arc::new(MultiTypeHiLoKeyGenerator::new(self.options.clone())));
        Arc::clone(entry.value())
    }

    /// Next key for `type_tag` in `database`
    pub fn generate_document_key(
        &self,
        database: &str,
        commands: &dyn DatabaseCommands,
        conventions: &DocumentConventions,
        type_tag: &str,
    ) -> DocStoreResult<String> {
        self.generator_for(database)
            .generate_document_key(commands, conventions, type_tag)
    }
}
