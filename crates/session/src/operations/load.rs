use std::time::Instant;

use docstore_core::{DocStoreResult, Document, JsonDocument, MultiLoadResult};

use crate::entity::Tracked;
use crate::session::DocumentSession;

/// Single-document load
pub(crate) struct LoadOperation {
    key: String,
    started: Option<Instant>,
}

impl LoadOperation {
    pub fn new(key: &str) -> Self {
        LoadOperation {
            key: key.to_string(),
            started: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Start the non-authoritative retry clock on the first attempt
    pub fn enter(&mut self) {
        self.started.get_or_insert_with(Instant::now);
    }

    /// Retry while the document is non-authoritative, the session refuses
    /// such documents, and the retry window is still open
    pub fn needs_retry(&self, session: &DocumentSession, doc: Option<&JsonDocument>) -> bool {
        let Some(doc) = doc else {
            return false;
        };
        doc.non_authoritative_information
            && !session.allow_non_authoritative_information()
            && within(self.started, session)
    }

    pub fn complete<T: Document>(
        &self,
        session: &mut DocumentSession,
        doc: Option<JsonDocument>,
    ) -> DocStoreResult<Option<Tracked<T>>> {
        match doc {
            None => {
                session.register_missing(&self.key);
                Ok(None)
            }
            Some(doc) => {
                let tracked = session.track_entity::<T>(doc, false)?;
                if tracked.is_none() {
                    session.register_missing(&self.key);
                }
                Ok(tracked)
            }
        }
    }
}

/// Multi-document load with optional include paths
pub(crate) struct MultiLoadOperation {
    keys: Vec<String>,
    includes: Vec<String>,
    started: Option<Instant>,
}

impl MultiLoadOperation {
    pub fn new(keys: Vec<String>, includes: Vec<String>) -> Self {
        MultiLoadOperation {
            keys,
            includes,
            started: None,
        }
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn includes(&self) -> &[String] {
        &self.includes
    }

    pub fn enter(&mut self) {
        self.started.get_or_insert_with(Instant::now);
    }

    pub fn needs_retry(&self, session: &DocumentSession, result: &MultiLoadResult) -> bool {
        !session.allow_non_authoritative_information()
            && result
                .results
                .iter()
                .flatten()
                .any(|doc| doc.non_authoritative_information)
            && within(self.started, session)
    }

    /// Track includes and results; results line up with the requested keys
    pub fn complete<T: Document>(
        &self,
        session: &mut DocumentSession,
        result: MultiLoadResult,
    ) -> DocStoreResult<Vec<Option<Tracked<T>>>> {
        for include in result.includes {
            session.register_included(include);
        }

        let mut found = result.results.into_iter();
        let mut out = Vec::with_capacity(self.keys.len());
        for key in &self.keys {
            let tracked = match found.next().flatten() {
                Some(doc) => session.track_entity::<T>(doc, false)?,
                None => None,
            };
            if tracked.is_none() {
                session.register_missing(key);
            }
            out.push(tracked);
        }
        Ok(out)
    }
}

fn within(started: Option<Instant>, session: &DocumentSession) -> bool {
    started.map_or(true, |s| {
        s.elapsed() < session.non_authoritative_information_timeout()
    })
}
