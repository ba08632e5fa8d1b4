//! Write-batch commands and results
//!
//! A save turns the session's pending changes into an ordered list of
//! [`CommandData`]. The server applies the list atomically and answers with
//! one [`BatchResult`] per command, in the same order.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::document::JsonDocument;
use crate::etag::Etag;
use crate::metadata::Metadata;

/// Store a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PutCommandData {
    /// Target key; a key ending with the identity separator asks the server
    /// to assign the rest of the key
    pub key: String,
    /// Expected current etag; `None` skips the concurrency check and
    /// [`Etag::empty`] requires the document to be new
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<Etag>,
    /// Document body
    pub document: Map<String, Value>,
    /// Document metadata
    pub metadata: Metadata,
}

/// Delete a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeleteCommandData {
    /// Target key
    pub key: String,
    /// Expected current etag; `None` skips the concurrency check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<Etag>,
}

/// One command of a write batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Method")]
pub enum CommandData {
    /// PUT
    #[serde(rename = "PUT")]
    Put(PutCommandData),
    /// DELETE
    #[serde(rename = "DELETE")]
    Delete(DeleteCommandData),
}

impl CommandData {
    /// Build a put command
    pub fn put(
        key: impl Into<String>,
        etag: Option<Etag>,
        document: Map<String, Value>,
        metadata: Metadata,
    ) -> Self {
        CommandData::Put(PutCommandData {
            key: key.into(),
            etag,
            document,
            metadata,
        })
    }

    /// Build a delete command
    pub fn delete(key: impl Into<String>, etag: Option<Etag>) -> Self {
        CommandData::Delete(DeleteCommandData {
            key: key.into(),
            etag,
        })
    }

    /// Wire method name
    pub fn method(&self) -> &'static str {
        match self {
            CommandData::Put(_) => "PUT",
            CommandData::Delete(_) => "DELETE",
        }
    }

    /// Target key
    pub fn key(&self) -> &str {
        match self {
            CommandData::Put(p) => &p.key,
            CommandData::Delete(d) => &d.key,
        }
    }

    /// Expected etag, if any
    pub fn etag(&self) -> Option<Etag> {
        match self {
            CommandData::Put(p) => p.etag,
            CommandData::Delete(d) => d.etag,
        }
    }

    /// True for deletes
    pub fn is_delete(&self) -> bool {
        matches!(self, CommandData::Delete(_))
    }
}

/// Outcome of one batch command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BatchResult {
    /// Method of the command this answers
    pub method: String,
    /// Final key (server-assigned for keys ending with the separator)
    pub key: String,
    /// New etag for puts
    #[serde(default)]
    pub etag: Option<Etag>,
    /// Stored metadata for puts
    #[serde(default)]
    pub metadata: Metadata,
    /// For deletes: whether a document was actually removed
    #[serde(default)]
    pub deleted: Option<bool>,
}

impl BatchResult {
    /// True if this answers a PUT
    pub fn is_put(&self) -> bool {
        self.method.eq_ignore_ascii_case("PUT")
    }
}

/// Outcome of a single put
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PutResult {
    /// Stored key
    pub key: String,
    /// New etag
    pub etag: Etag,
}

/// Outcome of a multi-key load
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultiLoadResult {
    /// One entry per requested key, in request order; `None` when missing
    pub results: Vec<Option<JsonDocument>>,
    /// Documents referenced by the requested include paths
    pub includes: Vec<JsonDocument>,
}

impl MultiLoadResult {
    /// Wire form `{ "Results": [...], "Includes": [...] }`
    pub fn to_json(&self) -> Value {
        let results = self
            .results
            .iter()
            .map(|r| r.as_ref().map(JsonDocument::to_json).unwrap_or(Value::Null))
            .collect();
        let includes = self.includes.iter().map(JsonDocument::to_json).collect();
        let mut out = Map::new();
        out.insert("Results".to_string(), Value::Array(results));
        out.insert("Includes".to_string(), Value::Array(includes));
        Value::Object(out)
    }

    /// Inverse of [`MultiLoadResult::to_json`]
    pub fn from_json(value: &Value) -> crate::DocStoreResult<MultiLoadResult> {
        let mut out = MultiLoadResult::default();
        if let Some(results) = value.get("Results").and_then(Value::as_array) {
            for r in results {
                if r.is_null() {
                    out.results.push(None);
                } else {
                    out.results.push(Some(JsonDocument::from_json(r.clone())?));
                }
            }
        }
        if let Some(includes) = value.get("Includes").and_then(Value::as_array) {
            for inc in includes {
                out.includes.push(JsonDocument::from_json(inc.clone())?);
            }
        }
        Ok(out)
    }
}
