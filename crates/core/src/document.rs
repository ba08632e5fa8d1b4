//! Entities and stored documents
//!
//! [`Document`] is the capability an application type implements to be
//! tracked by a session: plain serde data plus an explicit accessor pair for
//! its identifier. [`JsonDocument`] is the server-side form of a document.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::conventions::default_type_tag;
use crate::error::{DocStoreError, DocStoreResult};
use crate::etag::Etag;
use crate::metadata::{self, Metadata};

/// An entity type that can be stored in a session
///
/// The identifier accessors replace field discovery by introspection: the
/// session reads the id to detect key changes and writes generated keys
/// back through `set_id`.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct User { id: Option<String>, name: String }
///
/// impl Document for User {
///     fn id(&self) -> Option<&str> { self.id.as_deref() }
///     fn set_id(&mut self, id: &str) { self.id = Some(id.to_string()); }
/// }
/// ```
pub trait Document: Serialize + DeserializeOwned + 'static {
    /// Client-visible identifier, `None` for transient instances
    fn id(&self) -> Option<&str>;

    /// Store an identifier assigned by the session or the server
    fn set_id(&mut self, id: &str);

    /// Logical entity-type name; namespaces key generation and dynamic indexes
    fn type_tag() -> String
    where
        Self: Sized,
    {
        default_type_tag::<Self>()
    }
}

/// A document as stored by the server
#[derive(Debug, Clone, PartialEq)]
pub struct JsonDocument {
    /// Document key
    pub key: String,
    /// Document body (never contains `@metadata`)
    pub data: Map<String, Value>,
    /// Document metadata
    pub metadata: Metadata,
    /// Current version stamp
    pub etag: Option<Etag>,
    /// Last modification time
    pub last_modified: Option<DateTime<Utc>>,
    /// Set when an uncommitted transaction touched the document
    pub non_authoritative_information: bool,
}

impl JsonDocument {
    /// Create a document with empty metadata
    pub fn new(key: impl Into<String>, data: Map<String, Value>) -> Self {
        JsonDocument {
            key: key.into(),
            data,
            metadata: Metadata::new(),
            etag: None,
            last_modified: None,
            non_authoritative_information: false,
        }
    }

    /// Wire form: the body with an embedded `@metadata` object
    ///
    /// `@id`, `@etag` and `Last-Modified` are written into the embedded
    /// metadata so the document can be rebuilt by [`JsonDocument::from_json`].
    pub fn to_json(&self) -> Value {
        let mut meta = self.metadata.clone();
        meta.insert(metadata::ID.to_string(), Value::String(self.key.clone()));
        if let Some(etag) = self.etag {
            meta.insert(metadata::ETAG.to_string(), Value::String(etag.to_string()));
        }
        if let Some(ts) = self.last_modified {
            meta.insert(metadata::LAST_MODIFIED.to_string(), Value::String(ts.to_rfc3339()));
        }
        if self.non_authoritative_information {
            meta.insert(metadata::NON_AUTHORITATIVE_INFORMATION.to_string(), Value::Bool(true));
        }
        let mut body = self.data.clone();
        body.insert(metadata::METADATA.to_string(), Value::Object(meta));
        Value::Object(body)
    }

    /// Rebuild a document from its wire form
    pub fn from_json(value: Value) -> DocStoreResult<JsonDocument> {
        let mut body = match value {
            Value::Object(map) => map,
            other => {
                return Err(DocStoreError::invalid_input(format!(
                    "expected a document object, got {}",
                    other
                )))
            }
        };

        let mut meta = match body.remove(metadata::METADATA) {
            Some(Value::Object(m)) => m,
            _ => Metadata::new(),
        };

        let key = meta
            .get(metadata::ID)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let etag = meta
            .get(metadata::ETAG)
            .and_then(Value::as_str)
            .and_then(Etag::try_parse);
        let last_modified = meta
            .get(metadata::LAST_MODIFIED)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let non_authoritative_information = metadata::is_non_authoritative(&meta);

        meta.remove(metadata::ID);
        meta.remove(metadata::NON_AUTHORITATIVE_INFORMATION);

        Ok(JsonDocument {
            key,
            data: body,
            metadata: meta,
            etag,
            last_modified,
            non_authoritative_information,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_form_rebuilds_document() {
        let mut doc = JsonDocument::new(
            "users/1",
            json!({ "name": "Ayende" }).as_object().cloned().unwrap(),
        );
        doc.etag = Some(Etag::new(0, 9));
        doc.metadata
            .insert(metadata::ENTITY_NAME.to_string(), json!("Users"));
        doc.last_modified = Some(Utc::now());

        let wire = doc.to_json();
        assert_eq!(wire["@metadata"]["@id"], "users/1");

        let back = JsonDocument::from_json(wire).unwrap();
        assert_eq!(back.key, "users/1");
        assert_eq!(back.etag, Some(Etag::new(0, 9)));
        assert_eq!(back.data.get("name"), Some(&json!("Ayende")));
        assert!(!back.data.contains_key("@metadata"));
        assert_eq!(back.metadata.get(metadata::ENTITY_NAME), Some(&json!("Users")));
        assert!(back.last_modified.is_some());
    }

    #[test]
    fn test_from_json_rejects_scalars() {
        assert!(JsonDocument::from_json(json!(42)).is_err());
    }

    #[test]
    fn test_non_authoritative_flag_is_lifted_out_of_metadata() {
        let wire = json!({
            "a": 1,
            "@metadata": { "@id": "x/1", "Non-Authoritative-Information": true }
        });
        let doc = JsonDocument::from_json(wire).unwrap();
        assert!(doc.non_authoritative_information);
        assert!(!doc.metadata.contains_key(metadata::NON_AUTHORITATIVE_INFORMATION));
    }
}
