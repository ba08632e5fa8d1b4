//! Document metadata
//!
//! Metadata is a free-form JSON object stored next to every document. The
//! client reads and writes a handful of well-known entries; everything else
//! is carried through untouched.

use serde_json::{Map, Value};

use crate::error::{DocStoreError, DocStoreResult};

/// Document annotations (entity tag, etag, read-only marker, ...)
pub type Metadata = Map<String, Value>;

/// Logical entity-type name of the document
pub const ENTITY_NAME: &str = "Raven-Entity-Name";
/// Read-only marker; change tracking and deletes skip flagged entities
pub const READ_ONLY: &str = "Raven-Read-Only";
/// Set by the server for placeholder documents that do not really exist
pub const DOCUMENT_DOES_NOT_EXIST: &str = "Raven-Document-Does-Not-Exists";
/// Last modification timestamp (RFC 3339)
pub const LAST_MODIFIED: &str = "Last-Modified";
/// Server-side last modification timestamp
pub const RAVEN_LAST_MODIFIED: &str = "Raven-Last-Modified";
/// Read veto object `{ "Trigger": .., "Reason": .. }`
pub const READ_VETO: &str = "Raven-Read-Veto";
/// Flag for documents touched by an uncommitted transaction
pub const NON_AUTHORITATIVE_INFORMATION: &str = "Non-Authoritative-Information";
/// Request a revision on save
pub const CREATE_VERSION: &str = "Raven-Create-Version";
/// Etag entry, mirrored into metadata after loads and saves
pub const ETAG: &str = "@etag";
/// Document id entry, present on query results
pub const ID: &str = "@id";
/// Property name that embeds metadata inside a document body
pub const METADATA: &str = "@metadata";

fn flag(metadata: &Metadata, name: &str) -> bool {
    match metadata.get(name) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// True when the read-only marker is set to true
pub fn is_read_only(metadata: &Metadata) -> bool {
    flag(metadata, READ_ONLY)
}

/// True when the document-does-not-exist marker is set to true
pub fn does_not_exist(metadata: &Metadata) -> bool {
    flag(metadata, DOCUMENT_DOES_NOT_EXIST)
}

/// True when metadata marks the document as non-authoritative
pub fn is_non_authoritative(metadata: &Metadata) -> bool {
    flag(metadata, NON_AUTHORITATIVE_INFORMATION)
}

/// Fail with `ReadVetoed` if a read trigger refused the document
pub fn ensure_not_read_vetoed(key: &str, metadata: &Metadata) -> DocStoreResult<()> {
    if let Some(Value::Object(veto)) = metadata.get(READ_VETO) {
        let field = |name: &str| {
            veto.get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        return Err(DocStoreError::ReadVetoed {
            key: key.to_string(),
            trigger: field("Trigger"),
            reason: field("Reason"),
        });
    }
    Ok(())
}

/// Remove server-reserved `@` entries
pub fn strip_reserved(metadata: &mut Metadata) {
    metadata.retain(|k, _| !k.starts_with('@'));
}
