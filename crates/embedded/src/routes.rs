//! Multi-get routing
//!
//! | Route | Query | Body |
//! |---|---|---|
//! | `/docs` | `id=` | the document, 404 when missing, 203 when non-authoritative |
//! | `/queries/` | `id=`, `include=` | `{ Results, Includes }` |
//! | `/indexes/{name}` | index query string, `include=` | query result, 404 for unknown indexes |

use std::time::Instant;

use serde_json::{json, Value};

use docstore_core::multiget::REQUEST_TIME_HEADER;
use docstore_core::{
    DocStoreError, DocStoreResult, GetRequest, GetResponse, IndexQuery, MultiLoadResult,
};

use crate::database::DatabaseState;

/// Load `keys` and whatever their `includes` paths reference
pub(crate) fn load_many(
    state: &mut DatabaseState,
    keys: &[String],
    includes: &[String],
) -> DocStoreResult<MultiLoadResult> {
    let mut result = MultiLoadResult::default();
    for key in keys {
        result.results.push(state.read(key)?);
    }
    let mut included = Vec::new();
    for doc in result.results.iter().flatten() {
        state.includes_of(doc, includes, &mut included)?;
    }
    result.includes = included;
    Ok(result)
}

fn error_response(err: DocStoreError) -> GetResponse {
    match err {
        DocStoreError::DocumentConflict {
            key,
            conflicted_version_ids,
            etag,
        } => GetResponse::new(
            409,
            json!({
                "Error": format!("Conflict detected on {}", key),
                "ConflictedVersionIds": conflicted_version_ids,
                "Etag": etag.to_string(),
            }),
        ),
        other => GetResponse::new(500, json!({ "Error": other.to_string() })),
    }
}

fn handle_docs(state: &mut DatabaseState, request: &GetRequest) -> GetResponse {
    let Some(id) = request.query_values("id").into_iter().next() else {
        return GetResponse::new(400, json!({ "Error": "missing id" }));
    };
    match state.read(&id) {
        Ok(Some(doc)) => {
            let status = if doc.non_authoritative_information { 203 } else { 200 };
            GetResponse::new(status, doc.to_json())
        }
        Ok(None) => GetResponse::new(404, Value::Null),
        Err(e) => error_response(e),
    }
}

fn handle_queries(state: &mut DatabaseState, request: &GetRequest) -> GetResponse {
    let ids = request.query_values("id");
    let includes = request.query_values("include");
    match load_many(state, &ids, &includes) {
        Ok(result) => GetResponse::new(200, result.to_json()),
        Err(e) => error_response(e),
    }
}

fn handle_index(state: &mut DatabaseState, index: &str, request: &GetRequest) -> GetResponse {
    let query = match IndexQuery::from_query_string(request.query.as_deref().unwrap_or_default()) {
        Ok(q) => q,
        Err(e) => return GetResponse::new(400, json!({ "Error": e.to_string() })),
    };
    let includes = request.query_values("include");
    match state.query(index, &query, &includes) {
        Ok(Some(result)) => match serde_json::to_value(&result) {
            Ok(body) => GetResponse::new(200, body),
            Err(e) => GetResponse::new(500, json!({ "Error": e.to_string() })),
        },
        Ok(None) => GetResponse::new(404, Value::Null),
        Err(e) => error_response(e),
    }
}

/// Answer one sub-request
pub(crate) fn handle(state: &mut DatabaseState, request: &GetRequest) -> GetResponse {
    let started = Instant::now();
    let url = request.url.as_str();
    let mut response = if url == "/docs" || url == "/docs/" {
        handle_docs(state, request)
    } else if url == "/queries" || url == "/queries/" {
        handle_queries(state, request)
    } else if let Some(index) = url.strip_prefix("/indexes/") {
        handle_index(state, index, request)
    } else {
        GetResponse::new(400, json!({ "Error": format!("no route for '{}'", url) }))
    };
    response.headers.insert(
        REQUEST_TIME_HEADER.to_string(),
        started.elapsed().as_millis().to_string(),
    );
    response
}
