//! Multi-get sub-requests
//!
//! Lazy operations are resolved by bundling several GET-like requests into
//! one round trip. Each [`GetRequest`] names a route relative to the
//! database (`/docs`, `/queries/`, `/indexes/{name}`) and a query string;
//! the server answers with one [`GetResponse`] per request, in order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Response header carrying the server-side processing time in milliseconds
pub const REQUEST_TIME_HEADER: &str = "Temp-Request-Time";

/// One request of a multi-get
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetRequest {
    /// Route, e.g. `/docs`
    pub url: String,
    /// Query string without the leading `?`
    #[serde(default)]
    pub query: Option<String>,
    /// Request headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl GetRequest {
    /// Request for `url` with query string `query`
    pub fn new(url: impl Into<String>, query: Option<String>) -> Self {
        GetRequest {
            url: url.into(),
            query,
            headers: BTreeMap::new(),
        }
    }

    /// `url?query`, used in logs and timing breakdowns
    pub fn url_and_query(&self) -> String {
        match &self.query {
            Some(q) if !q.is_empty() => format!("{}?{}", self.url, q),
            _ => self.url.clone(),
        }
    }

    /// Values of the query parameter `name`, unescaped, in order
    pub fn query_values(&self, name: &str) -> Vec<String> {
        let Some(query) = &self.query else {
            return Vec::new();
        };
        query
            .trim_start_matches('?')
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .filter(|(k, _)| *k == name)
            .map(|(_, v)| unescape_data_string(v))
            .collect()
    }
}

/// One response of a multi-get
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetResponse {
    /// Response body
    #[serde(default)]
    pub result: Value,
    /// Response headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// HTTP-like status code
    pub status: u16,
}

impl GetResponse {
    /// Response with `status` and `result`, no headers
    pub fn new(status: u16, result: Value) -> Self {
        GetResponse {
            result,
            headers: BTreeMap::new(),
            status,
        }
    }

    /// True unless the status is one of the accepted codes
    ///
    /// 404 counts as success: a missing document is a valid answer.
    pub fn request_has_errors(&self) -> bool {
        !matches!(self.status, 0 | 200 | 201 | 203 | 204 | 304 | 404)
    }

    /// Server-side processing time from [`REQUEST_TIME_HEADER`]
    pub fn request_time_ms(&self) -> Option<u64> {
        self.headers
            .get(REQUEST_TIME_HEADER)
            .and_then(|v| v.trim().parse().ok())
    }
}

/// Percent-encode everything outside the RFC 3986 unreserved set
pub fn escape_data_string(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Decode `%XX` sequences; malformed sequences are kept verbatim
pub fn unescape_data_string(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}
