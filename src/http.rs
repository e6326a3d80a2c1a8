//! Small HTTP helpers shared by the router and the node handlers.
//!
//! Requests travel through the cluster as `http::Request<Bytes>` /
//! `http::Response<Bytes>` so that a hosted node can be called in-process
//! with exactly what would have gone over the wire.

use bytes::Bytes;
use http::{header, Request, Response, StatusCode};
use serde::Serialize;

/// Header naming the node that served a response.
pub const NODE_NAME: &str = "x-node-name";
/// Header listing the replicas a primary fans writes out to.
pub const BACKUP_TO: &str = "x-backup-to";
/// Header carrying a refreshed auth token back to the client.
pub const SET_AUTHORIZATION: &str = "x-set-authorization";

/// Parsed query string; preserves repeated keys.
#[derive(Debug, Default)]
pub struct Query {
    pairs: Vec<(String, String)>,
}

impl Query {
    pub fn parse(query: Option<&str>) -> Query {
        let pairs = query
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            })
            .unwrap_or_default();
        Query { pairs }
    }

    /// First value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `key`; repeated parameters accumulate.
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// True when `key` appears at all, valueless (`?copy`) or not.
    pub fn has(&self, key: &str) -> bool {
        self.pairs.iter().any(|(k, _)| k == key)
    }

    /// First value for `key` parsed as an integer, or an error response.
    pub fn get_u32(&self, key: &str) -> Result<Option<u32>, Response<Bytes>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<u32>().map(Some).map_err(|_| {
                bad_request(&format!("query parameter {key:?} must be an integer"))
            }),
        }
    }
}

/// Serializes `value` into a JSON response with the given status.
pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Bytes> {
    let body = serde_json::to_vec(value).expect("response bodies are serializable");
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Bytes::from(body))
        .expect("static response parts are valid")
}

pub fn bytes_response(status: StatusCode, content_type: &str, body: Bytes) -> Response<Bytes> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(body)
        .expect("static response parts are valid")
}

pub fn bad_request(message: &str) -> Response<Bytes> {
    json_response(
        StatusCode::BAD_REQUEST,
        &serde_json::json!({ "error": message }),
    )
}

pub fn not_found() -> Response<Bytes> {
    json_response(
        StatusCode::NOT_FOUND,
        &serde_json::json!({ "error": "not found" }),
    )
}

/// 503 with a retry hint; used for draining nodes and deprecated
/// collections, both of which heal on their own.
pub fn retry_after(message: &str) -> Response<Bytes> {
    let body =
        serde_json::to_vec(&serde_json::json!({ "error": message })).expect("value serializes");
    Response::builder()
        .status(StatusCode::SERVICE_UNAVAILABLE)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::RETRY_AFTER, "60")
        .body(Bytes::from(body))
        .expect("static response parts are valid")
}

pub fn internal_error(message: &str) -> Response<Bytes> {
    json_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        &serde_json::json!({ "error": message }),
    )
}

/// Builds an internal request the way the cluster transport expects.
pub fn internal_request(method: http::Method, path_and_query: &str, body: Bytes) -> Request<Bytes> {
    Request::builder()
        .method(method)
        .uri(path_and_query)
        .body(body)
        .expect("internal request parts are valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_handles_flags_and_repeats() {
        let query = Query::parse(Some("copy&until=10&include=a&include=b"));
        assert!(query.has("copy"));
        assert!(!query.has("paste"));
        assert_eq!(query.get("until"), Some("10"));
        assert_eq!(query.get_u32("until").unwrap(), Some(10));
        assert_eq!(query.get_all("include"), vec!["a", "b"]);
        assert_eq!(query.get_u32("missing").unwrap(), None);
    }

    #[test]
    fn bad_integers_become_bad_requests() {
        let query = Query::parse(Some("since=ten"));
        let response = query.get_u32("since").unwrap_err();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
