//! Public request dispatch: pick the serving node, stamp the replication
//! fan-out, forward.
//!
//! The router fronts one hosted node but routes by the ring, so a request
//! landing on the wrong node is forwarded rather than refused. Two
//! special cases keep test clusters and operators sane: a first path
//! segment naming a node hosted in this process short-circuits to it,
//! and the coordination RPCs always go to the local node, since they are
//! addressed to a node rather than to data. Neither bypasses the auth
//! gate: node names are public knowledge (every response advertises its
//! server), so token validation runs before any dispatch, with only the
//! internal verbs and the coordination RPCs exempt.

use std::sync::Arc;

use bytes::Bytes;
use http::{header, Method, Request, Response, StatusCode};
use percent_encoding::percent_decode_str;

use crate::auth::{AuthError, TokenAuth};
use crate::cluster::Cluster;
use crate::http::{json_response, not_found, retry_after, Query, BACKUP_TO, NODE_NAME, SET_AUTHORIZATION};
use crate::node::collection_path;

/// Query verbs reserved for node-to-node traffic; they bypass client
/// auth and never get a replication header.
const INTERNAL_VERBS: &[&str] = &["copy", "paste", "deprecate", "backup-from-pos", "gc"];

const COORDINATION_PATHS: &[&str] = &["node-added", "query-deprecate", "remove-self", "take-over"];

pub struct Router {
    cluster: Arc<Cluster>,
    local: String,
    auth: Option<Arc<TokenAuth>>,
}

impl Router {
    pub fn new(cluster: Arc<Cluster>, local: impl Into<String>, auth: Option<Arc<TokenAuth>>) -> Arc<Router> {
        Arc::new(Router {
            cluster,
            local: local.into(),
            auth,
        })
    }

    /// Routes one request and stamps the response with the serving node.
    pub async fn route(&self, req: Request<Bytes>) -> Response<Bytes> {
        let path = req.uri().path().trim_matches('/').to_string();
        let segments: Vec<&str> = path.split('/').collect();
        let query = Query::parse(req.uri().query());

        // A first segment naming a node hosted in this process addresses
        // it directly (in-process clusters). The node name is public --
        // every response advertises it -- so the prefix only picks the
        // target; the auth gate below still applies to what remains of
        // the path.
        let hosted = self.cluster.hosted_node(segments[0]);
        let effective: &[&str] = if hosted.is_some() {
            &segments[1..]
        } else {
            &segments[..]
        };

        let internal = INTERNAL_VERBS.iter().any(|verb| query.has(verb))
            || matches!(effective, [single] if COORDINATION_PATHS.contains(single));

        let mut refreshed = None;
        if !internal {
            if let Some(auth) = &self.auth {
                match check_auth(auth, &req) {
                    Ok(refresh) => refreshed = refresh,
                    Err(response) => return response,
                }
            }
        }

        if let Some(node) = hosted {
            let name = node.name().to_string();
            let stripped = strip_first_segment(req);
            let mut response = node.handle(&self.cluster, stripped).await;
            set_node_name(&mut response, &name);
            set_refreshed(&mut response, refreshed);
            return response;
        }

        if let [single] = effective {
            if COORDINATION_PATHS.contains(single) {
                return match self.cluster.dispatch(&self.local, req).await {
                    Ok(mut response) => {
                        set_node_name(&mut response, &self.local);
                        response
                    }
                    Err(error) => {
                        warn!(message = "Coordination dispatch failed.", %error);
                        bad_gateway()
                    }
                };
            }
        }

        let &[domain, user, bucket] = effective else {
            return not_found();
        };

        // Normalize the ring key: clients are free to percent-encode more
        // or less than we do, placement must not care.
        let key = collection_path(
            &percent_decode_str(domain).decode_utf8_lossy(),
            &percent_decode_str(user).decode_utf8_lossy(),
            &percent_decode_str(bucket).decode_utf8_lossy(),
        );

        let placement = self.cluster.node_list(&key);
        let Some(primary) = placement.first().cloned() else {
            return retry_after("no nodes in the ring");
        };

        let mut req = req;
        if req.method() == Method::POST && !internal && placement.len() > 1 {
            let backups = placement[1..].join(",");
            if let Ok(value) = header::HeaderValue::from_str(&backups) {
                req.headers_mut().insert(BACKUP_TO, value);
            }
        }

        let mut response = match self.cluster.dispatch(&primary, req).await {
            Ok(response) => response,
            Err(error) => {
                warn!(message = "Forwarding failed.", node = %primary, %error);
                bad_gateway()
            }
        };
        set_node_name(&mut response, &primary);
        set_refreshed(&mut response, refreshed);
        response
    }
}

fn check_auth(
    auth: &TokenAuth,
    req: &Request<Bytes>,
) -> Result<Option<String>, Response<Bytes>> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v));
    let Some(token) = token else {
        return Err(unauthorized("authorization required"));
    };
    match auth.validate(token) {
        Ok(verified) => Ok(verified.refreshed),
        Err(AuthError::Expired) => Err(unauthorized("token expired")),
        Err(_) => Err(unauthorized("invalid token")),
    }
}

fn unauthorized(message: &str) -> Response<Bytes> {
    json_response(
        StatusCode::UNAUTHORIZED,
        &serde_json::json!({ "error": message }),
    )
}

fn bad_gateway() -> Response<Bytes> {
    json_response(
        StatusCode::BAD_GATEWAY,
        &serde_json::json!({ "error": "node unreachable" }),
    )
}

fn set_node_name(response: &mut Response<Bytes>, name: &str) {
    if let Ok(value) = header::HeaderValue::from_str(name) {
        response.headers_mut().insert(NODE_NAME, value);
    }
}

fn set_refreshed(response: &mut Response<Bytes>, refreshed: Option<String>) {
    if let Some(token) = refreshed {
        if let Ok(value) = header::HeaderValue::from_str(&token) {
            response.headers_mut().insert(SET_AUTHORIZATION, value);
        }
    }
}

fn strip_first_segment(req: Request<Bytes>) -> Request<Bytes> {
    let (mut parts, body) = req.into_parts();
    let path = parts.uri.path();
    let stripped = match path.trim_start_matches('/').split_once('/') {
        Some((_, rest)) => format!("/{rest}"),
        None => "/".to_string(),
    };
    let path_and_query = match parts.uri.query() {
        Some(query) => format!("{stripped}?{query}"),
        None => stripped,
    };
    parts.uri = path_and_query
        .parse()
        .expect("a stripped valid uri is still valid");
    Request::from_parts(parts, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::node::Node;

    #[test]
    fn first_segment_stripping_keeps_the_query() {
        let req = Request::builder()
            .uri("/node-000/d/u/b?since=3")
            .body(Bytes::new())
            .unwrap();
        let stripped = strip_first_segment(req);
        assert_eq!(stripped.uri().path(), "/d/u/b");
        assert_eq!(stripped.uri().query(), Some("since=3"));
    }

    #[tokio::test]
    async fn node_prefix_does_not_bypass_the_auth_gate() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new("node-000", dir.path().join("node-000")).unwrap();
        let cluster = Cluster::new(0);
        cluster.host(Arc::clone(&node));
        cluster.set_nodes(["node-000".to_string()]);
        let auth =
            Arc::new(TokenAuth::open(dir.path(), Duration::from_secs(3600)).unwrap());
        let router = Router::new(Arc::clone(&cluster), "node-000", Some(Arc::clone(&auth)));

        // Addressing the node by name must not skip token validation.
        let bare = Request::builder()
            .uri("/node-000/d/u/b")
            .body(Bytes::new())
            .unwrap();
        assert_eq!(router.route(bare).await.status(), StatusCode::UNAUTHORIZED);

        let token = auth.mint("someone@example.com");
        let authed = Request::builder()
            .uri("/node-000/d/u/b")
            .header(header::AUTHORIZATION, token)
            .body(Bytes::new())
            .unwrap();
        assert_eq!(router.route(authed).await.status(), StatusCode::OK);

        // Internal verbs stay exempt: node-to-node traffic carries no
        // client token.
        let copy = Request::builder()
            .uri("/node-000/d/u/b?copy")
            .body(Bytes::new())
            .unwrap();
        assert_eq!(router.route(copy).await.status(), StatusCode::OK);
    }
}
