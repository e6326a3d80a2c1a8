//! Cluster membership and the transport that carries intra-cluster
//! requests.
//!
//! A `Cluster` knows the ring membership, the nodes hosted inside this
//! process, and how to reach everything else. Requests addressed to a
//! hosted node are handed to it directly as plain function calls -- test
//! clusters run many nodes in one process this way -- while remote node
//! names, which are `http://` base URLs, go out through a shared hyper
//! client. Handlers receive the cluster handle explicitly and use it for
//! every node-to-node call, so there is no ambient routing state anywhere.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{Method, Request, Response};
use hyper::client::HttpConnector;
use snafu::{ResultExt, Snafu};

use crate::http::internal_request;
use crate::node::Node;
use crate::ring::HashRing;

/// Error raised when an intra-cluster request cannot be delivered.
#[derive(Debug, Snafu)]
pub enum ClusterError {
    /// The target is neither hosted here nor an http URL.
    #[snafu(display("node {name:?} is not hosted here and is not an http url"))]
    UnknownNode { name: String },

    /// The forwarded request could not be built.
    #[snafu(display("invalid request target for node {name:?}: {source}"))]
    BadTarget { name: String, source: http::Error },

    /// The transport failed.
    #[snafu(display("request to node {name:?} failed: {source}"))]
    Transport { name: String, source: hyper::Error },

    /// The peer answered outside 2xx.
    #[snafu(display("node {name:?} answered {status}"))]
    Failed {
        name: String,
        status: http::StatusCode,
    },
}

/// Shared view of the cluster: membership, hosted nodes, and transport.
pub struct Cluster {
    backups: usize,
    ring: RwLock<HashRing>,
    hosted: RwLock<HashMap<String, Arc<Node>>>,
    client: hyper::Client<HttpConnector>,
}

impl Cluster {
    /// Creates a cluster with `backups` replicas per collection and no
    /// members yet.
    pub fn new(backups: usize) -> Arc<Cluster> {
        Arc::new(Cluster {
            backups,
            ring: RwLock::new(HashRing::new(Vec::<String>::new())),
            hosted: RwLock::new(HashMap::new()),
            client: hyper::Client::new(),
        })
    }

    /// Number of backup replicas each write fans out to.
    pub fn backups(&self) -> usize {
        self.backups
    }

    /// Registers a node served from inside this process.
    pub fn host(&self, node: Arc<Node>) {
        self.hosted
            .write()
            .expect("hosted map lock is never poisoned")
            .insert(node.name().to_string(), node);
    }

    pub fn hosted_node(&self, name: &str) -> Option<Arc<Node>> {
        self.hosted
            .read()
            .expect("hosted map lock is never poisoned")
            .get(name)
            .cloned()
    }

    /// Replaces the ring membership outright; used at startup.
    pub fn set_nodes<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.ring.write().expect("ring lock is never poisoned") = HashRing::new(names);
    }

    /// A snapshot of the current ring.
    pub fn ring(&self) -> HashRing {
        self.ring
            .read()
            .expect("ring lock is never poisoned")
            .clone()
    }

    /// The primary and backups for `key`, in order.
    pub fn node_list(&self, key: &str) -> Vec<String> {
        let ring = self.ring();
        ring.iterate_nodes(key)
            .take(self.backups + 1)
            .map(str::to_string)
            .collect()
    }

    /// Delivers `req` to `target`, in-process when hosted, over HTTP
    /// otherwise.
    ///
    /// Boxed so that handlers can call back into the cluster (a copy
    /// during catch-up, a paste during a drain) without the future type
    /// recursing into itself.
    pub fn dispatch(
        self: &Arc<Self>,
        target: &str,
        req: Request<Bytes>,
    ) -> BoxFuture<'static, Result<Response<Bytes>, ClusterError>> {
        let cluster = Arc::clone(self);
        let target = target.to_string();
        Box::pin(async move {
            if let Some(node) = cluster.hosted_node(&target) {
                return Ok(node.handle(&cluster, req).await);
            }
            if target.starts_with("http://") || target.starts_with("https://") {
                return cluster.forward(&target, req).await;
            }
            UnknownNodeSnafu { name: target }.fail()
        })
    }

    /// Like [`Cluster::dispatch`] but treating non-2xx as an error.
    pub async fn dispatch_ok(
        self: &Arc<Self>,
        target: &str,
        req: Request<Bytes>,
    ) -> Result<Response<Bytes>, ClusterError> {
        let response = self.dispatch(target, req).await?;
        if !response.status().is_success() {
            return FailedSnafu {
                name: target,
                status: response.status(),
            }
            .fail();
        }
        Ok(response)
    }

    async fn forward(
        &self,
        target: &str,
        req: Request<Bytes>,
    ) -> Result<Response<Bytes>, ClusterError> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("{}{}", target.trim_end_matches('/'), path_and_query);

        let mut builder = Request::builder().method(req.method().clone()).uri(&uri);
        for (name, value) in req.headers() {
            builder = builder.header(name, value);
        }
        let outgoing = builder
            .body(hyper::Body::from(req.into_body()))
            .context(BadTargetSnafu { name: target })?;

        let response = self
            .client
            .request(outgoing)
            .await
            .context(TransportSnafu { name: target })?;
        let (parts, body) = response.into_parts();
        let bytes = hyper::body::to_bytes(body)
            .await
            .context(TransportSnafu { name: target })?;
        Ok(Response::from_parts(parts, bytes))
    }

    /// Brings `name` into the cluster: the new node pulls its share of
    /// collections from the existing members, then joins the ring.
    pub async fn add_node(self: &Arc<Self>, name: &str) -> Result<(), ClusterError> {
        let others = self.ring().nodes().to_vec();
        let body = serde_json::json!({ "nodes": others, "backups": self.backups });
        self.dispatch_ok(
            name,
            internal_request(Method::POST, "/node-added", body.to_string().into()),
        )
        .await?;

        let mut ring = self.ring.write().expect("ring lock is never poisoned");
        *ring = ring.with_node(name);
        Ok(())
    }

    /// Removes `name` from the cluster.
    ///
    /// Cooperatively the node drains itself to its successors first; with
    /// `force` the node is presumed dead and every survivor restores the
    /// collections it shared with it.
    pub async fn remove_node(self: &Arc<Self>, name: &str, force: bool) -> Result<(), ClusterError> {
        let members = self.ring().nodes().to_vec();
        if force {
            let body = serde_json::json!({
                "nodes": members,
                "bad": name,
                "backups": self.backups,
            });
            for member in members.iter().filter(|m| m.as_str() != name) {
                self.dispatch_ok(
                    member,
                    internal_request(Method::POST, "/take-over", body.to_string().into()),
                )
                .await?;
            }
        } else {
            let body = serde_json::json!({ "nodes": members, "backups": self.backups });
            self.dispatch_ok(
                name,
                internal_request(Method::POST, "/remove-self", body.to_string().into()),
            )
            .await?;
        }

        let mut ring = self.ring.write().expect("ring lock is never poisoned");
        *ring = ring.without_node(name);
        Ok(())
    }
}
