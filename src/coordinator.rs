//! The multi-phase membership protocols: node addition, graceful removal,
//! and takeover after a node death.
//!
//! Every protocol reduces to the same move: decide, from two views of the
//! ring, which collections changed hands, then carry each one over with
//! the transfer stream (`?copy` + local restore, or `?paste` pushed at
//! the new holder). The decisions are made per collection against the
//! ring orderings, which every node computes identically from the same
//! membership lists, so no protocol needs a coordinator with special
//! state -- just the membership lists in the request body.

use std::sync::Arc;

use bytes::Bytes;
use http::{Method, Response, StatusCode};
use serde::{Deserialize, Serialize};

use logring_store::Collection;

use crate::cluster::Cluster;
use crate::http::{bad_request, internal_error, internal_request, json_response};
use crate::node::{collection_path, Node};
use crate::ring::HashRing;

#[derive(Debug, Deserialize)]
struct NodeAddedRequest {
    /// The members that existed before this node; the receiver is the
    /// addition.
    nodes: Vec<String>,
    backups: usize,
}

#[derive(Debug, Deserialize)]
struct QueryDeprecateRequest {
    /// Membership before the addition.
    nodes: Vec<String>,
    /// The node joining the ring.
    new: String,
    backups: usize,
}

#[derive(Debug, Deserialize)]
struct RemoveSelfRequest {
    /// Full membership, the receiver included.
    nodes: Vec<String>,
    backups: usize,
}

#[derive(Debug, Deserialize)]
struct TakeOverRequest {
    /// Full membership, the dead node included.
    nodes: Vec<String>,
    /// The node that died.
    bad: String,
    backups: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CollectionRef {
    pub domain: String,
    pub user: String,
    pub bucket: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct DeprecatedListing {
    collections: Vec<CollectionRef>,
}

/// A collection hand-off planned by one of the protocols: the encoded
/// stream and where it goes.
struct PlannedTransfer {
    target: String,
    path: String,
    stream: Vec<u8>,
}

impl Node {
    /// `/node-added`, received by the node that just joined: pull every
    /// collection the new ring assigns here from whichever member held
    /// it.
    pub(crate) async fn node_added(
        self: &Arc<Self>,
        cluster: &Arc<Cluster>,
        body: &Bytes,
    ) -> Response<Bytes> {
        let Ok(params) = serde_json::from_slice::<NodeAddedRequest>(body) else {
            return bad_request("invalid node-added request");
        };
        info!(
            message = "Joining the ring.",
            node = %self.name,
            existing = params.nodes.len(),
        );

        let mut transferred = 0usize;
        for holder in params.nodes.iter().filter(|n| **n != self.name) {
            let query = serde_json::json!({
                "nodes": params.nodes,
                "new": self.name,
                "backups": params.backups,
            });
            let listing = match cluster
                .dispatch_ok(
                    holder,
                    internal_request(Method::POST, "/query-deprecate", query.to_string().into()),
                )
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    // The holder keeps its deprecated copies; a later
                    // query picks them up.
                    warn!(message = "query-deprecate failed.", node = %holder, %error);
                    continue;
                }
            };
            let Ok(listing) = serde_json::from_slice::<DeprecatedListing>(listing.body()) else {
                warn!(message = "Unintelligible query-deprecate reply.", node = %holder);
                continue;
            };

            for reference in listing.collections {
                match self.pull_collection(cluster, holder, &reference).await {
                    Ok(()) => transferred += 1,
                    Err(error) => {
                        warn!(
                            message = "Collection transfer failed; leaving it deprecated on the holder.",
                            node = %holder,
                            %error,
                        );
                    }
                }
            }
        }

        json_response(
            StatusCode::OK,
            &serde_json::json!({ "transferred": transferred }),
        )
    }

    /// Copies one deprecated collection from `holder`, restores it
    /// locally, and deletes the holder's frozen copy.
    async fn pull_collection(
        self: &Arc<Self>,
        cluster: &Arc<Cluster>,
        holder: &str,
        reference: &CollectionRef,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let path = collection_path(&reference.domain, &reference.user, &reference.bucket);

        let copied = cluster
            .dispatch_ok(
                holder,
                internal_request(Method::GET, &format!("{path}?copy"), Bytes::new()),
            )
            .await?
            .into_body();

        let collection = self
            .storage
            .for_user(&reference.domain, &reference.user, &reference.bucket)?;
        tokio::task::spawn_blocking(move || collection.decode(&mut &copied[..], false)).await??;

        cluster
            .dispatch_ok(
                holder,
                internal_request(Method::POST, &format!("{path}?delete"), Bytes::new()),
            )
            .await?;
        Ok(())
    }

    /// `/query-deprecate`: freeze and report every local collection that
    /// the grown ring moves onto the new node and off this one.
    pub(crate) async fn query_deprecate(self: &Arc<Self>, body: &Bytes) -> Response<Bytes> {
        let Ok(params) = serde_json::from_slice::<QueryDeprecateRequest>(body) else {
            return bad_request("invalid query-deprecate request");
        };
        let grown = HashRing::new(params.nodes.iter().map(String::as_str)).with_node(&params.new);
        let name = self.name.clone();
        let storage = self.storage.clone();

        let work = tokio::task::spawn_blocking(move || {
            let mut reported = Vec::new();
            for (domain, user, bucket) in storage.all_dbs()? {
                let key = collection_path(&domain, &user, &bucket);
                let order: Vec<&str> = grown.iterate_nodes(&key).collect();
                let replicas = &order[..order.len().min(params.backups + 1)];
                let displaced = order.get(params.backups + 1) == Some(&name.as_str());
                if displaced && replicas.contains(&params.new.as_str()) {
                    let collection = storage.for_user(&domain, &user, &bucket)?;
                    if !collection.is_deprecated() {
                        collection.deprecate()?;
                    }
                    reported.push(CollectionRef {
                        domain,
                        user,
                        bucket,
                    });
                }
            }
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(reported)
        })
        .await;

        match work {
            Ok(Ok(collections)) => {
                json_response(StatusCode::OK, &DeprecatedListing { collections })
            }
            Ok(Err(error)) => {
                warn!(message = "query-deprecate scan failed.", %error);
                internal_error("deprecation scan failed")
            }
            Err(error) => {
                error!(message = "Deprecation task panicked.", %error);
                internal_error("deprecation scan failed")
            }
        }
    }

    /// `/remove-self`: stop taking writes, push every local collection to
    /// its newly promoted holder, and clear the root once everything made
    /// it out.
    pub(crate) async fn remove_self(
        self: &Arc<Self>,
        cluster: &Arc<Cluster>,
        body: &Bytes,
    ) -> Response<Bytes> {
        let Ok(params) = serde_json::from_slice::<RemoveSelfRequest>(body) else {
            return bad_request("invalid remove-self request");
        };
        info!(message = "Draining for removal.", node = %self.name);

        let full = HashRing::new(params.nodes.iter().map(String::as_str));
        let shrunk = full.without_node(&self.name);
        let name = self.name.clone();
        let storage = self.storage.clone();

        let planned = tokio::task::spawn_blocking(move || {
            storage.disable()?;
            plan_transfers(&storage, &full, &shrunk, params.backups, |old_set, _| {
                old_set.iter().any(|n| n == &name)
            })
        })
        .await;
        let planned = match planned {
            Ok(Ok(planned)) => planned,
            Ok(Err(error)) => {
                warn!(message = "Drain planning failed.", %error);
                return internal_error("drain planning failed");
            }
            Err(error) => {
                error!(message = "Drain task panicked.", %error);
                return internal_error("drain planning failed");
            }
        };

        let count = planned.len();
        for transfer in planned {
            let request = internal_request(
                Method::POST,
                &format!("{}?paste", transfer.path),
                Bytes::from(transfer.stream),
            );
            if let Err(error) = cluster.dispatch_ok(&transfer.target, request).await {
                // Leaving the data in place beats clearing a root that a
                // successor never received.
                warn!(
                    message = "Drain transfer failed; keeping local data.",
                    node = %transfer.target,
                    %error,
                );
                return internal_error("drain transfer failed");
            }
        }

        let storage = self.storage.clone();
        match tokio::task::spawn_blocking(move || storage.clear()).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                warn!(message = "Failed to clear drained storage.", %error);
                return internal_error("failed to clear storage");
            }
            Err(error) => {
                error!(message = "Clear task panicked.", %error);
                return internal_error("failed to clear storage");
            }
        }

        json_response(StatusCode::OK, &serde_json::json!({ "transferred": count }))
    }

    /// `/take-over`: restore the collections this node shared with the
    /// dead one, if this node is the first surviving holder.
    pub(crate) async fn take_over(
        self: &Arc<Self>,
        cluster: &Arc<Cluster>,
        body: &Bytes,
    ) -> Response<Bytes> {
        let Ok(params) = serde_json::from_slice::<TakeOverRequest>(body) else {
            return bad_request("invalid take-over request");
        };
        info!(message = "Taking over from a dead node.", node = %self.name, bad = %params.bad);

        let full = HashRing::new(params.nodes.iter().map(String::as_str));
        let shrunk = full.without_node(&params.bad);
        let name = self.name.clone();
        let bad = params.bad.clone();
        let storage = self.storage.clone();

        let planned = tokio::task::spawn_blocking(move || {
            plan_transfers(&storage, &full, &shrunk, params.backups, |old_set, _| {
                // First-elected-restorer: only the earliest survivor in
                // the old replica order restores, so the backups do not
                // trample each other pasting the same collection.
                old_set.iter().any(|n| n == &bad)
                    && old_set.iter().find(|n| **n != bad) == Some(&name)
            })
        })
        .await;
        let planned = match planned {
            Ok(Ok(planned)) => planned,
            Ok(Err(error)) => {
                warn!(message = "Take-over planning failed.", %error);
                return internal_error("take-over planning failed");
            }
            Err(error) => {
                error!(message = "Take-over task panicked.", %error);
                return internal_error("take-over planning failed");
            }
        };

        let mut restored = 0usize;
        for transfer in planned {
            let request = internal_request(
                Method::POST,
                &format!("{}?paste", transfer.path),
                Bytes::from(transfer.stream),
            );
            match cluster.dispatch_ok(&transfer.target, request).await {
                Ok(_) => restored += 1,
                Err(error) => {
                    warn!(
                        message = "Take-over transfer failed.",
                        node = %transfer.target,
                        %error,
                    );
                }
            }
        }

        json_response(StatusCode::OK, &serde_json::json!({ "restored": restored }))
    }
}

/// Walks every local collection and plans a transfer for each one whose
/// replica set gains a member between `old` and `new`, provided
/// `elected(old_set, new_set)` says this node is the one responsible.
fn plan_transfers<F>(
    storage: &logring_store::UserStorage,
    old: &HashRing,
    new: &HashRing,
    backups: usize,
    elected: F,
) -> Result<Vec<PlannedTransfer>, Box<dyn std::error::Error + Send + Sync>>
where
    F: Fn(&[String], &[String]) -> bool,
{
    let mut planned = Vec::new();
    for (domain, user, bucket) in storage.all_dbs()? {
        let key = collection_path(&domain, &user, &bucket);
        let old_set: Vec<String> = old
            .iterate_nodes(&key)
            .take(backups + 1)
            .map(str::to_string)
            .collect();
        let new_set: Vec<String> = new
            .iterate_nodes(&key)
            .take(backups + 1)
            .map(str::to_string)
            .collect();
        if !elected(&old_set, &new_set) {
            continue;
        }
        let Some(promoted) = new_set.iter().find(|n| !old_set.contains(n)) else {
            // Every surviving replica already holds it.
            continue;
        };

        let collection: Collection = storage.for_user(&domain, &user, &bucket)?;
        let mut stream = Vec::new();
        collection.encode(None, &mut stream)?;
        planned.push(PlannedTransfer {
            target: promoted.clone(),
            path: key,
            stream,
        });
    }
    Ok(planned)
}
