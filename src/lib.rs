//! logring: a horizontally-partitioned, replicated, append-only log store
//! for small JSON records.
//!
//! Clients push ordered batches of records into per-`(domain, user,
//! bucket)` collections and pull them back "since" a monotonic counter.
//! Collections are hash-ringed across nodes with a configurable number of
//! backup replicas; the cluster supports graceful addition and removal of
//! nodes and takeover after a node death. The storage engine itself lives
//! in the `logring-store` crate; this crate is the node: routing,
//! replication, and the membership protocols.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

#[macro_use]
extern crate tracing;

pub mod app;
pub mod auth;
pub mod cli;
pub mod cluster;
pub mod config;
mod coordinator;
mod gc;
pub mod http;
pub mod node;
pub mod ring;
pub mod router;
