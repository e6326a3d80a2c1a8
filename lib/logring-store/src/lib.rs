//! The logring storage engine.
//!
//! This library implements the per-collection append-only log that backs a
//! logring node: a paired data+index file format with O(log n) counter
//! lookup, crash- and concurrency-safe appends under advisory file locking,
//! atomic overwrite, and compaction via exclude-list copy. On top of the raw
//! log it layers the collection directory (id, secret, deprecation, queue,
//! blobs), the per-node user storage tree, and the length-prefixed transfer
//! stream used to move whole collections between nodes.
//!
//! All I/O here is synchronous `std::fs`; callers running under an async
//! runtime are expected to enter through `spawn_blocking`. Safety between
//! concurrent writers -- including writers in other processes sharing the
//! same directory -- comes from advisory byte-range locks on the index
//! file, not from in-process synchronization.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

#[macro_use]
extern crate tracing;

mod blob;
mod collection;
mod lock;
mod log;
mod transfer;
mod user_storage;

pub use blob::{blob_name, BlobError, BlobStore};
pub use collection::{read_unique, Collection, CollectionError};
pub use log::{Expect, Log, LogError, Records, INDEX_ENTRY_LEN};
pub use transfer::{decode, encode, TransferError};
pub use user_storage::{encode_segment, UserStorage};
