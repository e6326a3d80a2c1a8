//! Garbage collection over a collection's log.
//!
//! Records are JSON with an `id`, an optional `type`, and an optional
//! `expire` timestamp. A record is expendable once a later record carries
//! the same `(id, type)` (the log is append-only, so supersession is the
//! only form of update) or once its `expire` has passed. Collection runs
//! the log's exclude-list copy into a scratch directory unique to the
//! call -- concurrent collections must not share scratch files -- and
//! swaps it in with an atomic-to-readers overwrite.

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use logring_store::{Collection, Log};

use crate::node::{record_type, value_to_string, NodeError};

/// Counters of records that can be dropped: superseded by a later record
/// with the same `(id, type)`, or expired as of `expire_time`.
pub(crate) fn find_expendable(
    db: &mut Log,
    expire_time: f64,
    start: u32,
) -> Result<HashSet<u32>, NodeError> {
    let mut seen: HashMap<(String, String), u32> = HashMap::new();
    let mut expendable = HashSet::new();
    for record in db.read(start, None)? {
        let (counter, payload) = record?;
        let value: Value = serde_json::from_slice(&payload)
            .map_err(|_| NodeError::bad_request("stored record is not valid JSON"))?;
        let key = (
            value.get("id").map(value_to_string).unwrap_or_default(),
            record_type(&value).to_string(),
        );
        if let Some(superseded) = seen.get(&key) {
            expendable.insert(*superseded);
        }
        if let Some(expire) = value.get("expire").and_then(Value::as_f64) {
            if expire < expire_time {
                expendable.insert(counter);
                continue;
            }
        }
        seen.insert(key, counter);
    }
    Ok(expendable)
}

/// Compacts the collection in place, returning how many records were
/// dropped.
pub(crate) fn collect(collection: &Collection) -> Result<usize, NodeError> {
    let mut db = collection.db()?;
    let expendable = find_expendable(&mut db, now_secs_f64(), 0)?;
    if expendable.is_empty() {
        return Ok(0);
    }

    let scratch = tempfile::tempdir()?;
    let scratch_data = scratch.path().join("database");
    let scratch_index = scratch.path().join("database.index");
    db.copy(&expendable, &scratch_data, &scratch_index)?;
    db.overwrite(&scratch_data, &scratch_index)?;

    debug!(
        message = "Compacted collection.",
        dir = %collection.dir().display(),
        removed = expendable.len(),
    );
    Ok(expendable.len())
}

fn now_secs_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
