//! One storage node: every per-collection operation, plus the write-path
//! replication fan-out.
//!
//! A node handles exactly what would arrive on its wire: client reads and
//! writes against `/<domain>/<user>/<bucket>`, the internal transfer verbs
//! (`?copy`, `?paste`, `?deprecate`, `?delete`, `?gc`), replica
//! `apply_backup` posts, and the coordination RPCs (which live in
//! [`crate::coordinator`]). All storage work runs on the blocking pool;
//! the async side only parses, replies, and talks to other nodes.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use percent_encoding::percent_decode_str;
use serde::Serialize;
use serde_json::value::RawValue;
use serde_json::Value;
use snafu::Snafu;

use logring_store::{
    BlobError, Collection, CollectionError, Expect, Log, LogError, TransferError, UserStorage,
};

use crate::cluster::Cluster;
use crate::http::{
    bad_request, bytes_response, internal_error, internal_request, json_response, not_found,
    retry_after, Query, BACKUP_TO,
};

/// Error raised inside a node operation; converted to a response at the
/// handler boundary.
#[derive(Debug, Snafu)]
pub(crate) enum NodeError {
    #[snafu(display("{source}"), context(false))]
    Collection { source: CollectionError },

    #[snafu(display("{source}"), context(false))]
    Log { source: LogError },

    #[snafu(display("{source}"), context(false))]
    Transfer { source: TransferError },

    #[snafu(display("{source}"), context(false))]
    Blob { source: BlobError },

    #[snafu(display("{source}"), context(false))]
    Io { source: io::Error },

    #[snafu(display("{message}"))]
    BadRequest { message: String },
}

impl NodeError {
    pub(crate) fn bad_request(message: impl Into<String>) -> NodeError {
        NodeError::BadRequest {
            message: message.into(),
        }
    }
}

fn error_response(error: NodeError) -> Response<Bytes> {
    match &error {
        NodeError::BadRequest { message } => bad_request(message),
        NodeError::Collection {
            source: CollectionError::Deprecated { .. },
        } => retry_after("collection is deprecated"),
        NodeError::Log {
            source: LogError::ExpectationFailed { .. },
        } => json_response(
            StatusCode::PRECONDITION_FAILED,
            &serde_json::json!({ "error": "expectation failed" }),
        ),
        _ => {
            warn!(message = "Node operation failed.", error = %error);
            internal_error(&error.to_string())
        }
    }
}

/// Runs blocking storage work on the blocking pool and maps failures into
/// responses.
async fn run_blocking<F>(work: F) -> Response<Bytes>
where
    F: FnOnce() -> Result<Response<Bytes>, NodeError> + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(Ok(response)) => response,
        Ok(Err(error)) => error_response(error),
        Err(error) => {
            error!(message = "Storage task panicked.", %error);
            internal_error("storage task failed")
        }
    }
}

/// The canonical ring key / request path for a collection.
pub fn collection_path(domain: &str, user: &str, bucket: &str) -> String {
    format!(
        "/{}/{}/{}",
        logring_store::encode_segment(domain),
        logring_store::encode_segment(user),
        logring_store::encode_segment(bucket),
    )
}

fn decode_segment(segment: &str) -> String {
    percent_decode_str(segment).decode_utf8_lossy().into_owned()
}

/// One node of the cluster.
pub struct Node {
    pub(crate) name: String,
    pub(crate) storage: UserStorage,
}

#[derive(Serialize)]
struct ReadResponse {
    objects: Vec<(u32, Box<RawValue>)>,
    collection_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    incomplete: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    collection_changed: Option<bool>,
}

struct WriteApplied {
    first: u32,
    count: u32,
    collection_id: String,
    stored: Vec<String>,
}

enum WriteOutcome {
    Applied(WriteApplied),
    InvalidSince {
        objects: Vec<(u32, Box<RawValue>)>,
        collection_id: String,
    },
}

enum BackupOutcome {
    Applied,
    Queued,
    NeedCopy { until: u32 },
}

impl Node {
    /// Creates the node named `name` with its storage root at `root`.
    pub fn new<S: Into<String>, P: Into<PathBuf>>(name: S, root: P) -> io::Result<Arc<Node>> {
        Ok(Arc::new(Node {
            name: name.into(),
            storage: UserStorage::new(root)?,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage(&self) -> &UserStorage {
        &self.storage
    }

    /// Serves one request addressed to this node.
    pub async fn handle(
        self: &Arc<Self>,
        cluster: &Arc<Cluster>,
        req: Request<Bytes>,
    ) -> Response<Bytes> {
        let path = req.uri().path().trim_matches('/').to_string();
        let segments: Vec<&str> = path.split('/').collect();
        match (req.method().clone(), segments.as_slice()) {
            (Method::POST, ["node-added"]) => self.node_added(cluster, req.body()).await,
            (Method::POST, ["query-deprecate"]) => self.query_deprecate(req.body()).await,
            (Method::POST, ["remove-self"]) => self.remove_self(cluster, req.body()).await,
            (Method::POST, ["take-over"]) => self.take_over(cluster, req.body()).await,
            (_, [domain, user, bucket]) => {
                let (domain, user, bucket) = (
                    decode_segment(domain),
                    decode_segment(user),
                    decode_segment(bucket),
                );
                self.collection_op(cluster, req, &domain, &user, &bucket)
                    .await
            }
            _ => not_found(),
        }
    }

    fn collection(&self, domain: &str, user: &str, bucket: &str) -> Result<Collection, NodeError> {
        Ok(self.storage.for_user(domain, user, bucket)?)
    }

    async fn collection_op(
        self: &Arc<Self>,
        cluster: &Arc<Cluster>,
        req: Request<Bytes>,
        domain: &str,
        user: &str,
        bucket: &str,
    ) -> Response<Bytes> {
        let query = Query::parse(req.uri().query());
        let collection = match self.collection(domain, user, bucket) {
            Ok(collection) => collection,
            Err(error) => return error_response(error),
        };

        let method = req.method().clone();
        match method {
            Method::GET if query.has("copy") => self.op_copy(collection, &query).await,
            Method::GET if query.get("blob").is_some() => self.op_blob(collection, &query).await,
            Method::GET if query.has("delete") => self.op_delete(collection).await,
            Method::GET => self.op_read(collection, &query).await,
            Method::POST if query.has("paste") => self.op_paste(collection, req.into_body()).await,
            Method::POST if query.has("deprecate") => self.op_deprecate(collection).await,
            Method::POST if query.has("delete") => self.op_delete(collection).await,
            Method::POST if query.has("gc") => self.op_gc(collection).await,
            Method::POST if query.get("backup-from-pos").is_some() => {
                self.op_apply_backup(cluster, collection, req, &query).await
            }
            Method::POST => {
                self.op_write(cluster, collection, req, &query, domain, user, bucket)
                    .await
            }
            _ => not_found(),
        }
    }

    async fn op_read(&self, collection: Collection, query: &Query) -> Response<Bytes> {
        let since = match query.get_u32("since") {
            Ok(value) => value.unwrap_or(0),
            Err(response) => return response,
        };
        let limit = match query.get_u32("limit") {
            Ok(value) => value.map(|v| v as usize),
            Err(response) => return response,
        };
        let include: Vec<String> = query.get_all("include").iter().map(|s| s.to_string()).collect();
        let exclude: Vec<String> = query.get_all("exclude").iter().map(|s| s.to_string()).collect();
        let client_id = query.get("collection_id").map(str::to_string);

        run_blocking(move || {
            let collection_id = collection.collection_id()?;
            let mut since = since;
            let collection_changed = match client_id {
                Some(seen) if seen != collection_id => {
                    since = 0;
                    true
                }
                _ => false,
            };
            let mut db = collection.db()?;
            let (objects, incomplete) = read_objects(&mut db, since, limit, &include, &exclude)?;
            Ok(json_response(
                StatusCode::OK,
                &ReadResponse {
                    objects,
                    collection_id,
                    incomplete: incomplete.then_some(true),
                    collection_changed: collection_changed.then_some(true),
                },
            ))
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn op_write(
        self: &Arc<Self>,
        cluster: &Arc<Cluster>,
        collection: Collection,
        req: Request<Bytes>,
        query: &Query,
        domain: &str,
        user: &str,
        bucket: &str,
    ) -> Response<Bytes> {
        if self.storage.is_disabled() {
            return retry_after("node is draining");
        }
        let since = match query.get_u32("since") {
            Ok(value) => value,
            Err(response) => return response,
        };
        let include: Vec<String> = query.get_all("include").iter().map(|s| s.to_string()).collect();
        let exclude: Vec<String> = query.get_all("exclude").iter().map(|s| s.to_string()).collect();

        let records: Vec<Value> = match serde_json::from_slice(req.body()) {
            Ok(records) => records,
            Err(_) => return bad_request("body must be a JSON array of records"),
        };
        if records.iter().any(|r| !r.is_object()) {
            return bad_request("every record must be a JSON object");
        }
        if records.is_empty() {
            return json_response(
                StatusCode::OK,
                &serde_json::json!({ "object_counters": [] }),
            );
        }

        let backup_to = req
            .headers()
            .get(BACKUP_TO)
            .and_then(|v| v.to_str().ok())
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let write_collection = collection.clone();
        let outcome = run_blocking_result(move || {
            write_records(write_collection, records, since, include, exclude)
        })
        .await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(error) => return error_response(error),
        };

        match outcome {
            WriteOutcome::InvalidSince {
                objects,
                collection_id,
            } => json_response(
                StatusCode::OK,
                &serde_json::json!({
                    "invalid_since": true,
                    "objects": objects,
                    "collection_id": collection_id,
                }),
            ),
            WriteOutcome::Applied(applied) => {
                self.replicate(cluster, &applied, &backup_to, domain, user, bucket);
                let counters: Vec<u32> =
                    (applied.first..applied.first + applied.count).collect();
                json_response(
                    StatusCode::OK,
                    &serde_json::json!({ "object_counters": counters }),
                )
            }
        }
    }

    /// Fans the write out to every replica named by the router,
    /// fire-and-forget: a failed backup is a warning, not an error, and
    /// heals via catch-up on the next apply.
    fn replicate(
        self: &Arc<Self>,
        cluster: &Arc<Cluster>,
        applied: &WriteApplied,
        backup_to: &[String],
        domain: &str,
        user: &str,
        bucket: &str,
    ) {
        if backup_to.is_empty() {
            return;
        }
        let path = collection_path(domain, user, bucket);
        let body = format!("[{}]", applied.stored.join(","));
        let last_pos = applied.first - 1;
        let source = logring_store::encode_segment(&self.name);
        let collection_id = &applied.collection_id;
        for target in backup_to {
            if target == &self.name {
                continue;
            }
            let uri = format!(
                "{path}?backup-from-pos={last_pos}&source={source}&collection_id={collection_id}"
            );
            let request = internal_request(Method::POST, &uri, Bytes::from(body.clone()));
            let cluster = Arc::clone(cluster);
            let target = target.clone();
            tokio::spawn(async move {
                match cluster.dispatch(&target, request).await {
                    Ok(response) if !response.status().is_success() => {
                        warn!(
                            message = "Backup replica refused the update.",
                            node = %target,
                            status = %response.status(),
                        );
                    }
                    Err(error) => {
                        warn!(
                            message = "Backup replication failed.",
                            node = %target,
                            %error,
                        );
                    }
                    _ => {}
                }
            });
        }
    }

    async fn op_apply_backup(
        self: &Arc<Self>,
        cluster: &Arc<Cluster>,
        collection: Collection,
        req: Request<Bytes>,
        query: &Query,
    ) -> Response<Bytes> {
        if self.storage.is_disabled() {
            return retry_after("node is draining");
        }
        let pos = match query.get_u32("backup-from-pos") {
            Ok(Some(pos)) => pos,
            Ok(None) | Err(_) => return bad_request("backup-from-pos must be an integer"),
        };
        let Some(source) = query.get("source").map(str::to_string) else {
            return bad_request("source node is required");
        };
        let canonical_id = query.get("collection_id").map(str::to_string);

        let records: Vec<Box<RawValue>> = match serde_json::from_slice(req.body()) {
            Ok(records) => records,
            Err(_) => return bad_request("body must be a JSON array of records"),
        };
        let payloads: Vec<Vec<u8>> = records
            .iter()
            .map(|raw| raw.get().as_bytes().to_vec())
            .collect();

        let apply_collection = collection.clone();
        let outcome = run_blocking_result(move || {
            apply_backup_records(apply_collection, pos, payloads, canonical_id)
        })
        .await;

        match outcome {
            Err(error) => error_response(error),
            Ok(BackupOutcome::Applied) => {
                json_response(StatusCode::OK, &serde_json::json!({ "ok": true }))
            }
            Ok(BackupOutcome::Queued) => {
                json_response(StatusCode::OK, &serde_json::json!({ "queued": true }))
            }
            Ok(BackupOutcome::NeedCopy { until }) => {
                self.catch_up(cluster, collection, req.uri().path(), &source, until)
                    .await
            }
        }
    }

    /// Pulls the canonical prefix from `source` and restores it locally,
    /// merging in whatever accumulated in the queue meanwhile.
    async fn catch_up(
        self: &Arc<Self>,
        cluster: &Arc<Cluster>,
        collection: Collection,
        path: &str,
        source: &str,
        until: u32,
    ) -> Response<Bytes> {
        info!(
            message = "Replica is behind; catching up from source.",
            node = %self.name,
            %source,
            %until,
        );
        let uri = format!("{path}?copy&until={until}");
        let copied = match cluster
            .dispatch_ok(source, internal_request(Method::GET, &uri, Bytes::new()))
            .await
        {
            Ok(response) => response.into_body(),
            Err(error) => {
                warn!(message = "Catch-up copy failed.", %error);
                // Drop the queue so the next apply triggers a fresh copy
                // instead of queueing behind one that will never finish.
                let cleanup = collection.clone();
                let _ = tokio::task::spawn_blocking(move || cleanup.remove_queue()).await;
                return internal_error("catch-up copy failed");
            }
        };
        run_blocking(move || {
            collection.decode(&mut &copied[..], true)?;
            Ok(json_response(
                StatusCode::OK,
                &serde_json::json!({ "caught_up": true }),
            ))
        })
        .await
    }

    async fn op_copy(&self, collection: Collection, query: &Query) -> Response<Bytes> {
        let until = match query.get_u32("until") {
            Ok(until) => until,
            Err(response) => return response,
        };
        run_blocking(move || {
            let mut stream = Vec::new();
            collection.encode(until, &mut stream)?;
            Ok(bytes_response(
                StatusCode::OK,
                "application/octet-stream",
                Bytes::from(stream),
            ))
        })
        .await
    }

    async fn op_paste(&self, collection: Collection, body: Bytes) -> Response<Bytes> {
        run_blocking(move || {
            collection.decode(&mut &body[..], false)?;
            Ok(json_response(StatusCode::OK, &serde_json::json!({ "ok": true })))
        })
        .await
    }

    async fn op_deprecate(&self, collection: Collection) -> Response<Bytes> {
        run_blocking(move || {
            collection.deprecate()?;
            Ok(json_response(StatusCode::OK, &serde_json::json!({ "ok": true })))
        })
        .await
    }

    async fn op_delete(&self, collection: Collection) -> Response<Bytes> {
        run_blocking(move || {
            collection.clear()?;
            Ok(json_response(StatusCode::OK, &serde_json::json!({ "ok": true })))
        })
        .await
    }

    async fn op_gc(&self, collection: Collection) -> Response<Bytes> {
        run_blocking(move || {
            let removed = crate::gc::collect(&collection)?;
            Ok(json_response(
                StatusCode::OK,
                &serde_json::json!({ "removed": removed }),
            ))
        })
        .await
    }

    async fn op_blob(&self, collection: Collection, query: &Query) -> Response<Bytes> {
        let Some(name) = query.get("blob").map(str::to_string) else {
            return bad_request("blob name is required");
        };
        run_blocking(move || {
            match collection.get_blob(&name)? {
                Some((content_type, data)) => Ok(bytes_response(
                    StatusCode::OK,
                    &content_type,
                    Bytes::from(data),
                )),
                None => Ok(not_found()),
            }
        })
        .await
    }
}

async fn run_blocking_result<T, F>(work: F) -> Result<T, NodeError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, NodeError> + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result,
        Err(error) => {
            error!(message = "Storage task panicked.", %error);
            Err(NodeError::Io {
                source: io::Error::other("storage task failed"),
            })
        }
    }
}

pub(crate) fn record_type(value: &Value) -> &str {
    value.get("type").and_then(Value::as_str).unwrap_or("")
}

fn filtered_out(record_type: &str, include: &[String], exclude: &[String]) -> bool {
    if !include.is_empty() && !include.iter().any(|t| t == record_type) {
        return true;
    }
    exclude.iter().any(|t| t == record_type)
}

pub(crate) fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Reads records above `since`, applying type filters and the result
/// limit; the second return says whether the limit cut the result short.
fn read_objects(
    db: &mut Log,
    since: u32,
    limit: Option<usize>,
    include: &[String],
    exclude: &[String],
) -> Result<(Vec<(u32, Box<RawValue>)>, bool), NodeError> {
    let filtering = !include.is_empty() || !exclude.is_empty();
    let mut objects = Vec::new();
    let mut incomplete = false;
    for record in db.read(since, None)? {
        let (counter, payload) = record?;
        if filtering {
            let value: Value = serde_json::from_slice(&payload)
                .map_err(|_| NodeError::bad_request("stored record is not valid JSON"))?;
            if filtered_out(record_type(&value), include, exclude) {
                continue;
            }
        }
        if let Some(limit) = limit {
            if objects.len() == limit {
                incomplete = true;
                break;
            }
        }
        let text = String::from_utf8(payload)
            .map_err(|_| NodeError::bad_request("stored record is not valid JSON"))?;
        let raw = RawValue::from_string(text)
            .map_err(|_| NodeError::bad_request("stored record is not valid JSON"))?;
        objects.push((counter, raw));
    }
    Ok((objects, incomplete))
}

/// The write path proper: peel blobs off, append under the client's
/// `since` expectation (retrying past records its filters hide), then
/// settle blob side effects.
fn write_records(
    collection: Collection,
    mut records: Vec<Value>,
    since: Option<u32>,
    include: Vec<String>,
    exclude: Vec<String>,
) -> Result<WriteOutcome, NodeError> {
    let mut blobs: Vec<(String, String, Vec<u8>)> = Vec::new();
    for record in &mut records {
        let record_type = record_type(record).to_string();
        let record_id = record
            .get("id")
            .map(value_to_string)
            .unwrap_or_default();
        let map = record
            .as_object_mut()
            .expect("records were validated as objects");
        if let Some(blob) = map.get("blob") {
            let Some(blob) = blob.as_object() else {
                return Err(NodeError::bad_request("blob must be an object"));
            };
            let Some(data) = blob.get("data").and_then(Value::as_str) else {
                return Err(NodeError::bad_request("blob data must be base64 text"));
            };
            let bytes = base64_decode(data)
                .ok_or_else(|| NodeError::bad_request("blob data must be base64 text"))?;
            let content_type = blob
                .get("content_type")
                .and_then(Value::as_str)
                .unwrap_or("application/octet-stream")
                .to_string();
            let name = collection.blob_name(&record_type, &record_id)?;
            map.insert(
                "blob".to_string(),
                serde_json::json!({
                    "href": format!("?blob={name}"),
                    "content_type": content_type,
                }),
            );
            blobs.push((name, content_type, bytes));
        }
    }

    let stored: Vec<String> = records
        .iter()
        .map(|record| serde_json::to_string(record))
        .collect::<Result<_, _>>()
        .map_err(|_| NodeError::bad_request("record is not serializable"))?;
    let payloads: Vec<&[u8]> = stored.iter().map(|s| s.as_bytes()).collect();

    let collection_id = collection.collection_id()?;
    let mut db = collection.db()?;
    let filtering = !include.is_empty() || !exclude.is_empty();
    let original_since = since.unwrap_or(0);
    let mut expect = since.map(Expect::latest).unwrap_or_default();
    let mut floor = original_since;
    let mut retries = 0;

    let first = loop {
        match db.extend(&payloads, expect) {
            Ok(first) => break first,
            Err(LogError::ExpectationFailed { current }) => {
                // The retry path only applies when the client told us which
                // record types it actually watches.
                if !filtering || retries == 3 {
                    let (objects, _) =
                        read_objects(&mut db, original_since, None, &include, &exclude)?;
                    return Ok(WriteOutcome::InvalidSince {
                        objects,
                        collection_id,
                    });
                }
                let mut invisible = true;
                for record in db.read(floor, Some(current))? {
                    let (_, payload) = record?;
                    let value: Value = serde_json::from_slice(&payload)
                        .map_err(|_| NodeError::bad_request("stored record is not valid JSON"))?;
                    if !filtered_out(record_type(&value), &include, &exclude) {
                        invisible = false;
                        break;
                    }
                }
                if !invisible {
                    let (objects, _) =
                        read_objects(&mut db, original_since, None, &include, &exclude)?;
                    return Ok(WriteOutcome::InvalidSince {
                        objects,
                        collection_id,
                    });
                }
                floor = current;
                expect = Expect::latest(current);
                retries += 1;
            }
            Err(error) => return Err(error.into()),
        }
    };

    for (name, content_type, bytes) in &blobs {
        collection.blobs().save(name, content_type, bytes)?;
    }
    for record in &records {
        if record.get("deleted").and_then(Value::as_bool) == Some(true) {
            let record_id = record.get("id").map(value_to_string).unwrap_or_default();
            collection.maybe_delete_blob(record_type(record), &record_id)?;
        }
    }

    Ok(WriteOutcome::Applied(WriteApplied {
        first,
        count: stored.len() as u32,
        collection_id,
        stored,
    }))
}

/// A replica applying a primary's fan-out; see the coordination notes on
/// the queue for what happens when the replica is behind.
fn apply_backup_records(
    collection: Collection,
    pos: u32,
    payloads: Vec<Vec<u8>>,
    canonical_id: Option<String>,
) -> Result<BackupOutcome, NodeError> {
    let mut collection = collection;
    if let Some(canonical) = canonical_id {
        let local = collection.collection_id()?;
        if local != canonical {
            if !collection.is_empty()? {
                // The replica holds some other generation of this
                // collection; throw it away and adopt the canonical one.
                collection.clear()?;
                collection = Collection::open(collection.dir())?;
            }
            collection.set_collection_id(&canonical)?;
        }
    }

    let batch: Vec<(u32, &[u8])> = payloads
        .iter()
        .enumerate()
        .map(|(i, payload)| (pos + 1 + i as u32, payload.as_slice()))
        .collect();

    let mut db = collection.db()?;
    match db.extend_with_counters(&batch, Expect::last_counter(pos)) {
        Ok(_) => Ok(BackupOutcome::Applied),
        Err(LogError::ExpectationFailed { current }) => {
            let copying = collection.has_queue();
            debug!(
                message = "Replica position mismatch.",
                expected = pos,
                actual = current,
                copying,
            );
            let mut queue = collection.queue_db()?;
            match queue.extend_with_counters(&batch, Expect::NONE) {
                Ok(_) => {}
                // Duplicate delivery; the records are already queued.
                Err(LogError::CounterNotMonotonic { .. }) => {}
                Err(error) => return Err(error.into()),
            }
            if copying {
                Ok(BackupOutcome::Queued)
            } else {
                Ok(BackupOutcome::NeedCopy { until: pos })
            }
        }
        Err(error) => Err(error.into()),
    }
}

fn base64_decode(text: &str) -> Option<Vec<u8>> {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.decode(text).ok()
}
