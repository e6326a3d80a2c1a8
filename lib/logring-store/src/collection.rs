//! One collection's directory: the active log plus its identity and
//! side-car state.
//!
//! Layout within the directory:
//!
//! ```text
//!   database, database.index      the active log
//!   collection_id.txt             identifier minted on first access
//!   collection_secret.txt         20 random bytes, keys blob names
//!   deprecated, deprecated.index  present iff the collection is frozen
//!   queue, queue.index            pending records during a bulk copy
//!   blobs/                        out-of-band payloads
//! ```
//!
//! A collection is created lazily; identity files are minted through
//! [`read_unique`], which guarantees at most one value is ever observed for
//! a path no matter how many processes race the mint.

use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use snafu::{ensure, Snafu};

use crate::blob::{blob_name, BlobError, BlobStore};
use crate::log::{Log, LogError};

pub(crate) const DATA_FILE: &str = "database";
pub(crate) const INDEX_FILE: &str = "database.index";
pub(crate) const DEPRECATED_DATA_FILE: &str = "deprecated";
pub(crate) const DEPRECATED_INDEX_FILE: &str = "deprecated.index";
pub(crate) const QUEUE_DATA_FILE: &str = "queue";
pub(crate) const QUEUE_INDEX_FILE: &str = "queue.index";
pub(crate) const ID_FILE: &str = "collection_id.txt";
pub(crate) const SECRET_FILE: &str = "collection_secret.txt";
const BLOBS_DIR: &str = "blobs";

const SECRET_LEN: usize = 20;

/// Error raised by [`Collection`] operations.
#[derive(Debug, Snafu)]
pub enum CollectionError {
    /// A general I/O error occurred.
    #[snafu(display("collection I/O error: {source}"), context(false))]
    Io { source: io::Error },

    /// The collection has been deprecated and no longer accepts writes.
    ///
    /// The files remain on disk for transfer; callers surface this as a
    /// retry-after condition.
    #[snafu(display("collection at {} is deprecated", dir.display()))]
    Deprecated { dir: PathBuf },

    /// The underlying log failed.
    #[snafu(display("{source}"), context(false))]
    Log { source: LogError },

    /// The blob store failed.
    #[snafu(display("{source}"), context(false))]
    Blob { source: BlobError },
}

/// Handle on one collection directory.
///
/// The handle is just the path; every operation opens the files it needs,
/// so handles are cheap to clone and safe to move across threads.
#[derive(Clone, Debug)]
pub struct Collection {
    dir: PathBuf,
}

impl Collection {
    /// Opens (creating if needed) the collection at `dir`.
    pub fn open<P: Into<PathBuf>>(dir: P) -> Result<Collection, CollectionError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Collection { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// True once the active log has been frozen by [`Collection::deprecate`].
    pub fn is_deprecated(&self) -> bool {
        self.file(DEPRECATED_INDEX_FILE).exists()
    }

    /// Opens the active log, failing if the collection is deprecated.
    pub fn db(&self) -> Result<Log, CollectionError> {
        ensure!(
            !self.is_deprecated(),
            DeprecatedSnafu {
                dir: self.dir.clone(),
            }
        );
        Ok(Log::open(self.file(DATA_FILE))?)
    }

    /// Opens the frozen log of a deprecated collection.
    pub fn deprecated_db(&self) -> Result<Log, CollectionError> {
        Ok(Log::open(self.file(DEPRECATED_DATA_FILE))?)
    }

    /// Opens (creating if needed) the pending queue log.
    pub fn queue_db(&self) -> Result<Log, CollectionError> {
        Ok(Log::open(self.file(QUEUE_DATA_FILE))?)
    }

    /// True while a bulk copy is in progress and writes are being queued.
    pub fn has_queue(&self) -> bool {
        self.file(QUEUE_INDEX_FILE).exists()
    }

    /// Drops the pending queue; done when a copy finishes (or is given
    /// up on) and the queued records have been accounted for.
    pub fn remove_queue(&self) -> Result<(), CollectionError> {
        remove_if_present(&self.file(QUEUE_INDEX_FILE))?;
        remove_if_present(&self.file(QUEUE_DATA_FILE))?;
        Ok(())
    }

    /// Freezes the collection: the active log files become the deprecated
    /// ones, under the complete lock so no append slips past the rename.
    pub fn deprecate(&self) -> Result<(), CollectionError> {
        ensure!(
            !self.is_deprecated(),
            DeprecatedSnafu {
                dir: self.dir.clone(),
            }
        );
        let log = Log::open(self.file(DATA_FILE))?;
        log.rename(
            &self.file(DEPRECATED_DATA_FILE),
            &self.file(DEPRECATED_INDEX_FILE),
        )?;
        Ok(())
    }

    /// The collection identifier, minted from the clock on first access.
    ///
    /// Clients compare this against the id they last saw to detect that a
    /// collection was reset or moved.
    pub fn collection_id(&self) -> Result<String, CollectionError> {
        let bytes = read_unique(&self.file(ID_FILE), mint_collection_id)?;
        Ok(String::from_utf8_lossy(&bytes).trim().to_string())
    }

    /// Adopts an id minted elsewhere; backups take the primary's id when
    /// catching up.
    pub fn set_collection_id(&self, id: &str) -> Result<(), CollectionError> {
        fs::write(self.file(ID_FILE), id.as_bytes())?;
        Ok(())
    }

    /// The collection secret, minted on first access.
    pub fn collection_secret(&self) -> Result<Vec<u8>, CollectionError> {
        Ok(read_unique(&self.file(SECRET_FILE), mint_secret)?)
    }

    /// True when nothing has ever been stored here: no deprecated log, no
    /// queue, and an active log without records.
    pub fn is_empty(&self) -> Result<bool, CollectionError> {
        if self.is_deprecated() || self.has_queue() {
            return Ok(false);
        }
        if !self.file(INDEX_FILE).exists() {
            return Ok(true);
        }
        Ok(self.db()?.length()? == 0)
    }

    /// Removes the collection directory recursively.
    pub fn clear(&self) -> Result<(), CollectionError> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// The blob store for this collection.
    pub fn blobs(&self) -> BlobStore {
        BlobStore::new(self.file(BLOBS_DIR))
    }

    /// Derives the blob name for `(record_type, record_id)` under this
    /// collection's secret.
    pub fn blob_name(&self, record_type: &str, record_id: &str) -> Result<String, CollectionError> {
        let secret = self.collection_secret()?;
        Ok(blob_name(&secret, record_type, record_id))
    }

    /// Stores a blob under its derived name, returning the name.
    pub fn save_blob(
        &self,
        record_type: &str,
        record_id: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<String, CollectionError> {
        let name = self.blob_name(record_type, record_id)?;
        self.blobs().save(&name, content_type, data)?;
        Ok(name)
    }

    /// Fetches a blob by its stored name.
    pub fn get_blob(&self, name: &str) -> Result<Option<(String, Vec<u8>)>, CollectionError> {
        Ok(self.blobs().get(name)?)
    }

    /// Removes the blob attached to `(record_type, record_id)` if one
    /// exists; called when a deletion record lands.
    pub fn maybe_delete_blob(
        &self,
        record_type: &str,
        record_id: &str,
    ) -> Result<bool, CollectionError> {
        let name = self.blob_name(record_type, record_id)?;
        Ok(self.blobs().delete(&name)?)
    }

    /// Serializes the collection into the transfer stream; see
    /// [`crate::transfer::encode`].
    pub fn encode<W: io::Write>(
        &self,
        until: Option<u32>,
        writer: &mut W,
    ) -> Result<(), crate::transfer::TransferError> {
        crate::transfer::encode(self, until, writer)
    }

    /// Replaces the collection from a transfer stream; see
    /// [`crate::transfer::decode`].
    pub fn decode<R: io::Read>(
        &self,
        reader: &mut R,
        append_queue: bool,
    ) -> Result<(), crate::transfer::TransferError> {
        crate::transfer::decode(self, reader, append_queue)
    }
}

/// Reads the value at `path`, minting it with `mint` on first access.
///
/// If the file exists its contents win. Otherwise the minted value is
/// written through an exclusive create; losing that race to another
/// process falls back to reading the winner's value. Either way, every
/// caller for the lifetime of the path observes the same bytes.
pub fn read_unique<F>(path: &Path, mint: F) -> io::Result<Vec<u8>>
where
    F: FnOnce() -> Vec<u8>,
{
    match fs::read(path) {
        Ok(bytes) => return Ok(bytes),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let value = mint();
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            file.write_all(&value)?;
            Ok(value)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => fs::read(path),
        Err(e) => Err(e),
    }
}

fn mint_collection_id() -> Vec<u8> {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0);
    format!("{:06}", micros % 1_000_000).into_bytes()
}

fn mint_secret() -> Vec<u8> {
    let mut secret = vec![0u8; SECRET_LEN];
    rand::rng().fill_bytes(&mut secret);
    secret
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::Expect;

    fn temp_collection() -> (tempfile::TempDir, Collection) {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let collection = Collection::open(dir.path().join("c")).expect("should open");
        (dir, collection)
    }

    #[test]
    fn identity_is_minted_once() {
        let (_dir, collection) = temp_collection();
        let id = collection.collection_id().unwrap();
        assert_eq!(id.len(), 6);
        assert!(id.bytes().all(|b| b.is_ascii_digit()));
        assert_eq!(id, collection.collection_id().unwrap());

        let secret = collection.collection_secret().unwrap();
        assert_eq!(secret.len(), SECRET_LEN);
        assert_eq!(secret, collection.collection_secret().unwrap());
    }

    #[test]
    fn read_unique_prefers_existing_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("value");
        fs::write(&path, b"already-here").unwrap();
        let got = read_unique(&path, || b"minted".to_vec()).unwrap();
        assert_eq!(got, b"already-here");
    }

    #[test]
    fn deprecate_freezes_the_active_log() {
        let (_dir, collection) = temp_collection();
        collection
            .db()
            .unwrap()
            .extend(&["a", "b"], Expect::NONE)
            .unwrap();

        collection.deprecate().unwrap();
        assert!(collection.is_deprecated());
        assert!(matches!(
            collection.db().unwrap_err(),
            CollectionError::Deprecated { .. }
        ));
        assert!(collection.deprecate().is_err());

        let mut frozen = collection.deprecated_db().unwrap();
        assert_eq!(frozen.length().unwrap(), 2);
    }

    #[test]
    fn emptiness_tracks_records_and_side_logs() {
        let (_dir, collection) = temp_collection();
        assert!(collection.is_empty().unwrap());

        let mut db = collection.db().unwrap();
        assert!(collection.is_empty().unwrap());
        db.extend(&["x"], Expect::NONE).unwrap();
        assert!(!collection.is_empty().unwrap());

        db.clear().unwrap();
        assert!(collection.is_empty().unwrap());

        collection.queue_db().unwrap();
        assert!(!collection.is_empty().unwrap());
        collection.remove_queue().unwrap();
        assert!(collection.is_empty().unwrap());
    }

    #[test]
    fn adopted_id_replaces_the_minted_one() {
        let (_dir, collection) = temp_collection();
        collection.collection_id().unwrap();
        collection.set_collection_id("424242").unwrap();
        assert_eq!(collection.collection_id().unwrap(), "424242");
    }

    #[test]
    fn clear_removes_the_directory() {
        let (_dir, collection) = temp_collection();
        collection
            .db()
            .unwrap()
            .extend(&["x"], Expect::NONE)
            .unwrap();
        collection.clear().unwrap();
        assert!(!collection.dir().exists());
        // Clearing an absent collection is fine.
        collection.clear().unwrap();
    }
}
