//! The length-prefixed stream that moves a whole collection between nodes.
//!
//! Layout, all lengths little-endian `u32`:
//!
//! ```text
//!   u32 id_len;  collection id bytes
//!   u32 sec_len; collection secret bytes
//!   u32 idx_len; index file prefix
//!   u32 dat_len; data file prefix
//! ```
//!
//! The index and data sections are byte-exact prefixes of the source log's
//! files, truncated at the positions for the requested `until` counter, so
//! a restored collection is indistinguishable from the source up to that
//! point. The decoder stages everything under `new_*` names and then
//! renames each into place; the renames are individually atomic but the
//! sequence is not transactional, so any `new_*` leftover on disk is a
//! hint that a restore was cut short and should be redone.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::PathBuf;

use snafu::{ensure, Snafu};

use crate::collection::{
    Collection, CollectionError, DATA_FILE, ID_FILE, INDEX_FILE, SECRET_FILE,
};
use crate::log::{Expect, Log, LogError};

const NEW_ID_FILE: &str = "new_collection_id.txt";
const NEW_SECRET_FILE: &str = "new_collection_secret.txt";
const NEW_DATA_FILE: &str = "new_database";
const NEW_INDEX_FILE: &str = "new_database.index";

/// Error raised while encoding or decoding a transfer stream.
#[derive(Debug, Snafu)]
pub enum TransferError {
    /// A general I/O error occurred.
    #[snafu(display("transfer I/O error: {source}"), context(false))]
    Io { source: io::Error },

    /// The stream ended inside a section.
    #[snafu(display("transfer stream is truncated in the {section} section"))]
    Truncated { section: &'static str },

    /// The source log shrank while its prefix was being copied.
    #[snafu(display("source {} shrank mid-transfer", path.display()))]
    SourceShrank { path: PathBuf },

    /// The collection failed.
    #[snafu(display("{source}"), context(false))]
    Collection { source: CollectionError },

    /// The underlying log failed.
    #[snafu(display("{source}"), context(false))]
    Log { source: LogError },
}

/// Serializes `collection` into `writer`, up to and including counter
/// `until` when one is given.
///
/// A deprecated collection dumps its frozen log; that is the whole point
/// of deprecation, the files stay put until they have been carried away.
pub fn encode<W: Write>(
    collection: &Collection,
    until: Option<u32>,
    writer: &mut W,
) -> Result<(), TransferError> {
    let id = collection.collection_id()?;
    let secret = collection.collection_secret()?;
    let mut log = if collection.is_deprecated() {
        collection.deprecated_db()?
    } else {
        collection.db()?
    };
    let (index_len, data_len) = log.get_file_positions(until)?;

    write_section(writer, id.as_bytes())?;
    write_section(writer, &secret)?;
    write_file_prefix(writer, log.index_path().to_path_buf(), index_len)?;
    write_file_prefix(writer, log.data_path().to_path_buf(), data_len)?;
    Ok(())
}

/// Restores `collection` from `reader`, replacing whatever it held.
///
/// With `append_queue`, records that accumulated in the queue log while
/// the stream was being produced are replayed on top of the restored
/// prefix (preserving their counters, skipping any the prefix already
/// covers) and the queue is removed, so nothing received during a copy is
/// lost.
pub fn decode<R: Read>(
    collection: &Collection,
    reader: &mut R,
    append_queue: bool,
) -> Result<(), TransferError> {
    let id = read_section(reader, "collection id")?;
    let secret = read_section(reader, "collection secret")?;
    let index = read_section(reader, "index")?;
    let data = read_section(reader, "data")?;

    fs::write(collection.file(NEW_ID_FILE), &id)?;
    fs::write(collection.file(NEW_SECRET_FILE), &secret)?;
    fs::write(collection.file(NEW_INDEX_FILE), &index)?;
    fs::write(collection.file(NEW_DATA_FILE), &data)?;

    {
        // Hold the complete lock over the live log while the staged files
        // move into place, so an in-flight append cannot interleave with
        // the swap.
        let live = Log::open(collection.file(DATA_FILE))?;
        let _guard = live.complete_lock()?;
        fs::rename(collection.file(NEW_ID_FILE), collection.file(ID_FILE))?;
        fs::rename(collection.file(NEW_SECRET_FILE), collection.file(SECRET_FILE))?;
        fs::rename(collection.file(NEW_DATA_FILE), collection.file(DATA_FILE))?;
        fs::rename(collection.file(NEW_INDEX_FILE), collection.file(INDEX_FILE))?;
    }

    if append_queue && collection.has_queue() {
        replay_queue(collection)?;
    }
    Ok(())
}

fn replay_queue(collection: &Collection) -> Result<(), TransferError> {
    let mut queued = Vec::new();
    {
        let mut queue = collection.queue_db()?;
        for record in queue.read(0, None)? {
            queued.push(record?);
        }
    }

    let mut restored = Log::open(collection.file(DATA_FILE))?;
    let covered = restored.length()?;
    let pending: Vec<(u32, Vec<u8>)> = queued
        .into_iter()
        .filter(|(counter, _)| *counter > covered)
        .collect();
    if !pending.is_empty() {
        restored.extend_with_counters(&pending, Expect::NONE)?;
    }
    collection.remove_queue()?;
    Ok(())
}

fn write_section<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<(), TransferError> {
    writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
    writer.write_all(bytes)?;
    Ok(())
}

fn write_file_prefix<W: Write>(
    writer: &mut W,
    path: PathBuf,
    len: u64,
) -> Result<(), TransferError> {
    writer.write_all(&(len as u32).to_le_bytes())?;
    let mut file = File::open(&path)?;
    let copied = io::copy(&mut Read::by_ref(&mut file).take(len), writer)?;
    ensure!(copied == len, SourceShrankSnafu { path });
    Ok(())
}

fn read_section<R: Read>(reader: &mut R, section: &'static str) -> Result<Vec<u8>, TransferError> {
    let mut len_buf = [0u8; 4];
    read_exact_or(reader, &mut len_buf, section)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut bytes = vec![0u8; len];
    read_exact_or(reader, &mut bytes, section)?;
    Ok(bytes)
}

fn read_exact_or<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    section: &'static str,
) -> Result<(), TransferError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            TruncatedSnafu { section }.fail()
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::INDEX_ENTRY_LEN;

    fn collection_in(dir: &tempfile::TempDir, name: &str) -> Collection {
        Collection::open(dir.path().join(name)).expect("should open collection")
    }

    #[test]
    fn round_trip_preserves_identity_and_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let source = collection_in(&dir, "source");
        source
            .db()
            .unwrap()
            .extend(&["alpha", "beta", "gamma"], Expect::NONE)
            .unwrap();
        let id = source.collection_id().unwrap();
        let secret = source.collection_secret().unwrap();

        let mut stream = Vec::new();
        encode(&source, None, &mut stream).unwrap();

        let target = collection_in(&dir, "target");
        decode(&target, &mut &stream[..], false).unwrap();

        assert_eq!(target.collection_id().unwrap(), id);
        assert_eq!(target.collection_secret().unwrap(), secret);
        assert_eq!(
            fs::read(source.file(DATA_FILE)).unwrap(),
            fs::read(target.file(DATA_FILE)).unwrap()
        );
        assert_eq!(
            fs::read(source.file(INDEX_FILE)).unwrap(),
            fs::read(target.file(INDEX_FILE)).unwrap()
        );

        let records: Vec<_> = target
            .db()
            .unwrap()
            .read(0, None)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2], (3, b"gamma".to_vec()));
    }

    #[test]
    fn until_slices_a_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let source = collection_in(&dir, "source");
        source
            .db()
            .unwrap()
            .extend(&["aa", "bb", "cc", "dd"], Expect::NONE)
            .unwrap();

        let mut stream = Vec::new();
        encode(&source, Some(2), &mut stream).unwrap();

        let target = collection_in(&dir, "target");
        decode(&target, &mut &stream[..], false).unwrap();

        let mut db = target.db().unwrap();
        assert_eq!(db.length().unwrap(), 2);
        assert_eq!(
            fs::metadata(target.file(INDEX_FILE)).unwrap().len(),
            3 * INDEX_ENTRY_LEN
        );
        assert_eq!(fs::read(target.file(DATA_FILE)).unwrap(), b"aabb");
    }

    #[test]
    fn deprecated_collections_dump_their_frozen_log() {
        let dir = tempfile::tempdir().unwrap();
        let source = collection_in(&dir, "source");
        source
            .db()
            .unwrap()
            .extend(&["frozen"], Expect::NONE)
            .unwrap();
        source.deprecate().unwrap();

        let mut stream = Vec::new();
        encode(&source, None, &mut stream).unwrap();

        let target = collection_in(&dir, "target");
        decode(&target, &mut &stream[..], false).unwrap();
        assert_eq!(target.db().unwrap().length().unwrap(), 1);
    }

    #[test]
    fn append_queue_replays_records_received_mid_copy() {
        let dir = tempfile::tempdir().unwrap();
        let source = collection_in(&dir, "source");
        source
            .db()
            .unwrap()
            .extend(&(1..=10).map(|i| i.to_string()).collect::<Vec<_>>(), Expect::NONE)
            .unwrap();

        let mut stream = Vec::new();
        encode(&source, Some(10), &mut stream).unwrap();

        // While the copy was in flight, two more replicated records landed
        // in the target's queue.
        let target = collection_in(&dir, "target");
        target
            .queue_db()
            .unwrap()
            .extend_with_counters(&[(11u32, "x"), (12, "y")], Expect::NONE)
            .unwrap();

        decode(&target, &mut &stream[..], true).unwrap();
        assert!(!target.has_queue());

        let mut db = target.db().unwrap();
        assert_eq!(db.length().unwrap(), 12);
        let tail: Vec<_> = db
            .read(10, None)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(tail, vec![(11, b"x".to_vec()), (12, b"y".to_vec())]);
    }

    #[test]
    fn truncated_streams_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let source = collection_in(&dir, "source");
        source.db().unwrap().extend(&["aa"], Expect::NONE).unwrap();

        let mut stream = Vec::new();
        encode(&source, None, &mut stream).unwrap();
        stream.truncate(stream.len() - 1);

        let target = collection_in(&dir, "target");
        let err = decode(&target, &mut &stream[..], false).unwrap_err();
        assert!(matches!(err, TransferError::Truncated { section: "data" }));
    }
}
