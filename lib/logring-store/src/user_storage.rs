//! The per-node storage root: (domain, user, bucket) mapped onto a
//! three-level directory tree.
//!
//! Every path segment is percent-encoded with no characters considered
//! safe beyond `[A-Za-z0-9_.-]`, so a `/` (or anything else) inside an
//! identifier can never create an extra directory level. Enumeration walks
//! the tree looking for the `collection_id.txt` marker, which every
//! collection gains on its first use.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::collection::{Collection, CollectionError, ID_FILE};

/// Everything except `[A-Za-z0-9_.-]` gets encoded.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.');

const DISABLED_FILE: &str = "disabled";

/// Percent-encodes one path segment.
pub fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT).to_string()
}

fn decode_segment(segment: &str) -> String {
    percent_decode_str(segment).decode_utf8_lossy().into_owned()
}

/// The storage root of one node.
#[derive(Clone, Debug)]
pub struct UserStorage {
    root: PathBuf,
}

impl UserStorage {
    /// Opens (creating if needed) the storage root.
    pub fn new<P: Into<PathBuf>>(root: P) -> io::Result<UserStorage> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(UserStorage { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The collection for `(domain, user, bucket)`, created on first use.
    pub fn for_user(
        &self,
        domain: &str,
        user: &str,
        bucket: &str,
    ) -> Result<Collection, CollectionError> {
        let dir = self
            .root
            .join(encode_segment(domain))
            .join(encode_segment(user))
            .join(encode_segment(bucket));
        Collection::open(dir)
    }

    /// Enumerates every `(domain, user, bucket)` with a minted collection.
    pub fn all_dbs(&self) -> io::Result<Vec<(String, String, String)>> {
        let mut found = Vec::new();
        for domain in subdirs(&self.root)? {
            for user in subdirs(&domain.path)? {
                for bucket in subdirs(&user.path)? {
                    if bucket.path.join(ID_FILE).exists() {
                        found.push((
                            decode_segment(&domain.name),
                            decode_segment(&user.name),
                            decode_segment(&bucket.name),
                        ));
                    }
                }
            }
        }
        found.sort();
        Ok(found)
    }

    /// Marks this node as draining; new external writes get turned away.
    pub fn disable(&self) -> io::Result<()> {
        fs::write(self.root.join(DISABLED_FILE), b"")
    }

    pub fn is_disabled(&self) -> bool {
        self.root.join(DISABLED_FILE).exists()
    }

    /// Removes everything under the root, leaving an empty storage tree.
    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        fs::create_dir_all(&self.root)
    }
}

struct Subdir {
    name: String,
    path: PathBuf,
}

fn subdirs(dir: &Path) -> io::Result<Vec<Subdir>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(Subdir {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: entry.path(),
            });
        }
    }
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::Expect;

    #[test]
    fn segments_with_reserved_characters_stay_flat() {
        let dir = tempfile::tempdir().unwrap();
        let storage = UserStorage::new(dir.path().join("node")).unwrap();

        let collection = storage
            .for_user("example.com", "someone@example.com/extra", "bucket one")
            .unwrap();
        collection.collection_id().unwrap();

        // The slash in the user segment must not have created a fourth
        // directory level.
        let dbs = storage.all_dbs().unwrap();
        assert_eq!(
            dbs,
            vec![(
                "example.com".to_string(),
                "someone@example.com/extra".to_string(),
                "bucket one".to_string()
            )]
        );
    }

    #[test]
    fn enumeration_skips_unminted_collections() {
        let dir = tempfile::tempdir().unwrap();
        let storage = UserStorage::new(dir.path().join("node")).unwrap();

        let minted = storage.for_user("d", "u1", "b").unwrap();
        minted
            .db()
            .unwrap()
            .extend(&["x"], Expect::NONE)
            .unwrap();
        minted.collection_id().unwrap();

        // Opened but never used: no marker, not enumerated.
        storage.for_user("d", "u2", "b").unwrap();

        let dbs = storage.all_dbs().unwrap();
        assert_eq!(dbs.len(), 1);
        assert_eq!(dbs[0].1, "u1");
    }

    #[test]
    fn disable_flag_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = UserStorage::new(dir.path().join("node")).unwrap();
        assert!(!storage.is_disabled());
        storage.disable().unwrap();
        assert!(storage.is_disabled());

        storage.clear().unwrap();
        assert!(!storage.is_disabled());
        assert!(storage.all_dbs().unwrap().is_empty());
    }
}
