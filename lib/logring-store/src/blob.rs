//! Out-of-band blob storage for a collection.
//!
//! Records stay small JSON; any binary payload a client inlines is peeled
//! off and stored under `blobs/<name>` with a `.content-type` sidecar, and
//! the record keeps only an href. Names are derived from the collection
//! secret so they cannot be guessed without it:
//! `hex(HMAC-SHA256(secret, record_type || "\0" || record_id))`.
//!
//! Writes go to a temp pair which is then renamed into place, payload last,
//! so a blob is either fully visible (with its content type) or absent.

use std::fmt::Write as _;
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use snafu::Snafu;

const CONTENT_TYPE_SUFFIX: &str = ".content-type";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Error raised by [`BlobStore`] operations.
#[derive(Debug, Snafu)]
pub enum BlobError {
    /// A general I/O error occurred.
    #[snafu(display("blob I/O error: {source}"), context(false))]
    Io { source: io::Error },

    /// The requested name escapes the blob directory.
    #[snafu(display("invalid blob name {name:?}"))]
    InvalidName { name: String },
}

/// Derives the storage name for the blob attached to `(record_type,
/// record_id)` under a collection's secret.
pub fn blob_name(secret: &[u8], record_type: &str, record_id: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(record_type.as_bytes());
    mac.update(b"\0");
    mac.update(record_id.as_bytes());
    let digest = mac.finalize().into_bytes();

    let mut name = String::with_capacity(digest.len() * 2);
    for byte in digest {
        write!(name, "{byte:02x}").expect("writing to a String cannot fail");
    }
    name
}

/// The `blobs/` directory of one collection.
#[derive(Clone, Debug)]
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        BlobStore { dir: dir.into() }
    }

    /// Stores `data` under `name` with the given content type.
    ///
    /// The payload and its content type land via rename, payload last, so
    /// readers never observe a blob without its content type or a partial
    /// payload.
    pub fn save(&self, name: &str, content_type: &str, data: &[u8]) -> Result<(), BlobError> {
        let path = self.path_for(name)?;
        fs::create_dir_all(&self.dir)?;

        let tmp_data = self.dir.join(format!("{name}.tmp"));
        let tmp_type = self.dir.join(format!("{name}{CONTENT_TYPE_SUFFIX}.tmp"));

        let mut file = fs::File::create(&tmp_data)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::write(&tmp_type, content_type.as_bytes())?;

        let mut type_path = path.clone().into_os_string();
        type_path.push(CONTENT_TYPE_SUFFIX);
        fs::rename(&tmp_type, PathBuf::from(type_path))?;
        fs::rename(&tmp_data, &path)?;
        Ok(())
    }

    /// Fetches a blob's content type and payload, or `None` if absent.
    pub fn get(&self, name: &str) -> Result<Option<(String, Vec<u8>)>, BlobError> {
        let path = self.path_for(name)?;
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut type_path = path.into_os_string();
        type_path.push(CONTENT_TYPE_SUFFIX);
        let content_type = match fs::read_to_string(PathBuf::from(type_path)) {
            Ok(ct) => ct,
            Err(e) if e.kind() == ErrorKind::NotFound => DEFAULT_CONTENT_TYPE.to_string(),
            Err(e) => return Err(e.into()),
        };
        Ok(Some((content_type, data)))
    }

    /// Removes a blob if present, reporting whether anything was deleted.
    pub fn delete(&self, name: &str) -> Result<bool, BlobError> {
        let path = self.path_for(name)?;
        let mut type_path = path.clone().into_os_string();
        type_path.push(CONTENT_TYPE_SUFFIX);
        match fs::remove_file(PathBuf::from(type_path)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Root directory of this store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, BlobError> {
        // Names we mint are hex digests, but `?blob=` requests arrive from
        // the outside.
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return InvalidNameSnafu { name }.fail();
        }
        Ok(self.dir.join(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_stable_and_secret_dependent() {
        let a = blob_name(b"secret-one", "app", "id-1");
        assert_eq!(a, blob_name(b"secret-one", "app", "id-1"));
        assert_ne!(a, blob_name(b"secret-two", "app", "id-1"));
        assert_ne!(a, blob_name(b"secret-one", "app", "id-2"));
        // The separator keeps ("ab", "c") and ("a", "bc") apart.
        assert_ne!(
            blob_name(b"s", "ab", "c"),
            blob_name(b"s", "a", "bc")
        );
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn save_get_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path().join("blobs"));
        let name = blob_name(b"secret", "app", "id");

        assert!(store.get(&name).unwrap().is_none());
        store.save(&name, "image/png", b"payload").unwrap();
        let (content_type, data) = store.get(&name).unwrap().unwrap();
        assert_eq!(content_type, "image/png");
        assert_eq!(data, b"payload");

        assert!(store.delete(&name).unwrap());
        assert!(!store.delete(&name).unwrap());
        assert!(store.get(&name).unwrap().is_none());
    }

    #[test]
    fn traversal_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path().join("blobs"));
        assert!(matches!(
            store.get("../escape").unwrap_err(),
            BlobError::InvalidName { .. }
        ));
        assert!(matches!(
            store.save("", "text/plain", b"x").unwrap_err(),
            BlobError::InvalidName { .. }
        ));
    }
}
