//! The overlay: local persistent storage for materialized inode state.
//!
//! The overlay is keyed by inode number. Directories store a record of their
//! entries and timestamps; regular files (and symlinks, and sockets) store
//! their raw contents behind an [OverlayFile] handle owned by the file inode.
//!
//! Directory records are written while the owning directory's contents lock
//! is held, so the trait is deliberately synchronous; implementations must
//! not block for long.
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use driftfs_castore::{Digest, PathComponent};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use url::Url;

use crate::inodes::{InodeNumber, InodeTimestamps};

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("no overlay data for inode {0}")]
    MissingData(InodeNumber),

    #[error("overlay storage error: {0}")]
    StorageError(String),
}

/// One entry of a directory record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayDirEntry {
    pub mode: u32,
    /// Source-control identity, if this entry is still clean.
    /// `None` means the entry is materialized.
    pub hash: Option<Digest>,
    pub ino: Option<InodeNumber>,
}

/// The persisted record for one directory inode.
#[derive(Debug, Clone, Default)]
pub struct OverlayDir {
    pub entries: BTreeMap<PathComponent, OverlayDirEntry>,
    pub tree_hash: Option<Digest>,
    pub timestamps: InodeTimestamps,
}

/// A handle to the mutable contents of one overlay-backed file.
///
/// Handles are owned by the corresponding file inode; clones share the same
/// underlying buffer.
#[derive(Clone, Debug)]
pub struct OverlayFile {
    ino: InodeNumber,
    data: Arc<RwLock<Vec<u8>>>,
}

impl OverlayFile {
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    pub fn len(&self) -> u64 {
        self.data.read().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    pub fn read_all(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data.read())
    }

    pub fn write_all(&self, contents: &[u8]) -> Result<(), OverlayError> {
        let mut data = self.data.write();
        data.clear();
        data.extend_from_slice(contents);
        Ok(())
    }
}

/// Keyed persistent storage for materialized inodes.
pub trait Overlay: Send + Sync {
    /// Loads the directory record for `ino`, or `None` if the overlay has no
    /// record for it.
    fn load_dir(&self, ino: InodeNumber) -> Result<Option<OverlayDir>, OverlayError>;

    /// Persists the directory record for `ino`, replacing any previous one.
    fn save_dir(&self, ino: InodeNumber, dir: &OverlayDir) -> Result<(), OverlayError>;

    /// Removes whatever data (directory record or file contents) is stored
    /// for `ino`. Removing an absent inode is not an error.
    fn remove(&self, ino: InodeNumber) -> Result<(), OverlayError>;

    /// Creates the backing file for a newly materialized file inode and
    /// returns a handle to it.
    fn create_file(
        &self,
        ino: InodeNumber,
        timestamps: InodeTimestamps,
    ) -> Result<OverlayFile, OverlayError>;

    /// Re-opens the backing file for a materialized file inode.
    fn open_file(&self, ino: InodeNumber) -> Result<OverlayFile, OverlayError>;

    /// Whether any overlay data exists for `ino`.
    fn has_data(&self, ino: InodeNumber) -> bool;
}

/// An overlay held entirely in memory. The persistent implementations live
/// behind the same trait; tests and ephemeral mounts use this one.
#[derive(Default)]
pub struct MemoryOverlay {
    dirs: Mutex<HashMap<InodeNumber, OverlayDir>>,
    files: Mutex<HashMap<InodeNumber, OverlayFile>>,
}

impl MemoryOverlay {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Overlay for MemoryOverlay {
    fn load_dir(&self, ino: InodeNumber) -> Result<Option<OverlayDir>, OverlayError> {
        Ok(self.dirs.lock().get(&ino).cloned())
    }

    fn save_dir(&self, ino: InodeNumber, dir: &OverlayDir) -> Result<(), OverlayError> {
        self.dirs.lock().insert(ino, dir.clone());
        Ok(())
    }

    fn remove(&self, ino: InodeNumber) -> Result<(), OverlayError> {
        self.dirs.lock().remove(&ino);
        self.files.lock().remove(&ino);
        Ok(())
    }

    fn create_file(
        &self,
        ino: InodeNumber,
        _timestamps: InodeTimestamps,
    ) -> Result<OverlayFile, OverlayError> {
        let file = OverlayFile {
            ino,
            data: Arc::new(RwLock::new(Vec::new())),
        };
        self.files.lock().insert(ino, file.clone());
        Ok(file)
    }

    fn open_file(&self, ino: InodeNumber) -> Result<OverlayFile, OverlayError> {
        self.files
            .lock()
            .get(&ino)
            .cloned()
            .ok_or(OverlayError::MissingData(ino))
    }

    fn has_data(&self, ino: InodeNumber) -> bool {
        self.dirs.lock().contains_key(&ino) || self.files.lock().contains_key(&ino)
    }
}

/// Constructs a new instance of an [Overlay] from an URI.
///
/// The following schemes are supported:
/// - `memory://` ([MemoryOverlay])
pub fn from_addr(uri: &str) -> Result<Arc<dyn Overlay>, OverlayError> {
    let url = Url::parse(uri)
        .map_err(|e| OverlayError::StorageError(format!("unable to parse url: {}", e)))?;

    match url.scheme() {
        "memory" => {
            if url.has_host() || !url.path().is_empty() {
                return Err(OverlayError::StorageError("invalid url".to_string()));
            }
            Ok(Arc::new(MemoryOverlay::default()))
        }
        scheme => Err(OverlayError::StorageError(format!(
            "unknown scheme: {}",
            scheme
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::{from_addr, MemoryOverlay, Overlay, OverlayDir};
    use crate::inodes::{InodeNumber, InodeTimestamps};

    #[test]
    fn dir_record_roundtrip() {
        let overlay = MemoryOverlay::new();
        let ino = InodeNumber(17);

        assert!(!overlay.has_data(ino));
        assert!(overlay.load_dir(ino).unwrap().is_none());

        overlay.save_dir(ino, &OverlayDir::default()).unwrap();
        assert!(overlay.has_data(ino));
        assert!(overlay.load_dir(ino).unwrap().is_some());

        overlay.remove(ino).unwrap();
        assert!(!overlay.has_data(ino));
    }

    #[test]
    fn file_contents_shared_between_handles() {
        let overlay = MemoryOverlay::new();
        let ino = InodeNumber(18);

        let handle = overlay
            .create_file(ino, InodeTimestamps::default())
            .unwrap();
        handle.write_all(b"hello").unwrap();

        let reopened = overlay.open_file(ino).unwrap();
        assert_eq!(b"hello".as_slice(), &reopened.read_all()[..]);
        assert_eq!(5, reopened.len());
    }

    #[test]
    fn from_addr_schemes() {
        assert!(from_addr("memory://").is_ok());
        assert!(from_addr("memory://host").is_err());
        assert!(from_addr("disk:///somewhere").is_err());
    }
}
