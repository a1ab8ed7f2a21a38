//! File inodes: regular files, symlinks and unix-domain sockets,
//! distinguished by their mode bits.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use driftfs_castore::store::ObjectStore as _;
use driftfs_castore::{Digest, PathComponent, RepoPathBuf};
use parking_lot::RwLock;
use tracing::instrument;

use super::{compute_path, InodeAttr, InodeLocation, InodeNumber, InodeTimestamps, TreeInode};
use crate::journal::JournalDelta;
use crate::mount::{Mount, RenameLock};
use crate::overlay::OverlayFile;
use crate::FsError;

#[derive(Debug)]
struct FileState {
    mode: u32,
    /// Source-control identity. `None` means the content lives in the
    /// overlay.
    hash: Option<Digest>,
    /// Lazily opened overlay handle; only ever set while materialized.
    overlay_file: Option<OverlayFile>,
    timestamps: InodeTimestamps,
}

#[derive(Debug)]
pub struct FileInode {
    ino: InodeNumber,
    mount: Weak<Mount>,
    location: RwLock<InodeLocation>,
    fuse_refcount: AtomicU64,
    state: RwLock<FileState>,
}

impl FileInode {
    /// Constructs a file inode discovered through the loader. A `hash` of
    /// `None` means the file is materialized and its contents live in the
    /// overlay; the backing file is opened lazily.
    pub(crate) fn new(
        ino: InodeNumber,
        mount: &Arc<Mount>,
        parent: &Arc<TreeInode>,
        name: PathComponent,
        mode: u32,
        hash: Option<Digest>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ino,
            mount: Arc::downgrade(mount),
            location: RwLock::new(InodeLocation::child(parent, name)),
            fuse_refcount: AtomicU64::new(0),
            state: RwLock::new(FileState {
                mode,
                hash,
                overlay_file: None,
                timestamps: InodeTimestamps::at(mount.last_checkout_time()),
            }),
        })
    }

    /// Constructs a freshly created, materialized file inode whose overlay
    /// backing file already exists.
    pub(crate) fn new_materialized(
        ino: InodeNumber,
        mount: &Arc<Mount>,
        parent: &Arc<TreeInode>,
        name: PathComponent,
        mode: u32,
        file: OverlayFile,
        timestamps: InodeTimestamps,
    ) -> Arc<Self> {
        Arc::new(Self {
            ino,
            mount: Arc::downgrade(mount),
            location: RwLock::new(InodeLocation::child(parent, name)),
            fuse_refcount: AtomicU64::new(0),
            state: RwLock::new(FileState {
                mode,
                hash: None,
                overlay_file: Some(file),
                timestamps,
            }),
        })
    }

    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    fn mount(&self) -> Result<Arc<Mount>, FsError> {
        self.mount
            .upgrade()
            .ok_or_else(|| FsError::bug("mount torn down while inode still in use"))
    }

    pub fn mode(&self) -> u32 {
        self.state.read().mode
    }

    pub fn is_symlink(&self) -> bool {
        self.mode() & libc::S_IFMT == libc::S_IFLNK
    }

    pub fn is_materialized(&self) -> bool {
        self.state.read().hash.is_none()
    }

    /// The source-control identity of the content, if still known.
    pub fn hash(&self) -> Option<Digest> {
        self.state.read().hash.clone()
    }

    pub(crate) fn location(&self) -> InodeLocation {
        self.location.read().clone()
    }

    pub(crate) fn mark_unlinked(&self) {
        self.location.write().unlinked = true;
    }

    pub(crate) fn update_location(&self, parent: &Arc<TreeInode>, name: PathComponent) {
        let mut location = self.location.write();
        location.parent = Some((Arc::downgrade(parent), name));
    }

    pub fn is_unlinked(&self) -> bool {
        self.location.read().unlinked
    }

    pub fn path(&self) -> Option<RepoPathBuf> {
        compute_path(self.location())
    }

    pub(crate) fn add_fuse_refcount(&self, delta: u64) {
        self.fuse_refcount.fetch_add(delta, Ordering::AcqRel);
    }

    pub(crate) fn sub_fuse_refcount(&self, delta: u64) -> u64 {
        let previous = self.fuse_refcount.fetch_sub(delta, Ordering::AcqRel);
        previous.saturating_sub(delta)
    }

    pub(crate) fn fuse_refcount(&self) -> u64 {
        self.fuse_refcount.load(Ordering::Acquire)
    }

    fn overlay_file(&self) -> Result<OverlayFile, FsError> {
        {
            let state = self.state.read();
            if let Some(file) = &state.overlay_file {
                return Ok(file.clone());
            }
            if state.hash.is_some() {
                return Err(FsError::bug(format!(
                    "overlay file requested for clean inode {}",
                    self.ino
                )));
            }
        }
        let mount = self.mount()?;
        let file = mount.overlay().open_file(self.ino)?;
        let mut state = self.state.write();
        if state.overlay_file.is_none() {
            state.overlay_file = Some(file.clone());
        }
        Ok(state.overlay_file.clone().unwrap_or(file))
    }

    /// Reads the entire contents, from the object store for clean files and
    /// from the overlay for materialized ones.
    #[instrument(skip(self), fields(rq.inode = self.ino.0))]
    pub async fn read_all(&self) -> Result<Bytes, FsError> {
        let hash = self.hash();
        match hash {
            Some(hash) => {
                let mount = self.mount()?;
                mount
                    .object_store()
                    .get_blob(&hash)
                    .await?
                    .ok_or_else(|| FsError::io(format!("missing blob {}", hash)))
            }
            None => Ok(self.overlay_file()?.read_all()),
        }
    }

    /// The target of a symlink inode.
    pub async fn readlink(&self) -> Result<Bytes, FsError> {
        if !self.is_symlink() {
            return Err(FsError::InvalidArgument);
        }
        self.read_all().await
    }

    /// Transitions the file from clean to materialized, copying the blob
    /// contents into a new overlay file. The overlay write happens before
    /// the parent records the child as materialized.
    pub async fn materialize(self: &Arc<Self>) -> Result<(), FsError> {
        if self.is_materialized() {
            return Ok(());
        }
        let mount = self.mount()?;
        let rename_lock = mount.acquire_rename_lock().await;
        self.materialize_locked(&rename_lock).await
    }

    pub(crate) async fn materialize_locked(
        self: &Arc<Self>,
        rename_lock: &RenameLock,
    ) -> Result<(), FsError> {
        // Fetch the current contents before taking any lock.
        let contents = self.read_all().await?;
        let mount = self.mount()?;
        {
            let mut state = self.state.write();
            if state.hash.is_none() {
                return Ok(());
            }
            let file = mount.overlay().create_file(self.ino, state.timestamps)?;
            file.write_all(&contents)?;
            state.overlay_file = Some(file);
            state.hash = None;
        }

        let location = self.location();
        if let Some((parent, name)) = location.parent {
            if !location.unlinked {
                if let Some(parent) = parent.upgrade() {
                    parent.child_materialized(rename_lock, &name, self.ino)?;
                }
            }
        }
        Ok(())
    }

    /// Replaces the file contents, materializing first if needed.
    pub async fn write_all(self: &Arc<Self>, data: &[u8]) -> Result<(), FsError> {
        self.materialize().await?;
        self.overlay_file()?.write_all(data)?;

        let now = std::time::SystemTime::now();
        {
            let mut state = self.state.write();
            state.timestamps.mtime = now;
            state.timestamps.ctime = now;
        }
        if let Some(path) = self.path() {
            self.mount()?.journal().add_delta(JournalDelta::Changed(path));
        }
        Ok(())
    }

    pub async fn getattr(&self) -> Result<InodeAttr, FsError> {
        let (mode, timestamps) = {
            let state = self.state.read();
            (state.mode, state.timestamps)
        };
        let size = self.read_all().await?.len() as u64;
        Ok(InodeAttr {
            ino: self.ino,
            mode,
            nlink: 1,
            size,
            atime: timestamps.atime,
            mtime: timestamps.mtime,
            ctime: timestamps.ctime,
        })
    }

    /// Applies an attribute change, materializing so the new metadata has
    /// somewhere to live.
    pub async fn setattr(self: &Arc<Self>, attr: super::SetAttr) -> Result<InodeAttr, FsError> {
        self.materialize().await?;

        {
            let mut state = self.state.write();
            let now = std::time::SystemTime::now();
            if let Some(mode) = attr.mode {
                // Only permission bits may change; the file type is fixed.
                state.mode = (state.mode & libc::S_IFMT) | (mode & 0o7777);
            }
            if let Some(atime) = attr.atime {
                state.timestamps.atime = atime;
            }
            if let Some(mtime) = attr.mtime {
                state.timestamps.mtime = mtime;
            }
            state.timestamps.ctime = now;
        }

        if let Some(path) = self.path() {
            self.mount()?.journal().add_delta(JournalDelta::Changed(path));
        }
        self.getattr().await
    }

    /// Whether this file's content and type still match the given snapshot
    /// entry. Materialized contents are re-hashed for the comparison.
    pub(crate) async fn is_same_as(
        &self,
        entry: &driftfs_castore::TreeEntry,
    ) -> Result<bool, FsError> {
        let entry_mode = super::mode_from_entry_kind(entry.kind);
        if self.mode() & libc::S_IFMT != entry_mode & libc::S_IFMT {
            return Ok(false);
        }
        // Executable bit changes are modifications too.
        if entry_mode & 0o111 != self.mode() & 0o111 {
            return Ok(false);
        }
        match self.hash() {
            Some(hash) => Ok(hash == entry.digest),
            None => {
                let contents = self.read_all().await?;
                Ok(Digest::for_blob(&contents) == entry.digest)
            }
        }
    }
}
