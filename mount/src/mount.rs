//! The owning container for one mounted working copy.
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use driftfs_castore::{store::ObjectStore, Digest, PathComponent, RepoPathBuf};
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};

use crate::inodes::checkout::{CheckoutConflict, CheckoutContext, CheckoutError, CheckoutMode};
use crate::inodes::diff::{DiffCallback, DiffContext};
use crate::inodes::{
    DirContents, InodeMap, InodeNumber, InodePtr, InodeTimestamps, TreeInode, ROOT_INO,
};
use crate::journal::Journal;
use crate::overlay::Overlay;
use crate::FsError;

/// Receives kernel cache invalidation requests for directory entries that
/// changed underneath the kernel. The FUSE channel provides the real one; a
/// [NoopInvalidator] serves mounts without a kernel attached.
pub trait CacheInvalidator: Send + Sync {
    fn invalidate_entry(&self, parent: InodeNumber, name: &PathComponent);
}

#[derive(Default)]
pub struct NoopInvalidator;

impl CacheInvalidator for NoopInvalidator {
    fn invalidate_entry(&self, _parent: InodeNumber, _name: &PathComponent) {}
}

/// Proof that the mount-wide rename lock is held.
///
/// The lock serializes every operation that mutates `(parent, name)`
/// bindings: rename, unlink/rmdir, materialization and checkout. It is
/// always acquired before any per-directory contents lock.
pub struct RenameLock {
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

struct SnapshotState {
    /// The snapshot tree the working copy was last checked out to.
    snapshot: Option<Digest>,
    last_checkout_time: SystemTime,
}

/// The result of a checkout: every conflict and error encountered, rather
/// than the first one.
#[derive(Debug, Default)]
pub struct CheckoutResult {
    pub conflicts: Vec<CheckoutConflict>,
    pub errors: Vec<CheckoutError>,
}

/// The mount state: InodeMap, ObjectStore, Overlay and Journal, owned in a
/// single container that operations reach through their inode backpointers.
pub struct Mount {
    inode_map: InodeMap,
    object_store: Arc<dyn ObjectStore>,
    overlay: Arc<dyn Overlay>,
    journal: Journal,
    invalidator: Arc<dyn CacheInvalidator>,
    rename_lock: Arc<tokio::sync::Mutex<()>>,
    snapshot: Mutex<SnapshotState>,
    control_ino: OnceLock<InodeNumber>,
}

impl Mount {
    /// The reserved control directory at the mount root. It is immutable:
    /// create, remove and rename targeting it fail with EPERM, and diff
    /// never reports it.
    pub const CONTROL_DIR_NAME: &'static [u8] = b".drift";

    pub async fn new(
        object_store: Arc<dyn ObjectStore>,
        overlay: Arc<dyn Overlay>,
        snapshot: Option<Digest>,
    ) -> Result<Arc<Self>, FsError> {
        Self::with_invalidator(object_store, overlay, snapshot, Arc::new(NoopInvalidator)).await
    }

    pub async fn with_invalidator(
        object_store: Arc<dyn ObjectStore>,
        overlay: Arc<dyn Overlay>,
        snapshot: Option<Digest>,
        invalidator: Arc<dyn CacheInvalidator>,
    ) -> Result<Arc<Self>, FsError> {
        let now = SystemTime::now();
        let mount = Arc::new(Mount {
            inode_map: InodeMap::new(),
            object_store,
            overlay,
            journal: Journal::new(),
            invalidator,
            rename_lock: Arc::new(tokio::sync::Mutex::new(())),
            snapshot: Mutex::new(SnapshotState {
                snapshot: snapshot.clone(),
                last_checkout_time: now,
            }),
            control_ino: OnceLock::new(),
        });

        // The root contents come from a previous session's overlay record if
        // one exists, else from the snapshot tree, else an empty materialized
        // directory.
        let root_contents = match mount.overlay.load_dir(ROOT_INO)? {
            Some(dir) => DirContents::from_overlay(dir),
            None => match &snapshot {
                Some(digest) => {
                    let tree = mount
                        .object_store
                        .get_tree(digest)
                        .await?
                        .ok_or_else(|| FsError::io(format!("missing root tree {}", digest)))?;
                    DirContents::from_tree(&tree, now)
                }
                None => {
                    let contents = DirContents {
                        entries: Default::default(),
                        tree_hash: None,
                        timestamps: InodeTimestamps::at(now),
                    };
                    mount.overlay.save_dir(ROOT_INO, &contents.to_overlay())?;
                    contents
                }
            },
        };

        let root = TreeInode::new_root(&mount, root_contents);
        mount.inode_map.inode_created(InodePtr::Tree(root.clone()));

        // The control directory is synthesized outside the overlay and the
        // snapshot trees; it never materializes and never shows up in diffs.
        let control_ino = mount.inode_map.allocate_inode_number();
        let control_name: PathComponent = PathComponent::try_from(Self::CONTROL_DIR_NAME)
            .map_err(|e| FsError::bug(format!("invalid control directory name: {}", e)))?;
        let control = TreeInode::new_child(
            control_ino,
            &mount,
            &root,
            control_name,
            DirContents {
                entries: Default::default(),
                tree_hash: None,
                timestamps: InodeTimestamps::at(now),
            },
        );
        mount.inode_map.inode_created(InodePtr::Tree(control));
        mount
            .control_ino
            .set(control_ino)
            .map_err(|_| FsError::bug("control directory initialized twice"))?;

        Ok(mount)
    }

    pub fn inode_map(&self) -> &InodeMap {
        &self.inode_map
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.object_store
    }

    pub fn overlay(&self) -> &Arc<dyn Overlay> {
        &self.overlay
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn root(&self) -> Result<Arc<TreeInode>, FsError> {
        match self.inode_map.get_loaded(ROOT_INO) {
            Some(InodePtr::Tree(tree)) => Ok(tree),
            _ => Err(FsError::bug("mount root missing from inode table")),
        }
    }

    pub(crate) fn control_ino(&self) -> Option<InodeNumber> {
        self.control_ino.get().copied()
    }

    pub(crate) fn control_dir(&self) -> Option<InodePtr> {
        self.inode_map.get_loaded(self.control_ino()?)
    }

    pub async fn acquire_rename_lock(&self) -> RenameLock {
        RenameLock {
            _guard: self.rename_lock.clone().lock_owned().await,
        }
    }

    pub fn last_checkout_time(&self) -> SystemTime {
        self.snapshot.lock().last_checkout_time
    }

    /// The snapshot the working copy was last checked out to.
    pub fn current_snapshot(&self) -> Option<Digest> {
        self.snapshot.lock().snapshot.clone()
    }

    pub(crate) fn invalidate_entry(&self, parent: InodeNumber, name: &PathComponent) {
        self.invalidator.invalidate_entry(parent, name);
    }

    /// Processes a kernel `forget`, destroying unlinked inodes whose last
    /// reference just drained.
    pub fn forget(&self, ino: InodeNumber, nlookup: u64) {
        if let Some(destroyed) = self.inode_map.dec_fuse_refcount(ino, nlookup) {
            self.destroy_unlinked_inode(&destroyed);
        }
    }

    /// Final cleanup for an unlinked inode whose references have drained:
    /// materialized state has no further owner, so its overlay data goes too.
    pub(crate) fn destroy_unlinked_inode(&self, inode: &InodePtr) {
        if inode.is_materialized() {
            if let Err(error) = self.overlay.remove(inode.ino()) {
                warn!(rq.inode = inode.ino().0, %error, "failed to remove overlay data");
            }
        }
    }

    /// Transitions the working copy from the current snapshot to `to`.
    ///
    /// Conflicts and errors accumulate into the result rather than failing
    /// fast; in dry-run mode nothing is modified. The rename lock is held
    /// for the whole transition.
    #[instrument(skip(self), fields(checkout.mode = ?mode))]
    pub async fn checkout(
        self: &Arc<Self>,
        to: Option<Digest>,
        mode: CheckoutMode,
    ) -> Result<CheckoutResult, FsError> {
        let rename_lock = self.acquire_rename_lock().await;

        let from = self.current_snapshot();
        let from_tree = match &from {
            Some(digest) => Some(
                self.object_store
                    .get_tree(digest)
                    .await?
                    .ok_or_else(|| FsError::io(format!("missing tree {}", digest)))?,
            ),
            None => None,
        };
        let to_tree = match &to {
            Some(digest) => Some(
                self.object_store
                    .get_tree(digest)
                    .await?
                    .ok_or_else(|| FsError::io(format!("missing tree {}", digest)))?,
            ),
            None => None,
        };

        debug!(
            checkout.from = from.as_ref().map(|d| d.to_string()).unwrap_or_else(|| "<none>".into()),
            checkout.to = to.as_ref().map(|d| d.to_string()).unwrap_or_else(|| "<none>".into()),
            "starting checkout"
        );

        let ctx = CheckoutContext::new(mode, rename_lock);
        self.root()?.checkout(&ctx, from_tree, to_tree).await?;

        if mode != CheckoutMode::DryRun {
            let mut snapshot = self.snapshot.lock();
            snapshot.snapshot = to;
            snapshot.last_checkout_time = SystemTime::now();
        }

        Ok(ctx.finish())
    }

    /// Computes the modifications of the working copy relative to the given
    /// reference tree, reporting each path to `callback`.
    pub async fn diff(
        self: &Arc<Self>,
        reference: Option<&Digest>,
        callback: Arc<dyn DiffCallback>,
        list_ignored: bool,
    ) -> Result<(), FsError> {
        let reference_tree = match reference {
            Some(digest) => Some(
                self.object_store
                    .get_tree(digest)
                    .await?
                    .ok_or_else(|| FsError::io(format!("missing tree {}", digest)))?,
            ),
            None => None,
        };

        let ctx = DiffContext::new(callback, list_ignored, self.object_store.clone());
        self.root()?
            .diff(&ctx, RepoPathBuf::new(), reference_tree, None, false)
            .await
    }
}
