//! The directory inode: owns the mutable directory state and implements the
//! filesystem mutations, the child loader, and the materialization state
//! machine. The checkout and diff engines live in sibling modules as further
//! `impl` blocks.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use driftfs_castore::store::ObjectStore as _;
use driftfs_castore::{Digest, PathComponent, RepoPath, RepoPathBuf};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use tracing::{debug, instrument, warn};

use super::inode_map::LoadReceiver;
use super::{
    compute_path, DirContents, DirEntry, FileInode, InodeAttr, InodeLocation, InodeNumber,
    InodePtr, InodeTimestamps, ROOT_INO,
};
use crate::dispatcher::RequestOrigin;
use crate::journal::JournalDelta;
use crate::mount::{Mount, RenameLock};
use crate::FsError;

/// Give up on remove after this many reload-and-retry rounds.
const MAX_REMOVE_RETRIES: u32 = 3;

/// Attribute changes requested through `setattr`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
    pub size: Option<u64>,
}

/// Depth of [TreeInode::load_materialized_children].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recurse {
    Shallow,
    Deep,
}

/// Everything needed to perform one child load once the contents lock has
/// been released.
pub(crate) struct LoadPlan {
    name: PathComponent,
    number: InodeNumber,
    mode: u32,
    hash: Option<Digest>,
}

pub struct TreeInode {
    ino: InodeNumber,
    mount: Weak<Mount>,
    location: RwLock<InodeLocation>,
    fuse_refcount: AtomicU64,
    pub(crate) contents: RwLock<DirContents>,
}

pub(crate) enum RemoveKind {
    File,
    Dir,
}

enum RenameOutcome {
    Done {
        deleted: Option<InodePtr>,
        journal: Option<JournalDelta>,
    },
    NeedLoad {
        src: bool,
        dest: bool,
    },
}

impl TreeInode {
    pub(crate) fn new_root(mount: &Arc<Mount>, contents: DirContents) -> Arc<Self> {
        Arc::new(Self {
            ino: ROOT_INO,
            mount: Arc::downgrade(mount),
            location: RwLock::new(InodeLocation::root()),
            fuse_refcount: AtomicU64::new(0),
            contents: RwLock::new(contents),
        })
    }

    pub(crate) fn new_child(
        ino: InodeNumber,
        mount: &Arc<Mount>,
        parent: &Arc<TreeInode>,
        name: PathComponent,
        contents: DirContents,
    ) -> Arc<Self> {
        Arc::new(Self {
            ino,
            mount: Arc::downgrade(mount),
            location: RwLock::new(InodeLocation::child(parent, name)),
            fuse_refcount: AtomicU64::new(0),
            contents: RwLock::new(contents),
        })
    }

    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    pub(crate) fn mount(&self) -> Result<Arc<Mount>, FsError> {
        self.mount
            .upgrade()
            .ok_or_else(|| FsError::bug("mount torn down while inode still in use"))
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

    pub fn is_materialized(&self) -> bool {
        self.contents.read().is_materialized()
    }

    /// The snapshot tree this directory is identical to, if it is clean.
    pub fn tree_hash(&self) -> Option<Digest> {
        self.contents.read().tree_hash.clone()
    }

    pub fn getattr(&self) -> InodeAttr {
        let contents = self.contents.read();
        InodeAttr {
            ino: self.ino,
            mode: libc::S_IFDIR | 0o755,
            // "." and ".." contribute to nlink alongside the entries.
            nlink: contents.entries.len() as u64 + 2,
            size: 0,
            atime: contents.timestamps.atime,
            mtime: contents.timestamps.mtime,
            ctime: contents.timestamps.ctime,
        }
    }

    fn check_not_control_dir(&self, mount: &Mount) -> Result<(), FsError> {
        if Some(self.ino) == mount.control_ino() {
            return Err(FsError::PermissionDenied);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lookup & loading
    // ------------------------------------------------------------------

    /// Resolves a child by name, loading it on demand.
    ///
    /// At-most-once loading is coordinated through the
    /// [InodeMap](super::InodeMap): concurrent callers for the same child all
    /// wait on the same pending load.
    #[instrument(skip(self), fields(rq.inode = self.ino.0, rq.name = %name))]
    pub async fn get_or_load_child(
        self: &Arc<Self>,
        name: &PathComponent,
    ) -> Result<InodePtr, FsError> {
        let mount = self.mount()?;

        enum Outcome {
            Ready(InodePtr),
            Wait(LoadReceiver, Option<LoadPlan>),
        }

        let outcome = {
            let mut contents = self.contents.write();
            match contents.entries.get_mut(name) {
                None => {
                    // The control directory resolves at the mount root
                    // without owning a directory entry.
                    if self.ino == ROOT_INO && name.as_ref() == Mount::CONTROL_DIR_NAME {
                        match mount.control_dir() {
                            Some(inode) => Outcome::Ready(inode),
                            None => return Err(FsError::NotFound),
                        }
                    } else {
                        debug!("attempted to load non-existent entry");
                        return Err(FsError::NotFound);
                    }
                }
                Some(entry) => match &entry.inode {
                    Some(inode) => Outcome::Ready(inode.clone()),
                    None => {
                        let (rx, plan) = self.load_child_locked(&mount, name, entry);
                        Outcome::Wait(rx, plan)
                    }
                },
            }
        };

        match outcome {
            Outcome::Ready(inode) => Ok(inode),
            Outcome::Wait(rx, plan) => {
                // Any load we are responsible for starts only after the
                // contents lock above has been released.
                if let Some(plan) = plan {
                    self.start_load(&mount, plan);
                }
                rx.await
                    .map_err(|_| FsError::io("inode load abandoned"))?
            }
        }
    }

    /// Loads the child `name`, restoring a previously issued inode number.
    ///
    /// Used by number-based lookups: when this directory was reloaded from a
    /// snapshot tree its entries lost their number assignments, but the
    /// inode map still remembers which number the child had. The entry may
    /// meanwhile refer to a different inode (the name was replaced); the
    /// caller detects that from the returned inode's number.
    pub(crate) async fn load_child_with_number(
        self: &Arc<Self>,
        name: &PathComponent,
        number: InodeNumber,
    ) -> Result<InodePtr, FsError> {
        let mount = self.mount()?;

        enum Outcome {
            Ready(InodePtr),
            Wait(LoadReceiver, Option<LoadPlan>),
        }

        let outcome = {
            let mut contents = self.contents.write();
            match contents.entries.get_mut(name) {
                None => return Err(FsError::NotFound),
                Some(entry) => match &entry.inode {
                    Some(inode) => Outcome::Ready(inode.clone()),
                    None => {
                        if entry.ino.is_none() {
                            entry.ino = Some(number);
                        }
                        let (rx, plan) = self.load_child_locked(&mount, name, entry);
                        Outcome::Wait(rx, plan)
                    }
                },
            }
        };

        match outcome {
            Outcome::Ready(inode) => Ok(inode),
            Outcome::Wait(rx, plan) => {
                if let Some(plan) = plan {
                    self.start_load(&mount, plan);
                }
                rx.await
                    .map_err(|_| FsError::io("inode load abandoned"))?
            }
        }
    }

    /// Like [get_or_load_child](Self::get_or_load_child) but requires the
    /// child to be a directory.
    pub async fn get_or_load_child_tree(
        self: &Arc<Self>,
        name: &PathComponent,
    ) -> Result<Arc<TreeInode>, FsError> {
        match self.get_or_load_child(name).await? {
            InodePtr::Tree(tree) => Ok(tree),
            InodePtr::File(_) => Err(FsError::NotADirectory),
        }
    }

    /// Walks a relative path component by component from this directory.
    pub async fn get_child_recursive(
        self: &Arc<Self>,
        path: &RepoPath,
    ) -> Result<InodePtr, FsError> {
        let mut current = InodePtr::Tree(self.clone());
        for name in path.components() {
            let tree = match current {
                InodePtr::Tree(ref tree) => tree.clone(),
                InodePtr::File(_) => return Err(FsError::NotADirectory),
            };
            current = tree.get_or_load_child(&name).await?;
        }
        Ok(current)
    }

    /// Assigns (or returns) the stable inode number for a child entry
    /// without loading it. Used when announcing directory listings.
    pub fn get_child_inode_number(&self, name: &PathComponent) -> Result<InodeNumber, FsError> {
        let mount = self.mount()?;
        let mut contents = self.contents.write();
        let entry = contents.entries.get_mut(name).ok_or(FsError::NotFound)?;
        if let Some(inode) = &entry.inode {
            return Ok(inode.ino());
        }
        if let Some(number) = entry.ino {
            return Ok(number);
        }
        let number = mount.inode_map().allocate_inode_number();
        entry.ino = Some(number);
        Ok(number)
    }

    /// Lists all entries, assigning inode numbers where missing.
    pub fn list_entries(&self) -> Result<Vec<(PathComponent, InodeNumber, u32)>, FsError> {
        let mount = self.mount()?;
        let mut contents = self.contents.write();
        let mut out = Vec::with_capacity(contents.entries.len());
        for (name, entry) in contents.entries.iter_mut() {
            let number = match (&entry.inode, entry.ino) {
                (Some(inode), _) => inode.ino(),
                (None, Some(number)) => number,
                (None, None) => {
                    let number = mount.inode_map().allocate_inode_number();
                    entry.ino = Some(number);
                    number
                }
            };
            out.push((name.clone(), number, entry.mode));
        }
        Ok(out)
    }

    /// Arranges for the child behind `entry` to be loaded, while the caller
    /// holds the contents write lock.
    ///
    /// Returns the receiver to wait on, plus a [LoadPlan] if this caller won
    /// the race and must call [start_load](Self::start_load) *after*
    /// releasing the lock.
    pub(crate) fn load_child_locked(
        self: &Arc<Self>,
        mount: &Mount,
        name: &PathComponent,
        entry: &mut DirEntry,
    ) -> (LoadReceiver, Option<LoadPlan>) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let number = match entry.ino {
            Some(number) => number,
            None => {
                let number = mount.inode_map().allocate_inode_number();
                entry.ino = Some(number);
                number
            }
        };
        let start = mount
            .inode_map()
            .should_load_child(self.ino, name, number, tx);
        let plan = start.then(|| LoadPlan {
            name: name.clone(),
            number,
            mode: entry.mode,
            hash: entry.hash.clone(),
        });
        (rx, plan)
    }

    /// Starts the load described by `plan`. Must be called with no contents
    /// lock held.
    ///
    /// Loads never panic the caller: failures are routed to
    /// `InodeMap::inode_load_failed` so the map is always notified exactly
    /// once.
    pub(crate) fn start_load(self: &Arc<Self>, mount: &Arc<Mount>, plan: LoadPlan) {
        // Files need no I/O to construct; complete them inline.
        if plan.mode & libc::S_IFMT != libc::S_IFDIR {
            let inode = InodePtr::File(FileInode::new(
                plan.number,
                mount,
                self,
                plan.name.clone(),
                plan.mode,
                plan.hash.clone(),
            ));
            self.load_complete(mount, &plan, Ok(inode));
            return;
        }

        // Directory loads go through the object store or the overlay; drive
        // them on a detached task so the load finishes even if every caller
        // gives up waiting.
        let this = self.clone();
        let mount = mount.clone();
        tokio::spawn(async move {
            let result = this.load_dir_inode(&mount, &plan).await;
            this.load_complete(&mount, &plan, result);
        });
    }

    async fn load_dir_inode(
        self: &Arc<Self>,
        mount: &Arc<Mount>,
        plan: &LoadPlan,
    ) -> Result<InodePtr, FsError> {
        let contents = match &plan.hash {
            Some(hash) => {
                let tree = mount
                    .object_store()
                    .get_tree(hash)
                    .await?
                    .ok_or_else(|| FsError::io(format!("missing tree {}", hash)))?;
                DirContents::from_tree(&tree, mount.last_checkout_time())
            }
            None => {
                let dir = mount.overlay().load_dir(plan.number)?.ok_or_else(|| {
                    FsError::bug(format!(
                        "missing overlay data for materialized directory {}",
                        plan.number
                    ))
                })?;
                DirContents::from_overlay(dir)
            }
        };
        Ok(InodePtr::Tree(TreeInode::new_child(
            plan.number,
            mount,
            self,
            plan.name.clone(),
            contents,
        )))
    }

    fn load_complete(
        self: &Arc<Self>,
        mount: &Arc<Mount>,
        plan: &LoadPlan,
        result: Result<InodePtr, FsError>,
    ) {
        let inode = match result {
            Ok(inode) => inode,
            Err(error) => {
                mount.inode_map().inode_load_failed(plan.number, &error);
                return;
            }
        };

        let promises = {
            let mut contents = self.contents.write();
            match contents.entries.get_mut(&plan.name) {
                Some(entry) if entry.ino == Some(plan.number) => {
                    entry.inode = Some(inode.clone());
                    // Registering in the InodeMap while still holding our
                    // contents lock ensures nobody can find the child by name
                    // before it is also reachable by number.
                    mount.inode_map().inode_load_complete(&inode)
                }
                _ => {
                    drop(contents);
                    warn!(
                        rq.inode = plan.number.0,
                        rq.name = %plan.name,
                        "child removed before it finished loading"
                    );
                    mount.inode_map().inode_load_failed(plan.number, &FsError::NotFound);
                    return;
                }
            }
        };

        for promise in promises {
            let _ = promise.send(Ok(inode.clone()));
        }
    }

    // ------------------------------------------------------------------
    // Materialization
    // ------------------------------------------------------------------

    /// Transitions this directory from clean to materialized, acquiring the
    /// rename lock if the caller does not already hold it.
    pub async fn materialize(self: &Arc<Self>) -> Result<(), FsError> {
        // Quick check to avoid the rename lock when there is nothing to do.
        if self.is_materialized() {
            return Ok(());
        }
        let mount = self.mount()?;
        let rename_lock = mount.acquire_rename_lock().await;
        self.materialize_locked(&rename_lock)
    }

    /// Materialization with the rename lock already held.
    ///
    /// Only performing materialization state changes under the rename lock
    /// guarantees that materialization and dematerialization cannot be
    /// interleaved, which would leave the parent and child overlay records
    /// disagreeing about who is materialized.
    pub(crate) fn materialize_locked(
        self: &Arc<Self>,
        rename_lock: &RenameLock,
    ) -> Result<(), FsError> {
        let mount = self.mount()?;
        {
            let mut contents = self.contents.write();
            if contents.is_materialized() {
                return Ok(());
            }
            contents.tree_hash = None;
            // Write our own overlay record before updating the parent. If we
            // crash in between, the parent still claims we are clean, and the
            // orphaned record is harmless; the reverse order could leave the
            // parent pointing at overlay data that does not exist.
            mount.overlay().save_dir(self.ino, &contents.to_overlay())?;
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

    /// Records that the named child is now materialized, materializing this
    /// directory (and transitively its ancestors) as needed. Materialization
    /// is upward-closed.
    pub(crate) fn child_materialized(
        self: &Arc<Self>,
        _rename_lock: &RenameLock,
        name: &PathComponent,
        child: InodeNumber,
    ) -> Result<(), FsError> {
        let mount = self.mount()?;
        let mut tree = self.clone();
        let mut name = name.clone();
        let mut child = child;

        loop {
            let changed = {
                let mut contents = tree.contents.write();
                let dir_materialized = contents.is_materialized();
                let entry = contents.entries.get_mut(&name).ok_or_else(|| {
                    FsError::bug(format!(
                        "attempted to materialize missing entry {} in inode {}",
                        name, tree.ino
                    ))
                })?;
                if dir_materialized && entry.is_materialized() {
                    false
                } else {
                    entry.hash = None;
                    entry.ino = Some(child);
                    contents.tree_hash = None;
                    mount.overlay().save_dir(tree.ino, &contents.to_overlay())?;
                    true
                }
            };
            if !changed {
                break;
            }

            let location = tree.location();
            let Some((parent, parent_name)) = location.parent else {
                break;
            };
            if location.unlinked {
                break;
            }
            let Some(parent) = parent.upgrade() else {
                break;
            };
            child = tree.ino;
            name = parent_name;
            tree = parent;
        }
        Ok(())
    }

    /// Records that the named child is clean again at `child_hash`.
    ///
    /// The directory itself stays materialized to record the child's new
    /// hash; whether it can dematerialize in turn is decided by
    /// `save_overlay_post_checkout` once the checkout has finished with it.
    pub(crate) fn child_dematerialized(
        self: &Arc<Self>,
        rename_lock: &RenameLock,
        name: &PathComponent,
        child_hash: Digest,
    ) -> Result<(), FsError> {
        let mount = self.mount()?;
        let changed = {
            let mut contents = self.contents.write();
            let entry = contents.entries.get_mut(name).ok_or_else(|| {
                FsError::bug(format!(
                    "attempted to dematerialize missing entry {} in inode {}",
                    name, self.ino
                ))
            })?;
            if !entry.is_materialized() && entry.hash.as_ref() == Some(&child_hash) {
                false
            } else {
                entry.hash = Some(child_hash);
                contents.tree_hash = None;
                mount.overlay().save_dir(self.ino, &contents.to_overlay())?;
                true
            }
        };

        if changed {
            let location = self.location();
            if let Some((parent, parent_name)) = location.parent {
                if !location.unlinked {
                    if let Some(parent) = parent.upgrade() {
                        parent.child_materialized(rename_lock, &parent_name, self.ino)?;
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Creates a new regular file. The kernel guarantees the name does not
    /// already exist; a collision here is an internal invariant violation,
    /// not EEXIST.
    #[instrument(skip(self), fields(rq.inode = self.ino.0, rq.name = %name))]
    pub async fn create(
        self: &Arc<Self>,
        name: &PathComponent,
        mode: u32,
        origin: RequestOrigin,
    ) -> Result<Arc<FileInode>, FsError> {
        let mount = self.mount()?;
        self.check_not_control_dir(&mount)?;
        self.materialize().await?;

        let inode;
        let target;
        {
            let mut contents = self.contents.write();
            // Re-check that we have not been unlinked now that we hold the
            // contents lock; a concurrent rmdir or rename could have raced us.
            let my_path = self.path().ok_or(FsError::NotFound)?;
            target = my_path.join(name);

            if contents.entries.contains_key(name) {
                return Err(FsError::bug(format!(
                    "create() on path component that already exists: {}",
                    name
                )));
            }

            let number = mount.inode_map().allocate_inode_number();
            let now = InodeTimestamps::now();
            let file = mount.overlay().create_file(number, now)?;

            // The mode passed in by the caller may not have the file type
            // bits set.
            let mode = libc::S_IFREG | (mode & 0o7777);

            inode = FileInode::new_materialized(
                number,
                &mount,
                self,
                name.clone(),
                mode,
                file,
                now,
            );
            let mut entry = DirEntry::materialized(mode, number);
            entry.inode = Some(InodePtr::File(inode.clone()));
            contents.entries.insert(name.clone(), entry);
            mount.inode_map().inode_created(InodePtr::File(inode.clone()));

            contents.timestamps.mtime = now.mtime;
            contents.timestamps.ctime = now.ctime;
            mount.overlay().save_dir(self.ino, &contents.to_overlay())?;
        }

        self.invalidate_cache_if_required(&mount, origin, name);
        mount.journal().add_delta(JournalDelta::Created(target));
        Ok(inode)
    }

    /// Creates a symlink pointing at `link_target`.
    #[instrument(skip(self, link_target), fields(rq.inode = self.ino.0, rq.name = %name))]
    pub async fn symlink(
        self: &Arc<Self>,
        name: &PathComponent,
        link_target: &[u8],
        origin: RequestOrigin,
    ) -> Result<Arc<FileInode>, FsError> {
        let mount = self.mount()?;
        self.check_not_control_dir(&mount)?;
        self.materialize().await?;

        let inode;
        let target;
        {
            let mut contents = self.contents.write();
            let my_path = self.path().ok_or(FsError::NotFound)?;
            target = my_path.join(name);

            if contents.entries.contains_key(name) {
                return Err(FsError::Exists);
            }

            let number = mount.inode_map().allocate_inode_number();
            let now = InodeTimestamps::now();
            let file = mount.overlay().create_file(number, now)?;
            if let Err(error) = file.write_all(link_target) {
                // Remove the partially-created overlay file.
                let _ = mount.overlay().remove(number);
                return Err(error.into());
            }

            let mode = libc::S_IFLNK | 0o770;
            inode = FileInode::new_materialized(
                number,
                &mount,
                self,
                name.clone(),
                mode,
                file,
                now,
            );
            let mut entry = DirEntry::materialized(mode, number);
            entry.inode = Some(InodePtr::File(inode.clone()));
            contents.entries.insert(name.clone(), entry);
            mount.inode_map().inode_created(InodePtr::File(inode.clone()));

            contents.timestamps.mtime = now.mtime;
            contents.timestamps.ctime = now.ctime;
            mount.overlay().save_dir(self.ino, &contents.to_overlay())?;
        }

        self.invalidate_cache_if_required(&mount, origin, name);
        mount.journal().add_delta(JournalDelta::Created(target));
        Ok(inode)
    }

    /// Creates a special file node. Only unix-domain sockets are supported;
    /// block and character devices are refused, so the dev argument never
    /// needs to be stored.
    #[instrument(skip(self), fields(rq.inode = self.ino.0, rq.name = %name))]
    pub async fn mknod(
        self: &Arc<Self>,
        name: &PathComponent,
        mode: u32,
        _dev: u64,
        origin: RequestOrigin,
    ) -> Result<Arc<FileInode>, FsError> {
        if mode & libc::S_IFMT != libc::S_IFSOCK {
            return Err(FsError::PermissionDenied);
        }

        let mount = self.mount()?;
        self.check_not_control_dir(&mount)?;
        self.materialize().await?;

        let inode;
        let target;
        {
            let mut contents = self.contents.write();
            let my_path = self.path().ok_or(FsError::NotFound)?;
            target = my_path.join(name);

            if contents.entries.contains_key(name) {
                return Err(FsError::Exists);
            }

            let number = mount.inode_map().allocate_inode_number();
            let now = InodeTimestamps::now();
            let file = mount.overlay().create_file(number, now)?;

            inode = FileInode::new_materialized(
                number,
                &mount,
                self,
                name.clone(),
                mode,
                file,
                now,
            );
            let mut entry = DirEntry::materialized(mode, number);
            entry.inode = Some(InodePtr::File(inode.clone()));
            contents.entries.insert(name.clone(), entry);
            mount.inode_map().inode_created(InodePtr::File(inode.clone()));

            contents.timestamps.mtime = now.mtime;
            contents.timestamps.ctime = now.ctime;
            mount.overlay().save_dir(self.ino, &contents.to_overlay())?;
        }

        self.invalidate_cache_if_required(&mount, origin, name);
        mount.journal().add_delta(JournalDelta::Created(target));
        Ok(inode)
    }

    /// Creates an empty subdirectory.
    #[instrument(skip(self), fields(rq.inode = self.ino.0, rq.name = %name))]
    pub async fn mkdir(
        self: &Arc<Self>,
        name: &PathComponent,
        mode: u32,
        origin: RequestOrigin,
    ) -> Result<Arc<TreeInode>, FsError> {
        let mount = self.mount()?;
        self.check_not_control_dir(&mount)?;
        self.materialize().await?;

        let child;
        let target;
        {
            let mut contents = self.contents.write();
            let my_path = self.path().ok_or(FsError::NotFound)?;
            target = my_path.join(name);

            if contents.entries.contains_key(name) {
                return Err(FsError::Exists);
            }

            let number = mount.inode_map().allocate_inode_number();
            let mode = libc::S_IFDIR | (mode & 0o7777);
            let now = InodeTimestamps::now();

            // The child's overlay record goes in before the parent's, the
            // same ordering materialization uses.
            let empty = DirContents {
                entries: Default::default(),
                tree_hash: None,
                timestamps: now,
            };
            mount.overlay().save_dir(number, &empty.to_overlay())?;

            child = TreeInode::new_child(number, &mount, self, name.clone(), empty);
            let mut entry = DirEntry::materialized(mode, number);
            entry.inode = Some(InodePtr::Tree(child.clone()));
            contents.entries.insert(name.clone(), entry);
            mount.inode_map().inode_created(InodePtr::Tree(child.clone()));

            contents.timestamps.mtime = now.mtime;
            contents.timestamps.ctime = now.ctime;
            mount.overlay().save_dir(self.ino, &contents.to_overlay())?;
        }

        self.invalidate_cache_if_required(&mount, origin, name);
        mount.journal().add_delta(JournalDelta::Created(target));
        Ok(child)
    }

    /// Hard links cannot be tracked in source control and are not
    /// representable in the directory model.
    pub fn link(&self, _existing: &InodePtr, _name: &PathComponent) -> Result<(), FsError> {
        Err(FsError::PermissionDenied)
    }

    // ------------------------------------------------------------------
    // Remove
    // ------------------------------------------------------------------

    /// The control directory cannot be removed or renamed over.
    fn check_not_control_name(&self, name: &PathComponent) -> Result<(), FsError> {
        if self.ino == ROOT_INO && name.as_ref() == Mount::CONTROL_DIR_NAME {
            return Err(FsError::PermissionDenied);
        }
        Ok(())
    }

    /// Removes a non-directory child.
    pub async fn unlink(
        self: &Arc<Self>,
        name: &PathComponent,
        origin: RequestOrigin,
    ) -> Result<(), FsError> {
        self.check_not_control_name(name)?;
        let child = self.get_or_load_child(name).await?;
        self.remove_impl(RemoveKind::File, name, child, origin).await
    }

    /// Removes an empty directory child.
    pub async fn rmdir(
        self: &Arc<Self>,
        name: &PathComponent,
        origin: RequestOrigin,
    ) -> Result<(), FsError> {
        self.check_not_control_name(name)?;
        let child = self.get_or_load_child(name).await?;
        self.remove_impl(RemoveKind::Dir, name, child, origin).await
    }

    async fn remove_impl(
        self: &Arc<Self>,
        kind: RemoveKind,
        name: &PathComponent,
        mut child: InodePtr,
        origin: RequestOrigin,
    ) -> Result<(), FsError> {
        let mount = self.mount()?;
        let mut attempt: u32 = 1;

        loop {
            // Verify the child is of the desired kind, and that it can be
            // removed, before we bother materializing ourself.
            check_child_kind(&kind, &child)?;
            check_pre_remove(&kind, &child)?;

            // We need the rename lock since we will be updating the child's
            // location.
            let rename_lock = mount.acquire_rename_lock().await;

            // Compute the journal path only after acquiring the rename lock
            // so the path cannot change under us.
            let my_path = self.path().ok_or(FsError::NotFound)?;
            let target = my_path.join(name);

            // The entry may have been replaced since we loaded the child;
            // remove whatever currently has this name.
            let flush_cache = origin != RequestOrigin::Kernel;
            let result = self.try_remove_child(&rename_lock, name, None, Some(&kind), flush_cache);
            match result {
                Ok(()) => {
                    mount.journal().add_delta(JournalDelta::Removed(target));
                    return Ok(());
                }
                Err(FsError::StaleReference) => {
                    drop(rename_lock);
                    // The child at this name has been replaced and is not
                    // loaded; load it and retry, up to the bound.
                    attempt += 1;
                    if attempt > MAX_REMOVE_RETRIES {
                        warn!(rq.name = %name, "remove retries exhausted");
                        return Err(FsError::io(
                            "inode was removed or renamed repeatedly while remove was in progress",
                        ));
                    }
                    child = self.get_or_load_child(name).await?;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Attempts to remove the named child while the rename lock is held.
    ///
    /// Fails with [FsError::StaleReference] when the entry is present but
    /// not loaded, or no longer refers to `expected`; the caller loads and
    /// retries. This error never escapes to users.
    pub(crate) fn try_remove_child(
        self: &Arc<Self>,
        rename_lock: &RenameLock,
        name: &PathComponent,
        expected: Option<&InodePtr>,
        kind: Option<&RemoveKind>,
        flush_cache: bool,
    ) -> Result<(), FsError> {
        let mount = self.mount()?;
        self.check_not_control_dir(&mount)?;
        self.materialize_locked(rename_lock)?;

        let deleted;
        {
            let mut contents = self.contents.write();
            let entry = contents.entries.get(name).ok_or(FsError::NotFound)?;
            let inode = match &entry.inode {
                Some(inode) => inode.clone(),
                // Not loaded: the caller has to load it and retry.
                None => return Err(FsError::StaleReference),
            };
            if let Some(expected) = expected {
                if expected.ino() != inode.ino() {
                    return Err(FsError::StaleReference);
                }
            }
            if let Some(kind) = kind {
                check_child_kind(kind, &inode)?;
                // Re-run the pre-remove check now that we hold our lock.
                check_pre_remove(kind, &inode)?;
            }

            inode.mark_unlinked();
            contents.entries.remove(name);

            let now = SystemTime::now();
            contents.timestamps.mtime = now;
            contents.timestamps.ctime = now;
            mount.overlay().save_dir(self.ino, &contents.to_overlay())?;
            deleted = inode;
        }

        // Destroy the removed inode only after releasing the contents lock.
        if let Some(destroyed) = mount.inode_map().inode_unlinked(deleted) {
            mount.destroy_unlinked_inode(&destroyed);
        }

        if flush_cache {
            mount.invalidate_entry(self.ino, name);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rename
    // ------------------------------------------------------------------

    /// Moves the child `name` of this directory to `dest_name` inside
    /// `dest_parent`.
    ///
    /// If the source or destination entries exist but are not loaded, all
    /// directory locks are dropped (the rename lock stays held), the inodes
    /// are loaded, and the entire validation re-runs, because other
    /// operations may have run while the locks were released.
    #[instrument(skip(self, dest_parent), fields(rq.inode = self.ino.0, rq.name = %name, rq.dest = %dest_name))]
    pub async fn rename(
        self: &Arc<Self>,
        name: &PathComponent,
        dest_parent: &Arc<TreeInode>,
        dest_name: &PathComponent,
        _origin: RequestOrigin,
    ) -> Result<(), FsError> {
        let mount = self.mount()?;
        self.check_not_control_dir(&mount)?;
        dest_parent.check_not_control_dir(&mount)?;
        self.check_not_control_name(name)?;
        dest_parent.check_not_control_name(dest_name)?;

        let rename_lock = mount.acquire_rename_lock().await;
        self.materialize_locked(&rename_lock)?;
        if dest_parent.ino != self.ino {
            dest_parent.materialize_locked(&rename_lock)?;
        }

        loop {
            match self.try_rename_locked(&mount, &rename_lock, name, dest_parent, dest_name)? {
                RenameOutcome::Done { deleted, journal } => {
                    // The journal entry is appended outside the contents
                    // locks but still under the rename lock, so journal order
                    // matches the visible operation order.
                    if let Some(delta) = journal {
                        mount.journal().add_delta(delta);
                    }
                    drop(rename_lock);
                    if let Some(deleted) = deleted {
                        if let Some(destroyed) = mount.inode_map().inode_unlinked(deleted) {
                            mount.destroy_unlinked_inode(&destroyed);
                        }
                    }
                    return Ok(());
                }
                RenameOutcome::NeedLoad { src, dest } => {
                    if src {
                        self.get_or_load_child(name).await?;
                    }
                    if dest {
                        dest_parent.get_or_load_child(dest_name).await?;
                    }
                }
            }
        }
    }

    /// One validation-and-commit attempt with every required contents lock
    /// held.
    ///
    /// Lock order: same-directory renames take one lock; if the source is an
    /// ancestor of the destination, source before destination; otherwise
    /// destination (and its existing directory child) before source. When
    /// the destination child is the source directory itself the lock is
    /// aliased rather than taken twice.
    fn try_rename_locked(
        self: &Arc<Self>,
        mount: &Arc<Mount>,
        rename_lock: &RenameLock,
        name: &PathComponent,
        dest_parent: &Arc<TreeInode>,
        dest_name: &PathComponent,
    ) -> Result<RenameOutcome, FsError> {
        let same_dir = self.ino == dest_parent.ino;
        let src_is_ancestor = !same_dir && is_ancestor(rename_lock, self, dest_parent);

        let mut same_guard = None;
        let mut src_guard = None;
        let mut dest_guard = None;

        if same_dir {
            same_guard = Some(self.contents.write());
        } else if src_is_ancestor {
            src_guard = Some(self.contents.write());
            dest_guard = Some(dest_parent.contents.write());
        } else {
            dest_guard = Some(dest_parent.contents.write());
        }

        // Look at the destination entry and lock its contents if it is a
        // loaded directory, so its emptiness can be tested atomically.
        let (dest_child_exists, dest_entry_is_dir, dest_child_inode) = {
            let dest_contents = same_guard
                .as_deref()
                .or(dest_guard.as_deref())
                .expect("destination contents must be locked");
            match dest_contents.entries.get(dest_name) {
                Some(entry) => (true, entry.is_directory(), entry.inode.clone()),
                None => (false, false, None),
            }
        };
        let dest_child_tree: Option<Arc<TreeInode>> = dest_child_inode
            .as_ref()
            .and_then(|inode| inode.as_tree())
            .cloned();

        let dest_child_guard = dest_child_tree
            .as_ref()
            .map(|tree| tree.contents.write());
        // If the destination child is the source directory itself, its guard
        // doubles as the source guard rather than locking the same inode
        // twice. Validation below rejects this rename (the source entry, if
        // present, makes the destination child non-empty), so the commit
        // path never sees the aliased configuration.
        let dest_child_aliases_src =
            matches!(&dest_child_tree, Some(tree) if tree.ino == self.ino);

        if !same_dir && !src_is_ancestor && !dest_child_aliases_src {
            src_guard = Some(self.contents.write());
        }

        // Validation, reading the source contents from whichever guard
        // covers them.
        let (src_entry_is_dir, src_inode, src_loaded) = {
            let contents = same_guard
                .as_deref()
                .or(src_guard.as_deref())
                .or(dest_child_guard.as_deref())
                .expect("source contents must be locked");
            match contents.entries.get(name) {
                None => return Err(FsError::NotFound),
                Some(entry) => (
                    entry.is_directory(),
                    entry.inode.clone(),
                    entry.inode.is_some(),
                ),
            }
        };

        if src_entry_is_dir {
            // The destination must not exist, or must be an empty directory,
            // or the exact same directory.
            if dest_child_exists {
                if !dest_entry_is_dir {
                    return Err(FsError::NotADirectory);
                }
                let same_inode = match (&src_inode, &dest_child_tree) {
                    (Some(src), Some(dest)) => src.ino() == dest.ino,
                    _ => false,
                };
                if !same_inode {
                    if let Some(false) = dest_child_guard
                        .as_deref()
                        .map(|contents| contents.entries.is_empty())
                    {
                        return Err(FsError::NotEmpty);
                    }
                }
            }
        } else if dest_child_exists && dest_entry_is_dir {
            return Err(FsError::IsADirectory);
        }

        if dest_parent.is_unlinked() {
            return Err(FsError::NotFound);
        }

        let need_src = !src_loaded;
        let need_dest = dest_child_exists && dest_child_inode.is_none();
        if need_src || need_dest {
            return Ok(RenameOutcome::NeedLoad {
                src: need_src,
                dest: need_dest,
            });
        }

        let src_inode = src_inode.ok_or_else(|| FsError::bug("source inode vanished"))?;

        // Renaming something to itself is a no-op.
        if let Some(dest_inode) = &dest_child_inode {
            if dest_inode.ino() == src_inode.ino() {
                return Ok(RenameOutcome::Done {
                    deleted: None,
                    journal: None,
                });
            }
        }

        // A directory cannot be moved into its own subtree.
        if src_entry_is_dir {
            let src_tree = src_inode
                .as_tree()
                .ok_or_else(|| FsError::bug("directory entry loaded as file"))?;
            if src_tree.ino == dest_parent.ino
                || is_ancestor(rename_lock, src_tree, dest_parent)
            {
                return Err(FsError::InvalidArgument);
            }
        }

        // Commit.
        let deleted = dest_child_inode.clone();
        if let Some(dest_inode) = &dest_child_inode {
            dest_inode.mark_unlinked();
        }

        match (&mut same_guard, &mut src_guard, &mut dest_guard) {
            (Some(contents), _, _) => {
                let entry = contents
                    .entries
                    .remove(name)
                    .ok_or_else(|| FsError::bug("source entry vanished during rename"))?;
                contents.entries.insert(dest_name.clone(), entry);
                mount.overlay().save_dir(self.ino, &contents.to_overlay())?;
            }
            (None, Some(src), Some(dest)) => {
                let entry = src
                    .entries
                    .remove(name)
                    .ok_or_else(|| FsError::bug("source entry vanished during rename"))?;
                dest.entries.insert(dest_name.clone(), entry);
                mount.overlay().save_dir(self.ino, &src.to_overlay())?;
                mount
                    .overlay()
                    .save_dir(dest_parent.ino, &dest.to_overlay())?;
            }
            _ => {
                // The aliasing configuration always fails validation above.
                return Err(FsError::bug("inconsistent rename lock state"));
            }
        }

        src_inode.update_location(dest_parent, dest_name.clone());

        drop(dest_child_guard);
        drop(same_guard);
        drop(src_guard);
        drop(dest_guard);

        // Compute journal paths with the contents locks released; the rename
        // lock keeps both paths stable.
        let journal = match (self.path(), dest_parent.path()) {
            (Some(src_path), Some(dest_path)) => Some(JournalDelta::Renamed {
                from: src_path.join(name),
                to: dest_path.join(dest_name),
            }),
            _ => None,
        };

        Ok(RenameOutcome::Done { deleted, journal })
    }

    // ------------------------------------------------------------------
    // Attributes
    // ------------------------------------------------------------------

    /// Applies an attribute change to this directory. Directories synthesize
    /// their stat data, so only timestamps are persisted.
    pub async fn setattr(self: &Arc<Self>, attr: SetAttr) -> Result<InodeAttr, FsError> {
        let mount = self.mount()?;
        self.check_not_control_dir(&mount)?;
        self.materialize().await?;

        let target;
        {
            let mut contents = self.contents.write();
            target = self.path().ok_or(FsError::NotFound)?;
            let now = SystemTime::now();
            if let Some(atime) = attr.atime {
                contents.timestamps.atime = atime;
            }
            if let Some(mtime) = attr.mtime {
                contents.timestamps.mtime = mtime;
            }
            contents.timestamps.ctime = now;
            mount.overlay().save_dir(self.ino, &contents.to_overlay())?;
        }

        mount.journal().add_delta(JournalDelta::Changed(target));
        Ok(self.getattr())
    }

    // ------------------------------------------------------------------
    // Unloading
    // ------------------------------------------------------------------

    /// Recursively removes quiesced descendants from the live inode table.
    /// A child can be unloaded once the kernel holds no references to it and
    /// (for directories) none of its own children are loaded.
    pub fn unload_children_now(self: &Arc<Self>) -> Result<(), FsError> {
        let mount = self.mount()?;

        let tree_children: Vec<Arc<TreeInode>> = {
            let contents = self.contents.read();
            contents
                .entries
                .values()
                .filter_map(|entry| entry.inode.as_ref())
                .filter_map(|inode| inode.as_tree())
                .cloned()
                .collect()
        };
        for child in &tree_children {
            child.unload_children_now()?;
        }

        let mut contents = self.contents.write();
        for (name, entry) in contents.entries.iter_mut() {
            let Some(inode) = entry.inode.clone() else {
                continue;
            };
            if let InodePtr::Tree(tree) = &inode {
                let has_loaded_children = tree
                    .contents
                    .read()
                    .entries
                    .values()
                    .any(|child| child.inode.is_some());
                if has_loaded_children {
                    continue;
                }
            }
            mount.inode_map().unload_inode(&inode, self.ino, name);
            entry.inode = None;
        }
        Ok(())
    }

    /// Loads (and optionally recurses into) every materialized child, used
    /// after mount to warm the tree of locally-modified state.
    pub fn load_materialized_children(
        self: &Arc<Self>,
        recurse: Recurse,
    ) -> BoxFuture<'static, Result<(), FsError>> {
        let this = self.clone();
        async move {
            let mount = this.mount()?;

            let mut receivers = Vec::new();
            let mut plans = Vec::new();
            {
                let mut contents = this.contents.write();
                if !contents.is_materialized() {
                    return Ok(());
                }
                for (name, entry) in contents.entries.iter_mut() {
                    if !entry.is_materialized() || entry.inode.is_some() {
                        continue;
                    }
                    let (rx, plan) = this.load_child_locked(&mount, name, entry);
                    receivers.push(rx);
                    if let Some(plan) = plan {
                        plans.push(plan);
                    }
                }
            }
            for plan in plans {
                this.start_load(&mount, plan);
            }

            for rx in receivers {
                let inode = rx
                    .await
                    .map_err(|_| FsError::io("inode load abandoned"))??;
                if recurse == Recurse::Deep {
                    if let InodePtr::Tree(tree) = inode {
                        tree.load_materialized_children(Recurse::Deep).await?;
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    // ------------------------------------------------------------------
    // Kernel cache invalidation
    // ------------------------------------------------------------------

    pub(crate) fn invalidate_cache(&self, mount: &Mount, name: &PathComponent) {
        mount.invalidate_entry(self.ino, name);
    }

    /// Requests originating from the kernel keep their own cache coherent;
    /// everything else must invalidate explicitly.
    pub(crate) fn invalidate_cache_if_required(
        &self,
        mount: &Mount,
        origin: RequestOrigin,
        name: &PathComponent,
    ) {
        if origin != RequestOrigin::Kernel {
            self.invalidate_cache(mount, name);
        }
    }
}

fn check_child_kind(kind: &RemoveKind, child: &InodePtr) -> Result<(), FsError> {
    match kind {
        RemoveKind::File => match child {
            InodePtr::File(_) => Ok(()),
            InodePtr::Tree(_) => Err(FsError::IsADirectory),
        },
        RemoveKind::Dir => match child {
            InodePtr::Tree(_) => Ok(()),
            InodePtr::File(_) => Err(FsError::NotADirectory),
        },
    }
}

fn check_pre_remove(kind: &RemoveKind, child: &InodePtr) -> Result<(), FsError> {
    match kind {
        RemoveKind::File => Ok(()),
        RemoveKind::Dir => {
            let tree = child.as_tree().ok_or(FsError::NotADirectory)?;
            if !tree.contents.read().entries.is_empty() {
                return Err(FsError::NotEmpty);
            }
            Ok(())
        }
    }
}

/// Whether `a` is a strict ancestor of `b`. Only meaningful while the rename
/// lock is held, which keeps the parent chain stable.
pub(crate) fn is_ancestor(_rename_lock: &RenameLock, a: &Arc<TreeInode>, b: &Arc<TreeInode>) -> bool {
    let mut location = b.location();
    while let Some((parent, _)) = location.parent {
        let Some(parent) = parent.upgrade() else {
            return false;
        };
        if parent.ino() == a.ino() {
            return true;
        }
        location = parent.location();
    }
    false
}
