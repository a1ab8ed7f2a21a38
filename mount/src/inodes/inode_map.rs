//! The central inode registry: number allocation, the number-to-inode table,
//! load-in-progress bookkeeping, and the kernel lookup-count bridge.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use driftfs_castore::PathComponent;
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

use super::{InodeNumber, InodePtr, ROOT_INO};
use crate::FsError;

/// A promise attached to an in-progress inode load. Fulfilled exactly once,
/// outside any directory contents lock.
pub(crate) type LoadPromise = oneshot::Sender<Result<InodePtr, FsError>>;
pub(crate) type LoadReceiver = oneshot::Receiver<Result<InodePtr, FsError>>;

struct UnloadedInode {
    parent: InodeNumber,
    name: PathComponent,
    /// Whether some caller is currently driving the load for this inode.
    loading: bool,
    promises: Vec<LoadPromise>,
    /// Kernel references held while the inode is not resident.
    fuse_refcount: u64,
}

#[derive(Default)]
struct State {
    loaded: HashMap<InodeNumber, InodePtr>,
    unloaded: HashMap<InodeNumber, UnloadedInode>,
}

/// All transitions on the loading tables are serialized by the single state
/// lock; the at-most-once load guarantee is the product of
/// [should_load_child](InodeMap::should_load_child) being the single atomic
/// decision point. The lock is never held across I/O.
pub struct InodeMap {
    next_inode: AtomicU64,
    state: Mutex<State>,
}

impl Default for InodeMap {
    fn default() -> Self {
        Self {
            // The root takes inode number 1.
            next_inode: AtomicU64::new(ROOT_INO.0 + 1),
            state: Mutex::new(State::default()),
        }
    }
}

impl InodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a fresh inode number. Never returns a previously-issued one.
    pub fn allocate_inode_number(&self) -> InodeNumber {
        InodeNumber(self.next_inode.fetch_add(1, Ordering::AcqRel))
    }

    /// Registers a freshly constructed inode (root, or a child created by a
    /// filesystem mutation) as loaded.
    pub(crate) fn inode_created(&self, inode: InodePtr) {
        let mut state = self.state.lock().expect("inode map lock poisoned");
        state.loaded.insert(inode.ino(), inode);
    }

    pub fn get_loaded(&self, ino: InodeNumber) -> Option<InodePtr> {
        let state = self.state.lock().expect("inode map lock poisoned");
        state.loaded.get(&ino).cloned()
    }

    /// The number of currently resident inodes, the root included.
    pub fn loaded_count(&self) -> usize {
        let state = self.state.lock().expect("inode map lock poisoned");
        state.loaded.len()
    }

    /// Decides whether the caller should drive the load for inode `n`.
    ///
    /// If `n` is already being loaded the promise is attached to the existing
    /// load and `false` is returned. Otherwise a pending load is recorded
    /// with the caller's promise and `true` instructs the caller to start it.
    pub(crate) fn should_load_child(
        &self,
        parent: InodeNumber,
        name: &PathComponent,
        n: InodeNumber,
        promise: LoadPromise,
    ) -> bool {
        let mut state = self.state.lock().expect("inode map lock poisoned");
        let unloaded = state
            .unloaded
            .entry(n)
            .or_insert_with(|| UnloadedInode {
                parent,
                name: name.clone(),
                loading: false,
                promises: Vec::new(),
                fuse_refcount: 0,
            });
        // The entry may have moved since it was first recorded; refresh the
        // parent backpointer so ancestor walks stay accurate.
        unloaded.parent = parent;
        unloaded.name = name.clone();
        unloaded.promises.push(promise);
        if unloaded.loading {
            false
        } else {
            unloaded.loading = true;
            true
        }
    }

    /// Marks a pending load satisfied and returns the promises to fulfill.
    ///
    /// The caller must fulfill them *outside* any contents lock. Kernel
    /// references accumulated while the inode was unloaded are transferred to
    /// the live inode.
    #[must_use = "the returned promises must be fulfilled outside any contents lock"]
    pub(crate) fn inode_load_complete(&self, inode: &InodePtr) -> Vec<LoadPromise> {
        let mut state = self.state.lock().expect("inode map lock poisoned");
        let promises = match state.unloaded.remove(&inode.ino()) {
            Some(unloaded) => {
                inode.add_fuse_refcount(unloaded.fuse_refcount);
                unloaded.promises
            }
            None => Vec::new(),
        };
        state.loaded.insert(inode.ino(), inode.clone());
        promises
    }

    /// Fails a pending load, fulfilling each attached promise with an error.
    /// The unloaded record survives so a later caller may retry.
    pub(crate) fn inode_load_failed(&self, n: InodeNumber, error: &FsError) {
        let promises = {
            let mut state = self.state.lock().expect("inode map lock poisoned");
            match state.unloaded.get_mut(&n) {
                Some(unloaded) => {
                    unloaded.loading = false;
                    std::mem::take(&mut unloaded.promises)
                }
                None => Vec::new(),
            }
        };
        warn!(rq.inode = n.0, error = %error, "inode load failed");
        for promise in promises {
            let _ = promise.send(Err(error.clone()));
        }
    }

    /// Resolves an inode number to a live inode, loading it (and any
    /// unloaded ancestors) on demand by walking down from the closest loaded
    /// ancestor. Each parent is known because loading an entry records the
    /// parent backpointer.
    #[instrument(skip(self))]
    pub async fn lookup_inode(&self, n: InodeNumber) -> Result<InodePtr, FsError> {
        loop {
            // Find the deepest loaded ancestor and the first missing child
            // below it, all under the state lock.
            let (ancestor, child_name, child_ino) = {
                let state = self.state.lock().expect("inode map lock poisoned");
                if let Some(inode) = state.loaded.get(&n) {
                    return Ok(inode.clone());
                }

                let mut cur = n;
                loop {
                    let unloaded = state.unloaded.get(&cur).ok_or(FsError::NotFound)?;
                    if let Some(parent) = state.loaded.get(&unloaded.parent) {
                        break (parent.clone(), unloaded.name.clone(), cur);
                    }
                    cur = unloaded.parent;
                }
            };

            let tree = ancestor
                .as_tree()
                .ok_or_else(|| FsError::bug(format!("parent of inode {} is not a directory", n)))?
                .clone();

            debug!(rq.inode = n.0, load.child = %child_name, "loading ancestor chain");
            let loaded = tree.load_child_with_number(&child_name, child_ino).await?;
            if loaded.ino() == n {
                return Ok(loaded);
            }
            if loaded.ino() != child_ino {
                // The name was replaced by a different inode, so the
                // recorded chain for `n` is dead; drop the stale record
                // unless `n` got loaded through another path meanwhile.
                let mut state = self.state.lock().expect("inode map lock poisoned");
                if state.loaded.contains_key(&n) {
                    continue;
                }
                if let Some(unloaded) = state.unloaded.get(&n) {
                    if unloaded.promises.is_empty() && !unloaded.loading {
                        state.unloaded.remove(&n);
                    }
                }
                return Err(FsError::NotFound);
            }
        }
    }

    pub async fn lookup_tree_inode(
        &self,
        n: InodeNumber,
    ) -> Result<std::sync::Arc<super::TreeInode>, FsError> {
        match self.lookup_inode(n).await? {
            InodePtr::Tree(tree) => Ok(tree),
            InodePtr::File(_) => Err(FsError::NotADirectory),
        }
    }

    pub async fn lookup_file_inode(
        &self,
        n: InodeNumber,
    ) -> Result<std::sync::Arc<super::FileInode>, FsError> {
        match self.lookup_inode(n).await? {
            InodePtr::File(file) => Ok(file),
            InodePtr::Tree(_) => Err(FsError::IsADirectory),
        }
    }

    /// Records an additional kernel reference on a live inode.
    pub(crate) fn inc_fuse_refcount(&self, inode: &InodePtr) {
        inode.add_fuse_refcount(1);
    }

    /// Processes a `forget(n, delta)` from the kernel.
    ///
    /// Dropping the last kernel reference of an unlinked inode destroys it;
    /// the destroyed inode is returned so the caller can release its
    /// overlay state.
    pub fn dec_fuse_refcount(&self, n: InodeNumber, delta: u64) -> Option<InodePtr> {
        let mut state = self.state.lock().expect("inode map lock poisoned");
        if let Some(inode) = state.loaded.get(&n) {
            let remaining = inode.sub_fuse_refcount(delta);
            if remaining == 0 && inode.is_unlinked() {
                debug!(rq.inode = n.0, "destroying forgotten unlinked inode");
                return state.loaded.remove(&n);
            }
            return None;
        }

        if let Some(unloaded) = state.unloaded.get_mut(&n) {
            unloaded.fuse_refcount = unloaded.fuse_refcount.saturating_sub(delta);
            if unloaded.fuse_refcount == 0 && !unloaded.loading && unloaded.promises.is_empty() {
                state.unloaded.remove(&n);
            }
        }
        None
    }

    /// Called after an inode was unlinked from its parent, with no contents
    /// lock held. If no kernel references remain the inode is destroyed now
    /// and returned for final cleanup; otherwise it stays resident until
    /// `forget` drains the count.
    pub(crate) fn inode_unlinked(&self, inode: InodePtr) -> Option<InodePtr> {
        if inode.fuse_refcount() > 0 {
            return None;
        }
        let mut state = self.state.lock().expect("inode map lock poisoned");
        state.loaded.remove(&inode.ino());
        drop(state);
        Some(inode)
    }

    /// Removes a quiesced inode from the live table. Called by the parent
    /// while its contents lock is held, so no new lookups can race the
    /// removal. The number is re-registered as unloaded, keeping the parent
    /// backpointer, so later number-based lookups can walk back down and
    /// bring it back with the same number.
    pub(crate) fn unload_inode(
        &self,
        inode: &InodePtr,
        parent: InodeNumber,
        name: &PathComponent,
    ) {
        let mut state = self.state.lock().expect("inode map lock poisoned");
        state.loaded.remove(&inode.ino());
        state.unloaded.insert(
            inode.ino(),
            UnloadedInode {
                parent,
                name: name.clone(),
                loading: false,
                promises: Vec::new(),
                fuse_refcount: inode.fuse_refcount(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::{InodeMap, ROOT_INO};

    #[test]
    fn allocation_is_monotonic() {
        let map = InodeMap::new();
        let a = map.allocate_inode_number();
        let b = map.allocate_inode_number();
        assert!(a.0 > ROOT_INO.0);
        assert!(b.0 > a.0);
    }

    #[tokio::test]
    async fn lookup_unknown_inode_fails() {
        let map = InodeMap::new();
        let n = map.allocate_inode_number();
        assert!(map.lookup_inode(n).await.is_err());
    }

    #[test]
    fn should_load_child_is_at_most_once() {
        let map = InodeMap::new();
        let n = map.allocate_inode_number();
        let name = "child".try_into().unwrap();

        let (tx1, _rx1) = tokio::sync::oneshot::channel();
        let (tx2, _rx2) = tokio::sync::oneshot::channel();

        assert!(map.should_load_child(ROOT_INO, &name, n, tx1));
        // A second caller attaches to the same pending load.
        assert!(!map.should_load_child(ROOT_INO, &name, n, tx2));
    }
}
