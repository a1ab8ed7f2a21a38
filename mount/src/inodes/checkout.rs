//! The checkout engine: transitions a directory tree from one snapshot tree
//! to another, detecting conflicts, applying updates, and dematerializing
//! subtrees that end up identical to the destination snapshot.
use std::sync::Arc;

use driftfs_castore::store::ObjectStore as _;
use driftfs_castore::{Digest, PathComponent, RepoPathBuf, Tree, TreeEntry};
use futures::future::join_all;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tracing::{debug, instrument};

use super::inode_map::LoadReceiver;
use super::tree_inode::{LoadPlan, RemoveKind};
use super::{entry_from_scm, InodePtr, TreeInode};
use crate::mount::{Mount, RenameLock};
use crate::FsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutMode {
    /// Only report the conflicts this transition would hit.
    DryRun,
    /// Apply the transition, leaving conflicted entries untouched.
    Normal,
    /// Apply the transition, overwriting conflicted entries.
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictType {
    /// The file was removed locally, and also removed in the new tree.
    MissingRemoved,
    /// The file was removed locally, but modified in the new tree.
    RemovedModified,
    /// The entry exists locally but is untracked in the old tree, and the
    /// new tree adds it.
    UntrackedAdded,
    /// The entry was modified locally and also changed between the trees.
    ModifiedModified,
    /// A directory scheduled for removal still has untracked children.
    DirectoryNotEmpty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutConflict {
    pub path: RepoPathBuf,
    pub conflict_type: ConflictType,
}

#[derive(Debug)]
pub struct CheckoutError {
    pub path: RepoPathBuf,
    pub error: FsError,
}

/// Carries one checkout across the tree walk: the mode, the rename lock
/// (held for the entire transition), and the accumulated conflicts and
/// errors. Checkout never fails fast; the caller gets the full list.
pub struct CheckoutContext {
    mode: CheckoutMode,
    rename_lock: RenameLock,
    conflicts: Mutex<Vec<CheckoutConflict>>,
    errors: Mutex<Vec<CheckoutError>>,
}

impl CheckoutContext {
    pub(crate) fn new(mode: CheckoutMode, rename_lock: RenameLock) -> Self {
        Self {
            mode,
            rename_lock,
            conflicts: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.mode == CheckoutMode::DryRun
    }

    pub fn force_update(&self) -> bool {
        self.mode == CheckoutMode::Force
    }

    pub(crate) fn rename_lock(&self) -> &RenameLock {
        &self.rename_lock
    }

    pub(crate) fn add_conflict(&self, conflict_type: ConflictType, path: RepoPathBuf) {
        debug!(checkout.conflict = ?conflict_type, checkout.path = %path, "conflict");
        self.conflicts.lock().push(CheckoutConflict {
            path,
            conflict_type,
        });
    }

    pub(crate) fn add_error(&self, path: RepoPathBuf, error: FsError) {
        self.errors.lock().push(CheckoutError { path, error });
    }

    /// Releases the rename lock and hands back everything accumulated.
    pub(crate) fn finish(self) -> crate::mount::CheckoutResult {
        crate::mount::CheckoutResult {
            conflicts: self.conflicts.into_inner(),
            errors: self.errors.into_inner(),
        }
    }
}

enum InodeSource {
    Ready(InodePtr),
    Pending(LoadReceiver),
}

/// One entry whose transition requires a loaded inode: run resolves the
/// inode, fetches the snapshot trees involved, and applies the update.
struct CheckoutAction {
    name: PathComponent,
    old_entry: Option<TreeEntry>,
    new_entry: Option<TreeEntry>,
    inode: InodeSource,
}

impl CheckoutAction {
    async fn run(
        self,
        ctx: &CheckoutContext,
        parent: &Arc<TreeInode>,
        mount: &Arc<Mount>,
    ) -> Result<(), FsError> {
        let inode = match self.inode {
            InodeSource::Ready(inode) => inode,
            InodeSource::Pending(rx) => rx
                .await
                .map_err(|_| FsError::io("inode load abandoned"))??,
        };

        // Compare the loaded inode against the old snapshot state. Entries
        // that differ were modified locally; without force they are left
        // alone. Directory-to-directory transitions recurse instead, so the
        // conflicts inside them come out with precise paths.
        let path = parent.path().unwrap_or_default().join(&self.name);
        let conflict = match (&self.old_entry, &inode) {
            (None, _) => Some(ConflictType::UntrackedAdded),
            (Some(old), InodePtr::Tree(_)) if old.kind.is_tree() => None,
            (Some(_), InodePtr::Tree(_)) => Some(ConflictType::ModifiedModified),
            (Some(old), InodePtr::File(_)) if old.kind.is_tree() => {
                Some(ConflictType::ModifiedModified)
            }
            (Some(old), InodePtr::File(file)) => {
                if file.is_same_as(old).await? {
                    None
                } else {
                    Some(ConflictType::ModifiedModified)
                }
            }
        };
        if let Some(conflict_type) = conflict {
            ctx.add_conflict(conflict_type, path);
            if !ctx.force_update() {
                return Ok(());
            }
        }

        let old_tree = match &self.old_entry {
            Some(entry) if entry.kind.is_tree() => Some(fetch_tree(mount, &entry.digest).await?),
            _ => None,
        };
        let new_tree = match &self.new_entry {
            Some(entry) if entry.kind.is_tree() => Some(fetch_tree(mount, &entry.digest).await?),
            _ => None,
        };

        parent
            .checkout_update_entry(ctx, &self.name, inode, old_tree, new_tree, self.new_entry)
            .await
    }
}

async fn fetch_tree(mount: &Arc<Mount>, digest: &Digest) -> Result<Arc<Tree>, FsError> {
    mount
        .object_store()
        .get_tree(digest)
        .await?
        .ok_or_else(|| FsError::io(format!("missing tree {}", digest)))
}

/// Whether the whole directory transition can be skipped because the
/// directory is clean at a hash that makes the walk a no-op.
fn can_short_circuit_checkout(
    ctx: &CheckoutContext,
    tree_hash: &Digest,
    from: Option<&Tree>,
    to: Option<&Tree>,
) -> bool {
    if ctx.is_dry_run() {
        // A dry run only looks for conflicts against the old state. With no
        // old tree, being in the destination state already means no
        // conflicts are possible.
        return match from {
            Some(from) => *tree_hash == from.digest(),
            None => match to {
                None => true,
                Some(to) => *tree_hash == to.digest(),
            },
        };
    }

    // A real update has work to do unless we are already in the destination
    // state.
    match to {
        Some(to) if *tree_hash == to.digest() => {}
        _ => return false,
    }

    match from {
        // With no old tree the only possible conflicts are untracked
        // additions, which being in the destination state already resolves.
        None => true,
        // Keep walking when the old state differs, purely to report
        // conflicts even though force updates would ignore them.
        Some(from) => *tree_hash == from.digest(),
    }
}

impl TreeInode {
    /// Transitions this directory from `from_tree` to `to_tree`. Either may
    /// be absent (directory added or removed by the transition).
    pub(crate) fn checkout<'a>(
        self: &'a Arc<Self>,
        ctx: &'a CheckoutContext,
        from_tree: Option<Arc<Tree>>,
        to_tree: Option<Arc<Tree>>,
    ) -> BoxFuture<'a, Result<(), FsError>> {
        async move {
            let mount = self.mount()?;
            let (actions, plans) =
                self.compute_checkout_actions(&mount, ctx, from_tree.as_deref(), to_tree.as_deref())?;

            // Wire up the loads we are responsible for, now that the
            // contents lock has been released.
            for plan in plans {
                self.start_load(&mount, plan);
            }

            // Run all the actions concurrently, folding per-entry failures
            // into the context rather than failing the whole checkout.
            let dir_path = self.path().unwrap_or_default();
            let results = join_all(actions.into_iter().map(|action| {
                let name = action.name.clone();
                let mount = &mount;
                async move { (name, action.run(ctx, self, mount).await) }
            }))
            .await;
            for (name, result) in results {
                if let Err(error) = result {
                    ctx.add_error(dir_path.join(&name), error);
                }
            }

            self.save_overlay_post_checkout(ctx, to_tree.as_deref())
        }
        .boxed()
    }

    /// Walks `from` and `to` in their shared sorted order, emitting at most
    /// one action per name; runs entirely under the contents write lock.
    fn compute_checkout_actions(
        self: &Arc<Self>,
        mount: &Arc<Mount>,
        ctx: &CheckoutContext,
        from: Option<&Tree>,
        to: Option<&Tree>,
    ) -> Result<(Vec<CheckoutAction>, Vec<LoadPlan>), FsError> {
        let mut actions = Vec::new();
        let mut plans = Vec::new();
        let mut contents = self.contents.write();

        if let Some(tree_hash) = contents.tree_hash.clone() {
            if can_short_circuit_checkout(ctx, &tree_hash, from, to) {
                return Ok((actions, plans));
            }
        }

        let dir_path = self.path().unwrap_or_default();

        let old_entries: Vec<(&PathComponent, &TreeEntry)> =
            from.map(|tree| tree.entries().collect()).unwrap_or_default();
        let new_entries: Vec<(&PathComponent, &TreeEntry)> =
            to.map(|tree| tree.entries().collect()).unwrap_or_default();

        // Entries in our contents that appear in neither tree are untracked
        // in both the old and new snapshots, and are skipped entirely.
        let mut old_idx = 0;
        let mut new_idx = 0;
        loop {
            let (old_entry, new_entry) = if old_idx >= old_entries.len() {
                if new_idx >= new_entries.len() {
                    break;
                }
                new_idx += 1;
                (None, Some(new_entries[new_idx - 1]))
            } else if new_idx >= new_entries.len() {
                old_idx += 1;
                (Some(old_entries[old_idx - 1]), None)
            } else if old_entries[old_idx].0 < new_entries[new_idx].0 {
                old_idx += 1;
                (Some(old_entries[old_idx - 1]), None)
            } else if old_entries[old_idx].0 > new_entries[new_idx].0 {
                new_idx += 1;
                (None, Some(new_entries[new_idx - 1]))
            } else {
                old_idx += 1;
                new_idx += 1;
                (
                    Some(old_entries[old_idx - 1]),
                    Some(new_entries[new_idx - 1]),
                )
            };

            if let Some(action) = self.process_checkout_entry(
                mount,
                ctx,
                &mut contents,
                &dir_path,
                old_entry,
                new_entry,
                &mut plans,
            )? {
                actions.push(action);
            }
        }

        Ok((actions, plans))
    }

    #[allow(clippy::too_many_arguments)]
    fn process_checkout_entry(
        self: &Arc<Self>,
        mount: &Arc<Mount>,
        ctx: &CheckoutContext,
        contents: &mut super::DirContents,
        dir_path: &RepoPathBuf,
        old_scm: Option<(&PathComponent, &TreeEntry)>,
        new_scm: Option<(&PathComponent, &TreeEntry)>,
        plans: &mut Vec<LoadPlan>,
    ) -> Result<Option<CheckoutAction>, FsError> {
        // Unless this is a force checkout, entries identical between the old
        // and new trees need no processing at all.
        if !ctx.force_update() {
            if let (Some((_, old)), Some((_, new))) = (old_scm, new_scm) {
                if old.kind == new.kind && old.digest == new.digest {
                    return Ok(None);
                }
            }
        }

        let name = old_scm
            .or(new_scm)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| FsError::bug("checkout entry with neither side present"))?;

        let Some(entry) = contents.entries.get_mut(&name) else {
            match (old_scm, new_scm) {
                (None, Some((_, new))) => {
                    // Added in the new tree and absent locally: insert it.
                    if !ctx.is_dry_run() {
                        contents.entries.insert(name.clone(), entry_from_scm(new));
                        self.invalidate_cache(mount, &name);
                    }
                }
                (Some(_), None) => {
                    // Removed in the new tree, and already removed locally.
                    // Nothing to apply, but it is still a conflict.
                    ctx.add_conflict(ConflictType::MissingRemoved, dir_path.join(&name));
                }
                (Some(_), Some((_, new))) => {
                    // Removed locally, but modified in the new tree.
                    ctx.add_conflict(ConflictType::RemovedModified, dir_path.join(&name));
                    if ctx.force_update() {
                        contents.entries.insert(name.clone(), entry_from_scm(new));
                        self.invalidate_cache(mount, &name);
                    }
                }
                (None, None) => unreachable!("guarded above"),
            }
            return Ok(None);
        };

        if let Some(inode) = entry.inode.clone() {
            // Already loaded: process it through a checkout action.
            return Ok(Some(CheckoutAction {
                name,
                old_entry: old_scm.map(|(_, e)| e.clone()),
                new_entry: new_scm.map(|(_, e)| e.clone()),
                inode: InodeSource::Ready(inode),
            }));
        }

        if entry.ino.is_some() {
            // An inode number means another thread may be loading it, and
            // covers materialized entries too (an entry cannot be
            // materialized without a number). Load it and process the action
            // once it is ready.
            let (rx, plan) = self.load_child_locked(mount, &name, entry);
            if let Some(plan) = plan {
                plans.push(plan);
            }
            return Ok(Some(CheckoutAction {
                name,
                old_entry: old_scm.map(|(_, e)| e.clone()),
                new_entry: new_scm.map(|(_, e)| e.clone()),
                inode: InodeSource::Pending(rx),
            }));
        }

        // Unloaded and unmaterialized: conflicts are decided from the entry
        // hash alone.
        let conflict_type = match old_scm {
            None => Some(ConflictType::UntrackedAdded),
            Some((_, old)) if entry.hash.as_ref() != Some(&old.digest) => {
                Some(ConflictType::ModifiedModified)
            }
            Some(_) => None,
        };

        if let Some(conflict_type) = conflict_type {
            if entry.is_directory() {
                // Directories have to be loaded and recursed into just to
                // report an accurate list of conflicted files.
                let (rx, plan) = self.load_child_locked(mount, &name, entry);
                if let Some(plan) = plan {
                    plans.push(plan);
                }
                return Ok(Some(CheckoutAction {
                    name,
                    old_entry: old_scm.map(|(_, e)| e.clone()),
                    new_entry: new_scm.map(|(_, e)| e.clone()),
                    inode: InodeSource::Pending(rx),
                }));
            }

            ctx.add_conflict(conflict_type, dir_path.join(&name));
            if !ctx.force_update() {
                return Ok(None);
            }
        }

        if ctx.is_dry_run() {
            return Ok(None);
        }

        match new_scm {
            None => {
                contents.entries.remove(&name);
            }
            Some((_, new)) => {
                *entry = entry_from_scm(new);
            }
        }
        // No cache invalidation here: entries are always given an inode
        // number before the kernel hears about them, and this one never had
        // one.

        Ok(None)
    }

    /// Applies one checkout action to a loaded child.
    pub(crate) async fn checkout_update_entry(
        self: &Arc<Self>,
        ctx: &CheckoutContext,
        name: &PathComponent,
        inode: InodePtr,
        old_tree: Option<Arc<Tree>>,
        new_tree: Option<Arc<Tree>>,
        new_entry: Option<TreeEntry>,
    ) -> Result<(), FsError> {
        let tree_inode = match inode.as_tree() {
            Some(tree) => tree.clone(),
            None => {
                // A non-directory never needs recursion; replace or remove
                // the entry directly.
                if ctx.is_dry_run() {
                    return Ok(());
                }
                let mount = self.mount()?;
                {
                    let mut contents = self.contents.write();
                    let entry = contents.entries.get_mut(name).ok_or_else(|| {
                        FsError::bug(format!(
                            "entry {} removed while holding rename lock during checkout",
                            name
                        ))
                    })?;
                    match &entry.inode {
                        Some(current) if current.ino() == inode.ino() => {}
                        _ => {
                            return Err(FsError::bug(format!(
                                "entry {} changed while holding rename lock during checkout",
                                name
                            )))
                        }
                    }

                    inode.mark_unlinked();
                    match &new_entry {
                        Some(new_scm) => *entry = entry_from_scm(new_scm),
                        None => {
                            contents.entries.remove(name);
                        }
                    }
                    // Our own overlay record is written once the whole
                    // directory finishes in save_overlay_post_checkout.
                }
                if let Some(destroyed) = mount.inode_map().inode_unlinked(inode) {
                    mount.destroy_unlinked_inode(&destroyed);
                }
                self.invalidate_cache(&mount, name);
                return Ok(());
            }
        };

        // Directory to directory: recursion does everything.
        if new_tree.is_some() {
            return tree_inode.checkout(ctx, old_tree, new_tree).await;
        }

        if ctx.is_dry_run() {
            return Ok(());
        }

        // The directory disappears (or becomes a file) in the new tree.
        // Checking out to nothing empties it and removes it if possible.
        tree_inode.checkout(ctx, old_tree, None).await?;

        if !tree_inode.is_unlinked() {
            // Untracked children kept the directory alive; this conflict
            // cannot be resolved.
            ctx.add_conflict(
                ConflictType::DirectoryNotEmpty,
                tree_inode.path().unwrap_or_default(),
            );
            return Ok(());
        }

        if let Some(new_scm) = new_entry {
            let mount = self.mount()?;
            let inserted = {
                let mut contents = self.contents.write();
                match contents.entries.entry(name.clone()) {
                    std::collections::btree_map::Entry::Vacant(vacant) => {
                        vacant.insert(entry_from_scm(&new_scm));
                        true
                    }
                    std::collections::btree_map::Entry::Occupied(_) => false,
                }
            };
            if inserted {
                self.invalidate_cache(&mount, name);
            } else {
                // We don't block new file creations during checkout, so
                // someone may have taken the name in the meantime.
                ctx.add_error(
                    self.path().unwrap_or_default().join(name),
                    FsError::Exists,
                );
            }
        }
        Ok(())
    }

    /// Decides, after all children have been processed, whether this
    /// directory can dematerialize to the destination tree, and persists the
    /// outcome.
    #[instrument(skip_all, fields(rq.inode = self.ino().0))]
    pub(crate) fn save_overlay_post_checkout(
        self: &Arc<Self>,
        ctx: &CheckoutContext,
        tree: Option<&Tree>,
    ) -> Result<(), FsError> {
        if ctx.is_dry_run() {
            return Ok(());
        }

        let mount = self.mount()?;
        let (is_materialized, state_changed, delete_self, new_hash) = {
            let mut contents = self.contents.write();

            let dematerialized_hash = (|| -> Option<Digest> {
                // With no destination tree there is nothing to be identical
                // to; we must stay materialized.
                let tree = tree?;
                if tree.len() != contents.entries.len() {
                    return None;
                }
                // Both maps sort by name, so a single zipped pass suffices.
                for ((scm_name, scm_entry), (name, entry)) in
                    tree.entries().zip(contents.entries.iter())
                {
                    if scm_name != name {
                        return None;
                    }
                    // A materialized child forces us to stay materialized to
                    // record that fact, even if its contents happen to match.
                    if entry.is_materialized() {
                        return None;
                    }
                    if entry.hash.as_ref() != Some(&scm_entry.digest) {
                        return None;
                    }
                }
                Some(tree.digest())
            })();

            // A directory left empty with no snapshot counterpart removes
            // itself entirely.
            let delete_self = tree.is_none() && contents.entries.is_empty();

            let old_hash = contents.tree_hash.clone();
            contents.tree_hash = dematerialized_hash;
            let is_materialized = contents.is_materialized();
            let state_changed = old_hash != contents.tree_hash;

            if is_materialized {
                // Possibly unchanged from what is already on disk, but
                // detecting that is not worth the bookkeeping; write it out.
                mount.overlay().save_dir(self.ino(), &contents.to_overlay())?;
            }
            (
                is_materialized,
                state_changed,
                delete_self,
                contents.tree_hash.clone(),
            )
        };

        if delete_self && self.checkout_try_remove_empty_dir(ctx)? {
            return Ok(());
        }

        if state_changed {
            let location = self.location();
            if let Some((parent, name)) = location.parent {
                if !location.unlinked {
                    if let Some(parent) = parent.upgrade() {
                        if is_materialized {
                            parent.child_materialized(ctx.rename_lock(), &name, self.ino())?;
                        } else {
                            let hash = new_hash
                                .ok_or_else(|| FsError::bug("dematerialized without a hash"))?;
                            parent.child_dematerialized(ctx.rename_lock(), &name, hash)?;
                        }
                    }
                }
            }

            // When dematerializing, the parent records the clean hash first
            // and only then does the overlay data go away, so the parent
            // never points at overlay data that does not exist.
            if !is_materialized {
                mount.overlay().remove(self.ino())?;
            }
        }
        Ok(())
    }

    /// Removes this now-empty directory from its parent. Failure (for
    /// example a concurrent creation inside it) is not an error; the
    /// directory just stays.
    fn checkout_try_remove_empty_dir(self: &Arc<Self>, ctx: &CheckoutContext) -> Result<bool, FsError> {
        let location = self.location();
        if location.unlinked {
            return Ok(false);
        }
        let Some((parent, name)) = location.parent else {
            // The root can never remove itself.
            return Ok(false);
        };
        let Some(parent) = parent.upgrade() else {
            return Ok(false);
        };

        let this = InodePtr::Tree(self.clone());
        match parent.try_remove_child(
            ctx.rename_lock(),
            &name,
            Some(&this),
            Some(&RemoveKind::Dir),
            true,
        ) {
            Ok(()) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}
