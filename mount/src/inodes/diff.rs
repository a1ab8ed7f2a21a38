//! The diff engine: reports the modifications of the live tree relative to
//! a reference snapshot tree, honoring hierarchical gitignore rules.
use std::sync::Arc;

use bytes::Bytes;
use driftfs_castore::{store::ObjectStore, Digest, PathComponent, RepoPath, RepoPathBuf, Tree, TreeEntry};
use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::inode_map::LoadReceiver;
use super::tree_inode::LoadPlan;
use super::{FileInode, InodePtr, TreeInode};
use crate::gitignore::{IgnoreStack, MatchResult};
use crate::mount::Mount;
use crate::FsError;

const IGNORE_FILENAME: &[u8] = b".gitignore";

/// Symlinked ignore files resolve through at most this many hops.
const MAX_SYMLINK_HOPS: usize = 8;

/// Receives diff results. Implementations must tolerate concurrent calls
/// from multiple subtree walks.
pub trait DiffCallback: Send + Sync {
    fn untracked_file(&self, path: &RepoPath);
    fn ignored_file(&self, path: &RepoPath);
    fn removed_file(&self, path: &RepoPath);
    fn modified_file(&self, path: &RepoPath);
    /// A subtree walk failed. The overall diff still completes; the error is
    /// attributed to this path only.
    fn diff_error(&self, path: &RepoPath, error: &FsError);
}

pub struct DiffContext {
    callback: Arc<dyn DiffCallback>,
    pub list_ignored: bool,
    store: Arc<dyn ObjectStore>,
}

impl DiffContext {
    pub(crate) fn new(
        callback: Arc<dyn DiffCallback>,
        list_ignored: bool,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            callback,
            list_ignored,
            store,
        }
    }

    fn callback(&self) -> &dyn DiffCallback {
        self.callback.as_ref()
    }
}

/// The status classes a diff reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiffStatus {
    Untracked,
    Ignored,
    Removed,
    Modified,
    Error,
}

/// A [DiffCallback] that collects results in memory.
#[derive(Default)]
pub struct DiffCollector {
    entries: Mutex<Vec<(DiffStatus, RepoPathBuf)>>,
}

impl DiffCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The collected entries, sorted by path for stable assertions.
    pub fn entries(&self) -> Vec<(DiffStatus, RepoPathBuf)> {
        let mut entries = self.entries.lock().clone();
        entries.sort_by(|a, b| a.1.as_bytes().cmp(b.1.as_bytes()));
        entries
    }
}

impl DiffCallback for DiffCollector {
    fn untracked_file(&self, path: &RepoPath) {
        self.entries
            .lock()
            .push((DiffStatus::Untracked, path.to_owned()));
    }

    fn ignored_file(&self, path: &RepoPath) {
        self.entries
            .lock()
            .push((DiffStatus::Ignored, path.to_owned()));
    }

    fn removed_file(&self, path: &RepoPath) {
        self.entries
            .lock()
            .push((DiffStatus::Removed, path.to_owned()));
    }

    fn modified_file(&self, path: &RepoPath) {
        self.entries
            .lock()
            .push((DiffStatus::Modified, path.to_owned()));
    }

    fn diff_error(&self, path: &RepoPath, _error: &FsError) {
        self.entries
            .lock()
            .push((DiffStatus::Error, path.to_owned()));
    }
}

enum InodeSource {
    Ready(InodePtr),
    Pending(LoadReceiver),
}

impl InodeSource {
    async fn resolve(self) -> Result<InodePtr, FsError> {
        match self {
            InodeSource::Ready(inode) => Ok(inode),
            InodeSource::Pending(rx) => rx
                .await
                .map_err(|_| FsError::io("inode load abandoned"))?,
        }
    }
}

/// Work that has to wait until the contents lock is released: subtree
/// recursions and anything needing a child inode load.
enum DeferredEntry {
    /// A local-only directory; everything inside it is untracked.
    Untracked {
        path: RepoPathBuf,
        source: InodeSource,
        ignored: bool,
    },
    /// A snapshot-only tree; everything inside it has been removed.
    Removed { path: RepoPathBuf, digest: Digest },
    /// Present on both sides (or needing inode inspection to tell).
    Modified {
        path: RepoPathBuf,
        scm_entry: TreeEntry,
        source: InodeSource,
        ignored: bool,
    },
}

impl TreeInode {
    /// Diffs this directory against `tree`, reporting results through the
    /// context callback. `is_ignored` means some ancestor directory is
    /// already excluded, in which case no ignore stack is consulted (ignored
    /// subtrees stay ignored; explicit include rules cannot resurrect them).
    pub(crate) fn diff<'a>(
        self: &'a Arc<Self>,
        ctx: &'a DiffContext,
        current_path: RepoPathBuf,
        tree: Option<Arc<Tree>>,
        parent_ignore: Option<Arc<IgnoreStack>>,
        is_ignored: bool,
    ) -> BoxFuture<'a, Result<(), FsError>> {
        async move {
            let mount = self.mount()?;

            enum GitignoreSource {
                Absent,
                Loaded(InodePtr),
                Pending(LoadReceiver),
            }

            let (source, plan) = {
                let mut contents = self.contents.write();

                // Nothing to do if we are clean at exactly the reference
                // tree.
                if let (Some(tree_hash), Some(tree)) = (&contents.tree_hash, tree.as_deref()) {
                    if *tree_hash == tree.digest() {
                        debug!(rq.inode = self.ino().0, "diff short-circuit");
                        return Ok(());
                    }
                }

                if is_ignored {
                    // No point loading ignore rules for a subtree that is
                    // excluded wholesale.
                    (GitignoreSource::Absent, None)
                } else {
                    let ignore_name = PathComponent::try_from(IGNORE_FILENAME)
                        .map_err(|e| FsError::bug(format!("bad ignore file name: {}", e)))?;
                    match contents.entries.get_mut(&ignore_name) {
                        // Ignore .gitignore directories.
                        Some(entry) if entry.is_directory() => (GitignoreSource::Absent, None),
                        Some(entry) => match &entry.inode {
                            Some(inode) => (GitignoreSource::Loaded(inode.clone()), None),
                            None => {
                                let (rx, plan) =
                                    self.load_child_locked(&mount, &ignore_name, entry);
                                (GitignoreSource::Pending(rx), plan)
                            }
                        },
                        None => (GitignoreSource::Absent, None),
                    }
                }
            };

            if let Some(plan) = plan {
                self.start_load(&mount, plan);
            }

            let ignore = if is_ignored {
                None
            } else {
                match source {
                    GitignoreSource::Absent => Some(IgnoreStack::empty(parent_ignore)),
                    GitignoreSource::Loaded(inode) => {
                        let contents = self.load_gitignore(&mount, inode).await;
                        Some(IgnoreStack::new(
                            parent_ignore,
                            current_path.clone(),
                            &contents,
                        ))
                    }
                    GitignoreSource::Pending(rx) => match rx.await {
                        Ok(Ok(inode)) => {
                            let contents = self.load_gitignore(&mount, inode).await;
                            Some(IgnoreStack::new(
                                parent_ignore,
                                current_path.clone(),
                                &contents,
                            ))
                        }
                        _ => {
                            warn!(rq.inode = self.ino().0, "failed to load ignore file");
                            Some(IgnoreStack::empty(parent_ignore))
                        }
                    },
                }
            };

            self.compute_diff(ctx, &mount, current_path, tree, ignore, is_ignored)
                .await
        }
        .boxed()
    }

    /// Reads a `.gitignore` inode, resolving symlinks. All failures are
    /// logged and produce an empty rule set; a broken ignore file must not
    /// fail the diff.
    async fn load_gitignore(self: &Arc<Self>, mount: &Arc<Mount>, inode: InodePtr) -> Bytes {
        let mut current = inode;
        for _ in 0..MAX_SYMLINK_HOPS {
            match current {
                InodePtr::Tree(_) => {
                    warn!(rq.inode = self.ino().0, "ignore file is a directory");
                    return Bytes::new();
                }
                InodePtr::File(file) => {
                    if file.is_symlink() {
                        match self.resolve_symlink(mount, &file).await {
                            Ok(next) => {
                                current = next;
                                continue;
                            }
                            Err(error) => {
                                warn!(%error, "error resolving gitignore symlink");
                                return Bytes::new();
                            }
                        }
                    }
                    return match file.read_all().await {
                        Ok(contents) => contents,
                        Err(error) => {
                            warn!(%error, "error reading ignore file");
                            Bytes::new()
                        }
                    };
                }
            }
        }
        warn!(rq.inode = self.ino().0, "too many levels of gitignore symlinks");
        Bytes::new()
    }

    /// Resolves one symlink hop. Absolute targets are interpreted from the
    /// mount root, relative ones from this directory.
    async fn resolve_symlink(
        self: &Arc<Self>,
        mount: &Arc<Mount>,
        file: &Arc<FileInode>,
    ) -> Result<InodePtr, FsError> {
        let target = file.read_all().await?;
        let target = std::str::from_utf8(&target).map_err(|_| FsError::InvalidArgument)?;

        let (base, rel) = match target.strip_prefix('/') {
            Some(rest) => (mount.root()?, rest),
            None => (self.clone(), target),
        };
        let path: RepoPathBuf = rel.parse().map_err(|_| FsError::InvalidArgument)?;
        base.get_child_recursive(&path).await
    }

    async fn compute_diff(
        self: &Arc<Self>,
        ctx: &DiffContext,
        mount: &Arc<Mount>,
        current_path: RepoPathBuf,
        tree: Option<Arc<Tree>>,
        ignore: Option<Arc<IgnoreStack>>,
        is_ignored: bool,
    ) -> Result<(), FsError> {
        debug_assert!(
            is_ignored || ignore.is_some(),
            "the ignore stack is required if this directory is not ignored"
        );

        let mut deferred: Vec<DeferredEntry> = Vec::new();
        let mut plans: Vec<LoadPlan> = Vec::new();

        {
            let mut contents = self.contents.write();
            let scm_entries: Vec<(PathComponent, TreeEntry)> = tree
                .as_deref()
                .map(|tree| {
                    tree.entries()
                        .map(|(name, entry)| (name.clone(), entry.clone()))
                        .collect()
                })
                .unwrap_or_default();

            let mut local: Vec<(&PathComponent, &mut super::DirEntry)> =
                contents.entries.iter_mut().collect();

            let mut scm_idx = 0;
            let mut local_idx = 0;

            // Both sides are sorted by name; walk them together.
            loop {
                enum Step {
                    Untracked,
                    Removed,
                    Both,
                }
                let step = if scm_idx >= scm_entries.len() {
                    if local_idx >= local.len() {
                        break;
                    }
                    Step::Untracked
                } else if local_idx >= local.len() {
                    Step::Removed
                } else if scm_entries[scm_idx].0 < *local[local_idx].0 {
                    Step::Removed
                } else if scm_entries[scm_idx].0 > *local[local_idx].0 {
                    Step::Untracked
                } else {
                    Step::Both
                };

                match step {
                    Step::Untracked => {
                        let (name, entry) = &mut local[local_idx];
                        local_idx += 1;
                        self.process_untracked(
                            ctx,
                            mount,
                            &current_path,
                            name,
                            entry,
                            ignore.as_ref(),
                            is_ignored,
                            &mut deferred,
                            &mut plans,
                        );
                    }
                    Step::Removed => {
                        let (name, scm_entry) = &scm_entries[scm_idx];
                        scm_idx += 1;
                        let entry_path = current_path.join(name);
                        if scm_entry.kind.is_tree() {
                            deferred.push(DeferredEntry::Removed {
                                path: entry_path,
                                digest: scm_entry.digest.clone(),
                            });
                        } else {
                            debug!(diff.path = %entry_path, "removed file");
                            ctx.callback().removed_file(&entry_path);
                        }
                    }
                    Step::Both => {
                        let (name, scm_entry) = &scm_entries[scm_idx];
                        scm_idx += 1;
                        let (_, entry) = &mut local[local_idx];
                        local_idx += 1;
                        self.process_both_present(
                            ctx,
                            mount,
                            &current_path,
                            name,
                            scm_entry,
                            entry,
                            ignore.as_ref(),
                            is_ignored,
                            &mut deferred,
                            &mut plans,
                        );
                    }
                }
            }
        }

        for plan in plans {
            self.start_load(mount, plan);
        }

        // Run the deferred work now that the lock is gone. Failures are
        // reported per path; the overall diff still succeeds so the parent
        // does not double-report.
        let results = join_all(deferred.into_iter().map(|entry| {
            let ignore = ignore.clone();
            async move {
                match entry {
                    DeferredEntry::Untracked {
                        path,
                        source,
                        ignored,
                    } => {
                        let result = match source.resolve().await {
                            Ok(InodePtr::Tree(tree)) => {
                                tree.diff(ctx, path.clone(), None, ignore, ignored).await
                            }
                            Ok(InodePtr::File(_)) => {
                                // The entry changed type while we were
                                // walking; report what is actually there.
                                if !ignored {
                                    ctx.callback().untracked_file(&path);
                                } else if ctx.list_ignored {
                                    ctx.callback().ignored_file(&path);
                                }
                                Ok(())
                            }
                            Err(error) => Err(error),
                        };
                        (path, result)
                    }
                    DeferredEntry::Removed { path, digest } => {
                        let result = diff_removed_tree(ctx, path.clone(), digest).await;
                        (path, result)
                    }
                    DeferredEntry::Modified {
                        path,
                        scm_entry,
                        source,
                        ignored,
                    } => {
                        let result = match source.resolve().await {
                            Ok(inode) => {
                                run_modified(ctx, path.clone(), scm_entry, inode, ignore, ignored)
                                    .await
                            }
                            Err(error) => Err(error),
                        };
                        (path, result)
                    }
                }
            }
        }))
        .await;

        for (path, result) in results {
            if let Err(error) = result {
                warn!(diff.path = %path, %error, "error processing diff entry");
                ctx.callback().diff_error(&path, &error);
            }
        }
        Ok(())
    }

    /// An entry present locally but absent from the reference tree.
    #[allow(clippy::too_many_arguments)]
    fn process_untracked(
        self: &Arc<Self>,
        ctx: &DiffContext,
        mount: &Arc<Mount>,
        current_path: &RepoPathBuf,
        name: &PathComponent,
        entry: &mut super::DirEntry,
        ignore: Option<&Arc<IgnoreStack>>,
        is_ignored: bool,
        deferred: &mut Vec<DeferredEntry>,
        plans: &mut Vec<LoadPlan>,
    ) {
        let entry_path = current_path.join(name);
        let is_dir = entry.is_directory();

        let mut entry_ignored = is_ignored;
        if !is_ignored {
            if let Some(ignore) = ignore {
                match ignore.match_path(&entry_path, is_dir) {
                    // Reserved names are skipped entirely.
                    MatchResult::Hidden => return,
                    MatchResult::Exclude => entry_ignored = true,
                    MatchResult::Include | MatchResult::Unspecified => entry_ignored = false,
                }
            }
        }

        if is_dir {
            if !entry_ignored || ctx.list_ignored {
                let source = match &entry.inode {
                    Some(inode) => InodeSource::Ready(inode.clone()),
                    None => {
                        let (rx, plan) = self.load_child_locked(mount, name, entry);
                        if let Some(plan) = plan {
                            plans.push(plan);
                        }
                        InodeSource::Pending(rx)
                    }
                };
                deferred.push(DeferredEntry::Untracked {
                    path: entry_path,
                    source,
                    ignored: entry_ignored,
                });
            }
        } else if !entry_ignored {
            debug!(diff.path = %entry_path, "untracked file");
            ctx.callback().untracked_file(&entry_path);
        } else if ctx.list_ignored {
            ctx.callback().ignored_file(&entry_path);
        }
    }

    /// An entry present both locally and in the reference tree.
    #[allow(clippy::too_many_arguments)]
    fn process_both_present(
        self: &Arc<Self>,
        ctx: &DiffContext,
        mount: &Arc<Mount>,
        current_path: &RepoPathBuf,
        name: &PathComponent,
        scm_entry: &TreeEntry,
        entry: &mut super::DirEntry,
        ignore: Option<&Arc<IgnoreStack>>,
        is_ignored: bool,
        deferred: &mut Vec<DeferredEntry>,
        plans: &mut Vec<LoadPlan>,
    ) {
        let entry_path = current_path.join(name);

        // The ignored status only matters for directories; a file that is
        // tracked in the reference tree is always included.
        let mut entry_ignored = is_ignored;
        if !is_ignored && (entry.is_directory() || scm_entry.kind.is_tree()) {
            if let Some(ignore) = ignore {
                entry_ignored = !matches!(
                    ignore.match_path(&entry_path, true),
                    MatchResult::Include | MatchResult::Unspecified
                );
            }
        }

        if let Some(inode) = &entry.inode {
            deferred.push(DeferredEntry::Modified {
                path: entry_path,
                scm_entry: scm_entry.clone(),
                source: InodeSource::Ready(inode.clone()),
                ignored: entry_ignored,
            });
        } else if entry.is_materialized() {
            // Materialized but not loaded: the inode has to be inspected to
            // decide whether anything actually differs.
            let (rx, plan) = self.load_child_locked(mount, name, entry);
            if let Some(plan) = plan {
                plans.push(plan);
            }
            deferred.push(DeferredEntry::Modified {
                path: entry_path,
                scm_entry: scm_entry.clone(),
                source: InodeSource::Pending(rx),
                ignored: entry_ignored,
            });
        } else if entry.mode == super::mode_from_entry_kind(scm_entry.kind)
            && entry.hash.as_ref() == Some(&scm_entry.digest)
        {
            // Unchanged; skip.
        } else if entry.is_directory() {
            // A modified directory has to be loaded and recursed into.
            let (rx, plan) = self.load_child_locked(mount, name, entry);
            if let Some(plan) = plan {
                plans.push(plan);
            }
            deferred.push(DeferredEntry::Modified {
                path: entry_path,
                scm_entry: scm_entry.clone(),
                source: InodeSource::Pending(rx),
                ignored: entry_ignored,
            });
        } else if scm_entry.kind.is_tree() {
            // A tree became a file. Report the new file, and walk the old
            // tree as removed.
            if entry_ignored {
                if ctx.list_ignored {
                    ctx.callback().ignored_file(&entry_path);
                }
            } else {
                ctx.callback().untracked_file(&entry_path);
            }
            deferred.push(DeferredEntry::Removed {
                path: entry_path,
                digest: scm_entry.digest.clone(),
            });
        } else {
            // Both sides are files with differing mode or digest. Content
            // addresses are trustworthy, so this is definitively a
            // modification.
            debug!(diff.path = %entry_path, "modified file");
            ctx.callback().modified_file(&entry_path);
        }
    }
}

/// Applies to a loaded inode that exists on both sides, or whose sides have
/// changed kind.
async fn run_modified(
    ctx: &DiffContext,
    path: RepoPathBuf,
    scm_entry: TreeEntry,
    inode: InodePtr,
    ignore: Option<Arc<IgnoreStack>>,
    ignored: bool,
) -> Result<(), FsError> {
    match (&inode, scm_entry.kind.is_tree()) {
        (InodePtr::Tree(tree), true) => {
            let scm_tree = ctx
                .store
                .get_tree(&scm_entry.digest)
                .await?
                .ok_or_else(|| FsError::io(format!("missing tree {}", scm_entry.digest)))?;
            tree.diff(ctx, path, Some(scm_tree), ignore, ignored).await
        }
        (InodePtr::Tree(tree), false) => {
            // A file became a directory: the old file is gone, the
            // directory contents are untracked.
            ctx.callback().removed_file(&path);
            tree.diff(ctx, path, None, ignore, ignored).await
        }
        (InodePtr::File(_), true) => {
            // A directory became a file: report the file, then walk the old
            // tree as removed.
            if ignored {
                if ctx.list_ignored {
                    ctx.callback().ignored_file(&path);
                }
            } else {
                ctx.callback().untracked_file(&path);
            }
            diff_removed_tree(ctx, path, scm_entry.digest.clone()).await
        }
        (InodePtr::File(file), false) => {
            if !file.is_same_as(&scm_entry).await? {
                ctx.callback().modified_file(&path);
            }
            Ok(())
        }
    }
}

/// Reports every file under a snapshot tree as removed.
fn diff_removed_tree<'a>(
    ctx: &'a DiffContext,
    path: RepoPathBuf,
    digest: Digest,
) -> BoxFuture<'a, Result<(), FsError>> {
    async move {
        let tree = ctx
            .store
            .get_tree(&digest)
            .await?
            .ok_or_else(|| FsError::io(format!("missing tree {}", digest)))?;

        for (name, entry) in tree.entries() {
            let entry_path = path.join(name);
            if entry.kind.is_tree() {
                diff_removed_tree(ctx, entry_path, entry.digest.clone()).await?;
            } else {
                ctx.callback().removed_file(&entry_path);
            }
        }
        Ok(())
    }
    .boxed()
}
