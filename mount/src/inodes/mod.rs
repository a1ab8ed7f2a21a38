//! The in-memory directory graph: inode numbers, directory contents, and the
//! tagged inode sum served to the dispatcher.
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use driftfs_castore::{Digest, EntryKind, PathComponent, RepoPathBuf, Tree, TreeEntry};

pub mod checkout;
pub mod diff;
mod file_inode;
mod inode_map;
mod tree_inode;

pub use file_inode::FileInode;
pub use inode_map::InodeMap;
pub use tree_inode::{Recurse, SetAttr, TreeInode};

use crate::overlay::{OverlayDir, OverlayDirEntry};

/// A 64-bit inode identifier, unique within a mount. Once issued to an entry
/// it never changes for the lifetime of the mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InodeNumber(pub u64);

impl std::fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The distinguished inode number of the mount root.
pub const ROOT_INO: InodeNumber = InodeNumber(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeTimestamps {
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl Default for InodeTimestamps {
    fn default() -> Self {
        Self::at(SystemTime::UNIX_EPOCH)
    }
}

impl InodeTimestamps {
    pub fn at(time: SystemTime) -> Self {
        Self {
            atime: time,
            mtime: time,
            ctime: time,
        }
    }

    pub fn now() -> Self {
        Self::at(SystemTime::now())
    }
}

/// A synthesized stat result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeAttr {
    pub ino: InodeNumber,
    pub mode: u32,
    pub nlink: u64,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

/// Maps a snapshot entry kind to the POSIX mode stored in directory entries.
pub fn mode_from_entry_kind(kind: EntryKind) -> u32 {
    match kind {
        EntryKind::Tree => libc::S_IFDIR | 0o755,
        EntryKind::File => libc::S_IFREG | 0o644,
        EntryKind::Executable => libc::S_IFREG | 0o755,
        EntryKind::Symlink => libc::S_IFLNK | 0o777,
    }
}

/// One child of a [TreeInode].
///
/// The three content states:
/// - unloaded, unmaterialized: `hash` is set, `inode` is not; there may or
///   may not be an inode number yet.
/// - unloaded, materialized: `ino` is set, `hash` is not; content lives in
///   the overlay.
/// - loaded: `inode` is set. `hash` tracks whether a source-control identity
///   is still known.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub mode: u32,
    pub hash: Option<Digest>,
    pub ino: Option<InodeNumber>,
    pub inode: Option<InodePtr>,
}

impl DirEntry {
    pub fn from_scm(mode: u32, hash: Digest) -> Self {
        Self {
            mode,
            hash: Some(hash),
            ino: None,
            inode: None,
        }
    }

    pub fn materialized(mode: u32, ino: InodeNumber) -> Self {
        Self {
            mode,
            hash: None,
            ino: Some(ino),
            inode: None,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn is_materialized(&self) -> bool {
        self.hash.is_none()
    }
}

/// The mutable contents of one directory inode.
///
/// `entries` is ordered by the byte-lexicographic order of the component
/// names; checkout and diff walk it and a snapshot [Tree]'s entries in the
/// same order to perform a linear merge.
#[derive(Debug, Clone, Default)]
pub struct DirContents {
    pub entries: std::collections::BTreeMap<PathComponent, DirEntry>,
    /// If set, this directory is clean and identical to that snapshot tree.
    /// If `None`, the directory is materialized and owns an overlay record.
    pub tree_hash: Option<Digest>,
    pub timestamps: InodeTimestamps,
}

impl DirContents {
    pub fn is_materialized(&self) -> bool {
        self.tree_hash.is_none()
    }

    /// Builds directory contents mirroring a snapshot tree, stamped with the
    /// mount's last checkout time.
    pub fn from_tree(tree: &Tree, last_checkout: SystemTime) -> Self {
        let mut entries = std::collections::BTreeMap::new();
        for (name, entry) in tree.entries() {
            entries.insert(
                name.clone(),
                DirEntry::from_scm(mode_from_entry_kind(entry.kind), entry.digest.clone()),
            );
        }
        Self {
            entries,
            tree_hash: Some(tree.digest()),
            timestamps: InodeTimestamps::at(last_checkout),
        }
    }

    pub fn from_overlay(dir: OverlayDir) -> Self {
        let mut entries = std::collections::BTreeMap::new();
        for (name, entry) in dir.entries {
            entries.insert(
                name,
                DirEntry {
                    mode: entry.mode,
                    hash: entry.hash,
                    ino: entry.ino,
                    inode: None,
                },
            );
        }
        Self {
            entries,
            tree_hash: dir.tree_hash,
            timestamps: dir.timestamps,
        }
    }

    pub fn to_overlay(&self) -> OverlayDir {
        let mut entries = std::collections::BTreeMap::new();
        for (name, entry) in &self.entries {
            entries.insert(
                name.clone(),
                OverlayDirEntry {
                    mode: entry.mode,
                    hash: entry.hash.clone(),
                    ino: entry.ino,
                },
            );
        }
        OverlayDir {
            entries,
            tree_hash: self.tree_hash.clone(),
            timestamps: self.timestamps,
        }
    }
}

/// Where an inode hangs in the directory graph.
///
/// Children hold their parent weakly; the [InodeMap] owns the strong
/// reference for every loaded inode, so the upgrade cannot fail while the
/// inode is reachable.
#[derive(Clone, Debug, Default)]
pub(crate) struct InodeLocation {
    pub parent: Option<(Weak<TreeInode>, PathComponent)>,
    pub unlinked: bool,
}

impl InodeLocation {
    pub fn root() -> Self {
        Self {
            parent: None,
            unlinked: false,
        }
    }

    pub fn child(parent: &Arc<TreeInode>, name: PathComponent) -> Self {
        Self {
            parent: Some((Arc::downgrade(parent), name)),
            unlinked: false,
        }
    }
}

/// "Any inode": the tagged sum of directory and file inodes. Symlinks and
/// unix-domain sockets are file inodes distinguished by their mode.
///
/// All construction funnels through the loader and the mutation
/// constructors, so the tag always matches the underlying contents.
#[derive(Clone)]
pub enum InodePtr {
    Tree(Arc<TreeInode>),
    File(Arc<FileInode>),
}

impl InodePtr {
    pub fn ino(&self) -> InodeNumber {
        match self {
            InodePtr::Tree(t) => t.ino(),
            InodePtr::File(f) => f.ino(),
        }
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, InodePtr::Tree(_))
    }

    pub fn as_tree(&self) -> Option<&Arc<TreeInode>> {
        match self {
            InodePtr::Tree(t) => Some(t),
            InodePtr::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&Arc<FileInode>> {
        match self {
            InodePtr::Tree(_) => None,
            InodePtr::File(f) => Some(f),
        }
    }

    pub(crate) fn location(&self) -> InodeLocation {
        match self {
            InodePtr::Tree(t) => t.location(),
            InodePtr::File(f) => f.location(),
        }
    }

    /// Marks this inode as no longer reachable by name. Destruction is
    /// deferred until all outstanding references drain.
    pub(crate) fn mark_unlinked(&self) {
        match self {
            InodePtr::Tree(t) => t.mark_unlinked(),
            InodePtr::File(f) => f.mark_unlinked(),
        }
    }

    pub(crate) fn update_location(&self, parent: &Arc<TreeInode>, name: PathComponent) {
        match self {
            InodePtr::Tree(t) => t.update_location(parent, name),
            InodePtr::File(f) => f.update_location(parent, name),
        }
    }

    pub fn is_unlinked(&self) -> bool {
        self.location().unlinked
    }

    /// The path of this inode from the mount root, or `None` if it (or any
    /// ancestor) has been unlinked.
    pub fn path(&self) -> Option<RepoPathBuf> {
        match self {
            InodePtr::Tree(t) => t.path(),
            InodePtr::File(f) => f.path(),
        }
    }

    pub(crate) fn add_fuse_refcount(&self, delta: u64) {
        match self {
            InodePtr::Tree(t) => t.add_fuse_refcount(delta),
            InodePtr::File(f) => f.add_fuse_refcount(delta),
        }
    }

    pub(crate) fn sub_fuse_refcount(&self, delta: u64) -> u64 {
        match self {
            InodePtr::Tree(t) => t.sub_fuse_refcount(delta),
            InodePtr::File(f) => f.sub_fuse_refcount(delta),
        }
    }

    pub(crate) fn fuse_refcount(&self) -> u64 {
        match self {
            InodePtr::Tree(t) => t.fuse_refcount(),
            InodePtr::File(f) => f.fuse_refcount(),
        }
    }

    /// Whether the inode's content no longer corresponds to a known snapshot
    /// object, meaning the overlay holds its state.
    pub fn is_materialized(&self) -> bool {
        match self {
            InodePtr::Tree(t) => t.is_materialized(),
            InodePtr::File(f) => f.is_materialized(),
        }
    }

    pub async fn getattr(&self) -> Result<InodeAttr, crate::FsError> {
        match self {
            InodePtr::Tree(t) => Ok(t.getattr()),
            InodePtr::File(f) => f.getattr().await,
        }
    }
}

impl std::fmt::Debug for InodePtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InodePtr::Tree(t) => write!(f, "TreeInode({})", t.ino()),
            InodePtr::File(i) => write!(f, "FileInode({})", i.ino()),
        }
    }
}

/// Builds the mode for a new snapshot-backed child entry, carrying type bits
/// from the tree entry kind.
pub(crate) fn entry_from_scm(entry: &TreeEntry) -> DirEntry {
    DirEntry::from_scm(mode_from_entry_kind(entry.kind), entry.digest.clone())
}

/// Walks parent backpointers up to the root, reconstructing the path.
/// Returns `None` if the starting inode or any ancestor has been unlinked.
pub(crate) fn compute_path(start: InodeLocation) -> Option<RepoPathBuf> {
    let mut names: Vec<PathComponent> = Vec::new();
    let mut loc = start;
    loop {
        if loc.unlinked {
            return None;
        }
        match loc.parent {
            None => break,
            Some((parent, name)) => {
                names.push(name);
                // The InodeMap holds every loaded inode alive; an upgrade can
                // only fail during mount teardown.
                let parent = parent.upgrade()?;
                loc = parent.location();
            }
        }
    }
    let mut path = RepoPathBuf::new();
    for name in names.iter().rev() {
        path.push(name);
    }
    Some(path)
}
