//! The request surface the kernel protocol handler drives. Each operation
//! resolves inode numbers through the [InodeMap](crate::inodes::InodeMap)
//! and replies in terms of plain data; the wire encoding lives with the
//! protocol handler, not here.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use driftfs_castore::PathComponent;
use tracing::{debug, instrument};

use crate::inodes::{InodeAttr, InodeNumber, InodePtr, SetAttr};
use crate::{FsError, Mount};

/// Where a request came from. Mutations triggered by the kernel skip cache
/// invalidation, since the kernel updates its own cache; everything else
/// must invalidate explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOrigin {
    Kernel,
    Internal,
}

/// Best-effort cancellation token carried by each request. Setting it does
/// not abort in-flight I/O; subsequent checkpoints report
/// [FsError::Cancelled] instead.
#[derive(Clone, Default)]
pub struct Interrupter {
    interrupted: Arc<AtomicBool>,
}

impl Interrupter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }
}

/// Per-request state owned for the duration of one dispatched operation.
pub struct RequestData {
    pub origin: RequestOrigin,
    pub interrupter: Interrupter,
}

impl RequestData {
    pub fn kernel() -> Self {
        Self {
            origin: RequestOrigin::Kernel,
            interrupter: Interrupter::new(),
        }
    }

    pub fn internal() -> Self {
        Self {
            origin: RequestOrigin::Internal,
            interrupter: Interrupter::new(),
        }
    }

    fn check_interrupted(&self) -> Result<(), FsError> {
        if self.interrupter.is_interrupted() {
            return Err(FsError::Cancelled);
        }
        Ok(())
    }
}

/// A lookup-style reply: the child inode number, its attributes, and how
/// long the kernel may cache them.
#[derive(Debug, Clone)]
pub struct EntryOut {
    pub ino: u64,
    pub attr: Option<InodeAttr>,
    pub attr_valid: Duration,
    pub entry_valid: Duration,
}

#[derive(Debug, Clone)]
pub struct DirListEntry {
    pub name: PathComponent,
    pub ino: InodeNumber,
    pub mode: u32,
}

const XATTR_NAME_TREE_DIGEST: &[u8] = b"user.driftfs.tree.digest";
const XATTR_NAME_BLOB_DIGEST: &[u8] = b"user.driftfs.blob.digest";

/// How long the kernel may cache positive replies.
const ENTRY_VALIDITY: Duration = Duration::from_secs(1);

pub struct Dispatcher {
    mount: Arc<Mount>,
}

impl Dispatcher {
    pub fn new(mount: Arc<Mount>) -> Self {
        Self { mount }
    }

    pub fn mount(&self) -> &Arc<Mount> {
        &self.mount
    }

    /// Builds a positive reply, recording the kernel reference the reply
    /// hands out.
    fn entry_out(&self, inode: &InodePtr, attr: InodeAttr) -> EntryOut {
        self.mount.inode_map().inc_fuse_refcount(inode);
        EntryOut {
            ino: inode.ino().0,
            attr: Some(attr),
            attr_valid: ENTRY_VALIDITY,
            entry_valid: ENTRY_VALIDITY,
        }
    }

    #[instrument(skip(self, req), fields(rq.inode = ino.0))]
    pub async fn getattr(&self, req: &RequestData, ino: InodeNumber) -> Result<InodeAttr, FsError> {
        req.check_interrupted()?;
        let inode = self.mount.inode_map().lookup_inode(ino).await?;
        inode.getattr().await
    }

    #[instrument(skip(self, req, attr), fields(rq.inode = ino.0))]
    pub async fn setattr(
        &self,
        req: &RequestData,
        ino: InodeNumber,
        attr: SetAttr,
    ) -> Result<InodeAttr, FsError> {
        req.check_interrupted()?;
        match self.mount.inode_map().lookup_inode(ino).await? {
            InodePtr::Tree(tree) => tree.setattr(attr).await,
            InodePtr::File(file) => file.setattr(attr).await,
        }
    }

    /// Resolves `name` under `parent`.
    ///
    /// A missing entry is *not* an error reply: it is translated into a
    /// positive reply with inode number 0 and maximal validity, so the
    /// kernel caches the negative lookup.
    #[instrument(skip(self, req), fields(rq.inode = parent.0, rq.name = %name))]
    pub async fn lookup(
        &self,
        req: &RequestData,
        parent: InodeNumber,
        name: &PathComponent,
    ) -> Result<EntryOut, FsError> {
        req.check_interrupted()?;
        let parent = self.mount.inode_map().lookup_tree_inode(parent).await?;
        match parent.get_or_load_child(name).await {
            Ok(inode) => {
                let attr = inode.getattr().await?;
                Ok(self.entry_out(&inode, attr))
            }
            Err(FsError::NotFound) => {
                debug!("negative lookup");
                Ok(EntryOut {
                    ino: 0,
                    attr: None,
                    attr_valid: Duration::MAX,
                    entry_valid: Duration::MAX,
                })
            }
            Err(error) => Err(error),
        }
    }

    #[instrument(skip(self, req), fields(rq.inode = ino.0))]
    pub async fn opendir(&self, req: &RequestData, ino: InodeNumber) -> Result<(), FsError> {
        req.check_interrupted()?;
        self.mount.inode_map().lookup_tree_inode(ino).await?;
        Ok(())
    }

    #[instrument(skip(self, req), fields(rq.inode = ino.0))]
    pub async fn readdir(
        &self,
        req: &RequestData,
        ino: InodeNumber,
    ) -> Result<Vec<DirListEntry>, FsError> {
        req.check_interrupted()?;
        let tree = self.mount.inode_map().lookup_tree_inode(ino).await?;
        Ok(tree
            .list_entries()?
            .into_iter()
            .map(|(name, ino, mode)| DirListEntry { name, ino, mode })
            .collect())
    }

    /// Opens a regular file. File handles are managed by the protocol
    /// layer; the dispatcher only validates the inode and reports its
    /// attributes.
    #[instrument(skip(self, req), fields(rq.inode = ino.0))]
    pub async fn open(&self, req: &RequestData, ino: InodeNumber) -> Result<InodeAttr, FsError> {
        req.check_interrupted()?;
        let file = self.mount.inode_map().lookup_file_inode(ino).await?;
        file.getattr().await
    }

    #[instrument(skip(self, req), fields(rq.inode = parent.0, rq.name = %name))]
    pub async fn create(
        &self,
        req: &RequestData,
        parent: InodeNumber,
        name: &PathComponent,
        mode: u32,
    ) -> Result<EntryOut, FsError> {
        req.check_interrupted()?;
        let parent = self.mount.inode_map().lookup_tree_inode(parent).await?;
        let file = parent.create(name, mode, req.origin).await?;
        let attr = file.getattr().await?;
        Ok(self.entry_out(&InodePtr::File(file), attr))
    }

    #[instrument(skip(self, req), fields(rq.inode = parent.0, rq.name = %name))]
    pub async fn mknod(
        &self,
        req: &RequestData,
        parent: InodeNumber,
        name: &PathComponent,
        mode: u32,
        dev: u64,
    ) -> Result<EntryOut, FsError> {
        req.check_interrupted()?;
        let parent = self.mount.inode_map().lookup_tree_inode(parent).await?;
        let file = parent.mknod(name, mode, dev, req.origin).await?;
        let attr = file.getattr().await?;
        Ok(self.entry_out(&InodePtr::File(file), attr))
    }

    #[instrument(skip(self, req), fields(rq.inode = parent.0, rq.name = %name))]
    pub async fn mkdir(
        &self,
        req: &RequestData,
        parent: InodeNumber,
        name: &PathComponent,
        mode: u32,
    ) -> Result<EntryOut, FsError> {
        req.check_interrupted()?;
        let parent = self.mount.inode_map().lookup_tree_inode(parent).await?;
        let child = parent.mkdir(name, mode, req.origin).await?;
        let attr = child.getattr();
        Ok(self.entry_out(&InodePtr::Tree(child), attr))
    }

    #[instrument(skip(self, req), fields(rq.inode = parent.0, rq.name = %name))]
    pub async fn unlink(
        &self,
        req: &RequestData,
        parent: InodeNumber,
        name: &PathComponent,
    ) -> Result<(), FsError> {
        req.check_interrupted()?;
        let parent = self.mount.inode_map().lookup_tree_inode(parent).await?;
        parent.unlink(name, req.origin).await
    }

    #[instrument(skip(self, req), fields(rq.inode = parent.0, rq.name = %name))]
    pub async fn rmdir(
        &self,
        req: &RequestData,
        parent: InodeNumber,
        name: &PathComponent,
    ) -> Result<(), FsError> {
        req.check_interrupted()?;
        let parent = self.mount.inode_map().lookup_tree_inode(parent).await?;
        parent.rmdir(name, req.origin).await
    }

    #[instrument(skip(self, req, target), fields(rq.inode = parent.0, rq.name = %name))]
    pub async fn symlink(
        &self,
        req: &RequestData,
        parent: InodeNumber,
        name: &PathComponent,
        target: &[u8],
    ) -> Result<EntryOut, FsError> {
        req.check_interrupted()?;
        let parent = self.mount.inode_map().lookup_tree_inode(parent).await?;
        let file = parent.symlink(name, target, req.origin).await?;
        let attr = file.getattr().await?;
        Ok(self.entry_out(&InodePtr::File(file), attr))
    }

    #[instrument(skip(self, req), fields(rq.inode = parent.0, rq.name = %name, rq.dest = %new_name))]
    pub async fn rename(
        &self,
        req: &RequestData,
        parent: InodeNumber,
        name: &PathComponent,
        new_parent: InodeNumber,
        new_name: &PathComponent,
    ) -> Result<(), FsError> {
        req.check_interrupted()?;
        let parent = self.mount.inode_map().lookup_tree_inode(parent).await?;
        let new_parent = self.mount.inode_map().lookup_tree_inode(new_parent).await?;
        parent.rename(name, &new_parent, new_name, req.origin).await
    }

    /// Hard links are not supported: they cannot be tracked in source
    /// control and are not portable.
    #[instrument(skip(self, _req), fields(rq.inode = _ino.0))]
    pub async fn link(
        &self,
        _req: &RequestData,
        _ino: InodeNumber,
        _new_parent: InodeNumber,
        _new_name: &PathComponent,
    ) -> Result<EntryOut, FsError> {
        Err(FsError::PermissionDenied)
    }

    #[instrument(skip(self, req), fields(rq.inode = ino.0))]
    pub async fn readlink(&self, req: &RequestData, ino: InodeNumber) -> Result<Bytes, FsError> {
        req.check_interrupted()?;
        let file = self.mount.inode_map().lookup_file_inode(ino).await?;
        file.readlink().await
    }

    /// Releases `nlookup` kernel references on `ino`.
    #[instrument(skip(self), fields(rq.inode = ino.0))]
    pub fn forget(&self, ino: InodeNumber, nlookup: u64) {
        self.mount.forget(ino, nlookup);
    }

    /// Exposes the content address of clean inodes. Materialized inodes have
    /// no source-control identity, so they report no attribute.
    #[instrument(skip(self, req), fields(rq.inode = ino.0))]
    pub async fn getxattr(
        &self,
        req: &RequestData,
        ino: InodeNumber,
        name: &[u8],
    ) -> Result<Bytes, FsError> {
        req.check_interrupted()?;
        let digest = match self.mount.inode_map().lookup_inode(ino).await? {
            InodePtr::Tree(tree) if name == XATTR_NAME_TREE_DIGEST => tree.tree_hash(),
            InodePtr::File(file) if name == XATTR_NAME_BLOB_DIGEST => file.hash(),
            _ => None,
        };
        match digest {
            Some(digest) => Ok(digest.to_string().into_bytes().into()),
            None => Err(FsError::NoAttribute),
        }
    }

    #[instrument(skip(self, req), fields(rq.inode = ino.0))]
    pub async fn listxattr(
        &self,
        req: &RequestData,
        ino: InodeNumber,
    ) -> Result<Vec<Bytes>, FsError> {
        req.check_interrupted()?;
        let names = match self.mount.inode_map().lookup_inode(ino).await? {
            InodePtr::Tree(tree) if tree.tree_hash().is_some() => {
                vec![Bytes::from_static(XATTR_NAME_TREE_DIGEST)]
            }
            InodePtr::File(file) if file.hash().is_some() => {
                vec![Bytes::from_static(XATTR_NAME_BLOB_DIGEST)]
            }
            _ => Vec::new(),
        };
        Ok(names)
    }
}
