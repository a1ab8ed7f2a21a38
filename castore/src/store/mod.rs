use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{Digest, Error, Tree};

mod from_addr;
mod memory;

pub use self::from_addr::from_addr;
pub use self::memory::MemoryObjectStore;

/// Content-addressed, read-mostly retrieval of immutable [Tree] and blob
/// objects by digest.
///
/// `get_*` return `Ok(None)` when the object is not present; storage-level
/// failures surface as [Error]. The returned objects are immutable and may
/// be cached freely by callers.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Looks up a single [Tree] by its digest.
    /// The returned tree *must* hash to the requested digest.
    async fn get_tree(&self, digest: &Digest) -> Result<Option<Arc<Tree>>, Error>;

    /// Looks up blob contents by their digest.
    async fn get_blob(&self, digest: &Digest) -> Result<Option<Bytes>, Error>;

    /// Stores a [Tree], returning its digest. An error *must* be returned if
    /// the tree is not valid.
    async fn put_tree(&self, tree: Tree) -> Result<Digest, Error>;

    /// Stores blob contents, returning their digest.
    async fn put_blob(&self, data: Bytes) -> Result<Digest, Error>;
}

#[async_trait]
impl<A> ObjectStore for A
where
    A: AsRef<dyn ObjectStore> + Send + Sync,
{
    async fn get_tree(&self, digest: &Digest) -> Result<Option<Arc<Tree>>, Error> {
        self.as_ref().get_tree(digest).await
    }

    async fn get_blob(&self, digest: &Digest) -> Result<Option<Bytes>, Error> {
        self.as_ref().get_blob(digest).await
    }

    async fn put_tree(&self, tree: Tree) -> Result<Digest, Error> {
        self.as_ref().put_tree(tree).await
    }

    async fn put_blob(&self, data: Bytes) -> Result<Digest, Error> {
        self.as_ref().put_blob(data).await
    }
}
