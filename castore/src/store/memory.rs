use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{instrument, warn};

use super::ObjectStore;
use crate::{Digest, Error, Tree};

#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    trees: Arc<RwLock<HashMap<Digest, Arc<Tree>>>>,
    blobs: Arc<RwLock<HashMap<Digest, Bytes>>>,
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    #[instrument(skip(self, digest), fields(tree.digest = %digest))]
    async fn get_tree(&self, digest: &Digest) -> Result<Option<Arc<Tree>>, Error> {
        let trees = self.trees.read();

        match trees.get(digest) {
            None => Ok(None),

            Some(tree) => {
                // Validate the retrieved Tree indeed has the digest we expect
                // it to have, to detect corruptions.
                let actual_digest = tree.digest();
                if actual_digest != *digest {
                    warn!(tree.actual_digest = %actual_digest, "tree corrupted");
                    return Err(Error::StorageError(format!(
                        "requested tree with digest {}, but got {}",
                        digest, actual_digest
                    )));
                }

                Ok(Some(tree.clone()))
            }
        }
    }

    #[instrument(skip(self, digest), fields(blob.digest = %digest))]
    async fn get_blob(&self, digest: &Digest) -> Result<Option<Bytes>, Error> {
        Ok(self.blobs.read().get(digest).cloned())
    }

    #[instrument(skip_all, fields(tree.digest = %tree.digest()))]
    async fn put_tree(&self, tree: Tree) -> Result<Digest, Error> {
        let digest = tree.digest();
        self.trees.write().insert(digest.clone(), Arc::new(tree));
        Ok(digest)
    }

    #[instrument(skip_all)]
    async fn put_blob(&self, data: Bytes) -> Result<Digest, Error> {
        let digest = Digest::for_blob(&data);
        self.blobs.write().insert(digest.clone(), data);
        Ok(digest)
    }
}
