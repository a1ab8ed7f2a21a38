//! Scenario tests exercising the whole engine against the in-memory object
//! store and overlay.
mod checkout_test;
mod diff_test;
mod lookup_test;

use std::sync::Arc;

use bytes::Bytes;
use driftfs_castore::store::{MemoryObjectStore, ObjectStore};
use driftfs_castore::{Digest, EntryKind, PathComponent, Tree, TreeEntry};

use crate::overlay::MemoryOverlay;
use crate::Mount;

pub(crate) fn pc(name: &str) -> PathComponent {
    name.try_into().expect("valid path component")
}

pub(crate) struct TestRepo {
    pub store: Arc<MemoryObjectStore>,
    pub overlay: Arc<MemoryOverlay>,
}

impl TestRepo {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryObjectStore::default()),
            overlay: Arc::new(MemoryOverlay::new()),
        }
    }

    pub async fn put_blob(&self, data: &'static [u8]) -> Digest {
        self.store
            .put_blob(Bytes::from_static(data))
            .await
            .expect("put_blob")
    }

    pub async fn put_tree(&self, entries: &[(&str, EntryKind, Digest, u64)]) -> Digest {
        let mut tree = Tree::new();
        for (name, kind, digest, size) in entries {
            tree.add(
                pc(name),
                TreeEntry {
                    kind: *kind,
                    digest: digest.clone(),
                    size: *size,
                },
            )
            .expect("unique name");
        }
        self.store.put_tree(tree).await.expect("put_tree")
    }

    /// The standard starting tree:
    /// `A = { f1: blob1, f2: blob2, d1: { g: blob3 } }`.
    pub async fn tree_a(&self) -> Digest {
        let blob1 = self.put_blob(b"f1 contents\n").await;
        let blob2 = self.put_blob(b"f2 contents\n").await;
        let blob3 = self.put_blob(b"g contents\n").await;
        let d1 = self
            .put_tree(&[("g", EntryKind::File, blob3, 11)])
            .await;
        self.put_tree(&[
            ("d1", EntryKind::Tree, d1, 1),
            ("f1", EntryKind::File, blob1, 12),
            ("f2", EntryKind::File, blob2, 12),
        ])
        .await
    }

    pub async fn mount(&self, snapshot: Option<Digest>) -> Arc<Mount> {
        Mount::new(self.store.clone(), self.overlay.clone(), snapshot)
            .await
            .expect("mount")
    }
}

/// A mount checked out cleanly at [TestRepo::tree_a].
pub(crate) async fn mount_at_tree_a() -> (TestRepo, Arc<Mount>, Digest) {
    let repo = TestRepo::new();
    let tree_a = repo.tree_a().await;
    let mount = repo.mount(Some(tree_a.clone())).await;
    (repo, mount, tree_a)
}
