use std::time::Duration;

use super::{mount_at_tree_a, pc};
use crate::inodes::{InodePtr, ROOT_INO};
use crate::{Dispatcher, FsError, Mount, RequestData};

#[tokio::test]
async fn lookup_returns_stable_inode_numbers() {
    let (_repo, mount, _tree) = mount_at_tree_a().await;
    let root = mount.root().unwrap();

    let first = root.get_or_load_child(&pc("f1")).await.unwrap();
    let second = root.get_or_load_child(&pc("f1")).await.unwrap();
    assert_eq!(first.ino(), second.ino());

    // The inode map resolves the number back to the same inode.
    let by_number = mount.inode_map().lookup_inode(first.ino()).await.unwrap();
    assert_eq!(first.ino(), by_number.ino());
}

#[tokio::test]
async fn lookup_missing_entry_is_not_found() {
    let (_repo, mount, _tree) = mount_at_tree_a().await;
    let root = mount.root().unwrap();

    assert!(matches!(
        root.get_or_load_child(&pc("nope")).await,
        Err(FsError::NotFound)
    ));
}

#[tokio::test]
async fn concurrent_lookups_share_one_load() {
    let (_repo, mount, _tree) = mount_at_tree_a().await;
    let root = mount.root().unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let root = root.clone();
        handles.push(tokio::spawn(async move {
            root.get_or_load_child(&pc("d1")).await.map(|i| i.ino())
        }));
    }

    let mut inos = Vec::new();
    for handle in handles {
        inos.push(handle.await.unwrap().unwrap());
    }
    inos.dedup();
    assert_eq!(1, inos.len(), "all waiters must see the same inode");
}

#[tokio::test]
async fn recursive_lookup_walks_components() {
    let (_repo, mount, _tree) = mount_at_tree_a().await;
    let root = mount.root().unwrap();

    let g = root
        .get_child_recursive(&"d1/g".parse::<driftfs_castore::RepoPathBuf>().unwrap())
        .await
        .unwrap();
    assert!(matches!(g, InodePtr::File(_)));
    assert_eq!(Some("d1/g".parse().unwrap()), g.path());

    // Walking through a file fails with ENOTDIR.
    assert!(matches!(
        root.get_child_recursive(&"f1/x".parse::<driftfs_castore::RepoPathBuf>().unwrap()).await,
        Err(FsError::NotADirectory)
    ));
}

#[tokio::test]
async fn lookup_inode_by_number_reloads_ancestors() {
    let (_repo, mount, _tree) = mount_at_tree_a().await;
    let root = mount.root().unwrap();

    let g = root
        .get_child_recursive(&"d1/g".parse::<driftfs_castore::RepoPathBuf>().unwrap())
        .await
        .unwrap();
    let g_ino = g.ino();

    // Simulate the kernel holding a reference while we drop the in-memory
    // tree.
    g.add_fuse_refcount(1);
    drop(g);
    root.unload_children_now().unwrap();
    assert!(mount.inode_map().get_loaded(g_ino).is_none());

    // Looking the number up again walks down from the root and reloads it
    // with the same number.
    let reloaded = mount.inode_map().lookup_inode(g_ino).await.unwrap();
    assert_eq!(g_ino, reloaded.ino());
}

#[tokio::test]
async fn load_materialized_children_warms_modified_state() {
    let (_repo, mount, _tree) = mount_at_tree_a().await;
    let root = mount.root().unwrap();

    let d1 = root.get_or_load_child_tree(&pc("d1")).await.unwrap();
    let file = d1
        .create(&pc("local"), 0o644, crate::RequestOrigin::Internal)
        .await
        .unwrap();
    let d1_ino = d1.ino();
    let file_ino = file.ino();
    drop((d1, file));

    root.unload_children_now().unwrap();
    assert!(mount.inode_map().get_loaded(d1_ino).is_none());
    assert!(mount.inode_map().get_loaded(file_ino).is_none());

    root.load_materialized_children(crate::inodes::Recurse::Deep)
        .await
        .unwrap();

    // The materialized subtree is resident again under the same numbers;
    // the untouched clean entries stay unloaded.
    assert!(mount.inode_map().get_loaded(d1_ino).is_some());
    assert!(mount.inode_map().get_loaded(file_ino).is_some());
    let f1_loaded = root
        .list_entries()
        .unwrap()
        .into_iter()
        .find(|(name, _, _)| *name == pc("f1"))
        .map(|(_, ino, _)| mount.inode_map().get_loaded(ino).is_some());
    assert_eq!(Some(false), f1_loaded);
}

#[tokio::test]
async fn forget_drains_kernel_references() {
    let (_repo, mount, _tree) = mount_at_tree_a().await;
    let dispatcher = Dispatcher::new(mount.clone());
    let req = RequestData::kernel();

    let entry = dispatcher.lookup(&req, ROOT_INO, &pc("f1")).await.unwrap();
    let entry2 = dispatcher.lookup(&req, ROOT_INO, &pc("f1")).await.unwrap();
    assert_eq!(entry.ino, entry2.ino);

    let ino = crate::inodes::InodeNumber(entry.ino);
    dispatcher.forget(ino, 2);

    // Not unlinked, so the inode stays resident after the kernel forgets it.
    assert!(mount.inode_map().get_loaded(ino).is_some());
}

#[tokio::test]
async fn negative_lookup_caches_via_inode_zero() {
    let (_repo, mount, _tree) = mount_at_tree_a().await;
    let dispatcher = Dispatcher::new(mount);
    let req = RequestData::kernel();

    let entry = dispatcher
        .lookup(&req, ROOT_INO, &pc("missing"))
        .await
        .unwrap();
    assert_eq!(0, entry.ino);
    assert!(entry.attr.is_none());
    assert_eq!(Duration::MAX, entry.entry_valid);
}

#[tokio::test]
async fn control_dir_resolves_at_the_root() {
    let (_repo, mount, _tree) = mount_at_tree_a().await;
    let root = mount.root().unwrap();

    let name = pc(std::str::from_utf8(Mount::CONTROL_DIR_NAME).unwrap());
    let control = root.get_or_load_child(&name).await.unwrap();
    assert!(control.is_tree());

    // It never appears in the entry listing.
    assert!(!root
        .list_entries()
        .unwrap()
        .iter()
        .any(|(entry_name, _, _)| *entry_name == name));
}

#[tokio::test]
async fn cancelled_requests_report_cancelled() {
    let (_repo, mount, _tree) = mount_at_tree_a().await;
    let dispatcher = Dispatcher::new(mount);
    let req = RequestData::kernel();
    req.interrupter.interrupt();

    assert!(matches!(
        dispatcher.lookup(&req, ROOT_INO, &pc("f1")).await,
        Err(FsError::Cancelled)
    ));
}
