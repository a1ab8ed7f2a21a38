use driftfs_castore::EntryKind;

use super::{mount_at_tree_a, pc, TestRepo};
use crate::inodes::checkout::{CheckoutMode, ConflictType};
use crate::inodes::ROOT_INO;
use crate::overlay::Overlay;
use crate::{FsError, RequestOrigin};

#[tokio::test]
async fn checkout_to_same_tree_is_a_noop() {
    let (_repo, mount, tree_a) = mount_at_tree_a().await;

    let result = mount
        .checkout(Some(tree_a.clone()), CheckoutMode::Normal)
        .await
        .unwrap();
    assert!(result.conflicts.is_empty());
    assert!(result.errors.is_empty());
    assert_eq!(Some(tree_a.clone()), mount.current_snapshot());
    assert_eq!(Some(tree_a), mount.root().unwrap().tree_hash());
}

/// A' removes f2. With f2 unmodified the entry is removed without
/// conflicts and the root ends up clean at A'.
#[tokio::test]
async fn checkout_removes_clean_file() {
    let (repo, mount, _tree_a) = mount_at_tree_a().await;

    let blob1 = repo.put_blob(b"f1 contents\n").await;
    let blob3 = repo.put_blob(b"g contents\n").await;
    let d1 = repo.put_tree(&[("g", EntryKind::File, blob3, 11)]).await;
    let tree_a2 = repo
        .put_tree(&[
            ("d1", EntryKind::Tree, d1, 1),
            ("f1", EntryKind::File, blob1, 12),
        ])
        .await;

    let result = mount
        .checkout(Some(tree_a2.clone()), CheckoutMode::Normal)
        .await
        .unwrap();
    assert!(result.conflicts.is_empty());
    assert!(result.errors.is_empty());

    let root = mount.root().unwrap();
    assert!(matches!(
        root.get_or_load_child(&pc("f2")).await,
        Err(FsError::NotFound)
    ));
    assert_eq!(Some(tree_a2), root.tree_hash());
}

/// A locally modified f2 conflicts with its removal; in normal mode the
/// local file is retained.
#[tokio::test]
async fn checkout_reports_modified_conflict() {
    let (repo, mount, _tree_a) = mount_at_tree_a().await;
    let root = mount.root().unwrap();

    let f2 = root.get_or_load_child(&pc("f2")).await.unwrap();
    let f2 = f2.as_file().unwrap().clone();
    f2.write_all(b"local changes\n").await.unwrap();

    let blob1 = repo.put_blob(b"f1 contents\n").await;
    let blob3 = repo.put_blob(b"g contents\n").await;
    let d1 = repo.put_tree(&[("g", EntryKind::File, blob3, 11)]).await;
    let tree_a2 = repo
        .put_tree(&[
            ("d1", EntryKind::Tree, d1, 1),
            ("f1", EntryKind::File, blob1, 12),
        ])
        .await;

    let result = mount
        .checkout(Some(tree_a2.clone()), CheckoutMode::Normal)
        .await
        .unwrap();
    assert_eq!(1, result.conflicts.len());
    assert_eq!(ConflictType::ModifiedModified, result.conflicts[0].conflict_type);
    assert_eq!("f2".parse::<driftfs_castore::RepoPathBuf>().unwrap(), result.conflicts[0].path);

    // The locally modified file is retained.
    let kept = root.get_or_load_child(&pc("f2")).await.unwrap();
    let kept = kept.as_file().unwrap();
    assert_eq!(b"local changes\n".as_slice(), &kept.read_all().await.unwrap()[..]);
}

/// The same transition under force applies the removal, still reporting
/// the conflict.
#[tokio::test]
async fn force_checkout_overrides_modified_conflict() {
    let (repo, mount, _tree_a) = mount_at_tree_a().await;
    let root = mount.root().unwrap();

    let f2 = root.get_or_load_child(&pc("f2")).await.unwrap();
    f2.as_file()
        .unwrap()
        .write_all(b"local changes\n")
        .await
        .unwrap();

    let blob1 = repo.put_blob(b"f1 contents\n").await;
    let blob3 = repo.put_blob(b"g contents\n").await;
    let d1 = repo.put_tree(&[("g", EntryKind::File, blob3, 11)]).await;
    let tree_a2 = repo
        .put_tree(&[
            ("d1", EntryKind::Tree, d1, 1),
            ("f1", EntryKind::File, blob1, 12),
        ])
        .await;

    let result = mount
        .checkout(Some(tree_a2), CheckoutMode::Force)
        .await
        .unwrap();
    assert_eq!(1, result.conflicts.len());
    assert_eq!(ConflictType::ModifiedModified, result.conflicts[0].conflict_type);
    assert!(matches!(
        root.get_or_load_child(&pc("f2")).await,
        Err(FsError::NotFound)
    ));
}

#[tokio::test]
async fn dry_run_changes_nothing() {
    let (repo, mount, tree_a) = mount_at_tree_a().await;
    let root = mount.root().unwrap();

    let f2 = root.get_or_load_child(&pc("f2")).await.unwrap();
    f2.as_file().unwrap().write_all(b"dirty\n").await.unwrap();

    let blob1 = repo.put_blob(b"f1 contents\n").await;
    let tree_small = repo
        .put_tree(&[("f1", EntryKind::File, blob1, 12)])
        .await;

    let result = mount
        .checkout(Some(tree_small), CheckoutMode::DryRun)
        .await
        .unwrap();
    assert!(result
        .conflicts
        .iter()
        .any(|c| c.conflict_type == ConflictType::ModifiedModified));

    // Still at A, f2 still dirty.
    assert_eq!(Some(tree_a), mount.current_snapshot());
    assert!(root.get_or_load_child(&pc("f2")).await.is_ok());
}

/// Checking out A -> B -> A returns to a clean state with an empty overlay.
#[tokio::test]
async fn checkout_round_trip_restores_clean_state() {
    let (repo, mount, tree_a) = mount_at_tree_a().await;

    let blob1 = repo.put_blob(b"f1 contents\n").await;
    let blob2b = repo.put_blob(b"new f2 contents\n").await;
    let blob3 = repo.put_blob(b"g contents\n").await;
    let blob4 = repo.put_blob(b"f4 contents\n").await;
    let d1 = repo.put_tree(&[("g", EntryKind::File, blob3, 11)]).await;
    let tree_b = repo
        .put_tree(&[
            ("d1", EntryKind::Tree, d1, 1),
            ("f1", EntryKind::File, blob1, 12),
            ("f2", EntryKind::File, blob2b, 16),
            ("f4", EntryKind::File, blob4, 12),
        ])
        .await;

    let result = mount
        .checkout(Some(tree_b.clone()), CheckoutMode::Normal)
        .await
        .unwrap();
    assert!(result.conflicts.is_empty());

    let root = mount.root().unwrap();
    assert_eq!(Some(tree_b), root.tree_hash());
    let f2 = root.get_or_load_child(&pc("f2")).await.unwrap();
    assert_eq!(
        b"new f2 contents\n".as_slice(),
        &f2.as_file().unwrap().read_all().await.unwrap()[..]
    );

    let result = mount
        .checkout(Some(tree_a.clone()), CheckoutMode::Normal)
        .await
        .unwrap();
    assert!(result.conflicts.is_empty());
    assert_eq!(Some(tree_a), root.tree_hash());
    assert!(matches!(
        root.get_or_load_child(&pc("f4")).await,
        Err(FsError::NotFound)
    ));
    // Clean again: the root owns no overlay record.
    assert!(!repo.overlay.has_data(ROOT_INO));
}

/// Replacing a directory with a file empties and removes the directory
/// before inserting the new entry.
#[tokio::test]
async fn checkout_directory_becomes_file() {
    let (repo, mount, _tree_a) = mount_at_tree_a().await;
    let root = mount.root().unwrap();

    // Load d1 so the transition exercises the recursive update path.
    let d1 = root.get_or_load_child_tree(&pc("d1")).await.unwrap();

    let blob1 = repo.put_blob(b"f1 contents\n").await;
    let blob2 = repo.put_blob(b"f2 contents\n").await;
    let blob_d1 = repo.put_blob(b"now a file\n").await;
    let tree_c = repo
        .put_tree(&[
            ("d1", EntryKind::File, blob_d1, 11),
            ("f1", EntryKind::File, blob1, 12),
            ("f2", EntryKind::File, blob2, 12),
        ])
        .await;

    let result = mount
        .checkout(Some(tree_c.clone()), CheckoutMode::Normal)
        .await
        .unwrap();
    assert!(result.conflicts.is_empty(), "{:?}", result.conflicts);
    assert!(d1.is_unlinked());

    let replacement = root.get_or_load_child(&pc("d1")).await.unwrap();
    let file = replacement.as_file().expect("d1 is now a file");
    assert_eq!(b"now a file\n".as_slice(), &file.read_all().await.unwrap()[..]);
    assert_eq!(Some(tree_c), root.tree_hash());
}

/// An untracked file keeps its directory alive through a checkout that
/// removes the directory.
#[tokio::test]
async fn checkout_reports_directory_not_empty() {
    let (repo, mount, _tree_a) = mount_at_tree_a().await;
    let root = mount.root().unwrap();

    let d1 = root.get_or_load_child_tree(&pc("d1")).await.unwrap();
    d1.create(&pc("untracked"), 0o644, RequestOrigin::Internal)
        .await
        .unwrap();

    let blob1 = repo.put_blob(b"f1 contents\n").await;
    let blob2 = repo.put_blob(b"f2 contents\n").await;
    let tree_no_d1 = repo
        .put_tree(&[
            ("f1", EntryKind::File, blob1, 12),
            ("f2", EntryKind::File, blob2, 12),
        ])
        .await;

    let result = mount
        .checkout(Some(tree_no_d1), CheckoutMode::Normal)
        .await
        .unwrap();
    assert!(result
        .conflicts
        .iter()
        .any(|c| c.conflict_type == ConflictType::DirectoryNotEmpty));

    // The directory survives with only the untracked file inside.
    assert!(!d1.is_unlinked());
    assert!(d1.get_or_load_child(&pc("untracked")).await.is_ok());
    assert!(matches!(
        d1.get_or_load_child(&pc("g")).await,
        Err(FsError::NotFound)
    ));
}

/// Checking out from an empty mount populates it and leaves it clean.
#[tokio::test]
async fn checkout_from_empty_mount() {
    let repo = TestRepo::new();
    let tree_a = repo.tree_a().await;
    let mount = repo.mount(None).await;

    let root = mount.root().unwrap();
    assert!(root.is_materialized());

    let result = mount
        .checkout(Some(tree_a.clone()), CheckoutMode::Normal)
        .await
        .unwrap();
    assert!(result.conflicts.is_empty());
    assert_eq!(Some(tree_a), root.tree_hash());
    assert!(root.get_or_load_child(&pc("f1")).await.is_ok());
    assert!(!repo.overlay.has_data(ROOT_INO));
}

/// A local file in the way of a tree-added entry is an UntrackedAdded
/// conflict, applied only under force.
#[tokio::test]
async fn checkout_untracked_added_conflict() {
    let (repo, mount, _tree_a) = mount_at_tree_a().await;
    let root = mount.root().unwrap();

    let local = root
        .create(&pc("f5"), 0o644, RequestOrigin::Internal)
        .await
        .unwrap();
    local.write_all(b"mine\n").await.unwrap();

    let blob1 = repo.put_blob(b"f1 contents\n").await;
    let blob2 = repo.put_blob(b"f2 contents\n").await;
    let blob3 = repo.put_blob(b"g contents\n").await;
    let blob5 = repo.put_blob(b"theirs\n").await;
    let d1 = repo.put_tree(&[("g", EntryKind::File, blob3, 11)]).await;
    let tree_with_f5 = repo
        .put_tree(&[
            ("d1", EntryKind::Tree, d1, 1),
            ("f1", EntryKind::File, blob1, 12),
            ("f2", EntryKind::File, blob2, 12),
            ("f5", EntryKind::File, blob5, 7),
        ])
        .await;

    let result = mount
        .checkout(Some(tree_with_f5.clone()), CheckoutMode::Normal)
        .await
        .unwrap();
    assert!(result
        .conflicts
        .iter()
        .any(|c| c.conflict_type == ConflictType::UntrackedAdded));

    // Normal mode keeps the local file.
    let kept = root.get_or_load_child(&pc("f5")).await.unwrap();
    assert_eq!(
        b"mine\n".as_slice(),
        &kept.as_file().unwrap().read_all().await.unwrap()[..]
    );

    // After the first checkout the snapshot is the new tree, so f5 is now
    // tracked-but-modified; force overwrites it with the snapshot contents.
    let result = mount
        .checkout(Some(tree_with_f5), CheckoutMode::Force)
        .await
        .unwrap();
    assert!(result
        .conflicts
        .iter()
        .any(|c| c.conflict_type == ConflictType::ModifiedModified));
    let replaced = root.get_or_load_child(&pc("f5")).await.unwrap();
    assert_eq!(
        b"theirs\n".as_slice(),
        &replaced.as_file().unwrap().read_all().await.unwrap()[..]
    );
}
