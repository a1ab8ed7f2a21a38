use std::sync::Arc;

use driftfs_castore::EntryKind;

use super::{mount_at_tree_a, pc, TestRepo};
use crate::inodes::diff::{DiffCollector, DiffStatus};
use crate::RequestOrigin;

fn entry(status: DiffStatus, path: &str) -> (DiffStatus, driftfs_castore::RepoPathBuf) {
    (status, path.parse().unwrap())
}

async fn run_diff(
    mount: &Arc<crate::Mount>,
    reference: &driftfs_castore::Digest,
    list_ignored: bool,
) -> Vec<(DiffStatus, driftfs_castore::RepoPathBuf)> {
    let collector = Arc::new(DiffCollector::new());
    mount
        .diff(Some(reference), collector.clone(), list_ignored)
        .await
        .unwrap();
    collector.entries()
}

#[tokio::test]
async fn clean_tree_diffs_empty() {
    let (_repo, mount, tree_a) = mount_at_tree_a().await;
    assert!(run_diff(&mount, &tree_a, false).await.is_empty());
}

#[tokio::test]
async fn created_file_is_untracked() {
    let (_repo, mount, tree_a) = mount_at_tree_a().await;
    let root = mount.root().unwrap();

    root.create(&pc("new"), 0o644, RequestOrigin::Internal)
        .await
        .unwrap();

    assert_eq!(
        vec![entry(DiffStatus::Untracked, "new")],
        run_diff(&mount, &tree_a, false).await
    );
}

#[tokio::test]
async fn modified_file_is_reported() {
    let (_repo, mount, tree_a) = mount_at_tree_a().await;
    let root = mount.root().unwrap();

    let f1 = root.get_or_load_child(&pc("f1")).await.unwrap();
    f1.as_file().unwrap().write_all(b"changed\n").await.unwrap();

    assert_eq!(
        vec![entry(DiffStatus::Modified, "f1")],
        run_diff(&mount, &tree_a, false).await
    );
}

#[tokio::test]
async fn removed_file_is_reported() {
    let (_repo, mount, tree_a) = mount_at_tree_a().await;
    let root = mount.root().unwrap();

    root.unlink(&pc("f2"), RequestOrigin::Internal)
        .await
        .unwrap();

    assert_eq!(
        vec![entry(DiffStatus::Removed, "f2")],
        run_diff(&mount, &tree_a, false).await
    );
}

#[tokio::test]
async fn removed_directory_reports_every_file() {
    let (_repo, mount, tree_a) = mount_at_tree_a().await;
    let root = mount.root().unwrap();

    let d1 = root.get_or_load_child_tree(&pc("d1")).await.unwrap();
    d1.unlink(&pc("g"), RequestOrigin::Internal).await.unwrap();
    root.rmdir(&pc("d1"), RequestOrigin::Internal)
        .await
        .unwrap();

    assert_eq!(
        vec![entry(DiffStatus::Removed, "d1/g")],
        run_diff(&mount, &tree_a, false).await
    );
}

#[tokio::test]
async fn untracked_directory_recurses() {
    let (_repo, mount, tree_a) = mount_at_tree_a().await;
    let root = mount.root().unwrap();

    let nd = root
        .mkdir(&pc("nd"), 0o755, RequestOrigin::Internal)
        .await
        .unwrap();
    nd.create(&pc("a"), 0o644, RequestOrigin::Internal)
        .await
        .unwrap();

    assert_eq!(
        vec![entry(DiffStatus::Untracked, "nd/a")],
        run_diff(&mount, &tree_a, false).await
    );
}

#[tokio::test]
async fn gitignore_rules_classify_untracked_files() {
    let repo = TestRepo::new();
    let gitignore = repo.put_blob(b"*.log\n").await;
    let blob1 = repo.put_blob(b"f1 contents\n").await;
    let tree = repo
        .put_tree(&[
            (".gitignore", EntryKind::File, gitignore, 6),
            ("f1", EntryKind::File, blob1, 12),
        ])
        .await;
    let mount = repo.mount(Some(tree.clone())).await;
    let root = mount.root().unwrap();

    root.create(&pc("x.log"), 0o644, RequestOrigin::Internal)
        .await
        .unwrap();
    root.create(&pc("kept"), 0o644, RequestOrigin::Internal)
        .await
        .unwrap();

    // Without list_ignored the excluded file is simply omitted.
    assert_eq!(
        vec![entry(DiffStatus::Untracked, "kept")],
        run_diff(&mount, &tree, false).await
    );

    // With list_ignored it shows up as ignored.
    assert_eq!(
        vec![
            entry(DiffStatus::Untracked, "kept"),
            entry(DiffStatus::Ignored, "x.log"),
        ],
        run_diff(&mount, &tree, true).await
    );
}

#[tokio::test]
async fn deeper_gitignore_layers_take_precedence() {
    let repo = TestRepo::new();
    let root_ignore = repo.put_blob(b"*.log\n").await;
    let sub_ignore = repo.put_blob(b"!keep.log\n").await;
    let sub = repo
        .put_tree(&[(".gitignore", EntryKind::File, sub_ignore, 10)])
        .await;
    let tree = repo
        .put_tree(&[
            (".gitignore", EntryKind::File, root_ignore, 6),
            ("sub", EntryKind::Tree, sub, 1),
        ])
        .await;
    let mount = repo.mount(Some(tree.clone())).await;
    let root = mount.root().unwrap();

    let sub_dir = root.get_or_load_child_tree(&pc("sub")).await.unwrap();
    sub_dir
        .create(&pc("keep.log"), 0o644, RequestOrigin::Internal)
        .await
        .unwrap();
    sub_dir
        .create(&pc("drop.log"), 0o644, RequestOrigin::Internal)
        .await
        .unwrap();

    assert_eq!(
        vec![entry(DiffStatus::Untracked, "sub/keep.log")],
        run_diff(&mount, &tree, false).await
    );
}

#[tokio::test]
async fn reserved_directories_are_hidden() {
    let (_repo, mount, tree_a) = mount_at_tree_a().await;
    let root = mount.root().unwrap();

    let hg = root
        .mkdir(&pc(".hg"), 0o755, RequestOrigin::Internal)
        .await
        .unwrap();
    hg.create(&pc("dirstate"), 0o644, RequestOrigin::Internal)
        .await
        .unwrap();

    // Hidden even when ignored files are requested.
    assert!(run_diff(&mount, &tree_a, true).await.is_empty());
}

#[tokio::test]
async fn file_replaced_by_directory_reports_both_sides() {
    let (_repo, mount, tree_a) = mount_at_tree_a().await;
    let root = mount.root().unwrap();

    root.unlink(&pc("f1"), RequestOrigin::Internal)
        .await
        .unwrap();
    let f1_dir = root
        .mkdir(&pc("f1"), 0o755, RequestOrigin::Internal)
        .await
        .unwrap();
    f1_dir
        .create(&pc("inner"), 0o644, RequestOrigin::Internal)
        .await
        .unwrap();

    assert_eq!(
        vec![
            entry(DiffStatus::Removed, "f1"),
            entry(DiffStatus::Untracked, "f1/inner"),
        ],
        run_diff(&mount, &tree_a, false).await
    );
}

#[tokio::test]
async fn unmodified_materialized_file_is_not_reported() {
    let (_repo, mount, tree_a) = mount_at_tree_a().await;
    let root = mount.root().unwrap();

    // Materialize f1 but write back the identical contents; the diff hashes
    // the overlay data and finds it equal to the snapshot blob.
    let f1 = root.get_or_load_child(&pc("f1")).await.unwrap();
    f1.as_file()
        .unwrap()
        .write_all(b"f1 contents\n")
        .await
        .unwrap();
    assert!(f1.is_materialized());

    assert!(run_diff(&mount, &tree_a, false).await.is_empty());
}

#[tokio::test]
async fn diff_against_no_reference_reports_everything_untracked() {
    let (_repo, mount, _tree_a) = mount_at_tree_a().await;

    let collector = Arc::new(DiffCollector::new());
    mount.diff(None, collector.clone(), false).await.unwrap();
    let entries = collector.entries();

    assert_eq!(
        vec![
            entry(DiffStatus::Untracked, "d1/g"),
            entry(DiffStatus::Untracked, "f1"),
            entry(DiffStatus::Untracked, "f2"),
        ],
        entries
    );
}
