//! Shared test fixtures, used by this crate and by driftfs-mount.
use crate::{Digest, EntryKind, Tree, TreeEntry};
use lazy_static::lazy_static;

pub const HELLOWORLD_BLOB_CONTENTS: &[u8] = b"Hello World!";
pub const EMPTY_BLOB_CONTENTS: &[u8] = b"";

lazy_static! {
    pub static ref DUMMY_DIGEST: Digest = {
        let u = [0u8; 32];
        (&u).into()
    };
    pub static ref DUMMY_DIGEST_2: Digest = {
        let mut u = [0u8; 32];
        u[0] = 0x10;
        (&u).into()
    };

    pub static ref HELLOWORLD_BLOB_DIGEST: Digest = Digest::for_blob(HELLOWORLD_BLOB_CONTENTS);
    pub static ref EMPTY_BLOB_DIGEST: Digest = Digest::for_blob(EMPTY_BLOB_CONTENTS);

    // 2 bytes
    pub static ref BLOB_A: bytes::Bytes = vec![0x00, 0x01].into();
    pub static ref BLOB_A_DIGEST: Digest = Digest::for_blob(&BLOB_A);

    // 1MB
    pub static ref BLOB_B: bytes::Bytes = (0..255).collect::<Vec<u8>>().repeat(4 * 1024).into();
    pub static ref BLOB_B_DIGEST: Digest = Digest::for_blob(&BLOB_B);

    // Trees
    pub static ref TREE_WITH_KEEP: Tree = {
        let mut tree = Tree::new();
        tree.add(
            ".keep".try_into().unwrap(),
            TreeEntry {
                kind: EntryKind::File,
                digest: EMPTY_BLOB_DIGEST.clone(),
                size: 0,
            },
        )
        .unwrap();
        tree
    };
    pub static ref TREE_COMPLICATED: Tree = {
        let mut tree = Tree::new();
        tree.add(
            "keep".try_into().unwrap(),
            TreeEntry {
                kind: EntryKind::Tree,
                digest: TREE_WITH_KEEP.digest(),
                size: TREE_WITH_KEEP.len() as u64,
            },
        )
        .unwrap();
        tree.add(
            ".keep".try_into().unwrap(),
            TreeEntry {
                kind: EntryKind::File,
                digest: EMPTY_BLOB_DIGEST.clone(),
                size: 0,
            },
        )
        .unwrap();
        tree.add(
            "aa".try_into().unwrap(),
            TreeEntry {
                kind: EntryKind::Symlink,
                digest: Digest::for_blob(b"somewhereelse"),
                size: b"somewhereelse".len() as u64,
            },
        )
        .unwrap();
        tree
    };
}
