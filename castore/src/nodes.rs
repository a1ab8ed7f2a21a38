//! The immutable object model: snapshot trees and the entries inside them.
use std::collections::BTreeMap;

use crate::{path::PathComponent, Digest};

/// The kind of object a [TreeEntry] points at.
///
/// Symlink targets are stored as blobs; the entry's digest addresses the blob
/// holding the target bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Tree,
    File,
    Executable,
    Symlink,
}

impl EntryKind {
    pub fn is_tree(&self) -> bool {
        matches!(self, EntryKind::Tree)
    }

    fn tag(&self) -> u8 {
        match self {
            EntryKind::Tree => b't',
            EntryKind::File => b'f',
            EntryKind::Executable => b'x',
            EntryKind::Symlink => b'l',
        }
    }
}

/// One child of a [Tree]: its kind, the digest of the object it points at,
/// and the object's size (entry count for trees, byte length otherwise).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub kind: EntryKind,
    pub digest: Digest,
    pub size: u64,
}

/// Errors that can occur when populating a [Tree].
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TreeError {
    /// Multiple elements with the same name encountered
    #[error("{0:?} is a duplicate name")]
    DuplicateName(PathComponent),
}

/// A Tree is an immutable snapshot directory. It attaches names to entries,
/// which are the basenames in that directory. These names:
///  - MUST not contain slashes or null bytes
///  - MUST not be '.' or '..'
///  - MUST be unique within the tree
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    entries: BTreeMap<PathComponent, TreeEntry>,
}

impl Tree {
    /// Constructs a new, empty Tree.
    pub fn new() -> Self {
        Tree {
            entries: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Allows iterating over all entries, sorted by their names in
    /// byte-lexicographic order. Merge walks against live directory contents
    /// rely on this ordering.
    pub fn entries(&self) -> impl Iterator<Item = (&PathComponent, &TreeEntry)> + '_ {
        self.entries.iter()
    }

    /// Dissolves a Tree into its individual names and entries, sorted by name.
    pub fn into_entries(self) -> impl Iterator<Item = (PathComponent, TreeEntry)> {
        self.entries.into_iter()
    }

    pub fn get(&self, name: &PathComponent) -> Option<&TreeEntry> {
        self.entries.get(name)
    }

    /// Adds the specified entry to the Tree with a given name.
    ///
    /// Inserting an element that already exists with the same name yields an
    /// error. Name validity is enforced by [PathComponent] construction.
    pub fn add(&mut self, name: PathComponent, entry: TreeEntry) -> Result<(), TreeError> {
        match self.entries.entry(name) {
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(entry);
                Ok(())
            }
            std::collections::btree_map::Entry::Occupied(occupied) => {
                Err(TreeError::DuplicateName(occupied.key().to_owned()))
            }
        }
    }

    /// Calculates the digest of the Tree, the blake3 hash of its canonical
    /// encoding: for every entry in name order, the kind tag, the
    /// length-prefixed name, the child digest and the size.
    pub fn digest(&self) -> Digest {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"driftfs:tree\0");
        for (name, entry) in &self.entries {
            hasher.update(&[entry.kind.tag()]);
            hasher.update(&(name.as_ref().len() as u64).to_le_bytes());
            hasher.update(name.as_ref());
            hasher.update(entry.digest.as_slice());
            hasher.update(&entry.size.to_le_bytes());
        }
        hasher.finalize().into()
    }
}

#[cfg(test)]
mod test {
    use super::{EntryKind, Tree, TreeEntry, TreeError};
    use crate::fixtures::DUMMY_DIGEST;

    fn file_entry() -> TreeEntry {
        TreeEntry {
            kind: EntryKind::File,
            digest: DUMMY_DIGEST.clone(),
            size: 1,
        }
    }

    #[test]
    fn add_entries_to_tree() {
        let mut t = Tree::new();

        t.add("b".try_into().unwrap(), file_entry()).unwrap();
        t.add("a".try_into().unwrap(), file_entry()).unwrap();
        t.add("z".try_into().unwrap(), file_entry()).unwrap();

        // Entries come back sorted regardless of insertion order.
        let names: Vec<_> = t.entries().map(|(n, _)| n.to_string()).collect();
        assert_eq!(vec!["a", "b", "z"], names);
    }

    #[test]
    fn add_duplicate_entry_to_tree() {
        let mut t = Tree::new();

        t.add("a".try_into().unwrap(), file_entry()).unwrap();
        assert_eq!(
            Err(TreeError::DuplicateName("a".try_into().unwrap())),
            t.add("a".try_into().unwrap(), file_entry())
        );
    }

    #[test]
    fn digest_changes_with_contents() {
        let empty = Tree::new();

        let mut one = Tree::new();
        one.add("a".try_into().unwrap(), file_entry()).unwrap();

        let mut renamed = Tree::new();
        renamed.add("b".try_into().unwrap(), file_entry()).unwrap();

        assert_ne!(empty.digest(), one.digest());
        assert_ne!(one.digest(), renamed.digest());
        assert_eq!(one.digest(), one.clone().digest());
    }
}
