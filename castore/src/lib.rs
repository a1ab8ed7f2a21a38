mod digests;
mod errors;
mod nodes;

pub mod fixtures;
pub mod store;

mod path;
pub use path::{PathComponent, PathComponentError, RepoPath, RepoPathBuf};

pub use digests::{Digest, DIGEST_LEN};
pub use errors::Error;
pub use nodes::{EntryKind, Tree, TreeEntry, TreeError};
