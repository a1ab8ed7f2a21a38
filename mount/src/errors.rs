use thiserror::Error;

/// The error kinds the working-copy engine signals.
///
/// Filesystem requests reply with the corresponding errno from [errno](FsError::errno).
/// [StaleReference](FsError::StaleReference) is an internal signal only: it is
/// surfaced by `try_remove_child` when an entry changed under the caller, who
/// reloads and retries. It must never reach users.
#[derive(Debug, Clone, Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("file exists")]
    Exists,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("operation not permitted")]
    PermissionDenied,

    #[error("no such attribute")]
    NoAttribute,

    #[error("stale inode reference")]
    StaleReference,

    #[error("i/o error: {0}")]
    Io(String),

    #[error("request cancelled")]
    Cancelled,

    /// An internal invariant was violated. Logged at error severity at the
    /// point of creation and reported to users as EIO.
    #[error("internal error: {0}")]
    Bug(String),
}

impl FsError {
    /// Constructs a [FsError::Bug], logging it at error severity so broken
    /// invariants are visible even when the caller swallows the result.
    pub fn bug(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!("internal invariant violated: {}", msg);
        FsError::Bug(msg)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        FsError::Io(msg.into())
    }

    /// The errno a kernel reply should carry for this error.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::IsADirectory => libc::EISDIR,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::Exists => libc::EEXIST,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::PermissionDenied => libc::EPERM,
            FsError::NoAttribute => libc::ENODATA,
            FsError::StaleReference => libc::EBADF,
            FsError::Io(_) => libc::EIO,
            FsError::Cancelled => libc::ECANCELED,
            FsError::Bug(_) => libc::EIO,
        }
    }
}

impl From<driftfs_castore::Error> for FsError {
    fn from(value: driftfs_castore::Error) -> Self {
        FsError::Io(value.to_string())
    }
}

impl From<crate::overlay::OverlayError> for FsError {
    fn from(value: crate::overlay::OverlayError) -> Self {
        match value {
            crate::overlay::OverlayError::MissingData(ino) => {
                // The overlay reporting a missing record for an inode the
                // directory graph claims is materialized is an invariant
                // violation, not a user-visible lookup failure.
                FsError::bug(format!("missing overlay data for inode {}", ino))
            }
            other => FsError::Io(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FsError;

    #[test]
    fn errno_mapping() {
        assert_eq!(libc::ENOENT, FsError::NotFound.errno());
        assert_eq!(libc::ENOTEMPTY, FsError::NotEmpty.errno());
        assert_eq!(libc::EBADF, FsError::StaleReference.errno());
        assert_eq!(libc::EIO, FsError::Bug("x".into()).errno());
    }
}
