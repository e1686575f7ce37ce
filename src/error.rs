use std::path::PathBuf;

use thiserror::Error;

use crate::remote::RemoteError;

/// Terminal status kinds understood by the placeholder subsystem.
///
/// Every error leaving a callback handler is collapsed into one of these
/// before it reaches the kernel; the Windows adapter maps them onto the
/// corresponding `STATUS_CLOUD_FILE_*` codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorKind {
    NotACloudFile,
    NotInSync,
    InUse,
    AccessDenied,
    NetworkUnavailable,
    Cancelled,
    InvalidRequest,
    Unsuccessful,
}

/// Errors produced by the sync engine core.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The target exists locally but is not a placeholder.
    #[error("{}: not a placeholder", .0.display())]
    NotACloudFile(PathBuf),

    /// Revert was attempted on a partial or invalid placeholder.
    #[error("{}: placeholder is not in sync", .0.display())]
    NotInSync(PathBuf),

    /// An exclusive oplock or file handle could not be acquired.
    #[error("{}: in use by another process", .0.display())]
    InUse(PathBuf),

    /// The placeholder is pinned and may not be dehydrated.
    #[error("{}: placeholder is pinned", .0.display())]
    Pinned(PathBuf),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The serialized identity blob exceeds the kernel limit.
    #[error("identity blob is {len} bytes, limit is {max}")]
    IdentityTooLarge { len: usize, max: usize },

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Unsuccessful(String),
}

impl SyncError {
    /// The terminal status this error maps to at the callback edge.
    pub fn kind(&self) -> SyncErrorKind {
        match self {
            SyncError::NotACloudFile(_) => SyncErrorKind::NotACloudFile,
            SyncError::NotInSync(_) => SyncErrorKind::NotInSync,
            SyncError::InUse(_) => SyncErrorKind::InUse,
            SyncError::Cancelled => SyncErrorKind::Cancelled,
            SyncError::InvalidRequest(_) | SyncError::IdentityTooLarge { .. } => {
                SyncErrorKind::InvalidRequest
            }
            SyncError::Remote(RemoteError::Forbidden(_)) => SyncErrorKind::AccessDenied,
            SyncError::Remote(RemoteError::Unavailable) => SyncErrorKind::NetworkUnavailable,
            SyncError::Pinned(_)
            | SyncError::Remote(_)
            | SyncError::Io(_)
            | SyncError::Unsuccessful(_) => SyncErrorKind::Unsuccessful,
        }
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
