//! The Cloud Filter API backend.
//!
//! [`WindowsCloud`] implements the three kernel traits against the real
//! placeholder subsystem: `CfExecute` replies, `Cf*` placeholder handle
//! operations, and sync-root registration through the storage provider
//! manager. Callback proxies translate raw `CF_CALLBACK_INFO` into
//! [`Request`](crate::kernel::Request)s for the connected filter.

mod command;
mod filter;
mod root;
mod store;

pub use root::WindowsCloud;

use windows::{
    core::Error as WinError,
    Win32::Foundation::{
        ERROR_ACCESS_DENIED, ERROR_CLOUD_FILE_IN_USE, ERROR_CLOUD_FILE_NOT_IN_SYNC,
        ERROR_CLOUD_FILE_PINNED, ERROR_CLOUD_FILE_REQUEST_CANCELED, ERROR_LOCK_VIOLATION,
        ERROR_NOT_A_CLOUD_FILE, ERROR_SHARING_VIOLATION, NTSTATUS,
    },
};

use crate::error::{SyncError, SyncErrorKind};

/// Collapses a Win32 failure into the engine taxonomy.
pub(crate) fn map_win_error(path: &std::path::Path, error: WinError) -> SyncError {
    let code = error.code();
    if code == ERROR_NOT_A_CLOUD_FILE.to_hresult() {
        SyncError::NotACloudFile(path.to_path_buf())
    } else if code == ERROR_CLOUD_FILE_NOT_IN_SYNC.to_hresult() {
        SyncError::NotInSync(path.to_path_buf())
    } else if code == ERROR_CLOUD_FILE_PINNED.to_hresult() {
        SyncError::Pinned(path.to_path_buf())
    } else if code == ERROR_CLOUD_FILE_IN_USE.to_hresult()
        || code == ERROR_SHARING_VIOLATION.to_hresult()
        || code == ERROR_LOCK_VIOLATION.to_hresult()
    {
        SyncError::InUse(path.to_path_buf())
    } else if code == ERROR_CLOUD_FILE_REQUEST_CANCELED.to_hresult() {
        SyncError::Cancelled
    } else if code == ERROR_ACCESS_DENIED.to_hresult() {
        SyncError::Unsuccessful(format!("{}: access denied", path.display()))
    } else {
        SyncError::Unsuccessful(format!("{}: {error}", path.display()))
    }
}

/// The `STATUS_CLOUD_FILE_*` code a terminal status maps onto.
pub(crate) fn terminal_ntstatus(kind: SyncErrorKind) -> NTSTATUS {
    use windows::Win32::Foundation;

    match kind {
        SyncErrorKind::NotACloudFile => Foundation::STATUS_NOT_A_CLOUD_FILE,
        SyncErrorKind::NotInSync => Foundation::STATUS_CLOUD_FILE_NOT_IN_SYNC,
        SyncErrorKind::InUse => Foundation::STATUS_CLOUD_FILE_IN_USE,
        SyncErrorKind::AccessDenied => Foundation::STATUS_CLOUD_FILE_ACCESS_DENIED,
        SyncErrorKind::NetworkUnavailable => Foundation::STATUS_CLOUD_FILE_NETWORK_UNAVAILABLE,
        SyncErrorKind::Cancelled => Foundation::STATUS_CLOUD_FILE_REQUEST_CANCELED,
        SyncErrorKind::InvalidRequest => Foundation::STATUS_CLOUD_FILE_INVALID_REQUEST,
        SyncErrorKind::Unsuccessful => Foundation::STATUS_CLOUD_FILE_UNSUCCESSFUL,
    }
}
