//! Raw callback proxies.
//!
//! The kernel invokes these `extern "system"` functions on its own
//! threads. Each proxy upgrades the connection context, translates the
//! raw callback info into a [`Request`], and hands the connected
//! [`SyncFilter`] a reply ticket. The context is held weakly so a
//! disconnect frees the filter while a straggling callback degrades to a
//! no-op.

#![allow(clippy::missing_safety_doc)]

use std::{
    path::PathBuf,
    slice,
    sync::{Arc, Weak},
};

use widestring::U16CStr;
use windows::Win32::Storage::CloudFilters::{
    self, CF_CALLBACK_INFO, CF_CALLBACK_PARAMETERS, CF_CALLBACK_REGISTRATION,
};

use crate::kernel::{
    ticket, FetchRange, KernelTransfer, ProcessInfo, Request, SyncFilter, TransferKeys,
};

/// Shared by every callback of one connection.
pub(crate) struct ConnectionContext {
    pub filter: Weak<dyn SyncFilter>,
    pub transfer: Weak<dyn KernelTransfer>,
}

macro_rules! callback_table {
    ($([$kind:path, $proxy:ident]),* $(,)?) => {
        [
            $(
                CF_CALLBACK_REGISTRATION {
                    Type: $kind,
                    Callback: Some($proxy),
                },
            )*
            CF_CALLBACK_REGISTRATION {
                Type: CloudFilters::CF_CALLBACK_TYPE_NONE,
                Callback: None,
            },
        ]
    };
}

pub(crate) fn callback_table() -> [CF_CALLBACK_REGISTRATION; 11] {
    callback_table!(
        [
            CloudFilters::CF_CALLBACK_TYPE_FETCH_PLACEHOLDERS,
            fetch_placeholders
        ],
        [
            CloudFilters::CF_CALLBACK_TYPE_CANCEL_FETCH_PLACEHOLDERS,
            cancel_fetch_placeholders
        ],
        [CloudFilters::CF_CALLBACK_TYPE_FETCH_DATA, fetch_data],
        [
            CloudFilters::CF_CALLBACK_TYPE_CANCEL_FETCH_DATA,
            cancel_fetch_data
        ],
        [
            CloudFilters::CF_CALLBACK_TYPE_NOTIFY_FILE_OPEN_COMPLETION,
            notify_file_open_completion
        ],
        [
            CloudFilters::CF_CALLBACK_TYPE_NOTIFY_FILE_CLOSE_COMPLETION,
            notify_file_close_completion
        ],
        [CloudFilters::CF_CALLBACK_TYPE_NOTIFY_DELETE, notify_delete],
        [
            CloudFilters::CF_CALLBACK_TYPE_NOTIFY_DELETE_COMPLETION,
            notify_delete_completion
        ],
        [CloudFilters::CF_CALLBACK_TYPE_NOTIFY_RENAME, notify_rename],
        [
            CloudFilters::CF_CALLBACK_TYPE_NOTIFY_RENAME_COMPLETION,
            notify_rename_completion
        ],
    )
}

/// Upgrades the weak context stashed in the callback info, leaving the
/// raw weak in place for the next callback.
unsafe fn upgrade_context(
    info: *const CF_CALLBACK_INFO,
) -> Option<(Arc<dyn SyncFilter>, Arc<dyn KernelTransfer>)> {
    let weak = Weak::from_raw((*info).CallbackContext as *const ConnectionContext);
    let context = weak.upgrade();
    let _ = Weak::into_raw(weak);
    let context = context?;
    Some((context.filter.upgrade()?, context.transfer.upgrade()?))
}

unsafe fn volume_relative(info: *const CF_CALLBACK_INFO, tail: windows::core::PCWSTR) -> PathBuf {
    let mut path = PathBuf::from(
        U16CStr::from_ptr_str((*info).VolumeDosName.0).to_os_string(),
    );
    path.push(U16CStr::from_ptr_str(tail.0).to_os_string());
    path
}

unsafe fn translate(info: *const CF_CALLBACK_INFO) -> Request {
    let path = volume_relative(info, (*info).NormalizedPath);
    let keys = TransferKeys {
        connection: (*info).ConnectionKey.0,
        transfer: (*info).TransferKey,
    };
    let identity = if (*info).FileIdentity.is_null() {
        Vec::new()
    } else {
        slice::from_raw_parts(
            (*info).FileIdentity as *const u8,
            (*info).FileIdentityLength as usize,
        )
        .to_vec()
    };
    let process = ProcessInfo {
        image_path: (!(*info).ProcessInfo.is_null()).then(|| {
            PathBuf::from(
                U16CStr::from_ptr_str((*(*info).ProcessInfo).ImagePath.0).to_os_string(),
            )
        }),
    };
    Request::new(path, keys, identity, (*info).FileSize as u64, process)
}

pub(crate) unsafe extern "system" fn fetch_placeholders(
    info: *const CF_CALLBACK_INFO,
    params: *const CF_CALLBACK_PARAMETERS,
) {
    let Some((filter, transfer)) = upgrade_context(info) else {
        return;
    };
    let request = translate(info);
    let raw = (*params).Anonymous.FetchPlaceholders;
    let pattern = (!raw.Pattern.is_null())
        .then(|| U16CStr::from_ptr_str(raw.Pattern.0).to_string_lossy());
    let ticket =
        ticket::FetchPlaceholders::new(transfer, request.keys(), request.path().to_path_buf());
    filter.fetch_placeholders(request, ticket, pattern);
}

pub(crate) unsafe extern "system" fn cancel_fetch_placeholders(
    info: *const CF_CALLBACK_INFO,
    _params: *const CF_CALLBACK_PARAMETERS,
) {
    let Some((filter, _)) = upgrade_context(info) else {
        return;
    };
    filter.cancel_fetch_placeholders(translate(info));
}

pub(crate) unsafe extern "system" fn fetch_data(
    info: *const CF_CALLBACK_INFO,
    params: *const CF_CALLBACK_PARAMETERS,
) {
    let Some((filter, transfer)) = upgrade_context(info) else {
        return;
    };
    let request = translate(info);
    let raw = (*params).Anonymous.FetchData;
    let range = FetchRange {
        offset: raw.RequiredFileOffset as u64,
        length: raw.RequiredLength as u64,
    };
    let ticket = ticket::FetchData::new(transfer, request.keys());
    filter.fetch_data(request, ticket, range);
}

pub(crate) unsafe extern "system" fn cancel_fetch_data(
    info: *const CF_CALLBACK_INFO,
    params: *const CF_CALLBACK_PARAMETERS,
) {
    let Some((filter, _)) = upgrade_context(info) else {
        return;
    };
    let raw = (*params).Anonymous.Cancel;
    let fetch = raw.Anonymous.FetchData;
    filter.cancel_fetch_data(
        translate(info),
        FetchRange {
            offset: fetch.FileOffset as u64,
            length: fetch.Length as u64,
        },
    );
}

pub(crate) unsafe extern "system" fn notify_file_open_completion(
    info: *const CF_CALLBACK_INFO,
    _params: *const CF_CALLBACK_PARAMETERS,
) {
    let Some((filter, _)) = upgrade_context(info) else {
        return;
    };
    filter.opened(translate(info));
}

pub(crate) unsafe extern "system" fn notify_file_close_completion(
    info: *const CF_CALLBACK_INFO,
    params: *const CF_CALLBACK_PARAMETERS,
) {
    let Some((filter, _)) = upgrade_context(info) else {
        return;
    };
    let raw = (*params).Anonymous.CloseCompletion;
    let deleted =
        (raw.Flags & CloudFilters::CF_CALLBACK_CLOSE_COMPLETION_FLAG_DELETED).0 != 0;
    // The kernel does not report dirtiness here; the dispatcher inspects
    // placeholder state before queueing an upload.
    filter.closed(translate(info), !deleted, deleted);
}

pub(crate) unsafe extern "system" fn notify_delete(
    info: *const CF_CALLBACK_INFO,
    params: *const CF_CALLBACK_PARAMETERS,
) {
    let Some((filter, transfer)) = upgrade_context(info) else {
        return;
    };
    let request = translate(info);
    let raw = (*params).Anonymous.Delete;
    let is_directory =
        (raw.Flags & CloudFilters::CF_CALLBACK_DELETE_FLAG_IS_DIRECTORY).0 != 0;
    let ticket = ticket::Delete::new(transfer, request.keys());
    filter.delete(request, ticket, is_directory);
}

pub(crate) unsafe extern "system" fn notify_delete_completion(
    info: *const CF_CALLBACK_INFO,
    _params: *const CF_CALLBACK_PARAMETERS,
) {
    let Some((filter, _)) = upgrade_context(info) else {
        return;
    };
    filter.deleted(translate(info));
}

pub(crate) unsafe extern "system" fn notify_rename(
    info: *const CF_CALLBACK_INFO,
    params: *const CF_CALLBACK_PARAMETERS,
) {
    let Some((filter, transfer)) = upgrade_context(info) else {
        return;
    };
    let request = translate(info);
    let raw = (*params).Anonymous.Rename;
    let is_directory =
        (raw.Flags & CloudFilters::CF_CALLBACK_RENAME_FLAG_IS_DIRECTORY).0 != 0;
    let target = volume_relative(info, raw.TargetPath);
    let ticket = ticket::Rename::new(transfer, request.keys());
    filter.rename(request, ticket, target, is_directory);
}

pub(crate) unsafe extern "system" fn notify_rename_completion(
    info: *const CF_CALLBACK_INFO,
    params: *const CF_CALLBACK_PARAMETERS,
) {
    let Some((filter, _)) = upgrade_context(info) else {
        return;
    };
    let raw = (*params).Anonymous.RenameCompletion;
    let source = volume_relative(info, raw.SourcePath);
    filter.renamed(translate(info), source);
}
