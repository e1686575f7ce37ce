//! Keyed replies through `CfExecute`.
//!
//! Each reply builds the matching `CF_OPERATION_PARAMETERS` union variant
//! and executes it against the callback's connection/transfer keys.

use std::mem::{self, offset_of};

use widestring::U16CString;
use windows::Win32::{
    Foundation,
    Storage::CloudFilters::{
        self, CfExecute, CfReportProviderProgress, CF_CONNECTION_KEY, CF_OPERATION_INFO,
        CF_OPERATION_PARAMETERS, CF_OPERATION_PARAMETERS_0, CF_OPERATION_PARAMETERS_0_2,
        CF_OPERATION_PARAMETERS_0_3, CF_OPERATION_PARAMETERS_0_6, CF_OPERATION_PARAMETERS_0_7,
        CF_OPERATION_TYPE, CF_PLACEHOLDER_CREATE_INFO,
    },
};

use crate::{
    error::{Result, SyncError, SyncErrorKind},
    kernel::{PlaceholderSpec, TransferKeys},
};

use super::{store::create_info_from_spec, terminal_ntstatus};

fn operation_info(op: CF_OPERATION_TYPE, keys: TransferKeys) -> CF_OPERATION_INFO {
    CF_OPERATION_INFO {
        StructSize: mem::size_of::<CF_OPERATION_INFO>() as u32,
        Type: op,
        ConnectionKey: CF_CONNECTION_KEY(keys.connection),
        TransferKey: keys.transfer,
        CorrelationVector: std::ptr::null(),
        SyncStatus: std::ptr::null(),
        RequestKey: CloudFilters::CF_REQUEST_KEY_DEFAULT as i64,
    }
}

fn execute<F: Copy>(
    op: CF_OPERATION_TYPE,
    keys: TransferKeys,
    parameters: CF_OPERATION_PARAMETERS_0,
) -> Result<()> {
    let info = operation_info(op, keys);
    let mut parameters = CF_OPERATION_PARAMETERS {
        ParamSize: (mem::size_of::<F>() + offset_of!(CF_OPERATION_PARAMETERS, Anonymous)) as u32,
        Anonymous: parameters,
    };
    unsafe { CfExecute(&info, &mut parameters) }
        .map_err(|e| SyncError::Unsuccessful(format!("CfExecute: {e}")))
}

pub(crate) fn transfer_data(keys: TransferKeys, offset: u64, data: &[u8]) -> Result<()> {
    execute::<CF_OPERATION_PARAMETERS_0_6>(
        CloudFilters::CF_OPERATION_TYPE_TRANSFER_DATA,
        keys,
        CF_OPERATION_PARAMETERS_0 {
            TransferData: CF_OPERATION_PARAMETERS_0_6 {
                Flags: CloudFilters::CF_OPERATION_TRANSFER_DATA_FLAG_NONE,
                CompletionStatus: Foundation::STATUS_SUCCESS,
                Buffer: data.as_ptr() as *mut _,
                Offset: offset as i64,
                Length: data.len() as i64,
            },
        },
    )
}

pub(crate) fn fail_data(keys: TransferKeys, status: SyncErrorKind) -> Result<()> {
    execute::<CF_OPERATION_PARAMETERS_0_6>(
        CloudFilters::CF_OPERATION_TYPE_TRANSFER_DATA,
        keys,
        CF_OPERATION_PARAMETERS_0 {
            TransferData: CF_OPERATION_PARAMETERS_0_6 {
                Flags: CloudFilters::CF_OPERATION_TRANSFER_DATA_FLAG_NONE,
                CompletionStatus: terminal_ntstatus(status),
                Buffer: std::ptr::null_mut(),
                Offset: 0,
                Length: 0,
            },
        },
    )
}

pub(crate) fn transfer_placeholders(
    keys: TransferKeys,
    specs: Vec<PlaceholderSpec>,
) -> Result<()> {
    // Name buffers and identity blobs must outlive the call.
    let names: Vec<U16CString> = specs
        .iter()
        .map(|spec| U16CString::from_os_str(spec.relative_name.as_os_str()))
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| SyncError::InvalidRequest(format!("placeholder name: {e}")))?;
    let mut infos: Vec<CF_PLACEHOLDER_CREATE_INFO> = specs
        .iter()
        .zip(&names)
        .map(|(spec, name)| create_info_from_spec(spec, name))
        .collect();

    execute::<CF_OPERATION_PARAMETERS_0_7>(
        CloudFilters::CF_OPERATION_TYPE_TRANSFER_PLACEHOLDERS,
        keys,
        CF_OPERATION_PARAMETERS_0 {
            TransferPlaceholders: CF_OPERATION_PARAMETERS_0_7 {
                Flags: CloudFilters::CF_OPERATION_TRANSFER_PLACEHOLDERS_FLAG_NONE,
                CompletionStatus: Foundation::STATUS_SUCCESS,
                PlaceholderTotalCount: infos.len() as i64,
                PlaceholderArray: infos.as_mut_ptr(),
                PlaceholderCount: infos.len() as u32,
                EntriesProcessed: 0,
            },
        },
    )
}

pub(crate) fn fail_placeholders(keys: TransferKeys, status: SyncErrorKind) -> Result<()> {
    execute::<CF_OPERATION_PARAMETERS_0_7>(
        CloudFilters::CF_OPERATION_TYPE_TRANSFER_PLACEHOLDERS,
        keys,
        CF_OPERATION_PARAMETERS_0 {
            TransferPlaceholders: CF_OPERATION_PARAMETERS_0_7 {
                Flags: CloudFilters::CF_OPERATION_TRANSFER_PLACEHOLDERS_FLAG_NONE,
                CompletionStatus: terminal_ntstatus(status),
                PlaceholderTotalCount: 0,
                PlaceholderArray: std::ptr::null_mut(),
                PlaceholderCount: 0,
                EntriesProcessed: 0,
            },
        },
    )
}

pub(crate) fn ack_delete(
    keys: TransferKeys,
    status: std::result::Result<(), SyncErrorKind>,
) -> Result<()> {
    execute::<CF_OPERATION_PARAMETERS_0_2>(
        CloudFilters::CF_OPERATION_TYPE_ACK_DELETE,
        keys,
        CF_OPERATION_PARAMETERS_0 {
            AckDelete: CF_OPERATION_PARAMETERS_0_2 {
                Flags: CloudFilters::CF_OPERATION_ACK_DELETE_FLAG_NONE,
                CompletionStatus: match status {
                    Ok(()) => Foundation::STATUS_SUCCESS,
                    Err(kind) => terminal_ntstatus(kind),
                },
            },
        },
    )
}

pub(crate) fn ack_rename(
    keys: TransferKeys,
    status: std::result::Result<(), SyncErrorKind>,
) -> Result<()> {
    execute::<CF_OPERATION_PARAMETERS_0_3>(
        CloudFilters::CF_OPERATION_TYPE_ACK_RENAME,
        keys,
        CF_OPERATION_PARAMETERS_0 {
            AckRename: CF_OPERATION_PARAMETERS_0_3 {
                Flags: CloudFilters::CF_OPERATION_ACK_RENAME_FLAG_NONE,
                CompletionStatus: match status {
                    Ok(()) => Foundation::STATUS_SUCCESS,
                    Err(kind) => terminal_ntstatus(kind),
                },
            },
        },
    )
}

pub(crate) fn report_progress(keys: TransferKeys, total: u64, completed: u64) -> Result<()> {
    unsafe {
        CfReportProviderProgress(
            CF_CONNECTION_KEY(keys.connection),
            keys.transfer,
            total as i64,
            completed as i64,
        )
    }
    .map_err(|e| SyncError::Unsuccessful(format!("CfReportProviderProgress: {e}")))
}
