//! Placeholder operations over `Cf*` handles.

use std::{
    mem::{self, MaybeUninit},
    path::Path,
    time::SystemTime,
};

use nt_time::FileTime;
use widestring::U16CString;
use windows::{
    core::PCWSTR,
    Win32::{
        Foundation,
        Storage::{
            CloudFilters::{
                self, CfCloseHandle, CfConvertToPlaceholder, CfCreatePlaceholders,
                CfDehydratePlaceholder, CfGetPlaceholderInfo, CfHydratePlaceholder,
                CfOpenFileWithOplock, CfRevertPlaceholder, CfSetInSyncState, CfSetPinState,
                CfUpdatePlaceholder, CF_CONVERT_FLAGS, CF_CREATE_FLAGS, CF_FILE_RANGE,
                CF_FS_METADATA, CF_PIN_STATE, CF_PLACEHOLDER_CREATE_INFO,
                CF_PLACEHOLDER_STANDARD_INFO, CF_UPDATE_FLAGS,
            },
            FileSystem::{
                GetFileAttributesW, FILE_ATTRIBUTE_DIRECTORY, FILE_ATTRIBUTE_NORMAL,
                FILE_ATTRIBUTE_RECALL_ON_DATA_ACCESS, FILE_BASIC_INFO,
            },
        },
    },
};

use crate::{
    error::{Result, SyncError},
    identity::MAX_IDENTITY_LEN,
    kernel::{
        ConvertOptions, PinState, PlaceholderMetadata, PlaceholderSpec, PlaceholderState,
        PlaceholderStore, UpdateOptions,
    },
};

use super::{map_win_error, root::WindowsCloud};

/// Owns a `CfOpenFileWithOplock` handle; released on every exit path.
struct OplockHandle(Foundation::HANDLE);

impl OplockHandle {
    fn open(path: &Path, exclusive: bool) -> Result<Self> {
        let wide = wide_path(path)?;
        let flags = if exclusive {
            CloudFilters::CF_OPEN_FILE_FLAG_EXCLUSIVE | CloudFilters::CF_OPEN_FILE_FLAG_WRITE_ACCESS
        } else {
            CloudFilters::CF_OPEN_FILE_FLAG_NONE
        };
        let handle = unsafe { CfOpenFileWithOplock(PCWSTR(wide.as_ptr()), flags) }
            .map_err(|e| map_win_error(path, e))?;
        Ok(Self(handle))
    }
}

impl Drop for OplockHandle {
    fn drop(&mut self) {
        unsafe { CfCloseHandle(self.0) };
    }
}

fn wide_path(path: &Path) -> Result<U16CString> {
    U16CString::from_os_str(path.as_os_str())
        .map_err(|e| SyncError::InvalidRequest(format!("path {}: {e}", path.display())))
}

fn file_time(time: SystemTime) -> i64 {
    FileTime::try_from(time).map(|t| t.to_raw() as i64).unwrap_or(0)
}

fn fs_metadata(metadata: &PlaceholderMetadata) -> CF_FS_METADATA {
    CF_FS_METADATA {
        BasicInfo: FILE_BASIC_INFO {
            CreationTime: file_time(metadata.created),
            LastAccessTime: file_time(metadata.accessed),
            LastWriteTime: file_time(metadata.modified),
            ChangeTime: file_time(metadata.changed),
            FileAttributes: if metadata.directory {
                FILE_ATTRIBUTE_DIRECTORY.0
            } else {
                FILE_ATTRIBUTE_NORMAL.0
            },
        },
        FileSize: metadata.size as i64,
    }
}

/// Builds the create-info for one spec. `name` must stay alive for the
/// duration of the kernel call using the returned struct.
pub(crate) fn create_info_from_spec(
    spec: &PlaceholderSpec,
    name: &U16CString,
) -> CF_PLACEHOLDER_CREATE_INFO {
    let mut flags = CloudFilters::CF_PLACEHOLDER_CREATE_FLAG_NONE;
    if spec.in_sync {
        flags |= CloudFilters::CF_PLACEHOLDER_CREATE_FLAG_MARK_IN_SYNC;
    }
    if spec.metadata.directory && !spec.on_demand_children {
        flags |= CloudFilters::CF_PLACEHOLDER_CREATE_FLAG_DISABLE_ON_DEMAND_POPULATION;
    }
    if spec.overwrite {
        flags |= CloudFilters::CF_PLACEHOLDER_CREATE_FLAG_SUPERSEDE;
    }
    CF_PLACEHOLDER_CREATE_INFO {
        RelativeFileName: PCWSTR(name.as_ptr()),
        FsMetadata: fs_metadata(&spec.metadata),
        FileIdentity: spec.identity.as_ptr() as *const _,
        FileIdentityLength: spec.identity.len() as u32,
        Flags: flags,
        Result: Foundation::S_OK,
        CreateUsn: 0,
    }
}

fn pin_state_raw(state: PinState) -> CF_PIN_STATE {
    match state {
        PinState::Unspecified => CloudFilters::CF_PIN_STATE_UNSPECIFIED,
        PinState::Pinned => CloudFilters::CF_PIN_STATE_PINNED,
        PinState::Unpinned => CloudFilters::CF_PIN_STATE_UNPINNED,
        PinState::Excluded => CloudFilters::CF_PIN_STATE_EXCLUDED,
        PinState::Inherit => CloudFilters::CF_PIN_STATE_INHERIT,
    }
}

fn pin_state_from_raw(state: CF_PIN_STATE) -> PinState {
    match state {
        CloudFilters::CF_PIN_STATE_PINNED => PinState::Pinned,
        CloudFilters::CF_PIN_STATE_UNPINNED => PinState::Unpinned,
        CloudFilters::CF_PIN_STATE_EXCLUDED => PinState::Excluded,
        CloudFilters::CF_PIN_STATE_INHERIT => PinState::Inherit,
        _ => PinState::Unspecified,
    }
}

impl PlaceholderStore for WindowsCloud {
    fn create(&self, parent: &Path, specs: &[PlaceholderSpec]) -> Result<()> {
        if specs.is_empty() {
            return Ok(());
        }
        let names: Vec<U16CString> = specs
            .iter()
            .map(|spec| wide_path(&spec.relative_name))
            .collect::<Result<_>>()?;
        let mut infos: Vec<CF_PLACEHOLDER_CREATE_INFO> = specs
            .iter()
            .zip(&names)
            .map(|(spec, name)| create_info_from_spec(spec, name))
            .collect();
        unsafe {
            CfCreatePlaceholders(
                parent.as_os_str(),
                infos.as_mut_ptr(),
                infos.len() as u32,
                CF_CREATE_FLAGS(0),
                std::ptr::null_mut(),
            )
        }
        .map_err(|e| map_win_error(parent, e))?;
        for (info, spec) in infos.iter().zip(specs) {
            if let Err(error) = info.Result.ok() {
                tracing::warn!(
                    name = %spec.relative_name.display(),
                    %error,
                    "placeholder creation skipped"
                );
            }
        }
        Ok(())
    }

    fn convert(&self, path: &Path, options: ConvertOptions) -> Result<()> {
        let handle = OplockHandle::open(path, true)?;
        let mut flags = CF_CONVERT_FLAGS(0);
        if options.mark_in_sync {
            flags |= CloudFilters::CF_CONVERT_FLAG_MARK_IN_SYNC;
        }
        if options.on_demand_children && path.is_dir() {
            flags |= CloudFilters::CF_CONVERT_FLAG_ENABLE_ON_DEMAND_POPULATION;
        }
        unsafe {
            CfConvertToPlaceholder(
                handle.0,
                (!options.identity.is_empty()).then_some(options.identity.as_ptr() as *const _),
                options.identity.len() as u32,
                flags,
                None,
                None,
            )
        }
        .map_err(|e| map_win_error(path, e))
    }

    fn hydrate(&self, path: &Path) -> Result<()> {
        let handle = OplockHandle::open(path, false)?;
        unsafe {
            CfHydratePlaceholder(handle.0, 0, -1, CloudFilters::CF_HYDRATE_FLAG_NONE, None)
        }
        .map_err(|e| map_win_error(path, e))
    }

    fn dehydrate(&self, path: &Path) -> Result<()> {
        let handle = OplockHandle::open(path, true)?;
        unsafe {
            CfDehydratePlaceholder(handle.0, 0, -1, CloudFilters::CF_DEHYDRATE_FLAG_NONE, None)
        }
        .map_err(|e| map_win_error(path, e))
    }

    fn revert(&self, path: &Path) -> Result<()> {
        let handle = OplockHandle::open(path, true)?;
        unsafe { CfRevertPlaceholder(handle.0, CloudFilters::CF_REVERT_FLAG_NONE, None) }
            .map_err(|e| map_win_error(path, e))
    }

    fn set_in_sync(&self, path: &Path, in_sync: bool) -> Result<()> {
        let handle = OplockHandle::open(path, false)?;
        unsafe {
            CfSetInSyncState(
                handle.0,
                if in_sync {
                    CloudFilters::CF_IN_SYNC_STATE_IN_SYNC
                } else {
                    CloudFilters::CF_IN_SYNC_STATE_NOT_IN_SYNC
                },
                CloudFilters::CF_SET_IN_SYNC_FLAG_NONE,
                None,
            )
        }
        .map_err(|e| map_win_error(path, e))
    }

    fn set_pin_state(&self, path: &Path, state: PinState, recursive: bool) -> Result<()> {
        let handle = OplockHandle::open(path, false)?;
        let flags = if recursive {
            CloudFilters::CF_SET_PIN_FLAG_RECURSE
        } else {
            CloudFilters::CF_SET_PIN_FLAG_NONE
        };
        unsafe { CfSetPinState(handle.0, pin_state_raw(state), flags, None) }
            .map_err(|e| map_win_error(path, e))
    }

    fn update(&self, path: &Path, options: UpdateOptions) -> Result<()> {
        let handle = OplockHandle::open(path, true)?;
        let mut flags = CF_UPDATE_FLAGS(0);
        let metadata = options.metadata.map(|m| fs_metadata(&m));
        if let Some(in_sync) = options.mark_in_sync {
            flags |= if in_sync {
                CloudFilters::CF_UPDATE_FLAG_MARK_IN_SYNC
            } else {
                CloudFilters::CF_UPDATE_FLAG_CLEAR_IN_SYNC
            };
        }
        // Both population flags are applied unconditionally so a disable
        // cannot leave the partial bit behind.
        match options.on_demand_children {
            Some(true) => flags |= CloudFilters::CF_UPDATE_FLAG_ENABLE_ON_DEMAND_POPULATION,
            Some(false) => flags |= CloudFilters::CF_UPDATE_FLAG_DISABLE_ON_DEMAND_POPULATION,
            None => {}
        }
        let dehydrate_ranges: Vec<CF_FILE_RANGE> = if options.invalidate_data {
            vec![CF_FILE_RANGE {
                StartingOffset: 0,
                Length: -1,
            }]
        } else {
            Vec::new()
        };
        unsafe {
            CfUpdatePlaceholder(
                handle.0,
                metadata.as_ref().map(|m| m as *const _),
                options
                    .identity
                    .as_ref()
                    .filter(|blob| !blob.is_empty())
                    .map(|blob| blob.as_ptr() as *const _),
                options.identity.as_ref().map_or(0, |blob| blob.len() as u32),
                (!dehydrate_ranges.is_empty()).then_some(dehydrate_ranges.as_slice()),
                flags,
                None,
                None,
            )
        }
        .map_err(|e| map_win_error(path, e))
    }

    fn read(&self, path: &Path) -> Result<Option<PlaceholderState>> {
        let handle = OplockHandle::open(path, false)?;
        let mut data =
            vec![0u8; mem::size_of::<CF_PLACEHOLDER_STANDARD_INFO>() + MAX_IDENTITY_LEN];
        let mut returned = MaybeUninit::<u32>::zeroed();
        let read = unsafe {
            CfGetPlaceholderInfo(
                handle.0,
                CloudFilters::CF_PLACEHOLDER_INFO_STANDARD,
                data.as_mut_ptr() as *mut _,
                data.len() as u32,
                Some(returned.as_mut_ptr()),
            )
        };
        if let Err(error) = read {
            if error.code() == Foundation::ERROR_NOT_A_CLOUD_FILE.to_hresult() {
                return Ok(None);
            }
            return Err(map_win_error(path, error));
        }
        let returned = unsafe { returned.assume_init() } as usize;
        let info = unsafe { &*(data.as_ptr() as *const CF_PLACEHOLDER_STANDARD_INFO) };

        let metadata = std::fs::metadata(path)?;
        let wide = wide_path(path)?;
        let attributes = unsafe { GetFileAttributesW(PCWSTR(wide.as_ptr())) };
        let on_demand = attributes & FILE_ATTRIBUTE_RECALL_ON_DATA_ACCESS.0 != 0;

        let size = if metadata.is_dir() { 0 } else { metadata.len() };
        let on_disk = info.OnDiskDataSize.max(0) as u64;
        let identity_offset = mem::size_of::<CF_PLACEHOLDER_STANDARD_INFO>();
        let identity = data[identity_offset..returned.max(identity_offset)].to_vec();

        Ok(Some(PlaceholderState {
            pin_state: pin_state_from_raw(info.PinState),
            in_sync: info.InSyncState == CloudFilters::CF_IN_SYNC_STATE_IN_SYNC,
            partial: if metadata.is_dir() {
                on_demand
            } else {
                on_disk < size
            },
            size,
            on_disk_data_size: on_disk,
            identity,
            directory: metadata.is_dir(),
        }))
    }
}
