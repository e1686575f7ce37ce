//! Sync-root lifecycle against the storage provider manager, plus the
//! keyed-reply half of the backend.

use std::{
    path::Path,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use widestring::U16CString;
use windows::{
    core::{HSTRING, PCWSTR},
    Storage::{
        Provider::{
            StorageProviderHydrationPolicy, StorageProviderHydrationPolicyModifier,
            StorageProviderInSyncPolicy, StorageProviderPopulationPolicy,
            StorageProviderProtectionMode, StorageProviderSyncRootInfo,
            StorageProviderSyncRootManager,
        },
        StorageFolder,
        Streams::DataWriter,
    },
    Win32::Storage::{
        CloudFilters::{
            self, CfConnectSyncRoot, CfDisconnectSyncRoot, CfUpdateSyncProviderStatus,
            CF_CALLBACK_REGISTRATION, CF_CONNECTION_KEY, CF_SYNC_PROVIDER_STATUS,
        },
        FileSystem::{MoveFileExW, MOVEFILE_DELAY_UNTIL_REBOOT},
    },
};

use crate::{
    error::{Result, SyncError, SyncErrorKind},
    events::ProviderStatus,
    kernel::{ConnectionHandle, KernelTransfer, PlaceholderSpec, SyncFilter, SyncRootRegistrar,
        TransferKeys},
    root::RootRegistration,
};

use super::{command, filter::{callback_table, ConnectionContext}};

/// One live kernel connection. The callback table and context must stay
/// alive until disconnect; the leaked weak is reclaimed there.
struct ConnectionState {
    _context: Arc<ConnectionContext>,
    _callbacks: Box<[CF_CALLBACK_REGISTRATION]>,
    raw_context: usize,
}

/// The Cloud Filter API backend.
pub struct WindowsCloud {
    self_ref: Weak<WindowsCloud>,
    connection: Mutex<Option<ConnectionState>>,
    connection_key: Mutex<Option<i64>>,
}

impl WindowsCloud {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            connection: Mutex::new(None),
            connection_key: Mutex::new(None),
        })
    }
}

fn win_err(context: &str, error: windows::core::Error) -> SyncError {
    SyncError::Unsuccessful(format!("{context}: {error}"))
}

fn provider_status_raw(status: ProviderStatus) -> CF_SYNC_PROVIDER_STATUS {
    match status {
        ProviderStatus::Disabled => CloudFilters::CF_PROVIDER_STATUS_TERMINATED,
        ProviderStatus::AuthenticationRequired => CloudFilters::CF_PROVIDER_STATUS_ERROR,
        ProviderStatus::Disconnected => CloudFilters::CF_PROVIDER_STATUS_DISCONNECTED,
        ProviderStatus::Connecting => CloudFilters::CF_PROVIDER_STATUS_POPULATE_NAMESPACE,
        ProviderStatus::Connected | ProviderStatus::Idle => CloudFilters::CF_PROVIDER_STATUS_IDLE,
        ProviderStatus::Syncing => CloudFilters::CF_PROVIDER_STATUS_SYNC_FULL,
    }
}

impl SyncRootRegistrar for WindowsCloud {
    fn register(&self, root: &Path, registration: &RootRegistration) -> Result<()> {
        let info = StorageProviderSyncRootInfo::new().map_err(|e| win_err("sync root info", e))?;
        let apply = || -> windows::core::Result<()> {
            info.SetId(&HSTRING::from(&registration.id))?;
            info.SetDisplayNameResource(&HSTRING::from(&registration.display_name))?;
            info.SetIconResource(&HSTRING::from(&registration.icon))?;
            if let Some(version) = &registration.version {
                info.SetVersion(&HSTRING::from(version))?;
            }
            info.SetProtectionMode(StorageProviderProtectionMode::Unknown)?;
            info.SetHydrationPolicy(StorageProviderHydrationPolicy::Progressive)?;
            info.SetHydrationPolicyModifier(StorageProviderHydrationPolicyModifier::None)?;
            info.SetPopulationPolicy(StorageProviderPopulationPolicy::Full)?;
            info.SetInSyncPolicy(StorageProviderInSyncPolicy::Default)?;
            info.SetPath(
                &StorageFolder::GetFolderFromPathAsync(&HSTRING::from(root.as_os_str()))?.get()?,
            )?;
            if let Some(blob) = &registration.blob {
                let writer = DataWriter::new()?;
                writer.WriteBytes(blob)?;
                info.SetContext(&writer.DetachBuffer()?)?;
            }
            StorageProviderSyncRootManager::Register(&info)
        };
        apply().map_err(|e| win_err("register sync root", e))
    }

    fn is_registered(&self, id: &str) -> bool {
        let target = HSTRING::from(id);
        StorageProviderSyncRootManager::GetCurrentSyncRoots()
            .map(|roots| {
                roots
                    .into_iter()
                    .any(|root| root.Id().map(|i| i == target).unwrap_or(false))
            })
            .unwrap_or(false)
    }

    fn connect(&self, root: &Path, filter: Arc<dyn SyncFilter>) -> Result<ConnectionHandle> {
        let transfer: Weak<dyn KernelTransfer> = {
            let strong = self
                .self_ref
                .upgrade()
                .ok_or_else(|| SyncError::Unsuccessful("backend dropped".into()))?;
            let strong: Arc<dyn KernelTransfer> = strong;
            Arc::downgrade(&strong)
        };
        let context = Arc::new(ConnectionContext {
            filter: Arc::downgrade(&filter),
            transfer,
        });
        let callbacks: Box<[CF_CALLBACK_REGISTRATION]> = Box::new(callback_table());
        let raw_context = Weak::into_raw(Arc::downgrade(&context)) as usize;

        let key = unsafe {
            CfConnectSyncRoot(
                root.as_os_str(),
                callbacks.as_ptr(),
                raw_context as *const std::ffi::c_void,
                CloudFilters::CF_CONNECT_FLAG_REQUIRE_FULL_FILE_PATH
                    | CloudFilters::CF_CONNECT_FLAG_REQUIRE_PROCESS_INFO,
            )
        }
        .map_err(|e| win_err("connect sync root", e))?;

        *self.connection.lock() = Some(ConnectionState {
            _context: context,
            _callbacks: callbacks,
            raw_context,
        });
        *self.connection_key.lock() = Some(key.0);
        Ok(ConnectionHandle::new(key.0))
    }

    fn disconnect(&self, handle: ConnectionHandle) -> Result<()> {
        unsafe { CfDisconnectSyncRoot(CF_CONNECTION_KEY(handle.key())) }
            .map_err(|e| win_err("disconnect sync root", e))?;
        *self.connection_key.lock() = None;
        if let Some(state) = self.connection.lock().take() {
            // Reclaim the weak leaked into the callback context.
            drop(unsafe {
                Weak::from_raw(state.raw_context as *const ConnectionContext)
            });
        }
        Ok(())
    }

    fn unregister(&self, id: &str) -> Result<()> {
        StorageProviderSyncRootManager::Unregister(&HSTRING::from(id))
            .map_err(|e| win_err("unregister sync root", e))
    }

    fn set_provider_status(&self, status: ProviderStatus) -> Result<()> {
        let Some(key) = *self.connection_key.lock() else {
            return Ok(());
        };
        unsafe { CfUpdateSyncProviderStatus(CF_CONNECTION_KEY(key), provider_status_raw(status)) }
            .map_err(|e| win_err("provider status", e))
    }

    fn schedule_removal_on_reboot(&self, path: &Path) -> Result<()> {
        let wide = U16CString::from_os_str(path.as_os_str())
            .map_err(|e| SyncError::InvalidRequest(format!("path {}: {e}", path.display())))?;
        unsafe { MoveFileExW(PCWSTR(wide.as_ptr()), PCWSTR::null(), MOVEFILE_DELAY_UNTIL_REBOOT) }
            .map_err(|e| win_err("schedule reboot removal", e))
    }
}

impl KernelTransfer for WindowsCloud {
    fn transfer_data(&self, keys: TransferKeys, offset: u64, data: &[u8]) -> Result<()> {
        command::transfer_data(keys, offset, data)
    }

    fn fail_data(&self, keys: TransferKeys, status: SyncErrorKind) -> Result<()> {
        command::fail_data(keys, status)
    }

    fn transfer_placeholders(
        &self,
        keys: TransferKeys,
        _parent: &Path,
        specs: Vec<PlaceholderSpec>,
    ) -> Result<()> {
        command::transfer_placeholders(keys, specs)
    }

    fn fail_placeholders(&self, keys: TransferKeys, status: SyncErrorKind) -> Result<()> {
        command::fail_placeholders(keys, status)
    }

    fn ack_delete(
        &self,
        keys: TransferKeys,
        status: std::result::Result<(), SyncErrorKind>,
    ) -> Result<()> {
        command::ack_delete(keys, status)
    }

    fn ack_rename(
        &self,
        keys: TransferKeys,
        status: std::result::Result<(), SyncErrorKind>,
    ) -> Result<()> {
        command::ack_rename(keys, status)
    }

    fn report_progress(&self, keys: TransferKeys, total: u64, completed: u64) -> Result<()> {
        command::report_progress(keys, total, completed)
    }
}
