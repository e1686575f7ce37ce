//! The seam between the engine core and the operating system's cloud-files
//! placeholder subsystem.
//!
//! Everything the engine asks of the kernel goes through three narrow
//! traits: [`PlaceholderStore`] for on-disk placeholder operations,
//! [`KernelTransfer`] for keyed replies to in-flight callbacks, and
//! [`SyncRootRegistrar`] for sync-root lifecycle. Callbacks enter through
//! [`SyncFilter`]; replies leave through the [`ticket`] structs.
//!
//! Two backends ship: [`windows`] binds the real Cloud Filter API and only
//! compiles on Windows; [`memory`] is an in-process placeholder table used
//! by the test suite and for development on other platforms.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use crate::{
    error::{Result, SyncErrorKind},
    events::ProviderStatus,
    root::RootRegistration,
};

pub mod memory;
pub mod ticket;

#[cfg(target_os = "windows")]
pub mod windows;

pub type RawConnectionKey = i64;
pub type RawTransferKey = i64;

/// Identifies one in-flight kernel callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferKeys {
    pub connection: RawConnectionKey,
    pub transfer: RawTransferKey,
}

/// The pin state of a placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PinState {
    /// The platform decides freely.
    #[default]
    Unspecified,
    /// Must be stored locally; never chosen for dehydration.
    Pinned,
    /// May be dehydrated at any time.
    Unpinned,
    /// Never synced; invisible to the engine's own transfers.
    Excluded,
    /// Inherits the parent's pin state.
    Inherit,
}

/// File system metadata carried by a placeholder.
#[derive(Debug, Clone, Copy)]
pub struct PlaceholderMetadata {
    pub size: u64,
    pub created: SystemTime,
    pub modified: SystemTime,
    pub accessed: SystemTime,
    pub changed: SystemTime,
    pub directory: bool,
}

impl PlaceholderMetadata {
    pub fn file() -> Self {
        Self {
            size: 0,
            created: SystemTime::UNIX_EPOCH,
            modified: SystemTime::UNIX_EPOCH,
            accessed: SystemTime::UNIX_EPOCH,
            changed: SystemTime::UNIX_EPOCH,
            directory: false,
        }
    }

    pub fn directory() -> Self {
        Self {
            directory: true,
            ..Self::file()
        }
    }

    pub fn size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn modified(mut self, time: SystemTime) -> Self {
        self.modified = time;
        self.changed = time;
        self
    }

    pub fn created(mut self, time: SystemTime) -> Self {
        self.created = time;
        self
    }

    pub fn accessed(mut self, time: SystemTime) -> Self {
        self.accessed = time;
        self
    }
}

/// One placeholder to materialize under a parent directory.
#[derive(Debug, Clone)]
pub struct PlaceholderSpec {
    /// Name of the entry under the parent (a single component).
    pub relative_name: PathBuf,
    pub metadata: PlaceholderMetadata,
    /// Serialized identity blob (bounded; enforced by the engine).
    pub identity: Vec<u8>,
    /// Created already marked in sync.
    pub in_sync: bool,
    /// Directories only: enumerate lazily on first access.
    pub on_demand_children: bool,
    /// Supersede an existing entry of the same name.
    pub overwrite: bool,
}

impl PlaceholderSpec {
    pub fn new(name: impl Into<PathBuf>, metadata: PlaceholderMetadata) -> Self {
        Self {
            relative_name: name.into(),
            metadata,
            identity: Vec::new(),
            in_sync: false,
            on_demand_children: metadata.directory,
            overwrite: false,
        }
    }

    pub fn identity(mut self, blob: Vec<u8>) -> Self {
        self.identity = blob;
        self
    }

    pub fn mark_in_sync(mut self) -> Self {
        self.in_sync = true;
        self
    }

    pub fn overwrite(mut self) -> Self {
        self.overwrite = true;
        self
    }
}

/// Parameters for converting a regular file or directory into a
/// placeholder.
#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    /// The current local bytes are authoritative for the recorded version.
    pub mark_in_sync: bool,
    pub identity: Vec<u8>,
    /// Directories only: enumerate lazily from now on.
    pub on_demand_children: bool,
}

/// Parameters for updating placeholder metadata in place.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub metadata: Option<PlaceholderMetadata>,
    pub identity: Option<Vec<u8>>,
    pub mark_in_sync: Option<bool>,
    /// Drop the whole on-disk byte range (`[0, size)`).
    pub invalidate_data: bool,
    /// Directories only: toggle lazy enumeration.
    pub on_demand_children: Option<bool>,
}

/// A snapshot of a placeholder as the kernel sees it.
#[derive(Debug, Clone)]
pub struct PlaceholderState {
    pub pin_state: PinState,
    pub in_sync: bool,
    /// Data (files) or child listing (directories) not fully present.
    pub partial: bool,
    pub size: u64,
    pub on_disk_data_size: u64,
    pub identity: Vec<u8>,
    pub directory: bool,
}

/// On-disk placeholder operations.
///
/// Paths are absolute. `read` returns `None` for a path that exists but is
/// not a placeholder; every mutating operation fails with
/// `SyncError::NotACloudFile` in that case.
pub trait PlaceholderStore: Send + Sync + 'static {
    /// Materializes a batch of placeholders under `parent`.
    fn create(&self, parent: &Path, specs: &[PlaceholderSpec]) -> Result<()>;

    fn convert(&self, path: &Path, options: ConvertOptions) -> Result<()>;

    /// Ensures the full byte range is present locally. Blocks until the
    /// provider has answered the resulting fetch callback.
    fn hydrate(&self, path: &Path) -> Result<()>;

    /// Drops local bytes, keeping the placeholder.
    fn dehydrate(&self, path: &Path) -> Result<()>;

    /// Turns the placeholder back into a regular file.
    fn revert(&self, path: &Path) -> Result<()>;

    fn set_in_sync(&self, path: &Path, in_sync: bool) -> Result<()>;

    fn set_pin_state(&self, path: &Path, state: PinState, recursive: bool) -> Result<()>;

    fn update(&self, path: &Path, options: UpdateOptions) -> Result<()>;

    fn read(&self, path: &Path) -> Result<Option<PlaceholderState>>;
}

/// Keyed replies to in-flight callbacks.
pub trait KernelTransfer: Send + Sync + 'static {
    /// Delivers one data chunk for a fetch callback.
    fn transfer_data(&self, keys: TransferKeys, offset: u64, data: &[u8]) -> Result<()>;

    /// Terminates a fetch callback with zero bytes and the given status.
    fn fail_data(&self, keys: TransferKeys, status: SyncErrorKind) -> Result<()>;

    /// Answers an enumeration callback with the full child list.
    fn transfer_placeholders(
        &self,
        keys: TransferKeys,
        parent: &Path,
        specs: Vec<PlaceholderSpec>,
    ) -> Result<()>;

    /// Terminates an enumeration callback with an empty list.
    fn fail_placeholders(&self, keys: TransferKeys, status: SyncErrorKind) -> Result<()>;

    fn ack_delete(&self, keys: TransferKeys, status: Result<(), SyncErrorKind>) -> Result<()>;

    fn ack_rename(&self, keys: TransferKeys, status: Result<(), SyncErrorKind>) -> Result<()>;

    /// Reports `(completed, total)` to the provider-progress endpoint.
    fn report_progress(&self, keys: TransferKeys, total: u64, completed: u64) -> Result<()>;
}

/// Opaque handle for a connected sync root.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub(crate) key: RawConnectionKey,
}

impl ConnectionHandle {
    pub fn new(key: RawConnectionKey) -> Self {
        Self { key }
    }

    pub fn key(&self) -> RawConnectionKey {
        self.key
    }
}

/// Sync-root lifecycle operations.
pub trait SyncRootRegistrar: Send + Sync + 'static {
    /// Registers the sync root. Idempotent.
    fn register(&self, root: &Path, registration: &RootRegistration) -> Result<()>;

    fn is_registered(&self, id: &str) -> bool;

    /// Attaches the callback table; the registrar holds the filter weakly.
    fn connect(&self, root: &Path, filter: Arc<dyn SyncFilter>) -> Result<ConnectionHandle>;

    fn disconnect(&self, handle: ConnectionHandle) -> Result<()>;

    fn unregister(&self, id: &str) -> Result<()>;

    fn set_provider_status(&self, status: ProviderStatus) -> Result<()>;

    /// Schedules a tombstone for deletion at next reboot.
    fn schedule_removal_on_reboot(&self, path: &Path) -> Result<()>;
}

/// Byte range requested by a fetch callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRange {
    pub offset: u64,
    pub length: u64,
}

/// Information about the user process that triggered a callback.
#[derive(Debug, Clone, Default)]
pub struct ProcessInfo {
    /// Absolute path of the process image, when the kernel reported one.
    pub image_path: Option<PathBuf>,
}

/// A translated kernel callback: normalized absolute path plus the keys
/// and identity needed to answer it.
#[derive(Debug, Clone)]
pub struct Request {
    path: PathBuf,
    keys: TransferKeys,
    identity: Vec<u8>,
    file_size: u64,
    process: ProcessInfo,
}

impl Request {
    pub fn new(
        path: PathBuf,
        keys: TransferKeys,
        identity: Vec<u8>,
        file_size: u64,
        process: ProcessInfo,
    ) -> Self {
        Self {
            path,
            keys,
            identity,
            file_size,
            process,
        }
    }

    /// Absolute local path of the placeholder being operated on.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn keys(&self) -> TransferKeys {
        self.keys
    }

    /// Identity blob attached to the placeholder.
    pub fn identity(&self) -> &[u8] {
        &self.identity
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn process(&self) -> &ProcessInfo {
        &self.process
    }
}

/// The ten kernel callbacks a provider answers.
///
/// `Send` and `Sync` are required: callbacks arrive on kernel-owned
/// threads and must return quickly, so implementations offload anything
/// non-trivial onto their own pool.
pub trait SyncFilter: Send + Sync + 'static {
    /// A directory enumeration needs its child placeholders.
    fn fetch_placeholders(
        &self,
        request: Request,
        ticket: ticket::FetchPlaceholders,
        pattern: Option<String>,
    );

    fn cancel_fetch_placeholders(&self, request: Request);

    /// A placeholder needs bytes for the given range.
    fn fetch_data(&self, request: Request, ticket: ticket::FetchData, range: FetchRange);

    fn cancel_fetch_data(&self, request: Request, range: FetchRange);

    fn opened(&self, request: Request);

    fn closed(&self, request: Request, modified: bool, deleted: bool);

    /// Pre-delete; must answer through the ticket.
    fn delete(&self, request: Request, ticket: ticket::Delete, is_directory: bool);

    fn deleted(&self, request: Request);

    /// Pre-rename; must answer through the ticket.
    fn rename(&self, request: Request, ticket: ticket::Rename, target: PathBuf, is_directory: bool);

    fn renamed(&self, request: Request, source: PathBuf);
}
