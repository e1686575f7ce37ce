//! In-process placeholder backend.
//!
//! Keeps the placeholder table in memory while materializing entries as
//! real files and directories, so the engine above it walks a genuine
//! tree. Hydration and enumeration loop back into the connected
//! [`SyncFilter`], which makes the whole callback path exercisable without
//! a kernel. This backend drives the test suite and development builds on
//! platforms without a cloud-files subsystem; it is not a placeholder
//! port.

use std::{
    collections::{HashMap, HashSet},
    fs::{self, OpenOptions},
    io::{Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicI64, Ordering},
        mpsc, Arc, Weak,
    },
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    error::{Result, SyncError, SyncErrorKind},
    events::ProviderStatus,
    kernel::{
        ticket, ConnectionHandle, ConvertOptions, FetchRange, KernelTransfer, PinState,
        PlaceholderSpec, PlaceholderState, PlaceholderStore, ProcessInfo, RawTransferKey, Request,
        SyncFilter, SyncRootRegistrar, TransferKeys, UpdateOptions,
    },
    root::RootRegistration,
};

const MEMORY_CONNECTION_KEY: i64 = 1;

#[derive(Debug, Clone)]
struct Entry {
    identity: Vec<u8>,
    pin: PinState,
    in_sync: bool,
    partial: bool,
    size: u64,
    on_disk: u64,
    directory: bool,
}

struct Transfer {
    path: PathBuf,
    end: u64,
    written: u64,
    waiter: Option<mpsc::Sender<std::result::Result<(), SyncErrorKind>>>,
}

/// Which keyed acknowledgment a handler sent back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Delete,
    Rename,
}

#[derive(Debug, Clone, Copy)]
pub struct AckRecord {
    pub keys: TransferKeys,
    pub kind: AckKind,
    pub status: std::result::Result<(), SyncErrorKind>,
}

/// The in-memory cloud-files subsystem.
pub struct MemoryCloud {
    self_ref: Weak<MemoryCloud>,
    entries: Mutex<HashMap<PathBuf, Entry>>,
    transfers: Mutex<HashMap<RawTransferKey, Transfer>>,
    filter: Mutex<Option<Weak<dyn SyncFilter>>>,
    registered: Mutex<HashSet<String>>,
    status: Mutex<ProviderStatus>,
    next_transfer: AtomicI64,
    acks: Mutex<Vec<AckRecord>>,
    progress: Mutex<Vec<(TransferKeys, u64, u64)>>,
    terminals: Mutex<Vec<(TransferKeys, SyncErrorKind)>>,
    reboot_removals: Mutex<Vec<PathBuf>>,
    hydrate_timeout: Duration,
}

impl MemoryCloud {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            entries: Mutex::new(HashMap::new()),
            transfers: Mutex::new(HashMap::new()),
            filter: Mutex::new(None),
            registered: Mutex::new(HashSet::new()),
            status: Mutex::new(ProviderStatus::Disconnected),
            next_transfer: AtomicI64::new(100),
            acks: Mutex::new(Vec::new()),
            progress: Mutex::new(Vec::new()),
            terminals: Mutex::new(Vec::new()),
            reboot_removals: Mutex::new(Vec::new()),
            hydrate_timeout: Duration::from_secs(30),
        })
    }

    fn arc(&self) -> Result<Arc<Self>> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| SyncError::Unsuccessful("backend dropped".into()))
    }

    /// The filter attached by the last `connect`, if still alive.
    pub fn connected_filter(&self) -> Option<Arc<dyn SyncFilter>> {
        self.filter.lock().as_ref().and_then(Weak::upgrade)
    }

    fn mint_keys(&self) -> TransferKeys {
        TransferKeys {
            connection: MEMORY_CONNECTION_KEY,
            transfer: self.next_transfer.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn request_for(&self, path: &Path, keys: TransferKeys, process: ProcessInfo) -> Request {
        let (identity, size) = self
            .entries
            .lock()
            .get(path)
            .map(|e| (e.identity.clone(), e.size))
            .unwrap_or_default();
        Request::new(path.to_path_buf(), keys, identity, size, process)
    }

    /// Starts a kernel-initiated data fetch, as an open of a dehydrated
    /// range would. The caller passes the pieces into the connected
    /// filter.
    pub fn begin_fetch(
        &self,
        path: &Path,
        offset: u64,
        length: u64,
    ) -> Result<(Request, ticket::FetchData, FetchRange)> {
        let keys = self.mint_keys();
        self.transfers.lock().insert(
            keys.transfer,
            Transfer {
                path: path.to_path_buf(),
                end: offset + length,
                written: 0,
                waiter: None,
            },
        );
        let ticket = ticket::FetchData::new(self.arc()?, keys);
        Ok((
            self.request_for(path, keys, ProcessInfo::default()),
            ticket,
            FetchRange { offset, length },
        ))
    }

    /// Starts a directory enumeration issued by the given process image.
    pub fn begin_enumeration(
        &self,
        dir: &Path,
        image: Option<PathBuf>,
    ) -> Result<(Request, ticket::FetchPlaceholders)> {
        let keys = self.mint_keys();
        let ticket = ticket::FetchPlaceholders::new(self.arc()?, keys, dir.to_path_buf());
        let process = ProcessInfo { image_path: image };
        Ok((self.request_for(dir, keys, process), ticket))
    }

    /// Starts a pre-delete callback.
    pub fn begin_delete(&self, path: &Path) -> Result<(Request, ticket::Delete)> {
        let keys = self.mint_keys();
        Ok((
            self.request_for(path, keys, ProcessInfo::default()),
            ticket::Delete::new(self.arc()?, keys),
        ))
    }

    /// Starts a pre-rename callback.
    pub fn begin_rename(&self, path: &Path) -> Result<(Request, ticket::Rename)> {
        let keys = self.mint_keys();
        Ok((
            self.request_for(path, keys, ProcessInfo::default()),
            ticket::Rename::new(self.arc()?, keys),
        ))
    }

    /// Carries placeholder state across a local rename, the way the
    /// kernel moves a placeholder with its file.
    pub fn relocate(&self, from: &Path, to: &Path) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.remove(from) {
            entries.insert(to.to_path_buf(), entry);
        }
    }

    pub fn acks(&self) -> Vec<AckRecord> {
        self.acks.lock().clone()
    }

    pub fn progress_reports(&self) -> Vec<(TransferKeys, u64, u64)> {
        self.progress.lock().clone()
    }

    pub fn terminal_statuses(&self) -> Vec<(TransferKeys, SyncErrorKind)> {
        self.terminals.lock().clone()
    }

    pub fn reboot_removals(&self) -> Vec<PathBuf> {
        self.reboot_removals.lock().clone()
    }

    pub fn provider_status(&self) -> ProviderStatus {
        *self.status.lock()
    }

    fn write_range(&self, path: &Path, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new().write(true).open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }
}

impl PlaceholderStore for MemoryCloud {
    fn create(&self, parent: &Path, specs: &[PlaceholderSpec]) -> Result<()> {
        for spec in specs {
            let path = parent.join(&spec.relative_name);
            let exists = self.entries.lock().contains_key(&path) || path.exists();
            if exists && !spec.overwrite {
                continue;
            }
            // Entry first, file second: a watcher waking between the two
            // must already see a placeholder.
            self.entries.lock().insert(
                path.clone(),
                Entry {
                    identity: spec.identity.clone(),
                    pin: PinState::Unspecified,
                    in_sync: spec.in_sync,
                    partial: if spec.metadata.directory {
                        spec.on_demand_children
                    } else {
                        spec.metadata.size > 0
                    },
                    size: spec.metadata.size,
                    on_disk: 0,
                    directory: spec.metadata.directory,
                },
            );
            let materialized = if spec.metadata.directory {
                fs::create_dir_all(&path)
            } else {
                fs::File::create(&path).and_then(|file| file.set_len(spec.metadata.size))
            };
            if let Err(error) = materialized {
                self.entries.lock().remove(&path);
                return Err(error.into());
            }
        }
        Ok(())
    }

    fn convert(&self, path: &Path, options: ConvertOptions) -> Result<()> {
        let meta = fs::metadata(path)?;
        let size = if meta.is_dir() { 0 } else { meta.len() };
        self.entries.lock().insert(
            path.to_path_buf(),
            Entry {
                identity: options.identity,
                pin: PinState::Unspecified,
                in_sync: options.mark_in_sync,
                partial: meta.is_dir() && options.on_demand_children,
                size,
                on_disk: size,
                directory: meta.is_dir(),
            },
        );
        Ok(())
    }

    fn hydrate(&self, path: &Path) -> Result<()> {
        let (identity, size) = {
            let entries = self.entries.lock();
            let entry = entries
                .get(path)
                .ok_or_else(|| SyncError::NotACloudFile(path.to_path_buf()))?;
            if entry.directory {
                return Err(SyncError::InvalidRequest(
                    "cannot hydrate a directory".into(),
                ));
            }
            if entry.on_disk >= entry.size {
                return Ok(());
            }
            (entry.identity.clone(), entry.size)
        };

        let filter = self
            .connected_filter()
            .ok_or_else(|| SyncError::Unsuccessful("sync root is not connected".into()))?;
        let keys = self.mint_keys();
        let (tx, rx) = mpsc::channel();
        self.transfers.lock().insert(
            keys.transfer,
            Transfer {
                path: path.to_path_buf(),
                end: size,
                written: 0,
                waiter: Some(tx),
            },
        );

        let request = Request::new(
            path.to_path_buf(),
            keys,
            identity,
            size,
            ProcessInfo::default(),
        );
        let ticket = ticket::FetchData::new(self.arc()?, keys);
        filter.fetch_data(
            request,
            ticket,
            FetchRange {
                offset: 0,
                length: size,
            },
        );

        let outcome = rx.recv_timeout(self.hydrate_timeout);
        self.transfers.lock().remove(&keys.transfer);
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(SyncErrorKind::Cancelled)) => Err(SyncError::Cancelled),
            Ok(Err(kind)) => Err(SyncError::Unsuccessful(format!(
                "hydration failed: {kind:?}"
            ))),
            Err(_) => Err(SyncError::Unsuccessful("hydration timed out".into())),
        }
    }

    fn dehydrate(&self, path: &Path) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(path)
            .ok_or_else(|| SyncError::NotACloudFile(path.to_path_buf()))?;
        if entry.directory {
            return Err(SyncError::InvalidRequest(
                "cannot dehydrate a directory".into(),
            ));
        }
        if entry.pin == PinState::Pinned {
            return Err(SyncError::Pinned(path.to_path_buf()));
        }
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(0)?;
        file.set_len(entry.size)?;
        entry.on_disk = 0;
        entry.partial = entry.size > 0;
        Ok(())
    }

    fn revert(&self, path: &Path) -> Result<()> {
        self.entries
            .lock()
            .remove(path)
            .ok_or_else(|| SyncError::NotACloudFile(path.to_path_buf()))?;
        Ok(())
    }

    fn set_in_sync(&self, path: &Path, in_sync: bool) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(path)
            .ok_or_else(|| SyncError::NotACloudFile(path.to_path_buf()))?;
        entry.in_sync = in_sync;
        Ok(())
    }

    fn set_pin_state(&self, path: &Path, state: PinState, recursive: bool) -> Result<()> {
        let mut entries = self.entries.lock();
        if !entries.contains_key(path) {
            return Err(SyncError::NotACloudFile(path.to_path_buf()));
        }
        for (entry_path, entry) in entries.iter_mut() {
            if entry_path == path || (recursive && entry_path.starts_with(path)) {
                entry.pin = state;
            }
        }
        Ok(())
    }

    fn update(&self, path: &Path, options: UpdateOptions) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(path)
            .ok_or_else(|| SyncError::NotACloudFile(path.to_path_buf()))?;
        if let Some(metadata) = options.metadata {
            if !entry.directory && metadata.size != entry.size {
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(metadata.size)?;
                entry.size = metadata.size;
                entry.on_disk = entry.on_disk.min(metadata.size);
            }
        }
        if let Some(identity) = options.identity {
            entry.identity = identity;
        }
        if let Some(in_sync) = options.mark_in_sync {
            entry.in_sync = in_sync;
        }
        if options.invalidate_data && !entry.directory {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(0)?;
            file.set_len(entry.size)?;
            entry.on_disk = 0;
            entry.partial = entry.size > 0;
        }
        if let Some(on_demand) = options.on_demand_children {
            if entry.directory {
                entry.partial = on_demand;
            }
        }
        Ok(())
    }

    fn read(&self, path: &Path) -> Result<Option<PlaceholderState>> {
        match self.entries.lock().get(path) {
            Some(entry) => Ok(Some(PlaceholderState {
                pin_state: entry.pin,
                in_sync: entry.in_sync,
                partial: entry.partial,
                size: entry.size,
                on_disk_data_size: entry.on_disk,
                identity: entry.identity.clone(),
                directory: entry.directory,
            })),
            None => {
                if path.exists() {
                    Ok(None)
                } else {
                    Err(SyncError::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("{} does not exist", path.display()),
                    )))
                }
            }
        }
    }
}

impl KernelTransfer for MemoryCloud {
    fn transfer_data(&self, keys: TransferKeys, offset: u64, data: &[u8]) -> Result<()> {
        let (path, complete, waiter) = {
            let mut transfers = self.transfers.lock();
            let transfer = transfers.get_mut(&keys.transfer).ok_or_else(|| {
                SyncError::InvalidRequest(format!("unknown transfer key {}", keys.transfer))
            })?;
            transfer.written += data.len() as u64;
            let complete = offset + data.len() as u64 >= transfer.end;
            let waiter = if complete { transfer.waiter.take() } else { None };
            (transfer.path.clone(), complete, waiter)
        };

        self.write_range(&path, offset, data)?;

        {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(&path) {
                entry.on_disk = (entry.on_disk + data.len() as u64).min(entry.size);
                if complete && offset + data.len() as u64 >= entry.size {
                    entry.partial = false;
                }
            }
        }
        if complete {
            self.transfers.lock().remove(&keys.transfer);
            if let Some(waiter) = waiter {
                let _ = waiter.send(Ok(()));
            }
        }
        Ok(())
    }

    fn fail_data(&self, keys: TransferKeys, status: SyncErrorKind) -> Result<()> {
        self.terminals.lock().push((keys, status));
        if let Some(transfer) = self.transfers.lock().remove(&keys.transfer) {
            if let Some(waiter) = transfer.waiter {
                let _ = waiter.send(Err(status));
            }
        }
        Ok(())
    }

    fn transfer_placeholders(
        &self,
        keys: TransferKeys,
        parent: &Path,
        specs: Vec<PlaceholderSpec>,
    ) -> Result<()> {
        let _ = keys;
        self.create(parent, &specs)
    }

    fn fail_placeholders(&self, keys: TransferKeys, status: SyncErrorKind) -> Result<()> {
        self.terminals.lock().push((keys, status));
        Ok(())
    }

    fn ack_delete(&self, keys: TransferKeys, status: std::result::Result<(), SyncErrorKind>) -> Result<()> {
        self.acks.lock().push(AckRecord {
            keys,
            kind: AckKind::Delete,
            status,
        });
        Ok(())
    }

    fn ack_rename(&self, keys: TransferKeys, status: std::result::Result<(), SyncErrorKind>) -> Result<()> {
        self.acks.lock().push(AckRecord {
            keys,
            kind: AckKind::Rename,
            status,
        });
        Ok(())
    }

    fn report_progress(&self, keys: TransferKeys, total: u64, completed: u64) -> Result<()> {
        self.progress.lock().push((keys, total, completed));
        Ok(())
    }
}

impl SyncRootRegistrar for MemoryCloud {
    fn register(&self, root: &Path, registration: &RootRegistration) -> Result<()> {
        fs::create_dir_all(root)?;
        self.registered.lock().insert(registration.id.clone());
        Ok(())
    }

    fn is_registered(&self, id: &str) -> bool {
        self.registered.lock().contains(id)
    }

    fn connect(&self, _root: &Path, filter: Arc<dyn SyncFilter>) -> Result<ConnectionHandle> {
        *self.filter.lock() = Some(Arc::downgrade(&filter));
        *self.status.lock() = ProviderStatus::Connected;
        Ok(ConnectionHandle::new(MEMORY_CONNECTION_KEY))
    }

    fn disconnect(&self, _handle: ConnectionHandle) -> Result<()> {
        *self.filter.lock() = None;
        *self.status.lock() = ProviderStatus::Disconnected;
        Ok(())
    }

    fn unregister(&self, id: &str) -> Result<()> {
        self.registered.lock().remove(id);
        Ok(())
    }

    fn set_provider_status(&self, status: ProviderStatus) -> Result<()> {
        *self.status.lock() = status;
        Ok(())
    }

    fn schedule_removal_on_reboot(&self, path: &Path) -> Result<()> {
        self.reboot_removals.lock().push(path.to_path_buf());
        Ok(())
    }
}
