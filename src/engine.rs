//! The engine facade.
//!
//! All mutable state shared between components lives here: the callback
//! gate, the in-flight fetch registry, the identity retention and byte-URL
//! caches, the gateway task map, the restore queue and the lifecycle
//! tokens. Component behavior is implemented on [`SyncEngine`] from the
//! component modules.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64},
        Arc, Weak,
    },
    time::SystemTime,
};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch, Notify, Semaphore};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use url::Url;

use crate::{
    config::SyncConfig,
    error::{Result, SyncError},
    events::{ProviderStatus, SyncEvent},
    fetch::{FetchEntry, FetchId},
    gate::CallbackGate,
    gateway::OpKind,
    kernel::{KernelTransfer, PlaceholderStore, SyncRootRegistrar},
    reconcile::PathExclusions,
    remote::{HostId, ObjectStore, RemotePath},
};

pub struct SyncEngine {
    self_ref: Weak<SyncEngine>,
    pub(crate) config: SyncConfig,
    pub(crate) host: HostId,
    pub(crate) root_path: PathBuf,

    pub(crate) store: Arc<dyn PlaceholderStore>,
    pub(crate) registrar: Arc<dyn SyncRootRegistrar>,
    pub(crate) remote: Arc<dyn ObjectStore>,

    pub(crate) http: reqwest::Client,
    pub(crate) runtime: tokio::runtime::Handle,

    pub(crate) gate: CallbackGate,
    pub(crate) fetches: Mutex<HashMap<FetchId, FetchEntry>>,
    pub(crate) fetch_sequence: AtomicU64,
    pub(crate) fetch_tasks: TaskTracker,

    /// Identity blobs handed to the kernel, kept alive past the reply so a
    /// late kernel read never dereferences freed bytes.
    pub(crate) retained_identities: moka::sync::Cache<PathBuf, Arc<Vec<u8>>>,
    /// Byte-serving URLs, one per path, dropped at end-of-file or error.
    pub(crate) byte_urls: moka::sync::Cache<PathBuf, Url>,

    /// Paths whose server delete was refused; reinstated on the delete
    /// completion callback.
    pub(crate) restore_queue: Mutex<HashSet<PathBuf>>,

    pub(crate) active_ops: Mutex<HashMap<PathBuf, OpKind>>,
    pub(crate) ops_changed: Notify,
    pub(crate) upload_slots: Arc<Semaphore>,

    /// Optimistic in-sync cache; see `read_placeholder`'s `reload` flag.
    pub(crate) in_sync_cache: Mutex<HashMap<PathBuf, bool>>,

    pub(crate) reconcile_active: AtomicBool,
    pub(crate) path_exclusions: PathExclusions,
    pub(crate) process_exclusions: GlobSet,

    pub(crate) shutdown: CancellationToken,
    pub(crate) change_cursor: Mutex<SystemTime>,

    pub(crate) events: broadcast::Sender<SyncEvent>,
    pub(crate) status_tx: watch::Sender<ProviderStatus>,
}

impl SyncEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn host(&self) -> &HostId {
        &self.host
    }

    /// Subscribes to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Watches the coarse provider status.
    pub fn status(&self) -> watch::Receiver<ProviderStatus> {
        self.status_tx.subscribe()
    }

    /// A strong handle to this engine, for spawned work and slot guards.
    pub(crate) fn arc(&self) -> Arc<SyncEngine> {
        self.self_ref.upgrade().expect("engine self reference")
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn set_status(&self, status: ProviderStatus) {
        self.status_tx.send_replace(status);
        if let Err(error) = self.registrar.set_provider_status(status) {
            tracing::debug!(?status, %error, "provider status update failed");
        }
    }

    /// Path of `local` relative to the sync root.
    pub(crate) fn relative_of(&self, local: &Path) -> Result<PathBuf> {
        local
            .strip_prefix(&self.root_path)
            .map(Path::to_path_buf)
            .map_err(|_| {
                SyncError::InvalidRequest(format!(
                    "{} is outside the sync root",
                    local.display()
                ))
            })
    }

    pub(crate) fn remote_path_of(&self, local: &Path) -> Result<RemotePath> {
        Ok(RemotePath::from_relative(&self.relative_of(local)?))
    }

    pub(crate) fn local_path_of(&self, remote: &RemotePath) -> PathBuf {
        self.root_path.join(remote.to_relative())
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("root", &self.root_path)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

/// Builds a [`SyncEngine`].
///
/// The kernel seam accepts either one backend implementing all three
/// kernel traits or the three pieces individually.
#[derive(Default)]
pub struct EngineBuilder {
    config: SyncConfig,
    host: Option<HostId>,
    root: Option<PathBuf>,
    remote: Option<Arc<dyn ObjectStore>>,
    store: Option<Arc<dyn PlaceholderStore>>,
    registrar: Option<Arc<dyn SyncRootRegistrar>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn host(mut self, host: HostId) -> Self {
        self.host = Some(host);
        self
    }

    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn remote(mut self, remote: Arc<dyn ObjectStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// A single backend covering the whole kernel seam. The transfer half
    /// of the seam stays with the backend: it mints the reply tickets its
    /// callbacks carry.
    pub fn kernel<K>(mut self, kernel: Arc<K>) -> Self
    where
        K: PlaceholderStore + KernelTransfer + SyncRootRegistrar,
    {
        self.store = Some(kernel.clone());
        self.registrar = Some(kernel);
        self
    }

    pub fn placeholder_store(mut self, store: Arc<dyn PlaceholderStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registrar(mut self, registrar: Arc<dyn SyncRootRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    /// Must be called from within a tokio runtime; the engine captures the
    /// handle to re-enter it from kernel-owned callback threads.
    pub fn build(self) -> Result<Arc<SyncEngine>> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            SyncError::Unsuccessful("the engine must be built inside a tokio runtime".into())
        })?;
        let missing =
            |what: &str| SyncError::InvalidRequest(format!("engine builder is missing {what}"));

        let config = self.config;
        let process_exclusions = build_globs(&config.excluded_processes)?;
        let path_exclusions = PathExclusions::new(&config.excluded_paths)?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| SyncError::Unsuccessful(format!("http client: {e}")))?;
        let (events, _) = broadcast::channel(256);
        let (status_tx, _) = watch::channel(ProviderStatus::Disconnected);

        let host = self.host.ok_or_else(|| missing("a host id"))?;
        let root_path = self.root.ok_or_else(|| missing("a root path"))?;
        let remote = self.remote.ok_or_else(|| missing("an object store"))?;
        let store = self.store.ok_or_else(|| missing("a placeholder store"))?;
        let registrar = self.registrar.ok_or_else(|| missing("a registrar"))?;

        Ok(Arc::new_cyclic(|self_ref| SyncEngine {
            self_ref: self_ref.clone(),
            retained_identities: moka::sync::Cache::builder()
                .time_to_live(config.identity_retention)
                .build(),
            byte_urls: moka::sync::Cache::builder()
                .max_capacity(config.url_cache_capacity)
                .build(),
            upload_slots: Arc::new(Semaphore::new(config.upload_pool_size)),
            host,
            root_path,
            remote,
            store,
            registrar,
            http,
            runtime,
            gate: CallbackGate::new(),
            fetches: Mutex::new(HashMap::new()),
            fetch_sequence: AtomicU64::new(0),
            fetch_tasks: TaskTracker::new(),
            restore_queue: Mutex::new(HashSet::new()),
            active_ops: Mutex::new(HashMap::new()),
            ops_changed: Notify::new(),
            in_sync_cache: Mutex::new(HashMap::new()),
            reconcile_active: AtomicBool::new(false),
            path_exclusions,
            process_exclusions,
            shutdown: CancellationToken::new(),
            change_cursor: Mutex::new(SystemTime::now()),
            events,
            status_tx,
            config,
        }))
    }
}

fn build_globs(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| SyncError::InvalidRequest(format!("bad glob {pattern:?}: {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| SyncError::InvalidRequest(format!("glob set: {e}")))
}
