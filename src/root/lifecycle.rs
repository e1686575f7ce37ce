//! Session start and idempotent tear-down.
//!
//! Startup: ensure the root exists → validate registration → register with
//! backoff → connect the callback table → start the watcher and the
//! change-log poller → report idle. Shutdown reverses it: close the gate
//! and drain → stop the watcher → cancel fetches → signal everything →
//! drain fetch tasks → await the poller → disconnect off the calling
//! thread → optionally unregister and delete.

use std::{sync::Arc, time::Duration};

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    dispatcher::Dispatcher,
    engine::SyncEngine,
    error::{Result, SyncError},
    events::ProviderStatus,
    kernel::ConnectionHandle,
    reconcile::ReconcileMode,
    root::{tombstone, RootRegistration},
    watcher::WatcherHandle,
};

const REGISTER_BACKOFF_START: Duration = Duration::from_millis(250);

/// What `stop` leaves behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnregisterMode {
    /// Disconnect only; the registration and files stay.
    Keep,
    /// Remove the registration, keep the local files.
    Unregister,
    /// Remove the registration and delete the root directory.
    UnregisterAndDelete,
}

/// A running sync root: engine plus its attached kernel connection and
/// background loops.
pub struct SyncSession {
    engine: Arc<SyncEngine>,
    // The registrar holds the filter weakly; the session keeps it alive.
    dispatcher: Arc<Dispatcher>,
    registration: RootRegistration,
    connection: Option<ConnectionHandle>,
    watcher: Option<WatcherHandle>,
    poller: Option<tokio::task::JoinHandle<()>>,
    poller_token: CancellationToken,
    stopped: bool,
}

impl SyncSession {
    /// Registers, connects and starts the auxiliary loops.
    pub async fn start(engine: Arc<SyncEngine>, registration: RootRegistration) -> Result<Self> {
        registration.validate()?;
        tokio::fs::create_dir_all(&engine.root_path).await?;

        match tombstone::cleanup_pending_deletes().await {
            Ok(0) => {}
            Ok(swept) => info!(swept, "removed leftover tombstones"),
            Err(error) => warn!(%error, "tombstone sweep failed"),
        }

        engine.set_status(ProviderStatus::Connecting);
        register_with_backoff(&engine, &registration).await?;

        let dispatcher = Dispatcher::new(engine.clone());
        let connection = engine
            .registrar
            .connect(&engine.root_path, dispatcher.clone())?;
        engine.gate.open();

        let watcher = engine.start_watcher()?;
        let poller_token = engine.shutdown.child_token();
        let poller = engine.runtime.spawn({
            let engine = engine.clone();
            let token = poller_token.clone();
            async move { engine.run_change_poller(token).await }
        });

        engine.set_status(ProviderStatus::Idle);
        info!(root = %engine.root_path.display(), id = %registration.id, "sync root started");

        // Converge against the server in the background; covers whatever
        // happened while the client was not running.
        engine.runtime.spawn({
            let engine = engine.clone();
            async move {
                let _ = engine.reconcile(None, ReconcileMode::Full).await;
            }
        });

        Ok(Self {
            engine,
            dispatcher,
            registration,
            connection: Some(connection),
            watcher: Some(watcher),
            poller: Some(poller),
            poller_token,
            stopped: false,
        })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// The connected filter. The registrar only holds it weakly; the
    /// session owning this strong handle is what keeps callbacks alive
    /// until disconnect.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn registration(&self) -> &RootRegistration {
        &self.registration
    }

    /// Tears the session down. Safe to call more than once.
    pub async fn stop(&mut self, mode: UnregisterMode) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        let engine = self.engine.clone();
        info!(root = %engine.root_path.display(), "stopping sync root");

        let gate = engine.gate.clone();
        let drain = engine.config.dispatch_drain_timeout;
        let drained = tokio::task::spawn_blocking(move || gate.close(drain))
            .await
            .map_err(|e| SyncError::Unsuccessful(format!("gate drain task: {e}")))?;
        if !drained {
            warn!(inflight = engine.gate.inflight(), "callback gate did not drain in time");
        }

        if let Some(watcher) = self.watcher.take() {
            watcher.stop().await;
        }

        engine.cancel_all_fetches();
        engine.shutdown.cancel();
        self.poller_token.cancel();

        engine.fetch_tasks.close();
        if timeout(engine.config.fetch_drain_timeout, engine.fetch_tasks.wait())
            .await
            .is_err()
        {
            warn!("fetch tasks did not drain in time");
        }

        if let Some(poller) = self.poller.take() {
            if timeout(engine.config.queue_drain_timeout, poller).await.is_err() {
                warn!("change-log poller did not stop in time");
            }
        }

        if let Some(connection) = self.connection.take() {
            let registrar = engine.registrar.clone();
            let disconnected = tokio::task::spawn_blocking(move || registrar.disconnect(connection))
                .await
                .map_err(|e| SyncError::Unsuccessful(format!("disconnect task: {e}")))?;
            if let Err(error) = disconnected {
                warn!(%error, "disconnect failed");
            }
        }
        engine.set_status(ProviderStatus::Disconnected);

        match mode {
            UnregisterMode::Keep => {}
            UnregisterMode::Unregister => {
                engine.registrar.unregister(&self.registration.id)?;
            }
            UnregisterMode::UnregisterAndDelete => {
                engine.registrar.unregister(&self.registration.id)?;
                tombstone::remove_root_directory(
                    &engine.registrar,
                    &engine.root_path,
                    &self.registration.id,
                )
                .await?;
            }
        }

        engine.retained_identities.invalidate_all();
        engine.byte_urls.invalidate_all();
        info!("sync root stopped");
        Ok(())
    }
}

async fn register_with_backoff(
    engine: &Arc<SyncEngine>,
    registration: &RootRegistration,
) -> Result<()> {
    let mut backoff = REGISTER_BACKOFF_START;
    let attempts = engine.config.register_retry_attempts.max(1);
    for attempt in 1..=attempts {
        match engine.registrar.register(&engine.root_path, registration) {
            Ok(()) => return Ok(()),
            Err(error) if attempt < attempts => {
                warn!(attempt, %error, "registration busy; retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(error) => return Err(error),
        }
    }
    unreachable!("register loop always returns")
}
