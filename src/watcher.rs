//! Local file-system watcher pump.
//!
//! Create and data-modify events on non-placeholder files feed the upload
//! path; a watcher error falls back to a local-mode reconcile pass.

use notify::{event::ModifyKind, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::{
    engine::SyncEngine,
    error::{Result, SyncError},
    reconcile::ReconcileMode,
};

pub(crate) struct WatcherHandle {
    watcher: Option<RecommendedWatcher>,
    pump: tokio::task::JoinHandle<()>,
}

impl WatcherHandle {
    pub async fn stop(mut self) {
        self.watcher.take();
        self.pump.abort();
        let _ = (&mut self.pump).await;
    }
}

impl SyncEngine {
    pub(crate) fn start_watcher(&self) -> Result<WatcherHandle> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            let _ = tx.send(event);
        })
        .map_err(|e| SyncError::Unsuccessful(format!("watcher: {e}")))?;
        watcher
            .watch(&self.root_path, RecursiveMode::Recursive)
            .map_err(|e| SyncError::Unsuccessful(format!("watch {}: {e}", self.root_path.display())))?;

        let engine = self.arc();
        let token = self.shutdown.child_token();
        let pump = self.runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(Ok(event)) => engine.handle_fs_event(event).await,
                        Some(Err(error)) => {
                            warn!(%error, "watcher error; falling back to local reconcile");
                            let _ = engine.reconcile(None, ReconcileMode::Local).await;
                        }
                        None => break,
                    }
                }
            }
        });

        Ok(WatcherHandle {
            watcher: Some(watcher),
            pump,
        })
    }

    async fn handle_fs_event(&self, event: Event) {
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any)
        ) {
            return;
        }
        for path in event.paths {
            if path == self.root_path {
                continue;
            }
            let name = match path.file_name() {
                Some(name) => name.to_string_lossy().into_owned(),
                None => continue,
            };
            if self.path_exclusions.matches(&name) {
                continue;
            }
            // Placeholder traffic (hydration writes, metadata updates) is
            // the engine's own; only plain local files go to upload.
            match self.store.read(&path) {
                Ok(None) => {}
                _ => continue,
            }
            debug!(path = %path.display(), "local change queued for upload");
            if let Err(error) = self.upload_file(path.clone()).await {
                warn!(path = %path.display(), %error, "watcher upload failed");
            }
        }
    }
}
