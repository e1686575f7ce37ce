//! The remote change-log poller.
//!
//! One cooperative task, started at connect and stopped at disconnect.
//! Each iteration pulls the half-open window `[last, now)` and applies the
//! events in server order; the cursor only advances after the whole window
//! applied, so a failed iteration is retried verbatim.

use std::{path::Path, time::SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    engine::SyncEngine,
    error::Result,
    events::{ProviderStatus, SyncEvent},
    identity::FileIdentity,
    kernel::PinState,
    remote::{ChangeAction, ChangeEntry, RemoteObject},
};

impl SyncEngine {
    pub(crate) async fn run_change_poller(&self, token: CancellationToken) {
        info!("change-log poller started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.change_poll_interval) => {}
            }
            let from = *self.change_cursor.lock();
            let to = SystemTime::now();
            match self.apply_change_window(from, to).await {
                Ok(count) => {
                    *self.change_cursor.lock() = to;
                    if count > 0 {
                        self.emit(SyncEvent::ChangesApplied { count });
                    }
                }
                Err(error) => {
                    // Cursor untouched; the same window retries next turn.
                    warn!(%error, "change window failed");
                }
            }
        }
        info!("change-log poller stopped");
    }

    /// Applies all remote events in `[from, to)`. Returns how many were
    /// processed.
    pub async fn apply_change_window(&self, from: SystemTime, to: SystemTime) -> Result<usize> {
        let entries = self.remote.change_log(&self.host, from, to).await?;
        if entries.is_empty() {
            return Ok(0);
        }
        self.set_status(ProviderStatus::Syncing);
        let count = entries.len();
        let mut outcome = Ok(count);
        for entry in entries {
            if let Err(error) = self.apply_change(entry) {
                outcome = Err(error);
                break;
            }
        }
        self.set_status(ProviderStatus::Idle);
        outcome
    }

    fn apply_change(&self, entry: ChangeEntry) -> Result<()> {
        let local = self.local_path_of(&entry.object.path);
        debug!(action = ?entry.action, path = %entry.object.path, "applying remote change");
        match entry.action {
            ChangeAction::Create | ChangeAction::Copy | ChangeAction::Restore => {
                self.apply_remote_upsert(&entry.object, &local)
            }
            ChangeAction::Delete => self.apply_remote_delete(&local),
            ChangeAction::Move | ChangeAction::Rename => {
                if let Some(old_path) = &entry.old_path {
                    self.apply_remote_delete(&self.local_path_of(old_path))?;
                }
                self.apply_remote_upsert(&entry.object, &local)
            }
        }
    }

    /// Creates a fresh placeholder for a server-side create/copy/restore,
    /// replacing any local stub whose version differs.
    fn apply_remote_upsert(&self, object: &RemoteObject, local: &Path) -> Result<()> {
        if let Ok(Some(state)) = self.store.read(local) {
            if let Ok(identity) = FileIdentity::from_blob(&state.identity) {
                if identity.version == object.version {
                    return Ok(());
                }
            }
        }
        if local.exists() {
            self.remove_local(local)?;
        }
        let parent = match local.parent() {
            Some(parent) => parent.to_path_buf(),
            None => return Ok(()),
        };
        std::fs::create_dir_all(&parent)?;
        let spec = self.spec_for_remote(object, true)?;
        self.create_placeholders(&parent, vec![spec])
    }

    /// Removes the local counterpart of a server-side delete. The entry is
    /// marked excluded first so the resulting delete callbacks do not
    /// round-trip back to the server.
    fn apply_remote_delete(&self, local: &Path) -> Result<()> {
        if !local.exists() {
            return Ok(());
        }
        if let Err(error) = self.set_pin_state(local, PinState::Excluded, true) {
            debug!(path = %local.display(), %error, "exclusion before delete skipped");
        }
        self.remove_local(local)
    }

    fn remove_local(&self, local: &Path) -> Result<()> {
        // Shed placeholder state before the file goes away.
        let _ = self.store.revert(local);
        self.in_sync_cache.lock().remove(local);
        if local.is_dir() {
            std::fs::remove_dir_all(local)?;
        } else {
            std::fs::remove_file(local)?;
        }
        Ok(())
    }
}
