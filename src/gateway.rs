//! The file operations gateway: user-initiated local mutations flowing
//! out to the object store.
//!
//! Operations are tagged variants of one [`Operation`] sum so the overlap
//! check treats them uniformly: at most one active task per path, and a
//! directory-level task blocks everything beneath it. Uploads additionally
//! de-duplicate against the in-flight set. Remote tasks are awaited with a
//! bounded randomized poll.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::{
    engine::SyncEngine,
    error::{Result, SyncError},
    events::SyncEvent,
    identity::FileIdentity,
    kernel::UpdateOptions,
    placeholder::remote_metadata,
    remote::{
        DeleteRequest, MoveRequest, RemoteError, RemotePath, RenameRequest, TaskId, TaskState,
        UploadRequest,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Upload,
    CreateFolder,
    Rename,
    Move,
    Delete,
}

/// One outbound mutation keyed by the local paths it touches.
#[derive(Debug, Clone)]
pub(crate) enum Operation {
    Upload { path: PathBuf },
    CreateFolder { path: PathBuf },
    Rename { from: PathBuf, to: PathBuf },
    Move { from: PathBuf, to: PathBuf },
    Delete { path: PathBuf },
}

impl Operation {
    fn kind(&self) -> OpKind {
        match self {
            Operation::Upload { .. } => OpKind::Upload,
            Operation::CreateFolder { .. } => OpKind::CreateFolder,
            Operation::Rename { .. } => OpKind::Rename,
            Operation::Move { .. } => OpKind::Move,
            Operation::Delete { .. } => OpKind::Delete,
        }
    }

    fn paths(&self) -> Vec<&Path> {
        match self {
            Operation::Upload { path }
            | Operation::CreateFolder { path }
            | Operation::Delete { path } => vec![path],
            Operation::Rename { from, to } | Operation::Move { from, to } => vec![from, to],
        }
    }
}

/// Claim over the paths of one operation; released on drop.
pub(crate) struct OpSlot {
    engine: Arc<SyncEngine>,
    paths: Vec<PathBuf>,
}

impl Drop for OpSlot {
    fn drop(&mut self) {
        let mut active = self.engine.active_ops.lock();
        for path in &self.paths {
            active.remove(path);
        }
        drop(active);
        self.engine.ops_changed.notify_waiters();
    }
}

fn overlaps(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

impl SyncEngine {
    /// Claims the operation's paths. Returns `None` when an identical
    /// upload is already in flight (de-duplicated); otherwise waits until
    /// no active task overlaps any touched path or an ancestor/descendant
    /// of it.
    pub(crate) async fn claim(&self, op: &Operation) -> Option<OpSlot> {
        loop {
            let mut wait = Box::pin(self.ops_changed.notified());
            {
                let mut active = self.active_ops.lock();
                if let Operation::Upload { path } = op {
                    if active.get(path) == Some(&OpKind::Upload) {
                        debug!(path = %path.display(), "upload already in flight");
                        return None;
                    }
                }
                let blocked = op
                    .paths()
                    .iter()
                    .any(|p| active.keys().any(|a| overlaps(a, p)));
                if !blocked {
                    let paths: Vec<PathBuf> =
                        op.paths().into_iter().map(Path::to_path_buf).collect();
                    for path in &paths {
                        active.insert(path.clone(), op.kind());
                    }
                    return Some(OpSlot {
                        engine: self.arc(),
                        paths,
                    });
                }
                // Register for the wakeup before the lock drops so a slot
                // released in between is not missed.
                wait.as_mut().enable();
            }
            wait.await;
        }
    }

    /// Uploads a local file, then converts it into an in-sync placeholder
    /// carrying the server's fresh identity.
    pub async fn upload_file(&self, path: PathBuf) -> Result<()> {
        let op = Operation::Upload { path: path.clone() };
        let Some(_slot) = self.claim(&op).await else {
            return Ok(());
        };
        let _permit = self
            .upload_slots
            .acquire()
            .await
            .map_err(|_| SyncError::Cancelled)?;

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            // Racy create-then-delete; nothing left to upload.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if metadata.is_dir() {
            return self.create_remote_folder(path).await;
        }

        let target = self.remote_path_of(&path)?;
        info!(path = %path.display(), remote = %target, "uploading");
        let session = self
            .remote
            .check_upload(
                &self.host,
                UploadRequest {
                    target: target.clone(),
                    size: metadata.len(),
                    modified: metadata.modified()?,
                },
            )
            .await?;
        self.remote.upload(&self.host, &session, &path).await?;
        self.poll_task(&session.task).await?;

        let object = self.remote.info(&self.host, &target).await?;
        let mut identity = FileIdentity::new(object.path.as_str(), object.version.clone());
        identity.version_info = object.version_info.clone();
        if self.store.read(&path)?.is_some() {
            self.update_placeholder(
                &path,
                UpdateOptions {
                    metadata: Some(remote_metadata(&object)),
                    identity: Some(identity.to_blob()?),
                    mark_in_sync: Some(true),
                    ..Default::default()
                },
            )?;
        } else {
            self.convert_to_placeholder(&path, true, &identity)?;
        }
        self.emit(SyncEvent::UploadCompleted { path });
        Ok(())
    }

    /// Creates the folder remotely, then converts the local directory into
    /// an in-sync placeholder.
    pub async fn create_remote_folder(&self, path: PathBuf) -> Result<()> {
        let op = Operation::CreateFolder { path: path.clone() };
        let Some(_slot) = self.claim(&op).await else {
            return Ok(());
        };

        let remote_dir = self.remote_path_of(&path)?;
        let parent = remote_dir.parent().unwrap_or_else(RemotePath::root);
        self.remote
            .create_folder(&self.host, &parent, remote_dir.name())
            .await?;
        let object = self.remote.info(&self.host, &remote_dir).await?;
        let mut identity = FileIdentity::new(object.path.as_str(), object.version.clone());
        identity.version_info = object.version_info.clone();
        self.convert_to_placeholder(&path, true, &identity)?;
        Ok(())
    }

    /// Issues a remote rename (same parent) or move (parents differ) for a
    /// completed local rename, then refreshes the target placeholder.
    pub async fn rename_or_move(&self, from: PathBuf, to: PathBuf) -> Result<()> {
        let cross_directory = from.parent() != to.parent();
        let op = if cross_directory {
            Operation::Move {
                from: from.clone(),
                to: to.clone(),
            }
        } else {
            Operation::Rename {
                from: from.clone(),
                to: to.clone(),
            }
        };
        let Some(_slot) = self.claim(&op).await else {
            return Ok(());
        };

        let from_remote = self.remote_path_of(&from)?;
        let to_remote = self.remote_path_of(&to)?;
        // Fresh metadata; also verifies the source still exists remotely.
        self.remote.info(&self.host, &from_remote).await?;

        let task = if cross_directory {
            self.remote
                .move_object(
                    &self.host,
                    MoveRequest {
                        file: from_remote,
                        to_dir: to_remote.parent().unwrap_or_else(RemotePath::root),
                    },
                )
                .await?
        } else {
            self.remote
                .rename(
                    &self.host,
                    RenameRequest {
                        file: from_remote,
                        new_name: to_remote.name().to_string(),
                    },
                )
                .await?
        };
        self.poll_task(&task).await?;
        self.refresh_placeholder(to).await
    }

    /// Deletes the object behind a local path to the server trash.
    ///
    /// A forbidden reply surfaces a user notification and queues the path
    /// for reinstatement on the delete-completion callback.
    pub async fn delete_remote(&self, path: PathBuf, is_directory: bool) -> Result<()> {
        let op = Operation::Delete { path: path.clone() };
        let Some(_slot) = self.claim(&op).await else {
            return Ok(());
        };

        // Prefer the placeholder identity for remote addressing; fall back
        // to the path mapping. A path readable by neither is a racy
        // delete and counts as done.
        let identity_path = self
            .store
            .read(&path)
            .ok()
            .flatten()
            .filter(|state| !state.identity.is_empty())
            .and_then(|state| FileIdentity::from_blob(&state.identity).ok())
            .map(|identity| RemotePath::new(&identity.path));
        let remote_file = match identity_path {
            Some(remote_file) => remote_file,
            None if !path.exists() => return Ok(()),
            None => self.remote_path_of(&path)?,
        };

        let outcome = self.delete_remote_object(&remote_file, is_directory).await;
        match outcome {
            Ok(()) => Ok(()),
            Err(SyncError::Remote(RemoteError::NotFound(_))) => Ok(()),
            Err(SyncError::Remote(RemoteError::Forbidden(_))) => {
                warn!(path = %path.display(), "server refused delete; queuing restore");
                self.restore_queue.lock().insert(path.clone());
                self.emit(SyncEvent::DeleteDenied { path });
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    async fn delete_remote_object(&self, remote_file: &RemotePath, is_directory: bool) -> Result<()> {
        let _ = is_directory;
        self.remote.info(&self.host, remote_file).await?;
        let parent = remote_file.parent().unwrap_or_else(RemotePath::root);
        let task = self
            .remote
            .delete(
                &self.host,
                DeleteRequest {
                    parent,
                    names: vec![remote_file.name().to_string()],
                    trash: true,
                },
            )
            .await?;
        self.poll_task(&task).await
    }

    /// Recreates a placeholder from server metadata after a denied delete.
    pub(crate) async fn reinstate_placeholder(&self, path: PathBuf) -> Result<()> {
        let remote_path = self.remote_path_of(&path)?;
        let object = self.remote.info(&self.host, &remote_path).await?;
        let spec = self.spec_for_remote(&object, true)?;
        let parent = path
            .parent()
            .ok_or_else(|| SyncError::InvalidRequest("path has no parent".into()))?;
        self.create_placeholders(parent, vec![spec])?;
        self.restore_queue.lock().remove(&path);
        self.emit(SyncEvent::PlaceholderReinstated { path });
        Ok(())
    }

    /// Re-reads server metadata for the path and patches the local
    /// placeholder (or converts a plain file) to match.
    pub(crate) async fn refresh_placeholder(&self, path: PathBuf) -> Result<()> {
        let remote_path = self.remote_path_of(&path)?;
        let object = self.remote.info(&self.host, &remote_path).await?;
        let mut identity = FileIdentity::new(object.path.as_str(), object.version.clone());
        identity.version_info = object.version_info.clone();
        if self.store.read(&path)?.is_some() {
            self.update_placeholder(
                &path,
                UpdateOptions {
                    metadata: Some(remote_metadata(&object)),
                    identity: Some(identity.to_blob()?),
                    mark_in_sync: Some(true),
                    ..Default::default()
                },
            )
        } else {
            self.convert_to_placeholder(&path, true, &identity)
        }
    }

    /// Polls the remote task-state endpoint at randomized 3 to 4 second intervals
    /// until it leaves `pending`, up to the configured attempt cap.
    pub(crate) async fn poll_task(&self, task: &TaskId) -> Result<()> {
        let min = self.config.task_poll_min_delay.as_millis() as u64;
        let max = self.config.task_poll_max_delay.as_millis() as u64;
        for _ in 0..self.config.task_poll_attempts {
            match self.remote.task_state(&self.host, task).await? {
                TaskState::Complete => return Ok(()),
                TaskState::Error => {
                    return Err(RemoteError::TaskFailed(task.0.clone()).into());
                }
                TaskState::Pending => {}
            }
            let delay = Duration::from_millis(rand::thread_rng().gen_range(min..=max));
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        Err(SyncError::Unsuccessful(format!(
            "remote task {} did not settle within {} polls",
            task.0, self.config.task_poll_attempts
        )))
    }
}
