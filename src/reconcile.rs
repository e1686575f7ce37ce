//! The reconciler: walks the local tree against server listings and
//! converges placeholder state.
//!
//! Runs are serialized by a non-blocking flag: a second invocation while
//! one is active returns immediately. Descent is parallelized across a
//! bounded subtree pool and observes the shutdown token at directory
//! boundaries.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{atomic::Ordering, Arc},
};

use futures_util::{future::BoxFuture, StreamExt};
use regex::Regex;
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    engine::SyncEngine,
    error::{Result, SyncError},
    events::ProviderStatus,
    identity::FileIdentity,
    kernel::{PinState, UpdateOptions},
    placeholder::remote_metadata,
    remote::RemoteObject,
};

/// How deep a reconcile run looks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    /// Examine placeholder state only; no server listings. Used to
    /// recover from file-system-watcher errors.
    Local,
    /// Compare every directory against its remote listing.
    Full,
}

/// The fixed exclusion set: temporary, system, recycle-bin and editor
/// swap files never sync.
const BUILT_IN_EXCLUSIONS: &[&str] = &[
    r"(?i)^~\$",          // Office owner files
    r"(?i)\.tmp$",        // generic temporaries
    r"(?i)^thumbs\.db$",  // shell thumbnail cache
    r"(?i)^desktop\.ini$",
    r"(?i)^\$recycle\.bin$",
    r"(?i)\.sw[a-p]$",    // editor swap files
    r"(?i)^\.~lock\..*#$", // office lock files
    r"~$",                // backup copies
];

pub(crate) struct PathExclusions {
    patterns: Vec<Regex>,
}

impl PathExclusions {
    pub fn new(extra: &[String]) -> Result<Self> {
        let mut patterns = Vec::with_capacity(BUILT_IN_EXCLUSIONS.len() + extra.len());
        for source in BUILT_IN_EXCLUSIONS
            .iter()
            .copied()
            .chain(extra.iter().map(String::as_str))
        {
            patterns.push(Regex::new(source).map_err(|e| {
                SyncError::InvalidRequest(format!("bad exclusion pattern {source:?}: {e}"))
            })?);
        }
        Ok(Self { patterns })
    }

    /// Matches against the final path component.
    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(name))
    }
}

struct ReconcileFlag<'a>(&'a SyncEngine);

impl Drop for ReconcileFlag<'_> {
    fn drop(&mut self) {
        self.0.reconcile_active.store(false, Ordering::SeqCst);
    }
}

impl SyncEngine {
    /// Reconciles the tree rooted at `subpath` (the whole root when
    /// `None`). Returns immediately without error when a run is already
    /// in progress.
    pub async fn reconcile(&self, subpath: Option<&Path>, mode: ReconcileMode) -> Result<()> {
        if self
            .reconcile_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("reconciliation already in progress");
            return Ok(());
        }
        let _flag = ReconcileFlag(self);

        let dir = match subpath {
            Some(path) if path.is_absolute() => {
                self.relative_of(path)?;
                path.to_path_buf()
            }
            Some(path) => self.root_path.join(path),
            None => self.root_path.clone(),
        };

        info!(dir = %dir.display(), ?mode, "reconciling");
        self.set_status(ProviderStatus::Syncing);
        let pool = Arc::new(Semaphore::new(self.config.reconcile_pool_size));
        let token = self.shutdown.child_token();
        let result = self.arc().reconcile_dir(dir, mode, pool, token).await;
        self.set_status(ProviderStatus::Idle);
        if let Err(error) = &result {
            warn!(%error, "reconciliation stopped");
        }
        result
    }

    fn reconcile_dir(
        self: Arc<Self>,
        dir: PathBuf,
        mode: ReconcileMode,
        pool: Arc<Semaphore>,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            if token.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let permit = pool
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| SyncError::Cancelled)?;

            let mut local = HashMap::new();
            let mut reader = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = reader.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let is_dir = entry.file_type().await?.is_dir();
                local.insert(name, (entry.path(), is_dir));
            }

            // Excluded names are pinned out of sync traffic and dropped
            // from further matching.
            local.retain(|name, (path, _)| {
                if !self.path_exclusions.matches(name) {
                    return true;
                }
                self.mark_excluded(path);
                false
            });

            let mut children = Vec::new();
            match mode {
                ReconcileMode::Local => {
                    for (_, (path, is_dir)) in local {
                        if is_dir {
                            children.push(path);
                        } else if let Err(error) = self.read_placeholder(&path, true) {
                            debug!(path = %path.display(), %error, "local check");
                        }
                    }
                }
                ReconcileMode::Full => {
                    children = self.reconcile_listing(&dir, local).await?;
                }
            }

            drop(permit);

            let mut subtree = JoinSet::new();
            for child in children {
                let engine = self.clone();
                let pool = pool.clone();
                let token = token.clone();
                subtree.spawn(engine.reconcile_dir(child, mode, pool, token));
            }
            let mut first_error = None;
            while let Some(joined) = subtree.join_next().await {
                let outcome =
                    joined.map_err(|e| SyncError::Unsuccessful(format!("subtree task: {e}")))?;
                if let Err(error) = outcome {
                    first_error.get_or_insert(error);
                }
            }
            match first_error {
                Some(error) => Err(error),
                None => Ok(()),
            }
        })
    }

    /// Full-mode body for one directory: creates placeholders missing
    /// locally, refreshes stale files, and picks the directories that need
    /// descent.
    async fn reconcile_listing(
        &self,
        dir: &Path,
        local: HashMap<String, (PathBuf, bool)>,
    ) -> Result<Vec<PathBuf>> {
        let remote_dir = self.remote_path_of(dir)?;
        let mut listing = self.remote.list(&self.host, &remote_dir).await?;
        let mut remote: HashMap<String, RemoteObject> = HashMap::new();
        while let Some(object) = listing.next().await {
            let object = object?;
            remote.insert(object.path.name().to_string(), object);
        }

        let mut specs = Vec::new();
        for (name, object) in &remote {
            if !local.contains_key(name) {
                specs.push(self.spec_for_remote(object, false)?);
            }
        }
        if !specs.is_empty() {
            self.create_placeholders(dir, specs)?;
        }

        let mut children = Vec::new();
        for (name, (path, is_dir)) in local {
            let Some(object) = remote.get(&name) else {
                // Local-only entry: either a new file the upload path
                // owns, or a phantom the change-log will delete. Never
                // deleted here.
                continue;
            };
            if object.folder != is_dir {
                warn!(path = %path.display(), "local/remote type mismatch; leaving to change-log");
                continue;
            }
            if is_dir {
                match self.read_placeholder(&path, false) {
                    Ok(state) if state.in_sync && state.partial => {
                        self.set_in_sync(&path, true)?;
                        self.enable_on_demand_population(&path)?;
                    }
                    _ => children.push(path),
                }
            } else {
                self.refresh_stale_file(&path, object)?;
            }
        }
        Ok(children)
    }

    /// Patches a file placeholder whose recorded version fell behind the
    /// server: new identity and metadata, on-disk data invalidated.
    fn refresh_stale_file(&self, path: &Path, object: &RemoteObject) -> Result<()> {
        let Ok(state) = self.read_placeholder(path, false) else {
            // A plain local file; the upload path owns it.
            return Ok(());
        };
        let stale = match FileIdentity::from_blob(&state.identity) {
            Ok(identity) => identity.version != object.version,
            Err(_) => true,
        };
        if !stale {
            return Ok(());
        }
        let mut identity = FileIdentity::new(object.path.as_str(), object.version.clone());
        identity.version_info = object.version_info.clone();
        self.update_placeholder(
            path,
            UpdateOptions {
                metadata: Some(remote_metadata(object)),
                identity: Some(identity.to_blob()?),
                mark_in_sync: Some(true),
                invalidate_data: true,
                ..Default::default()
            },
        )
    }

    fn mark_excluded(&self, path: &Path) {
        if let Err(error) = self
            .set_pin_state(path, PinState::Excluded, false)
            .and_then(|()| self.set_in_sync(path, true))
        {
            debug!(path = %path.display(), %error, "exclusion marking skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_exclusions_match_expected_names() {
        let rules = PathExclusions::new(&[]).unwrap();
        for name in [
            "~$report.docx",
            "setup.TMP",
            "Thumbs.db",
            "desktop.ini",
            "$RECYCLE.BIN",
            "notes.swp",
            ".~lock.budget.ods#",
            "draft.txt~",
        ] {
            assert!(rules.matches(name), "{name} should be excluded");
        }
    }

    #[test]
    fn ordinary_names_are_not_excluded() {
        let rules = PathExclusions::new(&[]).unwrap();
        for name in ["report.docx", "tmp-notes.txt", "swap.md", "a.txt"] {
            assert!(!rules.matches(name), "{name} should not be excluded");
        }
    }

    #[test]
    fn extra_patterns_extend_the_set() {
        let rules = PathExclusions::new(&[r"(?i)^ignored-".to_string()]).unwrap();
        assert!(rules.matches("Ignored-scratch.txt"));
        assert!(!rules.matches("kept-scratch.txt"));
    }
}
