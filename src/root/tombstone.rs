//! Safe removal of a busy sync root.
//!
//! `remove_root_directory` retries the recursive delete with backoff;
//! a root that stays busy (open shell handles, indexers) is renamed into a
//! per-user tombstone area and, as a last resort, scheduled for deletion
//! at next reboot. `cleanup_pending_deletes` sweeps the tombstone area on
//! the next process start.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use tracing::{info, warn};

use crate::{error::Result, kernel::SyncRootRegistrar};

const PENDING_DELETE_DIR: &str = "DriveSync.PendingDelete";

/// Sleep after each failed delete attempt, in order.
const DELETE_BACKOFF_MS: [u64; 6] = [250, 500, 1000, 2000, 4000, 5000];

fn pending_delete_area() -> PathBuf {
    std::env::temp_dir().join(PENDING_DELETE_DIR)
}

fn tombstone_name(root_id: &str) -> String {
    let sanitized: String = root_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            c
        } else {
            '_'
        })
        .collect();
    let stamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("{sanitized}_{stamp}")
}

pub(crate) async fn remove_root_directory(
    registrar: &Arc<dyn SyncRootRegistrar>,
    root: &Path,
    root_id: &str,
) -> Result<()> {
    remove_root_directory_in(registrar, root, root_id, &pending_delete_area()).await
}

pub(crate) async fn remove_root_directory_in(
    registrar: &Arc<dyn SyncRootRegistrar>,
    root: &Path,
    root_id: &str,
    area: &Path,
) -> Result<()> {
    for delay_ms in DELETE_BACKOFF_MS {
        match tokio::fs::remove_dir_all(root).await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(error) => {
                warn!(root = %root.display(), %error, "root delete attempt failed");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }
    }

    // Still busy; move it out of the way and deal with the remains.
    tokio::fs::create_dir_all(area).await?;
    let tombstone = area.join(tombstone_name(root_id));
    info!(root = %root.display(), tombstone = %tombstone.display(), "tombstoning busy root");
    tokio::fs::rename(root, &tombstone).await?;

    if let Err(error) = tokio::fs::remove_dir_all(&tombstone).await {
        warn!(tombstone = %tombstone.display(), %error, "tombstone still busy; scheduling for reboot");
        registrar.schedule_removal_on_reboot(&tombstone)?;
    }
    Ok(())
}

/// Sweeps the tombstone area, returning how many leftovers were removed.
pub async fn cleanup_pending_deletes() -> Result<usize> {
    cleanup_pending_deletes_in(&pending_delete_area()).await
}

pub(crate) async fn cleanup_pending_deletes_in(area: &Path) -> Result<usize> {
    let mut reader = match tokio::fs::read_dir(area).await {
        Ok(reader) => reader,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut removed = 0;
    while let Some(entry) = reader.next_entry().await? {
        let path = entry.path();
        let outcome = if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match outcome {
            Ok(()) => removed += 1,
            Err(error) => warn!(path = %path.display(), %error, "tombstone sweep skipped entry"),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tombstone_names_are_sanitized() {
        let name = tombstone_name("root/A:b");
        let (id_part, stamp) = name.rsplit_once('_').unwrap();
        assert_eq!(id_part, "root_A_b");
        assert!(stamp.parse::<u64>().is_ok());
    }

    #[tokio::test]
    async fn sweep_removes_tombstones() {
        let area = tempfile::tempdir().unwrap();
        let stale = area.path().join("root-A_123");
        std::fs::create_dir_all(stale.join("nested")).unwrap();
        std::fs::write(stale.join("nested/file.txt"), b"x").unwrap();
        std::fs::write(area.path().join("stray.txt"), b"y").unwrap();

        let removed = cleanup_pending_deletes_in(area.path()).await.unwrap();
        assert_eq!(removed, 2);
        assert!(std::fs::read_dir(area.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn sweep_of_missing_area_is_empty() {
        let area = tempfile::tempdir().unwrap();
        let missing = area.path().join("nope");
        assert_eq!(cleanup_pending_deletes_in(&missing).await.unwrap(), 0);
    }
}
