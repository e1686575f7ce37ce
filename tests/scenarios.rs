//! End-to-end scenarios against the in-memory kernel backend and a
//! scripted object store.

mod common;

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tokio::sync::Notify;

use common::{object, rig, rig_with, timestamp, wait_until};
use drive_sync::{
    error::{SyncError, SyncErrorKind},
    events::{ProviderStatus, SyncEvent},
    kernel::{PinState, PlaceholderStore, SyncRootRegistrar},
    remote::{ChangeAction, ChangeEntry, RemotePath},
    root::{RootRegistration, SyncSession, UnregisterMode},
};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test(flavor = "multi_thread")]
async fn s1_fresh_empty_root() -> Result<()> {
    init_tracing();
    let rig = rig();
    let mut session = SyncSession::start(
        rig.engine.clone(),
        RootRegistration::new("root-A", "Drive"),
    )
    .await?;

    assert!(
        wait_until(Duration::from_secs(5), || {
            rig.kernel.provider_status() == ProviderStatus::Idle
        })
        .await
    );
    assert!(rig.kernel.is_registered("root-A"));

    let filter = rig.kernel.connected_filter().expect("filter connected");
    let (request, ticket) = rig.kernel.begin_enumeration(rig.root.path(), None)?;
    filter.fetch_placeholders(request, ticket, None);

    assert!(
        wait_until(Duration::from_secs(2), || {
            std::fs::read_dir(rig.root.path())
                .map(|mut d| d.next().is_none())
                .unwrap_or(false)
        })
        .await,
        "an empty server listing must enumerate to nothing"
    );
    assert!(rig.kernel.terminal_statuses().is_empty());

    session.stop(UnregisterMode::Keep).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn s2_single_file_listing_and_fetch() -> Result<()> {
    init_tracing();
    let rig = rig();
    rig.store.put_object(object("/a.txt", 11, "v1", false));
    rig.store.put_bytes("/a.txt", b"hello world".to_vec());

    rig.engine.reconcile(None, drive_sync::reconcile::ReconcileMode::Full).await?;

    let local = rig.root.path().join("a.txt");
    let state = rig.kernel.read(&local)?.expect("a.txt is a placeholder");
    assert_eq!(state.size, 11);
    assert!(!state.in_sync, "listing-created placeholders start out of sync");
    assert!(state.partial, "no data fetched yet");

    let filter = rig.filter.clone();
    let (request, ticket, range) = rig.kernel.begin_fetch(&local, 0, 11)?;
    let keys = request.keys();
    filter.fetch_data(request, ticket, range);

    assert!(
        wait_until(Duration::from_secs(5), || {
            std::fs::read(&local).map(|b| b == b"hello world").unwrap_or(false)
        })
        .await,
        "fetch must materialize the placeholder bytes"
    );
    assert_eq!(rig.server.requests.lock().len(), 1, "exactly one byte request");
    let progress = rig.kernel.progress_reports();
    let last = progress.iter().filter(|(k, ..)| *k == keys).last().unwrap();
    assert_eq!((last.1, last.2), (11, 11));
    let state = rig.kernel.read(&local)?.unwrap();
    assert!(!state.partial);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn s3_on_demand_byte_range() -> Result<()> {
    init_tracing();
    const MIB: u64 = 1024 * 1024;
    let size = 10 * MIB;
    let offset = 5 * MIB;
    let length = 4096u64;

    let rig = rig();
    let body: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    rig.store.put_object(object("/big.bin", size, "v7", false));
    rig.store.put_bytes("/big.bin", body.clone());
    rig.engine.reconcile(None, drive_sync::reconcile::ReconcileMode::Full).await?;

    let local = rig.root.path().join("big.bin");
    let filter = rig.kernel.connected_filter().expect("filter");
    let (request, ticket, range) = rig.kernel.begin_fetch(&local, offset, length)?;
    let keys = request.keys();
    filter.fetch_data(request, ticket, range);

    assert!(
        wait_until(Duration::from_secs(5), || {
            rig.kernel
                .progress_reports()
                .iter()
                .any(|&(k, total, completed)| k == keys && total == length && completed == length)
        })
        .await,
        "final progress report must cover the requested range"
    );

    let served = rig.server.requests.lock().clone();
    assert_eq!(served.len(), 1, "a single ranged request");
    assert_eq!(served[0].range.as_deref(), Some("bytes=5242880-5246975"));

    let on_disk = std::fs::read(&local)?;
    assert_eq!(on_disk.len() as u64, size);
    assert_eq!(
        &on_disk[offset as usize..(offset + length) as usize],
        &body[offset as usize..(offset + length) as usize]
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn s4_rename_across_directories_issues_move() -> Result<()> {
    init_tracing();
    let rig = rig();
    rig.store.put_object(object("/A", 0, "v1", true));
    rig.store.put_object(object("/B", 0, "v1", true));
    rig.store.put_object(object("/A/x.txt", 5, "v1", false));

    // Two passes: the first materializes the directories, the second
    // descends into them.
    rig.engine.reconcile(None, drive_sync::reconcile::ReconcileMode::Full).await?;
    rig.engine.reconcile(None, drive_sync::reconcile::ReconcileMode::Full).await?;

    let from = rig.root.path().join("A/x.txt");
    let to = rig.root.path().join("B/x.txt");
    assert!(from.exists());

    // The kernel performs the local move, then notifies.
    let filter = rig.kernel.connected_filter().expect("filter");
    let (request, ticket) = rig.kernel.begin_rename(&from)?;
    filter.rename(request, ticket, to.clone(), false);
    std::fs::rename(&from, &to)?;
    rig.kernel.relocate(&from, &to);
    let (request, _) = rig.kernel.begin_rename(&to)?;
    filter.renamed(request, from.clone());

    assert!(
        wait_until(Duration::from_secs(5), || {
            rig.store.object_at("/B/x.txt").is_some()
        })
        .await,
        "the move must reach the server"
    );
    {
        let state = rig.store.state.lock();
        assert_eq!(state.moves.len(), 1, "cross-directory rename is a move");
        assert_eq!(state.moves[0].file.as_str(), "/A/x.txt");
        assert_eq!(state.moves[0].to_dir.as_str(), "/B");
        assert!(state.renames.is_empty());
    }
    assert!(rig.store.object_at("/A/x.txt").is_none());

    let server_version = rig.store.object_at("/B/x.txt").unwrap().version;
    assert!(
        wait_until(Duration::from_secs(5), || {
            rig.kernel
                .read(&to)
                .ok()
                .flatten()
                .and_then(|state| {
                    drive_sync::identity::FileIdentity::from_blob(&state.identity).ok()
                })
                .map(|identity| identity.version == server_version)
                .unwrap_or(false)
        })
        .await,
        "the target placeholder must carry the server's fresh identity"
    );
    assert!(!from.exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn s5_delete_without_permission_restores() -> Result<()> {
    init_tracing();
    let rig = rig();
    rig.store.put_object(object("/readonly.txt", 4, "v1", false));
    rig.store
        .state
        .lock()
        .forbidden_deletes
        .push("/readonly.txt".into());
    rig.engine.reconcile(None, drive_sync::reconcile::ReconcileMode::Full).await?;

    let local = rig.root.path().join("readonly.txt");
    let mut events = rig.engine.subscribe();
    let filter = rig.kernel.connected_filter().expect("filter");

    let (request, ticket) = rig.kernel.begin_delete(&local)?;
    filter.delete(request, ticket, false);

    // The kernel sees a successful ACK; the refusal surfaces as an event.
    assert!(
        wait_until(Duration::from_secs(5), || {
            rig.kernel
                .acks()
                .iter()
                .any(|ack| ack.status.is_ok())
        })
        .await
    );
    let denied = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(SyncEvent::DeleteDenied { path }) = events.recv().await {
                break path;
            }
        }
    })
    .await?;
    assert_eq!(denied, local);

    // Kernel-side deletion completes, then the completion callback
    // reinstates the placeholder from server metadata.
    rig.kernel.revert(&local)?;
    std::fs::remove_file(&local)?;
    let (request, _) = rig.kernel.begin_delete(&local)?;
    filter.deleted(request);

    assert!(
        wait_until(Duration::from_secs(5), || {
            rig.kernel
                .read(&local)
                .ok()
                .flatten()
                .map(|state| state.in_sync)
                .unwrap_or(false)
        })
        .await,
        "placeholder must be recreated from the server"
    );

    // The restore entry is consumed: a second completion is a no-op.
    let before = rig.kernel.read(&local)?.unwrap().identity;
    let (request, _) = rig.kernel.begin_delete(&local)?;
    filter.deleted(request);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(rig.kernel.read(&local)?.unwrap().identity, before);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn s6_shutdown_under_active_fetch() -> Result<()> {
    init_tracing();
    const MIB: usize = 1024 * 1024;
    let rig = rig_with(Some(Duration::from_millis(5)));
    let body: Vec<u8> = vec![0x5a; 4 * MIB];
    rig.store.put_object(object("/big.bin", body.len() as u64, "v1", false));
    rig.store.put_bytes("/big.bin", body);

    let mut session = SyncSession::start(
        rig.engine.clone(),
        RootRegistration::new("root-A", "Drive"),
    )
    .await?;

    let local = rig.root.path().join("big.bin");
    assert!(wait_until(Duration::from_secs(5), || local.exists()).await);

    let filter = rig.kernel.connected_filter().expect("filter");
    let (request, ticket, range) = rig.kernel.begin_fetch(&local, 0, 4 * MIB as u64)?;
    let keys = request.keys();
    filter.fetch_data(request, ticket, range);

    assert!(
        wait_until(Duration::from_secs(5), || {
            rig.kernel
                .progress_reports()
                .iter()
                .any(|(k, ..)| *k == keys)
        })
        .await,
        "fetch must be mid-flight before stopping"
    );

    let started = std::time::Instant::now();
    session.stop(UnregisterMode::Keep).await?;
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "shutdown must complete within the drain budget"
    );

    let cancelled: Vec<_> = rig
        .kernel
        .terminal_statuses()
        .into_iter()
        .filter(|(k, status)| *k == keys && *status == SyncErrorKind::Cancelled)
        .collect();
    assert_eq!(cancelled.len(), 1, "exactly one terminal cancelled reply");

    // The gate stays closed: fresh callbacks are refused with cancelled.
    let refused_filter = rig.kernel.connected_filter();
    assert!(refused_filter.is_none(), "disconnect dropped the filter");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn enumeration_while_offline_reports_network_unavailable() -> Result<()> {
    init_tracing();
    let rig = rig();
    rig.store
        .connected
        .store(false, std::sync::atomic::Ordering::SeqCst);

    let filter = rig.kernel.connected_filter().expect("filter");
    let (request, ticket) = rig.kernel.begin_enumeration(rig.root.path(), None)?;
    let keys = request.keys();
    filter.fetch_placeholders(request, ticket, None);

    assert!(
        wait_until(Duration::from_secs(2), || {
            rig.kernel
                .terminal_statuses()
                .iter()
                .any(|&(k, status)| k == keys && status == SyncErrorKind::NetworkUnavailable)
        })
        .await
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn enumeration_from_excluded_process_is_empty() -> Result<()> {
    init_tracing();
    let rig = rig();
    rig.store.put_object(object("/a.txt", 3, "v1", false));

    let filter = rig.kernel.connected_filter().expect("filter");
    let image = std::path::PathBuf::from("C:\\Windows\\System32\\SearchProtocolHost.exe");
    let (request, ticket) = rig.kernel.begin_enumeration(rig.root.path(), Some(image))?;
    filter.fetch_placeholders(request, ticket, None);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        std::fs::read_dir(rig.root.path())?.next().is_none(),
        "an excluded process must not repopulate placeholders"
    );
    assert!(rig.kernel.terminal_statuses().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn reconciler_is_idempotent_over_unchanged_tree() -> Result<()> {
    init_tracing();
    let rig = rig();
    rig.store.put_object(object("/docs", 0, "v1", true));
    rig.store.put_object(object("/docs/q1.xlsx", 9, "v3", false));
    rig.store.put_object(object("/a.txt", 2, "v1", false));

    rig.engine.reconcile(None, drive_sync::reconcile::ReconcileMode::Full).await?;
    rig.engine.reconcile(None, drive_sync::reconcile::ReconcileMode::Full).await?;
    let first = snapshot(&rig)?;
    rig.engine.reconcile(None, drive_sync::reconcile::ReconcileMode::Full).await?;
    let second = snapshot(&rig)?;
    assert_eq!(first, second, "an unchanged tree must not mutate");
    Ok(())
}

fn snapshot(rig: &common::TestRig) -> Result<Vec<(String, String)>> {
    fn walk(
        rig: &common::TestRig,
        dir: &std::path::Path,
        out: &mut Vec<(String, String)>,
    ) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let state = rig.kernel.read(&path)?;
            out.push((
                path.display().to_string(),
                format!("{state:?}"),
            ));
            if path.is_dir() {
                walk(rig, &path, out)?;
            }
        }
        Ok(())
    }
    let mut out = Vec::new();
    walk(rig, rig.root.path(), &mut out)?;
    out.sort();
    Ok(out)
}

#[tokio::test(flavor = "multi_thread")]
async fn exclusions_are_pinned_excluded_and_in_sync() -> Result<()> {
    init_tracing();
    let rig = rig();
    let name = "~$draft.docx";
    let spec = drive_sync::kernel::PlaceholderSpec::new(
        name,
        drive_sync::kernel::PlaceholderMetadata::file().size(0),
    );
    rig.kernel.create(rig.root.path(), &[spec])?;

    rig.engine.reconcile(None, drive_sync::reconcile::ReconcileMode::Full).await?;

    let state = rig
        .kernel
        .read(&rig.root.path().join(name))?
        .expect("excluded placeholder");
    assert_eq!(state.pin_state, PinState::Excluded);
    assert!(state.in_sync);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_uploads_of_one_path_deduplicate() -> Result<()> {
    init_tracing();
    let rig = rig();
    let barrier = Arc::new(Notify::new());
    *rig.store.upload_barrier.lock() = Some(barrier.clone());

    let local = rig.root.path().join("new.txt");
    std::fs::write(&local, b"fresh bytes")?;

    let first = tokio::spawn({
        let engine = rig.engine.clone();
        let local = local.clone();
        async move { engine.upload_file(local).await }
    });
    assert!(
        wait_until(Duration::from_secs(2), || {
            rig.store
                .check_upload_calls
                .load(std::sync::atomic::Ordering::SeqCst)
                == 1
        })
        .await
    );

    // Second request for the same path folds into the in-flight upload.
    rig.engine.upload_file(local.clone()).await?;

    for _ in 0..50 {
        barrier.notify_waiters();
        tokio::time::sleep(Duration::from_millis(10)).await;
        if first.is_finished() {
            break;
        }
    }
    first.await??;

    assert_eq!(
        rig.store
            .check_upload_calls
            .load(std::sync::atomic::Ordering::SeqCst),
        1
    );
    assert_eq!(rig.store.state.lock().uploads, vec!["/new.txt".to_string()]);
    let state = rig.kernel.read(&local)?.expect("converted to placeholder");
    assert!(state.in_sync);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn change_log_events_mutate_placeholders() -> Result<()> {
    init_tracing();
    let rig = rig();
    let created = object("/news.txt", 6, "v1", false);
    rig.store.put_object(created.clone());
    rig.store.state.lock().changes.push(ChangeEntry {
        action: ChangeAction::Create,
        object: created,
        old_path: None,
        timestamp: timestamp(1_704_070_000),
    });

    let applied = rig
        .engine
        .apply_change_window(timestamp(1_704_060_000), timestamp(1_704_080_000))
        .await?;
    assert_eq!(applied, 1);
    let local = rig.root.path().join("news.txt");
    let state = rig.kernel.read(&local)?.expect("created by change log");
    assert!(state.in_sync);

    // A rename event is delete-old plus create-new.
    let mut renamed = object("/renamed.txt", 6, "v2", false);
    renamed.modified = timestamp(1_704_071_000);
    rig.store.put_object(renamed.clone());
    rig.store.state.lock().changes.push(ChangeEntry {
        action: ChangeAction::Rename,
        object: renamed,
        old_path: Some(RemotePath::new("/news.txt")),
        timestamp: timestamp(1_704_071_000),
    });
    let applied = rig
        .engine
        .apply_change_window(timestamp(1_704_070_000), timestamp(1_704_080_000))
        .await?;
    assert_eq!(applied, 1);
    assert!(!local.exists(), "old path removed");
    assert!(rig.root.path().join("renamed.txt").exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn dehydrate_respects_pin_and_revert_requires_sync() -> Result<()> {
    init_tracing();
    let rig = rig();
    rig.store.put_object(object("/p.txt", 5, "v1", false));
    rig.store.put_bytes("/p.txt", b"12345".to_vec());
    rig.engine.reconcile(None, drive_sync::reconcile::ReconcileMode::Full).await?;
    let local = rig.root.path().join("p.txt");

    rig.engine.set_pin_state(&local, PinState::Pinned, false)?;
    assert!(matches!(
        rig.engine.dehydrate(&local, false),
        Err(SyncError::Pinned(_))
    ));
    rig.engine.set_pin_state(&local, PinState::Unspecified, false)?;

    // Hydration succeeds but the placeholder is still not in sync, so a
    // guarded revert refuses.
    assert!(matches!(
        rig.engine.revert(&local, false).await,
        Err(SyncError::NotInSync(_))
    ));

    rig.engine.revert(&local, true).await?;
    assert!(rig.kernel.read(&local)?.is_none(), "reverted to regular file");
    Ok(())
}
