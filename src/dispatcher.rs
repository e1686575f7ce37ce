//! The callback dispatcher.
//!
//! The only [`SyncFilter`] implementation in the crate. Every handler
//! enters the counted gate first; once shutdown closes the gate, refused
//! callbacks still acknowledge the kernel (empty list or zero bytes with a
//! cancelled status, or a silent return for pure notifications). Handlers
//! never propagate errors; failures are translated into terminal
//! statuses here.

use std::{path::PathBuf, sync::Arc};

use futures_util::StreamExt;
use tracing::{debug, info, warn};

use crate::{
    engine::SyncEngine,
    error::{Result, SyncError, SyncErrorKind},
    kernel::{ticket, FetchRange, PlaceholderSpec, Request, SyncFilter},
};

pub struct Dispatcher {
    engine: Arc<SyncEngine>,
}

impl Dispatcher {
    pub fn new(engine: Arc<SyncEngine>) -> Arc<Self> {
        Arc::new(Self { engine })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Whether the initiating process is in the exclusion set (indexers,
    /// storage service subhosts) whose enumerations must not repopulate.
    fn process_excluded(&self, request: &Request) -> bool {
        match &request.process().image_path {
            Some(image) => {
                let candidate = image.to_string_lossy().replace('\\', "/");
                self.engine.process_exclusions.is_match(candidate.as_str())
            }
            None => false,
        }
    }

    /// Collects the remote listing for a directory into create-infos and
    /// retains the identity blobs for the kernel's read window.
    async fn enumerate(
        engine: &SyncEngine,
        request: &Request,
        pattern: Option<String>,
    ) -> Result<Vec<PlaceholderSpec>> {
        let remote_dir = engine.remote_path_of(request.path())?;
        let matcher = match pattern.as_deref() {
            Some(pattern) if pattern != "*" => Some(
                globset::GlobBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| SyncError::InvalidRequest(format!("bad pattern: {e}")))?
                    .compile_matcher(),
            ),
            _ => None,
        };

        let mut listing = engine.remote.list(&engine.host, &remote_dir).await?;
        let mut specs = Vec::new();
        while let Some(object) = listing.next().await {
            let object = object?;
            if let Some(matcher) = &matcher {
                if !matcher.is_match(object.path.name()) {
                    continue;
                }
            }
            let spec = engine.spec_for_remote(&object, false)?;
            let child = request.path().join(&spec.relative_name);
            engine
                .retained_identities
                .insert(child, Arc::new(spec.identity.clone()));
            specs.push(spec);
        }
        Ok(specs)
    }
}

impl SyncFilter for Dispatcher {
    fn fetch_placeholders(
        &self,
        request: Request,
        ticket: ticket::FetchPlaceholders,
        pattern: Option<String>,
    ) {
        let Some(pass) = self.engine.gate.try_enter() else {
            let _ = ticket.fail(SyncErrorKind::Cancelled);
            return;
        };
        if self.process_excluded(&request) {
            info!(
                path = %request.path().display(),
                "enumeration from excluded process answered empty"
            );
            let _ = ticket.pass(Vec::new());
            return;
        }

        let engine = self.engine.clone();
        self.engine.runtime.spawn(async move {
            let _pass = pass;
            if !engine.remote.connected() {
                let _ = ticket.fail(SyncErrorKind::NetworkUnavailable);
                return;
            }
            match Dispatcher::enumerate(&engine, &request, pattern).await {
                Ok(specs) => {
                    if let Err(error) = ticket.pass(specs) {
                        warn!(%error, "placeholder transfer failed");
                    }
                }
                Err(error) => {
                    warn!(path = %request.path().display(), %error, "enumeration failed");
                    let _ = ticket.fail(error.kind());
                }
            }
        });
    }

    fn cancel_fetch_placeholders(&self, request: Request) {
        debug!(path = %request.path().display(), "enumeration cancelled by kernel");
    }

    fn fetch_data(&self, request: Request, ticket: ticket::FetchData, range: FetchRange) {
        let Some(pass) = self.engine.gate.try_enter() else {
            let _ = ticket.fail(SyncErrorKind::Cancelled);
            return;
        };
        let engine = self.engine.clone();
        let runtime = self.engine.runtime.clone();
        self.engine.fetch_tasks.spawn_on(
            async move {
                engine.run_fetch(request, ticket, range, pass).await;
            },
            &runtime,
        );
    }

    fn cancel_fetch_data(&self, request: Request, range: FetchRange) {
        let id = crate::fetch::FetchId::new(request.path(), range.offset, range.length);
        self.engine.cancel_fetch(&id);
    }

    fn opened(&self, request: Request) {
        debug!(path = %request.path().display(), "placeholder opened");
    }

    fn closed(&self, request: Request, modified: bool, deleted: bool) {
        let Some(_pass) = self.engine.gate.try_enter() else {
            return;
        };
        if !modified || deleted {
            return;
        }
        // Only plain local files and dirty hydrated placeholders go to
        // upload; in-sync and still-partial placeholders are the engine's
        // own traffic.
        match self.engine.store.read(request.path()) {
            Ok(None) => {}
            Ok(Some(state)) if !state.in_sync && !state.partial => {}
            _ => return,
        }
        let engine = self.engine.clone();
        self.engine.runtime.spawn(async move {
            if let Err(error) = engine.upload_file(request.path().to_path_buf()).await {
                warn!(path = %request.path().display(), %error, "upload after close failed");
            }
        });
    }

    fn delete(&self, request: Request, ticket: ticket::Delete, is_directory: bool) {
        let Some(_pass) = self.engine.gate.try_enter() else {
            let _ = ticket.fail(SyncErrorKind::Cancelled);
            return;
        };
        if let Err(error) = ticket.pass() {
            warn!(%error, "delete ack failed");
            return;
        }
        let engine = self.engine.clone();
        self.engine.runtime.spawn(async move {
            if let Err(error) = engine
                .delete_remote(request.path().to_path_buf(), is_directory)
                .await
            {
                warn!(path = %request.path().display(), %error, "remote delete failed");
            }
        });
    }

    fn deleted(&self, request: Request) {
        let Some(_pass) = self.engine.gate.try_enter() else {
            return;
        };
        let path = request.path().to_path_buf();
        if !self.engine.restore_queue.lock().contains(&path) {
            return;
        }
        let engine = self.engine.clone();
        self.engine.runtime.spawn(async move {
            if let Err(error) = engine.reinstate_placeholder(path.clone()).await {
                warn!(path = %path.display(), %error, "placeholder reinstatement failed");
            }
        });
    }

    fn rename(
        &self,
        request: Request,
        ticket: ticket::Rename,
        target: PathBuf,
        _is_directory: bool,
    ) {
        let Some(_pass) = self.engine.gate.try_enter() else {
            let _ = ticket.fail(SyncErrorKind::Cancelled);
            return;
        };
        debug!(
            from = %request.path().display(),
            to = %target.display(),
            "rename acknowledged"
        );
        if let Err(error) = ticket.pass() {
            warn!(%error, "rename ack failed");
        }
    }

    fn renamed(&self, request: Request, source: PathBuf) {
        let Some(_pass) = self.engine.gate.try_enter() else {
            return;
        };
        let engine = self.engine.clone();
        let target = request.path().to_path_buf();
        self.engine.runtime.spawn(async move {
            if let Err(error) = engine.rename_or_move(source.clone(), target.clone()).await {
                warn!(
                    from = %source.display(),
                    to = %target.display(),
                    %error,
                    "remote rename failed"
                );
            }
        });
    }
}
