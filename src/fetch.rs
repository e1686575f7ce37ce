//! The chunked on-demand data fetch pipeline.
//!
//! Each fetch-data callback becomes one [`SyncEngine::run_fetch`] task:
//! resolve a byte-serving URL (cached per path), issue a single ranged
//! GET, stream the body to the kernel in fixed buffers, report progress
//! per chunk, and terminate with exactly one status. Cancellation is
//! cooperative at chunk boundaries.

use std::{path::Path, sync::atomic::Ordering};

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::{
    engine::SyncEngine,
    error::{Result, SyncError, SyncErrorKind},
    events::SyncEvent,
    gate::GatePass,
    identity::FileIdentity,
    kernel::{ticket, FetchRange, Request},
    remote::{RemoteError, RemotePath},
};

/// De-duplication key for outstanding byte fetches:
/// `normalized-path | offset | length`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct FetchId(String);

impl FetchId {
    pub fn new(path: &Path, offset: u64, length: u64) -> Self {
        let normalized = path
            .to_string_lossy()
            .replace('\\', "/")
            .to_lowercase();
        Self(format!("{normalized}|{offset}|{length}"))
    }
}

pub(crate) struct FetchEntry {
    pub sequence: u64,
    pub token: CancellationToken,
}

impl SyncEngine {
    /// Registers a cancellation handle under the fetch-id. A duplicate
    /// registration replaces the previous handle, so at most one is ever
    /// stored per (path, offset, length).
    pub(crate) fn register_fetch(&self, id: FetchId) -> (u64, CancellationToken) {
        let sequence = self.fetch_sequence.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        self.fetches.lock().insert(
            id,
            FetchEntry {
                sequence,
                token: token.clone(),
            },
        );
        (sequence, token)
    }

    /// De-registers the handle, unless a newer registration replaced it.
    pub(crate) fn unregister_fetch(&self, id: &FetchId, sequence: u64) {
        let mut fetches = self.fetches.lock();
        if fetches.get(id).map(|e| e.sequence) == Some(sequence) {
            fetches.remove(id);
        }
    }

    /// Trips the cancellation handle registered under the fetch-id.
    pub(crate) fn cancel_fetch(&self, id: &FetchId) {
        if let Some(entry) = self.fetches.lock().get(id) {
            entry.token.cancel();
        }
    }

    pub(crate) fn cancel_all_fetches(&self) {
        for entry in self.fetches.lock().values() {
            entry.token.cancel();
        }
    }

    /// Runs one fetch to completion and answers the kernel exactly once.
    pub(crate) async fn run_fetch(
        &self,
        request: Request,
        ticket: ticket::FetchData,
        range: FetchRange,
        pass: GatePass,
    ) {
        let id = FetchId::new(request.path(), range.offset, range.length);
        let (sequence, token) = self.register_fetch(id.clone());

        match self.fetch_bytes(&request, &ticket, range, &token).await {
            Ok(transferred) => {
                debug!(path = %request.path().display(), transferred, "fetch complete");
            }
            Err(error) => {
                let status = if token.is_cancelled() || matches!(error, SyncError::Cancelled) {
                    SyncErrorKind::Cancelled
                } else {
                    self.byte_urls.invalidate(&request.path().to_path_buf());
                    error.kind()
                };
                warn!(path = %request.path().display(), %error, ?status, "fetch failed");
                if let Err(reply_error) = ticket.fail(status) {
                    warn!(%reply_error, "fetch terminal status reply failed");
                }
            }
        }

        self.unregister_fetch(&id, sequence);
        drop(pass);
    }

    /// Streams `[offset, offset+length)` to the kernel in ascending byte
    /// order. Returns the transferred byte count.
    async fn fetch_bytes(
        &self,
        request: &Request,
        ticket: &ticket::FetchData,
        range: FetchRange,
        token: &CancellationToken,
    ) -> Result<u64> {
        if range.length == 0 {
            return Ok(0);
        }
        let identity = FileIdentity::from_blob(request.identity())?;
        let url = self.resolve_byte_url(request.path(), &identity).await?;

        let file_size = request.file_size();
        let ranged = range.offset > 0 || range.length < file_size;
        let mut http_request = self.http.get(url);
        if ranged {
            http_request = http_request.header(
                reqwest::header::RANGE,
                format!("bytes={}-{}", range.offset, range.offset + range.length - 1),
            );
        }
        let response = http_request.send().await.map_err(RemoteError::from)?;
        if !response.status().is_success() {
            return Err(SyncError::Unsuccessful(format!(
                "byte fetch returned {}",
                response.status()
            )));
        }

        let chunk_len = self.config.chunk_len();
        let total = range.length;
        let mut offset = range.offset;
        let mut completed = 0u64;
        let mut buffer: Vec<u8> = Vec::with_capacity(chunk_len);
        let mut body = response.bytes_stream();

        loop {
            if token.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let piece = match body.next().await {
                Some(piece) => piece.map_err(RemoteError::from)?,
                None => break,
            };
            buffer.extend_from_slice(&piece);
            while buffer.len() >= chunk_len && completed < total {
                let taken = self.flush_chunk(
                    request.path(),
                    ticket,
                    &mut buffer,
                    chunk_len,
                    &mut offset,
                    &mut completed,
                    total,
                )?;
                if taken == 0 {
                    break;
                }
                if token.is_cancelled() {
                    return Err(SyncError::Cancelled);
                }
            }
        }
        while !buffer.is_empty() && completed < total {
            self.flush_chunk(
                request.path(),
                ticket,
                &mut buffer,
                chunk_len,
                &mut offset,
                &mut completed,
                total,
            )?;
        }

        if completed < total {
            return Err(SyncError::Unsuccessful(format!(
                "byte fetch body ended after {completed} of {total} bytes"
            )));
        }
        if range.offset + completed >= file_size {
            // The range reached end-of-file; the cached URL is spent.
            self.byte_urls.invalidate(&request.path().to_path_buf());
        }
        Ok(completed)
    }

    #[allow(clippy::too_many_arguments)]
    fn flush_chunk(
        &self,
        path: &Path,
        ticket: &ticket::FetchData,
        buffer: &mut Vec<u8>,
        chunk_len: usize,
        offset: &mut u64,
        completed: &mut u64,
        total: u64,
    ) -> Result<usize> {
        let remaining = (total - *completed) as usize;
        let take = buffer.len().min(chunk_len).min(remaining);
        if take == 0 {
            return Ok(0);
        }
        ticket.write(*offset, &buffer[..take])?;
        buffer.drain(..take);
        *offset += take as u64;
        *completed += take as u64;
        ticket.progress(total, *completed)?;
        self.emit(SyncEvent::FetchProgress {
            path: path.to_path_buf(),
            completed: *completed,
            total,
        });
        Ok(take)
    }

    async fn resolve_byte_url(&self, local: &Path, identity: &FileIdentity) -> Result<Url> {
        let key = local.to_path_buf();
        if let Some(url) = self.byte_urls.get(&key) {
            return Ok(url);
        }
        let url = self
            .remote
            .download_url(
                &self.host,
                &RemotePath::new(&identity.path),
                &identity.version,
            )
            .await?;
        self.byte_urls.insert(key, url.clone());
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    #[test]
    fn fetch_id_normalizes_case_and_separators() {
        let a = FetchId::new(Path::new("C:\\Root\\A.TXT"), 0, 11);
        let b = FetchId::new(Path::new("c:/root/a.txt"), 0, 11);
        assert_eq!(a, b);
    }

    #[test]
    fn fetch_id_distinguishes_ranges() {
        let a = FetchId::new(Path::new("/r/a.txt"), 0, 11);
        let b = FetchId::new(Path::new("/r/a.txt"), 11, 11);
        assert_ne!(a, b);
    }
}
