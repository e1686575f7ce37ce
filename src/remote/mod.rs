//! The consumed object-store interface.
//!
//! The engine core never talks wire protocols for metadata itself; a host
//! supplies an [`ObjectStore`] implementation backed by its client library.
//! Byte downloads are the one exception: the fetch pipeline issues ranged
//! HTTP requests directly against URLs minted by
//! [`ObjectStore::download_url`].

use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;
use url::Url;

/// Errors surfaced by the object-store client.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    Forbidden(String),

    /// The server provider is not connected.
    #[error("server unavailable")]
    Unavailable,

    #[error("remote task {0} failed")]
    TaskFailed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Identifier of the remote namespace a root maps onto.
///
/// The tag is explicit; nothing in the engine infers the namespace kind
/// from the shape or length of the id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostId {
    Personal(String),
    Team(String),
}

impl HostId {
    pub fn as_str(&self) -> &str {
        match self {
            HostId::Personal(id) | HostId::Team(id) => id,
        }
    }
}

/// A normalized remote path: `/`-separated, always starting with `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemotePath(String);

impl RemotePath {
    pub fn root() -> Self {
        Self("/".into())
    }

    pub fn new(path: impl AsRef<str>) -> Self {
        let raw = path.as_ref().replace('\\', "/");
        let mut normalized = String::with_capacity(raw.len() + 1);
        normalized.push('/');
        for part in raw.split('/').filter(|p| !p.is_empty()) {
            if !normalized.ends_with('/') {
                normalized.push('/');
            }
            normalized.push_str(part);
        }
        Self(normalized)
    }

    /// Builds a remote path from a path relative to the sync root.
    pub fn from_relative(relative: &Path) -> Self {
        Self::new(relative.to_string_lossy().as_ref())
    }

    pub fn join(&self, name: &str) -> Self {
        if self.0 == "/" {
            Self(format!("/{name}"))
        } else {
            Self(format!("{}/{name}", self.0))
        }
    }

    pub fn parent(&self) -> Option<Self> {
        if self.0 == "/" {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Final component; empty only for the root.
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The OS-relative path under the sync root.
    pub fn to_relative(&self) -> PathBuf {
        self.0.split('/').filter(|p| !p.is_empty()).collect()
    }
}

impl std::fmt::Display for RemotePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the caller may do with a remote object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    Owner,
    Writer,
    Reader,
}

/// A server-side file or folder.
#[derive(Debug, Clone)]
pub struct RemoteObject {
    pub path: RemotePath,
    pub size: u64,
    pub modified: SystemTime,
    pub version: String,
    pub version_info: Option<String>,
    pub folder: bool,
    pub access: AccessLevel,
}

/// Identifier of a long-running server task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskId(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Complete,
    Error,
}

/// Result of a `check upload` request.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub task: TaskId,
    pub target: RemotePath,
}

#[derive(Debug, Clone)]
pub struct RenameRequest {
    pub file: RemotePath,
    pub new_name: String,
}

#[derive(Debug, Clone)]
pub struct MoveRequest {
    pub file: RemotePath,
    pub to_dir: RemotePath,
}

#[derive(Debug, Clone)]
pub struct DeleteRequest {
    pub parent: RemotePath,
    pub names: Vec<String>,
    pub trash: bool,
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub target: RemotePath,
    pub size: u64,
    pub modified: SystemTime,
}

/// A remote event from the change log, in server order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Create,
    Delete,
    Copy,
    Move,
    Rename,
    Restore,
}

#[derive(Debug, Clone)]
pub struct ChangeEntry {
    pub action: ChangeAction,
    pub object: RemoteObject,
    /// Previous path for move/rename events.
    pub old_path: Option<RemotePath>,
    pub timestamp: SystemTime,
}

pub type ObjectStream = BoxStream<'static, Result<RemoteObject, RemoteError>>;

/// The object-store client consumed by the engine.
///
/// Implementations are expected to be cheap to clone behind an `Arc` and
/// safe to call concurrently; the engine issues parallel calls from the
/// reconciler and the gateway.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Lazily lists the direct children of a folder.
    async fn list(&self, host: &HostId, path: &RemotePath) -> Result<ObjectStream, RemoteError>;

    async fn info(&self, host: &HostId, path: &RemotePath) -> Result<RemoteObject, RemoteError>;

    async fn create_folder(
        &self,
        host: &HostId,
        parent: &RemotePath,
        name: &str,
    ) -> Result<(), RemoteError>;

    async fn rename(&self, host: &HostId, request: RenameRequest) -> Result<TaskId, RemoteError>;

    async fn move_object(&self, host: &HostId, request: MoveRequest)
        -> Result<TaskId, RemoteError>;

    /// Deletes to trash (or permanently when `trash` is unset).
    async fn delete(&self, host: &HostId, request: DeleteRequest) -> Result<TaskId, RemoteError>;

    async fn task_state(&self, host: &HostId, id: &TaskId) -> Result<TaskState, RemoteError>;

    async fn check_upload(
        &self,
        host: &HostId,
        request: UploadRequest,
    ) -> Result<UploadSession, RemoteError>;

    /// Streams the local file into the upload session.
    async fn upload(
        &self,
        host: &HostId,
        session: &UploadSession,
        local: &Path,
    ) -> Result<(), RemoteError>;

    /// Mints a byte-serving URL with bounded validity.
    async fn download_url(
        &self,
        host: &HostId,
        path: &RemotePath,
        version: &str,
    ) -> Result<Url, RemoteError>;

    /// Remote events in the half-open window `[from, to)`.
    async fn change_log(
        &self,
        host: &HostId,
        from: SystemTime,
        to: SystemTime,
    ) -> Result<Vec<ChangeEntry>, RemoteError>;

    /// Whether the provider currently has a live server connection.
    fn connected(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_path_normalizes_separators() {
        assert_eq!(RemotePath::new("a\\b/c").as_str(), "/a/b/c");
        assert_eq!(RemotePath::new("/a//b/").as_str(), "/a/b");
        assert_eq!(RemotePath::new("").as_str(), "/");
    }

    #[test]
    fn remote_path_parent_and_name() {
        let path = RemotePath::new("/a/b/c.txt");
        assert_eq!(path.name(), "c.txt");
        assert_eq!(path.parent().unwrap().as_str(), "/a/b");
        assert_eq!(RemotePath::new("/a").parent().unwrap().as_str(), "/");
        assert!(RemotePath::root().parent().is_none());
    }

    #[test]
    fn relative_round_trip() {
        let path = RemotePath::from_relative(Path::new("docs/q1/report.xlsx"));
        assert_eq!(path.as_str(), "/docs/q1/report.xlsx");
        assert_eq!(path.to_relative(), PathBuf::from("docs/q1/report.xlsx"));
    }
}
