//! Test rig: a scripted object store, a minimal localhost HTTP server
//! with `Range` support, and an engine wired to the in-memory kernel
//! backend.

use std::{
    collections::HashMap,
    io::{Read, Write},
    net::TcpListener,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use futures_util::stream;
use parking_lot::Mutex;
use tokio::sync::Notify;
use url::Url;

use drive_sync::{
    config::SyncConfig,
    dispatcher::Dispatcher,
    engine::SyncEngine,
    kernel::{memory::MemoryCloud, SyncFilter, SyncRootRegistrar},
    remote::{
        AccessLevel, ChangeEntry, DeleteRequest, HostId, MoveRequest, ObjectStore, ObjectStream,
        RemoteError, RemoteObject, RemotePath, RenameRequest, TaskId, TaskState, UploadRequest,
        UploadSession,
    },
};

pub fn timestamp(secs: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
}

pub fn object(path: &str, size: u64, version: &str, folder: bool) -> RemoteObject {
    RemoteObject {
        path: RemotePath::new(path),
        size,
        modified: timestamp(1_704_067_200), // 2024-01-01T00:00:00Z
        version: version.to_string(),
        version_info: None,
        folder,
        access: AccessLevel::Owner,
    }
}

#[derive(Default)]
pub struct ScriptedState {
    pub objects: HashMap<String, RemoteObject>,
    pub bytes: HashMap<String, Vec<u8>>,
    pub forbidden_deletes: Vec<String>,
    pub changes: Vec<ChangeEntry>,
    pub renames: Vec<RenameRequest>,
    pub moves: Vec<MoveRequest>,
    pub deletes: Vec<DeleteRequest>,
    pub uploads: Vec<String>,
    pub next_version: u64,
}

/// An [`ObjectStore`] driven entirely by scripted state.
pub struct ScriptedStore {
    pub state: Mutex<ScriptedState>,
    pub connected: AtomicBool,
    pub base_url: Mutex<Option<Url>>,
    /// When set, `upload` waits here before returning.
    pub upload_barrier: Mutex<Option<Arc<Notify>>>,
    pub check_upload_calls: AtomicUsize,
}

impl ScriptedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ScriptedState {
                next_version: 100,
                ..Default::default()
            }),
            connected: AtomicBool::new(true),
            base_url: Mutex::new(None),
            upload_barrier: Mutex::new(None),
            check_upload_calls: AtomicUsize::new(0),
        })
    }

    pub fn put_object(&self, object: RemoteObject) {
        self.state
            .lock()
            .objects
            .insert(object.path.as_str().to_string(), object);
    }

    pub fn put_bytes(&self, path: &str, bytes: Vec<u8>) {
        self.state.lock().bytes.insert(path.to_string(), bytes);
    }

    pub fn object_at(&self, path: &str) -> Option<RemoteObject> {
        self.state.lock().objects.get(path).cloned()
    }

    fn bump_version(&self) -> String {
        let mut state = self.state.lock();
        state.next_version += 1;
        format!("v{}", state.next_version)
    }
}

#[async_trait]
impl ObjectStore for ScriptedStore {
    async fn list(&self, _host: &HostId, path: &RemotePath) -> Result<ObjectStream, RemoteError> {
        let children: Vec<_> = self
            .state
            .lock()
            .objects
            .values()
            .filter(|o| o.path.parent().as_ref().map(RemotePath::as_str) == Some(path.as_str()))
            .cloned()
            .map(Ok)
            .collect();
        Ok(Box::pin(stream::iter(children)))
    }

    async fn info(&self, _host: &HostId, path: &RemotePath) -> Result<RemoteObject, RemoteError> {
        self.object_at(path.as_str())
            .ok_or_else(|| RemoteError::NotFound(path.as_str().to_string()))
    }

    async fn create_folder(
        &self,
        _host: &HostId,
        parent: &RemotePath,
        name: &str,
    ) -> Result<(), RemoteError> {
        let version = self.bump_version();
        let path = parent.join(name);
        self.put_object(RemoteObject {
            folder: true,
            size: 0,
            version,
            ..object(path.as_str(), 0, "unused", true)
        });
        Ok(())
    }

    async fn rename(&self, _host: &HostId, request: RenameRequest) -> Result<TaskId, RemoteError> {
        let target = request
            .file
            .parent()
            .unwrap_or_else(RemotePath::root)
            .join(&request.new_name);
        let version = self.bump_version();
        {
            let mut state = self.state.lock();
            if let Some(mut moved) = state.objects.remove(request.file.as_str()) {
                moved.path = target.clone();
                moved.version = version;
                state.objects.insert(target.as_str().to_string(), moved);
            }
            state.renames.push(request);
        }
        Ok(TaskId("task-rename".into()))
    }

    async fn move_object(
        &self,
        _host: &HostId,
        request: MoveRequest,
    ) -> Result<TaskId, RemoteError> {
        let target = request.to_dir.join(request.file.name());
        let version = self.bump_version();
        {
            let mut state = self.state.lock();
            if let Some(mut moved) = state.objects.remove(request.file.as_str()) {
                moved.path = target.clone();
                moved.version = version;
                state.objects.insert(target.as_str().to_string(), moved);
            }
            state.moves.push(request);
        }
        Ok(TaskId("task-move".into()))
    }

    async fn delete(&self, _host: &HostId, request: DeleteRequest) -> Result<TaskId, RemoteError> {
        let mut state = self.state.lock();
        for name in &request.names {
            let full = request.parent.join(name);
            if state.forbidden_deletes.contains(&full.as_str().to_string()) {
                state.deletes.push(request.clone());
                return Err(RemoteError::Forbidden(full.as_str().to_string()));
            }
            state.objects.remove(full.as_str());
        }
        state.deletes.push(request);
        Ok(TaskId("task-delete".into()))
    }

    async fn task_state(&self, _host: &HostId, _id: &TaskId) -> Result<TaskState, RemoteError> {
        Ok(TaskState::Complete)
    }

    async fn check_upload(
        &self,
        _host: &HostId,
        request: UploadRequest,
    ) -> Result<UploadSession, RemoteError> {
        self.check_upload_calls.fetch_add(1, Ordering::SeqCst);
        Ok(UploadSession {
            task: TaskId(format!("task-upload-{}", request.target)),
            target: request.target,
        })
    }

    async fn upload(
        &self,
        _host: &HostId,
        session: &UploadSession,
        local: &Path,
    ) -> Result<(), RemoteError> {
        let barrier = self.upload_barrier.lock().clone();
        if let Some(barrier) = barrier {
            barrier.notified().await;
        }
        let bytes = std::fs::read(local)?;
        let version = self.bump_version();
        let mut uploaded = object(session.target.as_str(), bytes.len() as u64, &version, false);
        uploaded.modified = SystemTime::now();
        {
            let mut state = self.state.lock();
            state.bytes.insert(session.target.as_str().to_string(), bytes);
            state.uploads.push(session.target.as_str().to_string());
        }
        self.put_object(uploaded);
        Ok(())
    }

    async fn download_url(
        &self,
        _host: &HostId,
        path: &RemotePath,
        _version: &str,
    ) -> Result<Url, RemoteError> {
        let base = self
            .base_url
            .lock()
            .clone()
            .ok_or_else(|| RemoteError::Protocol("no byte server".into()))?;
        base.join(path.as_str())
            .map_err(|e| RemoteError::Protocol(e.to_string()))
    }

    async fn change_log(
        &self,
        _host: &HostId,
        _from: SystemTime,
        _to: SystemTime,
    ) -> Result<Vec<ChangeEntry>, RemoteError> {
        Ok(std::mem::take(&mut self.state.lock().changes))
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Per-request record from the byte server.
#[derive(Debug, Clone)]
pub struct ServedRequest {
    pub path: String,
    pub range: Option<String>,
}

pub struct ByteServer {
    pub base: Url,
    pub requests: Arc<Mutex<Vec<ServedRequest>>>,
}

/// Serves the scripted byte map over HTTP with single-range support.
/// `chunk_delay` slows the body down so cancellation can land mid-fetch.
pub fn spawn_byte_server(store: &Arc<ScriptedStore>, chunk_delay: Option<Duration>) -> ByteServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind byte server");
    let addr = listener.local_addr().expect("server addr");
    let requests: Arc<Mutex<Vec<ServedRequest>>> = Arc::new(Mutex::new(Vec::new()));

    let store = store.clone();
    let seen = requests.clone();
    std::thread::spawn(move || {
        for connection in listener.incoming() {
            let Ok(mut connection) = connection else {
                continue;
            };
            let store = store.clone();
            let seen = seen.clone();
            std::thread::spawn(move || {
                let mut raw = Vec::new();
                let mut buf = [0u8; 1024];
                while !raw.windows(4).any(|w| w == b"\r\n\r\n") {
                    match connection.read(&mut buf) {
                        Ok(0) | Err(_) => return,
                        Ok(n) => raw.extend_from_slice(&buf[..n]),
                    }
                }
                let text = String::from_utf8_lossy(&raw);
                let mut lines = text.lines();
                let request_line = lines.next().unwrap_or_default();
                let path = request_line.split(' ').nth(1).unwrap_or("/").to_string();
                let range = lines
                    .filter_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("range")
                            .then(|| value.trim().to_string())
                    })
                    .next();
                seen.lock().push(ServedRequest {
                    path: path.clone(),
                    range: range.clone(),
                });

                let body = store.state.lock().bytes.get(&path).cloned();
                let Some(body) = body else {
                    let _ = connection.write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n");
                    return;
                };
                let (status, slice) = match range.as_deref() {
                    Some(range) => {
                        let spec = range.trim_start_matches("bytes=");
                        let (start, end) = spec.split_once('-').unwrap_or(("0", ""));
                        let start: usize = start.parse().unwrap_or(0);
                        let end: usize = end
                            .parse::<usize>()
                            .map(|e| (e + 1).min(body.len()))
                            .unwrap_or(body.len());
                        ("206 Partial Content", body[start.min(body.len())..end].to_vec())
                    }
                    None => ("200 OK", body),
                };
                let header = format!(
                    "HTTP/1.1 {status}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    slice.len()
                );
                if connection.write_all(header.as_bytes()).is_err() {
                    return;
                }
                for chunk in slice.chunks(1024) {
                    if connection.write_all(chunk).is_err() {
                        return;
                    }
                    if let Some(delay) = chunk_delay {
                        std::thread::sleep(delay);
                    }
                }
            });
        }
    });

    let base = Url::parse(&format!("http://{addr}")).expect("server url");
    ByteServer { base, requests }
}

pub struct TestRig {
    pub root: tempfile::TempDir,
    pub kernel: Arc<MemoryCloud>,
    pub store: Arc<ScriptedStore>,
    pub engine: Arc<SyncEngine>,
    pub filter: Arc<dyn SyncFilter>,
    pub server: ByteServer,
}

/// Short timeouts so shutdown scenarios finish quickly.
pub fn test_config() -> SyncConfig {
    SyncConfig {
        dispatch_drain_timeout: Duration::from_millis(300),
        queue_drain_timeout: Duration::from_secs(5),
        fetch_drain_timeout: Duration::from_secs(5),
        task_poll_min_delay: Duration::from_millis(10),
        task_poll_max_delay: Duration::from_millis(20),
        change_poll_interval: Duration::from_millis(200),
        ..SyncConfig::default()
    }
}

/// Builds an engine wired to the memory backend and connects a
/// dispatcher, without the session loops.
pub fn rig_with(chunk_delay: Option<Duration>) -> TestRig {
    let root = tempfile::tempdir().expect("tempdir");
    let kernel = MemoryCloud::new();
    let store = ScriptedStore::new();
    let server = spawn_byte_server(&store, chunk_delay);
    *store.base_url.lock() = Some(server.base.clone());

    let engine = SyncEngine::builder()
        .config(test_config())
        .host(HostId::Personal("u100".into()))
        .root(root.path())
        .remote(store.clone())
        .kernel(kernel.clone())
        .build()
        .expect("engine");
    let dispatcher = Dispatcher::new(engine.clone());
    let filter: Arc<dyn SyncFilter> = dispatcher;
    kernel
        .connect(root.path(), filter.clone())
        .expect("connect");

    TestRig {
        root,
        kernel,
        store,
        engine,
        filter,
        server,
    }
}

pub fn rig() -> TestRig {
    rig_with(None)
}

/// Polls `probe` until it returns true or the timeout elapses.
pub async fn wait_until(timeout: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if probe() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    probe()
}
