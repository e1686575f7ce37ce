use std::path::PathBuf;

/// Coarse provider state communicated to the kernel so the shell renders
/// the matching badge on the sync root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Disabled,
    AuthenticationRequired,
    Disconnected,
    Connecting,
    Connected,
    Idle,
    Syncing,
}

/// Observable engine events, broadcast to any subscriber.
///
/// The engine never blocks on observers; lagging receivers miss events.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A fetch moved forward: `completed` of `total` bytes transferred.
    FetchProgress {
        path: PathBuf,
        completed: u64,
        total: u64,
    },
    /// The server refused a delete; the placeholder will be reinstated.
    DeleteDenied { path: PathBuf },
    /// A local file finished uploading and became an in-sync placeholder.
    UploadCompleted { path: PathBuf },
    /// A previously denied delete was rolled back from server metadata.
    PlaceholderReinstated { path: PathBuf },
    /// One change-log window was applied.
    ChangesApplied { count: usize },
}
