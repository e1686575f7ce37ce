//! Sync engine core for a cloud-files virtual drive.
//!
//! Exposes a remote object store as a virtualized local folder through the
//! operating system's cloud-files placeholder subsystem. The kernel
//! presents placeholder files and directories to user processes; when
//! those processes enumerate, open, read, rename or delete, the provider
//! answers the resulting callbacks, reconciles server and local state,
//! and keeps placeholder metadata consistent across crashes and
//! reconnects.
//!
//! The embedding host supplies an object-store client
//! ([`remote::ObjectStore`]) and picks a kernel backend, then drives the
//! engine through [`root::SyncSession`]:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # async fn demo(store: Arc<dyn drive_sync::remote::ObjectStore>) -> drive_sync::error::Result<()> {
//! use drive_sync::{engine::SyncEngine, kernel::memory::MemoryCloud, remote::HostId,
//!                  root::{RootRegistration, SyncSession, UnregisterMode}};
//!
//! let kernel = MemoryCloud::new();
//! let engine = SyncEngine::builder()
//!     .host(HostId::Personal("u100".into()))
//!     .root("/tmp/drive")
//!     .remote(store)
//!     .kernel(kernel)
//!     .build()?;
//! let mut session = SyncSession::start(engine, RootRegistration::new("root-A", "Drive")).await?;
//! // ...
//! session.stop(UnregisterMode::Keep).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod identity;
pub mod kernel;
pub mod reconcile;
pub mod remote;
pub mod root;

mod changes;
mod fetch;
mod gate;
mod gateway;
mod placeholder;
mod watcher;
