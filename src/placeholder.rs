//! The placeholder engine: state-machine policy over the raw
//! [`PlaceholderStore`] operations.
//!
//! Everything here is metadata-cheap except [`SyncEngine::hydrate`] and
//! the non-data-loss path of [`SyncEngine::revert`], which wait for bytes.
//! In-sync updates are optimistic: results are patched into a cached view
//! instead of reloading from disk; callers that need on-disk truth pass
//! `reload` to [`SyncEngine::read_placeholder`].

use std::path::Path;

use tracing::debug;

use crate::{
    engine::SyncEngine,
    error::{Result, SyncError},
    identity::{FileIdentity, MAX_IDENTITY_LEN},
    kernel::{
        ConvertOptions, PinState, PlaceholderMetadata, PlaceholderSpec, PlaceholderState,
        UpdateOptions,
    },
    remote::RemoteObject,
};

impl SyncEngine {
    /// Materializes a batch of placeholders under `parent`.
    pub fn create_placeholders(&self, parent: &Path, specs: Vec<PlaceholderSpec>) -> Result<()> {
        for spec in &specs {
            if spec.identity.len() > MAX_IDENTITY_LEN {
                return Err(SyncError::IdentityTooLarge {
                    len: spec.identity.len(),
                    max: MAX_IDENTITY_LEN,
                });
            }
        }
        debug!(parent = %parent.display(), count = specs.len(), "creating placeholders");
        self.store.create(parent, &specs)
    }

    /// Turns a regular file or directory into a placeholder.
    ///
    /// With `mark_in_sync` the current local bytes become authoritative
    /// for the recorded version; otherwise directories are switched to
    /// on-demand population.
    pub fn convert_to_placeholder(
        &self,
        path: &Path,
        mark_in_sync: bool,
        identity: &FileIdentity,
    ) -> Result<()> {
        let blob = identity.to_blob()?;
        self.store.convert(
            path,
            ConvertOptions {
                mark_in_sync,
                identity: blob,
                on_demand_children: !mark_in_sync,
            },
        )?;
        self.in_sync_cache
            .lock()
            .insert(path.to_path_buf(), mark_in_sync);
        Ok(())
    }

    /// Fetches the placeholder's full byte range.
    ///
    /// The kernel answers by issuing a fetch-data callback back into the
    /// dispatcher; this call resolves when that fetch terminates.
    pub async fn hydrate(&self, path: &Path) -> Result<()> {
        if self.store.read(path)?.is_none() {
            return Err(SyncError::NotACloudFile(path.to_path_buf()));
        }
        let store = self.store.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || store.hydrate(&path))
            .await
            .map_err(|e| SyncError::Unsuccessful(format!("hydrate task: {e}")))?
    }

    /// Drops local bytes but keeps the placeholder. Refused while pinned;
    /// optionally resets the pin state to unspecified on success.
    pub fn dehydrate(&self, path: &Path, clear_pin: bool) -> Result<()> {
        let state = self.read_placeholder(path, true)?;
        if state.pin_state == PinState::Pinned {
            return Err(SyncError::Pinned(path.to_path_buf()));
        }
        self.store.dehydrate(path)?;
        if clear_pin {
            self.store
                .set_pin_state(path, PinState::Unspecified, false)?;
        }
        Ok(())
    }

    /// Turns the placeholder back into a regular file.
    ///
    /// Without `allow_data_loss` the engine hydrates first and verifies
    /// the placeholder is in sync and not partial.
    pub async fn revert(&self, path: &Path, allow_data_loss: bool) -> Result<()> {
        if !allow_data_loss {
            self.hydrate(path).await?;
            let state = self.read_placeholder(path, true)?;
            if !state.in_sync || state.partial {
                return Err(SyncError::NotInSync(path.to_path_buf()));
            }
        }
        self.store.revert(path)?;
        self.in_sync_cache.lock().remove(path);
        Ok(())
    }

    /// Marks the placeholder in or out of sync. Idempotent; the result is
    /// cached without reloading metadata from disk.
    pub fn set_in_sync(&self, path: &Path, in_sync: bool) -> Result<()> {
        if self.in_sync_cache.lock().get(path) == Some(&in_sync) {
            return Ok(());
        }
        self.store.set_in_sync(path, in_sync)?;
        self.in_sync_cache
            .lock()
            .insert(path.to_path_buf(), in_sync);
        Ok(())
    }

    /// Sets the pin state, optionally for the whole subtree. Idempotent.
    pub fn set_pin_state(&self, path: &Path, state: PinState, recursive: bool) -> Result<()> {
        self.store.set_pin_state(path, state, recursive)
    }

    /// Switches a directory placeholder to lazy enumeration.
    pub fn enable_on_demand_population(&self, path: &Path) -> Result<()> {
        self.set_population(path, true)
    }

    /// Switches a directory placeholder back to eager enumeration. Both
    /// population flags are cleared unconditionally.
    pub fn disable_on_demand_population(&self, path: &Path) -> Result<()> {
        self.set_population(path, false)
    }

    fn set_population(&self, path: &Path, on_demand: bool) -> Result<()> {
        let state = self.read_placeholder(path, false)?;
        if !state.directory {
            return Err(SyncError::InvalidRequest(format!(
                "{} is not a directory placeholder",
                path.display()
            )));
        }
        self.store.update(
            path,
            UpdateOptions {
                on_demand_children: Some(on_demand),
                ..Default::default()
            },
        )
    }

    /// Updates metadata and identity in place; optionally invalidates the
    /// whole on-disk byte range.
    pub fn update_placeholder(&self, path: &Path, options: UpdateOptions) -> Result<()> {
        if let Some(identity) = &options.identity {
            if identity.len() > MAX_IDENTITY_LEN {
                return Err(SyncError::IdentityTooLarge {
                    len: identity.len(),
                    max: MAX_IDENTITY_LEN,
                });
            }
        }
        let mark_in_sync = options.mark_in_sync;
        self.store.update(path, options)?;
        if let Some(in_sync) = mark_in_sync {
            self.in_sync_cache
                .lock()
                .insert(path.to_path_buf(), in_sync);
        }
        Ok(())
    }

    /// Reads basic and standard placeholder info plus the identity blob.
    ///
    /// With `reload` unset the cached in-sync view is overlaid; with it
    /// set the on-disk state refreshes the cache.
    pub fn read_placeholder(&self, path: &Path, reload: bool) -> Result<PlaceholderState> {
        let mut state = self
            .store
            .read(path)?
            .ok_or_else(|| SyncError::NotACloudFile(path.to_path_buf()))?;
        let mut cache = self.in_sync_cache.lock();
        if reload {
            cache.insert(path.to_path_buf(), state.in_sync);
        } else if let Some(&cached) = cache.get(path) {
            state.in_sync = cached;
        }
        Ok(state)
    }

    /// Builds the create-info for one remote object.
    pub(crate) fn spec_for_remote(
        &self,
        object: &RemoteObject,
        in_sync: bool,
    ) -> Result<PlaceholderSpec> {
        let mut identity = FileIdentity::new(object.path.as_str(), object.version.clone());
        identity.version_info = object.version_info.clone();
        let mut spec = PlaceholderSpec::new(object.path.name(), remote_metadata(object))
            .identity(identity.to_blob()?);
        spec.in_sync = in_sync;
        Ok(spec)
    }
}

/// Placeholder metadata mirroring one remote object.
pub(crate) fn remote_metadata(object: &RemoteObject) -> PlaceholderMetadata {
    if object.folder {
        PlaceholderMetadata::directory()
    } else {
        PlaceholderMetadata::file().size(object.size)
    }
    .modified(object.modified)
    .created(object.modified)
    .accessed(object.modified)
}
