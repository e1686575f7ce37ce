//! Sync-root lifecycle: registration, session start/stop, and safe
//! removal of a busy root.

mod lifecycle;
mod tombstone;

pub use lifecycle::{SyncSession, UnregisterMode};
pub use tombstone::cleanup_pending_deletes;

use crate::error::{Result, SyncError};

/// Shell icon used when the host does not supply one.
pub const DEFAULT_ICON: &str = "C:\\Windows\\System32\\imageres.dll,1525";

/// Registration limit for the provider blob.
const MAX_REGISTRATION_BLOB: usize = 65536;

/// Arguments for registering a sync root with the kernel.
#[derive(Debug, Clone)]
pub struct RootRegistration {
    /// Stable root id.
    pub id: String,
    /// Name shown in the shell's navigation pane.
    pub display_name: String,
    /// Icon resource string (`path,index`).
    pub icon: String,
    pub version: Option<String>,
    /// Opaque bytes stored with the registration.
    pub blob: Option<Vec<u8>>,
}

impl RootRegistration {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            icon: DEFAULT_ICON.to_string(),
            version: None,
            blob: None,
        }
    }

    pub fn icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = icon.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn blob(mut self, blob: Vec<u8>) -> Self {
        self.blob = Some(blob);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.display_name.trim().is_empty() {
            return Err(SyncError::InvalidRequest(
                "registration needs a display name".into(),
            ));
        }
        if self.id.is_empty()
            || self
                .id
                .chars()
                .any(|c| c.is_whitespace() || c == '/' || c == '\\')
        {
            return Err(SyncError::InvalidRequest(format!(
                "malformed root id {:?}",
                self.id
            )));
        }
        if self.icon.trim().is_empty() {
            return Err(SyncError::InvalidRequest(
                "registration needs an icon resource".into(),
            ));
        }
        if let Some(blob) = &self.blob {
            if blob.len() > MAX_REGISTRATION_BLOB {
                return Err(SyncError::InvalidRequest(format!(
                    "registration blob is {} bytes, limit is {MAX_REGISTRATION_BLOB}",
                    blob.len()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_accepts_defaults() {
        assert!(RootRegistration::new("root-A", "My Drive").validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_inputs() {
        assert!(RootRegistration::new("root-A", " ").validate().is_err());
        assert!(RootRegistration::new("", "Drive").validate().is_err());
        assert!(RootRegistration::new("a b", "Drive").validate().is_err());
        assert!(RootRegistration::new("a", "Drive")
            .icon("")
            .validate()
            .is_err());
        assert!(RootRegistration::new("a", "Drive")
            .blob(vec![0; MAX_REGISTRATION_BLOB + 1])
            .validate()
            .is_err());
    }
}
