use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Upper bound on the serialized identity blob, mirroring the kernel's
/// per-placeholder file identity limit.
pub const MAX_IDENTITY_LEN: usize = 4096;

/// The opaque per-placeholder bytes round-tripped through the kernel.
///
/// Carries the remote addressing for a placeholder: the logical path on
/// the server plus the version the local metadata was taken from. The
/// encoding is versioned JSON so that blobs written by older builds keep
/// deserializing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIdentity {
    /// Logical path of the object on the server.
    pub path: String,
    /// Version id the placeholder metadata was created from.
    pub version: String,
    /// Version-info id, when the server reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_info: Option<String>,
}

impl FileIdentity {
    pub fn new(path: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            version: version.into(),
            version_info: None,
        }
    }

    pub fn with_version_info(mut self, version_info: impl Into<String>) -> Self {
        self.version_info = Some(version_info.into());
        self
    }

    /// Serializes the identity, enforcing the kernel blob limit.
    pub fn to_blob(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| SyncError::InvalidRequest(format!("identity encode: {e}")))?;
        if bytes.len() > MAX_IDENTITY_LEN {
            return Err(SyncError::IdentityTooLarge {
                len: bytes.len(),
                max: MAX_IDENTITY_LEN,
            });
        }
        Ok(bytes)
    }

    /// Parses an identity blob handed back by the kernel.
    pub fn from_blob(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| SyncError::InvalidRequest(format!("identity decode: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn blob_round_trip() {
        let identity = FileIdentity::new("/docs/report.xlsx", "v42").with_version_info("vi-7");
        let blob = identity.to_blob().unwrap();
        assert_eq!(FileIdentity::from_blob(&blob).unwrap(), identity);
    }

    #[test]
    fn oversize_identity_is_rejected() {
        let identity = FileIdentity::new("x".repeat(MAX_IDENTITY_LEN), "v1");
        match identity.to_blob() {
            Err(SyncError::IdentityTooLarge { len, max }) => {
                assert!(len > max);
            }
            other => panic!("expected IdentityTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn garbage_blob_is_invalid_request() {
        assert!(matches!(
            FileIdentity::from_blob(b"\x00\x01not json"),
            Err(SyncError::InvalidRequest(_))
        ));
    }

    proptest! {
        #[test]
        fn round_trips_for_any_small_identity(
            path in "[a-zA-Z0-9/._ -]{0,512}",
            version in "[a-zA-Z0-9-]{0,64}",
            version_info in proptest::option::of("[a-zA-Z0-9-]{0,64}"),
        ) {
            let mut identity = FileIdentity::new(path, version);
            identity.version_info = version_info;
            let blob = identity.to_blob().unwrap();
            prop_assert!(blob.len() <= MAX_IDENTITY_LEN);
            prop_assert_eq!(FileIdentity::from_blob(&blob).unwrap(), identity);
        }

        #[test]
        fn distinct_addresses_produce_distinct_blobs(
            a in "[a-z0-9/]{1,64}", b in "[a-z0-9/]{1,64}",
            va in "[a-z0-9]{1,16}", vb in "[a-z0-9]{1,16}",
        ) {
            prop_assume!(a != b || va != vb);
            let blob_a = FileIdentity::new(a, va).to_blob().unwrap();
            let blob_b = FileIdentity::new(b, vb).to_blob().unwrap();
            prop_assert_ne!(blob_a, blob_b);
        }
    }
}
