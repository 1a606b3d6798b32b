//! Observed object references and their deduplication identity.

use serde::{Deserialize, Serialize};

/// A single object version announced by a file-arrival notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileReference {
    /// Bucket or container name.
    pub bucket: String,
    /// Object key, already URL-decoded.
    pub key: String,
    /// Object size in bytes.
    pub size_bytes: u64,
    /// Opaque version token (ETag, version id or sequencer).
    pub fingerprint: String,
}

impl FileReference {
    pub fn new(
        bucket: impl Into<String>,
        key: impl Into<String>,
        size_bytes: u64,
        fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            size_bytes,
            fingerprint: fingerprint.into(),
        }
    }

    /// The `(bucket, key, fingerprint)` triple two notifications must share to
    /// describe the same physical object version.
    pub fn identity(&self) -> FileIdentity {
        FileIdentity {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            fingerprint: self.fingerprint.clone(),
        }
    }
}

impl std::fmt::Display for FileReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s3://{}/{} ({} bytes)", self.bucket, self.key, self.size_bytes)
    }
}

/// Deduplication identity of a [`FileReference`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileIdentity {
    pub bucket: String,
    pub key: String,
    pub fingerprint: String,
}

impl FileIdentity {
    /// Serialize the identity into the scheduler's run key.
    ///
    /// Each component is percent-encoded, so the single `/` and `:` separators
    /// never occur inside a component and distinct identities get distinct keys.
    pub fn run_key(&self) -> String {
        format!(
            "{}/{}:{}",
            urlencoding::encode(&self.bucket),
            urlencoding::encode(&self.key),
            urlencoding::encode(&self.fingerprint)
        )
    }
}
