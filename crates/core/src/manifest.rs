//! The remote manifest and object key scheme.

use crate::digest::ContentDigest;
use crate::error::{Error, Result};
use crate::SHARD_COUNT;
use serde::{Deserialize, Serialize};

/// The remote's authoritative view of all 16 shard checksums at a point in
/// time.
///
/// `checksums[i]` is the SHA-256 of shard `i`'s serialized bytes, or `None`
/// when the shard has never been uploaded. The `etag` is the remote-assigned
/// freshness token for the manifest object itself, used to short-circuit a
/// re-fetch when nothing changed; it is not part of the manifest's own
/// serialized content.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Monotonic version, bumped by each publisher.
    pub version: u64,
    /// Per-shard checksums, indexed by leading hex nibble.
    pub checksums: [Option<ContentDigest>; SHARD_COUNT],
    /// Freshness token observed when this manifest was fetched.
    #[serde(skip)]
    pub etag: Option<String>,
}

impl Manifest {
    /// An empty manifest: no shards uploaded yet.
    pub fn empty() -> Self {
        Self {
            version: 0,
            checksums: [None; SHARD_COUNT],
            etag: None,
        }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Verify downloaded shard bytes against this manifest's checksum entry.
    ///
    /// Rejecting here is what keeps corrupt downloads out of local state.
    pub fn verify_shard(&self, shard_index: usize, bytes: &[u8]) -> Result<()> {
        let expected = self.checksums[shard_index].ok_or_else(|| Error::ChecksumMismatch {
            expected: "none".to_string(),
            actual: ContentDigest::compute(bytes).to_hex(),
        })?;
        let actual = ContentDigest::compute(bytes);
        if actual != expected {
            return Err(Error::ChecksumMismatch {
                expected: expected.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(())
    }
}

/// Object key for one shard's serialized entries.
///
/// The account prefix matches the remote's `catalogs/{user}/` namespace.
pub fn shard_key(account: &str, shard_index: usize) -> String {
    format!("catalogs/{account}/shards/{shard_index:x}.csv")
}

/// Object key for the account's manifest.
pub fn manifest_key(account: &str) -> String {
    format!("catalogs/{account}/manifest.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_json_roundtrip() {
        let mut manifest = Manifest::empty();
        manifest.version = 7;
        manifest.checksums[3] = Some(ContentDigest::compute(b"shard 3"));
        manifest.etag = Some("abc".to_string()); // not serialized

        let json = manifest.to_json().unwrap();
        let back = Manifest::from_json(&json).unwrap();
        assert_eq!(back.version, 7);
        assert_eq!(back.checksums, manifest.checksums);
        assert_eq!(back.etag, None);
    }

    #[test]
    fn test_verify_shard() {
        let bytes = b"record data\n";
        let mut manifest = Manifest::empty();
        manifest.checksums[0] = Some(ContentDigest::compute(bytes));

        assert!(manifest.verify_shard(0, bytes).is_ok());
        assert!(matches!(
            manifest.verify_shard(0, b"tampered"),
            Err(Error::ChecksumMismatch { .. })
        ));
        // No checksum recorded for shard 1.
        assert!(manifest.verify_shard(1, bytes).is_err());
    }

    #[test]
    fn test_key_scheme() {
        assert_eq!(shard_key("user-1", 10), "catalogs/user-1/shards/a.csv");
        assert_eq!(manifest_key("user-1"), "catalogs/user-1/manifest.json");
    }
}
