//! Content digests and identity keys.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

use crate::SHARD_COUNT;

/// A SHA-256 content hash of a photo's raw bytes.
///
/// This is the global identity of a photo's content: two byte-identical photos
/// share one digest regardless of where they came from. Immutable once
/// computed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Compute the SHA-256 digest of data.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Create an incremental hasher.
    pub fn hasher() -> DigestHasher {
        DigestHasher(Sha256::new())
    }

    /// Parse from a lowercase hex string.
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        if s.len() != 64 {
            return Err(crate::Error::InvalidDigest(format!(
                "expected 64 hex chars, got {}",
                s.len()
            )));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex_str = std::str::from_utf8(chunk)
                .map_err(|e| crate::Error::InvalidDigest(e.to_string()))?;
            bytes[i] = u8::from_str_radix(hex_str, 16)
                .map_err(|e| crate::Error::InvalidDigest(e.to_string()))?;
        }
        Ok(Self(bytes))
    }

    /// Encode as a lowercase hex string.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// The catalog shard this digest belongs to: its leading hex nibble.
    ///
    /// A pure function of the digest, so an entry can never move between
    /// shards.
    pub fn shard_index(&self) -> usize {
        (self.0[0] >> 4) as usize
    }

    /// The two-hex-char disk bucket for this digest (256 buckets).
    pub fn bucket(&self) -> String {
        format!("{:02x}", self.0[0])
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// Digests appear in JSON documents (manifest, cache sidecars), so serialize
// as hex strings rather than byte arrays.
impl Serialize for ContentDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Incremental SHA-256 hasher.
pub struct DigestHasher(Sha256);

impl DigestHasher {
    /// Update the hasher with data.
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Finalize and return the digest.
    pub fn finalize(self) -> ContentDigest {
        ContentDigest(self.0.finalize().into())
    }
}

/// Cache key for the identity-key cache: path digest + size + mtime.
///
/// Used only to avoid rehashing unchanged files. Never an identity for the
/// photo itself; any change to size or mtime invalidates the key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    /// Digest of the normalized, lower-cased file path.
    pub path_digest: ContentDigest,
    /// File size in bytes.
    pub file_size: u64,
    /// Modification time in whole seconds since the Unix epoch.
    pub mtime_secs: i64,
}

impl IdentityKey {
    /// Build an identity key for a file path and its stat triple.
    ///
    /// The path is normalized and lower-cased before hashing so the key is
    /// stable across case-insensitive filesystems.
    pub fn for_path(path: &Path, file_size: u64, mtime_secs: i64) -> Self {
        let normalized = path.to_string_lossy().replace('\\', "/").to_lowercase();
        Self {
            path_digest: ContentDigest::compute(normalized.as_bytes()),
            file_size,
            mtime_secs,
        }
    }
}
