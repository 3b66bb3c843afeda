//! Catalog entries: the synced unit of the shard catalog.

use crate::digest::ContentDigest;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Backup state of a photo. Local-only: never serialized to the shard wire
/// format and never uploaded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    #[default]
    None,
    Queued,
    Uploading,
    Uploaded,
    Failed,
}

/// Fields that exist only on this device.
///
/// They survive a remote-wins import by being carried forward keyed by
/// content digest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFields {
    /// User starred this photo on this device.
    #[serde(default)]
    pub starred: bool,
    /// Backup pipeline state for this photo.
    #[serde(default)]
    pub backup_status: BackupStatus,
}

/// One cataloged photo.
///
/// The synced fields (everything except `local`) always reflect the remote
/// after a sync; `local` is preserved across imports by digest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Content digest: the unique key of this entry.
    pub digest: ContentDigest,
    /// Original filename.
    pub filename: String,
    /// Original file size in bytes.
    pub file_size: u64,
    /// When the photo was taken (EXIF capture date, or file mtime fallback).
    #[serde(with = "time::serde::rfc3339")]
    pub photo_date: OffsetDateTime,
    /// File modification time.
    #[serde(with = "time::serde::rfc3339")]
    pub modified_date: OffsetDateTime,
    /// Pixel width, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    /// Pixel height, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Opaque identifier in the source library (platform photo ID etc.).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    /// Local-only fields, preserved across remote imports.
    #[serde(default)]
    pub local: LocalFields,
}

impl CatalogEntry {
    /// The shard this entry belongs to.
    pub fn shard_index(&self) -> usize {
        self.digest.shard_index()
    }

    /// Compare only the synced fields.
    ///
    /// Upserting an entry whose synced fields are unchanged must not mark the
    /// shard dirty, regardless of local-only fields.
    pub fn synced_eq(&self, other: &CatalogEntry) -> bool {
        self.digest == other.digest
            && self.filename == other.filename
            && self.file_size == other.file_size
            && self.photo_date == other.photo_date
            && self.modified_date == other.modified_date
            && self.width == other.width
            && self.height == other.height
            && self.source_id == other.source_id
    }
}
