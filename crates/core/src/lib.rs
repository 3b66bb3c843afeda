//! Core domain types and shared logic for the Lightbox photo catalog.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Content digests and identity keys
//! - Photo metadata
//! - Catalog entries and their local-only fields
//! - The deterministic shard CSV wire format
//! - The remote manifest and object key scheme
//! - Configuration types

pub mod config;
pub mod digest;
pub mod entry;
pub mod error;
pub mod manifest;
pub mod metadata;
pub mod wire;

pub use config::{AppConfig, CacheConfig, StorageConfig, SyncConfig};
pub use digest::{ContentDigest, DigestHasher, IdentityKey};
pub use entry::{BackupStatus, CatalogEntry, LocalFields};
pub use error::{Error, Result};
pub use manifest::Manifest;
pub use metadata::{GpsCoordinates, PhotoMetadata};

/// Number of catalog shards. Fixed by the wire format: a shard is selected by
/// the leading hex nibble of a content digest.
pub const SHARD_COUNT: usize = 16;
