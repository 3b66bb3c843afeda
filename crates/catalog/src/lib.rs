//! Sharded catalog and sync engine for Lightbox.
//!
//! The catalog partitions entries into 16 shards by the leading hex nibble of
//! their content digest. The sync engine keeps those shards in step with a
//! remote object store by comparing per-shard checksums against the remote
//! manifest and transferring only what differs.

pub mod catalog;
pub mod error;
pub mod resolver;
pub mod sync;

pub use catalog::{ShardCatalog, ShardState};
pub use error::{CatalogError, CatalogResult};
pub use sync::{ShardOutcome, SyncEngine, SyncSummary};
