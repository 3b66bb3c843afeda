//! Local caches for Lightbox.
//!
//! Two layers with different keys:
//! - [`IdentityKeyCache`]: (path, size, mtime) -> content digest, so rescans
//!   skip rehashing unchanged files
//! - [`DigestStore`]: content digest -> thumbnail + metadata, so each unique
//!   photo is decoded exactly once

pub mod error;
mod fsutil;
pub mod identity;
pub mod store;
pub mod thumbnail;

pub use error::{CacheError, CacheResult};
pub use identity::IdentityKeyCache;
pub use store::{CachedPhoto, DigestStore};
pub use thumbnail::RenderedPhoto;
