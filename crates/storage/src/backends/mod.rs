//! Storage backend implementations.

pub mod filesystem;
#[cfg(feature = "mock")]
pub mod memory;
pub mod s3;
