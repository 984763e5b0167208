//! Clearance Storage Library
//!
//! Storage abstraction over the object store holding uploaded files, with an S3
//! implementation (any S3-compatible service) and a local filesystem one.
//!
//! # Storage key format
//!
//! - **Unscanned**: `uploads/temp/{owner_user_id}/{file_id}`
//! - **Scanned**: `uploads/scanned/{owner_user_id}/{file_id}`
//!
//! Prefixes are configurable. Keys must not contain `..` segments or a leading `/`.
//! Key generation is centralized in the `keys` module so all callers stay consistent.

pub mod factory;
pub mod keys;
#[cfg(feature = "storage-local")]
pub mod local;
#[cfg(feature = "storage-s3")]
pub mod s3;
pub mod traits;

// Re-export commonly used types
pub use clearance_core::StorageBackend;
pub use factory::create_storage;
pub use keys::KeyLayout;
#[cfg(feature = "storage-local")]
pub use local::LocalStorage;
#[cfg(feature = "storage-s3")]
pub use s3::S3Storage;
pub use traits::{ByteStream, Storage, StorageError, StorageResult};
