//! Object key layout.
//!
//! Unscanned objects live at `{temp_prefix}/{owner}/{file_id}`; scanned objects at
//! `{scanned_prefix}/{owner}/{file_id}`. Both backends use the same layout.

use crate::{StorageError, StorageResult};
use clearance_core::constants::{DEFAULT_SCANNED_KEY_PREFIX, DEFAULT_TEMP_KEY_PREFIX};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    temp_prefix: String,
    scanned_prefix: String,
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self::new(DEFAULT_TEMP_KEY_PREFIX, DEFAULT_SCANNED_KEY_PREFIX)
    }
}

impl KeyLayout {
    pub fn new(temp_prefix: impl Into<String>, scanned_prefix: impl Into<String>) -> Self {
        Self {
            temp_prefix: temp_prefix.into().trim_end_matches('/').to_string(),
            scanned_prefix: scanned_prefix.into().trim_end_matches('/').to_string(),
        }
    }

    /// Key of an object that still awaits scanning.
    pub fn temp_key(&self, owner_user_id: &str, file_id: &str) -> StorageResult<String> {
        build_key(&self.temp_prefix, owner_user_id, file_id)
    }

    /// Key an object is moved to once it has been scanned.
    pub fn scanned_key(&self, owner_user_id: &str, file_id: &str) -> StorageResult<String> {
        build_key(&self.scanned_prefix, owner_user_id, file_id)
    }
}

/// Check a full object key: relative, `/`-separated, every segment valid.
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() || key.starts_with('/') {
        return Err(StorageError::InvalidKey(format!("invalid key: {:?}", key)));
    }
    key.split('/').try_for_each(validate_segment)
}

fn build_key(prefix: &str, owner_user_id: &str, file_id: &str) -> StorageResult<String> {
    validate_segment(owner_user_id)?;
    validate_segment(file_id)?;
    Ok(format!("{}/{}/{}", prefix, owner_user_id, file_id))
}

/// Owner ids and file ids become single key segments and must not smuggle
/// separators or traversal sequences into the key.
fn validate_segment(segment: &str) -> StorageResult<()> {
    if segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains('/')
        || segment.contains('\\')
        || segment.chars().any(char::is_control)
    {
        return Err(StorageError::InvalidKey(format!(
            "invalid key segment: {:?}",
            segment
        )));
    }
    Ok(())
}
