//! File store trait.
//!
//! Path-addressed, versioned file storage. Every call carries the caller's
//! credential; the store decides what it grants.

use ratio_types::error::StorageError;
use ratio_types::storage::{AccessToken, FileMetadata, FileVersion};

/// Trait for versioned file storage.
///
/// Calls are synchronous: the transform pipeline that drives them runs inside
/// a single instance's event handler and never awaits.
pub trait FileStore: Send + Sync {
    /// Content of the latest version, or of `version_id` when given.
    fn read(
        &self,
        token: &AccessToken,
        path: &str,
        version_id: Option<&str>,
    ) -> Result<String, StorageError>;

    /// Metadata of the latest version, or of `version_id` when given.
    fn describe(
        &self,
        token: &AccessToken,
        path: &str,
        version_id: Option<&str>,
    ) -> Result<FileMetadata, StorageError>;

    /// Files directly inside `directory`, sorted by path.
    fn list(&self, token: &AccessToken, directory: &str) -> Result<Vec<FileMetadata>, StorageError>;

    /// All versions of a file, oldest first.
    fn versions(&self, token: &AccessToken, path: &str) -> Result<Vec<FileVersion>, StorageError>;

    /// Write a new version of a file, creating it if needed.
    fn write(
        &self,
        token: &AccessToken,
        path: &str,
        content: &str,
    ) -> Result<FileVersion, StorageError>;
}

/// Storage paths are absolute and never end in `/` (except the root itself).
pub fn validate_path(path: &str) -> Result<(), StorageError> {
    let valid = path == "/" || (path.starts_with('/') && !path.ends_with('/'));
    if valid && !path.contains("//") {
        Ok(())
    } else {
        Err(StorageError::InvalidPath(path.to_string()))
    }
}
