//! Credential-bound storage access with per-evaluation caching.

use std::cell::RefCell;
use std::collections::HashMap;

use ratio_types::error::StorageError;
use ratio_types::storage::{AccessToken, FileMetadata, FileVersion};
use ratio_types::value::FileRef;

use super::file_store::{FileStore, validate_path};

type VersionKey = (String, Option<String>);

/// Storage handle for one node preparation or completion.
///
/// Bundles the optional store with the caller's credential and memoizes
/// lookups, so a transform that touches the same file twice reads it once.
/// A missing credential is reported on first use, not at construction.
pub struct FileAccess<'a> {
    store: Option<&'a dyn FileStore>,
    token: Option<&'a AccessToken>,
    reads: RefCell<HashMap<VersionKey, String>>,
    descriptions: RefCell<HashMap<VersionKey, FileMetadata>>,
    listings: RefCell<HashMap<String, Vec<FileMetadata>>>,
    histories: RefCell<HashMap<String, Vec<FileVersion>>>,
}

impl<'a> FileAccess<'a> {
    pub fn new(store: Option<&'a dyn FileStore>, token: Option<&'a AccessToken>) -> Self {
        Self {
            store,
            token,
            reads: RefCell::new(HashMap::new()),
            descriptions: RefCell::new(HashMap::new()),
            listings: RefCell::new(HashMap::new()),
            histories: RefCell::new(HashMap::new()),
        }
    }

    /// Access with neither store nor credential; every call fails.
    pub fn none() -> Self {
        Self::new(None, None)
    }

    fn bind(&self) -> Result<(&'a dyn FileStore, &'a AccessToken), StorageError> {
        let token = self.token.ok_or(StorageError::MissingCredential)?;
        let store = self.store.ok_or(StorageError::Unavailable)?;
        Ok((store, token))
    }

    pub fn read(&self, path: &str, version_id: Option<&str>) -> Result<String, StorageError> {
        validate_path(path)?;
        let key = (path.to_string(), version_id.map(str::to_string));
        if let Some(hit) = self.reads.borrow().get(&key) {
            return Ok(hit.clone());
        }
        let (store, token) = self.bind()?;
        let content = store.read(token, path, version_id)?;
        self.reads.borrow_mut().insert(key, content.clone());
        Ok(content)
    }

    pub fn read_file(&self, file: &FileRef) -> Result<String, StorageError> {
        self.read(&file.path, file.version_id.as_deref())
    }

    pub fn describe(
        &self,
        path: &str,
        version_id: Option<&str>,
    ) -> Result<FileMetadata, StorageError> {
        validate_path(path)?;
        let key = (path.to_string(), version_id.map(str::to_string));
        if let Some(hit) = self.descriptions.borrow().get(&key) {
            return Ok(hit.clone());
        }
        let (store, token) = self.bind()?;
        let meta = store.describe(token, path, version_id)?;
        self.descriptions.borrow_mut().insert(key, meta.clone());
        Ok(meta)
    }

    pub fn list(&self, directory: &str) -> Result<Vec<FileMetadata>, StorageError> {
        validate_path(directory)?;
        if let Some(hit) = self.listings.borrow().get(directory) {
            return Ok(hit.clone());
        }
        let (store, token) = self.bind()?;
        let files = store.list(token, directory)?;
        self.listings
            .borrow_mut()
            .insert(directory.to_string(), files.clone());
        Ok(files)
    }

    pub fn versions(&self, path: &str) -> Result<Vec<FileVersion>, StorageError> {
        validate_path(path)?;
        if let Some(hit) = self.histories.borrow().get(path) {
            return Ok(hit.clone());
        }
        let (store, token) = self.bind()?;
        let versions = store.versions(token, path)?;
        self.histories
            .borrow_mut()
            .insert(path.to_string(), versions.clone());
        Ok(versions)
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::MockStore;
    use super::*;

    #[test]
    fn missing_credential_is_an_error() {
        let store = MockStore::default().with_file("/a.txt", "hello");
        let access = FileAccess::new(Some(&store), None);
        assert_eq!(
            access.read("/a.txt", None),
            Err(StorageError::MissingCredential)
        );
    }

    #[test]
    fn reads_are_cached() {
        let store = MockStore::default().with_file("/a.txt", "hello");
        let token = AccessToken::new("t");
        let access = FileAccess::new(Some(&store), Some(&token));
        assert_eq!(access.read("/a.txt", None).unwrap(), "hello");
        assert_eq!(access.read("/a.txt", None).unwrap(), "hello");
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalid_path_rejected_before_store() {
        let token = AccessToken::new("t");
        let access = FileAccess::new(None, Some(&token));
        assert!(matches!(
            access.read("relative.txt", None),
            Err(StorageError::InvalidPath(_))
        ));
        assert_eq!(access.list("/docs"), Err(StorageError::Unavailable));
    }
}
