//! In-memory versioned file store.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ratio_core::storage::{FileStore, validate_path};
use ratio_types::error::StorageError;
use ratio_types::storage::{AccessToken, FileMetadata, FileVersion};
use ratio_types::value::FileRef;

use super::{authorize, detect_mime, parse_version};

#[derive(Debug, Clone)]
struct StoredVersion {
    content: String,
    created_at: DateTime<Utc>,
}

/// Keeps every version of every file in a concurrent map.
///
/// When constructed with [`MemoryFileStore::with_token`], every call must
/// carry that token.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    files: DashMap<String, Vec<StoredVersion>>,
    required_token: Option<AccessToken>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: AccessToken) -> Self {
        Self {
            files: DashMap::new(),
            required_token: Some(token),
        }
    }

    /// Seed a file without a credential check.
    pub fn insert(&self, path: &str, content: &str) {
        self.files
            .entry(path.to_string())
            .or_default()
            .push(StoredVersion {
                content: content.to_string(),
                created_at: Utc::now(),
            });
    }

    fn check(&self, token: &AccessToken, path: &str) -> Result<(), StorageError> {
        authorize(self.required_token.as_ref(), token)?;
        validate_path(path)
    }

    /// Resolve a version number (1-based) for `path`.
    fn pick(path: &str, count: usize, version_id: Option<&str>) -> Result<usize, StorageError> {
        match version_id {
            None => Ok(count),
            Some(v) => {
                let n = parse_version(path, v)? as usize;
                if n > count {
                    return Err(StorageError::VersionNotFound {
                        path: path.to_string(),
                        version_id: v.to_string(),
                    });
                }
                Ok(n)
            }
        }
    }

    fn metadata(path: &str, versions: &[StoredVersion], n: usize) -> FileMetadata {
        let file = FileRef::new(path);
        let version = &versions[n - 1];
        FileMetadata {
            path: path.to_string(),
            file_name: file.file_name().to_string(),
            parent_directory: file.parent_directory().to_string(),
            mime_type: detect_mime(file.file_name()),
            size_bytes: version.content.len() as u64,
            version_id: format!("v{n}"),
            created_at: versions[0].created_at,
            updated_at: version.created_at,
        }
    }
}

impl FileStore for MemoryFileStore {
    fn read(
        &self,
        token: &AccessToken,
        path: &str,
        version_id: Option<&str>,
    ) -> Result<String, StorageError> {
        self.check(token, path)?;
        let versions = self
            .files
            .get(path)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        let n = Self::pick(path, versions.len(), version_id)?;
        Ok(versions[n - 1].content.clone())
    }

    fn describe(
        &self,
        token: &AccessToken,
        path: &str,
        version_id: Option<&str>,
    ) -> Result<FileMetadata, StorageError> {
        self.check(token, path)?;
        let versions = self
            .files
            .get(path)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        let n = Self::pick(path, versions.len(), version_id)?;
        Ok(Self::metadata(path, &versions, n))
    }

    fn list(&self, token: &AccessToken, directory: &str) -> Result<Vec<FileMetadata>, StorageError> {
        self.check(token, directory)?;
        let mut out: Vec<FileMetadata> = self
            .files
            .iter()
            .filter(|entry| FileRef::new(entry.key().as_str()).parent_directory() == directory)
            .map(|entry| Self::metadata(entry.key(), entry.value(), entry.value().len()))
            .collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    fn versions(&self, token: &AccessToken, path: &str) -> Result<Vec<FileVersion>, StorageError> {
        self.check(token, path)?;
        let versions = self
            .files
            .get(path)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        Ok(versions
            .iter()
            .enumerate()
            .map(|(i, v)| FileVersion {
                version_id: format!("v{}", i + 1),
                path: path.to_string(),
                size_bytes: v.content.len() as u64,
                created_at: v.created_at,
            })
            .collect())
    }

    fn write(
        &self,
        token: &AccessToken,
        path: &str,
        content: &str,
    ) -> Result<FileVersion, StorageError> {
        self.check(token, path)?;
        if path == "/" {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        let created_at = Utc::now();
        let mut versions = self.files.entry(path.to_string()).or_default();
        versions.push(StoredVersion {
            content: content.to_string(),
            created_at,
        });
        Ok(FileVersion {
            version_id: format!("v{}", versions.len()),
            path: path.to_string(),
            size_bytes: content.len() as u64,
            created_at,
        })
    }
}
