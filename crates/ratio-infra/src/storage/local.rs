//! Local filesystem file store with version history.
//!
//! Storage paths map onto a root directory: `/notes/today.md` lives at
//! `{root}/notes/today.md`. Earlier versions are archived in a `.versions/`
//! subdirectory alongside each file.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ratio_core::storage::{FileStore, validate_path};
use ratio_types::error::StorageError;
use ratio_types::storage::{AccessToken, FileMetadata, FileVersion};
use ratio_types::value::FileRef;

use super::{authorize, detect_mime, parse_version};

const VERSIONS_DIR: &str = ".versions";

/// Filesystem-backed versioned store.
///
/// Directory layout:
/// ```text
/// {root}/notes/
///   today.md            (latest version, v3)
///   .versions/
///     today.md.v1
///     today.md.v2
/// ```
///
/// On each write the current file is copied to
/// `.versions/{name}.v{n}` before the new content replaces it.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
    required_token: Option<AccessToken>,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            required_token: None,
        }
    }

    pub fn with_token(root: impl Into<PathBuf>, token: AccessToken) -> Self {
        Self {
            root: root.into(),
            required_token: Some(token),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a storage path onto disk after validation.
    fn disk_path(&self, token: &AccessToken, path: &str) -> Result<PathBuf, StorageError> {
        authorize(self.required_token.as_ref(), token)?;
        validate_path(path)?;
        let relative = path.trim_start_matches('/');
        if relative
            .split('/')
            .any(|segment| segment == ".." || segment == "." || segment == VERSIONS_DIR)
        {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn version_path(file: &Path, n: u32) -> PathBuf {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dir = file.parent().unwrap_or(Path::new(""));
        dir.join(VERSIONS_DIR).join(format!("{name}.v{n}"))
    }

    /// Number of archived versions (the current file is `archived + 1`).
    fn archived_count(file: &Path) -> u32 {
        let mut n = 0;
        while Self::version_path(file, n + 1).is_file() {
            n += 1;
        }
        n
    }

    fn current(path: &str, file: &Path) -> Result<u32, StorageError> {
        if !file.is_file() {
            return Err(StorageError::NotFound(path.to_string()));
        }
        Ok(Self::archived_count(file) + 1)
    }

    /// Disk location of version `version_id` (or the latest).
    fn locate(
        path: &str,
        file: &Path,
        version_id: Option<&str>,
    ) -> Result<(PathBuf, u32), StorageError> {
        let latest = Self::current(path, file)?;
        let Some(v) = version_id else {
            return Ok((file.to_path_buf(), latest));
        };
        let n = parse_version(path, v)?;
        if n > latest {
            return Err(StorageError::VersionNotFound {
                path: path.to_string(),
                version_id: v.to_string(),
            });
        }
        if n == latest {
            Ok((file.to_path_buf(), n))
        } else {
            Ok((Self::version_path(file, n), n))
        }
    }

    fn modified(file: &Path) -> Result<DateTime<Utc>, StorageError> {
        let meta = fs::metadata(file)?;
        Ok(meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()))
    }

    fn metadata(path: &str, file: &Path, version_id: Option<&str>) -> Result<FileMetadata, StorageError> {
        let (location, n) = Self::locate(path, file, version_id)?;
        let reference = FileRef::new(path);
        let first = if n == 1 {
            location.clone()
        } else {
            Self::version_path(file, 1)
        };
        Ok(FileMetadata {
            path: path.to_string(),
            file_name: reference.file_name().to_string(),
            parent_directory: reference.parent_directory().to_string(),
            mime_type: detect_mime(reference.file_name()),
            size_bytes: fs::metadata(&location)?.len(),
            version_id: format!("v{n}"),
            created_at: Self::modified(&first)?,
            updated_at: Self::modified(&location)?,
        })
    }
}

impl FileStore for LocalFileStore {
    fn read(
        &self,
        token: &AccessToken,
        path: &str,
        version_id: Option<&str>,
    ) -> Result<String, StorageError> {
        let file = self.disk_path(token, path)?;
        let (location, _) = Self::locate(path, &file, version_id)?;
        let bytes = fs::read(&location)?;
        String::from_utf8(bytes).map_err(|_| StorageError::NotText(path.to_string()))
    }

    fn describe(
        &self,
        token: &AccessToken,
        path: &str,
        version_id: Option<&str>,
    ) -> Result<FileMetadata, StorageError> {
        let file = self.disk_path(token, path)?;
        Self::metadata(path, &file, version_id)
    }

    fn list(&self, token: &AccessToken, directory: &str) -> Result<Vec<FileMetadata>, StorageError> {
        let dir = self.disk_path(token, directory)?;
        if !dir.is_dir() {
            return Err(StorageError::NotFound(directory.to_string()));
        }

        let mut out = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = if directory == "/" {
                format!("/{name}")
            } else {
                format!("{directory}/{name}")
            };
            out.push(Self::metadata(&path, &entry.path(), None)?);
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    fn versions(&self, token: &AccessToken, path: &str) -> Result<Vec<FileVersion>, StorageError> {
        let file = self.disk_path(token, path)?;
        let latest = Self::current(path, &file)?;
        (1..=latest)
            .map(|n| -> Result<FileVersion, StorageError> {
                let location = if n == latest {
                    file.clone()
                } else {
                    Self::version_path(&file, n)
                };
                Ok(FileVersion {
                    version_id: format!("v{n}"),
                    path: path.to_string(),
                    size_bytes: fs::metadata(&location)?.len(),
                    created_at: Self::modified(&location)?,
                })
            })
            .collect()
    }

    fn write(
        &self,
        token: &AccessToken,
        path: &str,
        content: &str,
    ) -> Result<FileVersion, StorageError> {
        let file = self.disk_path(token, path)?;
        if path == "/" || file.is_dir() {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        let parent = file.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(parent.join(VERSIONS_DIR))?;

        let n = if file.is_file() {
            let previous = Self::archived_count(&file) + 1;
            fs::copy(&file, Self::version_path(&file, previous))?;
            previous + 1
        } else {
            1
        };
        fs::write(&file, content)?;
        tracing::debug!(path, version = n, "file version written");

        Ok(FileVersion {
            version_id: format!("v{n}"),
            path: path.to_string(),
            size_bytes: content.len() as u64,
            created_at: Self::modified(&file)?,
        })
    }
}
