use thiserror::Error;

/// Errors reported by the file storage collaborator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("version '{version_id}' not found for {path}")]
    VersionNotFound { path: String, version_id: String },

    #[error("invalid path '{0}': must be absolute and must not end with '/'")]
    InvalidPath(String),

    #[error("access denied")]
    AccessDenied,

    #[error("storage access requires a caller credential")]
    MissingCredential,

    #[error("no file store is configured")]
    Unavailable,

    #[error("file is not valid UTF-8 text: {0}")]
    NotText(String),

    #[error("storage io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(err.to_string()),
            _ => StorageError::Io(err.to_string()),
        }
    }
}
