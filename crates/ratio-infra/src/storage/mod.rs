//! Versioned file storage backends.
//!
//! Implements the `FileStore` trait from `ratio-core`: an in-memory store for
//! embedding and tests, and a local filesystem store with version history.

use std::path::Path;

use ratio_types::storage::AccessToken;
use ratio_types::error::StorageError;

pub mod local;
pub mod memory;

pub use local::LocalFileStore;
pub use memory::MemoryFileStore;

/// Detect MIME type from file extension.
pub fn detect_mime(filename: &str) -> String {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    match ext.as_str() {
        // Text
        "txt" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "xml" => "text/xml",
        "yaml" | "yml" => "text/yaml",
        "toml" => "text/toml",
        "json" => "application/json",

        // Code
        "rs" => "text/x-rust",
        "py" => "text/x-python",
        "js" => "text/javascript",
        "sh" | "bash" => "text/x-shellscript",
        "sql" => "text/x-sql",

        // Binary
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "zip" => "application/zip",

        _ => "application/octet-stream",
    }
    .to_string()
}

/// Reject calls whose credential does not match the store's required token.
pub(crate) fn authorize(
    required: Option<&AccessToken>,
    token: &AccessToken,
) -> Result<(), StorageError> {
    match required {
        Some(expected) if expected != token => Err(StorageError::AccessDenied),
        _ => Ok(()),
    }
}

/// Parse `v{n}` into `n`, reporting `VersionNotFound` for anything else.
pub(crate) fn parse_version(path: &str, version_id: &str) -> Result<u32, StorageError> {
    version_id
        .strip_prefix('v')
        .and_then(|n| n.parse::<u32>().ok())
        .filter(|n| *n >= 1)
        .ok_or_else(|| StorageError::VersionNotFound {
            path: path.to_string(),
            version_id: version_id.to_string(),
        })
}
