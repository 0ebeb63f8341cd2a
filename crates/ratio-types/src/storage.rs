//! Storage metadata types.
//!
//! These model what the versioned file storage collaborator reports about
//! files and their versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Caller-scoped credential passed through to storage calls.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

/// Metadata for one file (at a specific version).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub path: String,
    pub file_name: String,
    pub parent_directory: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub version_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileMetadata {
    /// Look up a metadata field by name, as used by file attribute access.
    pub fn field(&self, name: &str) -> Option<Value> {
        let value = match name {
            "path" => Value::from(self.path.as_str()),
            "file_name" => Value::from(self.file_name.as_str()),
            "parent_directory" => Value::from(self.parent_directory.as_str()),
            "mime_type" => Value::from(self.mime_type.as_str()),
            "size_bytes" => Value::Number(self.size_bytes.into()),
            "version_id" => Value::from(self.version_id.as_str()),
            "created_at" => Value::from(self.created_at.to_rfc3339()),
            "updated_at" => Value::from(self.updated_at.to_rfc3339()),
            _ => return None,
        };
        Some(value)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self)
            .map(Value::from)
            .unwrap_or_default()
    }
}

/// One stored version of a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileVersion {
    pub version_id: String,
    pub path: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl FileVersion {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self)
            .map(Value::from)
            .unwrap_or_default()
    }
}
