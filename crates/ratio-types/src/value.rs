//! The closed value model flowing through references, conditions, and
//! transforms.
//!
//! `Value` mirrors JSON with one extra variant, `File`, for file-typed
//! arguments and responses. Each variant carries its own attribute table
//! (see [`Value::attribute`]), so reference resolution never has to reflect
//! over untyped data.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A value in an argument tree, step output, or transform context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<Value>),
    Object(BTreeMap<String, Value>),
    File(FileRef),
}

/// A pointer to a file in the storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
}

impl FileRef {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            version_id: None,
        }
    }

    /// Last path segment.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Everything before the last `/`; `/` for top-level files.
    pub fn parent_directory(&self) -> &str {
        match self.path.rfind('/') {
            Some(0) => "/",
            Some(idx) => &self.path[..idx],
            None => "",
        }
    }
}

/// The variant of a [`Value`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Bool,
    Number,
    String,
    List,
    Object,
    File,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "boolean",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::List => "list",
            ValueKind::Object => "object",
            ValueKind::File => "file",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of looking up one attribute on a value.
///
/// File content and storage metadata need the storage collaborator, so they
/// are returned as deferred lookups for the caller to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute<'a> {
    Value(Value),
    FileMetadata { file: &'a FileRef, field: &'a str },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AttributeError {
    #[error("attribute '{attribute}' is not available on {kind} values")]
    NotSupported { kind: ValueKind, attribute: String },

    #[error("index {index} out of range for list of length {len}")]
    IndexOutOfRange { index: i64, len: usize },
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::List(_) => ValueKind::List,
            Value::Object(_) => ValueKind::Object,
            Value::File(_) => ValueKind::File,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Build a number value. Non-finite floats become `Null`.
    pub fn from_f64(n: f64) -> Value {
        if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
            return Value::Number((n as i64).into());
        }
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }

    /// Text rendering used by `join`, `starts_with`, and group keys.
    ///
    /// Strings render without quotes; lists and objects render as JSON.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            Value::File(file) => file.path.clone(),
            Value::List(_) | Value::Object(_) => {
                serde_json::Value::from(self.clone()).to_string()
            }
        }
    }

    /// Look up a single attribute according to the variant's attribute table.
    ///
    /// - list: `length`, `first`, `last`, integer index (negative counts from
    ///   the end). `first`/`last` on an empty list are null.
    /// - object: any key; a missing key is null.
    /// - file: `path`, `file_name`, `parent_directory`; anything else is a
    ///   storage metadata field.
    /// - scalars: nothing.
    pub fn attribute<'a>(&'a self, name: &'a str) -> Result<Attribute<'a>, AttributeError> {
        match self {
            Value::List(items) => match name {
                "length" => Ok(Attribute::Value(Value::Number(items.len().into()))),
                "first" => Ok(Attribute::Value(items.first().cloned().unwrap_or_default())),
                "last" => Ok(Attribute::Value(items.last().cloned().unwrap_or_default())),
                other => {
                    let index: i64 = other.parse().map_err(|_| AttributeError::NotSupported {
                        kind: ValueKind::List,
                        attribute: other.to_string(),
                    })?;
                    let len = items.len();
                    let resolved = if index < 0 { len as i64 + index } else { index };
                    if resolved < 0 || resolved as usize >= len {
                        return Err(AttributeError::IndexOutOfRange { index, len });
                    }
                    Ok(Attribute::Value(items[resolved as usize].clone()))
                }
            },
            Value::Object(map) => Ok(Attribute::Value(map.get(name).cloned().unwrap_or_default())),
            Value::File(file) => match name {
                "path" => Ok(Attribute::Value(Value::String(file.path.clone()))),
                "file_name" => Ok(Attribute::Value(Value::String(file.file_name().to_string()))),
                "parent_directory" => Ok(Attribute::Value(Value::String(
                    file.parent_directory().to_string(),
                ))),
                field => Ok(Attribute::FileMetadata { file, field }),
            },
            scalar => Err(AttributeError::NotSupported {
                kind: scalar.kind(),
                attribute: name.to_string(),
            }),
        }
    }

    /// Walk a dotted path (`a.b.0.c`) through objects and lists.
    ///
    /// Numeric segments index lists. Returns `None` when any segment is missing.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut current = self;
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::List(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Ordering used by `sort` and the comparison operators.
    ///
    /// Only like-kinded scalars are comparable; numbers compare numerically.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Number(_), Value::Number(_)) => self.as_f64()?.partial_cmp(&other.as_f64()?),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::File(a), Value::File(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_string())
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
            ),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Number(n) => serde_json::Value::Number(n),
            Value::String(s) => serde_json::Value::String(s),
            Value::File(file) => serde_json::Value::String(file.path),
            Value::List(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Object(map)
    }
}
