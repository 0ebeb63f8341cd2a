//! Reference parsing and resolution.
//!
//! Grammar: `REF:<context>.<key>(.<attribute>)*`. Contexts:
//! - `arguments` -- the composite instance's validated arguments
//! - `self` -- the payload a transform block is shaping
//! - `execution` -- `REF:execution.<sibling>.status` yields a sibling's status
//! - anything else -- a sibling `execution_id`, whose recorded output must be terminal
//!
//! Attribute access follows the per-variant table on [`Value::attribute`].
//! A chain that ends on a file value resolves to the file's content.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use ratio_types::error::StorageError;
use ratio_types::process::ProcessStatus;
use ratio_types::value::{Attribute, AttributeError, Value};
use thiserror::Error;

use crate::storage::FileAccess;

pub const REF_PREFIX: &str = "REF:";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReferenceError {
    #[error("malformed reference '{reference}': {reason}")]
    Malformed { reference: String, reason: String },

    #[error("unknown execution id '{0}'")]
    UnknownExecution(String),

    #[error("execution '{0}' has not finished")]
    NotTerminal(String),

    #[error("unknown key '{key}' in context '{context}'")]
    UnknownKey { context: String, key: String },

    #[error("execution '{execution_id}' ended {status} and has no output")]
    NoOutput {
        execution_id: String,
        status: ProcessStatus,
    },

    #[error("'{reference}': {source}")]
    Attribute {
        reference: String,
        #[source]
        source: AttributeError,
    },

    #[error("'{reference}': file has no metadata field '{field}'")]
    UnknownMetadataField { reference: String, field: String },

    #[error("'{reference}': {source}")]
    File {
        reference: String,
        #[source]
        source: StorageError,
    },

    #[error("'self' is only available inside transform blocks")]
    NoSelfPayload,
}

/// The first segment of a reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RefContext {
    Arguments,
    SelfPayload,
    Execution,
    Sibling(String),
}

impl fmt::Display for RefContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefContext::Arguments => f.write_str("arguments"),
            RefContext::SelfPayload => f.write_str("self"),
            RefContext::Execution => f.write_str("execution"),
            RefContext::Sibling(id) => f.write_str(id),
        }
    }
}

/// A parsed reference string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub context: RefContext,
    pub key: String,
    pub attributes: Vec<String>,
}

impl Reference {
    /// Whether a string is meant to be a reference.
    pub fn is_reference(s: &str) -> bool {
        s.starts_with(REF_PREFIX)
    }

    pub fn parse(raw: &str) -> Result<Self, ReferenceError> {
        let malformed = |reason: &str| ReferenceError::Malformed {
            reference: raw.to_string(),
            reason: reason.to_string(),
        };

        let body = raw
            .strip_prefix(REF_PREFIX)
            .ok_or_else(|| malformed("missing 'REF:' prefix"))?;
        let mut parts = body.split('.');
        let context = parts.next().unwrap_or_default();
        let key = parts.next().ok_or_else(|| malformed("expected <context>.<key>"))?;
        let attributes: Vec<String> = parts.map(str::to_string).collect();

        if context.is_empty() || key.is_empty() || attributes.iter().any(String::is_empty) {
            return Err(malformed("empty path segment"));
        }

        let context = match context {
            "arguments" => RefContext::Arguments,
            "self" => RefContext::SelfPayload,
            "execution" => {
                if attributes != ["status"] {
                    return Err(malformed("execution context only supports <id>.status"));
                }
                RefContext::Execution
            }
            sibling => RefContext::Sibling(sibling.to_string()),
        };

        Ok(Self {
            context,
            key: key.to_string(),
            attributes,
        })
    }

    /// Sibling this reference makes its holder depend on, if any.
    pub fn sibling_dependency(&self) -> Option<&str> {
        match &self.context {
            RefContext::Sibling(id) => Some(id),
            RefContext::Execution => Some(&self.key),
            RefContext::Arguments | RefContext::SelfPayload => None,
        }
    }
}

impl FromStr for Reference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Reference::parse(s)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{REF_PREFIX}{}.{}", self.context, self.key)?;
        for attr in &self.attributes {
            write!(f, ".{attr}")?;
        }
        Ok(())
    }
}

/// Collect every reference inside a value tree.
///
/// Malformed reference strings are reported, so configuration errors surface
/// before dispatch.
pub fn scan(value: &Value, out: &mut Vec<Reference>) -> Result<(), ReferenceError> {
    match value {
        Value::String(s) if Reference::is_reference(s) => {
            out.push(Reference::parse(s)?);
        }
        Value::List(items) => {
            for item in items {
                scan(item, out)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                scan(item, out)?;
            }
        }
        _ => {}
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// What the value store knows about a sibling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SiblingState<'a> {
    Unknown,
    Pending,
    Output(&'a BTreeMap<String, Value>),
    NoOutput(ProcessStatus),
}

/// Read access to sibling nodes of the current composite scope.
pub trait SiblingView {
    fn sibling(&self, execution_id: &str) -> SiblingState<'_>;

    /// Status label of a sibling (`pending`, `completed`, `skipped`, ...).
    fn sibling_status(&self, execution_id: &str) -> Option<&'static str>;
}

/// A sibling view with no siblings, for resolving against arguments only.
pub struct NoSiblings;

impl SiblingView for NoSiblings {
    fn sibling(&self, _: &str) -> SiblingState<'_> {
        SiblingState::Unknown
    }

    fn sibling_status(&self, _: &str) -> Option<&'static str> {
        None
    }
}

/// Resolves references against one composite scope.
pub struct Resolver<'a> {
    arguments: &'a BTreeMap<String, Value>,
    siblings: &'a dyn SiblingView,
    payload: Option<&'a BTreeMap<String, Value>>,
    files: &'a FileAccess<'a>,
    absent_outputs_as_null: bool,
}

impl<'a> Resolver<'a> {
    pub fn new(
        arguments: &'a BTreeMap<String, Value>,
        siblings: &'a dyn SiblingView,
        files: &'a FileAccess<'a>,
    ) -> Self {
        Self {
            arguments,
            siblings,
            payload: None,
            files,
            absent_outputs_as_null: false,
        }
    }

    /// Bind the `self` context.
    pub fn with_payload(mut self, payload: &'a BTreeMap<String, Value>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Resolve references into skipped or failed siblings as null instead of
    /// [`ReferenceError::NoOutput`].
    pub fn absent_outputs_as_null(mut self) -> Self {
        self.absent_outputs_as_null = true;
        self
    }

    pub fn files(&self) -> &'a FileAccess<'a> {
        self.files
    }

    /// Resolve one reference string.
    pub fn resolve(&self, raw: &str) -> Result<Value, ReferenceError> {
        let reference = Reference::parse(raw)?;
        match self.resolve_parsed(&reference) {
            Err(ReferenceError::NoOutput { execution_id, .. }) if self.absent_outputs_as_null => {
                tracing::debug!(
                    reference = raw,
                    execution_id = %execution_id,
                    "reference into sibling without output resolved as null"
                );
                Ok(Value::Null)
            }
            other => other,
        }
    }

    pub fn resolve_parsed(&self, reference: &Reference) -> Result<Value, ReferenceError> {
        let unknown_key = || ReferenceError::UnknownKey {
            context: reference.context.to_string(),
            key: reference.key.clone(),
        };

        let root = match &reference.context {
            RefContext::Arguments => self.arguments.get(&reference.key).cloned().ok_or_else(unknown_key)?,
            RefContext::SelfPayload => self
                .payload
                .ok_or(ReferenceError::NoSelfPayload)?
                .get(&reference.key)
                .cloned()
                .ok_or_else(unknown_key)?,
            RefContext::Execution => {
                let status = self
                    .siblings
                    .sibling_status(&reference.key)
                    .ok_or_else(|| ReferenceError::UnknownExecution(reference.key.clone()))?;
                return Ok(Value::from(status));
            }
            RefContext::Sibling(id) => match self.siblings.sibling(id) {
                SiblingState::Unknown => return Err(ReferenceError::UnknownExecution(id.clone())),
                SiblingState::Pending => return Err(ReferenceError::NotTerminal(id.clone())),
                SiblingState::NoOutput(status) => {
                    return Err(ReferenceError::NoOutput {
                        execution_id: id.clone(),
                        status,
                    });
                }
                SiblingState::Output(output) => {
                    output.get(&reference.key).cloned().ok_or_else(unknown_key)?
                }
            },
        };

        let mut current = root;
        for attr in &reference.attributes {
            let next = match current.attribute(attr) {
                Ok(Attribute::Value(v)) => v,
                Ok(Attribute::FileMetadata { file, field }) => {
                    let meta = self
                        .files
                        .describe(&file.path, file.version_id.as_deref())
                        .map_err(|source| ReferenceError::File {
                            reference: reference.to_string(),
                            source,
                        })?;
                    meta.field(field)
                        .ok_or_else(|| ReferenceError::UnknownMetadataField {
                            reference: reference.to_string(),
                            field: field.to_string(),
                        })?
                }
                Err(source) => {
                    return Err(ReferenceError::Attribute {
                        reference: reference.to_string(),
                        source,
                    });
                }
            };
            current = next;
        }

        if let Value::File(file) = &current {
            let content = self.files.read_file(file).map_err(|source| ReferenceError::File {
                reference: reference.to_string(),
                source,
            })?;
            return Ok(Value::String(content));
        }

        Ok(current)
    }

    /// Resolve every reference string inside a value tree.
    pub fn resolve_value(&self, value: &Value) -> Result<Value, ReferenceError> {
        match value {
            Value::String(s) if Reference::is_reference(s) => self.resolve(s),
            Value::List(items) => items
                .iter()
                .map(|item| self.resolve_value(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.resolve_value(v)?)))
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    /// Resolve every entry of a name-to-expression map.
    pub fn resolve_map(
        &self,
        map: &BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>, ReferenceError> {
        map.iter()
            .map(|(k, v)| Ok((k.clone(), self.resolve_value(v)?)))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use super::*;

    /// Sibling table for resolver tests.
    #[derive(Default)]
    pub struct Siblings {
        pub entries: HashMap<String, (ProcessStatus, Option<BTreeMap<String, Value>>)>,
        pub pending: Vec<String>,
    }

    impl Siblings {
        pub fn completed(mut self, id: &str, output: serde_json::Value) -> Self {
            let map = match Value::from(output) {
                Value::Object(map) => map,
                other => panic!("sibling output must be an object, got {other:?}"),
            };
            self.entries
                .insert(id.to_string(), (ProcessStatus::Completed, Some(map)));
            self
        }

        pub fn ended(mut self, id: &str, status: ProcessStatus) -> Self {
            self.entries.insert(id.to_string(), (status, None));
            self
        }
    }

    impl SiblingView for Siblings {
        fn sibling(&self, execution_id: &str) -> SiblingState<'_> {
            if self.pending.iter().any(|p| p == execution_id) {
                return SiblingState::Pending;
            }
            match self.entries.get(execution_id) {
                Some((_, Some(output))) => SiblingState::Output(output),
                Some((status, None)) => SiblingState::NoOutput(*status),
                None => SiblingState::Unknown,
            }
        }

        fn sibling_status(&self, execution_id: &str) -> Option<&'static str> {
            if self.pending.iter().any(|p| p == execution_id) {
                return Some("pending");
            }
            self.entries.get(execution_id).map(|(status, _)| match status {
                ProcessStatus::Running => "running",
                ProcessStatus::Completed => "completed",
                ProcessStatus::Failed => "failed",
                ProcessStatus::Skipped => "skipped",
                ProcessStatus::Terminated => "terminated",
            })
        }
    }

    pub fn object(json: serde_json::Value) -> BTreeMap<String, Value> {
        match Value::from(json) {
            Value::Object(map) => map,
            other => panic!("expected object, got {other:?}"),
        }
    }
}
