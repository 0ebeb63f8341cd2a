//! Transform pipeline: the small data-shaping language applied to step
//! arguments and responses.
//!
//! A [`TransformBlock`] runs in two phases:
//!
//! 1. **Variables**: each entry is resolved like an argument tree, with
//!    `REF:self.*` bound to the payload being shaped.
//! 2. **Transforms**: each entry is an expression (see [`parser`]) evaluated
//!    against the payload merged with the variables. Variables win on
//!    conflict.
//!
//! The block's output is the payload with every transform result written
//! over it; dotted output keys (`user.name`) build nested objects.
//!
//! Functions come from a fixed [`Registry`] of typed handlers. There is no
//! way to define new functions or control flow from a definition document.

mod builtins;
mod eval;
mod files;
mod filter;
pub mod parser;
mod registry;

use std::collections::BTreeMap;

use ratio_types::config::EngineConfig;
use ratio_types::definition::TransformBlock;
use ratio_types::error::StorageError;
use ratio_types::value::Value;
use thiserror::Error;

use crate::reference::{Reference, ReferenceError, Resolver};
use crate::storage::FileAccess;

pub use eval::Evaluator;
pub use registry::{Args, FunctionSpec, Handler, Param, Registry};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransformError {
    #[error("cannot parse '{expression}': {reason}")]
    Parse { expression: String, reason: String },

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("{function}: {reason}")]
    Arguments { function: String, reason: String },

    #[error("unknown path '{0}'")]
    UnknownPath(String),

    #[error("{function} failed: {reason}")]
    Function { function: String, reason: String },

    #[error("{function}: {source}")]
    Storage {
        function: String,
        #[source]
        source: StorageError,
    },

    #[error(transparent)]
    Reference(#[from] ReferenceError),

    #[error("invalid function registration: {0}")]
    Registry(String),

    #[error("cannot write output '{key}': {reason}")]
    Output { key: String, reason: String },
}

/// Result-count caps for the storage builtins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformLimits {
    pub list_files: usize,
    pub read_files: usize,
}

impl Default for TransformLimits {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for TransformLimits {
    fn from(config: &EngineConfig) -> Self {
        Self {
            list_files: config.list_files_limit,
            read_files: config.read_files_limit,
        }
    }
}

/// Everything a builtin handler may touch besides its arguments.
pub struct FunctionContext<'a> {
    pub files: &'a FileAccess<'a>,
    pub limits: TransformLimits,
}

/// Apply one transform block to `payload`.
///
/// `resolver` must have `self` bound to `payload` (see
/// [`Resolver::with_payload`]); its storage handle backs the file builtins.
pub fn apply_block(
    block: &TransformBlock,
    payload: &BTreeMap<String, Value>,
    resolver: &Resolver<'_>,
    registry: &Registry,
    limits: TransformLimits,
) -> Result<BTreeMap<String, Value>, TransformError> {
    let variables = resolver.resolve_map(&block.variables)?;

    let mut scope = payload.clone();
    scope.extend(variables);

    let ctx = FunctionContext {
        files: resolver.files(),
        limits,
    };
    let evaluator = Evaluator::new(registry, &ctx);

    let mut results = BTreeMap::new();
    for (key, expression) in &block.transforms {
        let value = if Reference::is_reference(expression) {
            resolver.resolve(expression)?
        } else {
            evaluator.evaluate_str(expression, &scope)?
        };
        tracing::debug!(output = %key, kind = %value.kind(), "transform evaluated");
        set_nested(&mut results, key, value)?;
    }

    let mut output = payload.clone();
    output.extend(results);
    Ok(output)
}

/// Write `value` at a dotted `key`, creating intermediate objects.
fn set_nested(
    target: &mut BTreeMap<String, Value>,
    key: &str,
    value: Value,
) -> Result<(), TransformError> {
    let conflict = |reason: &str| TransformError::Output {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    let mut parts: Vec<&str> = key.split('.').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(conflict("empty path segment"));
    }
    let last = parts.pop().unwrap_or(key);

    let mut current = target;
    for part in parts {
        let slot = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(BTreeMap::new()));
        current = match slot {
            Value::Object(map) => map,
            _ => return Err(conflict(&format!("'{part}' is already set to a non-object value"))),
        };
    }
    current.insert(last.to_string(), value);
    Ok(())
}
