//! Engine error taxonomy.
//!
//! Component errors (`ReferenceError`, `TransformError`, `SchemaError`,
//! `StorageError`) convert into [`EngineError`] so node preparation can use
//! `?` throughout. Variants are split by scope: instance-level configuration
//! errors abort before any dispatch, everything else fails only the owning
//! node.

use ratio_types::error::StorageError;
use thiserror::Error;
use uuid::Uuid;

use crate::reference::ReferenceError;
use crate::schema::SchemaError;
use crate::transform::TransformError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("invalid reference: {0}")]
    InvalidReference(#[from] ReferenceError),

    #[error("dependency cycle detected involving: {}", ids.join(", "))]
    CycleDetected { ids: Vec<String> },

    #[error("unknown condition operator '{0}'")]
    UnknownOperator(String),

    #[error("transformed {phase} failed validation: {source}")]
    TransformValidation {
        phase: TransformPhase,
        #[source]
        source: SchemaError,
    },

    #[error("schema validation failed: {0}")]
    SchemaValidation(#[from] SchemaError),

    #[error("child execution '{execution_id}' failed: {reason}")]
    ChildExecutionFailure {
        execution_id: String,
        reason: String,
    },

    #[error("transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("composite nesting depth {depth} exceeds maximum {max}")]
    NestingDepthExceeded { depth: u32, max: u32 },

    #[error("terminated: {0}")]
    Terminated(String),

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Which transform block produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformPhase {
    Arguments,
    Responses,
}

impl std::fmt::Display for TransformPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransformPhase::Arguments => f.write_str("arguments"),
            TransformPhase::Responses => f.write_str("responses"),
        }
    }
}

impl EngineError {
    /// Configuration errors that must abort an instance before dispatch.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::CycleDetected { .. }
                | EngineError::UnknownOperator(_)
                | EngineError::InvalidDefinition(_)
        )
    }
}
