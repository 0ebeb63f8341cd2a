//! Event types for the engine event bus.
//!
//! `EngineEvent` is broadcast as instances progress. All variants are
//! Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::process::ProcessStatus;

/// Lifecycle events emitted by the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A composite instance was created and its graph validated.
    InstanceStarted {
        instance_id: Uuid,
        process_id: Uuid,
        definition: String,
        /// Set for nested composites.
        parent_instance_id: Option<Uuid>,
    },

    /// A node (or parallel child) was handed to an executor or nested instance.
    NodeDispatched {
        instance_id: Uuid,
        execution_id: String,
        process_id: Uuid,
    },

    /// A node's conditions evaluated false.
    NodeSkipped {
        instance_id: Uuid,
        execution_id: String,
    },

    NodeCompleted {
        instance_id: Uuid,
        execution_id: String,
    },

    NodeFailed {
        instance_id: Uuid,
        execution_id: String,
        error: String,
    },

    NodeTerminated {
        instance_id: Uuid,
        execution_id: String,
    },

    /// The instance reached its fixed point (or was terminated).
    InstanceFinished {
        instance_id: Uuid,
        process_id: Uuid,
        status: ProcessStatus,
        error: Option<String>,
    },
}

impl EngineEvent {
    pub fn instance_id(&self) -> Uuid {
        match self {
            EngineEvent::InstanceStarted { instance_id, .. }
            | EngineEvent::NodeDispatched { instance_id, .. }
            | EngineEvent::NodeSkipped { instance_id, .. }
            | EngineEvent::NodeCompleted { instance_id, .. }
            | EngineEvent::NodeFailed { instance_id, .. }
            | EngineEvent::NodeTerminated { instance_id, .. }
            | EngineEvent::InstanceFinished { instance_id, .. } => *instance_id,
        }
    }
}
