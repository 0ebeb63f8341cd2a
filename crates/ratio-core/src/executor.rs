//! Dispatch contract between the engine and primitive executors.
//!
//! The engine hands a [`DispatchRequest`] to an [`Executor`]; the executor
//! later reports back through the request's [`CompletionSender`], at least
//! once and in any order relative to other dispatches.

use std::collections::BTreeMap;

use ratio_types::definition::FieldSpec;
use ratio_types::process::ParentProcess;
use ratio_types::storage::AccessToken;
use ratio_types::value::Value;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::EngineError;
use crate::runtime::InstanceMessage;

/// Work handed to an executor for one node (or one parallel child).
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// `execution_id`, or `execution_id[i]` for a parallel child.
    pub target_id: String,
    pub process_id: Uuid,
    pub parent_process_id: ParentProcess,
    pub endpoint: String,
    pub resolved_arguments: BTreeMap<String, Value>,
    pub argument_schema: Vec<FieldSpec>,
    pub response_schema: Vec<FieldSpec>,
    pub credential: Option<AccessToken>,
    pub callback_target: CompletionSender,
}

impl DispatchRequest {
    /// Completion reporting success.
    pub fn completed(&self, result: BTreeMap<String, Value>) -> CompletionEvent {
        CompletionEvent {
            target_id: self.target_id.clone(),
            status: CompletionStatus::Completed,
            result: Some(Value::Object(result)),
            failure_reason: None,
        }
    }

    /// Completion reporting failure.
    pub fn failed(&self, reason: impl Into<String>) -> CompletionEvent {
        CompletionEvent {
            target_id: self.target_id.clone(),
            status: CompletionStatus::Failed,
            result: None,
            failure_reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Completed,
    Failed,
}

/// An executor's report for one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub target_id: String,
    pub status: CompletionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Cloneable handle that routes completions to the owning instance.
#[derive(Debug, Clone)]
pub struct CompletionSender {
    instance_id: Uuid,
    tx: mpsc::UnboundedSender<InstanceMessage>,
}

impl CompletionSender {
    pub(crate) fn new(instance_id: Uuid, tx: mpsc::UnboundedSender<InstanceMessage>) -> Self {
        Self { instance_id, tx }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Deliver a completion. Delivery to an instance that already finished is
    /// dropped silently.
    pub fn send(&self, event: CompletionEvent) {
        if self.tx.send(InstanceMessage::Completion(event)).is_err() {
            tracing::debug!(
                instance_id = %self.instance_id,
                "completion for finished instance dropped"
            );
        }
    }
}

/// Trait for primitive executors.
///
/// Implementations live in ratio-infra (e.g., `LoopbackExecutor`) or in the
/// embedding application. An `Err` from `dispatch` is recorded as a FAILED
/// completion of the target.
pub trait Executor: Send + Sync + 'static {
    fn dispatch(
        &self,
        request: DispatchRequest,
    ) -> impl std::future::Future<Output = Result<(), EngineError>> + Send;

    /// Best-effort cancellation of a dispatched process.
    fn cancel(&self, process_id: Uuid) -> impl std::future::Future<Output = ()> + Send;
}
