//! Loopback executor hosting the built-in primitive endpoints.
//!
//! Endpoints complete on a spawned task, never inline, so completions reach
//! the instance through its inbox like those of a remote executor.
//!
//! - `echo`: completes with its arguments. An optional integer `delay_ms`
//!   postpones completion; the delay is cancellable.
//! - `fail`: fails with the `message` argument.
//! - `constant`: completes with `{"value": <value argument>}`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use ratio_core::error::EngineError;
use ratio_core::executor::{DispatchRequest, Executor};
use ratio_types::value::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Names of the endpoints served by [`LoopbackExecutor`].
pub const ENDPOINTS: &[&str] = &["echo", "fail", "constant"];

/// In-process executor for the built-in endpoints.
#[derive(Debug, Clone, Default)]
pub struct LoopbackExecutor {
    /// Cancellation tokens of delayed dispatches, keyed by process id.
    pending: Arc<DashMap<Uuid, CancellationToken>>,
}

impl LoopbackExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of delayed dispatches still waiting to complete.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn delay(arguments: &BTreeMap<String, Value>) -> Option<Duration> {
        arguments
            .get("delay_ms")
            .and_then(Value::as_f64)
            .filter(|ms| *ms > 0.0)
            .map(|ms| Duration::from_millis(ms as u64))
    }

    fn echo(&self, request: DispatchRequest) {
        let Some(delay) = Self::delay(&request.resolved_arguments) else {
            tokio::spawn(async move {
                let event = request.completed(request.resolved_arguments.clone());
                request.callback_target.send(event);
            });
            return;
        };

        let token = CancellationToken::new();
        self.pending.insert(request.process_id, token.clone());
        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(process_id = %request.process_id, "echo cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    let event = request.completed(request.resolved_arguments.clone());
                    request.callback_target.send(event);
                }
            }
            pending.remove(&request.process_id);
        });
    }
}

impl Executor for LoopbackExecutor {
    async fn dispatch(&self, request: DispatchRequest) -> Result<(), EngineError> {
        tracing::debug!(
            target_id = %request.target_id,
            process_id = %request.process_id,
            endpoint = %request.endpoint,
            "loopback dispatch"
        );

        match request.endpoint.as_str() {
            "echo" => self.echo(request),
            "fail" => {
                let message = request
                    .resolved_arguments
                    .get("message")
                    .map(Value::to_display_string)
                    .unwrap_or_else(|| "endpoint 'fail' invoked".to_string());
                tokio::spawn(async move {
                    request.callback_target.send(request.failed(message));
                });
            }
            "constant" => {
                let value = request
                    .resolved_arguments
                    .get("value")
                    .cloned()
                    .unwrap_or_default();
                tokio::spawn(async move {
                    let result = BTreeMap::from([("value".to_string(), value)]);
                    request.callback_target.send(request.completed(result));
                });
            }
            other => {
                return Err(EngineError::Dispatch(format!(
                    "unknown loopback endpoint '{other}'"
                )));
            }
        }
        Ok(())
    }

    async fn cancel(&self, process_id: Uuid) {
        if let Some((_, token)) = self.pending.remove(&process_id) {
            token.cancel();
        }
    }
}
