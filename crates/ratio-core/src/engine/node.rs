//! Execution nodes: per-step scheduling state inside one composite instance.

use std::collections::BTreeMap;
use std::fmt;

use ratio_types::process::ProcessStatus;
use ratio_types::value::Value;
use uuid::Uuid;

/// Scheduling state of a node.
///
/// ```text
/// PENDING -> READY -> DISPATCHED -> COMPLETED | FAILED | TERMINATED
///    |         |
///    |         +-> SKIPPED | FAILED | COMPLETED (empty fan-out)
///    +-> FAILED (dependency did not complete) | TERMINATED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    Ready,
    Dispatched,
    Completed,
    Failed,
    Skipped,
    Terminated,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Skipped | NodeStatus::Terminated
        )
    }

    /// FAILED or TERMINATED: the node produced no output its dependents can use.
    pub fn is_unsuccessful(&self) -> bool {
        matches!(self, NodeStatus::Failed | NodeStatus::Terminated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Ready => "ready",
            NodeStatus::Dispatched => "dispatched",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
            NodeStatus::Terminated => "terminated",
        }
    }

    /// Process status for terminal nodes; `Running` otherwise.
    pub fn process_status(&self) -> ProcessStatus {
        match self {
            NodeStatus::Completed => ProcessStatus::Completed,
            NodeStatus::Failed => ProcessStatus::Failed,
            NodeStatus::Skipped => ProcessStatus::Skipped,
            NodeStatus::Terminated => ProcessStatus::Terminated,
            NodeStatus::Pending | NodeStatus::Ready | NodeStatus::Dispatched => ProcessStatus::Running,
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One element of a parallel fan-out.
#[derive(Debug, Clone)]
pub struct ChildNode {
    pub target_id: String,
    pub status: NodeStatus,
    pub process_id: Option<Uuid>,
    pub output: Option<BTreeMap<String, Value>>,
    pub error: Option<String>,
}

impl ChildNode {
    pub fn new(parent: &str, index: usize) -> Self {
        Self {
            target_id: child_target_id(parent, index),
            status: NodeStatus::Pending,
            process_id: None,
            output: None,
            error: None,
        }
    }
}

/// Runtime state of one step.
#[derive(Debug, Clone)]
pub struct ExecutionNode {
    pub execution_id: String,
    pub status: NodeStatus,
    pub process_id: Option<Uuid>,
    /// Validated arguments, once prepared.
    pub arguments: Option<BTreeMap<String, Value>>,
    /// Validated response map, once COMPLETED.
    pub output: Option<BTreeMap<String, Value>>,
    /// Inspectable result: for fan-outs, the ordered child response objects.
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Fan-out children, in iteration order.
    pub children: Vec<ChildNode>,
    /// A dependent branched on this node's status, so its failure does not
    /// fail the instance.
    pub failure_handled: bool,
}

impl ExecutionNode {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            status: NodeStatus::Pending,
            process_id: None,
            arguments: None,
            output: None,
            result: None,
            error: None,
            children: Vec::new(),
            failure_handled: false,
        }
    }

    pub fn is_parallel(&self) -> bool {
        !self.children.is_empty()
    }
}

/// `fetch` + 2 -> `fetch[2]`.
pub fn child_target_id(parent: &str, index: usize) -> String {
    format!("{parent}[{index}]")
}

/// Split a completion target into its step id and optional child index.
///
/// Only the canonical spelling produced by [`child_target_id`] carries an
/// index: `each[01]` and `each[+1]` are plain ids.
pub fn parse_target_id(target_id: &str) -> (&str, Option<usize>) {
    if let Some(open) = target_id.rfind('[') {
        if let Some(index) = target_id[open + 1..]
            .strip_suffix(']')
            .filter(|digits| is_canonical_index(digits))
            .and_then(|digits| digits.parse::<usize>().ok())
        {
            return (&target_id[..open], Some(index));
        }
    }
    (target_id, None)
}

fn is_canonical_index(digits: &str) -> bool {
    !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && (digits == "0" || !digits.starts_with('0'))
}

/// Read-only view of a node for outcome reports.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeReport {
    pub execution_id: String,
    pub status: NodeStatus,
    pub process_id: Option<Uuid>,
    pub output: Option<BTreeMap<String, Value>>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl From<&ExecutionNode> for NodeReport {
    fn from(node: &ExecutionNode) -> Self {
        Self {
            execution_id: node.execution_id.clone(),
            status: node.status,
            process_id: node.process_id,
            output: node.output.clone(),
            result: node.result.clone(),
            error: node.error.clone(),
        }
    }
}
