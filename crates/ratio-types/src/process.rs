//! Process records: the externally visible bookkeeping for every dispatched
//! node and every top-level invocation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::Value;

/// Status of a process. Everything except `Running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Completed,
    Failed,
    Skipped,
    Terminated,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessStatus::Running)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessStatus::Running => "running",
            ProcessStatus::Completed => "completed",
            ProcessStatus::Failed => "failed",
            ProcessStatus::Skipped => "skipped",
            ProcessStatus::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

/// Parent link of a process. Top-level invocations hang off the `Root` sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "process_id")]
pub enum ParentProcess {
    Root,
    Process(Uuid),
}

impl fmt::Display for ParentProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParentProcess::Root => f.write_str("root"),
            ParentProcess::Process(id) => write!(f, "{id}"),
        }
    }
}

/// A process record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub process_id: Uuid,
    pub parent_process_id: ParentProcess,
    /// `None` for top-level invocations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    /// Definition path or label the process executes.
    pub definition: String,
    pub status: ProcessStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    pub started_on: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_on: Option<DateTime<Utc>>,
}

impl Process {
    /// A new RUNNING process.
    pub fn running(
        process_id: Uuid,
        parent_process_id: ParentProcess,
        execution_id: Option<String>,
        definition: impl Into<String>,
    ) -> Self {
        Self {
            process_id,
            parent_process_id,
            execution_id,
            definition: definition.into(),
            status: ProcessStatus::Running,
            status_message: None,
            response: None,
            started_on: Utc::now(),
            ended_on: None,
        }
    }
}
