//! Process table: the externally visible record of every invocation.
//!
//! Top-level invocations hang off the [`ParentProcess::Root`] sentinel;
//! every dispatched node is a child of its composite's process. Closing is
//! idempotent, which is what makes duplicate completions harmless here.

use chrono::Utc;
use dashmap::DashMap;
use ratio_types::process::{ParentProcess, Process, ProcessStatus};
use ratio_types::value::Value;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct ProcessTable {
    processes: DashMap<Uuid, Process>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record. Records for skipped or pre-dispatch failures are
    /// opened already terminal.
    pub fn open(&self, process: Process) {
        tracing::debug!(
            process_id = %process.process_id,
            parent = %process.parent_process_id,
            status = %process.status,
            "process opened"
        );
        self.processes.insert(process.process_id, process);
    }

    /// Move a RUNNING record to a terminal status.
    ///
    /// Returns `false` when the record is unknown or already terminal.
    pub fn close(
        &self,
        process_id: Uuid,
        status: ProcessStatus,
        status_message: Option<String>,
        response: Option<Value>,
    ) -> bool {
        let Some(mut process) = self.processes.get_mut(&process_id) else {
            return false;
        };
        if process.status.is_terminal() {
            tracing::debug!(process_id = %process_id, "process already closed");
            return false;
        }
        process.status = status;
        process.status_message = status_message;
        process.response = response;
        process.ended_on = Some(Utc::now());
        true
    }

    pub fn get(&self, process_id: Uuid) -> Option<Process> {
        self.processes.get(&process_id).map(|p| p.clone())
    }

    pub fn contains(&self, process_id: Uuid) -> bool {
        self.processes.contains_key(&process_id)
    }

    /// Direct children of a process, oldest first.
    pub fn children(&self, parent: ParentProcess) -> Vec<Process> {
        let mut out: Vec<Process> = self
            .processes
            .iter()
            .filter(|p| p.parent_process_id == parent)
            .map(|p| p.clone())
            .collect();
        out.sort_by_key(|p| p.started_on);
        out
    }

    /// Every record, oldest first.
    pub fn list(&self) -> Vec<Process> {
        let mut out: Vec<Process> = self.processes.iter().map(|p| p.clone()).collect();
        out.sort_by_key(|p| p.started_on);
        out
    }
}
