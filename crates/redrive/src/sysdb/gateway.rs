//! SystemDatabase trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Error type for system database operations
#[derive(Debug, thiserror::Error)]
pub enum SysDbError {
    /// Workflow row does not exist
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// A workflow with this id exists with a different name or inputs
    #[error("workflow {0} already exists with different inputs")]
    WorkflowConflict(String),

    /// Duplicate (workflow_id, function_id) with a divergent payload
    #[error("operation ({workflow_id}, {function_id}) already recorded a different outcome")]
    ConflictingOutcome {
        workflow_id: String,
        function_id: i32,
    },

    /// A (workflow_id, key) event pair was written twice with distinct values
    #[error("event \"{key}\" was already set by workflow {workflow_id}")]
    EventAlreadySet { workflow_id: String, key: String },

    /// `send` addressed a workflow that does not exist
    #[error("destination workflow {0} does not exist")]
    DestinationNotFound(String),

    /// Connection or schema error; fatal to the executor
    #[error("database error: {0}")]
    Database(String),

    /// Stored payload could not be decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Workflow status
///
/// Transitions are monotone except PENDING -> PENDING (metadata updates);
/// once SUCCESS or ERROR, output/error fields are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    Pending,
    Success,
    Error,
    RetriesExceeded,
    Cancelled,
}

impl WorkflowStatus {
    /// Database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::RetriesExceeded => "RETRIES_EXCEEDED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, SysDbError> {
        match raw {
            "PENDING" => Ok(Self::Pending),
            "SUCCESS" => Ok(Self::Success),
            "ERROR" => Ok(Self::Error),
            "RETRIES_EXCEEDED" => Ok(Self::RetriesExceeded),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(SysDbError::Database(format!(
                "unknown workflow status: {other}"
            ))),
        }
    }

    /// Whether no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of `dbos.workflow_status`
#[derive(Debug, Clone)]
pub struct WorkflowStatusRow {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub name: String,
    pub authenticated_user: Option<String>,
    pub assumed_role: Option<String>,
    pub authenticated_roles: Option<String>,
    pub request: Option<String>,
    /// Serialized input arguments (JSON)
    pub inputs: String,
    pub output: Option<String>,
    pub error: Option<String>,
    pub executor_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub application_version: Option<String>,
    pub queue_name: Option<String>,
    pub queued_at: Option<i64>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl WorkflowStatusRow {
    /// A fresh PENDING row for a new workflow start
    pub fn pending(workflow_id: &str, name: &str, inputs: &str, executor_id: &str) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            workflow_id: workflow_id.to_string(),
            status: WorkflowStatus::Pending,
            name: name.to_string(),
            authenticated_user: None,
            assumed_role: None,
            authenticated_roles: None,
            request: None,
            inputs: inputs.to_string(),
            output: None,
            error: None,
            executor_id: Some(executor_id.to_string()),
            created_at: now,
            updated_at: now,
            application_version: None,
            queue_name: None,
            queued_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_queue(mut self, queue_name: &str) -> Self {
        self.queue_name = Some(queue_name.to_string());
        self.queued_at = Some(self.created_at);
        self
    }
}

/// Recorded outcome of one operation: exactly one field is set when final
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedOutcome {
    pub output: Option<String>,
    pub error: Option<String>,
}

impl RecordedOutcome {
    pub fn is_final(&self) -> bool {
        self.output.is_some() || self.error.is_some()
    }
}

/// State of an operation row after an entry-guard insert
///
/// `created_at` is durable across crashes, so a resumed wait recomputes the
/// same deadline as the original attempt.
#[derive(Debug, Clone)]
pub struct OperationEntry {
    pub created_at: i64,
    pub outcome: Option<RecordedOutcome>,
}

/// Terminal result of a workflow, as read back from the status row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowOutcome {
    Success(String),
    Error(String),
    Cancelled,
}

/// Identifies the workflow step recording a `get_event` result
#[derive(Debug, Clone)]
pub struct CallerContext {
    pub workflow_id: String,
    pub function_id: i32,
}

/// Filter for listing workflows
#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    pub name: Option<String>,
    pub status: Option<WorkflowStatus>,
    pub limit: Option<u32>,
    /// Most recently created first
    pub newest_first: bool,
}

/// One buffered status update, flushed in a batch by the background loop
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Gateway for all state in the system database
///
/// Implementations must be thread-safe; every mutation keyed by
/// (workflow_id, function_id) is an upsert-with-equality-check so the same
/// operation can be retried after a crash without a second effect.
#[async_trait]
pub trait SystemDatabase: Send + Sync + 'static {
    /// Create the schema if it does not exist. Idempotent.
    async fn bootstrap(&self) -> Result<(), SysDbError>;

    // =========================================================================
    // Workflow Status
    // =========================================================================

    /// Insert the PENDING row for a workflow start.
    ///
    /// Returns `true` if the row was new. An existing row with equal name and
    /// inputs is a successful no-op (`false`); a divergent row raises
    /// [`SysDbError::WorkflowConflict`].
    async fn init_workflow_status(&self, row: &WorkflowStatusRow) -> Result<bool, SysDbError>;

    /// Flip a workflow's status, recording output or error on terminal states
    async fn update_workflow_status(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
        output: Option<String>,
        error: Option<String>,
    ) -> Result<(), SysDbError>;

    /// Take ownership of a PENDING workflow (recovery, queue dequeue)
    async fn claim_workflow(&self, workflow_id: &str, executor_id: &str)
        -> Result<(), SysDbError>;

    async fn get_workflow_status(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowStatusRow>, SysDbError>;

    /// Block until the workflow reaches a terminal status
    async fn await_workflow_outcome(
        &self,
        workflow_id: &str,
        poll_interval: Duration,
    ) -> Result<WorkflowOutcome, SysDbError>;

    async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowStatusRow>, SysDbError>;

    /// Persist buffered status updates in one transaction
    async fn flush_status_batch(&self, batch: &[StatusUpdate]) -> Result<(), SysDbError>;

    // =========================================================================
    // Operation Log (non-transactional steps)
    // =========================================================================

    async fn check_operation_output(
        &self,
        workflow_id: &str,
        function_id: i32,
    ) -> Result<Option<RecordedOutcome>, SysDbError>;

    /// Insert the entry guard for a waiting operation if absent, returning
    /// its durable entry time and any final outcome already recorded
    async fn operation_entry(
        &self,
        workflow_id: &str,
        function_id: i32,
    ) -> Result<OperationEntry, SysDbError>;

    async fn record_operation_output(
        &self,
        workflow_id: &str,
        function_id: i32,
        output: &str,
    ) -> Result<(), SysDbError>;

    async fn record_operation_error(
        &self,
        workflow_id: &str,
        function_id: i32,
        error: &str,
    ) -> Result<(), SysDbError>;

    // =========================================================================
    // Messaging and Events
    // =========================================================================

    /// Durably deliver a message, deduplicated by the sender's
    /// (workflow_id, function_id); wakes cross-process waiters
    async fn send(
        &self,
        source_id: &str,
        function_id: i32,
        destination_id: &str,
        topic: &str,
        message: &str,
    ) -> Result<(), SysDbError>;

    /// Consume the oldest message for (workflow_id, topic), waiting up to
    /// `timeout` measured from the operation's durable entry time
    async fn recv(
        &self,
        workflow_id: &str,
        function_id: i32,
        topic: &str,
        timeout: Duration,
    ) -> Result<Option<String>, SysDbError>;

    /// Write-once keyed event; a second distinct value raises
    /// [`SysDbError::EventAlreadySet`]
    async fn set_event(
        &self,
        workflow_id: &str,
        function_id: i32,
        key: &str,
        value: &str,
    ) -> Result<(), SysDbError>;

    /// Read a keyed event, waiting up to `timeout`; recorded under the
    /// caller's step when `caller` is given so replays observe the same value
    async fn get_event(
        &self,
        target_id: &str,
        key: &str,
        timeout: Duration,
        caller: Option<CallerContext>,
    ) -> Result<Option<String>, SysDbError>;

    // =========================================================================
    // Workflow Queue
    // =========================================================================

    async fn enqueue(&self, workflow_id: &str, queue_name: &str) -> Result<(), SysDbError>;

    /// Mark ready queue entries started, bounded by the concurrency limit,
    /// and return their workflow ids for execution
    async fn start_queued_workflows(
        &self,
        queue_name: &str,
        concurrency_limit: u32,
        executor_id: &str,
    ) -> Result<Vec<String>, SysDbError>;

    async fn mark_queue_completed(&self, workflow_id: &str) -> Result<(), SysDbError>;

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Upsert this executor's heartbeat
    async fn touch_executor(&self, executor_id: &str) -> Result<(), SysDbError>;

    /// PENDING workflows owned by this executor or by executors whose
    /// heartbeat is older than `heartbeat_ttl`
    async fn pending_workflows(
        &self,
        executor_id: &str,
        heartbeat_ttl: Duration,
    ) -> Result<Vec<String>, SysDbError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            WorkflowStatus::Pending,
            WorkflowStatus::Success,
            WorkflowStatus::Error,
            WorkflowStatus::RetriesExceeded,
            WorkflowStatus::Cancelled,
        ] {
            assert_eq!(WorkflowStatus::parse(status.as_str()).unwrap(), status);
        }

        assert!(WorkflowStatus::parse("RUNNING").is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!WorkflowStatus::Pending.is_terminal());
        assert!(WorkflowStatus::Success.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_pending_row_defaults() {
        let row = WorkflowStatusRow::pending("wf-1", "checkout", "[42]", "exec-1");

        assert_eq!(row.status, WorkflowStatus::Pending);
        assert_eq!(row.inputs, "[42]");
        assert!(row.queue_name.is_none());

        let queued = row.with_queue("payments");
        assert_eq!(queued.queue_name.as_deref(), Some("payments"));
        assert_eq!(queued.queued_at, Some(queued.created_at));
    }

    #[test]
    fn test_recorded_outcome_finality() {
        assert!(!RecordedOutcome {
            output: None,
            error: None
        }
        .is_final());
        assert!(RecordedOutcome {
            output: Some("1".into()),
            error: None
        }
        .is_final());
    }
}
