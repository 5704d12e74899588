//! In-memory implementation of SystemDatabase for testing
//!
//! Provides the same semantics as the PostgreSQL implementation, minus
//! cross-process visibility. Locks are never held across awaits.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::gateway::*;
use super::postgres::{decode_message_outcome, replay_unit_outcome};
use super::waiters::WaiterMap;
use crate::error::ErrorEnvelope;

const NULL_MARKER: &str = "null";

#[derive(Debug, Clone)]
struct OperationRecord {
    output: Option<String>,
    error: Option<String>,
    created_at: i64,
}

impl OperationRecord {
    fn outcome(&self) -> RecordedOutcome {
        RecordedOutcome {
            output: self.output.clone(),
            error: self.error.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct NotificationRow {
    seq: u64,
    destination: String,
    topic: String,
    message: String,
}

#[derive(Debug, Clone)]
struct QueueRow {
    workflow_id: String,
    queue_name: String,
    seq: u64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
}

#[derive(Default)]
struct State {
    workflows: HashMap<String, WorkflowStatusRow>,
    operations: HashMap<(String, i32), OperationRecord>,
    notifications: Vec<NotificationRow>,
    events: HashMap<(String, String), String>,
    queue: Vec<QueueRow>,
    heartbeats: HashMap<String, i64>,
    seq: u64,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

/// In-memory system database
///
/// # Example
///
/// ```
/// use redrive::sysdb::InMemorySystemDatabase;
///
/// let sysdb = InMemorySystemDatabase::new();
/// ```
pub struct InMemorySystemDatabase {
    state: Mutex<State>,
    waiters: WaiterMap,
}

impl InMemorySystemDatabase {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            waiters: WaiterMap::new(),
        }
    }

    /// Number of workflow rows (for test assertions)
    pub fn workflow_count(&self) -> usize {
        self.state.lock().workflows.len()
    }

    /// Number of undelivered notifications (for test assertions)
    pub fn notification_count(&self) -> usize {
        self.state.lock().notifications.len()
    }

    /// Workflow ids matching a name prefix (for test assertions)
    pub fn workflow_ids_with_prefix(&self, prefix: &str) -> Vec<String> {
        let state = self.state.lock();
        let mut ids: Vec<String> = state
            .workflows
            .keys()
            .filter(|id| id.starts_with(prefix))
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn record(
        state: &mut State,
        workflow_id: &str,
        function_id: i32,
        output: Option<String>,
        error: Option<String>,
    ) -> Result<(), SysDbError> {
        let key = (workflow_id.to_string(), function_id);
        match state.operations.get_mut(&key) {
            None => {
                state.operations.insert(
                    key,
                    OperationRecord {
                        output,
                        error,
                        created_at: Utc::now().timestamp_millis(),
                    },
                );
                Ok(())
            }
            Some(existing) if existing.output.is_none() && existing.error.is_none() => {
                existing.output = output;
                existing.error = error;
                Ok(())
            }
            Some(existing) if existing.output == output && existing.error == error => Ok(()),
            Some(_) => Err(SysDbError::ConflictingOutcome {
                workflow_id: workflow_id.to_string(),
                function_id,
            }),
        }
    }

    fn try_consume(
        &self,
        workflow_id: &str,
        function_id: i32,
        topic: &str,
    ) -> Result<Option<RecordedOutcome>, SysDbError> {
        let mut state = self.state.lock();

        if let Some(record) = state
            .operations
            .get(&(workflow_id.to_string(), function_id))
        {
            let outcome = record.outcome();
            if outcome.is_final() {
                return Ok(Some(outcome));
            }
        }

        let oldest = state
            .notifications
            .iter()
            .filter(|n| n.destination == workflow_id && n.topic == topic)
            .min_by_key(|n| n.seq)
            .map(|n| n.seq);

        let Some(seq) = oldest else {
            return Ok(None);
        };
        let Some(position) = state.notifications.iter().position(|n| n.seq == seq) else {
            return Ok(None);
        };
        let message = state.notifications.remove(position).message;

        Self::record(
            &mut state,
            workflow_id,
            function_id,
            Some(message.clone()),
            None,
        )?;

        Ok(Some(RecordedOutcome {
            output: Some(message),
            error: None,
        }))
    }
}

impl Default for InMemorySystemDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SystemDatabase for InMemorySystemDatabase {
    async fn bootstrap(&self) -> Result<(), SysDbError> {
        Ok(())
    }

    async fn init_workflow_status(&self, row: &WorkflowStatusRow) -> Result<bool, SysDbError> {
        let mut state = self.state.lock();
        match state.workflows.get(&row.workflow_id) {
            None => {
                state
                    .workflows
                    .insert(row.workflow_id.clone(), row.clone());
                Ok(true)
            }
            Some(existing) if existing.name == row.name && existing.inputs == row.inputs => {
                Ok(false)
            }
            Some(_) => Err(SysDbError::WorkflowConflict(row.workflow_id.clone())),
        }
    }

    async fn update_workflow_status(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
        output: Option<String>,
        error: Option<String>,
    ) -> Result<(), SysDbError> {
        let mut state = self.state.lock();
        let row = state
            .workflows
            .get_mut(workflow_id)
            .ok_or_else(|| SysDbError::WorkflowNotFound(workflow_id.to_string()))?;

        if row.status.is_terminal() {
            return Ok(());
        }

        let now = Utc::now().timestamp_millis();
        row.status = status;
        row.updated_at = now;
        if output.is_some() {
            row.output = output;
        }
        if error.is_some() {
            row.error = error;
        }
        if status.is_terminal() {
            row.completed_at = Some(now);
        }
        Ok(())
    }

    async fn claim_workflow(
        &self,
        workflow_id: &str,
        executor_id: &str,
    ) -> Result<(), SysDbError> {
        let mut state = self.state.lock();
        if let Some(row) = state.workflows.get_mut(workflow_id) {
            if row.status == WorkflowStatus::Pending {
                row.executor_id = Some(executor_id.to_string());
                row.updated_at = Utc::now().timestamp_millis();
            }
        }
        Ok(())
    }

    async fn get_workflow_status(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowStatusRow>, SysDbError> {
        Ok(self.state.lock().workflows.get(workflow_id).cloned())
    }

    async fn await_workflow_outcome(
        &self,
        workflow_id: &str,
        poll_interval: Duration,
    ) -> Result<WorkflowOutcome, SysDbError> {
        loop {
            let row = self
                .get_workflow_status(workflow_id)
                .await?
                .ok_or_else(|| SysDbError::WorkflowNotFound(workflow_id.to_string()))?;

            match row.status {
                WorkflowStatus::Success => {
                    return Ok(WorkflowOutcome::Success(
                        row.output.unwrap_or_else(|| NULL_MARKER.to_string()),
                    ))
                }
                WorkflowStatus::Error | WorkflowStatus::RetriesExceeded => {
                    return Ok(WorkflowOutcome::Error(row.error.unwrap_or_else(|| {
                        ErrorEnvelope::new("Unknown", "workflow failed without a recorded error")
                            .to_json()
                    })))
                }
                WorkflowStatus::Cancelled => return Ok(WorkflowOutcome::Cancelled),
                WorkflowStatus::Pending => tokio::time::sleep(poll_interval).await,
            }
        }
    }

    async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowStatusRow>, SysDbError> {
        let state = self.state.lock();
        let mut rows: Vec<WorkflowStatusRow> = state
            .workflows
            .values()
            .filter(|row| filter.name.as_deref().is_none_or(|n| row.name == n))
            .filter(|row| filter.status.is_none_or(|s| row.status == s))
            .cloned()
            .collect();

        rows.sort_by_key(|row| row.created_at);
        if filter.newest_first {
            rows.reverse();
        }
        if let Some(limit) = filter.limit {
            rows.truncate(limit as usize);
        }
        Ok(rows)
    }

    async fn flush_status_batch(&self, batch: &[StatusUpdate]) -> Result<(), SysDbError> {
        for update in batch {
            self.update_workflow_status(
                &update.workflow_id,
                update.status,
                update.output.clone(),
                update.error.clone(),
            )
            .await?;
        }
        Ok(())
    }

    async fn check_operation_output(
        &self,
        workflow_id: &str,
        function_id: i32,
    ) -> Result<Option<RecordedOutcome>, SysDbError> {
        let state = self.state.lock();
        Ok(state
            .operations
            .get(&(workflow_id.to_string(), function_id))
            .map(OperationRecord::outcome)
            .filter(RecordedOutcome::is_final))
    }

    async fn operation_entry(
        &self,
        workflow_id: &str,
        function_id: i32,
    ) -> Result<OperationEntry, SysDbError> {
        let mut state = self.state.lock();
        let record = state
            .operations
            .entry((workflow_id.to_string(), function_id))
            .or_insert_with(|| OperationRecord {
                output: None,
                error: None,
                created_at: Utc::now().timestamp_millis(),
            });

        let outcome = record.outcome();
        Ok(OperationEntry {
            created_at: record.created_at,
            outcome: outcome.is_final().then_some(outcome),
        })
    }

    async fn record_operation_output(
        &self,
        workflow_id: &str,
        function_id: i32,
        output: &str,
    ) -> Result<(), SysDbError> {
        let mut state = self.state.lock();
        Self::record(
            &mut state,
            workflow_id,
            function_id,
            Some(output.to_string()),
            None,
        )
    }

    async fn record_operation_error(
        &self,
        workflow_id: &str,
        function_id: i32,
        error: &str,
    ) -> Result<(), SysDbError> {
        let mut state = self.state.lock();
        Self::record(
            &mut state,
            workflow_id,
            function_id,
            None,
            Some(error.to_string()),
        )
    }

    async fn send(
        &self,
        source_id: &str,
        function_id: i32,
        destination_id: &str,
        topic: &str,
        message: &str,
    ) -> Result<(), SysDbError> {
        {
            let mut state = self.state.lock();

            if let Some(record) = state.operations.get(&(source_id.to_string(), function_id)) {
                let outcome = record.outcome();
                if outcome.is_final() {
                    return replay_unit_outcome(source_id, outcome);
                }
            }

            if !state.workflows.contains_key(destination_id) {
                let envelope = ErrorEnvelope::new("DestinationNotFound", destination_id).to_json();
                Self::record(&mut state, source_id, function_id, None, Some(envelope))?;
                return Err(SysDbError::DestinationNotFound(destination_id.to_string()));
            }

            let seq = state.next_seq();
            state.notifications.push(NotificationRow {
                seq,
                destination: destination_id.to_string(),
                topic: topic.to_string(),
                message: message.to_string(),
            });
            Self::record(
                &mut state,
                source_id,
                function_id,
                Some(NULL_MARKER.to_string()),
                None,
            )?;
        }

        self.waiters
            .wake(&format!("n::{destination_id}::{topic}"));
        Ok(())
    }

    async fn recv(
        &self,
        workflow_id: &str,
        function_id: i32,
        topic: &str,
        timeout: Duration,
    ) -> Result<Option<String>, SysDbError> {
        let entry = self.operation_entry(workflow_id, function_id).await?;
        if let Some(outcome) = entry.outcome {
            return decode_message_outcome(workflow_id, outcome);
        }

        let key = format!("n::{workflow_id}::{topic}");
        let notify = self.waiters.subscribe(&key);
        let deadline = entry.created_at + timeout.as_millis() as i64;

        let result = loop {
            let notified = notify.notified();
            tokio::pin!(notified);

            match self.try_consume(workflow_id, function_id, topic)? {
                Some(outcome) => break decode_message_outcome(workflow_id, outcome),
                None => {
                    let remaining = deadline - Utc::now().timestamp_millis();
                    if remaining <= 0 {
                        match self
                            .record_operation_output(workflow_id, function_id, NULL_MARKER)
                            .await
                        {
                            Ok(()) => break Ok(None),
                            Err(SysDbError::ConflictingOutcome { .. }) => {
                                let outcome = self
                                    .check_operation_output(workflow_id, function_id)
                                    .await?
                                    .ok_or_else(|| {
                                        SysDbError::Database(
                                            "recv outcome vanished after conflict".to_string(),
                                        )
                                    })?;
                                break decode_message_outcome(workflow_id, outcome);
                            }
                            Err(e) => break Err(e),
                        }
                    }
                    let _ = tokio::time::timeout(
                        Duration::from_millis(remaining as u64),
                        &mut notified,
                    )
                    .await;
                }
            }
        };

        self.waiters.release(&key, notify);
        result
    }

    async fn set_event(
        &self,
        workflow_id: &str,
        function_id: i32,
        key: &str,
        value: &str,
    ) -> Result<(), SysDbError> {
        {
            let mut state = self.state.lock();

            if let Some(record) = state
                .operations
                .get(&(workflow_id.to_string(), function_id))
            {
                let outcome = record.outcome();
                if outcome.is_final() {
                    return replay_unit_outcome(workflow_id, outcome);
                }
            }

            let event_key = (workflow_id.to_string(), key.to_string());
            match state.events.get(&event_key) {
                None => {
                    state.events.insert(event_key, value.to_string());
                }
                Some(existing) if existing == value => {}
                Some(_) => {
                    let envelope = ErrorEnvelope::new("EventAlreadySet", key).to_json();
                    Self::record(&mut state, workflow_id, function_id, None, Some(envelope))?;
                    return Err(SysDbError::EventAlreadySet {
                        workflow_id: workflow_id.to_string(),
                        key: key.to_string(),
                    });
                }
            }

            Self::record(
                &mut state,
                workflow_id,
                function_id,
                Some(NULL_MARKER.to_string()),
                None,
            )?;
        }

        self.waiters.wake(&format!("e::{workflow_id}::{key}"));
        Ok(())
    }

    async fn get_event(
        &self,
        target_id: &str,
        key: &str,
        timeout: Duration,
        caller: Option<CallerContext>,
    ) -> Result<Option<String>, SysDbError> {
        let deadline = match &caller {
            Some(caller) => {
                let entry = self
                    .operation_entry(&caller.workflow_id, caller.function_id)
                    .await?;
                if let Some(outcome) = entry.outcome {
                    return decode_message_outcome(&caller.workflow_id, outcome);
                }
                entry.created_at + timeout.as_millis() as i64
            }
            None => Utc::now().timestamp_millis() + timeout.as_millis() as i64,
        };

        let waiter_key = format!("e::{target_id}::{key}");
        let notify = self.waiters.subscribe(&waiter_key);

        let result = loop {
            let notified = notify.notified();
            tokio::pin!(notified);

            let value = self
                .state
                .lock()
                .events
                .get(&(target_id.to_string(), key.to_string()))
                .cloned();

            if let Some(value) = value {
                if let Some(caller) = &caller {
                    match self
                        .record_operation_output(&caller.workflow_id, caller.function_id, &value)
                        .await
                    {
                        Ok(()) => {}
                        // A concurrent duplicate of the caller won; its
                        // recorded outcome stands.
                        Err(SysDbError::ConflictingOutcome { .. }) => {
                            if let Some(outcome) = self
                                .check_operation_output(&caller.workflow_id, caller.function_id)
                                .await?
                            {
                                break decode_message_outcome(&caller.workflow_id, outcome);
                            }
                        }
                        Err(e) => break Err(e),
                    }
                }
                break Ok(Some(value));
            }

            let remaining = deadline - Utc::now().timestamp_millis();
            if remaining <= 0 {
                if let Some(caller) = &caller {
                    match self
                        .record_operation_output(&caller.workflow_id, caller.function_id, NULL_MARKER)
                        .await
                    {
                        Ok(()) => {}
                        Err(SysDbError::ConflictingOutcome { .. }) => {
                            if let Some(outcome) = self
                                .check_operation_output(&caller.workflow_id, caller.function_id)
                                .await?
                            {
                                break decode_message_outcome(&caller.workflow_id, outcome);
                            }
                        }
                        Err(e) => break Err(e),
                    }
                }
                break Ok(None);
            }

            let _ = tokio::time::timeout(Duration::from_millis(remaining as u64), &mut notified)
                .await;
        };

        self.waiters.release(&waiter_key, notify);
        result
    }

    async fn enqueue(&self, workflow_id: &str, queue_name: &str) -> Result<(), SysDbError> {
        let mut state = self.state.lock();
        if state.queue.iter().any(|q| q.workflow_id == workflow_id) {
            return Ok(());
        }
        let seq = state.next_seq();
        state.queue.push(QueueRow {
            workflow_id: workflow_id.to_string(),
            queue_name: queue_name.to_string(),
            seq,
            started_at: None,
            completed_at: None,
        });
        Ok(())
    }

    async fn start_queued_workflows(
        &self,
        queue_name: &str,
        concurrency_limit: u32,
        executor_id: &str,
    ) -> Result<Vec<String>, SysDbError> {
        let mut state = self.state.lock();
        let now = Utc::now().timestamp_millis();

        let running = state
            .queue
            .iter()
            .filter(|q| {
                q.queue_name == queue_name && q.started_at.is_some() && q.completed_at.is_none()
            })
            .count();

        let available = (concurrency_limit as usize).saturating_sub(running);
        if available == 0 {
            return Ok(vec![]);
        }

        let mut ready: Vec<&mut QueueRow> = state
            .queue
            .iter_mut()
            .filter(|q| q.queue_name == queue_name && q.started_at.is_none())
            .collect();
        ready.sort_by_key(|q| q.seq);

        let mut started = Vec::new();
        for row in ready.into_iter().take(available) {
            row.started_at = Some(now);
            started.push(row.workflow_id.clone());
        }

        for workflow_id in &started {
            if let Some(row) = state.workflows.get_mut(workflow_id) {
                row.executor_id = Some(executor_id.to_string());
                row.started_at = Some(now);
                row.updated_at = now;
            }
        }

        Ok(started)
    }

    async fn mark_queue_completed(&self, workflow_id: &str) -> Result<(), SysDbError> {
        let mut state = self.state.lock();
        if let Some(row) = state
            .queue
            .iter_mut()
            .find(|q| q.workflow_id == workflow_id && q.completed_at.is_none())
        {
            row.completed_at = Some(Utc::now().timestamp_millis());
        }
        Ok(())
    }

    async fn touch_executor(&self, executor_id: &str) -> Result<(), SysDbError> {
        self.state
            .lock()
            .heartbeats
            .insert(executor_id.to_string(), Utc::now().timestamp_millis());
        Ok(())
    }

    async fn pending_workflows(
        &self,
        executor_id: &str,
        heartbeat_ttl: Duration,
    ) -> Result<Vec<String>, SysDbError> {
        let cutoff = Utc::now().timestamp_millis() - heartbeat_ttl.as_millis() as i64;
        let state = self.state.lock();

        let mut rows: Vec<&WorkflowStatusRow> = state
            .workflows
            .values()
            .filter(|row| row.status == WorkflowStatus::Pending)
            .filter(|row| row.queue_name.is_none() || row.started_at.is_some())
            .filter(|row| match &row.executor_id {
                None => true,
                Some(owner) if owner == executor_id => true,
                Some(owner) => state
                    .heartbeats
                    .get(owner)
                    .is_none_or(|last_seen| *last_seen < cutoff),
            })
            .collect();

        rows.sort_by_key(|row| row.created_at);
        Ok(rows.iter().map(|row| row.workflow_id.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_row(id: &str, name: &str, inputs: &str) -> WorkflowStatusRow {
        WorkflowStatusRow::pending(id, name, inputs, "exec-test")
    }

    #[tokio::test]
    async fn test_init_dedup_and_conflict() {
        let sysdb = InMemorySystemDatabase::new();
        let row = pending_row("wf-1", "checkout", "[1]");

        assert!(sysdb.init_workflow_status(&row).await.unwrap());
        assert!(!sysdb.init_workflow_status(&row).await.unwrap());

        let divergent = pending_row("wf-1", "checkout", "[2]");
        assert!(matches!(
            sysdb.init_workflow_status(&divergent).await,
            Err(SysDbError::WorkflowConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_terminal_status_is_immutable() {
        let sysdb = InMemorySystemDatabase::new();
        sysdb
            .init_workflow_status(&pending_row("wf-1", "f", "[]"))
            .await
            .unwrap();

        sysdb
            .update_workflow_status("wf-1", WorkflowStatus::Success, Some("1".into()), None)
            .await
            .unwrap();
        sysdb
            .update_workflow_status("wf-1", WorkflowStatus::Error, None, Some("boom".into()))
            .await
            .unwrap();

        let row = sysdb.get_workflow_status("wf-1").await.unwrap().unwrap();
        assert_eq!(row.status, WorkflowStatus::Success);
        assert_eq!(row.output.as_deref(), Some("1"));
        assert!(row.error.is_none());
    }

    #[tokio::test]
    async fn test_operation_record_idempotency() {
        let sysdb = InMemorySystemDatabase::new();

        sysdb.record_operation_output("wf-1", 0, "42").await.unwrap();
        // Same payload replays silently
        sysdb.record_operation_output("wf-1", 0, "42").await.unwrap();
        // Divergent payload conflicts
        assert!(matches!(
            sysdb.record_operation_output("wf-1", 0, "43").await,
            Err(SysDbError::ConflictingOutcome { .. })
        ));

        let outcome = sysdb.check_operation_output("wf-1", 0).await.unwrap();
        assert_eq!(outcome.unwrap().output.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_send_recv_fifo() {
        let sysdb = InMemorySystemDatabase::new();
        sysdb
            .init_workflow_status(&pending_row("A", "sender", "[]"))
            .await
            .unwrap();
        sysdb
            .init_workflow_status(&pending_row("B", "receiver", "[]"))
            .await
            .unwrap();

        sysdb.send("A", 0, "B", "chan", "\"one\"").await.unwrap();
        sysdb.send("A", 1, "B", "chan", "\"two\"").await.unwrap();

        let first = sysdb
            .recv("B", 0, "chan", Duration::from_millis(100))
            .await
            .unwrap();
        let second = sysdb
            .recv("B", 1, "chan", Duration::from_millis(100))
            .await
            .unwrap();

        assert_eq!(first.as_deref(), Some("\"one\""));
        assert_eq!(second.as_deref(), Some("\"two\""));
    }

    #[tokio::test]
    async fn test_send_is_deduplicated_by_function_id() {
        let sysdb = InMemorySystemDatabase::new();
        sysdb
            .init_workflow_status(&pending_row("A", "sender", "[]"))
            .await
            .unwrap();
        sysdb
            .init_workflow_status(&pending_row("B", "receiver", "[]"))
            .await
            .unwrap();

        sysdb.send("A", 0, "B", "chan", "\"hello\"").await.unwrap();
        // The retried send with the same function id is a no-op
        sysdb.send("A", 0, "B", "chan", "\"hello\"").await.unwrap();

        assert_eq!(sysdb.notification_count(), 1);
    }

    #[tokio::test]
    async fn test_send_to_missing_destination() {
        let sysdb = InMemorySystemDatabase::new();
        sysdb
            .init_workflow_status(&pending_row("A", "sender", "[]"))
            .await
            .unwrap();

        let result = sysdb.send("A", 0, "ghost", "chan", "\"x\"").await;
        assert!(matches!(result, Err(SysDbError::DestinationNotFound(_))));

        // The failure replays deterministically
        let result = sysdb.send("A", 0, "ghost", "chan", "\"x\"").await;
        assert!(matches!(result, Err(SysDbError::DestinationNotFound(_))));
    }

    #[tokio::test]
    async fn test_recv_replay_returns_recorded_message() {
        let sysdb = InMemorySystemDatabase::new();
        sysdb
            .init_workflow_status(&pending_row("A", "sender", "[]"))
            .await
            .unwrap();
        sysdb
            .init_workflow_status(&pending_row("B", "receiver", "[]"))
            .await
            .unwrap();

        sysdb.send("A", 0, "B", "chan", "\"hello\"").await.unwrap();
        let first = sysdb
            .recv("B", 0, "chan", Duration::from_millis(100))
            .await
            .unwrap();
        let replay = sysdb
            .recv("B", 0, "chan", Duration::from_millis(100))
            .await
            .unwrap();

        assert_eq!(first, replay);
        assert_eq!(first.as_deref(), Some("\"hello\""));
    }

    #[tokio::test]
    async fn test_recv_timeout_records_null() {
        let sysdb = InMemorySystemDatabase::new();
        sysdb
            .init_workflow_status(&pending_row("B", "receiver", "[]"))
            .await
            .unwrap();

        let got = sysdb
            .recv("B", 0, "chan", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(got.is_none());

        // A later message does not change the recorded timeout
        sysdb
            .init_workflow_status(&pending_row("A", "sender", "[]"))
            .await
            .unwrap();
        sysdb.send("A", 0, "B", "chan", "\"late\"").await.unwrap();

        let replay = sysdb
            .recv("B", 0, "chan", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(replay.is_none());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_send() {
        let sysdb = std::sync::Arc::new(InMemorySystemDatabase::new());
        sysdb
            .init_workflow_status(&pending_row("A", "sender", "[]"))
            .await
            .unwrap();
        sysdb
            .init_workflow_status(&pending_row("B", "receiver", "[]"))
            .await
            .unwrap();

        let receiver = {
            let sysdb = sysdb.clone();
            tokio::spawn(async move { sysdb.recv("B", 0, "chan", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        sysdb.send("A", 0, "B", "chan", "\"ping\"").await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), receiver)
            .await
            .expect("recv should wake promptly")
            .unwrap()
            .unwrap();
        assert_eq!(got.as_deref(), Some("\"ping\""));
    }

    #[tokio::test]
    async fn test_event_write_once() {
        let sysdb = InMemorySystemDatabase::new();
        sysdb
            .init_workflow_status(&pending_row("wf-1", "f", "[]"))
            .await
            .unwrap();

        sysdb.set_event("wf-1", 0, "result", "\"a\"").await.unwrap();
        // Same value replays
        sysdb.set_event("wf-1", 0, "result", "\"a\"").await.unwrap();
        // Distinct value from a later step fails
        assert!(matches!(
            sysdb.set_event("wf-1", 1, "result", "\"b\"").await,
            Err(SysDbError::EventAlreadySet { .. })
        ));

        let got = sysdb
            .get_event("wf-1", "result", Duration::from_millis(50), None)
            .await
            .unwrap();
        assert_eq!(got.as_deref(), Some("\"a\""));
    }

    #[tokio::test]
    async fn test_get_event_wakes_on_set() {
        let sysdb = std::sync::Arc::new(InMemorySystemDatabase::new());
        sysdb
            .init_workflow_status(&pending_row("wf-1", "f", "[]"))
            .await
            .unwrap();

        let getter = {
            let sysdb = sysdb.clone();
            tokio::spawn(async move {
                sysdb
                    .get_event("wf-1", "status", Duration::from_secs(5), None)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        sysdb
            .set_event("wf-1", 0, "status", "\"ready\"")
            .await
            .unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), getter)
            .await
            .expect("get_event should wake promptly")
            .unwrap()
            .unwrap();
        assert_eq!(got.as_deref(), Some("\"ready\""));
    }

    #[tokio::test]
    async fn test_queue_concurrency_limit() {
        let sysdb = InMemorySystemDatabase::new();
        for i in 0..5 {
            let id = format!("wf-{i}");
            sysdb
                .init_workflow_status(&pending_row(&id, "task", "[]").with_queue("lane"))
                .await
                .unwrap();
            sysdb.enqueue(&id, "lane").await.unwrap();
        }

        let first = sysdb
            .start_queued_workflows("lane", 2, "exec-test")
            .await
            .unwrap();
        assert_eq!(first, vec!["wf-0", "wf-1"]);

        // Lane is full until something completes
        let second = sysdb
            .start_queued_workflows("lane", 2, "exec-test")
            .await
            .unwrap();
        assert!(second.is_empty());

        sysdb.mark_queue_completed("wf-0").await.unwrap();
        let third = sysdb
            .start_queued_workflows("lane", 2, "exec-test")
            .await
            .unwrap();
        assert_eq!(third, vec!["wf-2"]);
    }

    #[tokio::test]
    async fn test_pending_workflows_for_dead_executor() {
        let sysdb = InMemorySystemDatabase::new();
        sysdb.touch_executor("alive").await.unwrap();

        let mut owned_by_dead = pending_row("wf-dead", "f", "[]");
        owned_by_dead.executor_id = Some("dead".to_string());
        sysdb.init_workflow_status(&owned_by_dead).await.unwrap();

        let mut owned_by_alive = pending_row("wf-alive", "f", "[]");
        owned_by_alive.executor_id = Some("alive".to_string());
        sysdb.init_workflow_status(&owned_by_alive).await.unwrap();

        let mut mine = pending_row("wf-mine", "f", "[]");
        mine.executor_id = Some("me".to_string());
        sysdb.init_workflow_status(&mine).await.unwrap();

        let pending = sysdb
            .pending_workflows("me", Duration::from_secs(30))
            .await
            .unwrap();

        assert!(pending.contains(&"wf-dead".to_string()));
        assert!(pending.contains(&"wf-mine".to_string()));
        assert!(!pending.contains(&"wf-alive".to_string()));
    }
}
