//! Operation log and idempotency engine
//!
//! Sits between workflow execution and the databases. Each step call is
//! keyed by (workflow_id, function_id); this module consults the durable
//! log before running user code and records the outcome after, which is
//! what makes re-execution after a crash effect-free.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::appdb::{
    self, AppDatabase, AppDbError, BufferedTxnOutput,
};
use crate::error::{ErrorEnvelope, RedriveError};
use crate::registry::Registry;
use crate::sysdb::{RecordedOutcome, StatusUpdate, SystemDatabase};

/// In-process buffers shared by all live workflows.
///
/// Locks are held only across enqueue/dequeue, never across awaits.
#[derive(Default)]
pub(crate) struct ExecutionBuffers {
    /// Read-only transactional outputs awaiting durable flush
    txn_outputs: Mutex<HashMap<(String, i32), BufferedTxnOutput>>,

    /// Terminal workflow statuses awaiting durable flush
    statuses: Mutex<HashMap<String, StatusUpdate>>,
}

impl ExecutionBuffers {
    pub fn buffer_txn_output(&self, row: BufferedTxnOutput) {
        self.txn_outputs
            .lock()
            .insert((row.workflow_id.clone(), row.function_id), row);
    }

    pub fn lookup_txn_output(&self, workflow_id: &str, function_id: i32) -> Option<String> {
        self.txn_outputs
            .lock()
            .get(&(workflow_id.to_string(), function_id))
            .map(|row| row.output.clone())
    }

    /// Snapshot this workflow's buffered rows for an in-transaction flush
    pub fn snapshot_txn_outputs(&self, workflow_id: &str) -> Vec<BufferedTxnOutput> {
        let mut rows: Vec<BufferedTxnOutput> = self
            .txn_outputs
            .lock()
            .values()
            .filter(|row| row.workflow_id == workflow_id)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.function_id);
        rows
    }

    /// Snapshot every buffered row for the background flush
    pub fn snapshot_all_txn_outputs(&self) -> Vec<BufferedTxnOutput> {
        self.txn_outputs.lock().values().cloned().collect()
    }

    /// Forget rows that are now durable
    pub fn discard_txn_outputs(&self, rows: &[BufferedTxnOutput]) {
        let mut buffer = self.txn_outputs.lock();
        for row in rows {
            buffer.remove(&(row.workflow_id.clone(), row.function_id));
        }
    }

    pub fn buffer_status(&self, update: StatusUpdate) {
        self.statuses
            .lock()
            .insert(update.workflow_id.clone(), update);
    }

    pub fn snapshot_statuses(&self) -> Vec<StatusUpdate> {
        self.statuses.lock().values().cloned().collect()
    }

    pub fn discard_statuses(&self, updates: &[StatusUpdate]) {
        let mut buffer = self.statuses.lock();
        for update in updates {
            buffer.remove(&update.workflow_id);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.txn_outputs.lock().is_empty() && self.statuses.lock().is_empty()
    }
}

/// Outcome of one transactional attempt
enum TxnAttempt {
    /// The log already had this step; user code was not invoked
    Replayed(RecordedOutcome),
    /// User code ran; output serialized, snapshot captured at entry
    Fresh { output: String, snapshot: String },
}

/// The operation log engine
pub(crate) struct OperationLog {
    pub sysdb: Arc<dyn SystemDatabase>,
    pub appdb: Option<AppDatabase>,
    pub registry: Registry,
    pub buffers: ExecutionBuffers,
}

impl OperationLog {
    pub fn new(
        sysdb: Arc<dyn SystemDatabase>,
        appdb: Option<AppDatabase>,
        registry: Registry,
    ) -> Self {
        Self {
            sysdb,
            appdb,
            registry,
            buffers: ExecutionBuffers::default(),
        }
    }

    fn appdb(&self) -> Result<&AppDatabase, RedriveError> {
        self.appdb
            .as_ref()
            .ok_or(RedriveError::AppDatabase(AppDbError::NotConfigured))
    }

    /// Run a transactional step under the guard protocol.
    ///
    /// Inside the user transaction: a guarded SELECT captures the snapshot
    /// and replays any recorded outcome; otherwise the guard row is written
    /// (the uniqueness anchor), buffered read-only ancestors are flushed so
    /// they commit atomically with this write, the user callback runs, and
    /// the guard row is filled with the real output.
    pub async fn run_transaction(
        &self,
        workflow_id: &str,
        function_id: i32,
        name: &str,
        args: &Value,
        replay_only: bool,
    ) -> Result<Value, RedriveError> {
        let (func, config) = self.registry.transaction(name)?;

        if config.read_only {
            if let Some(buffered) = self.buffers.lookup_txn_output(workflow_id, function_id) {
                return decode_output(&buffered);
            }
        }

        let appdb = self.appdb()?;
        let entry_time = Utc::now().timestamp_millis();

        // Owned copies: the transaction closure may run several times
        let wf = workflow_id.to_string();
        let args = args.clone();
        let read_only = config.read_only;
        let buffered = if read_only {
            Vec::new()
        } else {
            self.buffers.snapshot_txn_outputs(workflow_id)
        };

        let attempt = appdb
            .transaction::<TxnAttempt, _>(config.isolation, read_only, move |conn: &mut sqlx::PgConnection| {
                let wf = wf.clone();
                let args = args.clone();
                let func = func.clone();
                let buffered = buffered.clone();
                Box::pin(async move {
                    let check = appdb::guarded_check(conn, &wf, function_id)
                        .await
                        .map_err(RedriveError::AppDatabase)?;

                    if let Some(recorded) = check.recorded {
                        return Ok(TxnAttempt::Replayed(recorded));
                    }
                    if replay_only {
                        return Err(RedriveError::Debugger {
                            workflow_id: wf,
                            function_id,
                        });
                    }

                    if !read_only {
                        appdb::insert_guard(conn, &wf, function_id, &check.snapshot, entry_time)
                            .await
                            .map_err(RedriveError::AppDatabase)?;
                        appdb::flush_buffered_outputs(conn, &buffered)
                            .await
                            .map_err(RedriveError::AppDatabase)?;
                    }

                    let output = func(conn, args).await?;
                    let output = serde_json::to_string(&output)?;

                    if !read_only {
                        appdb::finalize_guard(conn, &wf, function_id, &output)
                            .await
                            .map_err(RedriveError::AppDatabase)?;
                    }

                    Ok(TxnAttempt::Fresh {
                        output,
                        snapshot: check.snapshot,
                    })
                })
            })
            .await;

        match attempt {
            Ok(TxnAttempt::Replayed(recorded)) => {
                debug!(%workflow_id, function_id, %name, "transaction replayed from log");
                decode_recorded(recorded)
            }
            Ok(TxnAttempt::Fresh { output, snapshot }) => {
                if config.read_only {
                    self.buffers.buffer_txn_output(BufferedTxnOutput {
                        workflow_id: workflow_id.to_string(),
                        function_id,
                        output: output.clone(),
                        txn_snapshot: snapshot,
                        created_at: entry_time,
                    });
                } else {
                    // Everything the guard flushed is durable now
                    let flushed = self.buffers.snapshot_txn_outputs(workflow_id);
                    self.buffers.discard_txn_outputs(&flushed);
                }
                decode_output(&output)
            }
            Err(err) => {
                if should_record(&err) {
                    let envelope = err.to_envelope().to_json();
                    if let Err(record_err) = appdb::record_txn_error(
                        appdb.pool(),
                        workflow_id,
                        function_id,
                        "",
                        &envelope,
                        entry_time,
                    )
                    .await
                    {
                        warn!(%workflow_id, function_id, "failed to record transaction error: {record_err}");
                    }
                }
                Err(err)
            }
        }
    }

    /// Run a non-transactional step with bounded retries.
    ///
    /// The recorded outcome is consulted first; once an outcome exists the
    /// user code is never invoked again. A cancelled step records nothing.
    pub async fn run_step(
        &self,
        workflow_id: &str,
        function_id: i32,
        name: &str,
        args: &Value,
        replay_only: bool,
        cancel: &CancellationToken,
    ) -> Result<Value, RedriveError> {
        let (func, config) = self.registry.step(name)?;

        if let Some(recorded) = self
            .sysdb
            .check_operation_output(workflow_id, function_id)
            .await?
        {
            debug!(%workflow_id, function_id, %name, "step replayed from log");
            return decode_recorded(recorded);
        }
        if replay_only {
            return Err(RedriveError::Debugger {
                workflow_id: workflow_id.to_string(),
                function_id,
            });
        }

        let max_attempts = if config.retries_allowed {
            config.max_attempts.max(1)
        } else {
            1
        };

        let mut last_error: Option<RedriveError> = None;
        for attempt in 0..max_attempts {
            if cancel.is_cancelled() {
                return Err(RedriveError::Cancelled(workflow_id.to_string()));
            }

            let result = tokio::select! {
                result = func(args.clone()) => result,
                _ = cancel.cancelled() => {
                    return Err(RedriveError::Cancelled(workflow_id.to_string()));
                }
            };

            match result {
                Ok(output) => {
                    let serialized = serde_json::to_string(&output)?;
                    self.sysdb
                        .record_operation_output(workflow_id, function_id, &serialized)
                        .await?;
                    return Ok(output);
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    warn!(%workflow_id, function_id, %name, attempt, "step attempt failed: {err}");
                    last_error = Some(err);

                    // Sleep between attempts only; the last failure throws
                    // without sleeping.
                    if attempt + 1 < max_attempts {
                        let delay = config
                            .interval
                            .mul_f64(config.backoff_rate.powi(attempt as i32));
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => {
                                return Err(RedriveError::Cancelled(workflow_id.to_string()));
                            }
                        }
                    }
                }
            }
        }

        let last = last_error.unwrap_or_else(|| {
            RedriveError::application("step failed without reporting an error")
        });

        let err = if config.retries_allowed {
            RedriveError::RetriesExceeded {
                step_name: name.to_string(),
                max_attempts,
                last_error: last.to_envelope().message,
            }
        } else {
            last
        };

        self.sysdb
            .record_operation_error(workflow_id, function_id, &err.to_envelope().to_json())
            .await?;
        Err(err)
    }

    /// Durable sleep: the wake deadline is pinned by the operation's entry
    /// time, so a replay sleeps only the remainder (or not at all)
    pub async fn run_sleep(
        &self,
        workflow_id: &str,
        function_id: i32,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), RedriveError> {
        let entry = self.sysdb.operation_entry(workflow_id, function_id).await?;
        if entry.outcome.is_some() {
            return Ok(());
        }

        let deadline = entry.created_at + duration.as_millis() as i64;
        let remaining = deadline - Utc::now().timestamp_millis();
        if remaining > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(remaining as u64)) => {}
                _ = cancel.cancelled() => {
                    return Err(RedriveError::Cancelled(workflow_id.to_string()));
                }
            }
        }

        self.sysdb
            .record_operation_output(workflow_id, function_id, &deadline.to_string())
            .await?;
        Ok(())
    }

    /// Flush every buffered read-only output in one batch (background loop)
    pub async fn flush_read_only_outputs(&self) -> Result<usize, RedriveError> {
        let rows = self.buffers.snapshot_all_txn_outputs();
        if rows.is_empty() {
            return Ok(0);
        }
        let appdb = self.appdb()?;

        let batch = rows.clone();
        appdb
            .transaction::<(), _>(
                crate::appdb::IsolationLevel::ReadCommitted,
                false,
                move |conn: &mut sqlx::PgConnection| {
                    let batch = batch.clone();
                    Box::pin(async move {
                        appdb::flush_buffered_outputs(conn, &batch)
                            .await
                            .map_err(RedriveError::AppDatabase)
                    })
                },
            )
            .await?;

        self.buffers.discard_txn_outputs(&rows);
        Ok(rows.len())
    }

    /// Flush buffered workflow statuses in one batch (background loop)
    pub async fn flush_statuses(&self) -> Result<usize, RedriveError> {
        let updates = self.buffers.snapshot_statuses();
        if updates.is_empty() {
            return Ok(0);
        }
        self.sysdb.flush_status_batch(&updates).await?;
        self.buffers.discard_statuses(&updates);
        Ok(updates.len())
    }
}

/// Whether a transactional step error belongs in the durable log.
///
/// Cancellation is external, replay misses are debugger-local, and
/// infrastructure failures are transient; all three must not poison the
/// step's record.
fn should_record(err: &RedriveError) -> bool {
    !matches!(
        err,
        RedriveError::Cancelled(_)
            | RedriveError::Debugger { .. }
            | RedriveError::SystemDatabase(_)
            | RedriveError::AppDatabase(AppDbError::NotConfigured)
    )
}

/// Replay a recorded outcome: an error rehydrates its envelope
pub(crate) fn decode_recorded(recorded: RecordedOutcome) -> Result<Value, RedriveError> {
    if let Some(raw) = recorded.error {
        return Err(RedriveError::Application(ErrorEnvelope::from_json(&raw)));
    }
    match recorded.output {
        Some(raw) => decode_output(&raw),
        None => Ok(Value::Null),
    }
}

fn decode_output(raw: &str) -> Result<Value, RedriveError> {
    Ok(serde_json::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistryBuilder, StepConfig};
    use crate::sysdb::InMemorySystemDatabase;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn oplog_with<F>(configure: F) -> OperationLog
    where
        F: FnOnce(&mut RegistryBuilder),
    {
        let mut builder = RegistryBuilder::new();
        configure(&mut builder);
        OperationLog::new(
            Arc::new(InMemorySystemDatabase::new()),
            None,
            builder.build(),
        )
    }

    #[tokio::test]
    async fn test_step_runs_once_and_replays() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_step = calls.clone();
        let oplog = oplog_with(|builder| {
            builder.register_step("side_effect", StepConfig::default(), move |n: i64| {
                let calls = calls_in_step.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(n * 2)
                }
            });
        });

        let cancel = CancellationToken::new();
        let args = serde_json::json!(21);

        let first = oplog
            .run_step("wf-1", 0, "side_effect", &args, false, &cancel)
            .await
            .unwrap();
        let replay = oplog
            .run_step("wf-1", 0, "side_effect", &args, false, &cancel)
            .await
            .unwrap();

        assert_eq!(first, serde_json::json!(42));
        assert_eq!(replay, first);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_step_retry_exhaustion_records_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_step = calls.clone();
        let oplog = oplog_with(|builder| {
            builder.register_step(
                "flaky",
                StepConfig::default()
                    .with_max_attempts(3)
                    .with_interval(Duration::from_millis(1))
                    .with_backoff_rate(2.0),
                move |_: serde_json::Value| {
                    let calls = calls_in_step.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<i64, _>(RedriveError::application("gateway timeout"))
                    }
                },
            );
        });

        let cancel = CancellationToken::new();
        let args = serde_json::json!({});

        let err = oplog
            .run_step("wf-1", 0, "flaky", &args, false, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RedriveError::RetriesExceeded { max_attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // The recorded failure replays without invoking the step again
        let replay = oplog
            .run_step("wf-1", 0, "flaky", &args, false, &cancel)
            .await
            .unwrap_err();
        assert_eq!(
            replay.to_envelope().name,
            crate::error::envelope_names::RETRIES_EXCEEDED
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_step_without_retries_runs_exactly_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_step = calls.clone();
        let oplog = oplog_with(|builder| {
            builder.register_step(
                "once",
                StepConfig::no_retries(),
                move |_: serde_json::Value| {
                    let calls = calls_in_step.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<i64, _>(RedriveError::application("hard failure"))
                    }
                },
            );
        });

        let cancel = CancellationToken::new();
        let err = oplog
            .run_step("wf-1", 0, "once", &serde_json::json!({}), false, &cancel)
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.to_envelope().message, "hard failure");
    }

    #[tokio::test]
    async fn test_cancelled_step_records_nothing() {
        let oplog = oplog_with(|builder| {
            builder.register_step(
                "slow",
                StepConfig::default(),
                move |_: serde_json::Value| async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(0i64)
                },
            );
        });

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = oplog
            .run_step("wf-1", 0, "slow", &serde_json::json!({}), false, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());

        // Cancellation is external; nothing is recorded for the step
        let outcome = oplog.sysdb.check_operation_output("wf-1", 0).await.unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn test_replay_only_requires_recorded_outcome() {
        let oplog = oplog_with(|builder| {
            builder.register_step(
                "anything",
                StepConfig::default(),
                move |_: serde_json::Value| async move { Ok(1i64) },
            );
        });

        let cancel = CancellationToken::new();
        let err = oplog
            .run_step("wf-1", 0, "anything", &serde_json::json!({}), true, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RedriveError::Debugger { function_id: 0, .. }));
    }

    #[tokio::test]
    async fn test_sleep_is_durable() {
        let oplog = oplog_with(|_| {});
        let cancel = CancellationToken::new();

        oplog
            .run_sleep("wf-1", 0, Duration::from_millis(20), &cancel)
            .await
            .unwrap();

        // Replay returns immediately: the deadline has already passed
        let started = std::time::Instant::now();
        oplog
            .run_sleep("wf-1", 0, Duration::from_millis(20), &cancel)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(15));
    }

    #[tokio::test]
    async fn test_transaction_without_appdb_fails() {
        let oplog = oplog_with(|builder| {
            builder.register_transaction(
                "write_kv",
                Default::default(),
                |_conn: &mut sqlx::PgConnection, _input: serde_json::Value| {
                    Box::pin(async move { Ok(0i64) })
                },
            );
        });

        let err = oplog
            .run_transaction("wf-1", 0, "write_kv", &serde_json::json!({}), false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RedriveError::AppDatabase(AppDbError::NotConfigured)
        ));
    }

    #[test]
    fn test_buffers_snapshot_and_discard() {
        let buffers = ExecutionBuffers::default();
        for function_id in [2, 0, 1] {
            buffers.buffer_txn_output(BufferedTxnOutput {
                workflow_id: "wf-1".to_string(),
                function_id,
                output: function_id.to_string(),
                txn_snapshot: "snap".to_string(),
                created_at: 0,
            });
        }

        // Ancestors flush in step order
        let rows = buffers.snapshot_txn_outputs("wf-1");
        let ids: Vec<i32> = rows.iter().map(|r| r.function_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);

        buffers.discard_txn_outputs(&rows);
        assert!(buffers.is_empty());
    }
}
