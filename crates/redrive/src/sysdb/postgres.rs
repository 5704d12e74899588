//! PostgreSQL implementation of SystemDatabase
//!
//! Owns all SQL against the `dbos.*` schema:
//! - Workflow status rows with insert-or-attach dedup by workflow id
//! - Operation outputs with guard-row idempotency
//! - Notifications and keyed events with LISTEN/NOTIFY wakeups
//! - Queue admission with FOR UPDATE SKIP LOCKED under an advisory lock

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::sync::watch;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use super::gateway::*;
use super::waiters::WaiterMap;
use crate::error::ErrorEnvelope;

/// NOTIFY channel for new messages; payload is `destination::topic`
pub const NOTIFICATIONS_CHANNEL: &str = "dbos_notifications_channel";

/// NOTIFY channel for keyed events; payload is `workflow::key`
pub const WORKFLOW_EVENTS_CHANNEL: &str = "dbos_workflow_events_channel";

/// Output marker recorded for operations whose result is "nothing":
/// a timed-out recv, a completed send, a set event.
const NULL_MARKER: &str = "null";

const SCHEMA_DDL: &str = r#"
CREATE SCHEMA IF NOT EXISTS dbos;

CREATE TABLE IF NOT EXISTS dbos.workflow_status (
    workflow_uuid TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    name TEXT NOT NULL,
    authenticated_user TEXT,
    assumed_role TEXT,
    authenticated_roles TEXT,
    request TEXT,
    inputs TEXT NOT NULL,
    output TEXT,
    error TEXT,
    executor_id TEXT,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL,
    application_version TEXT,
    queue_name TEXT,
    queued_at BIGINT,
    started_at BIGINT,
    completed_at BIGINT
);

CREATE INDEX IF NOT EXISTS idx_workflow_status_status
    ON dbos.workflow_status (status, created_at);

CREATE TABLE IF NOT EXISTS dbos.operation_outputs (
    workflow_uuid TEXT NOT NULL,
    function_id INT NOT NULL,
    output TEXT,
    error TEXT,
    txn_id TEXT,
    txn_snapshot TEXT,
    created_at BIGINT NOT NULL,
    PRIMARY KEY (workflow_uuid, function_id)
);

CREATE TABLE IF NOT EXISTS dbos.notifications (
    message_uuid TEXT PRIMARY KEY,
    destination_uuid TEXT NOT NULL,
    topic TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at BIGINT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_notifications_dest_topic
    ON dbos.notifications (destination_uuid, topic, created_at);

CREATE TABLE IF NOT EXISTS dbos.workflow_events (
    workflow_uuid TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (workflow_uuid, key)
);

CREATE TABLE IF NOT EXISTS dbos.workflow_queue (
    workflow_uuid TEXT PRIMARY KEY,
    queue_name TEXT NOT NULL,
    created_at BIGINT NOT NULL,
    started_at BIGINT,
    completed_at BIGINT
);

CREATE INDEX IF NOT EXISTS idx_workflow_queue_lane
    ON dbos.workflow_queue (queue_name, created_at);

CREATE TABLE IF NOT EXISTS dbos.executor_heartbeats (
    executor_id TEXT PRIMARY KEY,
    last_seen BIGINT NOT NULL
);
"#;

/// PostgreSQL system database gateway
///
/// A background task holds one LISTEN connection for both channels and wakes
/// registered waiters; `recv`/`get_event` register interest before their
/// initial SELECT, which closes the lost-wakeup window.
pub struct PostgresSystemDatabase {
    pool: PgPool,
    waiters: WaiterMap,
    shutdown_tx: watch::Sender<bool>,
}

impl PostgresSystemDatabase {
    /// Connect to the system database and start the notification listener
    pub async fn connect(url: &str) -> Result<Self, SysDbError> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(url)
            .await
            .map_err(db_err)?;
        Self::with_pool(pool).await
    }

    /// Wrap an existing pool (used by tests that manage their own database)
    pub async fn with_pool(pool: PgPool) -> Result<Self, SysDbError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let this = Self {
            pool,
            waiters: WaiterMap::new(),
            shutdown_tx,
        };
        this.spawn_listener(shutdown_rx).await?;
        Ok(this)
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Stop the notification listener task
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn spawn_listener(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), SysDbError> {
        let mut listener = PgListener::connect_with(&self.pool).await.map_err(db_err)?;
        listener
            .listen_all([NOTIFICATIONS_CHANNEL, WORKFLOW_EVENTS_CHANNEL])
            .await
            .map_err(db_err)?;

        let waiters = self.waiters.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = listener.recv() => match received {
                        Ok(notification) => {
                            let prefix = if notification.channel() == NOTIFICATIONS_CHANNEL {
                                "n"
                            } else {
                                "e"
                            };
                            waiters.wake(&format!("{}::{}", prefix, notification.payload()));
                        }
                        Err(e) => {
                            // PgListener reconnects on the next recv; don't spin
                            warn!("notification listener error: {}", e);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    },
                    _ = shutdown_rx.changed() => {
                        debug!("notification listener: shutdown requested");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Fetch the operation row inside a transaction, locking it
    async fn locked_outcome(
        tx: &mut Transaction<'_, Postgres>,
        workflow_id: &str,
        function_id: i32,
    ) -> Result<Option<RecordedOutcome>, SysDbError> {
        let row = sqlx::query(
            r#"
            SELECT output, error FROM dbos.operation_outputs
            WHERE workflow_uuid = $1 AND function_id = $2
            FOR UPDATE
            "#,
        )
        .bind(workflow_id)
        .bind(function_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?;

        Ok(row.map(|row| RecordedOutcome {
            output: row.get("output"),
            error: row.get("error"),
        }))
    }

    /// Consume the oldest message for (workflow, topic) and record it as the
    /// operation's output, all in one transaction. Returns the recorded
    /// outcome if a concurrent duplicate already finished this operation.
    async fn try_consume_message(
        &self,
        workflow_id: &str,
        function_id: i32,
        topic: &str,
    ) -> Result<Option<RecordedOutcome>, SysDbError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        if let Some(outcome) = Self::locked_outcome(&mut tx, workflow_id, function_id).await? {
            if outcome.is_final() {
                return Ok(Some(outcome));
            }
        }

        let row = sqlx::query(
            r#"
            SELECT message_uuid, message FROM dbos.notifications
            WHERE destination_uuid = $1 AND topic = $2
            ORDER BY created_at ASC, message_uuid ASC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(workflow_id)
        .bind(topic)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let message_uuid: String = row.get("message_uuid");
        let message: String = row.get("message");

        sqlx::query("DELETE FROM dbos.notifications WHERE message_uuid = $1")
            .bind(&message_uuid)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        sqlx::query(
            r#"
            UPDATE dbos.operation_outputs SET output = $3
            WHERE workflow_uuid = $1 AND function_id = $2
            "#,
        )
        .bind(workflow_id)
        .bind(function_id)
        .bind(&message)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        debug!(%workflow_id, function_id, %topic, "consumed notification");

        Ok(Some(RecordedOutcome {
            output: Some(message),
            error: None,
        }))
    }

    async fn read_event_value(&self, target_id: &str, key: &str) -> Result<Option<String>, SysDbError> {
        let row = sqlx::query(
            "SELECT value FROM dbos.workflow_events WHERE workflow_uuid = $1 AND key = $2",
        )
        .bind(target_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|r| r.get("value")))
    }
}

#[async_trait]
impl SystemDatabase for PostgresSystemDatabase {
    async fn bootstrap(&self) -> Result<(), SysDbError> {
        sqlx::raw_sql(SCHEMA_DDL)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("failed to bootstrap system schema: {}", e);
                db_err(e)
            })?;
        debug!("system schema ready");
        Ok(())
    }

    #[instrument(skip(self, row), fields(workflow_id = %row.workflow_id))]
    async fn init_workflow_status(&self, row: &WorkflowStatusRow) -> Result<bool, SysDbError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO dbos.workflow_status (
                workflow_uuid, status, name, authenticated_user, assumed_role,
                authenticated_roles, request, inputs, output, error, executor_id,
                created_at, updated_at, application_version, queue_name,
                queued_at, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (workflow_uuid) DO NOTHING
            "#,
        )
        .bind(&row.workflow_id)
        .bind(row.status.as_str())
        .bind(&row.name)
        .bind(&row.authenticated_user)
        .bind(&row.assumed_role)
        .bind(&row.authenticated_roles)
        .bind(&row.request)
        .bind(&row.inputs)
        .bind(&row.output)
        .bind(&row.error)
        .bind(&row.executor_id)
        .bind(row.created_at)
        .bind(row.updated_at)
        .bind(&row.application_version)
        .bind(&row.queue_name)
        .bind(row.queued_at)
        .bind(row.started_at)
        .bind(row.completed_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected()
            == 1;

        if inserted {
            debug!("created workflow");
            return Ok(true);
        }

        // Attach to the existing run if it is the same call; otherwise the
        // caller supplied one id for two different workflows.
        let existing = self
            .get_workflow_status(&row.workflow_id)
            .await?
            .ok_or_else(|| SysDbError::WorkflowNotFound(row.workflow_id.clone()))?;

        if existing.name == row.name && existing.inputs == row.inputs {
            Ok(false)
        } else {
            Err(SysDbError::WorkflowConflict(row.workflow_id.clone()))
        }
    }

    #[instrument(skip(self, output, error))]
    async fn update_workflow_status(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
        output: Option<String>,
        error: Option<String>,
    ) -> Result<(), SysDbError> {
        let now = Utc::now().timestamp_millis();
        let completed_at = status.is_terminal().then_some(now);

        // Terminal rows are immutable; a second identical update is a no-op.
        let updated = sqlx::query(
            r#"
            UPDATE dbos.workflow_status
            SET status = $2,
                output = COALESCE($3, output),
                error = COALESCE($4, error),
                updated_at = $5,
                completed_at = COALESCE($6, completed_at)
            WHERE workflow_uuid = $1 AND status = 'PENDING'
            "#,
        )
        .bind(workflow_id)
        .bind(status.as_str())
        .bind(&output)
        .bind(&error)
        .bind(now)
        .bind(completed_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected();

        if updated == 0 && self.get_workflow_status(workflow_id).await?.is_none() {
            return Err(SysDbError::WorkflowNotFound(workflow_id.to_string()));
        }

        debug!(%workflow_id, %status, "updated workflow status");
        Ok(())
    }

    async fn claim_workflow(
        &self,
        workflow_id: &str,
        executor_id: &str,
    ) -> Result<(), SysDbError> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            UPDATE dbos.workflow_status
            SET executor_id = $2, updated_at = $3
            WHERE workflow_uuid = $1 AND status = 'PENDING'
            "#,
        )
        .bind(workflow_id)
        .bind(executor_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_workflow_status(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowStatusRow>, SysDbError> {
        let row = sqlx::query(
            r#"
            SELECT workflow_uuid, status, name, authenticated_user, assumed_role,
                   authenticated_roles, request, inputs, output, error, executor_id,
                   created_at, updated_at, application_version, queue_name,
                   queued_at, started_at, completed_at
            FROM dbos.workflow_status
            WHERE workflow_uuid = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(parse_status_row).transpose()
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
                    return Ok(WorkflowOutcome::Success(row.output.unwrap_or_else(|| {
                        NULL_MARKER.to_string()
                    })))
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
        let order = if filter.newest_first { "DESC" } else { "ASC" };
        let sql = format!(
            r#"
            SELECT workflow_uuid, status, name, authenticated_user, assumed_role,
                   authenticated_roles, request, inputs, output, error, executor_id,
                   created_at, updated_at, application_version, queue_name,
                   queued_at, started_at, completed_at
            FROM dbos.workflow_status
            WHERE ($1::text IS NULL OR name = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at {order}
            LIMIT $3
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(&filter.name)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.limit.map(i64::from).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.into_iter().map(parse_status_row).collect()
    }

    async fn flush_status_batch(&self, batch: &[StatusUpdate]) -> Result<(), SysDbError> {
        if batch.is_empty() {
            return Ok(());
        }
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        for update in batch {
            sqlx::query(
                r#"
                UPDATE dbos.workflow_status
                SET status = $2,
                    output = COALESCE($3, output),
                    error = COALESCE($4, error),
                    updated_at = $5,
                    completed_at = CASE WHEN $2 = 'PENDING' THEN completed_at ELSE $5 END
                WHERE workflow_uuid = $1 AND status = 'PENDING'
                "#,
            )
            .bind(&update.workflow_id)
            .bind(update.status.as_str())
            .bind(&update.output)
            .bind(&update.error)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        debug!(count = batch.len(), "flushed status batch");
        Ok(())
    }

    async fn check_operation_output(
        &self,
        workflow_id: &str,
        function_id: i32,
    ) -> Result<Option<RecordedOutcome>, SysDbError> {
        let row = sqlx::query(
            r#"
            SELECT output, error FROM dbos.operation_outputs
            WHERE workflow_uuid = $1 AND function_id = $2
            "#,
        )
        .bind(workflow_id)
        .bind(function_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row
            .map(|row| RecordedOutcome {
                output: row.get("output"),
                error: row.get("error"),
            })
            .filter(RecordedOutcome::is_final))
    }

    async fn operation_entry(
        &self,
        workflow_id: &str,
        function_id: i32,
    ) -> Result<OperationEntry, SysDbError> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO dbos.operation_outputs (workflow_uuid, function_id, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (workflow_uuid, function_id) DO NOTHING
            "#,
        )
        .bind(workflow_id)
        .bind(function_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let row = sqlx::query(
            r#"
            SELECT created_at, output, error FROM dbos.operation_outputs
            WHERE workflow_uuid = $1 AND function_id = $2
            "#,
        )
        .bind(workflow_id)
        .bind(function_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let outcome = RecordedOutcome {
            output: row.get("output"),
            error: row.get("error"),
        };
        Ok(OperationEntry {
            created_at: row.get("created_at"),
            outcome: outcome.is_final().then_some(outcome),
        })
    }

    #[instrument(skip(self, output))]
    async fn record_operation_output(
        &self,
        workflow_id: &str,
        function_id: i32,
        output: &str,
    ) -> Result<(), SysDbError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        match Self::locked_outcome(&mut tx, workflow_id, function_id).await? {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO dbos.operation_outputs (workflow_uuid, function_id, output, created_at)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (workflow_uuid, function_id) DO NOTHING
                    "#,
                )
                .bind(workflow_id)
                .bind(function_id)
                .bind(output)
                .bind(Utc::now().timestamp_millis())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
            Some(existing) if !existing.is_final() => {
                sqlx::query(
                    r#"
                    UPDATE dbos.operation_outputs SET output = $3
                    WHERE workflow_uuid = $1 AND function_id = $2
                    "#,
                )
                .bind(workflow_id)
                .bind(function_id)
                .bind(output)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
            Some(existing) if existing.output.as_deref() == Some(output) => {}
            Some(_) => {
                return Err(SysDbError::ConflictingOutcome {
                    workflow_id: workflow_id.to_string(),
                    function_id,
                })
            }
        }

        tx.commit().await.map_err(db_err)
    }

    #[instrument(skip(self, error))]
    async fn record_operation_error(
        &self,
        workflow_id: &str,
        function_id: i32,
        error: &str,
    ) -> Result<(), SysDbError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        match Self::locked_outcome(&mut tx, workflow_id, function_id).await? {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO dbos.operation_outputs (workflow_uuid, function_id, error, created_at)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (workflow_uuid, function_id) DO NOTHING
                    "#,
                )
                .bind(workflow_id)
                .bind(function_id)
                .bind(error)
                .bind(Utc::now().timestamp_millis())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
            Some(existing) if !existing.is_final() => {
                sqlx::query(
                    r#"
                    UPDATE dbos.operation_outputs SET error = $3
                    WHERE workflow_uuid = $1 AND function_id = $2
                    "#,
                )
                .bind(workflow_id)
                .bind(function_id)
                .bind(error)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
            Some(existing) if existing.error.as_deref() == Some(error) => {}
            Some(_) => {
                return Err(SysDbError::ConflictingOutcome {
                    workflow_id: workflow_id.to_string(),
                    function_id,
                })
            }
        }

        tx.commit().await.map_err(db_err)
    }

    #[instrument(skip(self, message))]
    async fn send(
        &self,
        source_id: &str,
        function_id: i32,
        destination_id: &str,
        topic: &str,
        message: &str,
    ) -> Result<(), SysDbError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Dedup by the sender's operation record; a retried send replays.
        if let Some(outcome) = Self::locked_outcome(&mut tx, source_id, function_id).await? {
            if outcome.is_final() {
                return replay_unit_outcome(source_id, outcome);
            }
        }

        let exists = sqlx::query("SELECT 1 FROM dbos.workflow_status WHERE workflow_uuid = $1")
            .bind(destination_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .is_some();

        if !exists {
            // Destination is checked durably: the same replayed send must
            // fail the same way.
            sqlx::query(
                r#"
                INSERT INTO dbos.operation_outputs (workflow_uuid, function_id, error, created_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (workflow_uuid, function_id)
                DO UPDATE SET error = EXCLUDED.error
                "#,
            )
            .bind(source_id)
            .bind(function_id)
            .bind(
                ErrorEnvelope::new("DestinationNotFound", destination_id).to_json(),
            )
            .bind(Utc::now().timestamp_millis())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            tx.commit().await.map_err(db_err)?;
            return Err(SysDbError::DestinationNotFound(destination_id.to_string()));
        }

        let now = Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO dbos.notifications (message_uuid, destination_uuid, topic, message, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(destination_id)
        .bind(topic)
        .bind(message)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO dbos.operation_outputs AS t (workflow_uuid, function_id, output, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (workflow_uuid, function_id)
            DO UPDATE SET output = EXCLUDED.output
            WHERE t.output IS NULL AND t.error IS NULL
            "#,
        )
        .bind(source_id)
        .bind(function_id)
        .bind(NULL_MARKER)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFICATIONS_CHANNEL)
            .bind(format!("{destination_id}::{topic}"))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        debug!(%destination_id, %topic, "sent notification");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn recv(
        &self,
        workflow_id: &str,
        function_id: i32,
        topic: &str,
        timeout: Duration,
    ) -> Result<Option<String>, SysDbError> {
        // The entry guard pins the deadline to the first attempt's clock.
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

            match self
                .try_consume_message(workflow_id, function_id, topic)
                .await?
            {
                Some(outcome) => break decode_message_outcome(workflow_id, outcome),
                None => {
                    let remaining = deadline - Utc::now().timestamp_millis();
                    if remaining <= 0 {
                        // Record the timeout so replays observe it too.
                        match self
                            .record_operation_output(workflow_id, function_id, NULL_MARKER)
                            .await
                        {
                            Ok(()) => break Ok(None),
                            Err(SysDbError::ConflictingOutcome { .. }) => {
                                // A concurrent duplicate won with a message.
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

    #[instrument(skip(self, value))]
    async fn set_event(
        &self,
        workflow_id: &str,
        function_id: i32,
        key: &str,
        value: &str,
    ) -> Result<(), SysDbError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        if let Some(outcome) = Self::locked_outcome(&mut tx, workflow_id, function_id).await? {
            if outcome.is_final() {
                return replay_unit_outcome(workflow_id, outcome);
            }
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO dbos.workflow_events (workflow_uuid, key, value)
            VALUES ($1, $2, $3)
            ON CONFLICT (workflow_uuid, key) DO NOTHING
            "#,
        )
        .bind(workflow_id)
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected()
            == 1;

        let now = Utc::now().timestamp_millis();
        if !inserted {
            let existing: String = sqlx::query(
                "SELECT value FROM dbos.workflow_events WHERE workflow_uuid = $1 AND key = $2",
            )
            .bind(workflow_id)
            .bind(key)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?
            .get("value");

            if existing != value {
                // First write wins; the divergent retry fails durably.
                sqlx::query(
                    r#"
                    INSERT INTO dbos.operation_outputs (workflow_uuid, function_id, error, created_at)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (workflow_uuid, function_id)
                    DO UPDATE SET error = EXCLUDED.error
                    "#,
                )
                .bind(workflow_id)
                .bind(function_id)
                .bind(ErrorEnvelope::new("EventAlreadySet", key).to_json())
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
                tx.commit().await.map_err(db_err)?;
                return Err(SysDbError::EventAlreadySet {
                    workflow_id: workflow_id.to_string(),
                    key: key.to_string(),
                });
            }
        }

        sqlx::query(
            r#"
            INSERT INTO dbos.operation_outputs AS t (workflow_uuid, function_id, output, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (workflow_uuid, function_id)
            DO UPDATE SET output = EXCLUDED.output
            WHERE t.output IS NULL AND t.error IS NULL
            "#,
        )
        .bind(workflow_id)
        .bind(function_id)
        .bind(NULL_MARKER)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(WORKFLOW_EVENTS_CHANNEL)
            .bind(format!("{workflow_id}::{key}"))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        debug!(%workflow_id, %key, "set event");
        Ok(())
    }

    #[instrument(skip(self, caller))]
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

            if let Some(value) = self.read_event_value(target_id, key).await? {
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
        sqlx::query(
            r#"
            INSERT INTO dbos.workflow_queue (workflow_uuid, queue_name, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (workflow_uuid) DO NOTHING
            "#,
        )
        .bind(workflow_id)
        .bind(queue_name)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn start_queued_workflows(
        &self,
        queue_name: &str,
        concurrency_limit: u32,
        executor_id: &str,
    ) -> Result<Vec<String>, SysDbError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Serialize pumps on the same lane across processes.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(queue_name)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let running: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS running FROM dbos.workflow_queue
            WHERE queue_name = $1 AND started_at IS NOT NULL AND completed_at IS NULL
            "#,
        )
        .bind(queue_name)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?
        .get("running");

        let available = i64::from(concurrency_limit) - running;
        if available <= 0 {
            return Ok(vec![]);
        }

        let rows = sqlx::query(
            r#"
            SELECT workflow_uuid FROM dbos.workflow_queue
            WHERE queue_name = $1 AND started_at IS NULL
            ORDER BY created_at
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(queue_name)
        .bind(available)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let ids: Vec<String> = rows.iter().map(|r| r.get("workflow_uuid")).collect();
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let now = Utc::now().timestamp_millis();
        sqlx::query(
            "UPDATE dbos.workflow_queue SET started_at = $2 WHERE workflow_uuid = ANY($1)",
        )
        .bind(&ids)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            UPDATE dbos.workflow_status
            SET executor_id = $2, started_at = $3, updated_at = $3
            WHERE workflow_uuid = ANY($1) AND status = 'PENDING'
            "#,
        )
        .bind(&ids)
        .bind(executor_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        debug!(%queue_name, count = ids.len(), "admitted queued workflows");
        Ok(ids)
    }

    async fn mark_queue_completed(&self, workflow_id: &str) -> Result<(), SysDbError> {
        sqlx::query(
            r#"
            UPDATE dbos.workflow_queue SET completed_at = $2
            WHERE workflow_uuid = $1 AND completed_at IS NULL
            "#,
        )
        .bind(workflow_id)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn touch_executor(&self, executor_id: &str) -> Result<(), SysDbError> {
        sqlx::query(
            r#"
            INSERT INTO dbos.executor_heartbeats (executor_id, last_seen)
            VALUES ($1, $2)
            ON CONFLICT (executor_id) DO UPDATE SET last_seen = EXCLUDED.last_seen
            "#,
        )
        .bind(executor_id)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn pending_workflows(
        &self,
        executor_id: &str,
        heartbeat_ttl: Duration,
    ) -> Result<Vec<String>, SysDbError> {
        let cutoff = Utc::now().timestamp_millis() - heartbeat_ttl.as_millis() as i64;

        // Queued-but-unstarted workflows belong to the queue pump, not here.
        let rows = sqlx::query(
            r#"
            SELECT w.workflow_uuid FROM dbos.workflow_status w
            WHERE w.status = 'PENDING'
              AND (w.queue_name IS NULL OR w.started_at IS NOT NULL)
              AND (w.executor_id = $1
                   OR w.executor_id IS NULL
                   OR NOT EXISTS (
                       SELECT 1 FROM dbos.executor_heartbeats h
                       WHERE h.executor_id = w.executor_id AND h.last_seen >= $2
                   ))
            ORDER BY w.created_at
            "#,
        )
        .bind(executor_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.iter().map(|r| r.get("workflow_uuid")).collect())
    }
}

// Helper functions

fn db_err(e: sqlx::Error) -> SysDbError {
    SysDbError::Database(e.to_string())
}

fn parse_status_row(row: sqlx::postgres::PgRow) -> Result<WorkflowStatusRow, SysDbError> {
    let status: String = row.get("status");
    Ok(WorkflowStatusRow {
        workflow_id: row.get("workflow_uuid"),
        status: WorkflowStatus::parse(&status)?,
        name: row.get("name"),
        authenticated_user: row.get("authenticated_user"),
        assumed_role: row.get("assumed_role"),
        authenticated_roles: row.get("authenticated_roles"),
        request: row.get("request"),
        inputs: row.get("inputs"),
        output: row.get("output"),
        error: row.get("error"),
        executor_id: row.get("executor_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        application_version: row.get("application_version"),
        queue_name: row.get("queue_name"),
        queued_at: row.get("queued_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

/// Replay a recorded message-shaped outcome: JSON `null` is a timeout
pub(crate) fn decode_message_outcome(
    workflow_id: &str,
    outcome: RecordedOutcome,
) -> Result<Option<String>, SysDbError> {
    if let Some(error) = outcome.error {
        return Err(envelope_to_error(workflow_id, &error));
    }
    match outcome.output.as_deref() {
        Some(NULL_MARKER) | None => Ok(None),
        Some(message) => Ok(Some(message.to_string())),
    }
}

/// Replay a recorded unit-shaped outcome (send, set_event)
pub(crate) fn replay_unit_outcome(
    workflow_id: &str,
    outcome: RecordedOutcome,
) -> Result<(), SysDbError> {
    match outcome.error {
        Some(error) => Err(envelope_to_error(workflow_id, &error)),
        None => Ok(()),
    }
}

fn envelope_to_error(workflow_id: &str, raw: &str) -> SysDbError {
    let envelope = ErrorEnvelope::from_json(raw);
    match envelope.name.as_str() {
        "DestinationNotFound" => SysDbError::DestinationNotFound(envelope.message),
        "EventAlreadySet" => SysDbError::EventAlreadySet {
            workflow_id: workflow_id.to_string(),
            key: envelope.message,
        },
        _ => SysDbError::Database(envelope.to_string()),
    }
}

#[cfg(test)]
mod tests {
    // Protocol-level coverage lives in the in-memory store's tests and the
    // env-gated integration suite (tests/postgres_integration_test.rs).
}
