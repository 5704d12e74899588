//! Application database adapter
//!
//! A uniform "run this callback inside a transaction" capability over the
//! application's own PostgreSQL database, with:
//! - Requested isolation level and read-only mode
//! - Automatic bounded retry of serialization failures (SQLSTATE 40001)
//! - Classification of key-conflict errors (SQLSTATE 23505)
//!
//! The guard-row SQL for transactional steps also lives here, because those
//! statements must run on the same connection as the user's writes.

use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, warn};

use crate::error::RedriveError;
use crate::sysdb::RecordedOutcome;

const TXN_OUTPUTS_DDL: &str = r#"
CREATE SCHEMA IF NOT EXISTS dbos;

CREATE TABLE IF NOT EXISTS dbos.transaction_outputs (
    workflow_uuid TEXT NOT NULL,
    function_id INT NOT NULL,
    output TEXT,
    error TEXT,
    txn_id TEXT,
    txn_snapshot TEXT NOT NULL,
    created_at BIGINT NOT NULL,
    PRIMARY KEY (workflow_uuid, function_id)
);
"#;

/// Errors from the application database adapter
#[derive(Debug, thiserror::Error)]
pub enum AppDbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// The guard-row insert collided with a concurrent duplicate; the caller
    /// must re-run the guarded check and take the replay branch
    #[error("operation guard row already exists")]
    GuardConflict,

    /// No application database was configured for this executor
    #[error("no application database configured; transactions are unavailable")]
    NotConfigured,
}

/// Transaction isolation levels accepted by [`AppDatabase::transaction`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    #[default]
    Serializable,
}

impl IsolationLevel {
    fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

/// A read-only transactional output buffered in memory until the next
/// non-read-only write (or the background flush) persists it
#[derive(Debug, Clone)]
pub struct BufferedTxnOutput {
    pub workflow_id: String,
    pub function_id: i32,
    pub output: String,
    pub txn_snapshot: String,
    pub created_at: i64,
}

/// True for SQLSTATE 40001 (serialization failure) and 40P01 (deadlock)
pub fn is_serialization_failure(err: &sqlx::Error) -> bool {
    matches!(
        err.as_database_error().and_then(|db| db.code()).as_deref(),
        Some("40001") | Some("40P01")
    )
}

/// True for SQLSTATE 23505 (unique violation)
pub fn is_key_conflict(err: &sqlx::Error) -> bool {
    err.as_database_error().and_then(|db| db.code()).as_deref() == Some("23505")
}

fn is_retriable(err: &RedriveError) -> bool {
    match err {
        RedriveError::AppDatabase(AppDbError::Sqlx(e)) => is_serialization_failure(e),
        RedriveError::AppDatabase(AppDbError::GuardConflict) => true,
        _ => false,
    }
}

/// Application database adapter
///
/// No business logic lives here; the operation log composes its guard
/// protocol out of this adapter's transaction runner and the helpers below.
#[derive(Clone)]
pub struct AppDatabase {
    pool: PgPool,
    max_retries: u32,
}

impl AppDatabase {
    /// Connect with the given maximum serialization-failure retries
    pub async fn connect(url: &str, max_retries: u32) -> Result<Self, AppDbError> {
        let pool = PgPoolOptions::new().max_connections(20).connect(url).await?;
        Ok(Self::with_pool(pool, max_retries))
    }

    /// Wrap an existing pool
    pub fn with_pool(pool: PgPool, max_retries: u32) -> Self {
        Self { pool, max_retries }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create `dbos.transaction_outputs` if it does not exist. Idempotent.
    pub async fn bootstrap(&self) -> Result<(), AppDbError> {
        sqlx::raw_sql(TXN_OUTPUTS_DDL).execute(&self.pool).await?;
        debug!("transaction outputs table ready");
        Ok(())
    }

    /// Run `f` inside a transaction at the requested isolation level.
    ///
    /// Serialization failures (and guard-row collisions) restart the whole
    /// callback with exponential backoff, at most `max_retries` times; the
    /// callback must therefore be safe to re-run, which the guarded check
    /// guarantees for step bodies. Any other error rolls back and surfaces.
    pub async fn transaction<T, F>(
        &self,
        isolation: IsolationLevel,
        read_only: bool,
        f: F,
    ) -> Result<T, RedriveError>
    where
        T: Send,
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<T, RedriveError>> + Send + Sync,
    {
        let mut attempt: u32 = 0;
        loop {
            let result = self.try_once(isolation, read_only, &f).await;
            match result {
                Ok(value) => return Ok(value),
                Err(err) if is_retriable(&err) && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = retry_delay(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transaction conflict, retrying: {err}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_once<T, F>(
        &self,
        isolation: IsolationLevel,
        read_only: bool,
        f: &F,
    ) -> Result<T, RedriveError>
    where
        T: Send,
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<T, RedriveError>> + Send + Sync,
    {
        let mut tx = self.pool.begin().await.map_err(AppDbError::Sqlx)?;

        sqlx::query(&format!(
            "SET TRANSACTION ISOLATION LEVEL {}",
            isolation.as_sql()
        ))
        .execute(&mut *tx)
        .await
        .map_err(AppDbError::Sqlx)?;

        if read_only {
            sqlx::query("SET TRANSACTION READ ONLY")
                .execute(&mut *tx)
                .await
                .map_err(AppDbError::Sqlx)?;
        }

        match f(&mut *tx).await {
            Ok(value) => {
                tx.commit().await.map_err(AppDbError::Sqlx)?;
                Ok(value)
            }
            Err(err) => {
                // Dropping the transaction rolls it back
                drop(tx);
                Err(err)
            }
        }
    }
}

fn retry_delay(attempt: u32) -> Duration {
    let base = 10.0 * 2f64.powi(attempt.saturating_sub(1) as i32);
    let capped = base.min(1_000.0);
    let jitter = rand::thread_rng().gen_range(-0.1..0.1) * capped;
    Duration::from_millis((capped + jitter).max(1.0) as u64)
}

// =============================================================================
// Guard protocol SQL (runs on the user transaction's connection)
// =============================================================================

/// Result of the guarded check at transactional step entry
#[derive(Debug)]
pub(crate) struct GuardedCheck {
    /// `pg_current_snapshot()` captured at step entry
    pub snapshot: String,
    /// Recorded outcome, if this (workflow, step) already ran
    pub recorded: Option<RecordedOutcome>,
}

/// One round trip returning both the snapshot token and any recorded row
pub(crate) async fn guarded_check(
    conn: &mut PgConnection,
    workflow_id: &str,
    function_id: i32,
) -> Result<GuardedCheck, AppDbError> {
    let rows = sqlx::query(
        r#"
        (SELECT output, error, pg_current_snapshot()::text AS snapshot, TRUE AS recorded
           FROM dbos.transaction_outputs
          WHERE workflow_uuid = $1 AND function_id = $2)
        UNION ALL
        (SELECT NULL, NULL, pg_current_snapshot()::text, FALSE)
        ORDER BY recorded
        "#,
    )
    .bind(workflow_id)
    .bind(function_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut check = GuardedCheck {
        snapshot: String::new(),
        recorded: None,
    };
    for row in rows {
        check.snapshot = row.get("snapshot");
        if row.get::<bool, _>("recorded") {
            check.recorded = Some(RecordedOutcome {
                output: row.get("output"),
                error: row.get("error"),
            });
        }
    }
    Ok(check)
}

/// Write the guard row anchoring this step's idempotency.
///
/// A concurrent retry of the same (workflow, step) collides on the primary
/// key and is reported as [`AppDbError::GuardConflict`], forcing it to the
/// replay branch on its next attempt.
pub(crate) async fn insert_guard(
    conn: &mut PgConnection,
    workflow_id: &str,
    function_id: i32,
    snapshot: &str,
    created_at: i64,
) -> Result<(), AppDbError> {
    sqlx::query(
        r#"
        INSERT INTO dbos.transaction_outputs
            (workflow_uuid, function_id, output, error, txn_id, txn_snapshot, created_at)
        VALUES ($1, $2, NULL, NULL, NULL, $3, $4)
        "#,
    )
    .bind(workflow_id)
    .bind(function_id)
    .bind(snapshot)
    .bind(created_at)
    .execute(conn)
    .await
    .map_err(|e| {
        if is_key_conflict(&e) {
            AppDbError::GuardConflict
        } else {
            AppDbError::Sqlx(e)
        }
    })?;
    Ok(())
}

/// Fill the guard row with the step's real output and the transaction id
pub(crate) async fn finalize_guard(
    conn: &mut PgConnection,
    workflow_id: &str,
    function_id: i32,
    output: &str,
) -> Result<(), AppDbError> {
    sqlx::query(
        r#"
        UPDATE dbos.transaction_outputs
        SET output = $3, txn_id = pg_current_xact_id_if_assigned()::text
        WHERE workflow_uuid = $1 AND function_id = $2
        "#,
    )
    .bind(workflow_id)
    .bind(function_id)
    .bind(output)
    .execute(conn)
    .await?;
    Ok(())
}

/// Persist buffered read-only outputs; runs either inside a later step's
/// transaction or in the background flush loop's own transaction
pub(crate) async fn flush_buffered_outputs(
    conn: &mut PgConnection,
    rows: &[BufferedTxnOutput],
) -> Result<(), AppDbError> {
    for row in rows {
        sqlx::query(
            r#"
            INSERT INTO dbos.transaction_outputs
                (workflow_uuid, function_id, output, error, txn_id, txn_snapshot, created_at)
            VALUES ($1, $2, $3, NULL, NULL, $4, $5)
            ON CONFLICT (workflow_uuid, function_id) DO NOTHING
            "#,
        )
        .bind(&row.workflow_id)
        .bind(row.function_id)
        .bind(&row.output)
        .bind(&row.txn_snapshot)
        .bind(row.created_at)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Record a transactional step's error after its transaction rolled back.
///
/// Runs in its own transaction: the failed transaction could not have
/// recorded anything, and the error must survive for deterministic replay.
pub(crate) async fn record_txn_error(
    pool: &PgPool,
    workflow_id: &str,
    function_id: i32,
    snapshot: &str,
    error: &str,
    created_at: i64,
) -> Result<(), AppDbError> {
    sqlx::query(
        r#"
        INSERT INTO dbos.transaction_outputs AS t
            (workflow_uuid, function_id, output, error, txn_id, txn_snapshot, created_at)
        VALUES ($1, $2, NULL, $3, NULL, $4, $5)
        ON CONFLICT (workflow_uuid, function_id)
        DO UPDATE SET error = EXCLUDED.error
        WHERE t.output IS NULL AND t.error IS NULL
        "#,
    )
    .bind(workflow_id)
    .bind(function_id)
    .bind(error)
    .bind(snapshot)
    .bind(created_at)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_sql() {
        assert_eq!(IsolationLevel::Serializable.as_sql(), "SERIALIZABLE");
        assert_eq!(IsolationLevel::ReadCommitted.as_sql(), "READ COMMITTED");
        assert_eq!(IsolationLevel::default(), IsolationLevel::Serializable);
    }

    #[test]
    fn test_isolation_serde_names() {
        let json = serde_json::to_string(&IsolationLevel::RepeatableRead).unwrap();
        assert_eq!(json, "\"REPEATABLE_READ\"");
    }

    #[test]
    fn test_retry_delay_bounds() {
        for attempt in 1..12 {
            let delay = retry_delay(attempt);
            assert!(delay >= Duration::from_millis(1));
            assert!(delay <= Duration::from_millis(1_200));
        }
    }

    #[test]
    fn test_guard_conflict_is_retriable() {
        let err = RedriveError::AppDatabase(AppDbError::GuardConflict);
        assert!(is_retriable(&err));

        let err = RedriveError::application("user bug");
        assert!(!is_retriable(&err));
    }
}
