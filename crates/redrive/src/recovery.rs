//! Recovery coordinator
//!
//! At launch (and on demand) the executor re-enumerates PENDING workflows
//! owned by itself from a previous run, or by executors whose heartbeat has
//! expired, and re-invokes them. The operation log guarantees completed
//! steps are not re-executed; workflows whose function is no longer
//! registered are failed durably.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{envelope_names, ErrorEnvelope, RedriveError};
use crate::executor::ExecutorInner;
use crate::sysdb::WorkflowStatus;

/// Re-invoke every recoverable PENDING workflow
pub(crate) async fn recover_pending(inner: &Arc<ExecutorInner>) -> Result<(), RedriveError> {
    let ttl = Duration::from_millis(inner.config.runtime.heartbeat_ttl_ms);
    let pending = inner
        .sysdb()
        .pending_workflows(&inner.executor_id, ttl)
        .await?;

    if pending.is_empty() {
        return Ok(());
    }
    info!(count = pending.len(), "recovering pending workflows");

    for workflow_id in pending {
        let Some(row) = inner.sysdb().get_workflow_status(&workflow_id).await? else {
            continue;
        };

        if !inner.registry.contains_workflow(&row.name) {
            warn!(%workflow_id, function = %row.name, "workflow function not registered; marking failed");
            let envelope = ErrorEnvelope::new(
                envelope_names::FUNCTION_UNREGISTERED,
                format!("workflow function \"{}\" is not registered", row.name),
            )
            .to_json();
            inner
                .sysdb()
                .update_workflow_status(&workflow_id, WorkflowStatus::Error, None, Some(envelope))
                .await?;
            continue;
        }

        inner
            .sysdb()
            .claim_workflow(&workflow_id, &inner.executor_id)
            .await?;

        match inner.resume_from_row(&row) {
            Ok(true) => debug!(%workflow_id, "workflow resumed"),
            Ok(false) => debug!(%workflow_id, "workflow already running here"),
            Err(e) => error!(%workflow_id, "failed to resume workflow: {e}"),
        }
    }

    Ok(())
}

/// Periodically refresh this executor's heartbeat so peers do not recover
/// our live workflows
pub(crate) fn spawn_heartbeat_loop(inner: Arc<ExecutorInner>) -> JoinHandle<()> {
    let mut shutdown_rx = inner.shutdown_signal();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(inner.config.runtime.heartbeat_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = inner.sysdb().touch_executor(&inner.executor_id).await {
                        error!("executor heartbeat failed: {e}");
                    }
                }
                _ = shutdown_rx.changed() => {
                    debug!("heartbeat loop: shutdown requested");
                    break;
                }
            }
        }

        debug!("heartbeat loop exited");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::{Config, DatabaseConfig, RuntimeConfig};
    use crate::executor::Executor;
    use crate::registry::RegistryBuilder;
    use crate::sysdb::{
        InMemorySystemDatabase, SystemDatabase, WorkflowStatus, WorkflowStatusRow,
    };

    /// Route tracing output through the test harness; RUST_LOG filters it
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_test_writer()
            .try_init();
    }

    fn test_config() -> Config {
        let mut config = Config::for_database(DatabaseConfig {
            hostname: "localhost".to_string(),
            port: 5432,
            username: "postgres".to_string(),
            password: String::new(),
            app_db_name: "redrive_test".to_string(),
            sys_db_name: None,
            migrate: vec![],
            rollback: vec![],
        });
        config.runtime = RuntimeConfig {
            flush_interval_ms: 10,
            ..RuntimeConfig::default()
        };
        config
    }

    async fn await_status(
        sysdb: &Arc<InMemorySystemDatabase>,
        workflow_id: &str,
        expected: WorkflowStatus,
    ) {
        for _ in 0..100 {
            let status = sysdb
                .get_workflow_status(workflow_id)
                .await
                .unwrap()
                .map(|row| row.status);
            if status == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("workflow {workflow_id} never reached {expected:?}");
    }

    #[tokio::test]
    async fn test_launch_recovers_abandoned_workflow() {
        init_tracing();
        let sysdb = Arc::new(InMemorySystemDatabase::new());

        // A previous process registered this workflow and died mid-run
        let mut row = WorkflowStatusRow::pending("orphan-1", "compute", "7", "exec-dead");
        row.executor_id = Some("exec-dead".to_string());
        sysdb.init_workflow_status(&row).await.unwrap();

        let mut builder = RegistryBuilder::new();
        builder.register_workflow("compute", |_ctx, n: i64| async move { Ok(n * 3) });

        let executor = Executor::launch_with(test_config(), builder.build(), sysdb.clone(), None)
            .await
            .unwrap();

        await_status(&sysdb, "orphan-1", WorkflowStatus::Success).await;
        let row = sysdb.get_workflow_status("orphan-1").await.unwrap().unwrap();
        assert_eq!(row.output.as_deref(), Some("21"));

        executor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unregistered_function_is_failed() {
        init_tracing();
        let sysdb = Arc::new(InMemorySystemDatabase::new());

        let mut row = WorkflowStatusRow::pending("orphan-2", "forgotten_fn", "null", "exec-dead");
        row.executor_id = Some("exec-dead".to_string());
        sysdb.init_workflow_status(&row).await.unwrap();

        let executor = Executor::launch_with(
            test_config(),
            RegistryBuilder::new().build(),
            sysdb.clone(),
            None,
        )
        .await
        .unwrap();

        let row = sysdb.get_workflow_status("orphan-2").await.unwrap().unwrap();
        assert_eq!(row.status, WorkflowStatus::Error);
        let envelope = crate::error::ErrorEnvelope::from_json(row.error.as_deref().unwrap());
        assert_eq!(
            envelope.name,
            crate::error::envelope_names::FUNCTION_UNREGISTERED
        );

        executor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_recovery_resumes_mid_workflow() {
        init_tracing();
        let sysdb = Arc::new(InMemorySystemDatabase::new());

        // The first step already committed in the dead process's run
        let mut row = WorkflowStatusRow::pending("orphan-3", "two_steps", "null", "exec-dead");
        row.executor_id = Some("exec-dead".to_string());
        sysdb.init_workflow_status(&row).await.unwrap();
        sysdb
            .record_operation_output("orphan-3", 0, "10")
            .await
            .unwrap();

        let step_calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let calls = step_calls.clone();

        let mut builder = RegistryBuilder::new();
        let step = builder.register_step(
            "load",
            crate::registry::StepConfig::default(),
            move |n: i64| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(n + 1)
                }
            },
        );
        builder.register_workflow("two_steps", move |mut ctx, _: serde_json::Value| {
            let step = step.clone();
            async move {
                let first: i64 = ctx.step(&step, 1).await?;
                let second: i64 = ctx.step(&step, 2).await?;
                Ok(first + second)
            }
        });

        let executor = Executor::launch_with(test_config(), builder.build(), sysdb.clone(), None)
            .await
            .unwrap();

        await_status(&sysdb, "orphan-3", WorkflowStatus::Success).await;

        // Step 0 replayed its recorded value (10); only step 1 executed
        let row = sysdb.get_workflow_status("orphan-3").await.unwrap().unwrap();
        assert_eq!(row.output.as_deref(), Some("13"));
        assert_eq!(step_calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        executor.shutdown().await.unwrap();
    }
}
