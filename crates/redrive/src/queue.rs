//! Workflow queue pump
//!
//! Named lanes admit queued workflow starts under a concurrency limit. The
//! pump claims ready entries (FOR UPDATE SKIP LOCKED under an advisory lock
//! in the PostgreSQL gateway) and hands them to the executor; a workflow's
//! terminal status sets `completed_at`, freeing its slot for the next entry.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::executor::ExecutorInner;

pub(crate) fn spawn_queue_pump(inner: Arc<ExecutorInner>) -> JoinHandle<()> {
    let mut shutdown_rx = inner.shutdown_signal();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(inner.config.runtime.queue_poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => pump_once(&inner).await,
                _ = shutdown_rx.changed() => {
                    debug!("queue pump: shutdown requested");
                    break;
                }
            }
        }

        debug!("queue pump exited");
    })
}

async fn pump_once(inner: &Arc<ExecutorInner>) {
    for (queue_name, limit) in inner.registry.queues() {
        let admitted = match inner
            .sysdb()
            .start_queued_workflows(queue_name, limit, &inner.executor_id)
            .await
        {
            Ok(admitted) => admitted,
            Err(e) => {
                error!(%queue_name, "queue admission failed: {e}");
                continue;
            }
        };

        for workflow_id in admitted {
            match inner.sysdb().get_workflow_status(&workflow_id).await {
                Ok(Some(row)) => {
                    debug!(%workflow_id, %queue_name, "starting queued workflow");
                    if let Err(e) = inner.resume_from_row(&row) {
                        error!(%workflow_id, "failed to start queued workflow: {e}");
                    }
                }
                Ok(None) => warn!(%workflow_id, "queued workflow has no status row"),
                Err(e) => error!(%workflow_id, "failed to load queued workflow: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::{Config, DatabaseConfig, RuntimeConfig};
    use crate::executor::{Executor, StartOptions};
    use crate::registry::RegistryBuilder;
    use crate::sysdb::InMemorySystemDatabase;

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
            queue_poll_interval_ms: 10,
            ..RuntimeConfig::default()
        };
        config
    }

    #[tokio::test]
    async fn test_queue_respects_concurrency_limit() {
        init_tracing();
        let running = Arc::new(AtomicI32::new(0));
        let peak = Arc::new(AtomicI32::new(0));

        let mut builder = RegistryBuilder::new();
        builder.register_queue("lane", 1);
        let wf = {
            let running = running.clone();
            let peak = peak.clone();
            builder.register_workflow("queued_task", move |_ctx, n: i64| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(n)
                }
            })
        };

        let executor = Executor::launch_with(
            test_config(),
            builder.build(),
            Arc::new(InMemorySystemDatabase::new()),
            None,
        )
        .await
        .unwrap();

        let mut handles = Vec::new();
        for i in 0..3i64 {
            let handle = executor
                .start_workflow(
                    &wf,
                    StartOptions::default()
                        .with_workflow_id(&format!("q-{i}"))
                        .with_queue("lane"),
                    i,
                )
                .await
                .unwrap();
            handles.push(handle);
        }

        for handle in handles {
            handle.result().await.unwrap();
        }

        // Never more than one in flight
        assert_eq!(peak.load(Ordering::SeqCst), 1);

        executor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unregistered_queue_is_rejected() {
        init_tracing();
        let mut builder = RegistryBuilder::new();
        let wf = builder.register_workflow("task", |_ctx, n: i64| async move { Ok(n) });

        let executor = Executor::launch_with(
            test_config(),
            builder.build(),
            Arc::new(InMemorySystemDatabase::new()),
            None,
        )
        .await
        .unwrap();

        let result = executor
            .start_workflow(&wf, StartOptions::default().with_queue("nope"), 1)
            .await;
        assert!(matches!(
            result,
            Err(crate::error::RedriveError::NotRegistered { kind: "queue", .. })
        ));

        executor.shutdown().await.unwrap();
    }
}
