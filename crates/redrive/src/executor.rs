//! Workflow executor
//!
//! The executor owns the long-lived runtime state: the registry, the
//! operation log, the background loops, and the set of in-flight workflow
//! tasks. Its lifecycle is `launch() -> ... -> shutdown()`.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::appdb::AppDatabase;
use crate::config::Config;
use crate::context::WorkflowContext;
use crate::error::{ErrorEnvelope, RedriveError};
use crate::oplog::OperationLog;
use crate::registry::{Registry, WorkflowRef};
use crate::sysdb::{
    PostgresSystemDatabase, StatusUpdate, SysDbError, SystemDatabase, WorkflowFilter,
    WorkflowOutcome, WorkflowStatus, WorkflowStatusRow,
};
use crate::{flush, queue, recovery, scheduler};

/// Options for starting a workflow
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Caller-supplied idempotency key; generated (UUID v4) when absent
    pub workflow_id: Option<String>,

    /// Admission lane; the queue pump starts the workflow when a slot frees
    pub queue: Option<String>,

    pub authenticated_user: Option<String>,
    pub assumed_role: Option<String>,
    pub authenticated_roles: Option<String>,

    /// Serialized request metadata, stored with the workflow row
    pub request: Option<String>,
}

impl StartOptions {
    pub fn with_workflow_id(mut self, workflow_id: &str) -> Self {
        self.workflow_id = Some(workflow_id.to_string());
        self
    }

    pub fn with_queue(mut self, queue: &str) -> Self {
        self.queue = Some(queue.to_string());
        self
    }
}

/// Handle to a started workflow
///
/// An invoked handle awaits the local task directly; a detached handle
/// (attach-by-id, queued, or resumed) polls the durable status row.
pub struct WorkflowHandle<O = Value> {
    workflow_id: String,
    inner: Arc<ExecutorInner>,
    join: Option<JoinHandle<Result<Value, RedriveError>>>,
    _marker: PhantomData<fn() -> O>,
}

impl<O: DeserializeOwned> WorkflowHandle<O> {
    fn invoked(
        workflow_id: String,
        inner: Arc<ExecutorInner>,
        join: JoinHandle<Result<Value, RedriveError>>,
    ) -> Self {
        Self {
            workflow_id,
            inner,
            join: Some(join),
            _marker: PhantomData,
        }
    }

    fn detached(workflow_id: String, inner: Arc<ExecutorInner>) -> Self {
        Self {
            workflow_id,
            inner,
            join: None,
            _marker: PhantomData,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub async fn status(&self) -> Result<Option<WorkflowStatus>, RedriveError> {
        Ok(self
            .inner
            .sysdb()
            .get_workflow_status(&self.workflow_id)
            .await?
            .map(|row| row.status))
    }

    /// Await the workflow's terminal outcome.
    ///
    /// Success yields the recorded output; failure rehydrates the recorded
    /// error envelope with its original message.
    pub async fn result(mut self) -> Result<O, RedriveError> {
        let value: Value = match self.join.take() {
            Some(join) => join
                .await
                .map_err(|e| RedriveError::application(format!("workflow task failed: {e}")))??,
            None => {
                match self
                    .inner
                    .sysdb()
                    .await_workflow_outcome(&self.workflow_id, Duration::from_millis(250))
                    .await?
                {
                    WorkflowOutcome::Success(raw) => serde_json::from_str(&raw)?,
                    WorkflowOutcome::Error(raw) => {
                        return Err(RedriveError::Application(ErrorEnvelope::from_json(&raw)))
                    }
                    WorkflowOutcome::Cancelled => {
                        return Err(RedriveError::Cancelled(self.workflow_id.clone()))
                    }
                }
            }
        };
        Ok(serde_json::from_value(value)?)
    }

    pub(crate) fn into_typed<T>(self) -> WorkflowHandle<T> {
        WorkflowHandle {
            workflow_id: self.workflow_id,
            inner: self.inner,
            join: self.join,
            _marker: PhantomData,
        }
    }
}

/// Shared executor state, reachable from workflow contexts
pub(crate) struct ExecutorInner {
    pub executor_id: String,
    pub config: Config,
    pub registry: Registry,
    pub oplog: OperationLog,
    pub shutdown_tx: watch::Sender<bool>,
    /// Cancellation tokens of workflows running in this process
    pub active: Mutex<HashMap<String, CancellationToken>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutorInner {
    pub(crate) fn sysdb(&self) -> &Arc<dyn SystemDatabase> {
        &self.oplog.sysdb
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Register the workflow row and either run it, enqueue it, or attach
    /// to an existing run with the same id
    pub(crate) async fn start_workflow_erased(
        self: &Arc<Self>,
        name: &str,
        options: StartOptions,
        args: Value,
    ) -> Result<WorkflowHandle<Value>, RedriveError> {
        self.registry.workflow(name)?;
        if let Some(queue_name) = &options.queue {
            self.registry.queue_limit(queue_name)?;
        }

        let workflow_id = options
            .workflow_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let inputs = serde_json::to_string(&args)?;

        let mut row = WorkflowStatusRow::pending(&workflow_id, name, &inputs, &self.executor_id);
        row.authenticated_user = options.authenticated_user.clone();
        row.assumed_role = options.assumed_role.clone();
        row.authenticated_roles = options.authenticated_roles.clone();
        row.request = options.request.clone();
        row.application_version = self.config.application_version.clone();
        if let Some(queue_name) = &options.queue {
            row = row.with_queue(queue_name);
        }

        let created = self
            .sysdb()
            .init_workflow_status(&row)
            .await
            .map_err(|e| match e {
                SysDbError::WorkflowConflict(id) => RedriveError::WorkflowConflict {
                    workflow_id: id,
                    details: "id already used by a different function or arguments".to_string(),
                },
                other => other.into(),
            })?;

        if let Some(queue_name) = &options.queue {
            self.sysdb().enqueue(&workflow_id, queue_name).await?;
            debug!(%workflow_id, %queue_name, "workflow enqueued");
            return Ok(WorkflowHandle::detached(workflow_id, self.clone()));
        }

        if !created {
            // Same id, same call: attach to the winner's run
            debug!(%workflow_id, "attached to existing workflow");
            return Ok(WorkflowHandle::detached(workflow_id, self.clone()));
        }

        match self.spawn_execution(workflow_id.clone(), name.to_string(), args) {
            Some(join) => Ok(WorkflowHandle::invoked(workflow_id, self.clone(), join)),
            None => Ok(WorkflowHandle::detached(workflow_id, self.clone())),
        }
    }

    /// Spawn the execution task unless this workflow is already live here
    pub(crate) fn spawn_execution(
        self: &Arc<Self>,
        workflow_id: String,
        name: String,
        args: Value,
    ) -> Option<JoinHandle<Result<Value, RedriveError>>> {
        let cancel = CancellationToken::new();
        {
            let mut active = self.active.lock();
            if active.contains_key(&workflow_id) {
                return None;
            }
            active.insert(workflow_id.clone(), cancel.clone());
        }

        let inner = self.clone();
        Some(tokio::spawn(async move {
            execute_workflow(inner, workflow_id, name, args, cancel).await
        }))
    }

    /// Re-invoke a PENDING workflow from its persisted row (recovery, queue,
    /// resume). Returns false if it is already running in this process.
    pub(crate) fn resume_from_row(
        self: &Arc<Self>,
        row: &WorkflowStatusRow,
    ) -> Result<bool, RedriveError> {
        let args: Value = serde_json::from_str(&row.inputs)?;
        Ok(self
            .spawn_execution(row.workflow_id.clone(), row.name.clone(), args)
            .is_some())
    }
}

/// Drive one workflow function to a terminal outcome
#[instrument(skip(inner, args, cancel), fields(workflow = %name))]
async fn execute_workflow(
    inner: Arc<ExecutorInner>,
    workflow_id: String,
    name: String,
    args: Value,
    cancel: CancellationToken,
) -> Result<Value, RedriveError> {
    debug!(%workflow_id, "executing workflow");

    let result = match inner.registry.workflow(&name) {
        Ok(func) => {
            let ctx = WorkflowContext::new(inner.clone(), workflow_id.clone(), cancel, false);
            func(ctx, args).await
        }
        Err(err) => Err(err),
    };

    match &result {
        Ok(value) => {
            let output =
                serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
            inner.oplog.buffers.buffer_status(StatusUpdate {
                workflow_id: workflow_id.clone(),
                status: WorkflowStatus::Success,
                output: Some(output),
                error: None,
            });
            debug!(%workflow_id, "workflow succeeded");
        }
        Err(err) if err.is_cancelled() => {
            // Written through, not buffered: cancellation must be visible to
            // other processes immediately
            if let Err(e) = inner
                .sysdb()
                .update_workflow_status(
                    &workflow_id,
                    WorkflowStatus::Cancelled,
                    None,
                    Some(err.to_envelope().to_json()),
                )
                .await
            {
                error!(%workflow_id, "failed to record cancellation: {e}");
            }
            info!(%workflow_id, "workflow cancelled");
        }
        Err(err) => {
            let status = if matches!(err, RedriveError::RetriesExceeded { .. }) {
                WorkflowStatus::RetriesExceeded
            } else {
                WorkflowStatus::Error
            };
            inner.oplog.buffers.buffer_status(StatusUpdate {
                workflow_id: workflow_id.clone(),
                status,
                output: None,
                error: Some(err.to_envelope().to_json()),
            });
            warn!(%workflow_id, "workflow failed: {err}");
        }
    }

    inner.active.lock().remove(&workflow_id);

    // Frees a slot in the workflow's lane, if it came through one
    if let Err(e) = inner.sysdb().mark_queue_completed(&workflow_id).await {
        warn!(%workflow_id, "failed to mark queue entry completed: {e}");
    }

    result
}

/// The durable-execution runtime
///
/// # Example
///
/// ```ignore
/// let mut builder = RegistryBuilder::new();
/// let checkout = builder.register_workflow("checkout", checkout_workflow);
/// let executor = Executor::launch(config, builder.build()).await?;
///
/// let handle = executor
///     .start_workflow(&checkout, StartOptions::default(), order)
///     .await?;
/// let receipt = handle.result().await?;
/// ```
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

impl Executor {
    /// Connect to both databases from configuration and launch
    pub async fn launch(config: Config, registry: Registry) -> Result<Self, RedriveError> {
        let sysdb = PostgresSystemDatabase::connect(&config.database.system_db_url()).await?;
        let appdb = AppDatabase::connect(
            &config.database.app_db_url(),
            config.runtime.max_txn_retries,
        )
        .await
        .map_err(RedriveError::AppDatabase)?;
        Self::launch_with(config, registry, Arc::new(sysdb), Some(appdb)).await
    }

    /// Launch over explicit database handles (embedders and tests)
    pub async fn launch_with(
        config: Config,
        registry: Registry,
        sysdb: Arc<dyn SystemDatabase>,
        appdb: Option<AppDatabase>,
    ) -> Result<Self, RedriveError> {
        sysdb.bootstrap().await?;
        if let Some(appdb) = &appdb {
            appdb.bootstrap().await.map_err(RedriveError::AppDatabase)?;
        }

        let executor_id = format!("exec-{}", Uuid::new_v4());
        let (shutdown_tx, _) = watch::channel(false);
        let inner = Arc::new(ExecutorInner {
            executor_id: executor_id.clone(),
            config,
            registry: registry.clone(),
            oplog: OperationLog::new(sysdb, appdb, registry),
            shutdown_tx,
            active: Mutex::new(HashMap::new()),
            background: Mutex::new(Vec::new()),
        });

        inner.sysdb().touch_executor(&executor_id).await?;

        let mut tasks = vec![
            flush::spawn_flush_loop(inner.clone()),
            queue::spawn_queue_pump(inner.clone()),
            recovery::spawn_heartbeat_loop(inner.clone()),
        ];
        tasks.extend(scheduler::spawn_schedulers(inner.clone()));
        inner.background.lock().extend(tasks);

        recovery::recover_pending(&inner).await?;

        info!(%executor_id, "executor launched");
        Ok(Self { inner })
    }

    pub fn executor_id(&self) -> &str {
        &self.inner.executor_id
    }

    /// Start a workflow; a repeated start with the same id attaches to the
    /// original run and yields its recorded result
    pub async fn start_workflow<I, O>(
        &self,
        workflow: &WorkflowRef<I, O>,
        options: StartOptions,
        input: I,
    ) -> Result<WorkflowHandle<O>, RedriveError>
    where
        I: Serialize,
        O: DeserializeOwned + Send + 'static,
    {
        let args = serde_json::to_value(input)?;
        let handle = self
            .inner
            .start_workflow_erased(workflow.name(), options, args)
            .await?;
        Ok(handle.into_typed())
    }

    /// Replay a workflow against its recorded history.
    ///
    /// Every step must find a recorded outcome; user step bodies are never
    /// invoked, and nothing is written.
    pub async fn debug_workflow<I, O>(
        &self,
        workflow: &WorkflowRef<I, O>,
        workflow_id: &str,
        input: I,
    ) -> Result<O, RedriveError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let func = self.inner.registry.workflow(workflow.name())?;
        let args = serde_json::to_value(input)?;
        let ctx = WorkflowContext::new(
            self.inner.clone(),
            workflow_id.to_string(),
            CancellationToken::new(),
            true,
        );
        let value = func(ctx, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Request cancellation of a workflow
    pub async fn cancel_workflow(&self, workflow_id: &str) -> Result<(), RedriveError> {
        let token = self.inner.active.lock().get(workflow_id).cloned();
        match token {
            // The running task observes the token at its next suspension
            // point and records CANCELLED itself
            Some(token) => token.cancel(),
            None => {
                let envelope = RedriveError::Cancelled(workflow_id.to_string())
                    .to_envelope()
                    .to_json();
                self.inner
                    .sysdb()
                    .update_workflow_status(
                        workflow_id,
                        WorkflowStatus::Cancelled,
                        None,
                        Some(envelope),
                    )
                    .await?;
            }
        }
        info!(%workflow_id, "cancellation requested");
        Ok(())
    }

    /// Re-invoke a PENDING workflow in this process
    pub async fn resume_workflow(&self, workflow_id: &str) -> Result<WorkflowHandle, RedriveError> {
        let row = self
            .inner
            .sysdb()
            .get_workflow_status(workflow_id)
            .await?
            .ok_or_else(|| {
                RedriveError::SystemDatabase(SysDbError::WorkflowNotFound(workflow_id.to_string()))
            })?;

        if row.status == WorkflowStatus::Pending {
            self.inner
                .sysdb()
                .claim_workflow(workflow_id, &self.inner.executor_id)
                .await?;
            self.inner.resume_from_row(&row)?;
        }
        Ok(WorkflowHandle::detached(
            workflow_id.to_string(),
            self.inner.clone(),
        ))
    }

    /// Read a workflow's keyed event from outside any workflow
    pub async fn get_event<T: DeserializeOwned>(
        &self,
        workflow_id: &str,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<T>, RedriveError> {
        let value = self
            .inner
            .sysdb()
            .get_event(workflow_id, key, timeout, None)
            .await?;
        value
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(Into::into)
    }

    pub async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowStatusRow>, RedriveError> {
        Ok(self.inner.sysdb().list_workflows(filter).await?)
    }

    /// Stop background loops and flush buffered state
    pub async fn shutdown(self) -> Result<(), RedriveError> {
        info!(executor_id = %self.inner.executor_id, "shutting down");
        let _ = self.inner.shutdown_tx.send(true);

        if let Err(e) = self.inner.oplog.flush_statuses().await {
            warn!("final status flush failed: {e}");
        }
        if let Err(e) = self.inner.oplog.flush_read_only_outputs().await {
            if !self.inner.oplog.buffers.is_empty() {
                warn!("final output flush failed: {e}");
            }
        }

        let tasks: Vec<JoinHandle<()>> = self.inner.background.lock().drain(..).collect();
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .is_err()
            {
                abort.abort();
            }
        }

        info!("executor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DatabaseConfig, RuntimeConfig};
    use crate::registry::{RegistryBuilder, StepConfig};
    use crate::sysdb::InMemorySystemDatabase;
    use std::sync::atomic::{AtomicU32, Ordering};

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
            flush_interval_ms: 20,
            queue_poll_interval_ms: 20,
            heartbeat_interval_ms: 200,
            heartbeat_ttl_ms: 30_000,
            catchup_horizon: 100,
            max_txn_retries: 3,
        };
        config
    }

    async fn launch_in_memory(registry: Registry) -> Executor {
        init_tracing();
        Executor::launch_with(
            test_config(),
            registry,
            Arc::new(InMemorySystemDatabase::new()),
            None,
        )
        .await
        .expect("launch should succeed")
    }

    #[tokio::test]
    async fn test_workflow_runs_to_success() {
        let mut builder = RegistryBuilder::new();
        let double = builder.register_step(
            "double",
            StepConfig::default(),
            |n: i64| async move { Ok(n * 2) },
        );
        let double_wf = {
            let double = double.clone();
            builder.register_workflow("double_wf", move |mut ctx, n: i64| {
                let double = double.clone();
                async move { ctx.step(&double, n).await }
            })
        };

        let executor = launch_in_memory(builder.build()).await;
        let handle = executor
            .start_workflow(&double_wf, StartOptions::default(), 21)
            .await
            .unwrap();

        assert_eq!(handle.result().await.unwrap(), 42);
        executor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_start_is_idempotent() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_step = calls.clone();

        let mut builder = RegistryBuilder::new();
        let effect = builder.register_step(
            "effect",
            StepConfig::default(),
            move |n: i64| {
                let calls = calls_in_step.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(n)
                }
            },
        );
        let wf = {
            let effect = effect.clone();
            builder.register_workflow("effect_wf", move |mut ctx, n: i64| {
                let effect = effect.clone();
                async move { ctx.step(&effect, n).await }
            })
        };

        let executor = launch_in_memory(builder.build()).await;
        let options = StartOptions::default().with_workflow_id("W1");

        let first = executor
            .start_workflow(&wf, options.clone(), 42)
            .await
            .unwrap();
        assert_eq!(first.result().await.unwrap(), 42);

        let second = executor
            .start_workflow(&wf, options.clone(), 42)
            .await
            .unwrap();
        assert_eq!(second.result().await.unwrap(), 42);

        // The step's effect happened exactly once across both starts
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Same id with different arguments is a conflict
        let conflict = executor.start_workflow(&wf, options, 7).await;
        assert!(matches!(
            conflict,
            Err(RedriveError::WorkflowConflict { .. })
        ));

        executor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unregistered_workflow_fails_synchronously() {
        let builder = RegistryBuilder::new();
        let executor = launch_in_memory(builder.build()).await;

        let ghost: WorkflowRef<i64, i64> = {
            let mut other = RegistryBuilder::new();
            other.register_workflow("ghost", |_ctx, n: i64| async move { Ok(n) })
        };

        let result = executor
            .start_workflow(&ghost, StartOptions::default(), 1)
            .await;
        assert!(matches!(
            result,
            Err(RedriveError::NotRegistered { kind: "workflow", .. })
        ));

        executor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_workflow_error_is_recorded_with_envelope() {
        let mut builder = RegistryBuilder::new();
        let wf = builder.register_workflow("explode", |_ctx, _: i64| async move {
            Err::<i64, _>(RedriveError::application("kaboom"))
        });

        let executor = launch_in_memory(builder.build()).await;
        let handle = executor
            .start_workflow(&wf, StartOptions::default().with_workflow_id("boom-1"), 0)
            .await
            .unwrap();

        let err = handle.result().await.unwrap_err();
        assert_eq!(err.to_envelope().message, "kaboom");

        // A detached observer sees the same recorded envelope
        let observer = executor
            .start_workflow(&wf, StartOptions::default().with_workflow_id("boom-1"), 0)
            .await
            .unwrap();
        let recorded = observer.result().await.unwrap_err();
        assert_eq!(recorded.to_envelope().message, "kaboom");

        executor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_child_workflow_ids_are_deterministic() {
        let mut builder = RegistryBuilder::new();
        let child = builder.register_workflow("child", |_ctx, n: i64| async move { Ok(n + 1) });
        let parent = {
            let child = child.clone();
            builder.register_workflow("parent", move |mut ctx, n: i64| {
                let child = child.clone();
                async move {
                    let first = ctx.start_child_workflow(&child, n).await?;
                    let second = ctx.start_child_workflow(&child, n + 10).await?;
                    Ok(first.result().await? + second.result().await?)
                }
            })
        };

        let executor = launch_in_memory(builder.build()).await;
        let handle = executor
            .start_workflow(&parent, StartOptions::default().with_workflow_id("P"), 1)
            .await
            .unwrap();
        assert_eq!(handle.result().await.unwrap(), (1 + 1) + (11 + 1));

        // Children were assigned ids from the parent's step positions
        let children = executor
            .list_workflows(&WorkflowFilter {
                name: Some("child".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let mut ids: Vec<&str> = children.iter().map(|r| r.workflow_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["P-0", "P-1"]);

        executor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_running_workflow() {
        let mut builder = RegistryBuilder::new();
        let wf = builder.register_workflow("patient", |mut ctx, _: i64| async move {
            ctx.sleep(Duration::from_secs(60)).await?;
            Ok(0i64)
        });

        let executor = launch_in_memory(builder.build()).await;
        let handle = executor
            .start_workflow(&wf, StartOptions::default().with_workflow_id("slow-1"), 0)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        executor.cancel_workflow("slow-1").await.unwrap();

        let err = handle.result().await.unwrap_err();
        assert!(err.is_cancelled());

        let status = executor
            .inner
            .sysdb()
            .get_workflow_status("slow-1")
            .await
            .unwrap()
            .unwrap()
            .status;
        assert_eq!(status, WorkflowStatus::Cancelled);

        executor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_messaging_round_trip_and_replay() {
        let mut builder = RegistryBuilder::new();
        let receiver = builder.register_workflow("receiver", |mut ctx, _: i64| async move {
            let message: Option<String> = ctx.recv("chan", Duration::from_secs(5)).await?;
            Ok(message.unwrap_or_default())
        });
        let sender = builder.register_workflow("sender", |mut ctx, _: i64| async move {
            ctx.send("B", "chan", &"hello".to_string()).await?;
            Ok(0i64)
        });

        let executor = launch_in_memory(builder.build()).await;

        let recv_handle = executor
            .start_workflow(&receiver, StartOptions::default().with_workflow_id("B"), 0)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        executor
            .start_workflow(&sender, StartOptions::default().with_workflow_id("A"), 0)
            .await
            .unwrap()
            .result()
            .await
            .unwrap();

        assert_eq!(recv_handle.result().await.unwrap(), "hello");

        // Replaying the receiver observes the same recorded message
        let replayed: String = executor.debug_workflow(&receiver, "B", 0).await.unwrap();
        assert_eq!(replayed, "hello");

        executor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_event_set_and_external_get() {
        let mut builder = RegistryBuilder::new();
        let wf = builder.register_workflow("publisher", |mut ctx, _: i64| async move {
            ctx.set_event("status", &"shipped".to_string()).await?;
            Ok(0i64)
        });

        let executor = launch_in_memory(builder.build()).await;
        executor
            .start_workflow(&wf, StartOptions::default().with_workflow_id("order-1"), 0)
            .await
            .unwrap()
            .result()
            .await
            .unwrap();

        let value: Option<String> = executor
            .get_event("order-1", "status", Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("shipped"));

        let missing: Option<String> = executor
            .get_event("order-1", "nothing", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(missing.is_none());

        executor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_retries_exceeded_sets_dedicated_status() {
        let mut builder = RegistryBuilder::new();
        let flaky = builder.register_step(
            "always_fails",
            StepConfig::default()
                .with_max_attempts(2)
                .with_interval(Duration::from_millis(1)),
            |_: i64| async move { Err::<i64, _>(RedriveError::application("nope")) },
        );
        let wf = {
            let flaky = flaky.clone();
            builder.register_workflow("flaky_wf", move |mut ctx, n: i64| {
                let flaky = flaky.clone();
                async move { ctx.step(&flaky, n).await }
            })
        };

        let executor = launch_in_memory(builder.build()).await;
        let handle = executor
            .start_workflow(&wf, StartOptions::default().with_workflow_id("F1"), 0)
            .await
            .unwrap();

        let err = handle.result().await.unwrap_err();
        assert!(matches!(err, RedriveError::RetriesExceeded { .. }));

        // The flush loop persists the dedicated terminal status
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = executor
            .inner
            .sysdb()
            .get_workflow_status("F1")
            .await
            .unwrap()
            .unwrap()
            .status;
        assert_eq!(status, WorkflowStatus::RetriesExceeded);

        executor.shutdown().await.unwrap();
    }
}
