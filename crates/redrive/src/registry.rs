//! Workflow, transaction, and step registry
//!
//! Applications register their functions against a [`RegistryBuilder`] at
//! startup; the executor consults the frozen [`Registry`] by name. Typed
//! handles ([`WorkflowRef`], [`TransactionRef`], [`StepRef`]) carry the
//! input/output types, while the stored functions are JSON-erased so the
//! executor can re-invoke them during recovery without knowing the types.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::PgConnection;

use crate::appdb::IsolationLevel;
use crate::context::WorkflowContext;
use crate::error::RedriveError;
use crate::scheduler::ScheduledInvocation;

/// Options for a registered transaction
#[derive(Debug, Clone, Default)]
pub struct TransactionConfig {
    pub isolation: IsolationLevel,
    /// Read-only transactions skip the guard write and buffer their output
    pub read_only: bool,
}

impl TransactionConfig {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }
}

/// Options for a registered non-transactional step
#[derive(Debug, Clone)]
pub struct StepConfig {
    /// When false the step runs exactly once and any error is recorded
    pub retries_allowed: bool,
    pub max_attempts: u32,
    /// Base sleep between attempts
    pub interval: Duration,
    /// Multiplier applied to the interval after each failure
    pub backoff_rate: f64,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            retries_allowed: true,
            max_attempts: 3,
            interval: Duration::from_secs(1),
            backoff_rate: 2.0,
        }
    }
}

impl StepConfig {
    pub fn no_retries() -> Self {
        Self {
            retries_allowed: false,
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_backoff_rate(mut self, backoff_rate: f64) -> Self {
        self.backoff_rate = backoff_rate.max(1.0);
        self
    }
}

// Type-erased function signatures stored in the registry. All payloads are
// JSON so recovery can re-invoke a workflow from its persisted inputs.

pub(crate) type WorkflowFn = Arc<
    dyn Fn(WorkflowContext, Value) -> BoxFuture<'static, Result<Value, RedriveError>>
        + Send
        + Sync,
>;

pub(crate) type StepFn =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, RedriveError>> + Send + Sync>;

pub(crate) type TransactionFn = Arc<
    dyn for<'c> Fn(&'c mut PgConnection, Value) -> BoxFuture<'c, Result<Value, RedriveError>>
        + Send
        + Sync,
>;

/// Typed handle to a registered workflow
pub struct WorkflowRef<I, O> {
    name: Arc<str>,
    _marker: PhantomData<fn(I) -> O>,
}

/// Typed handle to a registered transaction
pub struct TransactionRef<I, O> {
    name: Arc<str>,
    _marker: PhantomData<fn(I) -> O>,
}

/// Typed handle to a registered step
pub struct StepRef<I, O> {
    name: Arc<str>,
    _marker: PhantomData<fn(I) -> O>,
}

macro_rules! impl_ref {
    ($ref_type:ident) => {
        impl<I, O> $ref_type<I, O> {
            fn new(name: &str) -> Self {
                Self {
                    name: Arc::from(name),
                    _marker: PhantomData,
                }
            }

            pub fn name(&self) -> &str {
                &self.name
            }
        }

        impl<I, O> Clone for $ref_type<I, O> {
            fn clone(&self) -> Self {
                Self {
                    name: self.name.clone(),
                    _marker: PhantomData,
                }
            }
        }

        impl<I, O> std::fmt::Debug for $ref_type<I, O> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_tuple(stringify!($ref_type)).field(&self.name).finish()
            }
        }
    };
}

impl_ref!(WorkflowRef);
impl_ref!(TransactionRef);
impl_ref!(StepRef);

pub(crate) struct TransactionEntry {
    pub func: TransactionFn,
    pub config: TransactionConfig,
}

pub(crate) struct StepEntry {
    pub func: StepFn,
    pub config: StepConfig,
}

/// A cron schedule attached to a registered workflow
#[derive(Clone)]
pub(crate) struct ScheduleEntry {
    pub workflow: String,
    pub expr: String,
    pub schedule: cron::Schedule,
}

/// Builder for the function registry
///
/// # Example
///
/// ```ignore
/// let mut builder = RegistryBuilder::new();
/// let checkout = builder.register_workflow("checkout", |mut ctx, order: Order| async move {
///     // ...
///     Ok(receipt)
/// });
/// let registry = builder.build();
/// ```
#[derive(Default)]
pub struct RegistryBuilder {
    workflows: HashMap<String, WorkflowFn>,
    transactions: HashMap<String, TransactionEntry>,
    steps: HashMap<String, StepEntry>,
    queues: HashMap<String, u32>,
    schedules: Vec<ScheduleEntry>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow function; later registrations replace earlier ones
    pub fn register_workflow<I, O, F, Fut>(&mut self, name: &str, f: F) -> WorkflowRef<I, O>
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(WorkflowContext, I) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<O, RedriveError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let erased: WorkflowFn = Arc::new(move |ctx, args| {
            let f = f.clone();
            Box::pin(async move {
                let input: I = serde_json::from_value(args)
                    .map_err(|e| RedriveError::UserDataValidation(e.to_string()))?;
                let output = f(ctx, input).await?;
                Ok(serde_json::to_value(output)?)
            })
        });
        self.workflows.insert(name.to_string(), erased);
        WorkflowRef::new(name)
    }

    /// Register a transactional step; the callback receives the transaction's
    /// connection and must return a boxed future borrowing it
    pub fn register_transaction<I, O, F>(
        &mut self,
        name: &str,
        config: TransactionConfig,
        f: F,
    ) -> TransactionRef<I, O>
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: for<'c> Fn(&'c mut PgConnection, I) -> BoxFuture<'c, Result<O, RedriveError>>
            + Send
            + Sync
            + 'static,
    {
        let f = Arc::new(f);
        let erased: TransactionFn = Arc::new(move |conn: &mut PgConnection, args| {
            let f = f.clone();
            Box::pin(async move {
                let input: I = serde_json::from_value(args)
                    .map_err(|e| RedriveError::UserDataValidation(e.to_string()))?;
                let output = f(conn, input).await?;
                Ok(serde_json::to_value(output)?)
            })
        });
        self.transactions
            .insert(name.to_string(), TransactionEntry { func: erased, config });
        TransactionRef::new(name)
    }

    /// Register a non-transactional step for retriable external side-effects
    pub fn register_step<I, O, F, Fut>(
        &mut self,
        name: &str,
        config: StepConfig,
        f: F,
    ) -> StepRef<I, O>
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<O, RedriveError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let erased: StepFn = Arc::new(move |args| {
            let f = f.clone();
            Box::pin(async move {
                let input: I = serde_json::from_value(args)
                    .map_err(|e| RedriveError::UserDataValidation(e.to_string()))?;
                let output = f(input).await?;
                Ok(serde_json::to_value(output)?)
            })
        });
        self.steps
            .insert(name.to_string(), StepEntry { func: erased, config });
        StepRef::new(name)
    }

    /// Register a named admission lane for queued workflow starts
    pub fn register_queue(&mut self, name: &str, concurrency_limit: u32) {
        self.queues
            .insert(name.to_string(), concurrency_limit.max(1));
    }

    /// Attach a cron schedule to a registered workflow.
    ///
    /// Expressions use the six-field form with seconds, e.g.
    /// `"0 0 * * * *"` for every hour on the hour.
    pub fn register_scheduled<O>(
        &mut self,
        workflow: &WorkflowRef<ScheduledInvocation, O>,
        cron_expr: &str,
    ) -> Result<(), RedriveError> {
        let schedule = cron::Schedule::from_str(cron_expr).map_err(|e| {
            RedriveError::UserDataValidation(format!("invalid cron expression {cron_expr:?}: {e}"))
        })?;
        self.schedules.push(ScheduleEntry {
            workflow: workflow.name().to_string(),
            expr: cron_expr.to_string(),
            schedule,
        });
        Ok(())
    }

    /// Freeze the registry
    pub fn build(self) -> Registry {
        Registry {
            inner: Arc::new(self),
        }
    }
}

/// Frozen, shareable registry
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryBuilder>,
}

impl Registry {
    pub fn contains_workflow(&self, name: &str) -> bool {
        self.inner.workflows.contains_key(name)
    }

    pub(crate) fn workflow(&self, name: &str) -> Result<WorkflowFn, RedriveError> {
        self.inner
            .workflows
            .get(name)
            .cloned()
            .ok_or_else(|| RedriveError::NotRegistered {
                kind: "workflow",
                name: name.to_string(),
            })
    }

    pub(crate) fn transaction(
        &self,
        name: &str,
    ) -> Result<(TransactionFn, TransactionConfig), RedriveError> {
        self.inner
            .transactions
            .get(name)
            .map(|entry| (entry.func.clone(), entry.config.clone()))
            .ok_or_else(|| RedriveError::NotRegistered {
                kind: "transaction",
                name: name.to_string(),
            })
    }

    pub(crate) fn step(&self, name: &str) -> Result<(StepFn, StepConfig), RedriveError> {
        self.inner
            .steps
            .get(name)
            .map(|entry| (entry.func.clone(), entry.config.clone()))
            .ok_or_else(|| RedriveError::NotRegistered {
                kind: "step",
                name: name.to_string(),
            })
    }

    pub(crate) fn queue_limit(&self, name: &str) -> Result<u32, RedriveError> {
        self.inner
            .queues
            .get(name)
            .copied()
            .ok_or_else(|| RedriveError::NotRegistered {
                kind: "queue",
                name: name.to_string(),
            })
    }

    pub(crate) fn queues(&self) -> impl Iterator<Item = (&str, u32)> {
        self.inner.queues.iter().map(|(name, limit)| (name.as_str(), *limit))
    }

    pub(crate) fn schedules(&self) -> &[ScheduleEntry] {
        &self.inner.schedules
    }

    pub fn workflow_names(&self) -> impl Iterator<Item = &str> {
        self.inner.workflows.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("workflows", &self.inner.workflows.keys().collect::<Vec<_>>())
            .field("steps", &self.inner.steps.keys().collect::<Vec<_>>())
            .field(
                "transactions",
                &self.inner.transactions.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(serde::Serialize, serde::Deserialize)]
    struct Noop;

    #[test]
    fn test_step_registration_and_lookup() {
        let mut builder = RegistryBuilder::new();
        let step = builder.register_step(
            "fetch_rate",
            StepConfig::default().with_max_attempts(5),
            |_: Noop| async move { Ok(1.25f64) },
        );

        assert_eq!(step.name(), "fetch_rate");

        let registry = builder.build();
        let (_, config) = registry.step("fetch_rate").unwrap();
        assert_eq!(config.max_attempts, 5);
        assert!(config.retries_allowed);

        assert!(matches!(
            registry.step("missing"),
            Err(RedriveError::NotRegistered { kind: "step", .. })
        ));
    }

    #[test]
    fn test_queue_registration() {
        let mut builder = RegistryBuilder::new();
        builder.register_queue("payments", 0);

        let registry = builder.build();
        // A zero limit would deadlock the lane; it is clamped to one
        assert_eq!(registry.queue_limit("payments").unwrap(), 1);
        assert!(registry.queue_limit("missing").is_err());
    }

    #[test]
    fn test_invalid_cron_is_rejected() {
        let mut builder = RegistryBuilder::new();
        let wf = builder.register_workflow(
            "tick",
            |_ctx, _input: ScheduledInvocation| async move { Ok(Noop) },
        );

        assert!(builder.register_scheduled(&wf, "not a cron line").is_err());
        assert!(builder.register_scheduled(&wf, "*/5 * * * * *").is_ok());
    }

    #[test]
    fn test_step_config_defaults() {
        let config = StepConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff_rate, 2.0);

        let once = StepConfig::no_retries();
        assert!(!once.retries_allowed);
        assert_eq!(once.max_attempts, 1);
    }
}
