//! Workflow execution context
//!
//! A [`WorkflowContext`] is handed to every workflow function. It assigns
//! monotonic function ids in the order the workflow issues step calls, and
//! routes each call through the operation log. Workflow code must issue
//! these calls in a stable order across replays and must not read the
//! clock, randomness, or the outside world between them except through a
//! recorded step.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::RedriveError;
use crate::executor::{ExecutorInner, StartOptions, WorkflowHandle};
use crate::registry::{StepRef, TransactionRef, WorkflowRef};
use crate::sysdb::{CallerContext, SysDbError};

/// Context bound to one workflow execution
pub struct WorkflowContext {
    workflow_id: String,
    next_function_id: i32,
    exec: Arc<ExecutorInner>,
    cancel: CancellationToken,
    replay_only: bool,
}

impl WorkflowContext {
    pub(crate) fn new(
        exec: Arc<ExecutorInner>,
        workflow_id: String,
        cancel: CancellationToken,
        replay_only: bool,
    ) -> Self {
        Self {
            workflow_id,
            next_function_id: 0,
            exec,
            cancel,
            replay_only,
        }
    }

    /// The durable identifier of this workflow
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Whether external cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Incremented once per step entry; replays assign the same id to the
    /// same call site as long as the workflow is deterministic
    fn next_function_id(&mut self) -> i32 {
        let id = self.next_function_id;
        self.next_function_id += 1;
        id
    }

    fn check_cancelled(&self) -> Result<(), RedriveError> {
        if self.cancel.is_cancelled() {
            Err(RedriveError::Cancelled(self.workflow_id.clone()))
        } else {
            Ok(())
        }
    }

    /// In replay mode every operation must already have a recorded outcome;
    /// the recorded value then satisfies the call without a fresh effect
    async fn check_replay(&self, function_id: i32) -> Result<(), RedriveError> {
        if !self.replay_only {
            return Ok(());
        }
        match self
            .exec
            .oplog
            .sysdb
            .check_operation_output(&self.workflow_id, function_id)
            .await?
        {
            Some(_) => Ok(()),
            None => Err(RedriveError::Debugger {
                workflow_id: self.workflow_id.clone(),
                function_id,
            }),
        }
    }

    /// Run a transactional step; at most one effect per (workflow, step)
    pub async fn transaction<I, O>(
        &mut self,
        transaction: &TransactionRef<I, O>,
        input: I,
    ) -> Result<O, RedriveError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        self.check_cancelled()?;
        let function_id = self.next_function_id();
        let args = serde_json::to_value(input)?;

        // Dropping the in-flight future rolls the transaction back
        let value = tokio::select! {
            result = self.exec.oplog.run_transaction(
                &self.workflow_id,
                function_id,
                transaction.name(),
                &args,
                self.replay_only,
            ) => result?,
            _ = self.cancel.cancelled() => {
                return Err(RedriveError::Cancelled(self.workflow_id.clone()));
            }
        };
        Ok(serde_json::from_value(value)?)
    }

    /// Run a non-transactional step with its registered retry policy
    pub async fn step<I, O>(&mut self, step: &StepRef<I, O>, input: I) -> Result<O, RedriveError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        self.check_cancelled()?;
        let function_id = self.next_function_id();
        let args = serde_json::to_value(input)?;

        let value = self
            .exec
            .oplog
            .run_step(
                &self.workflow_id,
                function_id,
                step.name(),
                &args,
                self.replay_only,
                &self.cancel,
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Durably send a message to another workflow's topic
    pub async fn send<T: Serialize>(
        &mut self,
        destination_id: &str,
        topic: &str,
        message: &T,
    ) -> Result<(), RedriveError> {
        self.check_cancelled()?;
        let function_id = self.next_function_id();
        self.check_replay(function_id).await?;
        let message = serde_json::to_string(message)?;

        tokio::select! {
            result = self.exec.oplog.sysdb.send(
                &self.workflow_id,
                function_id,
                destination_id,
                topic,
                &message,
            ) => result.map_err(lift),
            _ = self.cancel.cancelled() => {
                Err(RedriveError::Cancelled(self.workflow_id.clone()))
            }
        }
    }

    /// Consume the oldest message on a topic, waiting up to `timeout`.
    ///
    /// Returns `None` on timeout; the deadline is durable, so a crashed and
    /// resumed wait does not start over.
    pub async fn recv<T: DeserializeOwned>(
        &mut self,
        topic: &str,
        timeout: Duration,
    ) -> Result<Option<T>, RedriveError> {
        self.check_cancelled()?;
        let function_id = self.next_function_id();
        self.check_replay(function_id).await?;

        let message = tokio::select! {
            result = self.exec.oplog.sysdb.recv(
                &self.workflow_id,
                function_id,
                topic,
                timeout,
            ) => result.map_err(lift)?,
            _ = self.cancel.cancelled() => {
                return Err(RedriveError::Cancelled(self.workflow_id.clone()));
            }
        };

        message
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(Into::into)
    }

    /// Publish a write-once keyed event visible to other workflows and
    /// external observers
    pub async fn set_event<T: Serialize>(
        &mut self,
        key: &str,
        value: &T,
    ) -> Result<(), RedriveError> {
        self.check_cancelled()?;
        let function_id = self.next_function_id();
        self.check_replay(function_id).await?;
        let value = serde_json::to_string(value)?;

        self.exec
            .oplog
            .sysdb
            .set_event(&self.workflow_id, function_id, key, &value)
            .await
            .map_err(lift)
    }

    /// Read another workflow's keyed event, waiting up to `timeout`
    pub async fn get_event<T: DeserializeOwned>(
        &mut self,
        target_id: &str,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<T>, RedriveError> {
        self.check_cancelled()?;
        let function_id = self.next_function_id();
        self.check_replay(function_id).await?;
        let caller = CallerContext {
            workflow_id: self.workflow_id.clone(),
            function_id,
        };

        let value = tokio::select! {
            result = self.exec.oplog.sysdb.get_event(
                target_id,
                key,
                timeout,
                Some(caller),
            ) => result.map_err(lift)?,
            _ = self.cancel.cancelled() => {
                return Err(RedriveError::Cancelled(self.workflow_id.clone()));
            }
        };

        value
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(Into::into)
    }

    /// Start a child workflow.
    ///
    /// The child's id is derived from this workflow's id and the step
    /// position, so a replayed parent attaches to the same child instead of
    /// launching a second one.
    pub async fn start_child_workflow<I, O>(
        &mut self,
        workflow: &WorkflowRef<I, O>,
        input: I,
    ) -> Result<WorkflowHandle<O>, RedriveError>
    where
        I: Serialize,
        O: DeserializeOwned + Send + 'static,
    {
        self.check_cancelled()?;
        let function_id = self.next_function_id();
        self.check_replay(function_id).await?;
        let child_id = format!("{}-{}", self.workflow_id, function_id);

        self.exec
            .oplog
            .sysdb
            .record_operation_output(
                &self.workflow_id,
                function_id,
                &serde_json::to_string(&child_id)?,
            )
            .await
            .map_err(lift)?;

        let options = StartOptions::default().with_workflow_id(&child_id);
        let args = serde_json::to_value(input)?;
        let handle = self.exec.start_workflow_erased(workflow.name(), options, args).await?;
        Ok(handle.into_typed())
    }

    /// Durable sleep; replays wait only the remainder of the original
    /// deadline
    pub async fn sleep(&mut self, duration: Duration) -> Result<(), RedriveError> {
        self.check_cancelled()?;
        let function_id = self.next_function_id();
        self.check_replay(function_id).await?;
        self.exec
            .oplog
            .run_sleep(&self.workflow_id, function_id, duration, &self.cancel)
            .await
    }
}

/// Map gateway errors the workflow can act on to their own kinds
fn lift(err: SysDbError) -> RedriveError {
    match err {
        SysDbError::DestinationNotFound(destination) => {
            RedriveError::DestinationNotFound(destination)
        }
        SysDbError::EventAlreadySet { workflow_id, key } => {
            RedriveError::EventAlreadySet { workflow_id, key }
        }
        other => RedriveError::SystemDatabase(other),
    }
}
