//! System database gateway
//!
//! This module owns all state in the `dbos` schema: workflow status rows,
//! the operation log, notifications, keyed events, the workflow queue, and
//! executor heartbeats.

mod gateway;
mod memory;
mod postgres;
mod waiters;

pub use gateway::{
    CallerContext, OperationEntry, RecordedOutcome, StatusUpdate, SysDbError, SystemDatabase,
    WorkflowFilter, WorkflowOutcome, WorkflowStatus, WorkflowStatusRow,
};
pub use memory::InMemorySystemDatabase;
pub use postgres::{PostgresSystemDatabase, NOTIFICATIONS_CHANNEL, WORKFLOW_EVENTS_CHANNEL};
