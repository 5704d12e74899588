//! # Durable Execution Runtime
//!
//! A PostgreSQL-backed runtime that turns ordinary async functions into
//! reliably resumable workflows.
//!
//! ## Features
//!
//! - **Exactly-once transactional steps**: guard rows and snapshot capture
//!   make each step's effect happen at most once across crashes and retries
//! - **At-least-once external steps**: bounded retries with exponential
//!   backoff, outcomes recorded for deterministic replay
//! - **Durable messaging and events**: FIFO per-topic delivery and
//!   write-once keyed events, with LISTEN/NOTIFY cross-process wakeups
//! - **Cron scheduling**: deterministic firing ids, bounded catch-up
//! - **Crash recovery**: PENDING workflows are re-invoked on launch and
//!   resume from the durable operation log
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Executor                            │
//! │   (drives workflow tasks, replay, recovery, scheduling)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       OperationLog                          │
//! │   (function ids, guard rows, buffered read-only outputs)    │
//! └──────────────────────┬──────────────────┬───────────────────┘
//!                        ▼                  ▼
//! ┌──────────────────────────────┐  ┌───────────────────────────┐
//! │        SystemDatabase        │  │        AppDatabase        │
//! │  (dbos.* schema: statuses,   │  │  (user transactions +     │
//! │   log, messages, queue)      │  │   dbos.transaction_outputs)│
//! └──────────────────────────────┘  └───────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use redrive::prelude::*;
//!
//! let mut builder = RegistryBuilder::new();
//!
//! let record_order = builder.register_transaction(
//!     "record_order",
//!     TransactionConfig::default(),
//!     |conn: &mut sqlx::PgConnection, order: Order| Box::pin(async move {
//!         sqlx::query("INSERT INTO orders (id) VALUES ($1)")
//!             .bind(&order.id)
//!             .execute(conn)
//!             .await
//!             .map_err(|e| RedriveError::application(e.to_string()))?;
//!         Ok(order.id)
//!     }),
//! );
//!
//! let checkout = builder.register_workflow("checkout", move |mut ctx, order: Order| {
//!     let record_order = record_order.clone();
//!     async move {
//!         let id: String = ctx.transaction(&record_order, order).await?;
//!         ctx.set_event("order_id", &id).await?;
//!         Ok(id)
//!     }
//! });
//!
//! let executor = Executor::launch(config, builder.build()).await?;
//! let handle = executor.start_workflow(&checkout, StartOptions::default(), order).await?;
//! let order_id = handle.result().await?;
//! ```

pub mod appdb;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod registry;
pub mod scheduler;
pub mod sysdb;

mod flush;
mod oplog;
mod queue;
mod recovery;

/// Prelude for common imports
pub mod prelude {
    pub use crate::appdb::{AppDatabase, IsolationLevel};
    pub use crate::config::{Config, DatabaseConfig};
    pub use crate::context::WorkflowContext;
    pub use crate::error::{ErrorEnvelope, RedriveError};
    pub use crate::executor::{Executor, StartOptions, WorkflowHandle};
    pub use crate::registry::{
        RegistryBuilder, StepConfig, StepRef, TransactionConfig, TransactionRef, WorkflowRef,
    };
    pub use crate::scheduler::ScheduledInvocation;
    pub use crate::sysdb::{
        InMemorySystemDatabase, PostgresSystemDatabase, SystemDatabase, WorkflowStatus,
    };
}

// Re-export key types at crate root
pub use appdb::{AppDatabase, IsolationLevel};
pub use config::Config;
pub use context::WorkflowContext;
pub use error::{ErrorEnvelope, RedriveError};
pub use executor::{Executor, StartOptions, WorkflowHandle};
pub use registry::{Registry, RegistryBuilder, StepConfig, StepRef, TransactionConfig, TransactionRef, WorkflowRef};
pub use scheduler::ScheduledInvocation;
pub use sysdb::{InMemorySystemDatabase, PostgresSystemDatabase, SystemDatabase, WorkflowStatus};
