//! Background flush loop
//!
//! One periodic task persists, in two batches, everything the runtime keeps
//! in memory for throughput: buffered read-only transaction outputs and
//! advanced workflow statuses. Read-only steps that are lost to a crash
//! before flushing simply re-execute on replay, which is safe by contract.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::executor::ExecutorInner;

pub(crate) fn spawn_flush_loop(inner: Arc<ExecutorInner>) -> JoinHandle<()> {
    let mut shutdown_rx = inner.shutdown_signal();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(inner.config.runtime.flush_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match inner.oplog.flush_read_only_outputs().await {
                        Ok(0) => {}
                        Ok(count) => debug!(count, "flushed read-only outputs"),
                        Err(e) => error!("read-only output flush failed: {e}"),
                    }

                    match inner.oplog.flush_statuses().await {
                        Ok(0) => {}
                        Ok(count) => debug!(count, "flushed workflow statuses"),
                        Err(e) => error!("status flush failed: {e}"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    debug!("flush loop: shutdown requested");
                    break;
                }
            }
        }

        debug!("flush loop exited");
    })
}
