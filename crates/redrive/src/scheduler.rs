//! Cron scheduler
//!
//! Each schedule runs as its own loop that computes the firings strictly
//! between the last fired time and now. Firing ids are deterministic
//! (`sched-<workflow>-<time>`), so a crash-restarted scheduler attaches to
//! already-started firings instead of duplicating them; catch-up after
//! downtime is bounded by the configured horizon.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::executor::{ExecutorInner, StartOptions};
use crate::registry::ScheduleEntry;
use crate::sysdb::WorkflowFilter;

/// Input delivered to every scheduled workflow firing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledInvocation {
    /// The cron occurrence this firing stands for
    pub scheduled_time: DateTime<Utc>,

    /// When the firing was actually started
    pub actual_start_time: DateTime<Utc>,
}

pub(crate) fn spawn_schedulers(inner: Arc<ExecutorInner>) -> Vec<JoinHandle<()>> {
    inner
        .registry
        .schedules()
        .iter()
        .cloned()
        .map(|entry| spawn_schedule_loop(inner.clone(), entry))
        .collect()
}

fn spawn_schedule_loop(inner: Arc<ExecutorInner>, entry: ScheduleEntry) -> JoinHandle<()> {
    let mut shutdown_rx = inner.shutdown_signal();

    tokio::spawn(async move {
        let mut last_fired = initial_last_fired(&inner, &entry.workflow).await;
        debug!(workflow = %entry.workflow, expr = %entry.expr, %last_fired, "schedule loop started");

        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now();
                    let horizon = inner.config.runtime.catchup_horizon as usize;
                    let (due, dropped) = due_firings(&entry.schedule, &last_fired, &now, horizon);

                    if dropped > 0 {
                        warn!(
                            workflow = %entry.workflow,
                            dropped,
                            "cron catch-up exceeded the horizon; oldest missed firings dropped"
                        );
                    }

                    for scheduled_time in &due {
                        fire(&inner, &entry.workflow, *scheduled_time).await;
                    }

                    if let Some(latest) = due.last() {
                        last_fired = *latest;
                    } else if dropped > 0 {
                        last_fired = now;
                    }
                }
                _ = shutdown_rx.changed() => {
                    debug!(workflow = %entry.workflow, "schedule loop: shutdown requested");
                    break;
                }
            }
        }

        debug!(workflow = %entry.workflow, "schedule loop exited");
    })
}

/// Anchor catch-up at the most recent prior run of this workflow, so a
/// restarted scheduler backfills downtime instead of starting from now
async fn initial_last_fired(inner: &Arc<ExecutorInner>, workflow: &str) -> DateTime<Utc> {
    let filter = WorkflowFilter {
        name: Some(workflow.to_string()),
        limit: Some(1),
        newest_first: true,
        ..Default::default()
    };

    match inner.sysdb().list_workflows(&filter).await {
        Ok(rows) => rows
            .first()
            .and_then(|row| DateTime::from_timestamp_millis(row.created_at))
            .unwrap_or_else(Utc::now),
        Err(e) => {
            error!(%workflow, "failed to read last firing, starting from now: {e}");
            Utc::now()
        }
    }
}

/// Firings strictly between `last_fired` and `now`, keeping only the newest
/// `horizon` occurrences. Returns (due, dropped_count).
fn due_firings(
    schedule: &cron::Schedule,
    last_fired: &DateTime<Utc>,
    now: &DateTime<Utc>,
    horizon: usize,
) -> (Vec<DateTime<Utc>>, usize) {
    let mut due: VecDeque<DateTime<Utc>> = VecDeque::new();
    let mut dropped = 0usize;

    for occurrence in schedule.after(last_fired) {
        if occurrence > *now {
            break;
        }
        if due.len() == horizon {
            due.pop_front();
            dropped += 1;
        }
        due.push_back(occurrence);
    }

    (due.into(), dropped)
}

async fn fire(inner: &Arc<ExecutorInner>, workflow: &str, scheduled_time: DateTime<Utc>) {
    let workflow_id = format!("sched-{}-{}", workflow, scheduled_time.to_rfc3339());
    let invocation = ScheduledInvocation {
        scheduled_time,
        actual_start_time: Utc::now(),
    };
    let args = match serde_json::to_value(&invocation) {
        Ok(args) => args,
        Err(e) => {
            error!(%workflow, "failed to serialize scheduled invocation: {e}");
            return;
        }
    };

    // A duplicate id (restart, or a second scheduler) attaches instead of
    // firing twice
    match inner
        .start_workflow_erased(
            workflow,
            StartOptions::default().with_workflow_id(&workflow_id),
            args,
        )
        .await
    {
        Ok(_) => debug!(%workflow_id, "cron firing started"),
        Err(e) => error!(%workflow_id, "cron firing failed to start: {e}"),
    }
}
