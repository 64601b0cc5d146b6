//! Due-timer scheduler.
//!
//! Each tick pulls a bounded batch of cursors whose persisted `next_run_at`
//! has passed and fires their timers with bounded concurrency. Deadlines are
//! wall-clock values, so a tick after downtime sees exactly the timers that
//! came due while the process was down.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::engine::FlowEngine;
use crate::executor::StepOutcome;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Cursors pulled in this batch.
    pub due: usize,
    /// Cursors that moved (advanced, parked again, or finished).
    pub fired: usize,
    /// Timers that turned out not to apply any more.
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    engine: FlowEngine,
    batch_size: usize,
    concurrency: usize,
    interval: StdDuration,
    snapshot_every: StdDuration,
    snapshot_path: Option<String>,
}

impl Scheduler {
    pub fn new(engine: FlowEngine) -> Self {
        let config = engine.config().clone();
        Self {
            engine,
            batch_size: config.batch_size.max(1),
            concurrency: config.dispatch_concurrency.max(1),
            interval: StdDuration::from_millis(config.scheduler_interval_ms.max(1)),
            snapshot_every: StdDuration::from_secs(config.snapshot_interval_secs.max(1)),
            snapshot_path: config.snapshot_path,
        }
    }

    /// Fires one batch of due timers, ordered by deadline then cursor id.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let due = self.engine.due_cursors(now, self.batch_size);
        if due.is_empty() {
            return TickReport::default();
        }

        let fired = AtomicUsize::new(0);
        let skipped = AtomicUsize::new(0);
        let errors = AtomicUsize::new(0);

        stream::iter(due.iter())
            .for_each_concurrent(self.concurrency, |key| {
                let (fired, skipped, errors) = (&fired, &skipped, &errors);
                async move {
                    match self.engine.fire_timer(key, now).await {
                        Ok(StepOutcome::Ignored) => {
                            skipped.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(_) => {
                            fired.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            errors.fetch_add(1, Ordering::Relaxed);
                            warn!(cursor = %key, error = %e, "Timer dispatch failed");
                        }
                    }
                }
            })
            .await;

        let report = TickReport {
            due: due.len(),
            fired: fired.into_inner(),
            skipped: skipped.into_inner(),
            errors: errors.into_inner(),
        };
        debug!(
            due = report.due,
            fired = report.fired,
            skipped = report.skipped,
            errors = report.errors,
            "Scheduler tick"
        );
        report
    }

    /// Runs ticks until `shutdown` flips to `true`, pruning idempotency keys
    /// and writing snapshots on the snapshot cadence. A final snapshot is
    /// written on shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            batch_size = self.batch_size,
            concurrency = self.concurrency,
            "Scheduler started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut maintenance = tokio::time::interval(self.snapshot_every);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.tick(Utc::now()).await;
                    // a full batch means more work is already waiting
                    if report.due == self.batch_size {
                        ticker.reset_immediately();
                    }
                }
                _ = maintenance.tick() => {
                    self.maintain(Utc::now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.maintain(Utc::now()).await;
        info!("Scheduler stopped");
    }

    async fn maintain(&self, now: DateTime<Utc>) {
        self.engine.prune(now);
        if let Some(path) = &self.snapshot_path {
            if let Err(e) = self.engine.save_snapshot(path, now).await {
                error!(path = %path, error = %e, "Snapshot write failed");
            }
        }
    }
}
