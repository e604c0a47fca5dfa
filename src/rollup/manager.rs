use crate::config::RollupConfig;
use crate::errors::{RollupError, RollupResult};
use crate::rollup::lock::{ExecutionLock, LeaseClock, LeaseToken, LockAttempt};
use crate::rollup::models::{ExecutionCursor, RollupRun, RollupTask, RunStatus, Window};
use crate::rollup::runner::{AggregationRunner, Outcome};
use crate::rollup::schedule::next_due_window;
use crate::rollup::source::AlertSink;
use crate::rollup::storage::RollupStore;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

const RETENTION_PURGE_INTERVAL_SECONDS: i64 = 3600;

/// Counters for one evaluation pass over all tasks.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub checked: usize,
    pub not_due: usize,
    pub busy: usize,
    pub completed: usize,
    pub retried: usize,
    pub disabled: usize,
    pub abandoned: usize,
    pub faults: usize,
    pub purged_runs: u64,
}

impl CycleReport {
    fn merge(&mut self, other: CycleReport) {
        self.checked += other.checked;
        self.not_due += other.not_due;
        self.busy += other.busy;
        self.completed += other.completed;
        self.retried += other.retried;
        self.disabled += other.disabled;
        self.abandoned += other.abandoned;
        self.faults += other.faults;
        self.purged_runs += other.purged_runs;
    }
}

enum Step {
    Continue,
    Stop,
}

/// Drives every task: finds due windows, takes the lease, runs the window
/// and records the outcome on the cursor.
pub struct RollupManager {
    store: RollupStore,
    lock: ExecutionLock,
    runner: Arc<AggregationRunner>,
    alerts: Arc<dyn AlertSink>,
    config: RollupConfig,
    holder: String,
    last_retention_purge: Mutex<Option<DateTime<Utc>>>,
}

impl RollupManager {
    pub fn new(
        store: RollupStore,
        runner: Arc<AggregationRunner>,
        alerts: Arc<dyn AlertSink>,
        config: RollupConfig,
    ) -> RollupResult<Self> {
        config.validate()?;
        let holder = config.holder_id();
        Ok(Self {
            lock: store.execution_lock(),
            store,
            runner,
            alerts,
            config,
            holder,
            last_retention_purge: Mutex::new(None),
        })
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Evaluates every enabled task once. Tasks run concurrently up to
    /// `worker_concurrency`; each task drains at most `max_windows_per_cycle`
    /// windows before yielding to the next cycle.
    ///
    /// `now` decides which windows are due. Leases are stamped by a clock
    /// that starts at `now` and keeps running for the length of the cycle.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> RollupResult<CycleReport> {
        let clock = LeaseClock::starting_at(now);
        let mut report = CycleReport {
            purged_runs: self.run_retention_purge_if_due(now).await,
            ..CycleReport::default()
        };

        let tasks = self
            .with_store_retry("read rollup tasks", || self.store.read())
            .await?;

        let results = futures::stream::iter(tasks.into_iter().filter(|task| task.enabled))
            .map(|task| self.process_task(task, now, &clock))
            .buffer_unordered(self.config.worker_concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        for task_report in results {
            report.merge(task_report);
        }

        if report.completed + report.retried + report.disabled + report.abandoned > 0 {
            log::info!(
                "Rollup cycle at {} (holder={}): {} completed, {} retried, {} disabled, {} abandoned, {} busy",
                now.to_rfc3339(),
                self.holder,
                report.completed,
                report.retried,
                report.disabled,
                report.abandoned,
                report.busy
            );
        }

        Ok(report)
    }

    async fn process_task(
        &self,
        task: RollupTask,
        now: DateTime<Utc>,
        clock: &LeaseClock,
    ) -> CycleReport {
        let mut report = CycleReport {
            checked: 1,
            ..CycleReport::default()
        };
        let margin = self.config.safety_margin();

        for _ in 0..self.config.max_windows_per_cycle.max(1) {
            let cursor = match self
                .with_store_retry("read cursor", || self.store.read_cursor(&task.id))
                .await
            {
                Ok(cursor) => cursor,
                Err(RollupError::NotFound(_)) => break,
                Err(err) => {
                    log::warn!("Skipping rollup task '{}': {}", task.id, err);
                    report.faults += 1;
                    break;
                }
            };

            if next_due_window(&task, &cursor, now, margin).is_none() {
                if report.completed == 0 {
                    report.not_due += 1;
                }
                break;
            }

            let mut lease = match self
                .lock
                .acquire(&task.id, &self.holder, self.config.lease(), clock.now())
                .await
            {
                Ok(LockAttempt::Acquired(token)) => token,
                Ok(LockAttempt::Busy { holder, lease_until }) => {
                    log::debug!(
                        "Rollup task '{}' is held by '{}' until {}",
                        task.id,
                        holder,
                        lease_until.to_rfc3339()
                    );
                    report.busy += 1;
                    break;
                }
                Err(err) => {
                    log::warn!("Failed to lock rollup task '{}': {}", task.id, err);
                    report.faults += 1;
                    break;
                }
            };

            let step = self
                .run_leased(&task.id, &mut lease, now, clock, &mut report)
                .await;

            if let Err(err) = self.lock.release(&lease).await {
                log::warn!("Failed to release lock for rollup task '{}': {}", task.id, err);
            }

            if matches!(step, Step::Stop) {
                break;
            }
        }

        report
    }

    /// One window under a held lease. Definition and cursor are re-read
    /// first since another holder may have moved them before we got the lock.
    async fn run_leased(
        &self,
        task_id: &str,
        lease: &mut LeaseToken,
        now: DateTime<Utc>,
        clock: &LeaseClock,
        report: &mut CycleReport,
    ) -> Step {
        let task = match self
            .with_store_retry("read rollup task", || self.store.get(task_id))
            .await
        {
            Ok(Some(task)) => task,
            Ok(None) => return Step::Stop,
            Err(err) => {
                log::warn!("Failed to reload rollup task '{}': {}", task_id, err);
                report.faults += 1;
                return Step::Stop;
            }
        };
        let cursor = match self
            .with_store_retry("read cursor", || self.store.read_cursor(task_id))
            .await
        {
            Ok(cursor) => cursor,
            Err(RollupError::NotFound(_)) => return Step::Stop,
            Err(err) => {
                log::warn!("Failed to reload cursor of '{}': {}", task_id, err);
                report.faults += 1;
                return Step::Stop;
            }
        };
        let Some(window) = next_due_window(&task, &cursor, now, self.config.safety_margin()) else {
            return Step::Stop;
        };

        let started_at = clock.now();
        let outcome = self.runner.execute(&task, &window, lease, clock).await;
        let finished_at = clock.now();

        match outcome {
            Outcome::Success { points_written } => {
                let next = cursor.advanced_to(window.end, finished_at);
                match self
                    .with_store_retry("advance cursor", || {
                        self.store.write_cursor(&cursor, &next)
                    })
                    .await
                {
                    Ok(_) => {
                        log::info!(
                            "Rollup task '{}' completed window [{}, {}) with {} points",
                            task.id,
                            window.start.to_rfc3339(),
                            window.end.to_rfc3339(),
                            points_written
                        );
                        report.completed += 1;
                        self.record_run(
                            &task,
                            &window,
                            RunStatus::Success,
                            cursor.attempt,
                            points_written,
                            None,
                            started_at,
                            finished_at,
                        )
                        .await;
                        Step::Continue
                    }
                    Err(RollupError::CursorConflict(_)) => {
                        log::warn!(
                            "Cursor of rollup task '{}' moved during execution; abandoning window {}",
                            task.id,
                            window.start.to_rfc3339()
                        );
                        report.abandoned += 1;
                        self.record_run(
                            &task,
                            &window,
                            RunStatus::Abandoned,
                            cursor.attempt,
                            points_written,
                            Some("cursor conflict"),
                            started_at,
                            finished_at,
                        )
                        .await;
                        Step::Stop
                    }
                    Err(err) => {
                        // Output is durable but the cursor is not; the window
                        // re-executes on a later cycle.
                        log::error!(
                            "Failed to advance cursor of rollup task '{}' past {}: {}",
                            task.id,
                            window.start.to_rfc3339(),
                            err
                        );
                        report.faults += 1;
                        Step::Stop
                    }
                }
            }
            Outcome::TransientFailure(reason) => {
                self.handle_failure(
                    &task,
                    &cursor,
                    &window,
                    &reason,
                    false,
                    started_at,
                    finished_at,
                    report,
                )
                .await
            }
            Outcome::PermanentFailure(reason) => {
                self.handle_failure(
                    &task,
                    &cursor,
                    &window,
                    &reason,
                    true,
                    started_at,
                    finished_at,
                    report,
                )
                .await
            }
            Outcome::LeaseLost(reason) => {
                report.abandoned += 1;
                self.record_run(
                    &task,
                    &window,
                    RunStatus::Abandoned,
                    cursor.attempt,
                    0,
                    Some(reason.as_str()),
                    started_at,
                    finished_at,
                )
                .await;
                Step::Stop
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_failure(
        &self,
        task: &RollupTask,
        cursor: &ExecutionCursor,
        window: &Window,
        reason: &str,
        permanent: bool,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Step {
        let attempts_used = cursor.attempt.saturating_add(1);
        let exhausted = attempts_used >= task.retry_policy.max_attempts;

        let next_attempt_at = if permanent || exhausted {
            None
        } else {
            let delay_ms = compute_retry_delay_ms(
                task.retry_policy.backoff_ms,
                attempts_used,
                self.config.max_backoff_ms,
            );
            let delay_ms = delay_ms.min(i64::MAX as u64) as i64;
            Some(finished_at + chrono::Duration::milliseconds(delay_ms))
        };
        let failed = cursor.failed_attempt(reason, next_attempt_at, finished_at);

        match self
            .with_store_retry("record failed attempt", || {
                self.store.write_cursor(cursor, &failed)
            })
            .await
        {
            Ok(_) => {}
            Err(RollupError::CursorConflict(_)) => {
                report.abandoned += 1;
                return Step::Stop;
            }
            Err(err) => {
                log::error!("Failed to record failure of rollup task '{}': {}", task.id, err);
                report.faults += 1;
                return Step::Stop;
            }
        }

        if let Some(retry_at) = next_attempt_at {
            log::warn!(
                "Rollup task '{}' window {} failed (attempt {}/{}), retrying at {}: {}",
                task.id,
                window.start.to_rfc3339(),
                attempts_used,
                task.retry_policy.max_attempts,
                retry_at.to_rfc3339(),
                reason
            );
            report.retried += 1;
            self.record_run(
                task,
                window,
                RunStatus::Retrying,
                attempts_used,
                0,
                Some(reason),
                started_at,
                finished_at,
            )
            .await;
            return Step::Stop;
        }

        let disable_reason = if permanent {
            reason.to_string()
        } else {
            format!("{} (after {} attempts)", reason, attempts_used)
        };
        match self
            .with_store_retry("disable rollup task", || {
                self.store
                    .set_enabled(&task.id, false, Some(disable_reason.as_str()), finished_at)
            })
            .await
        {
            Ok(()) => {
                self.alerts.notify(&task.id, &disable_reason);
                report.disabled += 1;
                self.record_run(
                    task,
                    window,
                    RunStatus::Disabled,
                    attempts_used,
                    0,
                    Some(disable_reason.as_str()),
                    started_at,
                    finished_at,
                )
                .await;
            }
            Err(err) => {
                log::error!("Failed to disable rollup task '{}': {}", task.id, err);
                report.faults += 1;
            }
        }
        Step::Stop
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_run(
        &self,
        task: &RollupTask,
        window: &Window,
        status: RunStatus,
        attempt: u32,
        points_written: usize,
        error_message: Option<&str>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) {
        let run = RollupRun {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            window_start: window.start,
            window_end: window.end,
            status,
            attempt,
            points_written: points_written as i64,
            holder: self.holder.clone(),
            error_message: error_message.map(str::to_string),
            started_at,
            finished_at,
        };
        if let Err(err) = self.store.record_run(&run).await {
            log::warn!("Failed to record run history for '{}': {}", task.id, err);
        }
    }

    /// Retries store faults with backoff; every other error is returned as is.
    async fn with_store_retry<T, F, Fut>(&self, context: &str, mut op: F) -> RollupResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RollupResult<T>>,
    {
        let attempts = self.config.store_retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Err(err) if err.is_store_fault() && attempt < attempts => {
                    let delay_ms = compute_retry_delay_ms(
                        self.config.store_retry_backoff_ms,
                        attempt,
                        self.config.max_backoff_ms,
                    );
                    log::warn!(
                        "Store fault during {} (attempt {}/{}), retrying in {}ms: {}",
                        context,
                        attempt,
                        attempts,
                        delay_ms,
                        err
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn run_retention_purge_if_due(&self, now: DateTime<Utc>) -> u64 {
        let should_run = match self.last_retention_purge.lock() {
            Ok(mut last_purge) => {
                let due = last_purge.map_or(true, |last| {
                    now.signed_duration_since(last).num_seconds() >= RETENTION_PURGE_INTERVAL_SECONDS
                });
                if due {
                    *last_purge = Some(now);
                }
                due
            }
            Err(_) => false,
        };
        if !should_run {
            return 0;
        }

        match self
            .store
            .purge_runs_older_than(self.config.run_retention_days, now)
            .await
        {
            Ok(deleted) => {
                if deleted > 0 {
                    log::info!(
                        "Purged {} rollup runs older than {} days",
                        deleted,
                        self.config.run_retention_days
                    );
                }
                deleted
            }
            Err(err) => {
                log::warn!("Scheduled rollup run purge failed: {}", err);
                0
            }
        }
    }

    /// Spawns the evaluation loop. It runs a cycle every poll interval and
    /// whenever [`ManagerHandle::wake`] is called.
    pub fn start(self: Arc<Self>) -> ManagerHandle {
        let wake = Arc::new(Notify::new());
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let loop_wake = wake.clone();
        let poll_interval = self.config.poll_interval();

        let join = tokio::spawn(async move {
            log::info!(
                "Rollup manager started (holder={}, poll={}s).",
                self.holder,
                poll_interval.as_secs()
            );
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = loop_wake.notified() => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }

                if let Err(err) = self.run_cycle(Utc::now()).await {
                    log::error!("Rollup cycle failed: {}", err);
                }
            }

            log::info!("Rollup manager stopped (holder={}).", self.holder);
        });

        ManagerHandle {
            wake,
            shutdown: shutdown_tx,
            join,
        }
    }
}

/// Control surface of a running manager loop.
pub struct ManagerHandle {
    wake: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ManagerHandle {
    /// Requests an immediate evaluation, e.g. after a task was created.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Stops the loop after the current cycle finishes.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            log::error!("Rollup manager loop ended abnormally: {}", err);
        }
    }
}

/// Exponential backoff: `backoff_ms * 2^(attempt - 1)`, capped at `max_ms`.
pub(crate) fn compute_retry_delay_ms(backoff_ms: u64, attempt: u32, max_ms: u64) -> u64 {
    if attempt == 0 {
        return 0;
    }
    let exponent = (attempt - 1).min(63);
    backoff_ms
        .saturating_mul(1u64.checked_shl(exponent).unwrap_or(u64::MAX))
        .min(max_ms)
}
