use crate::errors::{RollupError, RollupResult};
use crate::rollup::aggregator::{AggregatorError, AggregatorRegistry};
use crate::rollup::models::{
    CreateRollupTaskRequest, RollupRun, RollupTask, RollupTaskStatus, UpdateRollupTaskRequest,
};
use crate::rollup::schedule::finest_period_seconds;
use crate::rollup::storage::RollupStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Notify;

const STATUS_RECENT_RUNS: i64 = 20;
const UPDATE_CONFLICT_RETRIES: u32 = 3;

/// Administrative operations over rollup tasks.
#[derive(Clone)]
pub struct RollupService {
    store: RollupStore,
    aggregators: Arc<AggregatorRegistry>,
    poll_interval_seconds: u64,
    wake: Option<Arc<Notify>>,
}

impl RollupService {
    pub fn new(
        store: RollupStore,
        aggregators: Arc<AggregatorRegistry>,
        poll_interval_seconds: u64,
    ) -> Self {
        Self {
            store,
            aggregators,
            poll_interval_seconds,
            wake: None,
        }
    }

    /// Wakes a running manager after definitions change.
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = Some(wake);
        self
    }

    /// Validates the whole batch before persisting any of it.
    pub async fn create(
        &self,
        requests: Vec<CreateRollupTaskRequest>,
        now: DateTime<Utc>,
    ) -> RollupResult<Vec<RollupTask>> {
        if requests.is_empty() {
            return Err(RollupError::Validation(
                "At least one rollup task is required".to_string(),
            ));
        }

        let mut tasks = Vec::with_capacity(requests.len());
        for (index, request) in requests.into_iter().enumerate() {
            let task = request
                .into_task(now)
                .and_then(|task| self.check_aggregator(&task).map(|_| task))
                .map_err(|err| match err {
                    RollupError::Validation(message) => {
                        RollupError::Validation(format!("request[{}]: {}", index, message))
                    }
                    other => other,
                })?;
            if tasks.iter().any(|existing: &RollupTask| existing.id == task.id) {
                return Err(RollupError::Validation(format!(
                    "request[{}]: duplicate task id '{}'",
                    index, task.id
                )));
            }
            self.warn_if_schedule_outpaces_poll(&task);
            tasks.push(task);
        }

        self.store.write(&tasks).await?;
        log::info!("Created {} rollup task(s)", tasks.len());
        self.wake_manager();
        Ok(tasks)
    }

    pub async fn list(&self) -> RollupResult<Vec<RollupTask>> {
        self.store.read().await
    }

    pub async fn get(&self, task_id: &str) -> RollupResult<RollupTask> {
        self.store
            .get(task_id)
            .await?
            .ok_or_else(|| RollupError::NotFound(task_id.to_string()))
    }

    pub async fn status(&self, task_id: &str) -> RollupResult<RollupTaskStatus> {
        let task = self.get(task_id).await?;
        let cursor = self.store.read_cursor(task_id).await?;
        let recent_runs = self.store.list_runs(task_id, STATUS_RECENT_RUNS).await?;
        Ok(RollupTaskStatus {
            task,
            cursor,
            recent_runs,
        })
    }

    pub async fn list_runs(&self, task_id: &str, limit: i64) -> RollupResult<Vec<RollupRun>> {
        self.get(task_id).await?;
        self.store.list_runs(task_id, limit).await
    }

    pub async fn delete(&self, task_id: &str) -> RollupResult<()> {
        self.store.delete(task_id).await?;
        log::info!("Deleted rollup task '{}'", task_id);
        Ok(())
    }

    /// Replaces the given fields. A changed window length re-aligns the
    /// cursor to the new window boundary at or before its position;
    /// re-enabling clears the retry state left by the disable. Definition and
    /// cursor change together or not at all.
    pub async fn update(
        &self,
        request: UpdateRollupTaskRequest,
        now: DateTime<Utc>,
    ) -> RollupResult<RollupTask> {
        request.validate()?;
        let mut conflicts = 0;
        let updated = loop {
            match self.try_update(&request, now).await {
                Err(RollupError::CursorConflict(task_id)) if conflicts < UPDATE_CONFLICT_RETRIES => {
                    conflicts += 1;
                    log::debug!(
                        "Cursor of rollup task '{}' moved during update, retrying ({}/{})",
                        task_id,
                        conflicts,
                        UPDATE_CONFLICT_RETRIES
                    );
                }
                result => break result?,
            }
        };

        self.warn_if_schedule_outpaces_poll(&updated);
        self.wake_manager();
        Ok(updated)
    }

    async fn try_update(
        &self,
        request: &UpdateRollupTaskRequest,
        now: DateTime<Utc>,
    ) -> RollupResult<RollupTask> {
        let existing = self.get(&request.task_id).await?;
        let updated = request.apply_to(&existing, now)?;
        self.check_aggregator(&updated)?;

        let window_changed = updated.window_seconds != existing.window_seconds;
        let re_enabled = request.enabled == Some(true) && !existing.enabled;
        let cursor_swap = if window_changed || re_enabled {
            let cursor = self.store.read_cursor(&updated.id).await?;
            let next = if window_changed {
                cursor.realigned(updated.window_seconds, now)
            } else {
                cursor.advanced_to(cursor.position, now)
            };
            Some((cursor, next))
        } else {
            None
        };

        let swapped = self
            .store
            .update(
                &updated,
                request.enabled.is_some(),
                cursor_swap.as_ref().map(|(expected, next)| (expected, next)),
            )
            .await?;
        if let (true, Some(cursor)) = (window_changed, swapped) {
            log::info!(
                "Re-aligned cursor of rollup task '{}' to {}",
                updated.id,
                cursor.position.to_rfc3339()
            );
        }

        // Enabled state may have been changed by a manager since `existing`
        // was read.
        self.get(&updated.id).await
    }

    fn check_aggregator(&self, task: &RollupTask) -> RollupResult<()> {
        self.aggregators
            .validate(&task.aggregator)
            .map_err(|err| match err {
                AggregatorError::Unknown(_) => RollupError::Validation(format!(
                    "{} (available: {})",
                    err,
                    self.aggregators.names().join(", ")
                )),
                other => RollupError::Validation(other.to_string()),
            })
    }

    fn warn_if_schedule_outpaces_poll(&self, task: &RollupTask) {
        let period = finest_period_seconds(&task.schedule);
        if period > 0 && (period as u64) < self.poll_interval_seconds {
            log::warn!(
                "Rollup task '{}' fires every {}s but the manager polls every {}s; windows will be picked up late",
                task.id,
                period,
                self.poll_interval_seconds
            );
        }
    }

    fn wake_manager(&self) {
        if let Some(wake) = &self.wake {
            wake.notify_one();
        }
    }
}

#[cfg(test)]
mod tests;
