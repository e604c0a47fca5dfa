use crate::errors::{RollupError, RollupResult};
use crate::rollup::schedule::{align_floor, validate_schedule};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 30_000;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    Interval { seconds: i64 },
    Cron { expression: String },
}

impl Schedule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interval { .. } => "interval",
            Self::Cron { .. } => "cron",
        }
    }

    pub fn from_db(
        kind: &str,
        interval_seconds: Option<i64>,
        cron_expression: Option<String>,
    ) -> RollupResult<Self> {
        match kind {
            "interval" => Ok(Self::Interval {
                seconds: interval_seconds.ok_or_else(|| {
                    RollupError::Store("interval schedule without interval_seconds".to_string())
                })?,
            }),
            "cron" => Ok(Self::Cron {
                expression: cron_expression.ok_or_else(|| {
                    RollupError::Store("cron schedule without cron_expression".to_string())
                })?,
            }),
            _ => Err(RollupError::Store(format!(
                "Invalid schedule kind in storage: {}",
                kind
            ))),
        }
    }

    pub fn interval_seconds(&self) -> Option<i64> {
        match self {
            Self::Interval { seconds } => Some(*seconds),
            Self::Cron { .. } => None,
        }
    }

    pub fn cron_expression(&self) -> Option<&str> {
        match self {
            Self::Interval { .. } => None,
            Self::Cron { expression } => Some(expression.as_str()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Success,
    Retrying,
    Disabled,
    Abandoned,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Retrying => "retrying",
            Self::Disabled => "disabled",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn from_db(value: &str) -> RollupResult<Self> {
        match value {
            "success" => Ok(Self::Success),
            "retrying" => Ok(Self::Retrying),
            "disabled" => Ok(Self::Disabled),
            "abandoned" => Ok(Self::Abandoned),
            _ => Err(RollupError::Store(format!(
                "Invalid run status in storage: {}",
                value
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
        }
    }
}

/// Which raw series feed a roll-up.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourceQuery {
    pub metric_name: String,
    #[serde(default)]
    pub tags: BTreeMap<String, Vec<String>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AggregatorRef {
    pub name: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RollupTask {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub source: SourceQuery,
    pub window_seconds: i64,
    pub granularity_seconds: i64,
    pub aggregator: AggregatorRef,
    pub destination_metric: String,
    pub schedule: Schedule,
    pub retry_policy: RetryPolicy,
    pub start_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RollupTask {
    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_seconds)
    }

    pub fn granularity(&self) -> Duration {
        Duration::seconds(self.granularity_seconds)
    }

    /// Boundary the cursor starts from when the task is first persisted.
    pub fn initial_cursor_position(&self) -> DateTime<Utc> {
        align_floor(self.start_at.unwrap_or(self.created_at), self.window_seconds)
    }

    pub fn validate(&self) -> RollupResult<()> {
        if self.id.trim().is_empty() {
            return Err(RollupError::Validation("Task id cannot be empty".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(RollupError::Validation(
                "Task name cannot be empty".to_string(),
            ));
        }
        if self.source.metric_name.trim().is_empty() {
            return Err(RollupError::Validation(
                "source.metricName cannot be empty".to_string(),
            ));
        }
        for (tag, values) in &self.source.tags {
            if tag.trim().is_empty() {
                return Err(RollupError::Validation(
                    "source tag names cannot be empty".to_string(),
                ));
            }
            if values.is_empty() {
                return Err(RollupError::Validation(format!(
                    "source tag '{}' requires at least one value",
                    tag
                )));
            }
        }
        if self.window_seconds <= 0 {
            return Err(RollupError::Validation(
                "windowSeconds must be > 0".to_string(),
            ));
        }
        if self.granularity_seconds <= 0 {
            return Err(RollupError::Validation(
                "granularitySeconds must be > 0".to_string(),
            ));
        }
        if self.granularity_seconds > self.window_seconds
            || self.window_seconds % self.granularity_seconds != 0
        {
            return Err(RollupError::Validation(format!(
                "granularitySeconds ({}) must evenly divide windowSeconds ({})",
                self.granularity_seconds, self.window_seconds
            )));
        }
        if self.aggregator.name.trim().is_empty() {
            return Err(RollupError::Validation(
                "aggregator.name cannot be empty".to_string(),
            ));
        }
        if self.destination_metric.trim().is_empty() {
            return Err(RollupError::Validation(
                "destinationMetric cannot be empty".to_string(),
            ));
        }
        if self.destination_metric.trim() == self.source.metric_name.trim() {
            return Err(RollupError::Validation(
                "destinationMetric must differ from the source metric".to_string(),
            ));
        }
        if self.retry_policy.max_attempts == 0 {
            return Err(RollupError::Validation(
                "retryPolicy.maxAttempts must be >= 1".to_string(),
            ));
        }
        validate_schedule(&self.schedule)
    }
}

/// Durable high-water mark of completed aggregation for one task.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionCursor {
    pub task_id: String,
    pub position: DateTime<Utc>,
    pub attempt: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionCursor {
    pub fn advanced_to(&self, position: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            task_id: self.task_id.clone(),
            position,
            attempt: 0,
            next_attempt_at: None,
            last_error: None,
            version: self.version,
            updated_at: now,
        }
    }

    /// Moves back to the `window_seconds` boundary at or before the current
    /// position with a clean retry state.
    pub fn realigned(&self, window_seconds: i64, now: DateTime<Utc>) -> Self {
        self.advanced_to(align_floor(self.position, window_seconds), now)
    }

    pub fn failed_attempt(
        &self,
        reason: &str,
        next_attempt_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: self.task_id.clone(),
            position: self.position,
            attempt: self.attempt.saturating_add(1),
            next_attempt_at,
            last_error: Some(reason.to_string()),
            version: self.version,
            updated_at: now,
        }
    }
}

/// Half-open interval `[start, end)` covered by one execution.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl DataPoint {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RollupRun {
    pub id: String,
    pub task_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub status: RunStatus,
    pub attempt: u32,
    pub points_written: i64,
    pub holder: String,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RollupTaskStatus {
    pub task: RollupTask,
    pub cursor: ExecutionCursor,
    pub recent_runs: Vec<RollupRun>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateRollupTaskRequest {
    /// Caller-chosen id; a UUID is generated when absent.
    pub id: Option<String>,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub source: SourceQuery,
    pub window_seconds: i64,
    /// Defaults to the window length (one output point per window).
    pub granularity_seconds: Option<i64>,
    pub aggregator: AggregatorRef,
    pub destination_metric: String,
    pub schedule: Schedule,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    pub start_at: Option<DateTime<Utc>>,
}

impl CreateRollupTaskRequest {
    pub fn into_task(self, now: DateTime<Utc>) -> RollupResult<RollupTask> {
        let id = match self.id.map(|value| value.trim().to_string()) {
            Some(id) if !id.is_empty() => id,
            Some(_) => {
                return Err(RollupError::Validation(
                    "Task id cannot be blank when provided".to_string(),
                ))
            }
            None => uuid::Uuid::new_v4().to_string(),
        };

        let task = RollupTask {
            id,
            name: self.name.trim().to_string(),
            enabled: self.enabled,
            source: normalize_source(self.source),
            window_seconds: self.window_seconds,
            granularity_seconds: self.granularity_seconds.unwrap_or(self.window_seconds),
            aggregator: AggregatorRef {
                name: self.aggregator.name.trim().to_ascii_lowercase(),
                params: self.aggregator.params,
            },
            destination_metric: self.destination_metric.trim().to_string(),
            schedule: self.schedule,
            retry_policy: self.retry_policy,
            start_at: self.start_at,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        task.validate()?;
        Ok(task)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRollupTaskRequest {
    pub task_id: String,
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub source: Option<SourceQuery>,
    pub window_seconds: Option<i64>,
    pub granularity_seconds: Option<i64>,
    pub aggregator: Option<AggregatorRef>,
    pub destination_metric: Option<String>,
    pub schedule: Option<Schedule>,
    pub retry_policy: Option<RetryPolicy>,
}

impl UpdateRollupTaskRequest {
    pub fn validate(&self) -> RollupResult<()> {
        if self.task_id.trim().is_empty() {
            return Err(RollupError::Validation("Task id is required".to_string()));
        }
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(RollupError::Validation(
                    "Task name cannot be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Applies the present fields onto `task`; the result is re-validated.
    pub fn apply_to(&self, task: &RollupTask, now: DateTime<Utc>) -> RollupResult<RollupTask> {
        let mut updated = task.clone();
        if let Some(name) = &self.name {
            updated.name = name.trim().to_string();
        }
        if let Some(enabled) = self.enabled {
            updated.enabled = enabled;
            if enabled {
                updated.last_error = None;
            }
        }
        if let Some(source) = &self.source {
            updated.source = normalize_source(source.clone());
        }
        if let Some(window_seconds) = self.window_seconds {
            updated.window_seconds = window_seconds;
            if self.granularity_seconds.is_none()
                && task.granularity_seconds == task.window_seconds
            {
                updated.granularity_seconds = window_seconds;
            }
        }
        if let Some(granularity_seconds) = self.granularity_seconds {
            updated.granularity_seconds = granularity_seconds;
        }
        if let Some(aggregator) = &self.aggregator {
            updated.aggregator = AggregatorRef {
                name: aggregator.name.trim().to_ascii_lowercase(),
                params: aggregator.params.clone(),
            };
        }
        if let Some(destination_metric) = &self.destination_metric {
            updated.destination_metric = destination_metric.trim().to_string();
        }
        if let Some(schedule) = &self.schedule {
            updated.schedule = schedule.clone();
        }
        if let Some(retry_policy) = &self.retry_policy {
            updated.retry_policy = retry_policy.clone();
        }
        updated.updated_at = now;
        updated.validate()?;
        Ok(updated)
    }
}

/// Trims tag names/values and drops duplicate values.
pub fn normalize_source(source: SourceQuery) -> SourceQuery {
    let mut tags = BTreeMap::new();
    for (tag, values) in source.tags {
        let mut out: Vec<String> = Vec::new();
        for value in values {
            let normalized = value.trim().to_string();
            if normalized.is_empty() {
                continue;
            }
            if out.iter().any(|existing| existing == &normalized) {
                continue;
            }
            out.push(normalized);
        }
        tags.insert(tag.trim().to_string(), out);
    }
    SourceQuery {
        metric_name: source.metric_name.trim().to_string(),
        tags,
    }
}

fn default_true() -> bool {
    true
}

fn default_retry_max_attempts() -> u32 {
    DEFAULT_RETRY_MAX_ATTEMPTS
}

fn default_retry_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_MS
}
