//! Fakes and fixtures shared by the rollup unit tests.

use crate::rollup::models::{
    AggregatorRef, CreateRollupTaskRequest, DataPoint, RetryPolicy, RollupTask, Schedule,
    SourceQuery, Window,
};
use crate::rollup::source::{AlertSink, DataSink, DataSource, SinkError, SourceError};
use crate::rollup::storage::RollupStore;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub fn fixed_ts(y: i32, m: u32, d: u32, hh: u32, mm: u32, ss: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, hh, mm, ss)
        .single()
        .expect("valid timestamp")
}

pub async fn memory_store() -> RollupStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("sqlite memory pool");
    RollupStore::new(pool).await.expect("rollup store")
}

/// Hourly `avg` roll-up of `cpu.usage`, created at 2026-01-01 09:00 UTC.
pub fn hourly_task(id: &str) -> RollupTask {
    hourly_request(id)
        .into_task(fixed_ts(2026, 1, 1, 9, 0, 0))
        .expect("valid task")
}

pub fn hourly_request(id: &str) -> CreateRollupTaskRequest {
    CreateRollupTaskRequest {
        id: Some(id.to_string()),
        name: format!("{id} hourly"),
        enabled: true,
        source: SourceQuery {
            metric_name: "cpu.usage".to_string(),
            tags: BTreeMap::new(),
        },
        window_seconds: 3600,
        granularity_seconds: None,
        aggregator: AggregatorRef {
            name: "avg".to_string(),
            params: json!({}),
        },
        destination_metric: "cpu.usage.1h".to_string(),
        schedule: Schedule::Interval { seconds: 3600 },
        retry_policy: RetryPolicy {
            max_attempts: 3,
            backoff_ms: 60_000,
        },
        start_at: None,
    }
}

/// Returns a fixed set of points per query, or the scripted failures first.
#[derive(Default)]
pub struct FakeSource {
    points: Mutex<Vec<DataPoint>>,
    failures: Mutex<VecDeque<SourceError>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl FakeSource {
    pub fn with_points(points: Vec<DataPoint>) -> Self {
        let source = Self::default();
        *source.points.lock().expect("points lock") = points;
        source
    }

    pub fn fail_next(&self, error: SourceError) {
        self.failures.lock().expect("failures lock").push_back(error);
    }

    pub fn delay_by(&self, delay: Duration) {
        *self.delay.lock().expect("delay lock") = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl DataSource for FakeSource {
    async fn query(&self, query: &SourceQuery, range: &Window) -> Result<Vec<DataPoint>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().expect("delay lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.failures.lock().expect("failures lock").pop_front() {
            return Err(error);
        }
        assert!(!query.metric_name.is_empty());
        Ok(self
            .points
            .lock()
            .expect("points lock")
            .iter()
            .filter(|point| range.contains(point.timestamp))
            .copied()
            .collect())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    writes: Mutex<Vec<(String, Vec<DataPoint>)>>,
    failures: Mutex<VecDeque<SinkError>>,
}

impl RecordingSink {
    pub fn fail_next(&self, error: SinkError) {
        self.failures.lock().expect("failures lock").push_back(error);
    }

    pub fn writes(&self) -> Vec<(String, Vec<DataPoint>)> {
        self.writes.lock().expect("writes lock").clone()
    }
}

#[async_trait::async_trait]
impl DataSink for RecordingSink {
    async fn write(&self, metric_name: &str, points: &[DataPoint]) -> Result<(), SinkError> {
        if let Some(error) = self.failures.lock().expect("failures lock").pop_front() {
            return Err(error);
        }
        self.writes
            .lock()
            .expect("writes lock")
            .push((metric_name.to_string(), points.to_vec()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingAlerts {
    alerts: Mutex<Vec<(String, String)>>,
}

impl RecordingAlerts {
    pub fn alerts(&self) -> Vec<(String, String)> {
        self.alerts.lock().expect("alerts lock").clone()
    }
}

impl AlertSink for RecordingAlerts {
    fn notify(&self, task_id: &str, reason: &str) {
        self.alerts
            .lock()
            .expect("alerts lock")
            .push((task_id.to_string(), reason.to_string()));
    }
}

/// One point per minute over `[from, to)` with `value` everywhere.
pub fn minute_points(from: DateTime<Utc>, to: DateTime<Utc>, value: f64) -> Vec<DataPoint> {
    let mut points = Vec::new();
    let mut at = from;
    while at < to {
        points.push(DataPoint::new(at, value));
        at += chrono::Duration::minutes(1);
    }
    points
}
