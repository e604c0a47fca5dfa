use crate::config::RollupConfig;
use crate::rollup::aggregator::{Aggregator, AggregatorRegistry};
use crate::rollup::lock::{ExecutionLock, LeaseClock, LeaseToken};
use crate::rollup::models::{DataPoint, RollupTask, Window};
use crate::rollup::schedule::align_floor;
use crate::rollup::source::{DataSink, DataSource, SourceError};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};

const MIN_RENEW_INTERVAL_MS: i64 = 1_000;

/// Result of one window execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Output is durably written; the cursor may advance to the window end.
    Success { points_written: usize },
    /// Source or destination hiccup; eligible for retry with backoff.
    TransientFailure(String),
    /// Misconfiguration that retrying cannot fix; the task gets disabled.
    PermanentFailure(String),
    /// The lease could not be renewed; another holder may own the task now.
    LeaseLost(String),
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub query_timeout: Duration,
    pub lease_renew_timeout: Duration,
}

impl From<&RollupConfig> for RunnerSettings {
    fn from(config: &RollupConfig) -> Self {
        Self {
            query_timeout: config.query_timeout(),
            lease_renew_timeout: config.lease_renew_timeout(),
        }
    }
}

pub struct AggregationRunner {
    source: Arc<dyn DataSource>,
    sink: Arc<dyn DataSink>,
    aggregators: Arc<AggregatorRegistry>,
    lock: ExecutionLock,
    settings: RunnerSettings,
}

impl AggregationRunner {
    pub fn new(
        source: Arc<dyn DataSource>,
        sink: Arc<dyn DataSink>,
        aggregators: Arc<AggregatorRegistry>,
        lock: ExecutionLock,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            source,
            sink,
            aggregators,
            lock,
            settings,
        }
    }

    /// Runs `window` for `task` while keeping `lease` alive. Each renewal is
    /// stamped with `clock` at the moment it is sent.
    pub async fn execute(
        &self,
        task: &RollupTask,
        window: &Window,
        lease: &mut LeaseToken,
        clock: &LeaseClock,
    ) -> Outcome {
        let renew_every = renew_interval(lease);
        let mut renew_ticker = interval_at(Instant::now() + renew_every, renew_every);
        renew_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let work = self.run_window(task, window);
        tokio::pin!(work);

        loop {
            tokio::select! {
                outcome = &mut work => return outcome,
                _ = renew_ticker.tick() => {
                    let renewal = self.lock.renew(lease, clock.now());
                    match timeout(self.settings.lease_renew_timeout, renewal).await {
                        Ok(Ok(renewed)) => *lease = renewed,
                        Ok(Err(err)) => {
                            log::warn!(
                                "Abandoning window {} of task '{}': {}",
                                window.start.to_rfc3339(),
                                task.id,
                                err
                            );
                            return Outcome::LeaseLost(err.to_string());
                        }
                        Err(_) => {
                            log::warn!(
                                "Abandoning window {} of task '{}': lease renewal exceeded {}ms",
                                window.start.to_rfc3339(),
                                task.id,
                                self.settings.lease_renew_timeout.as_millis()
                            );
                            return Outcome::LeaseLost(format!(
                                "lease renewal exceeded {}ms",
                                self.settings.lease_renew_timeout.as_millis()
                            ));
                        }
                    }
                }
            }
        }
    }

    async fn run_window(&self, task: &RollupTask, window: &Window) -> Outcome {
        let aggregator = match self.aggregators.get(&task.aggregator.name) {
            Ok(aggregator) => aggregator,
            Err(err) => return Outcome::PermanentFailure(err.to_string()),
        };
        if let Err(err) = aggregator.validate_params(&task.aggregator.params) {
            return Outcome::PermanentFailure(err.to_string());
        }

        let points = match timeout(self.settings.query_timeout, self.source.query(&task.source, window)).await {
            Ok(Ok(points)) => points,
            Ok(Err(err)) => return Outcome::TransientFailure(err.to_string()),
            Err(_) => return Outcome::TransientFailure(SourceError::Timeout.to_string()),
        };

        let output = match aggregate_window(aggregator.as_ref(), task, window, &points) {
            Ok(output) => output,
            Err(reason) => return Outcome::PermanentFailure(reason),
        };

        if output.is_empty() {
            log::debug!(
                "Task '{}' window {} produced no output points",
                task.id,
                window.start.to_rfc3339()
            );
            return Outcome::Success { points_written: 0 };
        }

        match self.sink.write(&task.destination_metric, &output).await {
            Ok(()) => Outcome::Success {
                points_written: output.len(),
            },
            Err(err) => Outcome::TransientFailure(err.to_string()),
        }
    }
}

/// Groups the in-window points into granularity buckets and feeds each
/// non-empty bucket through `aggregator`, oldest bucket first.
pub fn aggregate_window(
    aggregator: &dyn Aggregator,
    task: &RollupTask,
    window: &Window,
    points: &[DataPoint],
) -> Result<Vec<DataPoint>, String> {
    let mut buckets: BTreeMap<DateTime<Utc>, Vec<DataPoint>> = BTreeMap::new();
    for point in points {
        if !window.contains(point.timestamp) || !point.value.is_finite() {
            continue;
        }
        buckets
            .entry(align_floor(point.timestamp, task.granularity_seconds))
            .or_default()
            .push(*point);
    }

    let mut output = Vec::new();
    for (bucket_start, bucket_points) in buckets {
        let bucket = Window::new(bucket_start, bucket_start + task.granularity());
        let produced = aggregator
            .aggregate(&bucket, &bucket_points, &task.aggregator.params)
            .map_err(|e| e.to_string())?;
        for point in produced {
            if !window.contains(point.timestamp) {
                return Err(format!(
                    "aggregator '{}' produced a point at {} outside window [{}, {})",
                    task.aggregator.name,
                    point.timestamp.to_rfc3339(),
                    window.start.to_rfc3339(),
                    window.end.to_rfc3339()
                ));
            }
            output.push(point);
        }
    }

    Ok(output)
}

fn renew_interval(lease: &LeaseToken) -> Duration {
    let millis = (lease.lease.num_milliseconds() / 3).max(MIN_RENEW_INTERVAL_MS);
    Duration::from_millis(millis as u64)
}
