use crate::rollup::models::{DataPoint, SourceQuery, Window};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("source query timed out")]
    Timeout,
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("destination write failed: {0}")]
    WriteFault(String),
}

/// Raw series reader of the time-series store.
#[async_trait::async_trait]
pub trait DataSource: Send + Sync {
    async fn query(&self, query: &SourceQuery, range: &Window) -> Result<Vec<DataPoint>, SourceError>;
}

/// Writer for derived series. A successful return means the points are durable.
#[async_trait::async_trait]
pub trait DataSink: Send + Sync {
    async fn write(&self, metric_name: &str, points: &[DataPoint]) -> Result<(), SinkError>;
}

/// Best-effort operator notification; must not block or fail the caller.
pub trait AlertSink: Send + Sync {
    fn notify(&self, task_id: &str, reason: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify(&self, task_id: &str, reason: &str) {
        log::error!("Rollup task '{}' disabled: {}", task_id, reason);
    }
}
