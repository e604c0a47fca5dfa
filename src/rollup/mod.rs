pub mod aggregator;
pub mod commands;
pub mod lock;
pub mod manager;
pub mod models;
pub mod runner;
pub mod schedule;
pub mod source;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

pub use aggregator::{Aggregator, AggregatorError, AggregatorRegistry};
pub use commands::RollupService;
pub use lock::{ExecutionLock, LeaseClock, LeaseToken, LockAttempt};
pub use manager::{CycleReport, ManagerHandle, RollupManager};
pub use models::*;
pub use runner::{AggregationRunner, Outcome, RunnerSettings};
pub use source::{AlertSink, DataSink, DataSource, LogAlertSink, SinkError, SourceError};
pub use storage::RollupStore;
