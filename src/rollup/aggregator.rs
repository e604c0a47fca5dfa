use crate::rollup::models::{AggregatorRef, DataPoint, Window};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AggregatorError {
    #[error("unknown aggregator '{0}'")]
    Unknown(String),
    #[error("invalid aggregator params: {0}")]
    InvalidParams(String),
}

/// Reduces the raw points of one granularity bucket to zero or more output
/// points. Implementations must only emit timestamps inside `bucket`.
pub trait Aggregator: Send + Sync {
    fn validate_params(&self, _params: &Value) -> Result<(), AggregatorError> {
        Ok(())
    }

    fn aggregate(
        &self,
        bucket: &Window,
        points: &[DataPoint],
        params: &Value,
    ) -> Result<Vec<DataPoint>, AggregatorError>;
}

#[derive(Clone)]
pub struct AggregatorRegistry {
    aggregators: HashMap<String, Arc<dyn Aggregator>>,
}

impl Default for AggregatorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl AggregatorRegistry {
    pub fn empty() -> Self {
        Self {
            aggregators: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("sum", Arc::new(Reduce(sum)));
        registry.register("avg", Arc::new(Reduce(avg)));
        registry.register("min", Arc::new(Reduce(min)));
        registry.register("max", Arc::new(Reduce(max)));
        registry.register("count", Arc::new(Reduce(count)));
        registry.register("percentile", Arc::new(Percentile));
        registry
    }

    pub fn register(&mut self, name: &str, aggregator: Arc<dyn Aggregator>) {
        self.aggregators
            .insert(name.trim().to_ascii_lowercase(), aggregator);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Aggregator>, AggregatorError> {
        self.aggregators
            .get(&name.trim().to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| AggregatorError::Unknown(name.to_string()))
    }

    pub fn validate(&self, reference: &AggregatorRef) -> Result<(), AggregatorError> {
        self.get(&reference.name)?.validate_params(&reference.params)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names = self.aggregators.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }
}

struct Reduce(fn(&[f64]) -> f64);

impl Aggregator for Reduce {
    fn aggregate(
        &self,
        bucket: &Window,
        points: &[DataPoint],
        _params: &Value,
    ) -> Result<Vec<DataPoint>, AggregatorError> {
        if points.is_empty() {
            return Ok(Vec::new());
        }
        let values = points.iter().map(|point| point.value).collect::<Vec<_>>();
        Ok(vec![DataPoint::new(bucket.start, (self.0)(&values))])
    }
}

fn sum(values: &[f64]) -> f64 {
    values.iter().sum()
}

fn avg(values: &[f64]) -> f64 {
    sum(values) / values.len() as f64
}

fn min(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::INFINITY, f64::min)
}

fn max(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

fn count(values: &[f64]) -> f64 {
    values.len() as f64
}

struct Percentile;

impl Percentile {
    fn rank(params: &Value) -> Result<f64, AggregatorError> {
        let rank = params
            .get("percentile")
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                AggregatorError::InvalidParams("percentile requires a numeric 'percentile'".to_string())
            })?;
        if !(0.0..=1.0).contains(&rank) {
            return Err(AggregatorError::InvalidParams(format!(
                "percentile must be within [0, 1], got {}",
                rank
            )));
        }
        Ok(rank)
    }
}

impl Aggregator for Percentile {
    fn validate_params(&self, params: &Value) -> Result<(), AggregatorError> {
        Self::rank(params).map(|_| ())
    }

    fn aggregate(
        &self,
        bucket: &Window,
        points: &[DataPoint],
        params: &Value,
    ) -> Result<Vec<DataPoint>, AggregatorError> {
        let rank = Self::rank(params)?;
        if points.is_empty() {
            return Ok(Vec::new());
        }

        let mut values = points.iter().map(|point| point.value).collect::<Vec<_>>();
        values.sort_by(f64::total_cmp);
        let position = rank * (values.len() - 1) as f64;
        let lower = position.floor() as usize;
        let upper = position.ceil() as usize;
        let fraction = position - lower as f64;
        let value = values[lower] + (values[upper] - values[lower]) * fraction;

        Ok(vec![DataPoint::new(bucket.start, value)])
    }
}
