pub mod common;
pub mod config;
pub mod errors;
pub mod rollup;

pub use config::RollupConfig;
pub use errors::{RollupError, RollupResult};
