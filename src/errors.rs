use thiserror::Error;

#[derive(Debug, Error)]
pub enum RollupError {
    #[error("VALIDATION: {0}")]
    Validation(String),
    #[error("STORE_FAULT: {0}")]
    Store(String),
    #[error("NOT_FOUND: rollup task '{0}'")]
    NotFound(String),
    #[error("CURSOR_CONFLICT: cursor for task '{0}' was advanced by another writer")]
    CursorConflict(String),
    #[error("LEASE_EXPIRED: lease for task '{0}' is no longer held")]
    LeaseExpired(String),
    #[error("CONFIG: {0}")]
    Config(String),
}

impl RollupError {
    /// Store faults are the only errors worth retrying from the caller side.
    pub fn is_store_fault(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

impl From<sqlx::Error> for RollupError {
    fn from(value: sqlx::Error) -> Self {
        Self::Store(value.to_string())
    }
}

impl From<serde_json::Error> for RollupError {
    fn from(value: serde_json::Error) -> Self {
        Self::Store(value.to_string())
    }
}

impl From<std::io::Error> for RollupError {
    fn from(value: std::io::Error) -> Self {
        Self::Store(value.to_string())
    }
}

pub type RollupResult<T> = Result<T, RollupError>;
