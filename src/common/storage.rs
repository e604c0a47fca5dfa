use crate::errors::{RollupError, RollupResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{ConnectOptions, Pool, Sqlite};
use std::fs;
use std::path::Path;
use std::time::Duration;

const BUSY_TIMEOUT_SECONDS: u64 = 10;

fn build_connect_options(db_path: &Path) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        // WAL lets pollers read while another node commits a cursor
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(BUSY_TIMEOUT_SECONDS))
        .log_statements(log::LevelFilter::Debug)
}

/// Opens (and creates if needed) the SQLite database shared by every manager
/// instance pointing at `db_path`.
pub async fn init_local_db(db_path: &Path, max_connections: u32) -> RollupResult<Pool<Sqlite>> {
    if db_path.as_os_str().is_empty() {
        return Err(RollupError::Config(
            "Database file path is required".to_string(),
        ));
    }

    if let Some(storage_dir) = db_path.parent() {
        if !storage_dir.as_os_str().is_empty() && !storage_dir.exists() {
            fs::create_dir_all(storage_dir)?;
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(300))
        .connect_with(build_connect_options(db_path))
        .await
        .map_err(|e| RollupError::Store(format!("Failed to connect to local DB: {}", e)))?;

    Ok(pool)
}
