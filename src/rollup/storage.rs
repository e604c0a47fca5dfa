use crate::errors::{RollupError, RollupResult};
use crate::rollup::lock::ExecutionLock;
use crate::rollup::models::{
    AggregatorRef, ExecutionCursor, RetryPolicy, RollupRun, RollupTask, RunStatus, Schedule,
    SourceQuery,
};
use chrono::{DateTime, Duration, Utc};
use sqlx::{Pool, Row, Sqlite, SqliteConnection};

const RUN_HISTORY_RETENTION_DAYS_MIN: i64 = 1;
const RUN_HISTORY_RETENTION_DAYS_MAX: i64 = 3650;

#[derive(Clone)]
pub struct RollupStore {
    pool: Pool<Sqlite>,
}

impl RollupStore {
    pub async fn new(pool: Pool<Sqlite>) -> RollupResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> RollupResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rollup_tasks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                source TEXT NOT NULL,
                window_seconds INTEGER NOT NULL,
                granularity_seconds INTEGER NOT NULL,
                aggregator TEXT NOT NULL,
                destination_metric TEXT NOT NULL,
                schedule_kind TEXT NOT NULL,
                schedule_interval_seconds INTEGER,
                schedule_cron TEXT,
                retry_max_attempts INTEGER NOT NULL,
                retry_backoff_ms INTEGER NOT NULL,
                start_at INTEGER,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS rollup_cursors (
                task_id TEXT PRIMARY KEY,
                position INTEGER NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 0,
                next_attempt_at INTEGER,
                last_error TEXT,
                version INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY (task_id) REFERENCES rollup_tasks(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS rollup_locks (
                task_id TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                lease_id TEXT NOT NULL,
                lease_until_ms INTEGER NOT NULL,
                acquired_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS rollup_runs (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                window_start INTEGER NOT NULL,
                window_end INTEGER NOT NULL,
                status TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 0,
                points_written INTEGER NOT NULL DEFAULT 0,
                holder TEXT NOT NULL,
                error_message TEXT,
                started_at INTEGER NOT NULL,
                finished_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS rollup_task_tombstones (
                id TEXT PRIMARY KEY,
                deleted_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_rollup_tasks_created ON rollup_tasks(created_at ASC);
            CREATE INDEX IF NOT EXISTS idx_rollup_runs_task_started ON rollup_runs(task_id, started_at DESC);
            CREATE INDEX IF NOT EXISTS idx_rollup_runs_finished ON rollup_runs(finished_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| store_fault("Failed to init rollup schema", e))?;

        Ok(())
    }

    /// Lease lock backed by the same database as the task definitions.
    pub fn execution_lock(&self) -> ExecutionLock {
        ExecutionLock::new(self.pool.clone())
    }

    /// Upserts `tasks` in one transaction; either every task is persisted or
    /// none is. Cursors are created for new ids and left alone otherwise.
    pub async fn write(&self, tasks: &[RollupTask]) -> RollupResult<()> {
        if tasks.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_fault("Failed to begin rollup write", e))?;

        for task in tasks {
            let tombstoned = sqlx::query("SELECT id FROM rollup_task_tombstones WHERE id = ?")
                .bind(&task.id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| store_fault("Failed to check task tombstones", e))?;
            if tombstoned.is_some() {
                return Err(RollupError::Validation(format!(
                    "Task id '{}' belonged to a deleted task and cannot be reused",
                    task.id
                )));
            }

            let source = serde_json::to_string(&task.source)?;
            let aggregator = serde_json::to_string(&task.aggregator)?;

            sqlx::query(
                r#"
                INSERT INTO rollup_tasks (
                    id, name, enabled, source, window_seconds, granularity_seconds, aggregator,
                    destination_metric, schedule_kind, schedule_interval_seconds, schedule_cron,
                    retry_max_attempts, retry_backoff_ms, start_at, last_error, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    enabled = excluded.enabled,
                    source = excluded.source,
                    window_seconds = excluded.window_seconds,
                    granularity_seconds = excluded.granularity_seconds,
                    aggregator = excluded.aggregator,
                    destination_metric = excluded.destination_metric,
                    schedule_kind = excluded.schedule_kind,
                    schedule_interval_seconds = excluded.schedule_interval_seconds,
                    schedule_cron = excluded.schedule_cron,
                    retry_max_attempts = excluded.retry_max_attempts,
                    retry_backoff_ms = excluded.retry_backoff_ms,
                    start_at = excluded.start_at,
                    last_error = excluded.last_error,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&task.id)
            .bind(&task.name)
            .bind(if task.enabled { 1 } else { 0 })
            .bind(source)
            .bind(task.window_seconds)
            .bind(task.granularity_seconds)
            .bind(aggregator)
            .bind(&task.destination_metric)
            .bind(task.schedule.as_str())
            .bind(task.schedule.interval_seconds())
            .bind(task.schedule.cron_expression())
            .bind(task.retry_policy.max_attempts as i64)
            .bind(task.retry_policy.backoff_ms as i64)
            .bind(task.start_at.map(|v| v.timestamp()))
            .bind(&task.last_error)
            .bind(task.created_at.timestamp())
            .bind(task.updated_at.timestamp())
            .execute(&mut *tx)
            .await
            .map_err(|e| store_fault(&format!("Failed to write rollup task '{}'", task.id), e))?;

            sqlx::query(
                r#"
                INSERT OR IGNORE INTO rollup_cursors (
                    task_id, position, attempt, next_attempt_at, last_error, version, updated_at
                ) VALUES (?, ?, 0, NULL, NULL, 0, ?)
                "#,
            )
            .bind(&task.id)
            .bind(task.initial_cursor_position().timestamp())
            .bind(task.updated_at.timestamp())
            .execute(&mut *tx)
            .await
            .map_err(|e| store_fault(&format!("Failed to create cursor for '{}'", task.id), e))?;
        }

        tx.commit()
            .await
            .map_err(|e| store_fault("Failed to commit rollup write", e))?;
        Ok(())
    }

    /// Rewrites an existing definition. When `cursor` holds an expected and a
    /// replacement cursor, the swap happens in the same transaction and a
    /// cursor that moved in the meantime rolls everything back with
    /// `CursorConflict`. `enabled` and `last_error` are left as stored unless
    /// `set_enabled` is true.
    pub async fn update(
        &self,
        task: &RollupTask,
        set_enabled: bool,
        cursor: Option<(&ExecutionCursor, &ExecutionCursor)>,
    ) -> RollupResult<Option<ExecutionCursor>> {
        let source = serde_json::to_string(&task.source)?;
        let aggregator = serde_json::to_string(&task.aggregator)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_fault("Failed to begin rollup update", e))?;

        let result = sqlx::query(
            r#"
            UPDATE rollup_tasks SET
                name = ?,
                source = ?,
                window_seconds = ?,
                granularity_seconds = ?,
                aggregator = ?,
                destination_metric = ?,
                schedule_kind = ?,
                schedule_interval_seconds = ?,
                schedule_cron = ?,
                retry_max_attempts = ?,
                retry_backoff_ms = ?,
                enabled = CASE WHEN ? = 1 THEN ? ELSE enabled END,
                last_error = CASE WHEN ? = 1 THEN ? ELSE last_error END,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&task.name)
        .bind(source)
        .bind(task.window_seconds)
        .bind(task.granularity_seconds)
        .bind(aggregator)
        .bind(&task.destination_metric)
        .bind(task.schedule.as_str())
        .bind(task.schedule.interval_seconds())
        .bind(task.schedule.cron_expression())
        .bind(task.retry_policy.max_attempts as i64)
        .bind(task.retry_policy.backoff_ms as i64)
        .bind(if set_enabled { 1 } else { 0 })
        .bind(if task.enabled { 1 } else { 0 })
        .bind(if set_enabled { 1 } else { 0 })
        .bind(&task.last_error)
        .bind(task.updated_at.timestamp())
        .bind(&task.id)
        .execute(&mut *tx)
        .await
        .map_err(|e| store_fault(&format!("Failed to update rollup task '{}'", task.id), e))?;
        if result.rows_affected() == 0 {
            return Err(RollupError::NotFound(task.id.clone()));
        }

        let swapped = match cursor {
            Some((expected, next)) => Some(swap_cursor_on(&mut tx, expected, next).await?),
            None => None,
        };

        tx.commit()
            .await
            .map_err(|e| store_fault("Failed to commit rollup update", e))?;
        Ok(swapped)
    }

    pub async fn read(&self) -> RollupResult<Vec<RollupTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM rollup_tasks ORDER BY created_at ASC, id ASC",
            TASK_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_fault("Failed to read rollup tasks", e))?;

        rows.iter().map(Self::row_to_task).collect()
    }

    pub async fn get(&self, task_id: &str) -> RollupResult<Option<RollupTask>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM rollup_tasks WHERE id = ?",
            TASK_COLUMNS
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_fault(&format!("Failed to get rollup task '{}'", task_id), e))?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    pub async fn read_cursor(&self, task_id: &str) -> RollupResult<ExecutionCursor> {
        let row = sqlx::query(
            r#"
            SELECT task_id, position, attempt, next_attempt_at, last_error, version, updated_at
            FROM rollup_cursors
            WHERE task_id = ?
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_fault(&format!("Failed to read cursor for '{}'", task_id), e))?;

        match row {
            Some(row) => Self::row_to_cursor(&row),
            None => Err(RollupError::NotFound(task_id.to_string())),
        }
    }

    /// Compare-and-set against `expected.version`. The position may only move
    /// forward; the returned cursor carries the new version.
    pub async fn write_cursor(
        &self,
        expected: &ExecutionCursor,
        next: &ExecutionCursor,
    ) -> RollupResult<ExecutionCursor> {
        if next.task_id != expected.task_id {
            return Err(RollupError::Validation(format!(
                "Cursor task mismatch: '{}' vs '{}'",
                expected.task_id, next.task_id
            )));
        }
        if next.position < expected.position {
            return Err(RollupError::Validation(format!(
                "Cursor for '{}' cannot move backward from {} to {}",
                expected.task_id,
                expected.position.to_rfc3339(),
                next.position.to_rfc3339()
            )));
        }
        self.swap_cursor(expected, next).await
    }

    /// Moves the cursor to the nearest `window_seconds` boundary at or before
    /// its current position. Only used when a task's window length changes.
    pub async fn realign_cursor(
        &self,
        expected: &ExecutionCursor,
        window_seconds: i64,
        now: DateTime<Utc>,
    ) -> RollupResult<ExecutionCursor> {
        self.swap_cursor(expected, &expected.realigned(window_seconds, now))
            .await
    }

    async fn swap_cursor(
        &self,
        expected: &ExecutionCursor,
        next: &ExecutionCursor,
    ) -> RollupResult<ExecutionCursor> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| store_fault("Failed to acquire connection for cursor write", e))?;
        swap_cursor_on(&mut conn, expected, next).await
    }

    pub async fn set_enabled(
        &self,
        task_id: &str,
        enabled: bool,
        last_error: Option<&str>,
        now: DateTime<Utc>,
    ) -> RollupResult<()> {
        let result = sqlx::query(
            "UPDATE rollup_tasks SET enabled = ?, last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(if enabled { 1 } else { 0 })
        .bind(last_error)
        .bind(now.timestamp())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(|e| store_fault(&format!("Failed to update task '{}'", task_id), e))?;

        if result.rows_affected() == 0 {
            return Err(RollupError::NotFound(task_id.to_string()));
        }
        Ok(())
    }

    /// Removes the definition, its cursor, any lock record and its run
    /// history, and tombstones the id.
    pub async fn delete(&self, task_id: &str) -> RollupResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_fault("Failed to begin rollup delete", e))?;

        let result = sqlx::query("DELETE FROM rollup_tasks WHERE id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| store_fault(&format!("Failed to delete task '{}'", task_id), e))?;
        if result.rows_affected() == 0 {
            return Err(RollupError::NotFound(task_id.to_string()));
        }

        for statement in [
            "DELETE FROM rollup_cursors WHERE task_id = ?",
            "DELETE FROM rollup_locks WHERE task_id = ?",
            "DELETE FROM rollup_runs WHERE task_id = ?",
        ] {
            sqlx::query(statement)
                .bind(task_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| store_fault(&format!("Failed to delete task '{}'", task_id), e))?;
        }

        sqlx::query("INSERT OR IGNORE INTO rollup_task_tombstones (id, deleted_at) VALUES (?, ?)")
            .bind(task_id)
            .bind(Utc::now().timestamp())
            .execute(&mut *tx)
            .await
            .map_err(|e| store_fault(&format!("Failed to tombstone task '{}'", task_id), e))?;

        tx.commit()
            .await
            .map_err(|e| store_fault("Failed to commit rollup delete", e))?;
        Ok(())
    }

    pub async fn record_run(&self, run: &RollupRun) -> RollupResult<()> {
        sqlx::query(
            r#"
            INSERT INTO rollup_runs (
                id, task_id, window_start, window_end, status, attempt, points_written,
                holder, error_message, started_at, finished_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.task_id)
        .bind(run.window_start.timestamp())
        .bind(run.window_end.timestamp())
        .bind(run.status.as_str())
        .bind(run.attempt as i64)
        .bind(run.points_written)
        .bind(&run.holder)
        .bind(&run.error_message)
        .bind(run.started_at.timestamp())
        .bind(run.finished_at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| store_fault(&format!("Failed to record run for '{}'", run.task_id), e))?;
        Ok(())
    }

    pub async fn list_runs(&self, task_id: &str, limit: i64) -> RollupResult<Vec<RollupRun>> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_id, window_start, window_end, status, attempt, points_written,
                   holder, error_message, started_at, finished_at
            FROM rollup_runs
            WHERE task_id = ?
            ORDER BY started_at DESC, window_start DESC
            LIMIT ?
            "#,
        )
        .bind(task_id)
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_fault("Failed to list rollup runs", e))?;

        rows.iter().map(Self::row_to_run).collect()
    }

    /// Deletes run history that finished more than `retention_days` before `now`.
    pub async fn purge_runs_older_than(
        &self,
        retention_days: i64,
        now: DateTime<Utc>,
    ) -> RollupResult<u64> {
        if !(RUN_HISTORY_RETENTION_DAYS_MIN..=RUN_HISTORY_RETENTION_DAYS_MAX)
            .contains(&retention_days)
        {
            return Err(RollupError::Validation(format!(
                "retention_days must be between {} and {}",
                RUN_HISTORY_RETENTION_DAYS_MIN, RUN_HISTORY_RETENTION_DAYS_MAX
            )));
        }

        let cutoff_ts = (now - Duration::days(retention_days)).timestamp();
        let result = sqlx::query("DELETE FROM rollup_runs WHERE finished_at < ?")
            .bind(cutoff_ts)
            .execute(&self.pool)
            .await
            .map_err(|e| store_fault("Failed to purge rollup runs", e))?;

        Ok(result.rows_affected())
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> RollupResult<RollupTask> {
        let source_raw: String = row.try_get("source")?;
        let aggregator_raw: String = row.try_get("aggregator")?;
        let source: SourceQuery = serde_json::from_str(&source_raw)?;
        let aggregator: AggregatorRef = serde_json::from_str(&aggregator_raw)?;

        let schedule = Schedule::from_db(
            &row.try_get::<String, _>("schedule_kind")?,
            row.try_get("schedule_interval_seconds")?,
            row.try_get("schedule_cron")?,
        )?;
        let retry_max_attempts: i64 = row.try_get("retry_max_attempts")?;
        let retry_backoff_ms: i64 = row.try_get("retry_backoff_ms")?;
        let start_at: Option<i64> = row.try_get("start_at")?;
        let created_at: i64 = row.try_get("created_at")?;
        let updated_at: i64 = row.try_get("updated_at")?;

        Ok(RollupTask {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            enabled: row.try_get::<i64, _>("enabled")? == 1,
            source,
            window_seconds: row.try_get("window_seconds")?,
            granularity_seconds: row.try_get("granularity_seconds")?,
            aggregator,
            destination_metric: row.try_get("destination_metric")?,
            schedule,
            retry_policy: RetryPolicy {
                max_attempts: retry_max_attempts.max(0) as u32,
                backoff_ms: retry_backoff_ms.max(0) as u64,
            },
            start_at: start_at.map(timestamp_to_datetime),
            last_error: row.try_get("last_error")?,
            created_at: timestamp_to_datetime(created_at),
            updated_at: timestamp_to_datetime(updated_at),
        })
    }

    fn row_to_cursor(row: &sqlx::sqlite::SqliteRow) -> RollupResult<ExecutionCursor> {
        let position: i64 = row.try_get("position")?;
        let attempt: i64 = row.try_get("attempt")?;
        let next_attempt_at: Option<i64> = row.try_get("next_attempt_at")?;
        let updated_at: i64 = row.try_get("updated_at")?;

        Ok(ExecutionCursor {
            task_id: row.try_get("task_id")?,
            position: timestamp_to_datetime(position),
            attempt: attempt.max(0) as u32,
            next_attempt_at: next_attempt_at.map(timestamp_to_datetime),
            last_error: row.try_get("last_error")?,
            version: row.try_get("version")?,
            updated_at: timestamp_to_datetime(updated_at),
        })
    }

    fn row_to_run(row: &sqlx::sqlite::SqliteRow) -> RollupResult<RollupRun> {
        let window_start: i64 = row.try_get("window_start")?;
        let window_end: i64 = row.try_get("window_end")?;
        let attempt: i64 = row.try_get("attempt")?;
        let started_at: i64 = row.try_get("started_at")?;
        let finished_at: i64 = row.try_get("finished_at")?;

        Ok(RollupRun {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            window_start: timestamp_to_datetime(window_start),
            window_end: timestamp_to_datetime(window_end),
            status: RunStatus::from_db(&row.try_get::<String, _>("status")?)?,
            attempt: attempt.max(0) as u32,
            points_written: row.try_get("points_written")?,
            holder: row.try_get("holder")?,
            error_message: row.try_get("error_message")?,
            started_at: timestamp_to_datetime(started_at),
            finished_at: timestamp_to_datetime(finished_at),
        })
    }
}

const TASK_COLUMNS: &str = "id, name, enabled, source, window_seconds, granularity_seconds, \
    aggregator, destination_metric, schedule_kind, schedule_interval_seconds, schedule_cron, \
    retry_max_attempts, retry_backoff_ms, start_at, last_error, created_at, updated_at";

pub(crate) fn timestamp_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(ts, 0).unwrap_or_else(Utc::now)
}

/// Compare-and-set of one cursor row on `conn`, which may be a transaction.
async fn swap_cursor_on(
    conn: &mut SqliteConnection,
    expected: &ExecutionCursor,
    next: &ExecutionCursor,
) -> RollupResult<ExecutionCursor> {
    let result = sqlx::query(
        r#"
        UPDATE rollup_cursors
        SET position = ?, attempt = ?, next_attempt_at = ?, last_error = ?,
            version = version + 1, updated_at = ?
        WHERE task_id = ? AND version = ?
        "#,
    )
    .bind(next.position.timestamp())
    .bind(next.attempt as i64)
    .bind(next.next_attempt_at.map(|v| v.timestamp()))
    .bind(&next.last_error)
    .bind(next.updated_at.timestamp())
    .bind(&expected.task_id)
    .bind(expected.version)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        store_fault(
            &format!("Failed to write cursor for '{}'", expected.task_id),
            e,
        )
    })?;

    if result.rows_affected() == 0 {
        // Distinguish a vanished task from a lost race.
        let exists = sqlx::query("SELECT task_id FROM rollup_cursors WHERE task_id = ?")
            .bind(&expected.task_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| {
                store_fault(
                    &format!("Failed to read cursor for '{}'", expected.task_id),
                    e,
                )
            })?;
        return match exists {
            Some(_) => Err(RollupError::CursorConflict(expected.task_id.clone())),
            None => Err(RollupError::NotFound(expected.task_id.clone())),
        };
    }

    let mut written = next.clone();
    written.version = expected.version + 1;
    Ok(written)
}

fn store_fault(context: &str, err: sqlx::Error) -> RollupError {
    RollupError::Store(format!("{}: {}", context, err))
}
