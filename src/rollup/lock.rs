use crate::errors::{RollupError, RollupResult};
use chrono::{DateTime, Duration, Utc};
use sqlx::{Pool, Row, Sqlite};
use std::time::Instant;

/// Wall time used to stamp leases. Starts at `origin` and advances with the
/// monotonic clock, so every acquire and renewal during a long drain is
/// stamped at the moment it actually happens.
#[derive(Debug, Clone, Copy)]
pub struct LeaseClock {
    origin: DateTime<Utc>,
    anchor: Instant,
}

impl LeaseClock {
    pub fn starting_at(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            anchor: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.origin
            + Duration::from_std(self.anchor.elapsed()).unwrap_or_else(|_| Duration::zero())
    }
}

/// Proof of a held lease. Only the holder that acquired it can renew or
/// release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    pub task_id: String,
    pub holder: String,
    pub lease_id: String,
    pub lease: Duration,
    pub lease_until: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired(LeaseToken),
    /// Someone else holds an unexpired lease. Expected under multi-node
    /// deployments, not an error.
    Busy {
        holder: String,
        lease_until: DateTime<Utc>,
    },
}

/// Per-task mutual exclusion over the shared store. Records always carry an
/// expiry so a crashed holder blocks its task for at most one lease period.
#[derive(Clone)]
pub struct ExecutionLock {
    pool: Pool<Sqlite>,
}

impl ExecutionLock {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn acquire(
        &self,
        task_id: &str,
        holder: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> RollupResult<LockAttempt> {
        if lease <= Duration::zero() {
            return Err(RollupError::Validation(
                "lease duration must be positive".to_string(),
            ));
        }

        let now_ms = now.timestamp_millis();
        let lease_until = now + lease;
        let lease_id = uuid::Uuid::new_v4().to_string();

        // The upsert only overwrites a record whose lease already ran out, so
        // of two racing callers at most one sees a changed row.
        let result = sqlx::query(
            r#"
            INSERT INTO rollup_locks (task_id, holder, lease_id, lease_until_ms, acquired_at_ms)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(task_id) DO UPDATE SET
                holder = excluded.holder,
                lease_id = excluded.lease_id,
                lease_until_ms = excluded.lease_until_ms,
                acquired_at_ms = excluded.acquired_at_ms
            WHERE rollup_locks.lease_until_ms <= ?
            "#,
        )
        .bind(task_id)
        .bind(holder)
        .bind(&lease_id)
        .bind(lease_until.timestamp_millis())
        .bind(now_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            RollupError::Store(format!("Failed to acquire lock for '{}': {}", task_id, e))
        })?;

        if result.rows_affected() == 1 {
            return Ok(LockAttempt::Acquired(LeaseToken {
                task_id: task_id.to_string(),
                holder: holder.to_string(),
                lease_id,
                lease,
                lease_until: millis_to_datetime(lease_until.timestamp_millis()),
            }));
        }

        let row = sqlx::query("SELECT holder, lease_until_ms FROM rollup_locks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                RollupError::Store(format!("Failed to inspect lock for '{}': {}", task_id, e))
            })?;

        match row {
            Some(row) => Ok(LockAttempt::Busy {
                holder: row.try_get("holder")?,
                lease_until: millis_to_datetime(row.try_get("lease_until_ms")?),
            }),
            // Released between the upsert and the read; report busy and let
            // the next wake retry.
            None => Ok(LockAttempt::Busy {
                holder: String::new(),
                lease_until: now,
            }),
        }
    }

    /// Extends a still-live lease by its original duration from `now`.
    pub async fn renew(&self, token: &LeaseToken, now: DateTime<Utc>) -> RollupResult<LeaseToken> {
        let lease_until = now + token.lease;
        let result = sqlx::query(
            r#"
            UPDATE rollup_locks
            SET lease_until_ms = ?
            WHERE task_id = ? AND holder = ? AND lease_id = ? AND lease_until_ms > ?
            "#,
        )
        .bind(lease_until.timestamp_millis())
        .bind(&token.task_id)
        .bind(&token.holder)
        .bind(&token.lease_id)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            RollupError::Store(format!(
                "Failed to renew lock for '{}': {}",
                token.task_id, e
            ))
        })?;

        if result.rows_affected() == 0 {
            return Err(RollupError::LeaseExpired(token.task_id.clone()));
        }

        Ok(LeaseToken {
            lease_until: millis_to_datetime(lease_until.timestamp_millis()),
            ..token.clone()
        })
    }

    /// Drops the record if it still belongs to `token`; a lease that was
    /// already taken over is left untouched.
    pub async fn release(&self, token: &LeaseToken) -> RollupResult<()> {
        sqlx::query("DELETE FROM rollup_locks WHERE task_id = ? AND holder = ? AND lease_id = ?")
            .bind(&token.task_id)
            .bind(&token.holder)
            .bind(&token.lease_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                RollupError::Store(format!(
                    "Failed to release lock for '{}': {}",
                    token.task_id, e
                ))
            })?;
        Ok(())
    }

    pub async fn current_holder(
        &self,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> RollupResult<Option<String>> {
        let row = sqlx::query(
            "SELECT holder FROM rollup_locks WHERE task_id = ? AND lease_until_ms > ?",
        )
        .bind(task_id)
        .bind(now.timestamp_millis())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            RollupError::Store(format!("Failed to inspect lock for '{}': {}", task_id, e))
        })?;

        row.map(|row| row.try_get::<String, _>("holder"))
            .transpose()
            .map_err(RollupError::from)
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests;
