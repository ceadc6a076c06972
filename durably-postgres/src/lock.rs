//! Lock manager backed by transaction-scoped Postgres advisory locks.

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use durably::broker::{advisory_key, Lock, LockError, LockManager};
use sqlx::{PgPool, Postgres, Transaction};
use tokio::time::{sleep, Instant};

/// Interval between acquisition attempts while waiting for a contended lock.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// [`LockManager`] using `pg_try_advisory_xact_lock`, keyed by the 64-bit
/// truncation of the SHA-256 of the lock name.
///
/// The returned [`Lock`] owns the transaction the lock was taken in, so the
/// lock is released when the value is dropped on any exit path; a crashed
/// holder auto-releases when the server tears the session down.
#[derive(Debug, Clone)]
pub struct PostgresLockManager {
    pool: PgPool,
}

impl PostgresLockManager {
    /// Creates a lock manager over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, LockError> {
        Ok(self
            .pool
            .begin()
            .await
            .map_err(|err| anyhow!("failed to begin lock transaction: {err}"))?)
    }
}

async fn try_advisory(
    tx: &mut Transaction<'static, Postgres>,
    name: &str,
) -> Result<bool, LockError> {
    Ok(
        sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_xact_lock($1)")
            .bind(advisory_key(name))
            .fetch_one(&mut **tx)
            .await
            .map_err(|err| anyhow!("failed to take advisory lock: {err}"))?,
    )
}

#[async_trait]
impl LockManager for PostgresLockManager {
    async fn try_lock(&self, name: &str) -> Result<Lock, LockError> {
        let mut tx = self.begin().await?;

        if try_advisory(&mut tx, name).await? {
            return Ok(Lock::acquired(name, Duration::ZERO, Box::new(tx)));
        }

        tx.rollback()
            .await
            .map_err(|err| anyhow!("failed to release lock transaction: {err}"))?;

        Ok(Lock::unavailable(name))
    }

    async fn wait_for_lock(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<Lock, LockError> {
        let started = Instant::now();
        let mut tx = self.begin().await?;

        // The timeout is compared against the whole elapsed wait.
        let locked = loop {
            if try_advisory(&mut tx, name).await? {
                break true;
            }

            if let Some(timeout) = timeout {
                if started.elapsed() >= timeout {
                    break false;
                }
            }

            sleep(POLL_INTERVAL).await;
        };

        if locked {
            return Ok(Lock::acquired(name, started.elapsed(), Box::new(tx)));
        }

        tx.rollback()
            .await
            .map_err(|err| anyhow!("failed to release lock transaction: {err}"))?;

        Ok(Lock::timed_out(name, started.elapsed()))
    }
}
