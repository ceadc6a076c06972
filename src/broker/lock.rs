//! Advisory locks guarding cluster-wide critical sections.
//!
//! Both acquisition operations return a [`Lock`] value that owns the
//! underlying resource: release is guaranteed on every exit path, including
//! failure and cancellation, by dropping the value. Contention is not an
//! error; inspect [`Lock::is_locked`].

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};

/// Interval between acquisition attempts while waiting for a contended lock.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// The 64-bit advisory key for a lock name: the first eight bytes of the
/// SHA-256 of the name. Persistent lock managers key their advisory locks by
/// this value.
pub fn advisory_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);

    i64::from_be_bytes(bytes)
}

/// The outcome of a lock acquisition attempt.
///
/// When `is_locked`, the value holds the acquired resource and dropping it
/// releases the lock.
pub struct Lock {
    name: String,
    locked: bool,
    timed_out: bool,
    wait_time: Duration,
    _guard: Option<Box<dyn Any + Send>>,
}

impl Lock {
    /// A successfully acquired lock owning `guard` until dropped.
    pub fn acquired(name: impl Into<String>, wait_time: Duration, guard: Box<dyn Any + Send>) -> Self {
        Self {
            name: name.into(),
            locked: true,
            timed_out: false,
            wait_time,
            _guard: Some(guard),
        }
    }

    /// A non-blocking attempt that found the lock held elsewhere.
    pub fn unavailable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            locked: false,
            timed_out: false,
            wait_time: Duration::ZERO,
            _guard: None,
        }
    }

    /// A waiting attempt that gave up after `wait_time`.
    pub fn timed_out(name: impl Into<String>, wait_time: Duration) -> Self {
        Self {
            name: name.into(),
            locked: false,
            timed_out: true,
            wait_time,
            _guard: None,
        }
    }

    /// The lock name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the lock was acquired.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Whether a waiting acquisition gave up.
    pub fn is_timed_out(&self) -> bool {
        self.timed_out
    }

    /// How long the acquisition waited.
    pub fn wait_time(&self) -> Duration {
        self.wait_time
    }

    /// Releases the lock explicitly. Equivalent to dropping the value.
    pub fn release(self) {}
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("name", &self.name)
            .field("locked", &self.locked)
            .field("timed_out", &self.timed_out)
            .field("wait_time", &self.wait_time)
            .finish_non_exhaustive()
    }
}

/// All possible error types returned by [`LockManager`] operations.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The manager encountered an infrastructure error.
    #[error("failed to acquire lock, an error occurred: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Scoped acquisition of named, cluster-visible locks.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Attempts to acquire the named lock without blocking.
    async fn try_lock(&self, name: &str) -> Result<Lock, LockError>;

    /// Polls the named lock until acquired or `timeout` elapses. The timeout
    /// is compared against the total elapsed wait.
    async fn wait_for_lock(&self, name: &str, timeout: Option<Duration>)
        -> Result<Lock, LockError>;
}

/// In-memory [`LockManager`], mapping each name to an async mutex with the
/// same scoped-release contract as the persistent implementation.
#[derive(Debug, Default)]
pub struct InMemoryLockManager {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl InMemoryLockManager {
    /// Creates an empty lock manager.
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex_for(&self, name: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn try_lock(&self, name: &str) -> Result<Lock, LockError> {
        match self.mutex_for(name).try_lock_owned() {
            Ok(guard) => Ok(Lock::acquired(name, Duration::ZERO, Box::new(guard))),
            Err(_) => Ok(Lock::unavailable(name)),
        }
    }

    async fn wait_for_lock(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<Lock, LockError> {
        let started = Instant::now();

        loop {
            if let Ok(guard) = self.mutex_for(name).try_lock_owned() {
                return Ok(Lock::acquired(name, started.elapsed(), Box::new(guard)));
            }

            if let Some(timeout) = timeout {
                if started.elapsed() >= timeout {
                    return Ok(Lock::timed_out(name, started.elapsed()));
                }
            }

            sleep(POLL_INTERVAL).await;
        }
    }
}
