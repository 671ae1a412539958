//! Named mutual exclusion used to serialise journal naming.
//!
//! Acquisition is bounded: callers pass the longest they are prepared to
//! wait and receive [`LockError::Timeout`] once that elapses. The returned
//! guard releases the lock when dropped, on every exit path. A name is
//! forgotten once nobody holds or waits for it.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Errors raised while acquiring a named lock.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LockError {
    /// Raised when the lock is still held by someone else after the bound.
    #[error("timed out after {waited_ms} ms waiting for lock {key}")]
    Timeout {
        /// Lock key that could not be acquired.
        key: String,
        /// Milliseconds spent waiting.
        waited_ms: u128,
    },
    /// Raised when the lock service itself is unusable.
    #[error("lock service unavailable: {0}")]
    Unavailable(String),
}

/// Future returned by lock acquisition.
pub type LockFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LockError>> + Send + 'a>>;

/// Interface of the coordination service handing out named locks.
pub trait NamedLockService {
    /// Scoped handle; dropping it releases the lock.
    type Guard: Send;

    /// Acquires the lock named `key`, waiting at most `timeout`.
    fn acquire<'a>(&'a self, key: &'a str, timeout: Duration) -> LockFuture<'a, Self::Guard>;
}

type LockTable = Arc<Mutex<BTreeMap<String, Arc<AsyncMutex<()>>>>>;

/// References to a lock entry held by the table plus one caller.
const SOLE_USER: usize = 2;

/// Lock service coordinating tasks within a single process.
#[derive(Clone, Debug, Default)]
pub struct InProcessLockService {
    locks: LockTable,
}

impl InProcessLockService {
    /// Creates a service with no locks held.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Result<Arc<AsyncMutex<()>>, LockError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|err| LockError::Unavailable(format!("lock table poisoned: {err}")))?;
        Ok(Arc::clone(
            locks
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        ))
    }
}

/// Drops the entry for `key` when the caller holds the only reference
/// outside the table.
fn forget_if_unused(table: &LockTable, key: &str) {
    let Ok(mut locks) = table.lock() else {
        return;
    };
    if locks
        .get(key)
        .is_some_and(|entry| Arc::strong_count(entry) <= SOLE_USER)
    {
        locks.remove(key);
    }
}

/// Guard returned by [`InProcessLockService`].
#[derive(Debug)]
pub struct NamedLockGuard {
    key: String,
    table: LockTable,
    _permit: OwnedMutexGuard<()>,
}

impl NamedLockGuard {
    /// Returns the key this guard holds.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for NamedLockGuard {
    fn drop(&mut self) {
        forget_if_unused(&self.table, &self.key);
        debug!(key = %self.key, "released named lock");
    }
}

impl NamedLockService for InProcessLockService {
    type Guard = NamedLockGuard;

    fn acquire<'a>(&'a self, key: &'a str, timeout: Duration) -> LockFuture<'a, Self::Guard> {
        Box::pin(async move {
            let mutex = self.entry(key)?;
            match tokio::time::timeout(timeout, Arc::clone(&mutex).lock_owned()).await {
                Ok(permit) => {
                    debug!(key, "acquired named lock");
                    Ok(NamedLockGuard {
                        key: key.to_owned(),
                        table: Arc::clone(&self.locks),
                        _permit: permit,
                    })
                }
                Err(_) => {
                    forget_if_unused(&self.locks, key);
                    drop(mutex);
                    warn!(key, timeout_ms = timeout.as_millis(), "named lock wait timed out");
                    Err(LockError::Timeout {
                        key: key.to_owned(),
                        waited_ms: timeout.as_millis(),
                    })
                }
            }
        })
    }
}
