//! Application-level retry for SQLite lock contention.
//!
//! Connections are opened with a zero busy timeout so SQLite reports
//! `SQLITE_BUSY` immediately; [`with_busy_retry`] then sleeps through a
//! per-store delay schedule and retries until the statement goes through.
//! Contention never surfaces as an error to callers.

use std::thread;
use std::time::Duration;

use rusqlite::ErrorCode;
use tracing::warn;

use crate::errors::DatabaseError;

/// Delay schedule for the mapping cache, in milliseconds.
pub const CACHE_DELAYS_MS: &[u64] = &[1, 2, 5, 10, 15, 20, 25, 30, 35, 40, 50, 50, 60, 70, 80, 90, 100];

/// Delay schedule for the rule store, in milliseconds.
pub const RULE_DELAYS_MS: &[u64] = &[5, 10, 15, 20, 30, 40, 55, 70, 100];

/// How one store backs off while another connection holds the lock.
#[derive(Debug, Clone)]
pub struct BusyPolicy {
    pub store: &'static str,
    /// Successive sleeps; the last one repeats once the list is exhausted.
    pub delays_ms: &'static [u64],
    /// A warning is logged each time the total wait crosses another
    /// multiple of this.
    pub warn_after: Duration,
}

impl BusyPolicy {
    pub fn cache(warn_after: Duration) -> Self {
        Self {
            store: "cache",
            delays_ms: CACHE_DELAYS_MS,
            warn_after,
        }
    }

    pub fn rules(warn_after: Duration) -> Self {
        Self {
            store: "rules",
            delays_ms: RULE_DELAYS_MS,
            warn_after,
        }
    }

    fn delay(&self, attempt: usize) -> Duration {
        let ms = self
            .delays_ms
            .get(attempt)
            .or(self.delays_ms.last())
            .copied()
            .unwrap_or(100);
        Duration::from_millis(ms)
    }
}

/// Errors that can signal lock contention.
pub trait BusyError {
    fn is_busy(&self) -> bool;
}

impl BusyError for rusqlite::Error {
    fn is_busy(&self) -> bool {
        matches!(
            self.sqlite_error_code(),
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    }
}

impl BusyError for DatabaseError {
    fn is_busy(&self) -> bool {
        match self {
            DatabaseError::SqliteError(e) => e.is_busy(),
            _ => false,
        }
    }
}

/// Run `op`, retrying for as long as SQLite reports the database busy or
/// locked. Any other outcome is returned as is.
pub fn with_busy_retry<T, E, F>(policy: &BusyPolicy, mut op: F) -> Result<T, E>
where
    E: BusyError,
    F: FnMut() -> Result<T, E>,
{
    let mut attempt = 0usize;
    let mut waited = Duration::ZERO;
    let mut next_warning = policy.warn_after;

    loop {
        match op() {
            Err(e) if e.is_busy() => {
                if !policy.warn_after.is_zero() && waited > next_warning {
                    warn!(
                        store = policy.store,
                        waited_ms = waited.as_millis() as u64,
                        "store is busy, still waiting"
                    );
                    next_warning += policy.warn_after;
                }
                let delay = policy.delay(attempt);
                thread::sleep(delay);
                waited += delay;
                attempt += 1;
            }
            other => return other,
        }
    }
}
