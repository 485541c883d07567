//! Per-symbol write locking with bounded exponential-backoff retry.
//!
//! SQLite locks the whole database, so "a lock on one symbol's rows" is a
//! lease row in `symbol_locks`. A lease is taken atomically, carries a TTL so
//! a crashed holder cannot wedge a symbol forever, and is always released
//! after the write transaction commits or rolls back. Lease contention and
//! SQLite busy/locked errors are transient; they are retried up to
//! `max_retries` times and then surfaced so the caller can skip the unit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::sleep;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

static HOLDER_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base, doubling, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let factor = 1u64 << shift;
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms.max(self.base_delay_ms));
        Duration::from_millis(delay_ms)
    }

    /// Runs `f` until it succeeds, fails with a non-transient error, or has
    /// been retried `max_retries` times. `f` receives the 0-based attempt.
    pub fn retry<T, E>(
        &self,
        is_transient: impl Fn(&E) -> bool,
        mut f: impl FnMut(u32) -> Result<T, E>,
    ) -> Result<T, E> {
        let mut attempt: u32 = 0;
        loop {
            match f(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= self.max_retries || !is_transient(&err) => return Err(err),
                Err(_) => {
                    attempt = attempt.saturating_add(1);
                    sleep(self.delay_for(attempt));
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lease {key} is held by {holder} until {expires_at_ms}")]
    Contended {
        key: String,
        holder: String,
        expires_at_ms: i64,
    },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("gave up on {key} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        key: String,
        attempts: u32,
        last_error: String,
    },
}

impl LockError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Contended { .. } => true,
            Self::Sqlite(err) => is_transient_sqlite(err),
            Self::RetriesExhausted { .. } => false,
        }
    }
}

pub fn is_transient_sqlite(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(inner, _) => matches!(
            inner.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

/// Lease key for one symbol within one writer namespace, e.g. `features/BTC`.
pub fn lock_key(namespace: &str, symbol: &str) -> String {
    format!("{namespace}/{symbol}")
}

#[derive(Debug)]
pub struct SymbolLocks {
    holder: String,
    lease_ttl_ms: i64,
    policy: RetryPolicy,
}

impl SymbolLocks {
    pub fn new(lease_ttl_ms: u64, policy: RetryPolicy) -> Self {
        let seq = HOLDER_SEQ.fetch_add(1, Ordering::Relaxed);
        Self {
            holder: format!("pid{}-{}", std::process::id(), seq),
            lease_ttl_ms: i64::try_from(lease_ttl_ms).unwrap_or(i64::MAX),
            policy,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn try_acquire(&self, conn: &Connection, key: &str, now_ms: i64) -> Result<(), LockError> {
        let changed = conn.execute(
            "
            INSERT INTO symbol_locks (lock_key, holder, expires_at_ms)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(lock_key) DO UPDATE SET
                holder = excluded.holder,
                expires_at_ms = excluded.expires_at_ms
            WHERE symbol_locks.expires_at_ms <= ?4
               OR symbol_locks.holder = excluded.holder
            ",
            params![
                key,
                self.holder,
                now_ms.saturating_add(self.lease_ttl_ms),
                now_ms
            ],
        )?;
        if changed == 1 {
            return Ok(());
        }

        let current: Option<(String, i64)> = conn
            .query_row(
                "SELECT holder, expires_at_ms FROM symbol_locks WHERE lock_key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (holder, expires_at_ms) = current.unwrap_or_default();
        Err(LockError::Contended {
            key: key.to_string(),
            holder,
            expires_at_ms,
        })
    }

    pub fn release(&self, conn: &Connection, key: &str) -> Result<(), LockError> {
        conn.execute(
            "DELETE FROM symbol_locks WHERE lock_key = ?1 AND holder = ?2",
            params![key, self.holder],
        )?;
        Ok(())
    }

    /// Takes the lease for `key`, runs `f` inside an immediate transaction,
    /// commits, and releases the lease. Transient failures at any step are
    /// retried per policy; the transaction is rolled back before each retry.
    pub fn run_locked<T>(
        &self,
        conn: &mut Connection,
        key: &str,
        mut f: impl FnMut(&Transaction<'_>) -> rusqlite::Result<T>,
    ) -> Result<T, LockError> {
        let mut last_attempt = 0;
        let result = self.policy.retry(LockError::is_transient, |attempt| {
            last_attempt = attempt;
            if attempt > 0 {
                debug!(
                    component = "lock",
                    event = "lock.retry",
                    key,
                    attempt
                );
            }
            self.try_acquire(conn, key, Utc::now().timestamp_millis())?;
            let outcome = run_in_transaction(conn, &mut f);
            if let Err(err) = self.release(conn, key) {
                warn!(
                    component = "lock",
                    event = "lock.release_failed",
                    key,
                    error = %err
                );
            }
            outcome
        });

        match result {
            Err(err) if err.is_transient() => Err(LockError::RetriesExhausted {
                key: key.to_string(),
                attempts: last_attempt + 1,
                last_error: err.to_string(),
            }),
            other => other,
        }
    }
}

fn run_in_transaction<T>(
    conn: &mut Connection,
    f: &mut impl FnMut(&Transaction<'_>) -> rusqlite::Result<T>,
) -> Result<T, LockError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn lock_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE symbol_locks (
                lock_key TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                expires_at_ms INTEGER NOT NULL
            );
            CREATE TABLE writes (symbol TEXT NOT NULL);
            ",
        )
        .unwrap();
        conn
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 500,
        };
        let delays: Vec<u64> = (1..=5)
            .map(|attempt| policy.delay_for(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn retry_stops_on_permanent_error_and_after_budget() {
        let policy = fast_policy(3);
        let calls = Cell::new(0);
        let result: Result<(), &str> = policy.retry(
            |_| true,
            |_| {
                calls.set(calls.get() + 1);
                Err("busy")
            },
        );
        assert!(result.is_err());
        assert_eq!(calls.get(), 4);

        calls.set(0);
        let result: Result<(), &str> = policy.retry(
            |_| false,
            |_| {
                calls.set(calls.get() + 1);
                Err("corrupt")
            },
        );
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);

        let result: Result<u32, &str> =
            policy.retry(|_| true, |attempt| if attempt < 2 { Err("busy") } else { Ok(attempt) });
        assert_eq!(result, Ok(2));
    }

    #[test]
    fn live_lease_blocks_other_holders_until_expiry() {
        let conn = lock_conn();
        let a = SymbolLocks::new(1_000, fast_policy(0));
        let b = SymbolLocks::new(1_000, fast_policy(0));

        a.try_acquire(&conn, "features/BTC", 10_000).unwrap();
        a.try_acquire(&conn, "features/BTC", 10_500).unwrap();
        let err = b.try_acquire(&conn, "features/BTC", 10_600).unwrap_err();
        assert!(matches!(err, LockError::Contended { ref holder, .. } if holder == a.holder()));
        assert!(err.is_transient());

        b.try_acquire(&conn, "features/ETH", 10_600).unwrap();
        b.try_acquire(&conn, "features/BTC", 11_500).unwrap();
    }

    #[test]
    fn run_locked_commits_and_releases_lease() {
        let mut conn = lock_conn();
        let locks = SymbolLocks::new(60_000, fast_policy(1));
        locks
            .run_locked(&mut conn, "features/BTC", |tx| {
                tx.execute("INSERT INTO writes (symbol) VALUES ('BTC')", [])
            })
            .unwrap();

        let writes: i64 = conn
            .query_row("SELECT COUNT(*) FROM writes", [], |row| row.get(0))
            .unwrap();
        let leases: i64 = conn
            .query_row("SELECT COUNT(*) FROM symbol_locks", [], |row| row.get(0))
            .unwrap();
        assert_eq!(writes, 1);
        assert_eq!(leases, 0);
    }

    #[test]
    fn run_locked_gives_up_on_contended_lease() {
        let mut conn = lock_conn();
        conn.execute(
            "INSERT INTO symbol_locks VALUES ('features/BTC', 'someone-else', ?1)",
            params![i64::MAX],
        )
        .unwrap();

        let locks = SymbolLocks::new(60_000, fast_policy(2));
        let err = locks
            .run_locked(&mut conn, "features/BTC", |tx| {
                tx.execute("INSERT INTO writes (symbol) VALUES ('BTC')", [])
            })
            .unwrap_err();
        assert!(matches!(err, LockError::RetriesExhausted { attempts: 3, .. }));

        let writes: i64 = conn
            .query_row("SELECT COUNT(*) FROM writes", [], |row| row.get(0))
            .unwrap();
        assert_eq!(writes, 0);
    }
}
