//! Advisory, TTL-based mutual exclusion per path.
//!
//! Locks live in the shared database rather than the OS, so they work across
//! independent processes that only share the vault. Every lease expires; a
//! process that crashes while holding one simply lets it lapse.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

use vaultsync_common::{Error, Result};

use crate::db::{from_millis, to_millis, Database};

/// An advisory lease on a path or logical key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLock {
    pub path: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl FileLock {
    /// Whether the lease has lapsed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Lease manager backed by the `locks` table.
#[derive(Clone)]
pub struct LockManager {
    db: Database,
}

impl LockManager {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Try to take the lease on `path` for `ttl`.
    ///
    /// Succeeds when no unexpired lease exists or when `holder` already owns
    /// it (the lease is then refreshed). Returns `false` if another holder
    /// owns an unexpired lease.
    pub fn acquire(&self, path: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let acquired = self.db.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = Utc::now();
            let existing: Option<(String, i64)> = tx
                .query_row(
                    "SELECT holder, expires_at FROM locks WHERE path = ?1",
                    [path],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            if let Some((current, expires_at)) = existing {
                if current != holder && expires_at > to_millis(now) {
                    return Ok(false);
                }
            }

            let ttl = chrono::Duration::from_std(ttl)
                .map_err(|e| Error::InvalidInput(format!("lock ttl out of range: {}", e)))?;
            tx.execute(
                "INSERT OR REPLACE INTO locks (path, holder, acquired_at, expires_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![path, holder, to_millis(now), to_millis(now + ttl)],
            )?;
            tx.commit()?;
            Ok(true)
        })?;

        if acquired {
            debug!("Lock on {} acquired by {}", path, holder);
        } else {
            debug!("Lock on {} refused to {}", path, holder);
        }
        Ok(acquired)
    }

    /// The active lease on `path`, treating expired rows as absent.
    pub fn is_locked(&self, path: &str) -> Result<Option<FileLock>> {
        let lock = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT path, holder, acquired_at, expires_at FROM locks WHERE path = ?1",
                    [path],
                    read_lock,
                )
                .optional()?)
        })?;
        let now = Utc::now();
        Ok(lock.filter(|l| !l.is_expired_at(now)))
    }

    /// Delete the lease on `path` regardless of holder.
    pub fn release(&self, path: &str) -> Result<bool> {
        let removed = self
            .db
            .with_conn(|conn| Ok(conn.execute("DELETE FROM locks WHERE path = ?1", [path])?))?;
        if removed > 0 {
            debug!("Lock on {} released", path);
        }
        Ok(removed > 0)
    }

    /// Acquire or fail with [`Error::LockContended`], returning a guard that
    /// releases the lease when dropped.
    pub fn guard(&self, path: &str, holder: &str, ttl: Duration) -> Result<LockGuard> {
        if self.acquire(path, holder, ttl)? {
            return Ok(LockGuard {
                manager: self.clone(),
                path: path.to_string(),
                released: false,
            });
        }
        let holder = self
            .is_locked(path)?
            .map(|l| l.holder)
            .unwrap_or_else(|| "unknown".to_string());
        Err(Error::LockContended {
            path: path.to_string(),
            holder,
        })
    }

    /// Run `f` while holding the lease on `path`.
    ///
    /// The lease is released on every exit path: success, error, or a panic
    /// unwinding through the future.
    pub async fn with_lock<F, Fut, T>(
        &self,
        path: &str,
        holder: &str,
        ttl: Duration,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.guard(path, holder, ttl)?;
        let result = f().await;
        guard.release()?;
        result
    }

    /// Delete every expired lease and return how many were removed.
    pub fn cleanup_expired(&self) -> Result<usize> {
        let removed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM locks WHERE expires_at <= ?1",
                [to_millis(Utc::now())],
            )?)
        })?;
        if removed > 0 {
            info!("Removed {} expired locks", removed);
        }
        Ok(removed)
    }

    /// All unexpired leases.
    pub fn active_locks(&self) -> Result<Vec<FileLock>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT path, holder, acquired_at, expires_at FROM locks \
                 WHERE expires_at > ?1 ORDER BY path",
            )?;
            let locks = stmt
                .query_map([to_millis(Utc::now())], read_lock)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(locks)
        })
    }
}

fn read_lock(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileLock> {
    Ok(FileLock {
        path: row.get(0)?,
        holder: row.get(1)?,
        acquired_at: from_millis(row.get(2)?),
        expires_at: from_millis(row.get(3)?),
    })
}

/// Scoped lease; released on drop.
pub struct LockGuard {
    manager: LockManager,
    path: String,
    released: bool,
}

impl LockGuard {
    /// The locked path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Release now and surface any database error.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.manager.release(&self.path).map(|_| ())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.manager.release(&self.path) {
            warn!("Failed to release lock on {}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    fn manager() -> LockManager {
        LockManager::new(Database::open_in_memory().unwrap())
    }

    fn expire(manager: &LockManager, path: &str) {
        manager
            .db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE locks SET expires_at = ?1 WHERE path = ?2",
                    params![to_millis(Utc::now()) - 1_000, path],
                )?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_mutual_exclusion_and_expiry() {
        let locks = manager();
        assert!(locks.acquire("job:42", "agent-1", TTL).unwrap());
        assert!(!locks.acquire("job:42", "agent-2", TTL).unwrap());

        expire(&locks, "job:42");
        assert!(locks.is_locked("job:42").unwrap().is_none());
        assert!(locks.acquire("job:42", "agent-2", TTL).unwrap());
        assert_eq!(locks.is_locked("job:42").unwrap().unwrap().holder, "agent-2");
    }

    #[test]
    fn test_reentrant_for_same_holder() {
        let locks = manager();
        assert!(locks.acquire("notes/a.md", "agent-1", TTL).unwrap());
        assert!(locks.acquire("notes/a.md", "agent-1", TTL).unwrap());
    }

    #[test]
    fn test_release_frees_the_path() {
        let locks = manager();
        locks.acquire("notes/a.md", "agent-1", TTL).unwrap();
        assert!(locks.release("notes/a.md").unwrap());
        assert!(locks.acquire("notes/a.md", "agent-2", TTL).unwrap());
        assert!(!locks.release("notes/other.md").unwrap());
    }

    #[test]
    fn test_cleanup_expired_counts_rows() {
        let locks = manager();
        locks.acquire("a", "h", TTL).unwrap();
        locks.acquire("b", "h", TTL).unwrap();
        expire(&locks, "a");

        assert_eq!(locks.cleanup_expired().unwrap(), 1);
        assert_eq!(locks.active_locks().unwrap().len(), 1);
        assert_eq!(locks.cleanup_expired().unwrap(), 0);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let locks = manager();
        {
            let guard = locks.guard("a", "agent-1", TTL).unwrap();
            assert_eq!(guard.path(), "a");
            let err = locks.guard("a", "agent-2", TTL).err().unwrap();
            assert!(matches!(err, Error::LockContended { ref holder, .. } if holder == "agent-1"));
        }
        assert!(locks.is_locked("a").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_with_lock_releases_after_error() {
        let locks = manager();
        let result: Result<()> = locks
            .with_lock("a", "agent-1", TTL, || async {
                Err(Error::InvalidInput("write failed".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert!(locks.is_locked("a").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_with_lock_contended() {
        let locks = manager();
        locks.acquire("a", "agent-1", TTL).unwrap();

        let result = locks
            .with_lock("a", "agent-2", TTL, || async { Ok(1) })
            .await;
        assert!(matches!(result, Err(Error::LockContended { .. })));
        assert_eq!(locks.is_locked("a").unwrap().unwrap().holder, "agent-1");
    }

    #[tokio::test]
    async fn test_with_lock_runs_body() {
        let locks = manager();
        let inner = locks.clone();
        let value = locks
            .with_lock("a", "agent-1", TTL, || async move {
                assert!(inner.is_locked("a").unwrap().is_some());
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(locks.is_locked("a").unwrap().is_none());
    }
}
