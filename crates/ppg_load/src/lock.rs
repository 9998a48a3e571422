//! Per-partition load lock.
//!
//! The lock is a PostgreSQL session advisory lock keyed by the resolved
//! partition, so two loaders targeting different partitions of the same base
//! table never wait on each other. It is held on the same session that issues
//! the DDL, and the server drops it if that session dies.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{chain, LoadFailure};
use crate::partition::PartitionTarget;
use crate::session::SqlSession;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const LOCK_KEY_NAMESPACE: &str = "ppg_load";

/// Proof of a held lock; consumed by `release`.
#[derive(Debug)]
pub struct LockHandle {
    /// Advisory lock key, see [`lock_key`].
    pub key: String,
    /// Resolved partition the lock guards.
    pub table: String,
    pub acquired_at: Instant,
}

/// Mutual exclusion between loaders writing the same partition.
#[async_trait]
pub trait TableLockCoordinator: Send + Sync {
    /// Waits up to `timeout` for the partition lock.
    ///
    /// Fails with `LockTimeout` when another holder keeps it past the
    /// deadline and with `LockConflict` when the lock cannot be queried.
    async fn acquire(
        &self,
        target: &PartitionTarget,
        timeout: Duration,
    ) -> Result<LockHandle, LoadFailure>;

    /// Releases the lock. Never fails; problems are logged.
    async fn release(&self, handle: LockHandle);
}

/// Lock key for a partition. Never derived from the base table.
pub fn lock_key(target: &PartitionTarget) -> String {
    format!(
        "{}:{}.{}",
        LOCK_KEY_NAMESPACE, target.schema, target.resolved_table
    )
}

/// Session-level PostgreSQL advisory lock, polled with `pg_try_advisory_lock`.
///
/// Needs a session that stays on one backend for the whole run, since the
/// lock is owned by the connection that took it.
pub struct AdvisoryLockCoordinator {
    session: Arc<dyn SqlSession>,
    poll_interval: Duration,
}

impl AdvisoryLockCoordinator {
    /// Coordinator polling every 250 ms over `session`.
    pub fn new(session: Arc<dyn SqlSession>) -> Self {
        Self {
            session,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Overrides the retry interval; clamped to at least 1 ms.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    async fn try_lock(&self, key: &str) -> anyhow::Result<bool> {
        let rows = self
            .session
            .query_rows("SELECT pg_try_advisory_lock(hashtext($1))::text", &[key])
            .await?;
        Ok(matches!(
            rows.first().and_then(|row| row.first()).map(|cell| cell.as_deref()),
            Some(Some("true"))
        ))
    }
}

#[async_trait]
impl TableLockCoordinator for AdvisoryLockCoordinator {
    async fn acquire(
        &self,
        target: &PartitionTarget,
        timeout: Duration,
    ) -> Result<LockHandle, LoadFailure> {
        let key = lock_key(target);
        let started = Instant::now();
        let mut attempts = 0u64;
        loop {
            attempts += 1;
            let acquired = self
                .try_lock(&key)
                .await
                .map_err(|err| LoadFailure::LockConflict {
                    table: target.resolved_table.clone(),
                    reason: chain(&err),
                })?;
            if acquired {
                info!(
                    key = %key,
                    attempts,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "partition lock acquired"
                );
                return Ok(LockHandle {
                    key,
                    table: target.resolved_table.clone(),
                    acquired_at: Instant::now(),
                });
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(LoadFailure::LockTimeout {
                    table: target.resolved_table.clone(),
                    timeout,
                });
            }
            if attempts == 1 {
                info!(key = %key, "partition lock held by another loader, waiting");
            }
            tokio::time::sleep(self.poll_interval.min(timeout - elapsed)).await;
        }
    }

    async fn release(&self, handle: LockHandle) {
        let held_ms = handle.acquired_at.elapsed().as_millis() as u64;
        match self
            .session
            .query_rows(
                "SELECT pg_advisory_unlock(hashtext($1))::text",
                &[handle.key.as_str()],
            )
            .await
        {
            Ok(rows) => {
                let released = matches!(
                    rows.first().and_then(|row| row.first()).map(|cell| cell.as_deref()),
                    Some(Some("true"))
                );
                if released {
                    info!(key = %handle.key, held_ms, "partition lock released");
                } else {
                    warn!(key = %handle.key, "partition lock was not held at release");
                }
            }
            Err(err) => warn!(
                key = %handle.key,
                error = %chain(&err),
                "partition lock release failed; it ends with the session"
            ),
        }
    }
}
