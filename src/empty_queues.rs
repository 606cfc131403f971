//! Two-tier cache of queues currently known to have no pending work.
//!
//! The global tier is a Redis set refreshed periodically by one elected
//! process (under the distributed lease); every process keeps a local
//! point-in-time snapshot of it. The fetch hot path consults only the
//! snapshot, so an empty queue costs nothing between refreshes.
//!
//! The snapshot is a hint: a queue wrongly reported non-empty is merely
//! probed once more, and a queue wrongly reported empty only delays
//! discovery of new work by up to one refresh interval.

use std::collections::HashSet;
use std::sync::RwLock;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StoreError;
use crate::lock::{self, LeaseOptions};
use crate::queue_name;

/// Global set of queue names with no pending jobs as of the last refresh.
const GLOBAL_KEY: &str = "reliq:empty_queues";

/// Lock serializing global refreshes across the fleet.
const LOCK_KEY: &str = "reliq:empty_queues:lock";

/// Timestamp of the last successful global refresh.
const LAST_RUN_KEY: &str = "reliq:empty_queues:last_run";

/// Set of all queue names known to the system, maintained by the host.
const KNOWN_QUEUES_KEY: &str = "queues";

/// Lease TTL for the refresh lock.
const LEASE_TTL: Duration = Duration::from_secs(30);

/// Local cache of empty queues backed by a fleet-shared Redis set.
pub struct EmptyQueues {
    conn: ConnectionManager,
    refresh_interval: Duration,
    /// Serializes refreshes within this process; held non-blockingly so a
    /// second caller returns immediately instead of queueing up.
    local_lock: Mutex<()>,
    snapshot: RwLock<HashSet<String>>,
}

impl EmptyQueues {
    /// Creates an index refreshing the global set at most once per
    /// `refresh_interval` fleet-wide.
    pub fn new(conn: ConnectionManager, refresh_interval: Duration) -> Self {
        Self {
            conn,
            refresh_interval,
            local_lock: Mutex::new(()),
            snapshot: RwLock::new(HashSet::new()),
        }
    }

    /// Queue names in the current local snapshot.
    pub fn queues(&self) -> HashSet<String> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Refreshes the empty-queue cache.
    ///
    /// If this process wins the fleet-wide lease, it rescans all known
    /// queues, replaces the global set and takes the result as its local
    /// snapshot. Otherwise it copies the current global set locally.
    ///
    /// Returns `Ok(true)` if the local snapshot changed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if Redis is unreachable.
    pub async fn refresh(&self) -> Result<bool, StoreError> {
        // A refresh is already in flight on this process.
        let Ok(_guard) = self.local_lock.try_lock() else {
            return Ok(false);
        };

        let before = self.queues();

        let opts = LeaseOptions {
            lock_key: LOCK_KEY.to_string(),
            last_run_key: LAST_RUN_KEY.to_string(),
            ttl: LEASE_TTL,
            min_interval: self.refresh_interval,
        };
        let refreshed_globally =
            lock::run_exclusively(&self.conn, &opts, || self.refresh_global()).await?;

        if !refreshed_globally {
            self.refresh_local().await?;
        }

        let after = self.queues();
        Ok(before != after)
    }

    /// Rescans every known queue and atomically replaces the global set,
    /// taking the fresh result as the local snapshot.
    async fn refresh_global(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let empty = self.scan_empty_queues(&mut conn).await?;

        let mut pipe = redis::pipe();
        pipe.atomic().del(GLOBAL_KEY).ignore();
        if !empty.is_empty() {
            let members: Vec<&String> = empty.iter().collect();
            pipe.sadd(GLOBAL_KEY, members).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;

        debug!(count = empty.len(), "Refreshed global empty-queue set");
        self.replace_snapshot(empty);
        Ok(())
    }

    /// Copies the current global set into the local snapshot.
    async fn refresh_local(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(GLOBAL_KEY).await?;

        self.replace_snapshot(members.into_iter().collect());
        Ok(())
    }

    /// Probes every known queue's pending list and returns the names with
    /// no pending jobs.
    async fn scan_empty_queues(
        &self,
        conn: &mut ConnectionManager,
    ) -> Result<HashSet<String>, StoreError> {
        let names = sscan_known_queues(conn).await?;
        if names.is_empty() {
            return Ok(HashSet::new());
        }

        let mut pipe = redis::pipe();
        for name in &names {
            pipe.exists(queue_name::pending_key(name));
        }
        let exists: Vec<bool> = pipe.query_async(conn).await?;

        Ok(names
            .into_iter()
            .zip(exists)
            .filter(|(_, has_pending)| !has_pending)
            .map(|(name, _)| name)
            .collect())
    }

    fn replace_snapshot(&self, queues: HashSet<String>) {
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = queues;
    }
}

/// Reads the full known-queue set with cursor pagination. The cursor is
/// not atomic, so concurrent updates can surface duplicates; collecting
/// into a vector after deduping keeps probe order stable.
async fn sscan_known_queues(conn: &mut ConnectionManager) -> Result<Vec<String>, StoreError> {
    let mut seen = HashSet::new();
    let mut names = Vec::new();
    let mut cursor: u64 = 0;

    loop {
        let (next, values): (u64, Vec<String>) = redis::cmd("SSCAN")
            .arg(KNOWN_QUEUES_KEY)
            .arg(cursor)
            .query_async(conn)
            .await?;

        for value in values {
            if seen.insert(value.clone()) {
                names.push(value);
            }
        }

        cursor = next;
        if cursor == 0 {
            break;
        }
    }

    Ok(names)
}
