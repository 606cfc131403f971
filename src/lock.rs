//! Distributed lease serializing fleet-wide maintenance work.
//!
//! The lease combines two guards:
//!
//! - a time-bounded exclusive lock (`SET NX PX`), released by a
//!   compare-token script or, if the holder dies, by its TTL;
//! - a "last successful run" timestamp that prevents the guarded action
//!   from firing more often than a minimum interval even when the lock
//!   itself turns over quickly.
//!
//! Timestamps come from the Redis server clock (`TIME`), so clock skew
//! between fleet members cannot break the interval guard. Losing the
//! race is not an error; `run_exclusively` simply reports whether the
//! action executed.

use std::future::Future;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;

/// Deletes the lock only if it still holds our token, so an expired lock
/// re-acquired by another process is never released from under it.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Names and timings of one lease-guarded action.
#[derive(Debug, Clone)]
pub struct LeaseOptions {
    /// Redis key of the exclusive lock.
    pub lock_key: String,
    /// Redis key of the last-successful-run timestamp.
    pub last_run_key: String,
    /// Lock expiry. A crashed holder's lock self-heals after this long.
    pub ttl: Duration,
    /// Minimum interval between successful runs of the guarded action.
    pub min_interval: Duration,
}

/// Runs `action` at most once per `min_interval` across the fleet,
/// holding the named exclusive lock while it executes.
///
/// Returns `Ok(true)` if the action ran, `Ok(false)` if another process
/// holds the lock or ran the action recently.
///
/// # Errors
///
/// Returns `StoreError` if Redis is unreachable or the action fails. An
/// acquired lock is released best-effort; if the release itself fails
/// the lock is abandoned to expire via its TTL.
pub async fn run_exclusively<F, Fut>(
    conn: &ConnectionManager,
    opts: &LeaseOptions,
    action: F,
) -> Result<bool, StoreError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), StoreError>>,
{
    let mut conn = conn.clone();

    // Cheap pre-check before touching the lock at all.
    if !last_run_stale(&mut conn, opts).await? {
        return Ok(false);
    }

    let token = Uuid::new_v4().to_string();
    let acquired: Option<String> = redis::cmd("SET")
        .arg(&opts.lock_key)
        .arg(&token)
        .arg("NX")
        .arg("PX")
        .arg(opts.ttl.as_millis() as u64)
        .query_async(&mut conn)
        .await?;

    if acquired.is_none() {
        debug!(lock_key = %opts.lock_key, "Lease held elsewhere, skipping");
        return Ok(false);
    }

    // Another process may have completed the action between the pre-check
    // and our acquisition.
    if !last_run_stale(&mut conn, opts).await? {
        release(&mut conn, opts, &token).await;
        return Ok(false);
    }

    let result = action().await;

    match result {
        Ok(()) => {
            let now = server_time(&mut conn).await?;
            conn.set::<_, _, ()>(&opts.last_run_key, now).await?;
            release(&mut conn, opts, &token).await;
            Ok(true)
        }
        Err(e) => {
            release(&mut conn, opts, &token).await;
            Err(e)
        }
    }
}

/// Whether enough time has passed since the last successful run. The
/// boundary is inclusive: a distance of exactly `min_interval` counts as
/// stale.
async fn last_run_stale(
    conn: &mut ConnectionManager,
    opts: &LeaseOptions,
) -> Result<bool, StoreError> {
    let ((now, _micros), last_run): ((u64, u64), Option<u64>) = redis::pipe()
        .cmd("TIME")
        .get(&opts.last_run_key)
        .query_async(conn)
        .await?;

    let distance = now.saturating_sub(last_run.unwrap_or(0));
    Ok(distance >= opts.min_interval.as_secs())
}

/// Current Redis server time in whole seconds.
async fn server_time(conn: &mut ConnectionManager) -> Result<u64, StoreError> {
    let (seconds, _micros): (u64, u64) = redis::cmd("TIME").query_async(conn).await?;
    Ok(seconds)
}

/// Best-effort release. Failure is logged and the lock left to its TTL.
async fn release(conn: &mut ConnectionManager, opts: &LeaseOptions, token: &str) {
    let released: Result<i64, redis::RedisError> = redis::Script::new(RELEASE_SCRIPT)
        .key(&opts.lock_key)
        .arg(token)
        .invoke_async(conn)
        .await;

    if let Err(e) = released {
        debug!(lock_key = %opts.lock_key, error = %e, "Lock release failed, TTL will expire it");
    }
}
