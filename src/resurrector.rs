//! Crash recovery for jobs stranded in dead processes' in-flight lists.
//!
//! Every live process heartbeats its identity and watched queues into a
//! fleet-wide registry hash. One elected process (under the distributed
//! lease) periodically sweeps the registry: an identity whose liveness
//! key has disappeared is a casualty, and each of its in-flight lists is
//! drained back to the matching pending list one payload at a time, each
//! move a single atomic script. Cleanup of the registry entry and the
//! drained lists is one atomic step, and every step is a no-op when
//! re-run, so a sweep that dies halfway is simply finished by the next
//! one.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::info;

use crate::config::{Config, ResurrectionCallback};
use crate::error::{ConfigError, StoreError};
use crate::lock::{self, LeaseOptions};
use crate::queue_name::QueueName;

/// Registry hash mapping process identity to its JSON queue list.
const MAIN_KEY: &str = "reliq:resurrector";

/// Lock serializing sweeps across the fleet.
const LOCK_KEY: &str = "reliq:resurrector:lock";

/// Timestamp of the last completed sweep.
const LAST_RUN_KEY: &str = "reliq:resurrector:last_run";

/// Lease TTL for the sweep lock.
const LOCK_TTL: Duration = Duration::from_secs(30);

/// Expiry of per-job resurrection counters.
const COUNTER_TTL_SECS: u64 = 86_400;

/// Moves one payload from the in-flight list back to pending. Returns the
/// payload, or nil once the list is empty.
const RESURRECT_SCRIPT: &str = r#"
local job = redis.call("LPOP", KEYS[1])
if job then
    redis.call("RPUSH", KEYS[2], job)
    return job
end
return false
"#;

/// Same move, additionally bumping a per-job counter keyed by the
/// payload's `jid` field. Payloads without a parseable `jid` skip the
/// counter but are still moved.
const RESURRECT_WITH_COUNTER_SCRIPT: &str = r#"
local job = redis.call("LPOP", KEYS[1])
if job then
    redis.call("RPUSH", KEYS[2], job)
    local ok, decoded = pcall(cjson.decode, job)
    if ok and type(decoded) == "table" and decoded.jid then
        local counter = KEYS[3] .. ":counter:jid:" .. decoded.jid
        redis.call("INCR", counter)
        redis.call("EXPIRE", counter, ARGV[1])
    end
    return job
end
return false
"#;

/// Fleet-wide crash detector and job resurrector.
pub struct Resurrector {
    conn: ConnectionManager,
    identity: String,
    /// Watched queue names, deduped, as advertised in the registry.
    queues: Vec<String>,
    sweep_interval: Duration,
    enable_counter: bool,
    on_resurrection: Option<ResurrectionCallback>,
}

impl Resurrector {
    /// Creates a resurrector registering the queues named in `config`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration is invalid.
    pub fn new(conn: ConnectionManager, config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut queues: Vec<String> = Vec::new();
        for name in &config.queues {
            if !queues.contains(name) {
                queues.push(name.clone());
            }
        }

        Ok(Self {
            conn,
            identity: config.identity.clone(),
            queues,
            sweep_interval: config.sweep_interval,
            enable_counter: config.enable_resurrection_counter,
            on_resurrection: config.on_resurrection.clone(),
        })
    }

    /// Overwrites this process's registry entry with its watched queues.
    /// Idempotent; called on every heartbeat tick.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if Redis is unreachable.
    pub async fn heartbeat(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let entry = serde_json::to_string(&self.queues)?;
        conn.hset::<_, _, _, ()>(MAIN_KEY, &self.identity, entry)
            .await?;
        Ok(())
    }

    /// Detects dead processes and resurrects their stranded jobs.
    ///
    /// Runs under the fleet-wide sweep lease; returns `Ok(false)` when
    /// another process holds it or swept recently.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if Redis is unreachable or a registry entry
    /// is malformed. A failed sweep leaves partially-recovered casualties
    /// for the next cycle; every recovery step is safe to re-run.
    pub async fn sweep(&self) -> Result<bool, StoreError> {
        let opts = LeaseOptions {
            lock_key: LOCK_KEY.to_string(),
            last_run_key: LAST_RUN_KEY.to_string(),
            ttl: LOCK_TTL,
            min_interval: self.sweep_interval,
        };

        lock::run_exclusively(&self.conn, &opts, || self.recover_casualties()).await
    }

    /// Reads the resurrection counter for a job id.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if Redis is unreachable.
    pub async fn resurrection_count(&self, job_id: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let count: Option<u64> = conn
            .get(format!("{MAIN_KEY}:counter:jid:{job_id}"))
            .await?;
        Ok(count.unwrap_or(0))
    }

    async fn recover_casualties(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();

        for identity in self.casualties(&mut conn).await? {
            let queues = self.watched_queues(&mut conn, &identity).await?;

            for queue in &queues {
                let moved = self.resurrect(&mut conn, queue).await?;
                if moved > 0 {
                    info!(
                        queue = %queue,
                        identity = %identity,
                        count = moved,
                        "Resurrected stranded jobs"
                    );
                    if let Some(callback) = &self.on_resurrection {
                        callback(queue.normalized(), moved);
                    }
                }
            }

            self.cleanup(&mut conn, &identity, &queues).await?;
        }

        Ok(())
    }

    /// Registered identities whose liveness key is absent.
    async fn casualties(&self, conn: &mut ConnectionManager) -> Result<Vec<String>, StoreError> {
        let identities: Vec<String> = conn.hkeys(MAIN_KEY).await?;
        if identities.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for identity in &identities {
            pipe.exists(identity);
        }
        let alive: Vec<bool> = pipe.query_async(conn).await?;

        Ok(identities
            .into_iter()
            .zip(alive)
            .filter(|(_, alive)| !alive)
            .map(|(identity, _)| identity)
            .collect())
    }

    /// The queues a registry entry advertises, bound to the casualty's
    /// identity so the derived keys point at the dead process's lists.
    async fn watched_queues(
        &self,
        conn: &mut ConnectionManager,
        identity: &str,
    ) -> Result<Vec<QueueName>, StoreError> {
        let entry: Option<String> = conn.hget(MAIN_KEY, identity).await?;
        let Some(entry) = entry else {
            return Ok(Vec::new());
        };

        let names: Vec<String> =
            serde_json::from_str(&entry).map_err(|source| StoreError::MalformedRegistry {
                identity: identity.to_string(),
                source,
            })?;

        Ok(names
            .into_iter()
            .map(|name| QueueName::new(name, identity))
            .collect())
    }

    /// Drains one in-flight list back to pending, one atomic move at a
    /// time, and returns how many payloads moved.
    async fn resurrect(
        &self,
        conn: &mut ConnectionManager,
        queue: &QueueName,
    ) -> Result<u64, StoreError> {
        let script = if self.enable_counter {
            redis::Script::new(RESURRECT_WITH_COUNTER_SCRIPT)
        } else {
            redis::Script::new(RESURRECT_SCRIPT)
        };

        let mut moved = 0;
        loop {
            let mut invocation = script.prepare_invoke();
            invocation.key(queue.inproc()).key(queue.pending());
            if self.enable_counter {
                invocation.key(MAIN_KEY).arg(COUNTER_TTL_SECS);
            }

            let payload: Option<String> = invocation.invoke_async(conn).await?;
            if payload.is_none() {
                break;
            }
            moved += 1;
        }

        Ok(moved)
    }

    /// Deletes the casualty's registry entry and its drained in-flight
    /// list keys in one atomic step. Deleting already-deleted keys is a
    /// no-op, so re-running after a half-completed sweep is safe.
    async fn cleanup(
        &self,
        conn: &mut ConnectionManager,
        identity: &str,
        queues: &[QueueName],
    ) -> Result<(), StoreError> {
        let mut pipe = redis::pipe();
        pipe.atomic().hdel(MAIN_KEY, identity).ignore();
        for queue in queues {
            pipe.del(queue.inproc()).ignore();
        }
        pipe.query_async::<_, ()>(conn).await?;
        Ok(())
    }
}
