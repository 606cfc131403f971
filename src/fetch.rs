//! Reliable fetch: the hot path claiming jobs from Redis.
//!
//! Each attempt atomically moves one payload from a queue's pending list
//! to this process's in-flight list with RPOPLPUSH, so a crash between
//! claim and acknowledge strands the job in a recoverable place instead
//! of losing it.
//!
//! Queue selection stays cheap by skipping queues recently observed
//! empty or throttled (a local [`ExpirableSet`]) and queues in the
//! fleet-wide empty-queue index. Pause and throttle decisions belong to
//! external collaborators behind the [`PauseStore`] and
//! [`ThrottleOracle`] traits.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};

use crate::config::Config;
use crate::empty_queues::EmptyQueues;
use crate::error::{ConfigError, StoreError};
use crate::expirable_set::ExpirableSet;
use crate::queue_name::QueueName;
use crate::unit_of_work::UnitOfWork;

/// Decides whether a claimed payload may run right now.
#[async_trait]
pub trait ThrottleOracle: Send + Sync {
    async fn is_throttled(&self, payload: &str) -> bool;
}

/// Reports queues administratively paused by the host.
#[async_trait]
pub trait PauseStore: Send + Sync {
    async fn paused_queues(&self) -> HashSet<String>;
}

/// Throttle oracle that never throttles.
#[derive(Debug, Default)]
pub struct NoThrottle;

#[async_trait]
impl ThrottleOracle for NoThrottle {
    async fn is_throttled(&self, _payload: &str) -> bool {
        false
    }
}

/// Pause store with nothing paused.
#[derive(Debug, Default)]
pub struct NoPauses;

#[async_trait]
impl PauseStore for NoPauses {
    async fn paused_queues(&self) -> HashSet<String> {
        HashSet::new()
    }
}

/// Reliable throttled fetcher.
pub struct Fetch {
    conn: ConnectionManager,
    queues: Vec<QueueName>,
    strict: bool,
    fetch_timeout: Duration,
    empty_backoff: Duration,
    throttle_backoff: Duration,
    /// Queues to skip for a while: observed empty or served a throttled job.
    exhausted: ExpirableSet<String>,
    empty_queues: Arc<EmptyQueues>,
    throttle: Arc<dyn ThrottleOracle>,
    pauses: Arc<dyn PauseStore>,
}

impl Fetch {
    /// Creates a fetcher for the queues named in `config`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration is invalid.
    pub fn new(
        conn: ConnectionManager,
        config: &Config,
        empty_queues: Arc<EmptyQueues>,
        throttle: Arc<dyn ThrottleOracle>,
        pauses: Arc<dyn PauseStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        // Strict mode polls in configured order, duplicates collapsed up
        // front. Otherwise duplicates are kept: a queue listed twice is
        // twice as likely to lead the order after the per-pass shuffle.
        let queues: Vec<QueueName> = if config.strict {
            let mut seen = HashSet::new();
            config
                .queues
                .iter()
                .filter(|name| seen.insert(name.as_str()))
                .map(|name| QueueName::parse(name, &config.identity))
                .collect()
        } else {
            config
                .queues
                .iter()
                .map(|name| QueueName::parse(name, &config.identity))
                .collect()
        };

        Ok(Self {
            conn,
            queues,
            strict: config.strict,
            fetch_timeout: config.fetch_timeout,
            empty_backoff: config.empty_backoff,
            throttle_backoff: config.throttle_backoff,
            exhausted: ExpirableSet::new(),
            empty_queues,
            throttle,
            pauses,
        })
    }

    /// Claims the next job, or returns `None` after sleeping the fetch
    /// timeout when no queue yields one.
    ///
    /// A claimed job the throttle oracle rejects is pushed back to the
    /// front of its pending list, the queue is backed off locally, and
    /// the call behaves as if nothing was fetched.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if Redis is unreachable; the caller's loop
    /// decides whether to retry.
    pub async fn retrieve_work(&self) -> Result<Option<UnitOfWork>, StoreError> {
        let Some(work) = self.retrieve().await? else {
            return Ok(None);
        };

        if self.throttle.is_throttled(work.payload()).await {
            let queue = work.queue_name().to_string();
            debug!(queue = %queue, "Fetched throttled job, requeueing to front");

            work.requeue_throttled().await?;
            self.exhausted.insert(queue, self.throttle_backoff);
            return Ok(None);
        }

        Ok(Some(work))
    }

    /// Requeues every unit the host still holds, e.g. on engine shutdown.
    ///
    /// All units are attempted even if some fail; the first failure is
    /// returned after the pass completes.
    ///
    /// # Errors
    ///
    /// Returns the first `StoreError` encountered, if any.
    pub async fn bulk_requeue(units: Vec<UnitOfWork>) -> Result<(), StoreError> {
        let mut first_error = None;

        for unit in units {
            let queue = unit.queue_name().to_string();
            if let Err(e) = unit.requeue().await {
                warn!(queue = %queue, error = %e, "Bulk requeue failed for unit");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    async fn retrieve(&self) -> Result<Option<UnitOfWork>, StoreError> {
        let mut conn = self.conn.clone();

        for queue in self.candidates().await {
            let payload: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(queue.pending())
                .arg(queue.inproc())
                .query_async(&mut conn)
                .await?;

            match payload {
                Some(payload) => {
                    return Ok(Some(UnitOfWork::new(self.conn.clone(), queue, payload)));
                }
                None => {
                    debug!(queue = %queue, "Queue has no job");
                    self.exhausted
                        .insert(queue.normalized().to_string(), self.empty_backoff);
                }
            }
        }

        debug!("No jobs in any queue");
        tokio::time::sleep(self.fetch_timeout).await;
        Ok(None)
    }

    /// Queues worth polling this pass, most of the filtering done against
    /// local caches. The pause lookup is skipped when nothing is left.
    async fn candidates(&self) -> Vec<QueueName> {
        let mut skip: HashSet<String> = self.exhausted.live().into_iter().collect();
        skip.extend(self.empty_queues.queues());

        let mut candidates = select_candidates(&self.queues, self.strict, &skip);

        if !candidates.is_empty() {
            let paused = self.pauses.paused_queues().await;
            candidates.retain(|queue| !paused.contains(queue.normalized()));
        }

        candidates
    }
}

/// Filters the configured queues down to this pass's polling order:
/// configured order when strict, shuffled otherwise with duplicate
/// listings acting as fairness weights (collapsed after the shuffle,
/// first occurrence wins), minus everything in `skip`.
fn select_candidates(
    configured: &[QueueName],
    strict: bool,
    skip: &HashSet<String>,
) -> Vec<QueueName> {
    let mut candidates: Vec<QueueName> = configured
        .iter()
        .filter(|queue| !skip.contains(queue.normalized()))
        .cloned()
        .collect();

    if !strict {
        candidates.shuffle(&mut rand::rng());
        let mut seen = HashSet::new();
        candidates.retain(|queue| seen.insert(queue.normalized().to_string()));
    }

    candidates
}
