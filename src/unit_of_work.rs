//! Envelope around a claimed job payload.
//!
//! A unit of work is created when a payload moves from a queue's pending
//! list into this process's in-flight list, and is consumed exactly once
//! by one of [`acknowledge`](UnitOfWork::acknowledge),
//! [`requeue`](UnitOfWork::requeue) or
//! [`requeue_throttled`](UnitOfWork::requeue_throttled). A unit whose
//! owning process dies before consuming it is recovered by the
//! resurrector, not by the unit itself.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::StoreError;
use crate::queue_name::QueueName;

/// Pushes the payload back to pending and removes it from the in-flight
/// list as one indivisible step. ARGV[1] selects the push side: RPUSH for
/// a normal requeue (back of the queue), LPUSH for a throttled one
/// (front, so it is not retried ahead of untried work).
const REQUEUE_SCRIPT: &str = r#"
redis.call(ARGV[1], KEYS[1], ARGV[2])
redis.call("LREM", KEYS[2], -1, ARGV[2])
return 1
"#;

/// A claimed job payload, owned by this process until consumed.
pub struct UnitOfWork {
    conn: ConnectionManager,
    queue: QueueName,
    payload: String,
}

impl UnitOfWork {
    pub(crate) fn new(conn: ConnectionManager, queue: QueueName, payload: String) -> Self {
        Self {
            conn,
            queue,
            payload,
        }
    }

    /// The opaque job payload.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// The queue this unit was fetched from.
    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    /// Normalized name of the queue this unit was fetched from.
    pub fn queue_name(&self) -> &str {
        self.queue.normalized()
    }

    /// Removes the payload from the in-flight list. Call when the job
    /// finished successfully.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if Redis is unreachable.
    pub async fn acknowledge(self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.lrem::<_, _, ()>(self.queue.inproc(), -1, &self.payload)
            .await?;
        Ok(())
    }

    /// Atomically moves the payload back to the tail of the pending list.
    /// Call when the job must be retried.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if Redis is unreachable.
    pub async fn requeue(self) -> Result<(), StoreError> {
        self.push_back("RPUSH").await
    }

    /// Atomically moves the payload back to the head of the pending list,
    /// so it is not retried immediately ahead of untried work. Used when
    /// the job was throttled rather than attempted.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if Redis is unreachable.
    pub async fn requeue_throttled(self) -> Result<(), StoreError> {
        self.push_back("LPUSH").await
    }

    async fn push_back(self, command: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::Script::new(REQUEUE_SCRIPT)
            .key(self.queue.pending())
            .key(self.queue.inproc())
            .arg(command)
            .arg(&self.payload)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("queue", &self.queue)
            .field("payload", &self.payload)
            .finish()
    }
}
