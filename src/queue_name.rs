//! Queue name value type mapping a logical queue to its Redis keys.
//!
//! A queue named `foobar` is stored across two lists:
//!
//! - `queue:foobar`: pending jobs not yet claimed by any process
//! - `inproc:<identity>:foobar`: jobs claimed by the process with that
//!   identity but not yet acknowledged or requeued
//!
//! Scoping the in-flight list to the owning process lets crash recovery
//! target exactly one process's leftovers. Equality and hashing consider
//! only the normalized name, so collections of queue names produced by
//! different processes can be diffed with set operations.

use std::fmt;
use std::hash::{Hash, Hasher};

/// Marker stripped (together with everything before it) when normalizing
/// a possibly-prefixed queue name.
const QUEUE_PREFIX_MARKER: &str = "queue:";

/// Builds the pending-list key for a normalized queue name.
pub(crate) fn pending_key(name: &str) -> String {
    format!("queue:{name}")
}

/// A normalized queue name bound to a process identity.
#[derive(Debug, Clone)]
pub struct QueueName {
    normalized: String,
    identity: String,
}

impl QueueName {
    /// Creates a queue name from an already-normalized name.
    pub fn new(normalized: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            normalized: normalized.into(),
            identity: identity.into(),
        }
    }

    /// Creates a queue name from a possibly-prefixed raw name, stripping
    /// any namespace up to and including the last `queue:` marker.
    ///
    /// ```
    /// use reliq::QueueName;
    ///
    /// let queue = QueueName::parse("ns:queue:foobar", "host:1:abc");
    /// assert_eq!(queue.normalized(), "foobar");
    /// ```
    pub fn parse(raw: &str, identity: impl Into<String>) -> Self {
        let normalized = match raw.rfind(QUEUE_PREFIX_MARKER) {
            Some(pos) => &raw[pos + QUEUE_PREFIX_MARKER.len()..],
            None => raw,
        };
        Self::new(normalized, identity)
    }

    /// The normalized queue name.
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// Redis key of the pending-jobs list.
    pub fn pending(&self) -> String {
        pending_key(&self.normalized)
    }

    /// Redis key of the in-flight list owned by this queue's identity.
    pub fn inproc(&self) -> String {
        format!("inproc:{}:{}", self.identity, self.normalized)
    }
}

impl PartialEq for QueueName {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for QueueName {}

impl Hash for QueueName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized.hash(state);
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized)
    }
}
