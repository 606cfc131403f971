//! Set whose elements expire after a per-element time-to-live.
//!
//! Used to remember "just tried this queue, skip it for a bit" facts
//! locally. Expiry uses the monotonic clock. Eviction is lazy: it happens
//! only when the set is enumerated, and an expired element is never
//! returned. Re-inserting an element can only extend its expiry, never
//! shorten it.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Thread-safe set of elements with individual expiries.
#[derive(Debug, Default)]
pub struct ExpirableSet<T> {
    entries: Mutex<HashMap<T, Instant>>,
}

impl<T: Eq + Hash + Clone> ExpirableSet<T> {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts `element` with the given time-to-live.
    ///
    /// If the element is already present with a later expiry, the entry
    /// is left untouched.
    pub fn insert(&self, element: T, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        let entry = entries.entry(element).or_insert(expires_at);
        if *entry < expires_at {
            *entry = expires_at;
        }
    }

    /// Evicts expired entries and returns the elements still live.
    pub fn live(&self) -> Vec<T> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        entries.retain(|_, expires_at| now < *expires_at);
        entries.keys().cloned().collect()
    }
}
