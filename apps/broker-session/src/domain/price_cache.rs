//! Price Cache
//!
//! Instrument id → last known snapshot, stamped with the local time it was
//! written. Entries older than the caller's `max_age` are reported as misses.
//! The whole map sits behind one mutex; it holds tens of instruments at most.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::quote::PriceSnapshot;

#[derive(Debug, Clone)]
struct CacheEntry {
    snapshot: PriceSnapshot,
    updated_at: Instant,
}

/// Thread-safe, staleness-aware price cache.
#[derive(Debug, Default)]
pub struct PriceCache {
    entries: Mutex<HashMap<u64, CacheEntry>>,
}

impl PriceCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot for `uic` if it was written no more than `max_age` ago.
    #[must_use]
    pub fn get(&self, uic: u64, max_age: Duration) -> Option<PriceSnapshot> {
        self.get_as_of(uic, max_age, Instant::now())
    }

    /// [`PriceCache::get`] evaluated at an explicit instant.
    #[must_use]
    pub fn get_as_of(&self, uic: u64, max_age: Duration, now: Instant) -> Option<PriceSnapshot> {
        let entries = self.entries.lock();
        let entry = entries.get(&uic)?;
        let age = now.saturating_duration_since(entry.updated_at);
        (age <= max_age).then(|| entry.snapshot.clone())
    }

    /// Overwrite the entry for `uic`, stamping it with the current time.
    pub fn put(&self, uic: u64, snapshot: PriceSnapshot) {
        self.entries.lock().insert(
            uic,
            CacheEntry {
                snapshot,
                updated_at: Instant::now(),
            },
        );
    }

    /// Merge a streamed delta onto the current entry and restamp it.
    ///
    /// Returns the merged snapshot.
    pub fn merge(&self, uic: u64, delta: PriceSnapshot) -> PriceSnapshot {
        let mut entries = self.entries.lock();
        let entry = entries.entry(uic).or_insert_with(|| CacheEntry {
            snapshot: PriceSnapshot::default(),
            updated_at: Instant::now(),
        });
        entry.snapshot.merge(delta);
        entry.updated_at = Instant::now();
        entry.snapshot.clone()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of entries, fresh or stale.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when no entries are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
