//! Per-thread-sharded event counters.
//!
//! Counters are bumped on every lookup, so they are spread over cache-line aligned shards (chosen
//! by the calling thread) to avoid contending on a single line. Reads sum over every shard.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::atomic::{AtomicU64, Ordering},
    thread,
};

const SHARDS: usize = 16;

/// Events counted by [Stats].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    Get,
    Create,
    GetLocked,
    GetLockedWaited,
    BusyLocked,
    MissLocked,
    PageRetries,
    PageFound,
    GetRead,
}

const EVENTS: usize = 9;

#[repr(align(64))]
#[derive(Default)]
struct Shard {
    counters: [AtomicU64; EVENTS],
}

thread_local! {
    static SHARD: usize = {
        let mut hasher = DefaultHasher::new();
        thread::current().id().hash(&mut hasher);
        (hasher.finish() % SHARDS as u64) as usize
    };
}

/// A point-in-time sum of the cache's event counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Lookups (of any kind).
    pub get: u64,
    /// Buffers created by a lookup miss.
    pub create: u64,
    /// Lookups that acquired an existing buffer's lock.
    pub get_locked: u64,
    /// Lookups that had to wait for an existing buffer's lock.
    pub get_locked_waited: u64,
    /// Lookups that gave up because an existing buffer was locked.
    pub busy_locked: u64,
    /// Lookups that missed without creating a buffer.
    pub miss_locked: u64,
    /// Page resolution attempts that had to be retried.
    pub page_retries: u64,
    /// Pages that were already valid when attached to a buffer.
    pub page_found: u64,
    /// Reads issued on behalf of a lookup.
    pub get_read: u64,
}

#[derive(Default)]
pub(crate) struct Stats {
    shards: [Shard; SHARDS],
}

impl Stats {
    /// Count one occurrence of `event`.
    pub fn inc(&self, event: Event) {
        self.add(event, 1);
    }

    /// Count `count` occurrences of `event`.
    pub fn add(&self, event: Event, count: u64) {
        let shard = SHARD.with(|shard| *shard);
        self.shards[shard].counters[event as usize].fetch_add(count, Ordering::Relaxed);
    }

    fn sum(&self, event: Event) -> u64 {
        self.shards
            .iter()
            .map(|s| s.counters[event as usize].load(Ordering::Relaxed))
            .sum()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            get: self.sum(Event::Get),
            create: self.sum(Event::Create),
            get_locked: self.sum(Event::GetLocked),
            get_locked_waited: self.sum(Event::GetLockedWaited),
            busy_locked: self.sum(Event::BusyLocked),
            miss_locked: self.sum(Event::MissLocked),
            page_retries: self.sum(Event::PageRetries),
            page_found: self.sum(Event::PageFound),
            get_read: self.sum(Event::GetRead),
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for shard in &self.shards {
            for counter in &shard.counters {
                counter.store(0, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counts_across_threads() {
        let stats = Arc::new(Stats::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = stats.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        stats.inc(Event::Get);
                    }
                    stats.add(Event::PageFound, 3);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.get, 400);
        assert_eq!(snapshot.page_found, 12);
        assert_eq!(snapshot.create, 0);

        stats.reset();
        assert_eq!(stats.snapshot(), Snapshot::default());
    }
}
