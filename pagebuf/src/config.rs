use std::{
    num::NonZeroUsize,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};

/// Configuration for a [Cache](crate::Cache).
#[derive(Clone, Debug)]
pub struct Config {
    /// The size of each page (in bytes).
    ///
    /// Must be a power of two between 512 and 32768.
    pub page_size: NonZeroUsize,

    /// The number of independently locked buckets buffers are indexed in.
    pub buckets: NonZeroUsize,

    /// How often the flush daemon scans the delayed-write queue (initial value of
    /// [Tunables::flush_interval]).
    pub flush_interval: Duration,

    /// How long a buffer waits on the delayed-write queue before the flush daemon writes it
    /// (initial value of [Tunables::age]).
    pub age: Duration,

    /// Whether to emit a trace event for every buffer state transition (initial value of
    /// [Tunables::trace]).
    pub trace: bool,

    /// The number of times to retry resolving a page before giving up.
    pub page_retries: usize,

    /// How long to wait between page resolution attempts.
    pub retry_delay: Duration,

    /// The maximum number of pages transferred by a single [Request](crate::Request).
    pub chunk_pages: NonZeroUsize,

    /// The number of pending unmaps above which mapping a buffer first purges them.
    pub unmap_threshold: usize,

    /// The maximum number of pending unmaps (unmapping a buffer when full purges them inline).
    pub unmap_capacity: NonZeroUsize,

    /// The maximum size of the flush daemon's mailbox backlog.
    pub mailbox_size: usize,
}

/// Runtime-adjustable settings of a [Cache](crate::Cache).
pub struct Tunables {
    flush_interval: AtomicU64,
    age: AtomicU64,
    trace: AtomicBool,
}

impl Tunables {
    pub(crate) fn new(cfg: &Config) -> Self {
        Self {
            flush_interval: AtomicU64::new(cfg.flush_interval.as_millis() as u64),
            age: AtomicU64::new(cfg.age.as_millis() as u64),
            trace: AtomicBool::new(cfg.trace),
        }
    }

    /// How often the flush daemon scans the delayed-write queue.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval.load(Ordering::Relaxed))
    }

    /// Set how often the flush daemon scans the delayed-write queue (takes effect after the
    /// current sleep).
    pub fn set_flush_interval(&self, interval: Duration) {
        self.flush_interval
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    /// How long a buffer waits on the delayed-write queue before it is written.
    pub fn age(&self) -> Duration {
        Duration::from_millis(self.age.load(Ordering::Relaxed))
    }

    /// Set how long buffers queued from now on wait before they are written.
    pub fn set_age(&self, age: Duration) {
        self.age.store(age.as_millis() as u64, Ordering::Relaxed);
    }

    /// Whether buffer state transitions are traced.
    pub fn trace(&self) -> bool {
        self.trace.load(Ordering::Relaxed)
    }

    /// Enable or disable tracing of buffer state transitions.
    pub fn set_trace(&self, trace: bool) {
        self.trace.store(trace, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunables() {
        let cfg = Config {
            page_size: NonZeroUsize::new(4096).unwrap(),
            buckets: NonZeroUsize::new(1).unwrap(),
            flush_interval: Duration::from_secs(1),
            age: Duration::from_secs(15),
            trace: false,
            page_retries: 0,
            retry_delay: Duration::ZERO,
            chunk_pages: NonZeroUsize::new(1).unwrap(),
            unmap_threshold: 0,
            unmap_capacity: NonZeroUsize::new(1).unwrap(),
            mailbox_size: 1,
        };
        let tunables = Tunables::new(&cfg);
        assert_eq!(tunables.flush_interval(), Duration::from_secs(1));
        assert_eq!(tunables.age(), Duration::from_secs(15));
        assert!(!tunables.trace());

        tunables.set_flush_interval(Duration::from_millis(250));
        tunables.set_age(Duration::from_secs(2));
        tunables.set_trace(true);
        assert_eq!(tunables.flush_interval(), Duration::from_millis(250));
        assert_eq!(tunables.age(), Duration::from_secs(2));
        assert!(tunables.trace());
    }
}
