use commonware_pagebuf::{
    mocks::{MemoryDisk, MemoryStore},
    Cache, Config,
};
use commonware_runtime::deterministic::Context;
use criterion::criterion_main;
use std::{num::NonZeroUsize, time::Duration};

mod get;
mod iomove;

criterion_main!(get::benches, iomove::benches);

/// The page size used by every benchmark.
const PAGE_SIZE: usize = 4096;

/// A cache over in-memory devices.
type BenchCache = Cache<Context, MemoryStore, MemoryDisk>;

/// Open a cache with enough buckets that chains stay short.
fn open(context: Context) -> BenchCache {
    let cfg = Config {
        page_size: NonZeroUsize::new(PAGE_SIZE).unwrap(),
        buckets: NonZeroUsize::new(1024).unwrap(),
        flush_interval: Duration::from_secs(1),
        age: Duration::from_secs(15),
        trace: false,
        page_retries: 0,
        retry_delay: Duration::ZERO,
        chunk_pages: NonZeroUsize::new(16).unwrap(),
        unmap_threshold: 64,
        unmap_capacity: NonZeroUsize::new(1024).unwrap(),
        mailbox_size: 16,
    };
    Cache::open(context, MemoryStore::new(), MemoryDisk::new(), cfg)
}
