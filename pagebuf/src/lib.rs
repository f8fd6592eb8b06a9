//! Cache byte ranges of block devices in reference-counted, page-backed buffers.
//!
//! A [Cache] sits between consumers of block device data (metadata and data paths of a
//! file system, for example) and a backing [Store] of memory pages. Each byte range of a
//! [Target] is represented by at most one live [Buffer] at a time. Buffers are assembled from
//! the pages covering their range, optionally mapped into one contiguous address range, and read
//! or written through a [Transport].
//!
//! # Holds and Pins
//!
//! Every [Buffer] handle accounts for one _hold_. Cloning a handle takes another hold and
//! dropping it releases one. When the last hold is released, the buffer is destroyed unless it is
//! waiting on the delayed-write queue (in which case the queue keeps it alive) or a release
//! callback is installed (in which case the callback receives the final hold).
//!
//! _Pins_ are counted independently. A pinned buffer is never written back (the write path waits
//! for the pin count to reach zero and the flush daemon skips it), but pinning has no effect on
//! destruction.
//!
//! # Delayed Writes
//!
//! Buffers can be queued for delayed write instead of being written immediately. A background
//! task flushes queued buffers once they have aged past [Tunables::age], checking every
//! [Tunables::flush_interval]. [Cache::delwri_flush] writes every queued buffer of a device
//! immediately (optionally waiting for completion).
//!
//! # Example
//!
//! ```rust
//! use commonware_pagebuf::{
//!     mocks::{MemoryDisk, MemoryStore},
//!     Cache, Config, Flags, IoMove, Target,
//! };
//! use commonware_runtime::{deterministic, Metrics, Runner};
//! use std::{num::NonZeroUsize, time::Duration};
//!
//! let executor = deterministic::Runner::default();
//! executor.start(|context| async move {
//!     // Open a cache over an in-memory disk
//!     let cfg = Config {
//!         page_size: NonZeroUsize::new(4096).unwrap(),
//!         buckets: NonZeroUsize::new(64).unwrap(),
//!         flush_interval: Duration::from_secs(1),
//!         age: Duration::from_secs(15),
//!         trace: false,
//!         page_retries: 3,
//!         retry_delay: Duration::from_millis(10),
//!         chunk_pages: NonZeroUsize::new(16).unwrap(),
//!         unmap_threshold: 64,
//!         unmap_capacity: NonZeroUsize::new(256).unwrap(),
//!         mailbox_size: 16,
//!     };
//!     let disk = MemoryDisk::new();
//!     let cache = Cache::open(context.with_label("cache"), MemoryStore::new(), disk.clone(), cfg);
//!
//!     // Get a locked buffer covering two pages and fill it
//!     let target = Target::new(1, 4096);
//!     let buffer = cache.get(&target, 4096, 8192, Flags::LOCK | Flags::MAP).await.unwrap();
//!     buffer.iomove(0, IoMove::Write(&[0xAA; 8192])).unwrap();
//!
//!     // Write it out and wait for completion
//!     cache.iostart(&buffer, Flags::WRITE).await.unwrap();
//!     assert_eq!(disk.read(1, 4096, 8192), vec![0xAA; 8192]);
//!
//!     buffer.relse();
//!     cache.close().await;
//! });
//! ```

#![doc(
    html_logo_url = "https://commonware.xyz/imgs/rustdoc_logo.svg",
    html_favicon_url = "https://commonware.xyz/favicon.ico"
)]

use bitflags::bitflags;
use thiserror::Error;

mod buffer;
pub use buffer::{Buffer, IoMove};
mod cache;
pub use cache::Cache;
mod config;
pub use config::{Config, Tunables};
mod delwri;
pub use delwri::FlushFlags;
mod index;
mod io;
pub use io::{Fragment, Op, Request, Transport};
mod map;
mod metrics;
pub mod mocks;
mod page;
pub use page::{Page, Store};
mod populate;
mod stats;
pub use stats::Snapshot;
mod sync;

/// Log2 of [SECTOR_SIZE].
pub const SECTOR_SHIFT: u32 = 9;

/// The unit in which devices are addressed (and the alignment of every buffer).
pub const SECTOR_SIZE: usize = 1 << SECTOR_SHIFT;

/// Errors that can occur when interacting with the cache.
///
/// Errors are cloneable so that a failure recorded on a [Buffer] can be returned to every task
/// waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("buffer busy")]
    Busy,
    #[error("out of memory")]
    NoMemory,
    #[error("misaligned range: offset={0} length={1}")]
    Misaligned(u64, usize),
    #[error("range out of bounds: offset={0} length={1}")]
    OutOfRange(usize, usize),
    #[error("invalid length: {0}")]
    InvalidLength(usize),
    #[error("buffer has no block number")]
    NoBlock,
    #[error("buffer has no pages")]
    Unpopulated,
    #[error("buffer already populated")]
    AlreadyPopulated,
    #[error("read failed: device={0} block={1}")]
    ReadFailed(u64, u64),
    #[error("write failed: device={0} block={1}")]
    WriteFailed(u64, u64),
    #[error("request aborted: device={0} block={1}")]
    Aborted(u64, u64),
}

bitflags! {
    /// State of a [Buffer] and the options of a request made against one.
    ///
    /// State and request options share one bit space: request options passed to an operation
    /// are partially recorded on the buffer (for example [Flags::ASYNC] on an I/O request).
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Flags: u32 {
        /// Read I/O is (or will be) in progress.
        const READ = 1 << 0;
        /// Write I/O is (or will be) in progress.
        const WRITE = 1 << 1;
        /// The buffer has an address covering its whole range.
        const MAPPED = 1 << 2;
        /// I/O completion releases the buffer's lock instead of waking a waiter.
        const ASYNC = 1 << 3;
        /// No page of the buffer holds valid data.
        const NONE = 1 << 4;
        /// The buffer waits on the delayed-write queue.
        const DELWRI = 1 << 5;
        /// The contents of the buffer are no longer meaningful.
        const STALE = 1 << 6;
        /// Some, but not all, pages of the buffer hold valid data.
        const PARTIAL = 1 << 7;
        /// The buffer was never read or written.
        const UNINITIAL = 1 << 8;
        /// The buffer was destroyed (or is being destroyed).
        const FREED = 1 << 9;
        /// Read even if every page is already valid.
        const FORCEIO = 1 << 10;
        /// Acquire the buffer's lock, waiting if necessary.
        const LOCK = 1 << 11;
        /// Acquire the buffer's lock only if it is free.
        const TRYLOCK = 1 << 12;
        /// Never sleep while assembling the buffer.
        const DONT_BLOCK = 1 << 13;
        /// Read-ahead request: give up instead of retrying.
        const READ_AHEAD = 1 << 14;
        /// Map the buffer into a contiguous address range.
        const MAP = 1 << 15;
        /// The buffer uses its own lock (instead of page locks) to serialize I/O.
        const LOCKABLE = 1 << 16;
        /// Every page of the range is attached.
        const ALL_PAGES_MAPPED = 1 << 17;
        /// The buffer's address was allocated from the mapping cache.
        const ADDR_ALLOCATED = 1 << 18;
        /// The buffer owns memory (pages) to release on destruction.
        const MEM_ALLOCATED = 1 << 19;
    }
}

impl Flags {
    /// Flags indicating that at least part of the buffer must still be read.
    pub const NOT_DONE: Flags = Flags::NONE.union(Flags::PARTIAL);
}

/// A block device that buffers are cached for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Target {
    /// Identity of the device.
    pub device: u64,

    /// Block size of the consumer (in bytes). When smaller than the page size, validity of
    /// pages is tracked per sector instead of per page.
    pub block_size: u32,
}

impl Target {
    /// Create a new [Target].
    pub const fn new(device: u64, block_size: u32) -> Self {
        Self { device, block_size }
    }
}

/// The (device, offset, length) triple that names a [Buffer] while it is live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Identity {
    pub device: u64,
    pub offset: u64,
    pub length: usize,
}

impl Identity {
    /// Create a new [Identity], requiring `offset` and `length` to be sector aligned and the
    /// range to cover at least one sector.
    pub fn new(device: u64, offset: u64, length: usize) -> Result<Self, Error> {
        if offset % SECTOR_SIZE as u64 != 0 || length % SECTOR_SIZE != 0 || length == 0 {
            return Err(Error::Misaligned(offset, length));
        }
        if offset.checked_add(length as u64).is_none() {
            return Err(Error::Misaligned(offset, length));
        }
        Ok(Self {
            device,
            offset,
            length,
        })
    }

    /// The first sector of the range.
    pub const fn block(&self) -> u64 {
        self.offset >> SECTOR_SHIFT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_identity_alignment() {
        assert!(Identity::new(1, 0, SECTOR_SIZE).is_ok());
        assert!(Identity::new(1, 4096, 8192).is_ok());
        assert_eq!(
            Identity::new(1, 100, SECTOR_SIZE),
            Err(Error::Misaligned(100, SECTOR_SIZE))
        );
        assert_eq!(Identity::new(1, 0, 100), Err(Error::Misaligned(0, 100)));
        assert_eq!(Identity::new(1, 0, 0), Err(Error::Misaligned(0, 0)));
        let end = u64::MAX - (u64::MAX % SECTOR_SIZE as u64);
        assert!(Identity::new(1, end, SECTOR_SIZE).is_err());
    }

    #[test_case(0, 0; "first sector")]
    #[test_case(512, 1; "second sector")]
    #[test_case(8192, 16; "third page")]
    #[test_case(1 << 40, 1 << 31; "far offset")]
    fn test_identity_block(offset: u64, block: u64) {
        let identity = Identity::new(7, offset, 512).unwrap();
        assert_eq!(identity.block(), block);
    }

    #[test]
    fn test_not_done() {
        assert!(Flags::NOT_DONE.contains(Flags::NONE));
        assert!(Flags::NOT_DONE.contains(Flags::PARTIAL));
        assert!(!Flags::NOT_DONE.contains(Flags::STALE));
    }
}
