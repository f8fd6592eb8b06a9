//! Transfers between buffers and devices.
//!
//! A transfer is split into [Request]s of at most `chunk_pages` pages each. The buffer counts
//! outstanding requests (plus one while requests are still being submitted) and completes once
//! the count reaches zero, so completion never races submission.

use crate::{
    buffer::{Buffer, Inner},
    cache::Shared,
    page::{Page, Store},
    Error, Flags, SECTOR_SHIFT,
};
use std::sync::{atomic::Ordering, Arc};
use tracing::{debug, warn};

/// The direction of a [Request].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Read,
    Write,
}

/// A contiguous region of a page transferred by a [Request].
#[derive(Clone)]
pub struct Fragment {
    pub page: Arc<Page>,

    /// Offset of the region within the page.
    pub offset: usize,

    /// Length of the region.
    pub len: usize,
}

type Done = Box<dyn FnOnce(Vec<Fragment>, Result<(), Error>) + Send>;

/// A transfer between consecutive device sectors and a list of page regions.
///
/// The first fragment maps to sector `block`, and each following fragment continues where the
/// previous one ended.
pub struct Request {
    /// The device to transfer to or from.
    pub device: u64,

    /// The first sector of the transfer.
    pub block: u64,

    /// The direction of the transfer.
    pub op: Op,

    /// The page regions, in device order.
    pub fragments: Vec<Fragment>,

    done: Done,
}

impl Request {
    /// The total number of bytes transferred.
    pub fn bytes(&self) -> usize {
        self.fragments.iter().map(|f| f.len).sum()
    }

    /// Report the outcome of the transfer.
    pub fn complete(self, result: Result<(), Error>) {
        (self.done)(self.fragments, result);
    }
}

/// A device driver that buffers are read from and written to.
pub trait Transport: Clone + Send + Sync + 'static {
    /// Start `request`, calling [Request::complete] once it finishes.
    ///
    /// Completion may happen inline (before `submit` returns) or from any other thread or task.
    fn submit(&self, request: Request);

    /// Start any requests the transport is holding back to batch them.
    fn unplug(&self) {}

    /// Returns whether `device` is too busy to accept optional (read-ahead) requests.
    fn congested(&self, _device: u64) -> bool {
        false
    }
}

impl<S: Store, T: Transport> Shared<S, T> {
    /// Start I/O on `buffer` as described by `flags`, waiting for it to complete unless `flags`
    /// contains [Flags::ASYNC].
    ///
    /// If `flags` contains [Flags::DELWRI], the buffer is queued for delayed write (and unlocked)
    /// instead.
    pub async fn iostart(&self, buffer: &Buffer<S, T>, flags: Flags) -> Result<(), Error> {
        let inner = buffer.inner();
        if flags.contains(Flags::DELWRI) {
            inner.clear_flags(Flags::READ | Flags::WRITE);
            inner.set_flags(Flags::DELWRI | Flags::ASYNC);
            self.delwri_queue(buffer.clone(), true);
            return Ok(());
        }

        inner.clear_flags(
            Flags::READ | Flags::WRITE | Flags::ASYNC | Flags::DELWRI | Flags::READ_AHEAD,
        );
        inner.set_flags(flags & (Flags::READ | Flags::WRITE | Flags::ASYNC | Flags::READ_AHEAD));
        self.delwri_dequeue(buffer);
        if inner.block().is_none() {
            return Err(Error::NoBlock);
        }

        self.iorequest(buffer).await;
        if flags.contains(Flags::ASYNC) {
            return Ok(());
        }
        buffer.iowait().await
    }

    /// Submit the transfer described by the buffer's flags.
    ///
    /// Writes wait for the buffer to be unpinned first. Delayed-write buffers are (re)queued
    /// instead.
    pub async fn iorequest(&self, buffer: &Buffer<S, T>) {
        let inner = buffer.inner();
        if inner.flags().contains(Flags::DELWRI) {
            self.delwri_queue(buffer.clone(), true);
            return;
        }
        if inner.flags().contains(Flags::WRITE) {
            inner.wait_unpin().await;
        }

        // Hold the buffer until the transfer completes
        let held = buffer.clone();
        inner.set_error(None);
        inner.done.reset();
        inner.io_remaining.store(1, Ordering::Release);
        inner.trace("iorequest");
        self.ioapply(&held).await;
        Inner::finish_chunk(held, false);
    }

    async fn ioapply(&self, buffer: &Buffer<S, T>) {
        let inner = buffer.inner();
        let flags = inner.flags();
        let op = if flags.contains(Flags::READ) {
            Op::Read
        } else {
            Op::Write
        };
        let (pages, offset) = {
            let pages = inner.pages.lock().unwrap();
            (pages.list.clone(), pages.offset)
        };
        if pages.is_empty() {
            inner.set_first_error(Error::Unpopulated);
            return;
        }
        let Some(block) = inner.block() else {
            if inner.pages_locked.swap(false, Ordering::AcqRel) {
                for page in &pages {
                    page.unlock();
                }
            }
            inner.set_first_error(Error::NoBlock);
            return;
        };
        let length = inner.identity.length;
        let block_size = inner.target.block_size as usize;

        // A short read of a locked page reads the whole page
        if length < self.page_size
            && op == Op::Read
            && pages.len() == 1
            && block_size == self.page_size
            && inner.pages_locked.load(Ordering::Acquire)
        {
            let fragment = Fragment {
                page: pages[0].clone(),
                offset: 0,
                len: self.page_size,
            };
            let start = block - (offset as u64 >> SECTOR_SHIFT);
            self.submit(buffer, op, start, vec![fragment]);
            return;
        }

        if op == Op::Write
            && !flags.contains(Flags::LOCKABLE)
            && !inner.pages_locked.load(Ordering::Acquire)
        {
            for page in &pages {
                page.lock().await;
            }
            inner.pages_locked.store(true, Ordering::Release);
        }

        let mut cursor = offset;
        let mut remaining = length;
        let mut start = block;
        let mut fragments = Vec::with_capacity(self.chunk_pages.min(pages.len()));
        let mut chunk_bytes = 0;
        while remaining > 0 {
            let in_page = cursor % self.page_size;
            let len = (self.page_size - in_page).min(remaining);
            fragments.push(Fragment {
                page: pages[cursor / self.page_size].clone(),
                offset: in_page,
                len,
            });
            cursor += len;
            remaining -= len;
            chunk_bytes += len;
            if fragments.len() == self.chunk_pages || remaining == 0 {
                self.submit(buffer, op, start, std::mem::take(&mut fragments));
                start += (chunk_bytes >> SECTOR_SHIFT) as u64;
                chunk_bytes = 0;
            }
        }
    }

    fn submit(&self, buffer: &Buffer<S, T>, op: Op, block: u64, fragments: Vec<Fragment>) {
        let inner = buffer.inner();
        inner.io_remaining.fetch_add(1, Ordering::AcqRel);
        let held = buffer.clone();
        let request = Request {
            device: inner.identity.device,
            block,
            op,
            fragments,
            done: Box::new(move |fragments, result| {
                Inner::end_chunk(held, op, block, fragments, result)
            }),
        };
        self.transport.submit(request);
    }

    /// Complete `buffer` (without I/O) once no chunks remain outstanding.
    pub fn iodone(buffer: Buffer<S, T>, schedule: bool) {
        let inner = buffer.inner();
        inner.pages_locked.store(false, Ordering::Release);
        inner.clear_flags(Flags::READ | Flags::WRITE | Flags::READ_AHEAD);
        if inner.error().is_none() {
            inner.clear_flags(Flags::NONE | Flags::PARTIAL | Flags::UNINITIAL);
        }
        inner.trace("iodone");

        if inner.iodone_callback().is_none() && !inner.flags().contains(Flags::ASYNC) {
            inner.done.fire();
            return;
        }
        if !schedule {
            Self::iodone_work(buffer);
            return;
        }
        let completions = inner.shared.completions.clone();
        if let Err(err) = completions.unbounded_send(buffer) {
            // The completion task has stopped
            Self::iodone_work(err.into_inner());
        }
    }

    /// Finish an asynchronous (or callback-driven) completion.
    pub fn iodone_work(buffer: Buffer<S, T>) {
        let inner = buffer.inner();
        if let Some(callback) = inner.iodone_callback() {
            callback(&buffer);
        } else if inner.flags().contains(Flags::ASYNC)
            && inner.flags().contains(Flags::LOCKABLE)
            && !inner.has_release()
        {
            inner.unlock();
        }
        inner.done.fire();
    }
}

impl<S: Store, T: Transport> Inner<S, T> {
    fn end_chunk(
        buffer: Buffer<S, T>,
        op: Op,
        block: u64,
        fragments: Vec<Fragment>,
        result: Result<(), Error>,
    ) {
        let inner = buffer.inner();
        let whole_pages = inner.target.block_size as usize == inner.shared.page_size;
        match &result {
            Ok(()) => {
                for fragment in &fragments {
                    if whole_pages || fragment.len == fragment.page.size() {
                        fragment.page.set_uptodate();
                    } else {
                        fragment.page.set_region_valid(fragment.offset, fragment.len);
                    }
                }
            }
            Err(err) => {
                warn!(
                    device = inner.identity.device,
                    block,
                    ?op,
                    ?err,
                    "transfer failed"
                );
                inner.shared.metrics.io_errors.inc();
                inner.set_first_error(err.clone());
                for fragment in &fragments {
                    fragment.page.set_error();
                }
            }
        }
        if inner.pages_locked.load(Ordering::Acquire) {
            for fragment in &fragments {
                fragment.page.unlock();
            }
        }
        Self::finish_chunk(buffer, true);
    }

    fn finish_chunk(buffer: Buffer<S, T>, schedule: bool) {
        if buffer.inner().io_remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        debug!(
            device = buffer.inner().identity.device,
            offset = buffer.inner().identity.offset,
            "transfer complete"
        );
        Shared::iodone(buffer, schedule);
    }
}
