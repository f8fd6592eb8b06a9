//! The cached representation of a device byte range.

use crate::{
    cache::Shared,
    io::Transport,
    page::{Page, Store},
    sync::{Event, Lock, Waiters},
    Error, Flags, Identity, Target,
};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tracing::trace;

/// Sentinel for a buffer without a block number.
const NO_BLOCK: u64 = u64::MAX;

type IoDone<S, T> = Arc<dyn Fn(&Buffer<S, T>) + Send + Sync>;
type Release<S, T> = Arc<dyn Fn(Buffer<S, T>) + Send + Sync>;

/// A copy between a [Buffer] and caller memory.
pub enum IoMove<'a> {
    /// Copy from the buffer into the slice.
    Read(&'a mut [u8]),

    /// Copy from the slice into the buffer.
    Write(&'a [u8]),

    /// Zero the given number of bytes of the buffer.
    Zero(usize),
}

impl IoMove<'_> {
    fn len(&self) -> usize {
        match self {
            IoMove::Read(buf) => buf.len(),
            IoMove::Write(buf) => buf.len(),
            IoMove::Zero(len) => *len,
        }
    }
}

/// The pages attached to a buffer.
pub(crate) struct Pages {
    pub list: Vec<Arc<Page>>,

    /// Offset of the buffer's first byte within the first page.
    pub offset: usize,
}

/// What happens when the last hold on a buffer is released.
enum LastHold<S: Store, T: Transport> {
    Release(Release<S, T>),
    Requeue,
    Destroy,
}

pub(crate) struct Inner<S: Store, T: Transport> {
    pub shared: Arc<Shared<S, T>>,
    pub target: Target,
    pub identity: Identity,

    /// Whether the buffer is reachable through the index.
    pub hashed: bool,

    flags: AtomicU32,
    pub holds: AtomicU32,
    pins: AtomicU32,
    pin_waiters: Waiters,
    lock: Lock,

    /// Serializes attaching pages to the buffer.
    pub fill: Lock,

    pub pages: Mutex<Pages>,
    pub address: Mutex<Option<u64>>,
    block: AtomicU64,

    /// Set while the buffer's pages are locked on its behalf (instead of the buffer's own lock
    /// serializing I/O).
    pub pages_locked: AtomicBool,

    /// Outstanding I/O chunks (plus one while requests are still being built).
    pub io_remaining: AtomicU32,
    pub done: Event,
    error: Mutex<Option<Error>>,

    iodone: Mutex<Option<IoDone<S, T>>>,
    release: Mutex<Option<Release<S, T>>>,
}

impl<S: Store, T: Transport> Inner<S, T> {
    /// Create a buffer with a single hold.
    ///
    /// If `flags` contains [Flags::LOCK] or [Flags::TRYLOCK], the buffer starts out locked.
    pub fn new(
        shared: Arc<Shared<S, T>>,
        target: Target,
        identity: Identity,
        flags: Flags,
        hashed: bool,
    ) -> Self {
        let locked = flags.intersects(Flags::LOCK | Flags::TRYLOCK);
        let mut state = (flags & (Flags::READ | Flags::WRITE | Flags::ASYNC))
            | Flags::NONE
            | Flags::UNINITIAL;
        if hashed {
            state |= Flags::LOCKABLE;
        }
        let offset = (identity.offset % shared.page_size as u64) as usize;
        Self {
            shared,
            target,
            identity,
            hashed,
            flags: AtomicU32::new(state.bits()),
            holds: AtomicU32::new(1),
            pins: AtomicU32::new(0),
            pin_waiters: Waiters::new(),
            lock: Lock::new(locked),
            fill: Lock::new(false),
            pages: Mutex::new(Pages {
                list: Vec::new(),
                offset,
            }),
            address: Mutex::new(None),
            block: AtomicU64::new(NO_BLOCK),
            pages_locked: AtomicBool::new(false),
            io_remaining: AtomicU32::new(0),
            done: Event::new(true),
            error: Mutex::new(None),
            iodone: Mutex::new(None),
            release: Mutex::new(None),
        }
    }

    pub fn flags(&self) -> Flags {
        Flags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    /// Set `flags`, returning the previous flags.
    pub fn set_flags(&self, flags: Flags) -> Flags {
        Flags::from_bits_retain(self.flags.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    /// Clear `flags`, returning the previous flags.
    pub fn clear_flags(&self, flags: Flags) -> Flags {
        Flags::from_bits_retain(self.flags.fetch_and(!flags.bits(), Ordering::AcqRel))
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_held()
    }

    pub fn try_lock(&self) -> bool {
        self.lock.try_acquire()
    }

    pub fn unlock(&self) {
        self.lock.release();
    }

    pub fn iodone_callback(&self) -> Option<IoDone<S, T>> {
        self.iodone.lock().unwrap().clone()
    }

    pub fn has_release(&self) -> bool {
        self.release.lock().unwrap().is_some()
    }

    pub fn set_error(&self, error: Option<Error>) {
        *self.error.lock().unwrap() = error;
    }

    /// Record `error` unless an earlier error is already recorded.
    pub fn set_first_error(&self, error: Error) {
        self.error.lock().unwrap().get_or_insert(error);
    }

    pub fn error(&self) -> Option<Error> {
        self.error.lock().unwrap().clone()
    }

    pub fn block(&self) -> Option<u64> {
        match self.block.load(Ordering::Acquire) {
            NO_BLOCK => None,
            block => Some(block),
        }
    }

    pub fn pins(&self) -> u32 {
        self.pins.load(Ordering::Acquire)
    }

    /// Wait for the pin count to reach zero, kicking the transport while waiting.
    pub async fn wait_unpin(&self) {
        loop {
            let Some(receiver) = self.pin_waiters.register(|| self.pins() == 0) else {
                return;
            };
            self.shared.transport.unplug();
            let _ = receiver.await;
        }
    }

    /// Decide the buffer's fate after its last hold was released.
    fn last_hold(&self) -> LastHold<S, T> {
        // The release callback receives the final hold once
        if let Some(release) = self.release.lock().unwrap().take() {
            self.holds.store(1, Ordering::Release);
            return LastHold::Release(release);
        }
        if self.flags().contains(Flags::DELWRI) {
            self.set_flags(Flags::ASYNC);
            self.holds.store(1, Ordering::Release);
            return LastHold::Requeue;
        }
        LastHold::Destroy
    }

    /// Tear down the buffer (at most once).
    pub fn destroy(&self) {
        if self.set_flags(Flags::FREED).contains(Flags::FREED) {
            return;
        }
        self.unmap_pages();
        let pages = std::mem::take(&mut self.pages.lock().unwrap().list);
        if self.pages_locked.swap(false, Ordering::AcqRel) {
            for page in &pages {
                page.unlock();
            }
        }
        self.clear_flags(Flags::MEM_ALLOCATED | Flags::ALL_PAGES_MAPPED);
        self.shared.metrics.destroyed.inc();
        self.trace("destroy");
    }

    /// Emit a trace event describing the buffer (if tracing is enabled).
    pub fn trace(&self, event: &'static str) {
        if !self.shared.tunables.trace() {
            return;
        }
        trace!(
            event,
            device = self.identity.device,
            offset = self.identity.offset,
            length = self.identity.length,
            flags = ?self.flags(),
            holds = self.holds.load(Ordering::Relaxed),
            pins = self.pins(),
            locked = self.is_locked(),
            "buffer"
        );
    }
}

/// A handle to a cached device byte range.
///
/// Each handle accounts for one hold on the buffer: cloning a handle takes a hold and dropping
/// it releases one. Handles compare equal when they refer to the same buffer.
pub struct Buffer<S: Store, T: Transport> {
    inner: Arc<Inner<S, T>>,
}

impl<S: Store, T: Transport> Buffer<S, T> {
    /// Wrap `inner` without taking a hold (the caller transfers one).
    pub(crate) fn adopt(inner: Arc<Inner<S, T>>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<Inner<S, T>> {
        &self.inner
    }

    /// The device the buffer belongs to.
    pub fn target(&self) -> Target {
        self.inner.target
    }

    /// The byte range the buffer covers.
    pub fn identity(&self) -> Identity {
        self.inner.identity
    }

    /// The current state of the buffer.
    pub fn flags(&self) -> Flags {
        self.inner.flags()
    }

    /// The number of holds on the buffer.
    pub fn holds(&self) -> u32 {
        self.inner.holds.load(Ordering::Acquire)
    }

    /// Take another hold on the buffer.
    pub fn hold(&self) -> Self {
        self.clone()
    }

    /// Release this handle's hold.
    pub fn rele(self) {
        drop(self);
    }

    /// Unlock the buffer (unless a release callback is installed) and release this handle's
    /// hold.
    pub fn relse(self) {
        if !self.inner.has_release() {
            self.inner.unlock();
        }
        drop(self);
    }

    /// Remove the buffer from the index and destroy it immediately, regardless of any other
    /// holds.
    ///
    /// Other handles remain valid but refer to a buffer without pages.
    pub fn free(self) {
        let inner = self.inner.clone();
        if inner.hashed {
            let removed = inner.shared.index.lock(&inner.identity).remove(&inner);
            if removed.is_some() {
                inner.shared.metrics.buffers.dec();
            }
        }
        inner.shared.delwri_dequeue(&self);
        inner.destroy();
        drop(self);
    }

    /// Lock the buffer, waiting for the current owner to unlock it.
    pub async fn lock(&self) {
        if !self.inner.lock.try_acquire() {
            if self.pins() > 0 {
                self.inner.shared.transport.unplug();
            }
            self.inner.lock.acquire().await;
        }
        self.inner.trace("lock");
    }

    /// Lock the buffer if it is unlocked.
    pub fn try_lock(&self) -> Result<(), Error> {
        if !self.inner.lock.try_acquire() {
            self.inner.trace("lock busy");
            return Err(Error::Busy);
        }
        self.inner.trace("lock");
        Ok(())
    }

    /// Unlock the buffer.
    ///
    /// The buffer may be unlocked by a different task than the one that locked it.
    pub fn unlock(&self) {
        self.inner.unlock();
        self.inner.trace("unlock");
    }

    /// Returns whether the buffer is locked.
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Pin the buffer, preventing it from being written until unpinned.
    pub fn pin(&self) {
        self.inner.pins.fetch_add(1, Ordering::AcqRel);
        self.inner.trace("pin");
    }

    /// Release a pin, waking writers waiting on the buffer once none remain.
    ///
    /// Unpinning an unpinned buffer has no effect.
    pub fn unpin(&self) {
        let previous = self
            .inner
            .pins
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pins| pins.checked_sub(1));
        if previous == Ok(1) {
            self.inner.pin_waiters.wake_all();
        }
        self.inner.trace("unpin");
    }

    /// The number of pins on the buffer.
    pub fn pins(&self) -> u32 {
        self.inner.pins()
    }

    /// Returns whether the buffer is pinned.
    pub fn is_pinned(&self) -> bool {
        self.pins() > 0
    }

    /// Wait for the buffer's in-flight I/O to complete, returning its outcome.
    pub async fn iowait(&self) -> Result<(), Error> {
        if !self.inner.done.is_fired() {
            self.inner.shared.transport.unplug();
        }
        self.inner.done.wait().await;
        match self.inner.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Record (or clear) the buffer's error.
    pub fn ioerror(&self, error: Option<Error>) {
        self.inner.set_error(error);
    }

    /// The error recorded by the buffer's last I/O (if any).
    pub fn error(&self) -> Option<Error> {
        self.inner.error()
    }

    /// The device sector I/O on the buffer starts at.
    pub fn block(&self) -> Option<u64> {
        self.inner.block()
    }

    /// Set the device sector I/O on the buffer starts at.
    pub fn set_block(&self, block: u64) {
        self.inner.block.store(block, Ordering::Release);
    }

    /// Mark the contents of the buffer as meaningless, dropping any pending delayed write.
    pub fn stale(&self) {
        self.inner.set_flags(Flags::STALE);
        self.inner.shared.delwri_dequeue(self);
        self.inner.trace("stale");
    }

    /// Install a callback run (instead of waking waiters) when I/O on the buffer completes.
    ///
    /// The callback is responsible for completing the buffer, for example by unlocking it.
    pub fn set_iodone(&self, callback: impl Fn(&Buffer<S, T>) + Send + Sync + 'static) {
        *self.inner.iodone.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Remove the I/O completion callback.
    pub fn clear_iodone(&self) {
        *self.inner.iodone.lock().unwrap() = None;
    }

    /// Install a callback that receives the final hold when the last handle is dropped.
    ///
    /// The callback runs once. Dropping the handle it receives destroys the buffer (unless the
    /// callback installed itself again).
    pub fn set_release(&self, callback: impl Fn(Buffer<S, T>) + Send + Sync + 'static) {
        *self.inner.release.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Remove the release callback.
    pub fn clear_release(&self) {
        *self.inner.release.lock().unwrap() = None;
    }

    /// The number of pages attached to the buffer.
    pub fn page_count(&self) -> usize {
        self.inner.pages.lock().unwrap().list.len()
    }

    /// The pages attached to the buffer.
    pub fn pages(&self) -> Vec<Arc<Page>> {
        self.inner.pages.lock().unwrap().list.clone()
    }

    /// Copy between the buffer and caller memory, starting `offset` bytes into the buffer.
    pub fn iomove(&self, offset: usize, mut op: IoMove<'_>) -> Result<(), Error> {
        let len = op.len();
        match offset.checked_add(len) {
            Some(end) if end <= self.inner.identity.length => {}
            _ => return Err(Error::OutOfRange(offset, len)),
        }

        let page_size = self.inner.shared.page_size;
        let pages = self.inner.pages.lock().unwrap();
        let mut cursor = pages.offset + offset;
        let mut moved = 0;
        while moved < len {
            let Some(page) = pages.list.get(cursor / page_size) else {
                return Err(Error::Unpopulated);
            };
            let in_page = cursor % page_size;
            let n = (page_size - in_page).min(len - moved);
            match &mut op {
                IoMove::Read(buf) => page.read(in_page, &mut buf[moved..moved + n]),
                IoMove::Write(buf) => page.write(in_page, &buf[moved..moved + n]),
                IoMove::Zero(_) => page.zero(in_page, n),
            }
            cursor += n;
            moved += n;
        }
        Ok(())
    }

    /// The address of the byte `offset` bytes into the buffer.
    ///
    /// Mapped buffers resolve through their contiguous address. Otherwise the address is that
    /// of the containing page (so consecutive offsets are only contiguous within a page).
    pub fn offset(&self, offset: usize) -> Option<u64> {
        if offset >= self.inner.identity.length {
            return None;
        }
        if self.flags().contains(Flags::MAPPED) {
            if let Some(address) = *self.inner.address.lock().unwrap() {
                return Some(address + offset as u64);
            }
        }
        let page_size = self.inner.shared.page_size;
        let pages = self.inner.pages.lock().unwrap();
        let cursor = pages.offset + offset;
        let page = pages.list.get(cursor / page_size)?;
        Some(page.address() + (cursor % page_size) as u64)
    }

    /// The contiguous address of the buffer's first byte (if mapped).
    pub fn address(&self) -> Option<u64> {
        if !self.flags().contains(Flags::MAPPED) {
            return None;
        }
        *self.inner.address.lock().unwrap()
    }

    /// Attach caller-supplied memory to a buffer without pages.
    ///
    /// `memory` must be exactly as long as the buffer. It is split into pages that are
    /// considered up to date, and the buffer is mapped over them.
    pub fn associate_memory(&self, mut memory: bytes::BytesMut) -> Result<(), Error> {
        if memory.len() != self.inner.identity.length {
            return Err(Error::InvalidLength(memory.len()));
        }
        let page_size = self.inner.shared.page_size;
        {
            let mut pages = self.inner.pages.lock().unwrap();
            if !pages.list.is_empty() {
                return Err(Error::AlreadyPopulated);
            }
            let mut index = 0;
            while !memory.is_empty() {
                let mut chunk = memory.split_to(page_size.min(memory.len()));
                if chunk.len() < page_size {
                    chunk.resize(page_size, 0);
                }
                pages.list.push(Arc::new(Page::wrap(index, chunk, true)));
                index += 1;
            }
            pages.offset = 0;
        }
        self.inner.clear_flags(Flags::NONE | Flags::PARTIAL);
        self.inner.set_flags(Flags::ALL_PAGES_MAPPED);
        self.inner.map_pages(Flags::MAP);
        self.inner.trace("associate");
        Ok(())
    }
}

impl<S: Store, T: Transport> Clone for Buffer<S, T> {
    fn clone(&self) -> Self {
        self.inner.holds.fetch_add(1, Ordering::AcqRel);
        self.inner.trace("hold");
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Store, T: Transport> Drop for Buffer<S, T> {
    fn drop(&mut self) {
        let inner = &self.inner;
        inner.trace("rele");

        // Releasing the last hold on an indexed buffer must exclude concurrent lookups
        let bucket = inner
            .hashed
            .then(|| inner.shared.index.lock(&inner.identity));
        if inner.holds.fetch_sub(1, Ordering::AcqRel) != 1
            || inner.flags().contains(Flags::FREED)
        {
            return;
        }
        let last = inner.last_hold();
        let removed = match (&last, bucket) {
            (LastHold::Destroy, Some(mut bucket)) => bucket.remove(inner),
            _ => None,
        };
        if removed.is_some() {
            inner.shared.metrics.buffers.dec();
        }
        drop(removed);

        match last {
            LastHold::Release(release) => release(Buffer::adopt(inner.clone())),
            LastHold::Requeue => inner
                .shared
                .delwri_queue(Buffer::adopt(inner.clone()), false),
            LastHold::Destroy => inner.destroy(),
        }
    }
}

impl<S: Store, T: Transport> PartialEq for Buffer<S, T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<S: Store, T: Transport> Eq for Buffer<S, T> {}

impl<S: Store, T: Transport> fmt::Debug for Buffer<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("identity", &self.inner.identity)
            .field("flags", &self.flags())
            .field("holds", &self.holds())
            .field("pins", &self.pins())
            .finish()
    }
}
