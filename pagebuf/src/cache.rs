//! The buffer cache and its background tasks.

use crate::{
    buffer::{Buffer, Inner},
    config::{Config, Tunables},
    delwri::{self, FlushFlags, Message, Queue},
    index::{Found, Index},
    io::Transport,
    map::MapCache,
    metrics::Metrics as CacheMetrics,
    page::{Page, Store},
    stats::{Event, Snapshot, Stats},
    Error, Flags, Identity, Target, SECTOR_SIZE,
};
use bytes::BytesMut;
use commonware_macros::select;
use commonware_runtime::{Clock, Handle, Metrics, Spawner};
use futures::{
    channel::{mpsc, oneshot},
    StreamExt,
};
use std::{
    sync::{Arc, Mutex},
    time::SystemTime,
};
use tracing::debug;

/// State shared by the [Cache], its buffers, and its background tasks.
pub(crate) struct Shared<S: Store, T: Transport> {
    pub store: S,
    pub transport: T,
    pub index: Index<S, T>,
    pub maps: MapCache,
    pub delwri: Queue<S, T>,
    pub tunables: Arc<Tunables>,
    pub stats: Stats,
    pub metrics: CacheMetrics,

    /// Buffers whose completion runs on the completion task.
    pub completions: mpsc::UnboundedSender<Buffer<S, T>>,

    pub now: Box<dyn Fn() -> SystemTime + Send + Sync>,

    pub page_size: usize,
    pub chunk_pages: usize,
    pub page_retries: usize,
    pub retry_delay: std::time::Duration,
}

struct Tasks {
    stop_flusher: oneshot::Sender<()>,
    flusher: Handle<()>,
    stop_completions: oneshot::Sender<()>,
    completions: Handle<()>,
}

/// A cache of device byte ranges, each represented by at most one live [Buffer].
#[derive(Clone)]
pub struct Cache<E: Spawner + Clock + Metrics, S: Store, T: Transport> {
    pub(crate) context: E,
    pub(crate) shared: Arc<Shared<S, T>>,
    flusher: mpsc::Sender<Message>,
    tasks: Arc<Mutex<Option<Tasks>>>,
}

impl<E: Spawner + Clock + Metrics, S: Store, T: Transport> Cache<E, S, T> {
    /// Open a cache over `store` and `transport`, starting its flush daemon and completion task.
    ///
    /// # Panics
    ///
    /// Panics if `cfg.page_size` is not a power of two between 512 and 32768.
    pub fn open(context: E, store: S, transport: T, cfg: Config) -> Self {
        let page_size = cfg.page_size.get();
        assert!(
            page_size.is_power_of_two() && (SECTOR_SIZE..=64 * SECTOR_SIZE).contains(&page_size),
            "invalid page size: {page_size}"
        );

        let metrics = CacheMetrics::init(&context);
        let (completions, completion_receiver) = mpsc::unbounded();
        let clock = context.clone();
        let shared = Arc::new(Shared {
            store,
            transport,
            index: Index::new(cfg.buckets.get()),
            maps: MapCache::new(
                page_size,
                cfg.unmap_threshold,
                cfg.unmap_capacity.get(),
                metrics.pending_unmaps.clone(),
            ),
            delwri: Queue::new(),
            tunables: Arc::new(Tunables::new(&cfg)),
            stats: Stats::default(),
            metrics,
            completions,
            now: Box::new(move || clock.current()),
            page_size,
            chunk_pages: cfg.chunk_pages.get(),
            page_retries: cfg.page_retries,
            retry_delay: cfg.retry_delay,
        });

        // Start the flush daemon
        let (flusher, mailbox) = mpsc::channel(cfg.mailbox_size);
        let (stop_flusher, flusher_stopped) = oneshot::channel();
        let flusher_handle = context.with_label("flusher").spawn({
            let shared = shared.clone();
            move |context| delwri::run(context, shared, mailbox, flusher_stopped)
        });

        // Start the completion task
        let (stop_completions, completions_stopped) = oneshot::channel();
        let completions_handle = context
            .with_label("completions")
            .spawn(move |_| complete::<S, T>(completion_receiver, completions_stopped));

        debug!(page_size, buckets = cfg.buckets.get(), "opened cache");
        Self {
            context,
            shared,
            flusher,
            tasks: Arc::new(Mutex::new(Some(Tasks {
                stop_flusher,
                flusher: flusher_handle,
                stop_completions,
                completions: completions_handle,
            }))),
        }
    }

    /// Find the buffer for `identity`, creating it (from `flags`) if `create` is set.
    ///
    /// If `flags` contains [Flags::LOCK] or [Flags::TRYLOCK], an existing buffer is locked
    /// before it is returned ([Flags::TRYLOCK] fails with [Error::Busy] instead of waiting).
    async fn locate(
        &self,
        target: &Target,
        identity: Identity,
        flags: Flags,
        create: bool,
    ) -> Result<Found<S, T>, Error> {
        let shared = &self.shared;
        shared.stats.inc(Event::Get);
        let candidate = create.then(|| {
            let shared = shared.clone();
            let target = *target;
            move || Inner::new(shared, target, identity, flags, true)
        });
        let buffer = match shared.index.find(&identity, candidate) {
            Found::Miss => {
                shared.stats.inc(Event::MissLocked);
                return Ok(Found::Miss);
            }
            Found::Created(buffer) => {
                shared.stats.inc(Event::Create);
                shared.metrics.buffers.inc();
                buffer.inner().trace("create");
                return Ok(Found::Created(buffer));
            }
            Found::Hit(buffer) => buffer,
        };

        if flags.intersects(Flags::LOCK | Flags::TRYLOCK) {
            if buffer.try_lock().is_err() {
                if flags.contains(Flags::TRYLOCK) {
                    shared.stats.inc(Event::BusyLocked);
                    return Err(Error::Busy);
                }
                buffer.lock().await;
                shared.stats.inc(Event::GetLockedWaited);
            }
            shared.stats.inc(Event::GetLocked);
        }

        // A stale buffer is reused as if it were new (keeping only its memory)
        if buffer.flags().contains(Flags::STALE) {
            buffer.inner().clear_flags(
                !(Flags::MAPPED
                    | Flags::ALL_PAGES_MAPPED
                    | Flags::ADDR_ALLOCATED
                    | Flags::MEM_ALLOCATED
                    | Flags::LOCKABLE),
            );
            buffer.inner().trace("reuse stale");
        }
        Ok(Found::Hit(buffer))
    }

    /// Return the live buffer covering `[offset, offset + length)` of `target` (if any) without
    /// creating one.
    ///
    /// See [Cache::get] for the effect of [Flags::LOCK] and [Flags::TRYLOCK].
    pub async fn find(
        &self,
        target: &Target,
        offset: u64,
        length: usize,
        flags: Flags,
    ) -> Result<Option<Buffer<S, T>>, Error> {
        let identity = Identity::new(target.device, offset, length)?;
        match self.locate(target, identity, flags, false).await? {
            Found::Hit(buffer) | Found::Created(buffer) => Ok(Some(buffer)),
            Found::Miss => Ok(None),
        }
    }

    /// Return the buffer covering `[offset, offset + length)` of `target`, creating it (and
    /// attaching its pages) if necessary.
    ///
    /// * [Flags::LOCK] locks the buffer, waiting for the current owner if necessary.
    /// * [Flags::TRYLOCK] locks the buffer or fails with [Error::Busy].
    /// * [Flags::MAP] gives multi-page buffers a contiguous address.
    /// * [Flags::READ] reads any part of the buffer that is not yet valid (always, with
    ///   [Flags::FORCEIO]). A failed read is recorded on the returned buffer (see
    ///   [Buffer::error]) rather than returned. With [Flags::ASYNC], the read completes in the
    ///   background and unlocks the buffer.
    pub async fn get(
        &self,
        target: &Target,
        offset: u64,
        length: usize,
        flags: Flags,
    ) -> Result<Buffer<S, T>, Error> {
        let identity = Identity::new(target.device, offset, length)?;
        let (buffer, created) = match self.locate(target, identity, flags, true).await? {
            Found::Created(buffer) => (buffer, true),
            Found::Hit(buffer) => (buffer, false),
            Found::Miss => unreachable!("lookup with a candidate always inserts"),
        };

        if created || !buffer.flags().contains(Flags::ALL_PAGES_MAPPED) {
            if let Err(err) = self.lookup_pages(&buffer, flags).await {
                if flags.intersects(Flags::LOCK | Flags::TRYLOCK) {
                    buffer.unlock();
                }
                return Err(err);
            }
        }
        buffer.inner().map_pages(flags);
        buffer.set_block(identity.block());
        buffer.inner().trace("get");

        if flags.contains(Flags::READ) {
            if buffer.flags().intersects(Flags::NOT_DONE) || flags.contains(Flags::FORCEIO) {
                self.shared.stats.inc(Event::GetRead);
                let io = flags & (Flags::READ | Flags::ASYNC | Flags::READ_AHEAD);
                if let Err(err) = self.shared.iostart(&buffer, io).await {
                    debug!(
                        device = identity.device,
                        offset = identity.offset,
                        ?err,
                        "read failed"
                    );
                }
            } else if flags.contains(Flags::ASYNC) {
                // Nothing to read, so nothing will complete and unlock the buffer
                if flags.intersects(Flags::LOCK | Flags::TRYLOCK) {
                    buffer.unlock();
                }
            } else {
                buffer.inner().clear_flags(Flags::READ);
            }
        }
        Ok(buffer)
    }

    /// Create a buffer that is not indexed (and has no pages).
    ///
    /// Attach memory with [Buffer::associate_memory] and set its block with
    /// [Buffer::set_block] before starting I/O on it.
    pub fn lookup(
        &self,
        target: &Target,
        offset: u64,
        length: usize,
    ) -> Result<Buffer<S, T>, Error> {
        let identity = Identity::new(target.device, offset, length)?;
        let inner = Inner::new(self.shared.clone(), *target, identity, Flags::empty(), false);
        Ok(Buffer::adopt(Arc::new(inner)))
    }

    /// Create a buffer that is not indexed, backed by `length` bytes of zeroed memory.
    pub fn alloc_uncached(&self, target: &Target, length: usize) -> Result<Buffer<S, T>, Error> {
        let buffer = self.lookup(target, 0, length)?;
        buffer.associate_memory(BytesMut::zeroed(length))?;
        Ok(buffer)
    }

    /// Start an asynchronous read of `[offset, offset + length)` of `target` unless the device
    /// is congested or the buffer is busy.
    ///
    /// The read populates the backing [Store], so a later [Cache::get] finds valid pages.
    pub async fn readahead(&self, target: &Target, offset: u64, length: usize, flags: Flags) {
        if self.shared.transport.congested(target.device) {
            return;
        }
        let flags = flags
            | Flags::READ
            | Flags::ASYNC
            | Flags::TRYLOCK
            | Flags::READ_AHEAD
            | Flags::DONT_BLOCK;
        if let Err(err) = self.get(target, offset, length, flags).await {
            debug!(device = target.device, offset, ?err, "skipped read-ahead");
        }
    }

    /// Start I/O on `buffer` as described by `flags` (one of [Flags::READ], [Flags::WRITE], or
    /// [Flags::DELWRI], optionally with [Flags::ASYNC]).
    ///
    /// Synchronous I/O waits for completion and returns its outcome. Asynchronous I/O unlocks
    /// the buffer on completion. [Flags::DELWRI] queues the buffer for delayed write and unlocks
    /// it.
    pub async fn iostart(&self, buffer: &Buffer<S, T>, flags: Flags) -> Result<(), Error> {
        self.shared.iostart(buffer, flags).await
    }

    /// Submit the transfer already described by the buffer's flags.
    pub async fn iorequest(&self, buffer: &Buffer<S, T>) {
        self.shared.iorequest(buffer).await
    }

    /// Complete `buffer` without I/O (for example, after recording an error with
    /// [Buffer::ioerror]).
    ///
    /// If `schedule` is set, asynchronous completion work runs on the completion task.
    pub fn iodone(&self, buffer: &Buffer<S, T>, schedule: bool) {
        Shared::iodone(buffer.clone(), schedule);
    }

    /// Queue `buffer` for delayed write, optionally unlocking it.
    pub fn delwri_queue(&self, buffer: &Buffer<S, T>, unlock: bool) {
        self.shared.delwri_queue(buffer.clone(), unlock);
    }

    /// Remove `buffer` from the delayed-write queue.
    pub fn delwri_dequeue(&self, buffer: &Buffer<S, T>) {
        self.shared.delwri_dequeue(buffer);
    }

    /// Write every queued buffer of `device`, returning how many could not be written (because
    /// they are pinned or, with [FlushFlags::trylock], locked).
    pub async fn delwri_flush(&self, device: u64, flags: FlushFlags) -> usize {
        self.shared.delwri_flush(device, flags).await
    }

    /// Wake the flush daemon, forcing it to write every writable queued buffer if `force` is
    /// set.
    pub fn wake(&self, force: bool) {
        if let Err(err) = self.flusher.clone().try_send(Message::Wake { force }) {
            debug!(?err, "flush daemon busy");
        }
    }

    /// Tear down every pending unmapped address range, returning how many were purged.
    pub fn purge_unmaps(&self) -> usize {
        self.shared.maps.purge()
    }

    /// Resolve a mapped `address` to its page and the offset within it.
    pub fn translate(&self, address: u64) -> Option<(Arc<Page>, usize)> {
        self.shared.maps.translate(address)
    }

    /// The number of buffers in the index.
    pub fn len(&self) -> usize {
        self.shared.index.len()
    }

    /// Returns whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of buffers on the delayed-write queue.
    pub fn delwri_len(&self) -> usize {
        self.shared.delwri.len()
    }

    /// The number of unmapped address ranges awaiting a purge.
    pub fn pending_unmaps(&self) -> usize {
        self.shared.maps.pending()
    }

    /// The cache's event counters.
    pub fn stats(&self) -> Snapshot {
        self.shared.stats.snapshot()
    }

    /// Zero the cache's event counters.
    pub fn reset_stats(&self) {
        self.shared.stats.reset();
    }

    /// The cache's runtime-adjustable settings.
    pub fn tunables(&self) -> Arc<Tunables> {
        self.shared.tunables.clone()
    }

    /// Write every queued buffer (waiting for completion), then stop the background tasks.
    ///
    /// Buffers that are still pinned are removed from the queue without being written.
    pub async fn close(self) {
        for device in self.shared.delwri.devices() {
            let skipped = self
                .delwri_flush(
                    device,
                    FlushFlags {
                        wait: true,
                        trylock: false,
                    },
                )
                .await;
            if skipped > 0 {
                debug!(device, skipped, "skipped pinned buffers");
            }
        }

        let tasks = self.tasks.lock().unwrap().take();
        if let Some(tasks) = tasks {
            let _ = tasks.stop_flusher.send(());
            let _ = tasks.flusher.await;
            let _ = tasks.stop_completions.send(());
            let _ = tasks.completions.await;
        }

        // Buffers still queued (pinned) are dropped unwritten
        let abandoned = self.shared.delwri_drain();
        if !abandoned.is_empty() {
            debug!(count = abandoned.len(), "dropped unwritten buffers");
        }
        drop(abandoned);
        self.shared.maps.purge();
        debug!("closed cache");
    }
}

/// Run scheduled completions until `stop` fires, then finish any that remain.
async fn complete<S: Store, T: Transport>(
    mut receiver: mpsc::UnboundedReceiver<Buffer<S, T>>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        select! {
            _ = &mut stop => {
                break;
            },
            buffer = receiver.next() => {
                let Some(buffer) = buffer else {
                    return;
                };
                Shared::iodone_work(buffer);
            },
        };
    }
    while let Ok(buffer) = receiver.try_recv() {
        Shared::iodone_work(buffer);
    }
    debug!("completion task stopped");
}
