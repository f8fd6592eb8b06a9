//! Delayed writes and the daemon that flushes them.
//!
//! Buffers queued for delayed write wait in FIFO order (each holding the queue's hold) until
//! they age past their flush time, a flush is forced, or their device is flushed explicitly.

use crate::{
    buffer::Buffer,
    cache::Shared,
    io::Transport,
    page::Store,
    Flags,
};
use commonware_macros::select;
use commonware_runtime::{Clock, Spawner};
use futures::{
    channel::{mpsc, oneshot},
    StreamExt,
};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::SystemTime,
};
use tracing::debug;

/// Options for [Cache::delwri_flush](crate::Cache::delwri_flush).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushFlags {
    /// Wait for every write to complete (and unlock each buffer) before returning.
    pub wait: bool,

    /// Skip (and count) buffers whose lock is held instead of waiting for it.
    pub trylock: bool,
}

struct Entry<S: Store, T: Transport> {
    buffer: Buffer<S, T>,
    flush_at: SystemTime,
}

/// The delayed-write queue.
pub(crate) struct Queue<S: Store, T: Transport> {
    entries: Mutex<VecDeque<Entry<S, T>>>,
}

impl<S: Store, T: Transport> Queue<S, T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// The number of queued buffers.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// The devices with at least one queued buffer.
    pub fn devices(&self) -> Vec<u64> {
        let entries = self.entries.lock().unwrap();
        let mut devices: Vec<u64> = entries
            .iter()
            .map(|e| e.buffer.inner().identity.device)
            .collect();
        devices.sort_unstable();
        devices.dedup();
        devices
    }
}

impl<S: Store, T: Transport> Shared<S, T> {
    /// Queue `buffer` for delayed write (moving it to the tail if already queued).
    ///
    /// The queue keeps `buffer` as its hold. If `unlock` is set, the buffer is unlocked once
    /// queued.
    pub fn delwri_queue(&self, buffer: Buffer<S, T>, unlock: bool) {
        let inner = buffer.inner().clone();
        let flush_at = (self.now)() + self.tunables.age();
        let previous = {
            let mut entries = self.delwri.entries.lock().unwrap();
            let previous = entries
                .iter()
                .position(|e| e.buffer == buffer)
                .and_then(|position| entries.remove(position));
            inner.set_flags(Flags::DELWRI);
            entries.push_back(Entry { buffer, flush_at });
            self.metrics.delwri.set(entries.len() as i64);
            previous
        };
        if unlock && inner.flags().contains(Flags::LOCKABLE) {
            inner.unlock();
        }
        inner.trace("delwri queue");

        // Release the hold of the replaced entry outside the queue lock
        drop(previous);
    }

    /// Remove `buffer` from the delayed-write queue (if queued).
    pub fn delwri_dequeue(&self, buffer: &Buffer<S, T>) {
        let removed = {
            let mut entries = self.delwri.entries.lock().unwrap();
            let removed = entries
                .iter()
                .position(|e| e.buffer == *buffer)
                .and_then(|position| entries.remove(position));
            self.metrics.delwri.set(entries.len() as i64);
            removed
        };
        buffer.inner().clear_flags(Flags::DELWRI);
        if removed.is_some() {
            buffer.inner().trace("delwri dequeue");
        }
        drop(removed);
    }

    /// Empty the queue, returning the buffers it held with [Flags::DELWRI] cleared.
    ///
    /// The caller drops the returned buffers outside the queue lock.
    pub fn delwri_drain(&self) -> Vec<Buffer<S, T>> {
        let mut entries = self.delwri.entries.lock().unwrap();
        let drained = entries
            .drain(..)
            .map(|entry| {
                entry.buffer.inner().clear_flags(Flags::DELWRI);
                entry.buffer
            })
            .collect();
        self.metrics.delwri.set(0);
        drained
    }

    /// Remove every queued buffer that is due (or every buffer, if `force` is set) and can be
    /// written now, locking each one.
    ///
    /// Pinned buffers and buffers whose lock is held are skipped. Scanning stops at the first
    /// buffer that is not yet due.
    fn take_due(&self, now: SystemTime, force: bool) -> Vec<Buffer<S, T>> {
        let mut due = Vec::new();
        let mut entries = self.delwri.entries.lock().unwrap();
        let mut position = 0;
        while position < entries.len() {
            let entry = &entries[position];
            let inner = entry.buffer.inner();
            let lockable = inner.flags().contains(Flags::LOCKABLE);
            if inner.pins() > 0 || (lockable && !inner.try_lock()) {
                position += 1;
                continue;
            }
            if !force && entry.flush_at > now {
                if lockable {
                    inner.unlock();
                }
                break;
            }
            let Some(entry) = entries.remove(position) else {
                break;
            };
            let inner = entry.buffer.inner();
            inner.clear_flags(Flags::DELWRI | Flags::READ);
            inner.set_flags(Flags::WRITE | Flags::ASYNC);
            due.push(entry.buffer);
        }
        self.metrics.delwri.set(entries.len() as i64);
        due
    }

    /// Write every due buffer, returning how many were written.
    pub async fn flush_due(&self, now: SystemTime, force: bool) -> usize {
        let due = self.take_due(now, force);
        let count = due.len();
        for buffer in due {
            self.iorequest(&buffer).await;
            self.metrics.flushed.inc();
        }
        if count > 0 {
            self.transport.unplug();
            debug!(count, force, "flushed delayed writes");
        }
        count
    }

    /// Write every queued buffer of `device`, returning the number of buffers that could not be
    /// written (because they are pinned or, with [FlushFlags::trylock], locked).
    pub async fn delwri_flush(&self, device: u64, flags: FlushFlags) -> usize {
        let mut skipped = 0;
        let mut selected = Vec::new();
        {
            let mut entries = self.delwri.entries.lock().unwrap();
            let mut position = 0;
            while position < entries.len() {
                let inner = entries[position].buffer.inner();
                if inner.identity.device != device {
                    position += 1;
                    continue;
                }
                if inner.pins() > 0 {
                    skipped += 1;
                    position += 1;
                    continue;
                }
                let lockable = inner.flags().contains(Flags::LOCKABLE);
                let locked = flags.trylock && lockable;
                if locked && !inner.try_lock() {
                    skipped += 1;
                    position += 1;
                    continue;
                }
                if let Some(entry) = entries.remove(position) {
                    selected.push((entry.buffer, locked));
                }
            }
            self.metrics.delwri.set(entries.len() as i64);
        }

        let mut waiting = Vec::new();
        for (buffer, locked) in selected {
            let inner = buffer.inner();
            if !locked && inner.flags().contains(Flags::LOCKABLE) {
                buffer.lock().await;
            }
            inner.clear_flags(Flags::DELWRI | Flags::READ);
            if flags.wait {
                inner.clear_flags(Flags::ASYNC);
                inner.set_flags(Flags::WRITE);
            } else {
                inner.set_flags(Flags::WRITE | Flags::ASYNC);
            }
            self.iorequest(&buffer).await;
            self.metrics.flushed.inc();
            if flags.wait {
                waiting.push(buffer);
            }
        }
        self.transport.unplug();

        for buffer in waiting {
            if let Err(err) = buffer.iowait().await {
                debug!(?err, device, "delayed write failed");
            }
            let inner = buffer.inner();
            if inner.flags().contains(Flags::LOCKABLE) && !inner.has_release() {
                inner.unlock();
            }
        }
        debug!(device, skipped, "flushed device");
        skipped
    }
}

/// Messages sent to the flush daemon.
pub(crate) enum Message {
    /// Scan the queue now, writing every writable buffer if `force` is set.
    Wake { force: bool },
}

/// Run the flush daemon until `stop` fires.
pub(crate) async fn run<E: Clock + Spawner, S: Store, T: Transport>(
    context: E,
    shared: Arc<Shared<S, T>>,
    mut mailbox: mpsc::Receiver<Message>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        let mut force = false;
        select! {
            _ = &mut stop => {
                debug!("flush daemon stopped");
                return;
            },
            message = mailbox.next() => {
                let Some(Message::Wake { force: forced }) = message else {
                    debug!("mailbox closed");
                    return;
                };
                force = forced;
            },
            _ = context.sleep(shared.tunables.flush_interval()) => {},
        };
        shared.flush_due(context.current(), force).await;
        shared.maps.purge();
    }
}

