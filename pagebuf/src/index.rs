//! Map each live [Identity] to the one [Buffer] that owns it.
//!
//! The index is split into independently locked buckets. Looking up an identity and (on a miss)
//! inserting a new buffer for it happen under the same bucket lock, so concurrent callers always
//! agree on a single owner.

use crate::{
    buffer::{Buffer, Inner},
    io::Transport,
    page::Store,
    Flags, Identity,
};
use std::{
    collections::{hash_map::DefaultHasher, VecDeque},
    hash::{Hash, Hasher},
    sync::{atomic::Ordering, Arc, Mutex, MutexGuard},
};

/// The result of [Index::find].
pub(crate) enum Found<S: Store, T: Transport> {
    /// An existing buffer was found (and a hold was taken on it).
    Hit(Buffer<S, T>),

    /// No buffer existed, so the provided candidate was inserted.
    Created(Buffer<S, T>),

    /// No buffer existed and no candidate was provided.
    Miss,
}

/// The buffers whose identity hashes to the same bucket, most recently found first.
pub(crate) struct Bucket<S: Store, T: Transport> {
    entries: VecDeque<Arc<Inner<S, T>>>,
}

impl<S: Store, T: Transport> Bucket<S, T> {
    /// Remove `inner` from the bucket, returning it if it was present.
    ///
    /// The caller should drop the returned value only after releasing the bucket lock.
    pub fn remove(&mut self, inner: &Arc<Inner<S, T>>) -> Option<Arc<Inner<S, T>>> {
        let position = self.entries.iter().position(|e| Arc::ptr_eq(e, inner))?;
        self.entries.remove(position)
    }

    /// The number of buffers in the bucket.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

pub(crate) struct Index<S: Store, T: Transport> {
    buckets: Vec<Mutex<Bucket<S, T>>>,
}

impl<S: Store, T: Transport> Index<S, T> {
    /// Create an index with `buckets` buckets.
    pub fn new(buckets: usize) -> Self {
        assert!(buckets > 0);
        Self {
            buckets: (0..buckets)
                .map(|_| {
                    Mutex::new(Bucket {
                        entries: VecDeque::new(),
                    })
                })
                .collect(),
        }
    }

    fn slot(&self, identity: &Identity) -> usize {
        let mut hasher = DefaultHasher::new();
        (identity.device, identity.offset).hash(&mut hasher);
        (hasher.finish() % self.buckets.len() as u64) as usize
    }

    /// Lock the bucket that `identity` hashes to.
    pub fn lock(&self, identity: &Identity) -> MutexGuard<'_, Bucket<S, T>> {
        self.buckets[self.slot(identity)].lock().unwrap()
    }

    /// Find the live buffer for `identity`, inserting the buffer built by `create` if there is
    /// none (and `create` is provided).
    ///
    /// Buffers that are being freed never match.
    pub fn find(
        &self,
        identity: &Identity,
        create: Option<impl FnOnce() -> Inner<S, T>>,
    ) -> Found<S, T> {
        let mut bucket = self.lock(identity);
        let position = bucket.entries.iter().position(|entry| {
            entry.identity == *identity && !entry.flags().contains(Flags::FREED)
        });
        if let Some(entry) = position.and_then(|position| bucket.entries.remove(position)) {
            // Move the entry to the front so that hot buffers are found first
            entry.holds.fetch_add(1, Ordering::AcqRel);
            bucket.entries.push_front(entry.clone());
            return Found::Hit(Buffer::adopt(entry));
        }

        let Some(create) = create else {
            return Found::Miss;
        };
        let inner = Arc::new(create());
        bucket.entries.push_front(inner.clone());
        Found::Created(Buffer::adopt(inner))
    }

    /// The number of buffers in the index.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().unwrap().len()).sum()
    }
}
