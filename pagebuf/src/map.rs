//! Contiguous address ranges over multi-page buffers.
//!
//! Tearing down a mapping is expensive relative to creating one, so unmapped ranges are not
//! released immediately. They accumulate on a pending list and are purged in batches: when the
//! list outgrows a threshold (at the next map), when it reaches capacity (at the next unmap), or
//! when the flush daemon runs.

use crate::{buffer::Inner, io::Transport, page::Store, Flags, Page};
use prometheus_client::metrics::gauge::Gauge;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex},
};
use tracing::debug;

/// The first address handed out by the [MapCache].
///
/// Chosen above every page address so the two never overlap.
pub(crate) const VMAP_BASE: u64 = 1 << 48;

struct Mapping {
    pages: Vec<Arc<Page>>,
    unmapped: bool,
}

struct State {
    next: u64,
    live: BTreeMap<u64, Mapping>,
    pending: VecDeque<u64>,

    /// Purged ranges available for reuse, by page count.
    free: BTreeMap<usize, Vec<u64>>,
}

pub(crate) struct MapCache {
    page_size: usize,
    threshold: usize,
    capacity: usize,
    state: Mutex<State>,
    pending_gauge: Gauge,
}

impl MapCache {
    pub fn new(page_size: usize, threshold: usize, capacity: usize, pending_gauge: Gauge) -> Self {
        Self {
            page_size,
            threshold,
            capacity,
            state: Mutex::new(State {
                next: VMAP_BASE,
                live: BTreeMap::new(),
                pending: VecDeque::new(),
                free: BTreeMap::new(),
            }),
            pending_gauge,
        }
    }

    /// Map `pages` into one contiguous range, returning its base address.
    pub fn map(&self, pages: &[Arc<Page>]) -> u64 {
        let mut state = self.state.lock().unwrap();
        if state.pending.len() > self.threshold {
            self.purge_locked(&mut state);
        }

        let count = pages.len();
        let reused = state.free.get_mut(&count).and_then(|bases| bases.pop());
        let base = match reused {
            Some(base) => base,
            None => {
                let base = state.next;
                state.next += (count * self.page_size) as u64;
                base
            }
        };
        state.live.insert(
            base,
            Mapping {
                pages: pages.to_vec(),
                unmapped: false,
            },
        );
        base
    }

    /// Defer teardown of the range starting at `base`.
    pub fn unmap(&self, base: u64) {
        let mut state = self.state.lock().unwrap();
        let Some(mapping) = state.live.get_mut(&base) else {
            return;
        };
        if mapping.unmapped {
            return;
        }
        mapping.unmapped = true;
        state.pending.push_back(base);
        if state.pending.len() >= self.capacity {
            self.purge_locked(&mut state);
        }
        self.pending_gauge.set(state.pending.len() as i64);
    }

    /// Tear down every pending range, returning how many were purged.
    pub fn purge(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        self.purge_locked(&mut state)
    }

    fn purge_locked(&self, state: &mut State) -> usize {
        let purged = state.pending.len();
        while let Some(base) = state.pending.pop_front() {
            let Some(mapping) = state.live.remove(&base) else {
                continue;
            };
            state
                .free
                .entry(mapping.pages.len())
                .or_default()
                .push(base);
        }
        self.pending_gauge.set(0);
        if purged > 0 {
            debug!(purged, "purged unmapped ranges");
        }
        purged
    }

    /// Resolve `address` to the page (and offset within it) it is mapped to.
    pub fn translate(&self, address: u64) -> Option<(Arc<Page>, usize)> {
        let state = self.state.lock().unwrap();
        let (base, mapping) = state.live.range(..=address).next_back()?;
        if mapping.unmapped {
            return None;
        }
        let offset = (address - base) as usize;
        let page = mapping.pages.get(offset / self.page_size)?;
        Some((page.clone(), offset % self.page_size))
    }

    /// The number of unmapped ranges awaiting a purge.
    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }
}

impl<S: Store, T: Transport> Inner<S, T> {
    /// Give the buffer an address covering its whole range.
    ///
    /// Single-page buffers are addressed through their page directly. Larger buffers are only
    /// mapped if `flags` contains [Flags::MAP].
    pub(crate) fn map_pages(&self, flags: Flags) {
        if self.flags().contains(Flags::MAPPED) {
            return;
        }
        let pages = self.pages.lock().unwrap();
        let Some(first) = pages.list.first() else {
            return;
        };
        if pages.list.len() == 1 {
            *self.address.lock().unwrap() = Some(first.address() + pages.offset as u64);
            self.set_flags(Flags::MAPPED);
        } else if flags.contains(Flags::MAP) {
            let base = self.shared.maps.map(&pages.list);
            *self.address.lock().unwrap() = Some(base + pages.offset as u64);
            self.set_flags(Flags::MAPPED | Flags::ADDR_ALLOCATED);
        }
    }

    /// Release the buffer's address (if it was allocated from the [MapCache]).
    pub(crate) fn unmap_pages(&self) {
        let offset = self.pages.lock().unwrap().offset as u64;
        let address = self.address.lock().unwrap().take();
        let flags = self.clear_flags(Flags::MAPPED | Flags::ADDR_ALLOCATED);
        if let (Some(address), true) = (address, flags.contains(Flags::ADDR_ALLOCATED)) {
            self.shared.maps.unmap(address - offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pages(count: usize) -> Vec<Arc<Page>> {
        (0..count as u64)
            .map(|i| Arc::new(Page::new(i, 4096)))
            .collect()
    }

    #[test]
    fn test_translate() {
        let maps = MapCache::new(4096, 4, 8, Gauge::default());
        let pages = pages(3);
        let base = maps.map(&pages);
        assert_eq!(base, VMAP_BASE);

        let (page, offset) = maps.translate(base + 4096 + 10).unwrap();
        assert!(Arc::ptr_eq(&page, &pages[1]));
        assert_eq!(offset, 10);
        assert!(maps.translate(base + 3 * 4096).is_none());
        assert!(maps.translate(base - 1).is_none());
    }

    #[test]
    fn test_unmap_deferred_until_purge() {
        let maps = MapCache::new(4096, 4, 8, Gauge::default());
        let first = maps.map(&pages(2));
        maps.unmap(first);
        maps.unmap(first);
        assert_eq!(maps.pending(), 1);

        // A pending range is unusable but not yet reusable
        assert!(maps.translate(first).is_none());
        let second = maps.map(&pages(2));
        assert_ne!(first, second);

        // Once purged, the range is reused
        assert_eq!(maps.purge(), 1);
        assert_eq!(maps.pending(), 0);
        let third = maps.map(&pages(2));
        assert_eq!(third, first);
    }

    #[test]
    fn test_purge_on_threshold() {
        let maps = MapCache::new(4096, 2, 16, Gauge::default());
        let bases: Vec<_> = (0..3).map(|_| maps.map(&pages(2))).collect();
        for base in &bases {
            maps.unmap(*base);
        }
        assert_eq!(maps.pending(), 3);

        // Mapping with more than the threshold pending purges first
        maps.map(&pages(2));
        assert_eq!(maps.pending(), 0);
    }

    #[test]
    fn test_purge_on_capacity() {
        let gauge = Gauge::default();
        let maps = MapCache::new(4096, 100, 2, gauge.clone());
        let first = maps.map(&pages(2));
        let second = maps.map(&pages(2));
        maps.unmap(first);
        assert_eq!(gauge.get(), 1);
        maps.unmap(second);
        assert_eq!(maps.pending(), 0);
        assert_eq!(gauge.get(), 0);
    }
}
