//! Memory pages and the backing store that supplies them.

use crate::{sync::Lock, SECTOR_SHIFT, SECTOR_SIZE};
use bytes::BytesMut;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

/// Source of frame numbers, which give every page a distinct address.
static NEXT_FRAME: AtomicU64 = AtomicU64::new(1);

/// Supplies (and caches) the memory pages that back a device's byte range.
pub trait Store: Clone + Send + Sync + 'static {
    /// Return the page at `index` (in units of the page size) of `device`, creating a zeroed page
    /// that is not yet up to date if none exists.
    ///
    /// Returns `None` if a page could not be allocated. Allocation failure is assumed to be
    /// transient: the caller may retry.
    fn resolve(&self, device: u64, index: u64, size: usize) -> Option<Arc<Page>>;

    /// Record that `page` was recently used.
    fn touch(&self, page: &Page);
}

#[derive(Default)]
struct State {
    uptodate: bool,
    error: bool,

    /// One bit per sector of the page that is known to hold valid data.
    valid: u64,
}

/// A page of memory.
///
/// Pages are shared between every buffer whose range covers them.
pub struct Page {
    index: u64,
    frame: u64,
    size: usize,
    data: Mutex<BytesMut>,
    state: Mutex<State>,
    lock: Lock,
}

impl Page {
    /// Create a zeroed page that is not yet up to date.
    ///
    /// # Panics
    ///
    /// Panics if `size` is not a power of two between [SECTOR_SIZE] and `64 * SECTOR_SIZE`.
    pub fn new(index: u64, size: usize) -> Self {
        Self::wrap(index, BytesMut::zeroed(size), false)
    }

    /// Create a page over caller-supplied memory.
    pub(crate) fn wrap(index: u64, data: BytesMut, uptodate: bool) -> Self {
        let size = data.len();
        assert!(size.is_power_of_two());
        assert!((SECTOR_SIZE..=64 * SECTOR_SIZE).contains(&size));
        let valid = if uptodate { Self::full_mask(size) } else { 0 };
        Self {
            index,
            frame: NEXT_FRAME.fetch_add(1, Ordering::Relaxed),
            size,
            data: Mutex::new(data),
            state: Mutex::new(State {
                uptodate,
                error: false,
                valid,
            }),
            lock: Lock::new(false),
        }
    }

    /// The index of the page within its device (in units of the page size).
    pub fn index(&self) -> u64 {
        self.index
    }

    /// The size of the page in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The address of the first byte of the page.
    pub fn address(&self) -> u64 {
        self.frame * self.size as u64
    }

    /// Returns whether the whole page holds valid data.
    pub fn is_uptodate(&self) -> bool {
        self.state.lock().unwrap().uptodate
    }

    /// Mark the whole page as holding valid data.
    pub fn set_uptodate(&self) {
        let mut state = self.state.lock().unwrap();
        state.uptodate = true;
        state.error = false;
        state.valid = Self::full_mask(self.size);
    }

    /// Returns whether the last transfer involving the page failed.
    pub fn is_error(&self) -> bool {
        self.state.lock().unwrap().error
    }

    /// Record that a transfer involving the page failed.
    pub fn set_error(&self) {
        self.state.lock().unwrap().error = true;
    }

    /// Copy bytes starting at `offset` into `buf`.
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        let data = self.data.lock().unwrap();
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }

    /// Copy `buf` into the page starting at `offset`.
    pub fn write(&self, offset: usize, buf: &[u8]) {
        let mut data = self.data.lock().unwrap();
        data[offset..offset + buf.len()].copy_from_slice(buf);
    }

    /// Zero `len` bytes starting at `offset`.
    pub fn zero(&self, offset: usize, len: usize) {
        let mut data = self.data.lock().unwrap();
        data[offset..offset + len].fill(0);
    }

    /// Returns whether every sector touched by `[offset, offset + len)` holds valid data.
    pub(crate) fn is_region_valid(&self, offset: usize, len: usize) -> bool {
        let mask = Self::region_mask(offset, len);
        let state = self.state.lock().unwrap();
        state.uptodate || state.valid & mask == mask
    }

    /// Record that every sector touched by `[offset, offset + len)` holds valid data, marking the
    /// page up to date once every sector is valid.
    pub(crate) fn set_region_valid(&self, offset: usize, len: usize) {
        let mut state = self.state.lock().unwrap();
        state.valid |= Self::region_mask(offset, len);
        if state.valid == Self::full_mask(self.size) {
            state.uptodate = true;
        }
    }

    /// Lock the page for I/O.
    pub(crate) async fn lock(&self) {
        self.lock.acquire().await;
    }

    /// Unlock a page locked with [Page::lock].
    pub(crate) fn unlock(&self) {
        self.lock.release();
    }

    /// Returns whether the page is locked for I/O.
    pub fn is_locked(&self) -> bool {
        self.lock.is_held()
    }

    fn full_mask(size: usize) -> u64 {
        let sectors = size >> SECTOR_SHIFT;
        if sectors == 64 {
            u64::MAX
        } else {
            (1 << sectors) - 1
        }
    }

    fn region_mask(offset: usize, len: usize) -> u64 {
        if len == 0 {
            return 0;
        }
        let first = offset >> SECTOR_SHIFT;
        let last = (offset + len - 1) >> SECTOR_SHIFT;
        let count = last - first + 1;
        let bits = if count == 64 {
            u64::MAX
        } else {
            (1 << count) - 1
        };
        bits << first
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_mask() {
        assert_eq!(Page::region_mask(0, 0), 0);
        assert_eq!(Page::region_mask(0, 512), 0b1);
        assert_eq!(Page::region_mask(0, 513), 0b11);
        assert_eq!(Page::region_mask(512, 1024), 0b110);
        assert_eq!(Page::region_mask(1000, 100), 0b110);
        assert_eq!(Page::region_mask(0, 64 * 512), u64::MAX);
        assert_eq!(Page::full_mask(4096), 0xFF);
        assert_eq!(Page::full_mask(32768), u64::MAX);
    }

    #[test]
    fn test_region_validity() {
        let page = Page::new(0, 4096);
        assert!(!page.is_uptodate());
        assert!(!page.is_region_valid(0, 512));

        // Validate the first half of the page
        page.set_region_valid(0, 2048);
        assert!(page.is_region_valid(0, 512));
        assert!(page.is_region_valid(1024, 1024));
        assert!(!page.is_region_valid(1024, 2048));
        assert!(!page.is_uptodate());

        // Validating the rest marks the page up to date
        page.set_region_valid(2048, 2048);
        assert!(page.is_uptodate());
        assert!(page.is_region_valid(0, 4096));
    }

    #[test]
    fn test_uptodate_implies_valid() {
        let page = Page::new(3, 4096);
        page.set_error();
        page.set_uptodate();
        assert!(!page.is_error());
        assert!(page.is_region_valid(512, 512));
        assert_eq!(page.index(), 3);
    }

    #[test]
    fn test_read_write_zero() {
        let page = Page::new(0, 1024);
        page.write(100, &[1, 2, 3]);
        let mut buf = [0u8; 5];
        page.read(99, &mut buf);
        assert_eq!(buf, [0, 1, 2, 3, 0]);
        page.zero(101, 1);
        page.read(99, &mut buf);
        assert_eq!(buf, [0, 1, 0, 3, 0]);
    }

    #[test]
    fn test_addresses_distinct() {
        let a = Page::new(0, 4096);
        let b = Page::new(0, 4096);
        assert_ne!(a.address(), b.address());
        assert_eq!(a.address() % 4096, 0);
    }

    #[test]
    #[should_panic]
    fn test_invalid_size() {
        Page::new(0, 1000);
    }
}
