//! In-memory implementations of [Store] and [Transport] for testing.

use crate::{
    io::{Op, Request, Transport},
    page::{Page, Store},
    Error, SECTOR_SIZE,
};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
};

#[derive(Default)]
struct StoreState {
    pages: HashMap<(u64, u64), Arc<Page>>,
    failures: usize,
    resolves: usize,
    touches: usize,
}

/// A [Store] that keeps every page it creates.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` page resolutions.
    pub fn fail(&self, count: usize) {
        self.state.lock().unwrap().failures = count;
    }

    /// The page at `index` of `device` (if it was ever resolved).
    pub fn page(&self, device: u64, index: u64) -> Option<Arc<Page>> {
        self.state.lock().unwrap().pages.get(&(device, index)).cloned()
    }

    /// The number of pages created.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().pages.len()
    }

    /// Returns whether no page was created.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of resolutions attempted (including failed ones).
    pub fn resolves(&self) -> usize {
        self.state.lock().unwrap().resolves
    }

    /// The number of times a page was marked as recently used.
    pub fn touches(&self) -> usize {
        self.state.lock().unwrap().touches
    }
}

impl Store for MemoryStore {
    fn resolve(&self, device: u64, index: u64, size: usize) -> Option<Arc<Page>> {
        let mut state = self.state.lock().unwrap();
        state.resolves += 1;
        if state.failures > 0 {
            state.failures -= 1;
            return None;
        }
        let page = state
            .pages
            .entry((device, index))
            .or_insert_with(|| Arc::new(Page::new(index, size)));
        Some(page.clone())
    }

    fn touch(&self, _page: &Page) {
        self.state.lock().unwrap().touches += 1;
    }
}

#[derive(Default)]
struct DiskState {
    devices: HashMap<u64, Vec<u8>>,
    log: Vec<(u64, u64, Op)>,
    paused: bool,
    held: VecDeque<Request>,
    failures: HashSet<(u64, u64)>,
    congested: bool,
    unplugs: usize,
    transferred: usize,
}

impl DiskState {
    fn perform(&mut self, request: &Request) -> Result<(), Error> {
        if self.failures.contains(&(request.device, request.block)) {
            return Err(match request.op {
                Op::Read => Error::ReadFailed(request.device, request.block),
                Op::Write => Error::WriteFailed(request.device, request.block),
            });
        }
        let disk = self.devices.entry(request.device).or_default();
        let mut position = request.block as usize * SECTOR_SIZE;
        for fragment in &request.fragments {
            let end = position + fragment.len;
            if disk.len() < end {
                disk.resize(end, 0);
            }
            match request.op {
                Op::Read => fragment
                    .page
                    .write(fragment.offset, &disk[position..end]),
                Op::Write => fragment
                    .page
                    .read(fragment.offset, &mut disk[position..end]),
            }
            position = end;
        }
        self.transferred += request.bytes();
        Ok(())
    }
}

/// A [Transport] over in-memory devices that records every request.
///
/// Requests complete inline unless the disk is paused, in which case they are held until
/// [MemoryDisk::resume].
#[derive(Clone, Default)]
pub struct MemoryDisk {
    state: Arc<Mutex<DiskState>>,
}

impl MemoryDisk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `len` bytes of `device` starting at byte `offset` (unwritten bytes are zero).
    pub fn read(&self, device: u64, offset: u64, len: usize) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        let mut buf = vec![0; len];
        if let Some(disk) = state.devices.get(&device) {
            let start = (offset as usize).min(disk.len());
            let end = (offset as usize + len).min(disk.len());
            buf[..end - start].copy_from_slice(&disk[start..end]);
        }
        buf
    }

    /// Write `data` to `device` starting at byte `offset`.
    pub fn write(&self, device: u64, offset: u64, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let disk = state.devices.entry(device).or_default();
        let end = offset as usize + data.len();
        if disk.len() < end {
            disk.resize(end, 0);
        }
        disk[offset as usize..end].copy_from_slice(data);
    }

    /// Every request submitted so far as `(device, block, op)`, in submission order.
    pub fn requests(&self) -> Vec<(u64, u64, Op)> {
        self.state.lock().unwrap().log.clone()
    }

    /// Fail every request that starts at `block` of `device`.
    pub fn fail(&self, device: u64, block: u64) {
        self.state.lock().unwrap().failures.insert((device, block));
    }

    /// Stop failing requests that start at `block` of `device`.
    pub fn heal(&self, device: u64, block: u64) {
        self.state.lock().unwrap().failures.remove(&(device, block));
    }

    /// Hold submitted requests instead of completing them.
    pub fn pause(&self) {
        self.state.lock().unwrap().paused = true;
    }

    /// Complete every held request and stop holding new ones.
    pub fn resume(&self) {
        loop {
            let (request, result) = {
                let mut state = self.state.lock().unwrap();
                state.paused = false;
                let Some(request) = state.held.pop_front() else {
                    return;
                };
                let result = state.perform(&request);
                (request, result)
            };
            request.complete(result);
        }
    }

    /// The number of held requests.
    pub fn held(&self) -> usize {
        self.state.lock().unwrap().held.len()
    }

    /// Report `congested` from [Transport::congested] for every device.
    pub fn set_congested(&self, congested: bool) {
        self.state.lock().unwrap().congested = congested;
    }

    /// The number of bytes moved by successful requests.
    pub fn transferred(&self) -> usize {
        self.state.lock().unwrap().transferred
    }

    /// The number of times [Transport::unplug] was called.
    pub fn unplugs(&self) -> usize {
        self.state.lock().unwrap().unplugs
    }
}

impl Transport for MemoryDisk {
    fn submit(&self, request: Request) {
        let result = {
            let mut state = self.state.lock().unwrap();
            state
                .log
                .push((request.device, request.block, request.op));
            if state.paused {
                state.held.push_back(request);
                return;
            }
            state.perform(&request)
        };
        request.complete(result);
    }

    fn unplug(&self) {
        self.state.lock().unwrap().unplugs += 1;
    }

    fn congested(&self, _device: u64) -> bool {
        self.state.lock().unwrap().congested
    }
}
