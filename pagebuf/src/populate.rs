//! Attach the pages covering a buffer's range.

use crate::{
    buffer::Buffer,
    cache::Cache,
    io::Transport,
    page::Store,
    stats::Event,
    Error, Flags,
};
use commonware_runtime::{Clock, Metrics, Spawner};
use std::sync::atomic::Ordering;
use tracing::debug;

impl<E: Spawner + Clock + Metrics, S: Store, T: Transport> Cache<E, S, T> {
    /// Attach every page covering `buffer` and derive its validity from them.
    ///
    /// Resolving a page is retried (after waking the flush daemon to free memory) up to
    /// `page_retries` times, unless `flags` contains [Flags::READ_AHEAD] or [Flags::DONT_BLOCK]
    /// (in which case the first failure is returned).
    pub(crate) async fn lookup_pages(
        &self,
        buffer: &Buffer<S, T>,
        flags: Flags,
    ) -> Result<(), Error> {
        let inner = buffer.inner();
        inner.fill.acquire().await;
        let result = self.attach_pages(buffer, flags).await;
        inner.fill.release();
        result
    }

    async fn attach_pages(&self, buffer: &Buffer<S, T>, flags: Flags) -> Result<(), Error> {
        let inner = buffer.inner();
        if inner.flags().contains(Flags::ALL_PAGES_MAPPED) {
            return Ok(());
        }
        let shared = &self.shared;
        let page_size = shared.page_size;
        let identity = inner.identity;
        let first = identity.offset / page_size as u64;
        let end = (identity.offset + identity.length as u64).div_ceil(page_size as u64);
        let count = (end - first) as usize;

        // Resolve missing pages (keeping any attached by an earlier, failed attempt)
        let mut pages = inner.pages.lock().unwrap().list.clone();
        while pages.len() < count {
            let index = first + pages.len() as u64;
            let mut attempts = 0;
            let page = loop {
                if let Some(page) = shared.store.resolve(identity.device, index, page_size) {
                    break page;
                }
                if flags.intersects(Flags::READ_AHEAD | Flags::DONT_BLOCK)
                    || attempts >= shared.page_retries
                {
                    debug!(
                        device = identity.device,
                        index, attempts, "failed to resolve page"
                    );
                    inner.pages.lock().unwrap().list = pages;
                    return Err(Error::NoMemory);
                }
                attempts += 1;
                shared.stats.inc(Event::PageRetries);
                shared.metrics.page_retries.inc();
                self.wake(true);
                self.context.sleep(shared.retry_delay).await;
            };
            pages.push(page);
        }

        // Lock each page to sample its validity
        let block_size = inner.target.block_size as usize;
        let mut cursor = (identity.offset % page_size as u64) as usize;
        let mut remaining = identity.length;
        let mut valid = 0;
        let mut lock_for_read = false;
        for page in &pages {
            page.lock().await;
            shared.store.touch(page);
            let in_page = cursor % page_size;
            let len = (page_size - in_page).min(remaining);
            let is_valid = if block_size < page_size {
                page.is_region_valid(in_page, len)
            } else {
                page.is_uptodate()
            };
            if is_valid {
                valid += 1;
            } else if block_size == page_size && flags.contains(Flags::READ) {
                lock_for_read = true;
            }
            cursor += len;
            remaining -= len;
        }
        shared.stats.add(Event::PageFound, valid as u64);

        // Pages stay locked until the read that makes them valid completes
        if lock_for_read {
            inner.pages_locked.store(true, Ordering::Release);
        } else {
            for page in &pages {
                page.unlock();
            }
        }

        let total = pages.len();
        inner.pages.lock().unwrap().list = pages;
        if valid == total {
            inner.clear_flags(Flags::NONE | Flags::PARTIAL);
        } else if valid > 0 {
            inner.clear_flags(Flags::NONE);
            inner.set_flags(Flags::PARTIAL);
        }
        inner.set_flags(Flags::MEM_ALLOCATED | Flags::ALL_PAGES_MAPPED);
        inner.trace("lookup pages");
        Ok(())
    }
}
