//! # Page Manager
//!
//! Owns the page cache and the file allocator. Everything above this layer
//! (b-tree, blob manager, environment) deals in pages obtained from here;
//! everything below is a [`Device`].
//!
//! ## Fetch / alloc / free
//!
//! `fetch` returns the cached page for an address, loading it from the
//! device on a miss. `alloc` prefers the freelist (first fit, lowest
//! address, to keep the file compact) and falls back to growing the device
//! by one page; the returned page is zeroed and already part of the
//! changeset. `free` pushes the address back onto the freelist and drops
//! the page from cache and changeset; its content is never written again.
//!
//! ## Changeset and commit
//!
//! Pages are entered into the changeset via [`PageManager::mark_dirty`]
//! BEFORE their first modification in an operation, so the captured
//! before-image is the pre-operation state. The changeset pins its pages;
//! the cache never evicts pinned pages. Commit drains the changeset with
//! [`PageManager::flush_changeset`], which writes the header page (address
//! 0) last so that metadata never points at pages that have not reached
//! the device yet.
//!
//! ## Eviction
//!
//! The cache is bounded in bytes. On insert past the budget, the LRU
//! unpinned page goes first, clean pages before dirty ones; a dirty victim
//! is written back before it is dropped. When every page is pinned the
//! cache runs over budget for the remainder of the operation instead of
//! failing it.
//!
//! ## Persisted state
//!
//! The freelist serializes into a blob whose id page 0 records. Writing
//! that blob itself allocates pages, so [`PageManager::store_state`]
//! iterates to a fixed point: serialize, store, re-serialize, and retry
//! until the stored bytes match the live freelist.

mod cache;
mod changeset;
mod freelist;

pub use changeset::{Changeset, ChangesetEntry};
pub use freelist::Freelist;

use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};

use crate::blob;
use crate::config::PAGE_HEADER_SIZE;
use crate::device::Device;
use crate::error::ErrorKind;
use crate::metrics::Metrics;
use crate::page::{Page, PageType};

use cache::PageCache;

/// Fetch policy hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchHint {
    /// Normal cached fetch.
    Default,
    /// Do not insert the page into the cache; for one-shot scans that
    /// would otherwise wash the cache out.
    NoCache,
}

pub struct PageManager {
    device: Box<dyn Device>,
    cache: PageCache,
    freelist: Freelist,
    changeset: Changeset,
    page_size: usize,
    capture_before_images: bool,
    metrics: Arc<Metrics>,
}

impl PageManager {
    pub fn new(
        device: Box<dyn Device>,
        page_size: usize,
        cache_capacity_bytes: usize,
        cache_unlimited: bool,
        capture_before_images: bool,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            device,
            cache: PageCache::new(cache_capacity_bytes, cache_unlimited, page_size),
            freelist: Freelist::new(page_size),
            changeset: Changeset::new(),
            page_size,
            capture_before_images,
            metrics,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn device_len(&self) -> u64 {
        self.device.len()
    }

    pub fn is_in_memory(&self) -> bool {
        self.device.is_in_memory()
    }

    pub fn freelist(&self) -> &Freelist {
        &self.freelist
    }

    pub fn changeset(&self) -> &Changeset {
        &self.changeset
    }

    pub fn cached_pages(&self) -> usize {
        self.cache.len()
    }

    fn check_address(&self, address: u64) -> Result<()> {
        if address % self.page_size as u64 != 0
            || address + self.page_size as u64 > self.device.len()
        {
            return ErrorKind::IntegrityViolated
                .raise()
                .wrap_err_with(|| format!("page address {} out of bounds", address));
        }
        Ok(())
    }

    /// Returns the page at `address`, loading it from the device if it is
    /// not cached.
    pub fn fetch(&mut self, address: u64) -> Result<Arc<Page>> {
        self.fetch_hint(address, FetchHint::Default)
    }

    pub fn fetch_hint(&mut self, address: u64, hint: FetchHint) -> Result<Arc<Page>> {
        if let Some(page) = self.cache.get(address) {
            Metrics::bump(&self.metrics.cache_hits);
            return Ok(page);
        }
        Metrics::bump(&self.metrics.cache_misses);

        self.check_address(address)?;

        let page = Arc::new(Page::new(address, self.page_size));
        {
            let mut buf = page.data_mut_clean();
            self.device
                .read(address, &mut buf)
                .wrap_err_with(|| format!("failed to load page {}", address))?;
        }

        if hint == FetchHint::Default {
            self.make_room()?;
            self.cache.insert(Arc::clone(&page));
        }
        Ok(page)
    }

    /// Returns a fresh zeroed page of the given type, already dirty and in
    /// the changeset. Freed addresses are reused before the device grows.
    pub fn alloc(&mut self, page_type: PageType) -> Result<Arc<Page>> {
        Ok(self.alloc_span(page_type, 1)?.pop().expect("one page"))
    }

    /// Allocates `npages` contiguous pages; the first carries the blob or
    /// node payload, the rest are continuation pages of the same type.
    pub fn alloc_span(&mut self, page_type: PageType, npages: u64) -> Result<Vec<Arc<Page>>> {
        ensure!(npages > 0, "cannot allocate an empty span");

        let address = match self.freelist.alloc(npages) {
            Some(address) => address,
            None => {
                let address = self.device.len();
                self.device
                    .grow(address + npages * self.page_size as u64)
                    .wrap_err("failed to grow device")?;
                address
            }
        };

        let mut pages = Vec::with_capacity(npages as usize);
        for i in 0..npages {
            let page = Arc::new(Page::new(address + i * self.page_size as u64, self.page_size));
            page.set_page_type(page_type)?;
            self.make_room()?;
            self.cache.insert(Arc::clone(&page));
            self.changeset
                .put(Arc::clone(&page), self.capture_before_images);
            Metrics::bump(&self.metrics.pages_allocated);
            pages.push(page);
        }
        Ok(pages)
    }

    /// Moves `npages` starting at `address` to the freelist and forgets
    /// them; cached copies and changeset entries are dropped.
    pub fn free(&mut self, address: u64, npages: u64) -> Result<()> {
        for i in 0..npages {
            let a = address + i * self.page_size as u64;
            self.changeset.remove(a);
            self.cache.remove(a);
            Metrics::bump(&self.metrics.pages_freed);
        }
        self.freelist.free(address, npages)
    }

    /// Enters a page into the current changeset, capturing its
    /// before-image. Call before the first modification.
    pub fn mark_dirty(&mut self, page: &Arc<Page>) {
        self.changeset
            .put(Arc::clone(page), self.capture_before_images);
        page.mark_dirty();
    }

    fn make_room(&mut self) -> Result<()> {
        while self.cache.over_budget() {
            let Some(victim) = self.cache.pick_victim() else {
                // everything pinned; run over budget rather than fail
                break;
            };
            let page = self.cache.remove(victim).expect("victim is cached");
            if page.is_dirty() {
                self.write_page(&page)?;
            }
            Metrics::bump(&self.metrics.cache_evictions);
        }
        Ok(())
    }

    fn write_page(&mut self, page: &Page) -> Result<()> {
        let buf = page.data();
        self.device
            .write(page.address(), &buf)
            .wrap_err_with(|| format!("failed to write page {}", page.address()))?;
        page.clear_dirty();
        Ok(())
    }

    /// Writes a single dirty page through to the device.
    pub fn flush_page(&mut self, page: &Arc<Page>) -> Result<()> {
        if page.is_dirty() {
            let page = Arc::clone(page);
            self.write_page(&page)?;
        }
        Ok(())
    }

    /// Drains the changeset: every dirty page is written to the device,
    /// the header page (address 0) strictly last, then the device is
    /// flushed. Pages come out clean and unpinned.
    pub fn flush_changeset(&mut self, fsync: bool) -> Result<()> {
        let mut header = None;
        let pages: Vec<Arc<Page>> = self
            .changeset
            .entries()
            .iter()
            .map(|e| Arc::clone(&e.page))
            .collect();

        for page in pages {
            if page.address() == 0 {
                header = Some(page);
                continue;
            }
            if page.is_dirty() {
                self.write_page(&page)?;
            }
        }
        if let Some(page) = header {
            if page.is_dirty() {
                self.write_page(&page)?;
            }
        }

        self.changeset.clear();

        if fsync {
            self.device.flush().wrap_err("failed to flush device")?;
        }
        Ok(())
    }

    /// Writes every dirty cached page; optionally drops clean unpinned
    /// pages from the cache afterwards.
    pub fn flush_all(&mut self, drop_clean: bool) -> Result<()> {
        for page in self.cache.pages() {
            if page.is_dirty() {
                self.write_page(&page)?;
            }
        }
        self.device.flush().wrap_err("failed to flush device")?;
        if drop_clean {
            self.cache.drop_clean();
        }
        Ok(())
    }

    /// Serializes the freelist into a blob and returns its id. `current`
    /// is the previously stored blob (0 for none); it is reused in place
    /// when the state still fits.
    pub fn store_state(&mut self, current: u64) -> Result<u64> {
        let mut blob_id = current;
        // storing the state mutates the freelist; iterate to a fixed point
        for _ in 0..8 {
            let bytes = self.freelist.encode();
            blob_id = if blob_id == 0 {
                blob::alloc(self, &bytes)?
            } else {
                blob::overwrite(self, blob_id, &bytes)?
            };
            if self.freelist.encode() == bytes {
                return Ok(blob_id);
            }
        }
        bail!("freelist state did not stabilize while storing");
    }

    /// Reloads the freelist from a previously stored state blob.
    pub fn load_state(&mut self, blob_id: u64) -> Result<()> {
        let bytes = blob::read(self, blob_id)?;
        self.freelist = Freelist::decode(self.page_size, &bytes)
            .wrap_err("failed to decode freelist state")?;
        Ok(())
    }

    /// Gives a trailing free extent back to the filesystem. Must run
    /// before the freelist state is persisted so the stored extents
    /// match the file.
    pub fn truncate_tail(&mut self) -> Result<()> {
        if let Some(new_len) = self.freelist.truncate_tail(self.device.len()) {
            self.device
                .truncate(new_len)
                .wrap_err("failed to truncate device tail")?;
        }
        Ok(())
    }

    /// Final flush of everything dirty, ending with a device sync.
    pub fn close(&mut self) -> Result<()> {
        self.flush_all(false)
    }

    /// Raw payload capacity of one page.
    pub fn usable_page_size(&self) -> usize {
        self.page_size - PAGE_HEADER_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    fn pager(cache_pages: usize) -> PageManager {
        PageManager::new(
            Box::new(MemoryDevice::new()),
            1024,
            cache_pages * 1024,
            false,
            true,
            Arc::new(Metrics::default()),
        )
    }

    #[test]
    fn alloc_grows_the_device() {
        let mut pager = pager(8);
        let a = pager.alloc(PageType::BtreeNode).unwrap();
        let b = pager.alloc(PageType::BtreeNode).unwrap();

        assert_eq!(a.address(), 0);
        assert_eq!(b.address(), 1024);
        assert_eq!(pager.device_len(), 2048);
        assert_eq!(a.page_type(), PageType::BtreeNode);
    }

    #[test]
    fn alloc_reuses_freed_addresses() {
        let mut pager = pager(8);
        let _keep = pager.alloc(PageType::BtreeNode).unwrap();
        let freed = pager.alloc(PageType::BtreeNode).unwrap();
        let tail = pager.alloc(PageType::BtreeNode).unwrap();
        let freed_addr = freed.address();
        drop(freed);

        pager.flush_changeset(false).unwrap();
        pager.free(freed_addr, 1).unwrap();

        let reused = pager.alloc(PageType::Blob).unwrap();
        assert_eq!(reused.address(), freed_addr);
        // the device did not grow past the prior tail
        assert_eq!(pager.device_len(), tail.address() + 1024);
    }

    #[test]
    fn fetch_round_trips_through_device() {
        let mut pager = pager(2);
        let page = pager.alloc(PageType::Blob).unwrap();
        let address = page.address();
        page.data_mut()[100] = 0x5A;
        drop(page);
        pager.flush_changeset(true).unwrap();

        // push the page out of the tiny cache
        for _ in 0..4 {
            let p = pager.alloc(PageType::Blob).unwrap();
            drop(p);
            pager.flush_changeset(false).unwrap();
        }

        let page = pager.fetch(address).unwrap();
        assert_eq!(page.data()[100], 0x5A);
        assert_eq!(page.page_type(), PageType::Blob);
    }

    #[test]
    fn fetch_rejects_unaligned_and_out_of_range_addresses() {
        let mut pager = pager(8);
        let _ = pager.alloc(PageType::BtreeNode).unwrap();
        pager.flush_changeset(false).unwrap();

        assert!(pager.fetch(100).is_err());
        assert!(pager.fetch(1 << 40).is_err());
    }

    #[test]
    fn changeset_pages_survive_eviction_pressure() {
        let mut pager = pager(2);
        let mut held = Vec::new();
        for _ in 0..6 {
            held.push(pager.alloc(PageType::BtreeNode).unwrap());
        }

        // all six are pinned by the changeset even though the budget is 2
        assert_eq!(pager.cached_pages(), 6);
        for page in &held {
            assert!(pager.changeset().contains(page.address()));
        }
    }

    #[test]
    fn flush_changeset_clears_dirty_and_unpins() {
        let mut pager = pager(8);
        let page = pager.alloc(PageType::BtreeNode).unwrap();
        page.data_mut()[PAGE_HEADER_SIZE] = 1;

        pager.flush_changeset(true).unwrap();

        assert!(!page.is_dirty());
        assert!(!page.is_pinned());
        assert!(pager.changeset().is_empty());
    }

    #[test]
    fn free_removes_from_changeset() {
        let mut pager = pager(8);
        let page = pager.alloc(PageType::BtreeNode).unwrap();
        let address = page.address();
        drop(page);

        pager.free(address, 1).unwrap();

        assert!(pager.changeset().is_empty());
        assert_eq!(pager.freelist().total_free_pages(), 1);
    }

    #[test]
    fn store_and_load_state_round_trip() {
        let mut pager = pager(16);
        // build some free extents
        let pages = pager.alloc_span(PageType::BtreeNode, 6).unwrap();
        let addrs: Vec<u64> = pages.iter().map(|p| p.address()).collect();
        drop(pages);
        pager.flush_changeset(false).unwrap();
        pager.free(addrs[1], 1).unwrap();
        pager.free(addrs[3], 2).unwrap();

        let blob_id = pager.store_state(0).unwrap();
        assert_ne!(blob_id, 0);
        let stored: Vec<_> = pager.freelist().extents().collect();

        pager.load_state(blob_id).unwrap();
        let after: Vec<_> = pager.freelist().extents().collect();
        assert_eq!(stored, after);
    }

    #[test]
    fn truncate_tail_returns_trailing_extent_to_the_filesystem() {
        let mut pager = pager(8);
        let pages = pager.alloc_span(PageType::BtreeNode, 4).unwrap();
        let last = pages[3].address();
        let second_last = pages[2].address();
        drop(pages);
        pager.flush_changeset(false).unwrap();

        pager.free(second_last, 1).unwrap();
        pager.free(last, 1).unwrap();

        pager.truncate_tail().unwrap();
        assert_eq!(pager.device_len(), second_last);
        assert!(pager.freelist().is_empty());
    }
}
