//! # Page Cache
//!
//! A bounded set of pages keyed by address with LRU ordering. Capacity is
//! measured in bytes; with a fixed page size that is simply a page count.
//!
//! Recency is tracked with a monotonic tick stamped on every access, and
//! the victim scan picks the smallest tick among evictable pages. The
//! cache holds at most a few hundred pages under the default budget, so
//! the O(n) victim scan is noise next to the device write it may trigger.
//!
//! Pinned pages (pages sitting in the live changeset) are never victims.
//! Clean pages are preferred over dirty ones; a dirty victim is handed
//! back to the page manager, which writes it out before dropping it. If
//! everything is pinned the cache runs over budget rather than failing
//! the operation.

use std::sync::Arc;

use hashbrown::HashMap;

use crate::page::Page;

struct CacheEntry {
    page: Arc<Page>,
    last_access: u64,
}

pub struct PageCache {
    map: HashMap<u64, CacheEntry>,
    tick: u64,
    capacity_bytes: usize,
    unlimited: bool,
    page_size: usize,
}

impl PageCache {
    pub fn new(capacity_bytes: usize, unlimited: bool, page_size: usize) -> Self {
        Self {
            map: HashMap::new(),
            tick: 0,
            capacity_bytes: capacity_bytes.max(page_size),
            unlimited,
            page_size,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    pub fn get(&mut self, address: u64) -> Option<Arc<Page>> {
        let tick = self.next_tick();
        let entry = self.map.get_mut(&address)?;
        entry.last_access = tick;
        Some(Arc::clone(&entry.page))
    }

    pub fn insert(&mut self, page: Arc<Page>) {
        let tick = self.next_tick();
        self.map.insert(
            page.address(),
            CacheEntry {
                page,
                last_access: tick,
            },
        );
    }

    pub fn remove(&mut self, address: u64) -> Option<Arc<Page>> {
        self.map.remove(&address).map(|e| e.page)
    }

    pub fn contains(&self, address: u64) -> bool {
        self.map.contains_key(&address)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        self.map.len() * self.page_size
    }

    /// True when inserting one more page would run over budget.
    pub fn over_budget(&self) -> bool {
        !self.unlimited && self.used_bytes() + self.page_size > self.capacity_bytes
    }

    /// The LRU evictable page, clean pages first. `None` when every page
    /// is pinned.
    pub fn pick_victim(&self) -> Option<u64> {
        let lru_of = |want_dirty: bool| {
            self.map
                .values()
                .filter(|e| !e.page.is_pinned() && e.page.is_dirty() == want_dirty)
                .min_by_key(|e| e.last_access)
                .map(|e| e.page.address())
        };
        lru_of(false).or_else(|| lru_of(true))
    }

    /// All cached pages, in no particular order.
    pub fn pages(&self) -> Vec<Arc<Page>> {
        self.map.values().map(|e| Arc::clone(&e.page)).collect()
    }

    /// Drops every unpinned clean page.
    pub fn drop_clean(&mut self) {
        self.map
            .retain(|_, e| e.page.is_pinned() || e.page.is_dirty());
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(address: u64) -> Arc<Page> {
        Arc::new(Page::new(address, 1024))
    }

    #[test]
    fn get_refreshes_recency() {
        let mut cache = PageCache::new(4 * 1024, false, 1024);
        cache.insert(page(0));
        cache.insert(page(1024));
        cache.insert(page(2048));

        // touch the oldest so it is no longer the victim
        cache.get(0).unwrap();

        assert_eq!(cache.pick_victim(), Some(1024));
    }

    #[test]
    fn over_budget_accounts_in_bytes() {
        let mut cache = PageCache::new(2 * 1024, false, 1024);
        assert!(!cache.over_budget());

        cache.insert(page(0));
        assert!(!cache.over_budget());

        cache.insert(page(1024));
        assert!(cache.over_budget());
    }

    #[test]
    fn unlimited_cache_never_reports_over_budget() {
        let mut cache = PageCache::new(1024, true, 1024);
        for i in 0..100 {
            cache.insert(page(i * 1024));
        }
        assert!(!cache.over_budget());
    }

    #[test]
    fn pinned_pages_are_not_victims() {
        let mut cache = PageCache::new(1024, false, 1024);
        let a = page(0);
        let b = page(1024);
        a.pin();
        cache.insert(Arc::clone(&a));
        cache.insert(Arc::clone(&b));

        assert_eq!(cache.pick_victim(), Some(1024));

        b.pin();
        assert_eq!(cache.pick_victim(), None);
    }

    #[test]
    fn clean_pages_evict_before_dirty_ones() {
        let mut cache = PageCache::new(1024, false, 1024);
        let dirty = page(0);
        dirty.mark_dirty();
        let clean = page(1024);
        cache.insert(dirty);
        cache.insert(Arc::clone(&clean));

        // the dirty page is older, but the clean one goes first
        assert_eq!(cache.pick_victim(), Some(1024));
    }

    #[test]
    fn drop_clean_keeps_dirty_and_pinned() {
        let mut cache = PageCache::new(8 * 1024, false, 1024);
        let dirty = page(0);
        dirty.mark_dirty();
        let pinned = page(1024);
        pinned.pin();
        let clean = page(2048);
        cache.insert(dirty);
        cache.insert(pinned);
        cache.insert(clean);

        cache.drop_clean();

        assert!(cache.contains(0));
        assert!(cache.contains(1024));
        assert!(!cache.contains(2048));
    }
}
