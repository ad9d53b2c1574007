use crate::core::constants::PageNum;
use crate::core::errors::PoisonedLockExt;
use crate::core::stats::BufferStats;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

struct Node {
    page_num: PageNum,
    data: Vec<u8>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Arena-backed LRU list. Slots are recycled through `free_slots`.
struct PageCacheInner {
    capacity: usize,
    index: HashMap<PageNum, usize>,
    nodes: Vec<Option<Node>>,
    head: Option<usize>,
    tail: Option<usize>,
    free_slots: Vec<usize>,
    dirty: HashMap<PageNum, bool>,
    pins: HashMap<PageNum, u32>,
    hits: u64,
    misses: u64,
    evictions: u64,
    failed_evictions: usize,
}

impl PageCacheInner {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            index: HashMap::new(),
            nodes: Vec::new(),
            head: None,
            tail: None,
            free_slots: Vec::new(),
            dirty: HashMap::new(),
            pins: HashMap::new(),
            hits: 0,
            misses: 0,
            evictions: 0,
            failed_evictions: 0,
        }
    }

    fn allocate_node(&mut self, page_num: PageNum, data: Vec<u8>) -> usize {
        let node = Node {
            page_num,
            data,
            prev: None,
            next: None,
        };

        if let Some(idx) = self.free_slots.pop() {
            self.nodes[idx] = Some(node);
            idx
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev_idx, next_idx) = match &self.nodes[idx] {
            Some(node) => (node.prev, node.next),
            None => return,
        };

        if let Some(prev) = prev_idx {
            if let Some(prev_node) = &mut self.nodes[prev] {
                prev_node.next = next_idx;
            }
        }
        if let Some(next) = next_idx {
            if let Some(next_node) = &mut self.nodes[next] {
                next_node.prev = prev_idx;
            }
        }
        if Some(idx) == self.head {
            self.head = next_idx;
        }
        if Some(idx) == self.tail {
            self.tail = prev_idx;
        }
    }

    fn push_front(&mut self, idx: usize) {
        if let Some(node) = &mut self.nodes[idx] {
            node.prev = None;
            node.next = self.head;
        }
        if let Some(old_head) = self.head {
            if let Some(old) = &mut self.nodes[old_head] {
                old.prev = Some(idx);
            }
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn move_to_front(&mut self, idx: usize) {
        if Some(idx) == self.head {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }

    fn remove_slot(&mut self, idx: usize) {
        self.unlink(idx);
        self.nodes[idx] = None;
        self.free_slots.push(idx);
    }

    fn get(&mut self, page_num: PageNum) -> Option<Vec<u8>> {
        match self.index.get(&page_num).copied() {
            Some(idx) => {
                self.move_to_front(idx);
                self.hits += 1;
                self.nodes[idx].as_ref().map(|n| n.data.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    fn peek(&self, page_num: PageNum) -> Option<Vec<u8>> {
        let idx = *self.index.get(&page_num)?;
        self.nodes[idx].as_ref().map(|n| n.data.clone())
    }

    fn put(&mut self, page_num: PageNum, data: Vec<u8>, dirty: bool) {
        if let Some(&idx) = self.index.get(&page_num) {
            self.move_to_front(idx);
            if let Some(node) = &mut self.nodes[idx] {
                node.data = data;
            }
            if dirty {
                self.dirty.insert(page_num, true);
            }
            return;
        }

        let idx = self.allocate_node(page_num, data);
        self.index.insert(page_num, idx);
        self.push_front(idx);

        // Mark before evicting so a flush never sees a dirty flag without the page
        if dirty {
            self.dirty.insert(page_num, true);
        }

        if self.index.len() > self.capacity {
            self.evict();
        }
    }

    fn is_evictable(&self, page_num: PageNum) -> bool {
        !self.dirty.get(&page_num).copied().unwrap_or(false)
            && self.pins.get(&page_num).copied().unwrap_or(0) == 0
    }

    fn evict(&mut self) {
        let mut current = self.tail;
        let mut checked = 0;
        let max_checks = self.index.len();

        while let Some(idx) = current {
            if checked >= max_checks {
                break;
            }
            checked += 1;

            let (page_num, prev) = match &self.nodes[idx] {
                Some(node) => (node.page_num, node.prev),
                None => break,
            };

            if self.is_evictable(page_num) {
                self.index.remove(&page_num);
                self.remove_slot(idx);
                self.evictions += 1;
                self.failed_evictions = 0;
                return;
            }
            current = prev;
        }

        self.failed_evictions += 1;
    }

    fn remove(&mut self, page_num: PageNum) {
        if let Some(idx) = self.index.remove(&page_num) {
            self.remove_slot(idx);
        }
        self.dirty.remove(&page_num);
    }
}

/// Page buffer cache shared by every structure living in one paged file.
///
/// Dirty and pinned pages are never evicted; the cache may therefore grow
/// past its capacity until the owner flushes.
pub struct PageCache {
    inner: Arc<RwLock<PageCacheInner>>,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 { 1 } else { capacity };
        Self {
            inner: Arc::new(RwLock::new(PageCacheInner::new(capacity))),
        }
    }

    pub fn get(&self, page_num: PageNum) -> Option<Vec<u8>> {
        self.inner.write().recover_poison().get(page_num)
    }

    /// Lookup that does not touch the LRU order or the hit counters.
    pub fn peek(&self, page_num: PageNum) -> Option<Vec<u8>> {
        self.inner.read().recover_poison().peek(page_num)
    }

    pub fn contains(&self, page_num: PageNum) -> bool {
        self.inner.read().recover_poison().index.contains_key(&page_num)
    }

    pub fn put(&self, page_num: PageNum, data: Vec<u8>) {
        self.inner.write().recover_poison().put(page_num, data, false);
    }

    pub fn put_dirty(&self, page_num: PageNum, data: Vec<u8>) {
        self.inner.write().recover_poison().put(page_num, data, true);
    }

    pub fn is_dirty(&self, page_num: PageNum) -> bool {
        self.inner
            .read()
            .recover_poison()
            .dirty
            .get(&page_num)
            .copied()
            .unwrap_or(false)
    }

    /// Dirty page numbers in ascending order.
    pub fn dirty_pages(&self) -> Vec<PageNum> {
        let inner = self.inner.read().recover_poison();
        let mut pages: Vec<PageNum> = inner.dirty.keys().copied().collect();
        pages.sort_unstable();
        pages
    }

    pub fn clear_dirty(&self, page_num: PageNum) {
        self.inner.write().recover_poison().dirty.remove(&page_num);
    }

    pub fn remove(&self, page_num: PageNum) {
        self.inner.write().recover_poison().remove(page_num);
    }

    /// Drops every clean, unpinned page.
    pub fn shrink(&self) {
        let mut inner = self.inner.write().recover_poison();
        let victims: Vec<PageNum> = inner
            .index
            .keys()
            .copied()
            .filter(|p| inner.is_evictable(*p))
            .collect();
        for page_num in victims {
            inner.remove(page_num);
        }
    }

    pub fn pin(&self, page_num: PageNum) -> PinGuard<'_> {
        self.add_pin(page_num);
        PinGuard {
            cache: self,
            page_num,
        }
    }

    /// Raises the pin count without a guard. Pair with [`PageCache::unpin`].
    pub fn add_pin(&self, page_num: PageNum) {
        *self
            .inner
            .write()
            .recover_poison()
            .pins
            .entry(page_num)
            .or_insert(0) += 1;
    }

    pub fn unpin(&self, page_num: PageNum) {
        let mut inner = self.inner.write().recover_poison();
        if let Some(count) = inner.pins.get_mut(&page_num) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.pins.remove(&page_num);
            }
        }
    }

    pub fn pin_count(&self, page_num: PageNum) -> u32 {
        self.inner
            .read()
            .recover_poison()
            .pins
            .get(&page_num)
            .copied()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.read().recover_poison().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.read().recover_poison().capacity
    }

    /// Number of inserts in a row that found nothing evictable.
    pub fn failed_evictions(&self) -> usize {
        self.inner.read().recover_poison().failed_evictions
    }

    pub fn stats(&self) -> BufferStats {
        let inner = self.inner.read().recover_poison();
        BufferStats {
            capacity: inner.capacity,
            used: inner.index.len(),
            dirty: inner.dirty.len(),
            pinned: inner.pins.len(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }
}

/// Keeps a page resident while a multi-page mutation is in flight.
pub struct PinGuard<'a> {
    cache: &'a PageCache,
    page_num: PageNum,
}

impl PinGuard<'_> {
    pub fn page_num(&self) -> PageNum {
        self.page_num
    }
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        self.cache.unpin(self.page_num);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() {
        let cache = PageCache::new(3);

        cache.put(1, vec![1, 2, 3]);
        assert_eq!(cache.get(1), Some(vec![1, 2, 3]));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(99), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache = PageCache::new(3);

        cache.put(1, vec![1]);
        cache.put(2, vec![2]);
        cache.put(3, vec![3]);
        cache.get(1);
        cache.put(4, vec![4]);

        assert!(cache.contains(1));
        assert!(!cache.contains(2));
        assert!(cache.contains(3));
        assert!(cache.contains(4));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_dirty_pages_stay_resident() {
        let cache = PageCache::new(2);

        cache.put_dirty(1, vec![1]);
        cache.put(2, vec![2]);
        cache.put(3, vec![3]);

        assert_eq!(cache.peek(1), Some(vec![1]));
        assert!(!cache.contains(2));
        assert_eq!(cache.dirty_pages(), vec![1]);

        cache.clear_dirty(1);
        assert!(!cache.is_dirty(1));
    }

    #[test]
    fn test_pinned_pages_stay_resident() {
        let cache = PageCache::new(2);
        cache.put(1, vec![1]);
        {
            let guard = cache.pin(1);
            assert_eq!(guard.page_num(), 1);
            assert_eq!(cache.pin_count(1), 1);
            cache.put(2, vec![2]);
            cache.put(3, vec![3]);
            assert!(cache.contains(1));
        }
        assert_eq!(cache.pin_count(1), 0);

        cache.put(4, vec![4]);
        cache.put(5, vec![5]);
        assert!(!cache.contains(1));
    }

    #[test]
    fn test_everything_pinned_grows_past_capacity() {
        let cache = PageCache::new(1);
        cache.add_pin(1);
        cache.add_pin(2);
        cache.put(1, vec![1]);
        cache.put(2, vec![2]);

        assert_eq!(cache.len(), 2);
        assert!(cache.failed_evictions() > 0);

        cache.unpin(1);
        cache.unpin(2);
        cache.shrink();
        assert!(cache.is_empty());
    }
}
