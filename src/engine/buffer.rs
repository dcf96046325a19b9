use anyhow::Result;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use super::storage::{PageId, PageOnDisk, TableStorage};

/// Identifies a cached page: table key plus page number.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BufferKey {
    pub table: String,
    pub page_id: PageId,
}

/// A page held in the buffer pool.
///
/// ## Dirty Flag Management
/// - `dirty = false`: page matches storage, safe to drop
/// - `dirty = true`: page was modified and must be written before eviction
pub struct BufferPage {
    pub data: RwLock<PageOnDisk>,
    pub dirty: RwLock<bool>,
}

/// Cached page together with the storage it must be written back to.
struct Frame {
    owner: Arc<TableStorage>,
    page: Arc<BufferPage>,
}

/// Snapshot of buffer pool occupancy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferStats {
    pub capacity: usize,
    pub cached: usize,
    pub hits: u64,
    pub misses: u64,
}

/// LRU page cache shared by every table.
///
/// ```text
/// get_or_load() → cache hit? → page
///                     │ miss
///                     ▼
///            read from TableStorage → insert → full? evict LRU (write back if dirty)
/// ```
///
/// Evicted dirty pages are written to the table that owns them. Releasing
/// memory is `flush_all` followed by `clear`.
pub struct BufferPool {
    cap: usize,
    cache: Mutex<LruCache<BufferKey, Frame>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BufferPool {
    /// Pool holding at most `cap_pages` pages (at least one).
    pub fn new(cap_pages: usize) -> Self {
        let cap = NonZeroUsize::new(cap_pages).unwrap_or(NonZeroUsize::MIN);
        Self {
            cap: cap.get(),
            cache: Mutex::new(LruCache::new(cap)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            capacity: self.cap,
            cached: self.cache.lock().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Returns the cached page, loading it from `table` on a miss.
    pub async fn get_or_load(
        &self,
        table: &Arc<TableStorage>,
        page_id: PageId,
    ) -> Result<Arc<BufferPage>> {
        let key = BufferKey { table: table.key(), page_id };

        let cached = self.cache.lock().get(&key).map(|frame| frame.page.clone());
        if let Some(page) = cached {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(page);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let mut page = table.read_page(page_id).await?;
        let buf = Arc::new(BufferPage {
            data: RwLock::new(page.take()),
            dirty: RwLock::new(false),
        });
        self.insert_with_eviction(table.clone(), key, buf).await
    }

    /// Caches `page`, evicting the least recently used frame when full. A
    /// dirty victim is written back to its own table after the cache lock is
    /// released.
    async fn insert_with_eviction(
        &self,
        owner: Arc<TableStorage>,
        key: BufferKey,
        page: Arc<BufferPage>,
    ) -> Result<Arc<BufferPage>> {
        let victim = {
            let mut cache = self.cache.lock();
            if let Some(existing) = cache.get(&key) {
                return Ok(existing.page.clone());
            }
            let victim = if cache.len() >= self.cap { cache.pop_lru() } else { None };
            cache.put(key, Frame { owner, page: page.clone() });
            victim
        };

        if let Some((old_key, frame)) = victim {
            if let Some(data) = take_if_dirty(&frame.page) {
                frame.owner.write_page(old_key.page_id, data).await?;
            }
        }
        Ok(page)
    }

    /// Writes back every dirty page of `table`.
    pub async fn flush_all_for(&self, table: &TableStorage) -> Result<()> {
        let key = table.key();
        let to_flush: Vec<(PageId, PageOnDisk)> = {
            let cache = self.cache.lock();
            cache
                .iter()
                .filter(|(k, _)| k.table == key)
                .filter_map(|(k, f)| take_if_dirty(&f.page).map(|d| (k.page_id, d)))
                .collect()
        };
        for (pid, data) in to_flush {
            table.write_page(pid, data).await?;
        }
        Ok(())
    }

    /// Writes back every dirty page in the pool. Returns how many pages were
    /// written.
    pub async fn flush_all(&self) -> Result<usize> {
        let to_flush: Vec<(Arc<TableStorage>, PageId, PageOnDisk)> = {
            let cache = self.cache.lock();
            cache
                .iter()
                .filter_map(|(k, f)| {
                    take_if_dirty(&f.page).map(|d| (f.owner.clone(), k.page_id, d))
                })
                .collect()
        };
        let written = to_flush.len();
        for (owner, pid, data) in to_flush {
            owner.write_page(pid, data).await?;
        }
        Ok(written)
    }

    /// Forgets the cached pages of one table without writing them.
    pub fn evict_table(&self, table_key: &str) -> usize {
        let mut cache = self.cache.lock();
        let keys: Vec<BufferKey> =
            cache.iter().filter(|(k, _)| k.table == table_key).map(|(k, _)| k.clone()).collect();
        for k in &keys {
            cache.pop(k);
        }
        keys.len()
    }

    /// Empties the pool without writing anything. Callers flush first.
    pub fn clear(&self) -> usize {
        let mut cache = self.cache.lock();
        let n = cache.len();
        cache.clear();
        n
    }
}

/// Snapshot of a dirty page's data, clearing the flag.
fn take_if_dirty(page: &BufferPage) -> Option<PageOnDisk> {
    let mut dirty = page.dirty.write();
    if *dirty {
        *dirty = false;
        Some(page.data.read().clone())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Value;

    async fn seeded(name: &str, pages: u64) -> Arc<TableStorage> {
        let st = Arc::new(TableStorage::in_memory(name));
        for i in 0..pages {
            let page = PageOnDisk { rows: vec![vec![Value::Int(i as i64)]] };
            st.write_page(PageId(i), page).await.unwrap();
        }
        st
    }

    #[tokio::test]
    async fn hits_and_misses_are_counted() {
        let pool = BufferPool::new(4);
        let st = seeded("t", 2).await;
        pool.get_or_load(&st, PageId(0)).await.unwrap();
        pool.get_or_load(&st, PageId(0)).await.unwrap();
        pool.get_or_load(&st, PageId(1)).await.unwrap();
        let stats = pool.stats();
        assert_eq!((stats.hits, stats.misses, stats.cached), (1, 2, 2));
    }

    #[tokio::test]
    async fn dirty_victim_is_written_to_its_own_table() {
        let pool = BufferPool::new(1);
        let a = seeded("a", 1).await;
        let b = seeded("b", 1).await;

        let page = pool.get_or_load(&a, PageId(0)).await.unwrap();
        page.data.write().rows.push(vec![Value::Int(99)]);
        *page.dirty.write() = true;

        // Loading b's page evicts a's dirty page.
        pool.get_or_load(&b, PageId(0)).await.unwrap();
        assert_eq!(a.read_page(PageId(0)).await.unwrap().rows.len(), 2);
        assert_eq!(b.read_page(PageId(0)).await.unwrap().rows.len(), 1);
    }

    #[tokio::test]
    async fn flush_then_clear_releases_everything() {
        let pool = BufferPool::new(8);
        let st = seeded("t", 3).await;
        for i in 0..3 {
            let page = pool.get_or_load(&st, PageId(i)).await.unwrap();
            *page.dirty.write() = true;
        }
        assert_eq!(pool.flush_all().await.unwrap(), 3);
        assert_eq!(pool.flush_all().await.unwrap(), 0);
        assert_eq!(pool.clear(), 3);
        assert_eq!(pool.stats().cached, 0);
    }

    #[tokio::test]
    async fn evict_table_only_touches_that_table() {
        let pool = BufferPool::new(8);
        let a = seeded("a", 2).await;
        let b = seeded("b", 1).await;
        pool.get_or_load(&a, PageId(0)).await.unwrap();
        pool.get_or_load(&a, PageId(1)).await.unwrap();
        pool.get_or_load(&b, PageId(0)).await.unwrap();
        assert_eq!(pool.evict_table("a"), 2);
        assert_eq!(pool.stats().cached, 1);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        assert_eq!(BufferPool::new(0).capacity(), 1);
    }
}
