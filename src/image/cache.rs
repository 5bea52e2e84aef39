use crate::image::decoder::DecodedImage;
use lru::LruCache;
use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct PageCacheEntry {
    pub index: usize,
    pub image: Arc<DecodedImage>,
    pub inserted_at: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// The pages within `radius` of `center`, clipped to the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheWindow {
    pub center: usize,
    pub radius: usize,
    pub total: usize,
}

impl CacheWindow {
    pub fn new(center: usize, radius: usize, total: usize) -> Self {
        Self { center, radius, total }
    }

    pub fn range(&self) -> Range<usize> {
        if self.total == 0 {
            return 0..0;
        }
        let center = self.center.min(self.total - 1);
        let start = center.saturating_sub(self.radius);
        let end = center.saturating_add(self.radius).saturating_add(1).min(self.total);
        start..end
    }

    pub fn contains(&self, index: usize) -> bool {
        self.range().contains(&index)
    }

    /// Indices ordered nearest-first, ties going forward before backward.
    pub fn by_distance(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self.range().collect();
        let center = self.center;
        indices.sort_by_key(|&i| (i.abs_diff(center), i < center));
        indices
    }

    pub fn to_set(&self) -> BTreeSet<usize> {
        self.range().collect()
    }
}

/// Decoded pages by index.
///
/// Retention is driven by [`PageCache::evict_outside`] with the window
/// around the cursor; the LRU capacity is only a ceiling for callers that
/// never evict.
pub struct PageCache {
    entries: LruCache<usize, PageCacheEntry>,
    stats: CacheStats,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
            stats: CacheStats::default(),
        }
    }

    pub fn get(&mut self, index: usize) -> Option<Arc<DecodedImage>> {
        match self.entries.get(&index) {
            Some(entry) => {
                self.stats.hits += 1;
                Some(entry.image.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Presence check that neither touches recency nor counts as a lookup.
    pub fn contains(&self, index: usize) -> bool {
        self.entries.contains(&index)
    }

    /// Inserts or silently replaces the image for `index`.
    pub fn put(&mut self, index: usize, image: Arc<DecodedImage>) {
        let entry = PageCacheEntry {
            index,
            image,
            inserted_at: Instant::now(),
        };
        if let Some((evicted, _)) = self.entries.push(index, entry) {
            if evicted != index {
                tracing::debug!(evicted, "Page cache full; dropped least recently used page");
            }
        }
    }

    /// Removes every page whose index is not in `keep`. Returns how many were removed.
    pub fn evict_outside(&mut self, keep: &BTreeSet<usize>) -> usize {
        let stale: Vec<usize> = self
            .entries
            .iter()
            .map(|(index, _)| *index)
            .filter(|index| !keep.contains(index))
            .collect();
        for index in &stale {
            self.entries.pop(index);
        }
        if !stale.is_empty() {
            tracing::trace!(evicted = ?stale, "Evicted pages outside window");
        }
        stale.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached indices in ascending order.
    pub fn indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self.entries.iter().map(|(index, _)| *index).collect();
        indices.sort_unstable();
        indices
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

pub type SharedPageCache = Arc<Mutex<PageCache>>;

pub fn create_shared_cache(capacity: usize) -> SharedPageCache {
    Arc::new(Mutex::new(PageCache::new(capacity)))
}

/// Locks the cache, recovering the guard if a holder panicked.
pub fn lock_cache(cache: &SharedPageCache) -> MutexGuard<'_, PageCache> {
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}
