use std::collections::HashMap;
use std::time::SystemTime;

use parking_lot::Mutex;
use rand::seq::index::sample;
use tracing::debug;

use super::CacheKey;

const EVICTION_SAMPLES: usize = 5;

/// Thread-safe, capacity-bounded response store. Eviction is approximate
/// LRU: sample a handful of entries and evict the stalest, preferring any
/// already-expired one. Expected victims sit in the oldest ~20% of entries
/// without ever scanning the whole map.
pub struct MemoryCache {
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    capacity: usize,
    max_item_size: usize,
    size: usize,
    keys: Vec<CacheKey>,
    items: HashMap<CacheKey, CacheEntry>,
}

struct CacheEntry {
    value: Vec<u8>,
    expires_at: SystemTime,
    last_accessed_at: SystemTime,
}

impl MemoryCache {
    pub fn new(capacity: usize, max_item_size: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                capacity,
                max_item_size,
                size: 0,
                keys: Vec::new(),
                items: HashMap::new(),
            }),
        }
    }

    pub fn set(&self, key: CacheKey, value: Vec<u8>, expires_at: SystemTime) {
        let mut inner = self.inner.lock();

        let item_size = value.len();
        if item_size > inner.max_item_size || item_size > inner.capacity {
            debug!(len = item_size, "cache: item is too large to store");
            return;
        }

        let limit = inner.capacity - item_size;
        while inner.size > limit {
            inner.evict_one();
        }

        let now = SystemTime::now();
        if let Some(existing) = inner.items.get(&key) {
            let existing_len = existing.value.len();
            inner.size -= existing_len;
        } else {
            inner.keys.push(key);
        }

        inner.items.insert(
            key,
            CacheEntry {
                value,
                expires_at,
                last_accessed_at: now,
            },
        );
        inner.size += item_size;
    }

    pub fn get(&self, key: CacheKey) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        let now = SystemTime::now();

        let entry = inner.items.get_mut(&key)?;
        if entry.expires_at < now {
            return None;
        }

        entry.last_accessed_at = now;
        Some(entry.value.clone())
    }

    /// Total bytes currently stored. Exposed for tests and diagnostics.
    pub fn size(&self) -> usize {
        self.inner.lock().size
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheInner {
    fn evict_one(&mut self) {
        let now = SystemTime::now();
        let count = self.keys.len().min(EVICTION_SAMPLES);
        debug_assert!(count > 0, "eviction requires at least one entry");

        let mut victim_index = 0usize;
        let mut oldest: Option<SystemTime> = None;

        for index in sample(&mut rand::thread_rng(), self.keys.len(), count) {
            let entry = &self.items[&self.keys[index]];

            if entry.expires_at < now {
                victim_index = index;
                break;
            }

            if oldest.is_none_or(|current| entry.last_accessed_at < current) {
                oldest = Some(entry.last_accessed_at);
                victim_index = index;
            }
        }

        let key = self.keys.swap_remove(victim_index);
        if let Some(entry) = self.items.remove(&key) {
            self.size -= entry.value.len();
            debug!(key, len = entry.value.len(), "cache: evicted item");
        }
    }
}
