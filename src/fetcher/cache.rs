//! Process-wide LRU cache for subresources fetched during dynamic rendering.
//!
//! Keyed by canonical URL, bounded both by item count and by total bytes.
//! Only successful 2xx responses at or below the per-item size limit are
//! admitted; reads are side-effect-free apart from recency tracking.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct CachedResource {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

pub struct ResourceCache {
    inner: Mutex<CacheInner>,
    max_items: usize,
    max_item_bytes: usize,
}

struct CacheInner {
    entries: HashMap<String, CachedResource>,
    /// Recency order, least recent first.
    order: Vec<String>,
    total_bytes: usize,
}

impl ResourceCache {
    pub fn new(max_items: usize, max_item_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: Vec::new(),
                total_bytes: 0,
            }),
            max_items,
            max_item_bytes,
        }
    }

    pub fn get(&self, key: &str) -> Option<CachedResource> {
        let mut inner = self.inner.lock().unwrap();
        let hit = inner.entries.get(key).cloned();
        if hit.is_some() {
            if let Some(pos) = inner.order.iter().position(|k| k == key) {
                let key = inner.order.remove(pos);
                inner.order.push(key);
            }
        }
        hit
    }

    /// Admit a response. Non-2xx statuses and oversized bodies are ignored.
    pub fn insert(&self, key: &str, resource: CachedResource) {
        if !(200..300).contains(&resource.status) || resource.body.len() > self.max_item_bytes {
            return;
        }

        let mut inner = self.inner.lock().unwrap();
        if let Some(old) = inner.entries.remove(key) {
            inner.total_bytes -= old.body.len();
            if let Some(pos) = inner.order.iter().position(|k| k == key) {
                inner.order.remove(pos);
            }
        }

        inner.total_bytes += resource.body.len();
        inner.entries.insert(key.to_string(), resource);
        inner.order.push(key.to_string());

        let max_total = self.max_items * self.max_item_bytes;
        while inner.order.len() > self.max_items
            || (max_total > 0 && inner.total_bytes > max_total)
        {
            let evicted = inner.order.remove(0);
            if let Some(old) = inner.entries.remove(&evicted) {
                inner.total_bytes -= old.body.len();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(status: u16, body: &[u8]) -> CachedResource {
        CachedResource {
            status,
            content_type: Some("text/css".to_string()),
            body: body.to_vec(),
        }
    }

    #[test]
    fn rejects_non_success_and_oversized() {
        let cache = ResourceCache::new(4, 8);
        cache.insert("a", resource(404, b"nope"));
        cache.insert("b", resource(200, b"far too large body"));
        assert!(cache.is_empty());
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = ResourceCache::new(2, 64);
        cache.insert("a", resource(200, b"aa"));
        cache.insert("b", resource(200, b"bb"));
        // touch "a" so "b" is the eviction candidate
        assert!(cache.get("a").is_some());
        cache.insert("c", resource(200, b"cc"));

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn replacing_entry_updates_byte_accounting() {
        let cache = ResourceCache::new(2, 32);
        cache.insert("a", resource(200, b"aaaaaaaa"));
        cache.insert("a", resource(200, b"bb"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("a").unwrap().body, b"bb");
    }
}
