use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::BlobId;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(2 * 24 * 60 * 60);
pub const DEFAULT_CACHE_CAPACITY: usize = 100_000;

struct CacheEntry {
    member: String,
    expires_at: Instant,
}

/// Remembers which writable member last confirmed holding a blob.
///
/// Entries expire after the TTL, and the least recently used ones are evicted
/// beyond the capacity. Purely advisory, callers must confirm a hit with the
/// member.
pub struct LocationCache {
    entries: Mutex<LruCache<BlobId, CacheEntry>>,
    ttl: Duration,
}

impl LocationCache {
    pub fn new(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Returns the member name cached for the id, if any and not expired.
    pub fn get(&self, id: &BlobId) -> Option<String> {
        let mut entries = self.entries.lock();
        match entries.get(id) {
            Some(entry) if entry.expires_at > Instant::now() => return Some(entry.member.clone()),
            Some(_) => {}
            None => return None,
        }

        entries.pop(id);
        None
    }

    pub fn put(&self, id: BlobId, member: String) {
        let expires_at = Instant::now() + self.ttl;
        self.entries
            .lock()
            .put(id, CacheEntry { member, expires_at });
    }

    pub fn invalidate(&self, id: &BlobId) {
        self.entries.lock().pop(id);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of entries, expired ones not yet dropped included.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LocationCache {
    fn default() -> Self {
        Self::new(
            NonZeroUsize::new(DEFAULT_CACHE_CAPACITY).expect("capacity must be non-zero"),
            DEFAULT_CACHE_TTL,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::time::Duration;

    use super::{LocationCache, DEFAULT_CACHE_TTL};
    use crate::BlobId;

    #[test]
    fn put_get_invalidate() {
        let cache = LocationCache::default();
        let id = BlobId::from("in_one");

        assert_eq!(None, cache.get(&id));
        cache.put(id.clone(), "one".to_string());
        assert_eq!(Some("one".to_string()), cache.get(&id));

        // a later confirmation overwrites.
        cache.put(id.clone(), "two".to_string());
        assert_eq!(Some("two".to_string()), cache.get(&id));

        cache.invalidate(&id);
        assert_eq!(None, cache.get(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let cache = LocationCache::default();
        let id = BlobId::from("in_one");
        cache.put(id.clone(), "one".to_string());

        tokio::time::advance(DEFAULT_CACHE_TTL - Duration::from_secs(1)).await;
        assert_eq!(Some("one".to_string()), cache.get(&id));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(None, cache.get(&id));
        assert!(cache.is_empty(), "expired entry must be dropped");
    }

    #[test]
    fn bounded_by_capacity() {
        let cache = LocationCache::new(NonZeroUsize::new(2).unwrap(), DEFAULT_CACHE_TTL);
        cache.put(BlobId::from("a"), "one".to_string());
        cache.put(BlobId::from("b"), "one".to_string());
        cache.put(BlobId::from("c"), "one".to_string());

        assert_eq!(2, cache.len());
        assert_eq!(None, cache.get(&BlobId::from("a")));
        assert_eq!(Some("one".to_string()), cache.get(&BlobId::from("c")));
    }
}
