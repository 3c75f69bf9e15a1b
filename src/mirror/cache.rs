//! Content cache for opened files.
//!
//! Bounded with an LRU so a long session with many opened files cannot grow
//! without limit, and time-bounded so content older than the TTL is re-read
//! on the next poll cycle even when the timestamp did not move.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant, SystemTime};

/// A cached file body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedContent {
    /// The file's text.
    pub content: String,
    /// Modification timestamp of the file when the content was read.
    pub last_modified: SystemTime,
    cached_at: Instant,
}

/// Path → content cache with LRU eviction and a time-to-live.
#[derive(Debug)]
pub struct ContentCache {
    entries: LruCache<String, CachedContent>,
    ttl: Duration,
}

impl ContentCache {
    /// Create an empty cache.
    ///
    /// # Arguments
    /// * `max_entries` - Entries kept before the least recently used is evicted.
    /// * `ttl` - Age after which an entry no longer counts as fresh.
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN)),
            ttl,
        }
    }

    /// Get the current number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Whether `path` has an entry, fresh or not.
    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains(path)
    }

    /// Store freshly read content.
    pub fn insert(&mut self, path: String, content: String, last_modified: SystemTime) {
        self.entries.put(
            path,
            CachedContent {
                content,
                last_modified,
                cached_at: Instant::now(),
            },
        );
    }

    /// Look up content that is still within the TTL. Expired entries are
    /// dropped on the way.
    pub fn get_fresh(&mut self, path: &str) -> Option<&CachedContent> {
        let expired = self
            .entries
            .peek(path)
            .is_some_and(|cached| cached.cached_at.elapsed() > self.ttl);
        if expired {
            self.entries.pop(path);
            return None;
        }
        self.entries.get(path)
    }

    /// Remove the entry for `path`.
    pub fn remove(&mut self, path: &str) -> Option<CachedContent> {
        self.entries.pop(path)
    }

    /// Move an entry to a new path, keeping its age.
    pub fn rename(&mut self, from: &str, to: String) {
        if let Some(cached) = self.entries.pop(from) {
            self.entries.put(to, cached);
        }
    }

    /// Duplicate an entry under a new path, keeping its age.
    pub fn duplicate(&mut self, from: &str, to: String) {
        if let Some(cached) = self.entries.peek(from).cloned() {
            self.entries.put(to, cached);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_fresh_entry_keeps_timestamp() {
        let mut cache = ContentCache::new(8, Duration::from_secs(60));
        cache.insert("root/a.txt".into(), "hello".into(), at(10));

        let cached = cache.get_fresh("root/a.txt").unwrap();
        assert_eq!(cached.content, "hello");
        assert_eq!(cached.last_modified, at(10));
        assert!(cache.get_fresh("root/b.txt").is_none());
    }

    #[test]
    fn test_expired_entries_are_dropped() {
        let mut cache = ContentCache::new(8, Duration::ZERO);
        cache.insert("root/a.txt".into(), "hello".into(), at(10));
        std::thread::sleep(Duration::from_millis(2));

        assert!(cache.get_fresh("root/a.txt").is_none());
        assert!(!cache.contains("root/a.txt"));
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = ContentCache::new(2, Duration::from_secs(60));
        cache.insert("a".into(), "1".into(), at(1));
        cache.insert("b".into(), "2".into(), at(1));
        cache.insert("c".into(), "3".into(), at(1));

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("a"));
    }

    #[test]
    fn test_rename_and_duplicate() {
        let mut cache = ContentCache::new(8, Duration::from_secs(60));
        cache.insert("a".into(), "1".into(), at(1));

        cache.duplicate("a", "b".into());
        cache.rename("a", "c".into());

        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("c"));
    }
}
