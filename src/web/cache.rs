use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

/// Process-local cache of formatted web context strings. Purely a
/// performance layer; every caller must behave identically on a miss.
pub struct ContextCache {
    entries: Mutex<LruCache<String, CachedEntry>>,
    ttl: Option<Duration>,
}

struct CachedEntry {
    stored_at: Instant,
    value: String,
}

/// Key = (user, tool, normalized args, query), case-folded so trivially
/// different phrasings of the same lookup share an entry.
pub fn cache_key(user: &str, tool: &str, args: &str, query: &str) -> String {
    format!(
        "{}|{}|{}|{}",
        user.trim().to_lowercase(),
        tool.trim().to_lowercase(),
        args.trim().to_lowercase(),
        query.trim().to_lowercase()
    )
}

impl ContextCache {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().ok()?;
        let expired = match entries.get(key) {
            Some(entry) => match self.ttl {
                Some(ttl) => entry.stored_at.elapsed() > ttl,
                None => false,
            },
            None => return None,
        };
        if expired {
            entries.pop(key);
            return None;
        }
        entries.get(key).map(|e| e.value.clone())
    }

    pub fn put(&self, key: String, value: String) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.put(
                key,
                CachedEntry {
                    stored_at: Instant::now(),
                    value,
                },
            );
        }
    }
}
