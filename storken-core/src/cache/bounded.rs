use lru::LruCache;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use super::CacheAdapter;
use crate::codec::{self, CodecError};
use crate::value::Value;

/// Error type for the bounded cache.
#[derive(Debug, thiserror::Error)]
pub enum BoundedCacheError {
    #[error("entry `{key}` needs {bytes} bytes, more than the {max} byte budget")]
    EntryTooLarge { key: String, bytes: usize, max: usize },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

struct Entry {
    value: Value,
    bytes: usize,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

struct Inner {
    entries: LruCache<String, Entry>,
    used: usize,
}

impl Inner {
    fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.pop(key)?;
        self.used -= entry.bytes;
        Some(entry)
    }
}

/// Cache with a global byte budget.
///
/// Entry size is approximated by the length of the key plus the value's JSON
/// encoding. Reads do not refresh an entry, so once the budget is exceeded
/// the oldest-inserted entries are evicted first.
pub struct BoundedCache {
    inner: Mutex<Inner>,
    max_bytes: usize,
}

impl BoundedCache {
    pub fn new(max_bytes: usize) -> Self {
        BoundedCache {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                used: 0,
            }),
            max_bytes,
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Approximate bytes currently held.
    pub fn used_bytes(&self) -> usize {
        self.lock().used
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CacheAdapter for BoundedCache {
    type Error = BoundedCacheError;

    async fn get(&self, key: &str) -> Result<Option<Value>, Self::Error> {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.entries.peek(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                inner.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), Self::Error> {
        let bytes = key.len() + codec::global().to_json_string(&value)?.len();
        if bytes > self.max_bytes {
            return Err(BoundedCacheError::EntryTooLarge {
                key: key.to_string(),
                bytes,
                max: self.max_bytes,
            });
        }
        let mut inner = self.lock();
        inner.remove(key);
        inner.entries.put(
            key.to_string(),
            Entry {
                value,
                bytes,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        inner.used += bytes;
        while inner.used > self.max_bytes {
            let Some((evicted, entry)) = inner.entries.pop_lru() else {
                break;
            };
            inner.used -= entry.bytes;
            trace!(key = %evicted, bytes = entry.bytes, "evicted cache entry");
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, Self::Error> {
        let now = Instant::now();
        Ok(self.lock().remove(key).is_some_and(|entry| entry.is_live(now)))
    }

    async fn clear(&self) -> Result<(), Self::Error> {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.used = 0;
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool, Self::Error> {
        Ok(self.get(key).await?.is_some())
    }

    async fn size(&self) -> Result<usize, Self::Error> {
        let now = Instant::now();
        Ok(self
            .lock()
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .count())
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, Self::Error> {
        let now = Instant::now();
        Ok(self
            .lock()
            .entries
            .peek(key)
            .and_then(|entry| entry.expires_at)
            .filter(|at| *at > now)
            .map(|at| at - now))
    }
}

impl std::fmt::Debug for BoundedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("BoundedCache")
            .field("entries", &inner.entries.len())
            .field("used", &inner.used)
            .field("max_bytes", &self.max_bytes)
            .finish()
    }
}
