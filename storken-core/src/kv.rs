use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// A string-keyed byte store with optional per-entry expiry.
///
/// This is the backend contract of the remote cache adapter. Stores operate
/// on raw bytes; encoding values is the adapter's job.
///
/// All methods take `&self` to support stores with internal locking (e.g., RocksDB).
pub trait KvStore {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Retrieves the bytes stored under `key`, or None if absent or expired.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Stores bytes under `key`, expiring after `ttl` if given.
    fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), Self::Error>;

    /// Deletes `key`. Returns whether a live entry was removed.
    fn delete(&self, key: &str) -> Result<bool, Self::Error>;

    fn has(&self, key: &str) -> Result<bool, Self::Error>;

    /// Time left before `key` expires. None if absent, expired, or stored
    /// without a TTL.
    fn ttl(&self, key: &str) -> Result<Option<Duration>, Self::Error>;

    /// Lists live keys starting with `prefix`.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, Self::Error>;
}

impl<S: KvStore> KvStore for &S {
    type Error = S::Error;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        (*self).get(key)
    }

    fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), Self::Error> {
        (*self).put(key, value, ttl)
    }

    fn delete(&self, key: &str) -> Result<bool, Self::Error> {
        (*self).delete(key)
    }

    fn has(&self, key: &str) -> Result<bool, Self::Error> {
        (*self).has(key)
    }

    fn ttl(&self, key: &str) -> Result<Option<Duration>, Self::Error> {
        (*self).ttl(key)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, Self::Error> {
        (*self).keys_with_prefix(prefix)
    }
}

impl<S: KvStore> KvStore for Arc<S> {
    type Error = S::Error;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        (**self).get(key)
    }

    fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), Self::Error> {
        (**self).put(key, value, ttl)
    }

    fn delete(&self, key: &str) -> Result<bool, Self::Error> {
        (**self).delete(key)
    }

    fn has(&self, key: &str) -> Result<bool, Self::Error> {
        (**self).has(key)
    }

    fn ttl(&self, key: &str) -> Result<Option<Duration>, Self::Error> {
        (**self).ttl(key)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, Self::Error> {
        (**self).keys_with_prefix(prefix)
    }
}

#[derive(Debug, Clone)]
struct Slot {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// An in-memory store backed by a HashMap.
///
/// Expired entries are hidden on read and purged on the next write.
#[derive(Debug, Default)]
pub struct MemoryKv {
    data: RwLock<HashMap<String, Slot>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| slot.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryKv {
    type Error = Infallible;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        let now = Instant::now();
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        Ok(data
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.bytes.clone()))
    }

    fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), Self::Error> {
        let now = Instant::now();
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        data.retain(|_, slot| slot.is_live(now));
        data.insert(
            key.to_string(),
            Slot {
                bytes: value.to_vec(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, Self::Error> {
        let now = Instant::now();
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        Ok(data.remove(key).is_some_and(|slot| slot.is_live(now)))
    }

    fn has(&self, key: &str) -> Result<bool, Self::Error> {
        Ok(self.get(key)?.is_some())
    }

    fn ttl(&self, key: &str) -> Result<Option<Duration>, Self::Error> {
        let now = Instant::now();
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        Ok(data
            .get(key)
            .and_then(|slot| slot.expires_at)
            .and_then(|at| at.checked_duration_since(now))
            .filter(|left| !left.is_zero()))
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, Self::Error> {
        let now = Instant::now();
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = data
            .iter()
            .filter(|(key, slot)| key.starts_with(prefix) && slot.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
