//! Cache adapters.
//!
//! Every adapter implements [`CacheAdapter`]: an async, TTL-aware key/value
//! cache of [`Value`]s. Adapters surface backend errors to the caller and
//! never retry.
//!
//! - [`MemoryCache`]: map with per-entry expiry timers
//! - [`BoundedCache`]: byte-budgeted, evicts oldest-inserted entries
//! - [`RemoteCache`]: any [`AsyncKv`](crate::AsyncKv) service under a key prefix
//! - [`TieredCache`]: fast tier in front of a slow tier, with promotion

mod bounded;
mod memory;
mod remote;
mod tiered;

pub use bounded::{BoundedCache, BoundedCacheError};
pub use memory::MemoryCache;
pub use remote::{RemoteCache, RemoteCacheError, DEFAULT_PREFIX};
pub use tiered::{TieredCache, TieredError};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use crate::cell::{BoxError, Cell, Getter};
use crate::codec;
use crate::value::Value;

/// Async key/value cache of [`Value`]s.
pub trait CacheAdapter: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Returns the live value under `key`, if any.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Value>, Self::Error>> + Send;

    /// Stores `value`, expiring after `ttl` if given.
    fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Removes `key`. Returns whether a live entry was removed.
    fn delete(&self, key: &str) -> impl Future<Output = Result<bool, Self::Error>> + Send;

    fn clear(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn has(&self, key: &str) -> impl Future<Output = Result<bool, Self::Error>> + Send;

    /// Number of live entries.
    fn size(&self) -> impl Future<Output = Result<usize, Self::Error>> + Send;

    /// Time left before `key` expires. None if the key is absent or never
    /// expires.
    fn remaining_ttl(&self, key: &str) -> impl Future<Output = Result<Option<Duration>, Self::Error>> + Send;
}

impl<C: CacheAdapter> CacheAdapter for Arc<C> {
    type Error = C::Error;

    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Value>, Self::Error>> + Send {
        (**self).get(key)
    }

    fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        (**self).set(key, value, ttl)
    }

    fn delete(&self, key: &str) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        (**self).delete(key)
    }

    fn clear(&self) -> impl Future<Output = Result<(), Self::Error>> + Send {
        (**self).clear()
    }

    fn has(&self, key: &str) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        (**self).has(key)
    }

    fn size(&self) -> impl Future<Output = Result<usize, Self::Error>> + Send {
        (**self).size()
    }

    fn remaining_ttl(&self, key: &str) -> impl Future<Output = Result<Option<Duration>, Self::Error>> + Send {
        (**self).remaining_ttl(key)
    }
}

/// Wraps `getter` with read-through caching in `cache`.
///
/// Entries are keyed by the cell key plus the JSON-encoded getter arguments.
/// Only truthy results are cached, matching what the cell commits.
pub fn cached_getter<C>(cache: Arc<C>, ttl: Option<Duration>, getter: Getter) -> Getter
where
    C: CacheAdapter + 'static,
{
    Getter::new(move |cell: Cell, args: Vec<Value>| {
        read_through(Arc::clone(&cache), ttl, getter.clone(), cell, args)
    })
}

async fn read_through<C: CacheAdapter>(
    cache: Arc<C>,
    ttl: Option<Duration>,
    getter: Getter,
    cell: Cell,
    args: Vec<Value>,
) -> Result<Value, BoxError> {
    let encoded = codec::global().to_json_string(&Value::Array(args.clone()))?;
    let key = format!("{}:{}", cell.key(), encoded);
    if let Some(hit) = cache.get(&key).await? {
        trace!(%key, "getter cache hit");
        return Ok(hit);
    }
    let fetched = getter.call(cell, args).await?;
    if fetched.is_truthy() {
        cache.set(&key, fetched.clone(), ttl).await?;
    }
    Ok(fetched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn cached_getter_reads_through() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let inner = Getter::from_fn(move |_, args| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::from(format!("page {}", args[0].as_i64().unwrap_or(0))))
        });
        let cache = Arc::new(MemoryCache::new());
        let getter = cached_getter(Arc::clone(&cache), None, inner);

        let cell = Cell::standalone("feed", Value::Null);
        for _ in 0..3 {
            let v = getter.call(cell.clone(), vec![Value::from(1)]).await.unwrap();
            assert_eq!(v, Value::from("page 1"));
        }
        getter.call(cell.clone(), vec![Value::from(2)]).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.size().await.unwrap(), 2);
        assert!(cache.has("feed:[1]").await.unwrap());
    }

    #[tokio::test]
    async fn arc_forwards() {
        let cache = Arc::new(MemoryCache::new());
        cache.set("k", Value::from(1), None).await.unwrap();
        assert_eq!(CacheAdapter::get(&cache, "k").await.unwrap(), Some(Value::from(1)));
    }
}
