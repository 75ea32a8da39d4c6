use std::time::Duration;
use tracing::{debug, trace};

use super::CacheAdapter;
use crate::async_kv::AsyncKv;
use crate::codec::{self, CodecError};
use crate::value::Value;

/// Key prefix used when none is configured.
pub const DEFAULT_PREFIX: &str = "storken:";

/// Error type for the remote cache.
#[derive(Debug, thiserror::Error)]
pub enum RemoteCacheError<E: std::error::Error + Send + Sync + 'static> {
    #[error("cache service error: {0}")]
    Service(#[source] E),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Cache adapter over an external key-value service.
///
/// Keys are namespaced with a prefix. Values are written as codec-encoded
/// JSON; a stored payload that does not parse is returned as the raw string.
#[derive(Debug)]
pub struct RemoteCache<S> {
    service: S,
    prefix: String,
}

impl<S: AsyncKv> RemoteCache<S> {
    pub fn new(service: S) -> Self {
        Self::with_prefix(service, DEFAULT_PREFIX)
    }

    pub fn with_prefix(service: S, prefix: impl Into<String>) -> Self {
        RemoteCache {
            service,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

fn parse_stored(bytes: Vec<u8>) -> Result<Value, CodecError> {
    match serde_json::from_slice::<serde_json::Value>(&bytes) {
        Ok(json) => codec::global().decode(json),
        Err(e) => {
            trace!(error = %e, "stored payload is not JSON, returning raw");
            Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        }
    }
}

impl<S: AsyncKv> CacheAdapter for RemoteCache<S> {
    type Error = RemoteCacheError<S::Error>;

    async fn get(&self, key: &str) -> Result<Option<Value>, Self::Error> {
        let stored = self
            .service
            .async_get(&self.full_key(key))
            .await
            .map_err(RemoteCacheError::Service)?;
        match stored {
            Some(bytes) => Ok(Some(parse_stored(bytes)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), Self::Error> {
        let encoded = codec::global().to_json_string(&value)?;
        self.service
            .async_put(&self.full_key(key), encoded.as_bytes(), ttl)
            .await
            .map_err(RemoteCacheError::Service)
    }

    async fn delete(&self, key: &str) -> Result<bool, Self::Error> {
        self.service
            .async_delete(&self.full_key(key))
            .await
            .map_err(RemoteCacheError::Service)
    }

    /// Deletes every key under this cache's prefix.
    async fn clear(&self) -> Result<(), Self::Error> {
        let keys = self
            .service
            .async_keys_with_prefix(&self.prefix)
            .await
            .map_err(RemoteCacheError::Service)?;
        let removed = self
            .service
            .async_delete_many(&keys)
            .await
            .map_err(RemoteCacheError::Service)?;
        debug!(prefix = %self.prefix, removed, "cleared remote cache");
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool, Self::Error> {
        self.service
            .async_has(&self.full_key(key))
            .await
            .map_err(RemoteCacheError::Service)
    }

    async fn size(&self) -> Result<usize, Self::Error> {
        self.service
            .async_keys_with_prefix(&self.prefix)
            .await
            .map(|keys| keys.len())
            .map_err(RemoteCacheError::Service)
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, Self::Error> {
        self.service
            .async_ttl(&self.full_key(key))
            .await
            .map_err(RemoteCacheError::Service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvStore, MemoryKv};
    use crate::value::Pattern;
    use std::sync::Arc;

    #[tokio::test]
    async fn values_are_namespaced_and_encoded() {
        let kv = Arc::new(MemoryKv::new());
        let cache = RemoteCache::new(Arc::clone(&kv));

        let value = Value::object([
            ("when", Value::Date(chrono::DateTime::UNIX_EPOCH)),
            ("re", Value::from(Pattern::new("a+", "i").unwrap())),
        ]);
        cache.set("user", value.clone(), None).await.unwrap();

        assert!(kv.has("storken:user").unwrap());
        assert!(!kv.has("user").unwrap());
        assert_eq!(cache.get("user").await.unwrap(), Some(value));
    }

    #[tokio::test]
    async fn unparseable_payload_falls_back_to_raw() {
        let kv = Arc::new(MemoryKv::new());
        kv.put("storken:legacy", b"plain text", None).unwrap();
        let cache = RemoteCache::new(Arc::clone(&kv));
        assert_eq!(
            cache.get("legacy").await.unwrap(),
            Some(Value::from("plain text"))
        );
    }

    #[tokio::test]
    async fn clear_only_touches_own_prefix() {
        let kv = Arc::new(MemoryKv::new());
        kv.put("other:keep", b"1", None).unwrap();
        let cache = RemoteCache::with_prefix(Arc::clone(&kv), "app:");
        cache.set("a", Value::from(1), None).await.unwrap();
        cache.set("b", Value::from(2), None).await.unwrap();
        assert_eq!(cache.size().await.unwrap(), 2);

        cache.clear().await.unwrap();
        assert_eq!(cache.size().await.unwrap(), 0);
        assert!(kv.has("other:keep").unwrap());
    }

    #[tokio::test]
    async fn ttl_is_passed_through() {
        let kv = Arc::new(MemoryKv::new());
        let cache = RemoteCache::new(Arc::clone(&kv));
        cache
            .set("gone", Value::from(1), Some(Duration::ZERO))
            .await
            .unwrap();
        assert!(!cache.has("gone").await.unwrap());
        assert!(!cache.delete("gone").await.unwrap());
    }
}
