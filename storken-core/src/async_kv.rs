use std::future::Future;
use std::time::Duration;

use crate::kv::KvStore;

/// Async string-keyed byte store.
///
/// Mirrors [`KvStore`] with async methods so network services (Redis-like
/// servers, HTTP key-value APIs) can back the remote cache adapter. Methods
/// are prefixed with `async_` to avoid name collisions when a type
/// implements both traits.
pub trait AsyncKv: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn async_get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>> + Send;
    fn async_put(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
    fn async_delete(&self, key: &str) -> impl Future<Output = Result<bool, Self::Error>> + Send;
    fn async_has(&self, key: &str) -> impl Future<Output = Result<bool, Self::Error>> + Send;
    fn async_ttl(&self, key: &str) -> impl Future<Output = Result<Option<Duration>, Self::Error>> + Send;
    fn async_keys_with_prefix(
        &self,
        prefix: &str,
    ) -> impl Future<Output = Result<Vec<String>, Self::Error>> + Send;

    /// Batch delete - default impl calls async_delete() in sequence.
    /// Returns how many live entries were removed.
    fn async_delete_many(&self, keys: &[String]) -> impl Future<Output = Result<usize, Self::Error>> + Send {
        let keys = keys.to_vec();
        async move {
            let mut removed = 0;
            for key in &keys {
                if self.async_delete(key).await? {
                    removed += 1;
                }
            }
            Ok(removed)
        }
    }
}

/// Blanket impl: any sync `KvStore` is also an `AsyncKv`.
impl<S: KvStore + Send + Sync> AsyncKv for S {
    type Error = S::Error;

    async fn async_get(&self, key: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        self.get(key)
    }

    async fn async_put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), Self::Error> {
        self.put(key, value, ttl)
    }

    async fn async_delete(&self, key: &str) -> Result<bool, Self::Error> {
        self.delete(key)
    }

    async fn async_has(&self, key: &str) -> Result<bool, Self::Error> {
        self.has(key)
    }

    async fn async_ttl(&self, key: &str) -> Result<Option<Duration>, Self::Error> {
        self.ttl(key)
    }

    async fn async_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, Self::Error> {
        self.keys_with_prefix(prefix)
    }
}
