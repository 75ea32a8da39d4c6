use std::time::Duration;
use tracing::trace;

use super::CacheAdapter;
use crate::value::Value;

/// Error type for the tiered cache: which tier failed.
#[derive(Debug, thiserror::Error)]
pub enum TieredError<F, S>
where
    F: std::error::Error + Send + Sync + 'static,
    S: std::error::Error + Send + Sync + 'static,
{
    #[error("fast tier: {0}")]
    Fast(#[source] F),
    #[error("slow tier: {0}")]
    Slow(#[source] S),
}

/// A fast tier in front of a slow tier of record.
///
/// Reads check the fast tier first; a slow-tier hit is promoted into the fast
/// tier for whatever the slow entry has left, capped at `fast_ttl`, so a
/// promoted copy never outlives the tier of record. Writes, deletes and
/// clears fan out to both tiers.
#[derive(Debug)]
pub struct TieredCache<F, S> {
    fast: F,
    slow: S,
    fast_ttl: Duration,
    slow_ttl: Option<Duration>,
}

impl<F: CacheAdapter, S: CacheAdapter> TieredCache<F, S> {
    /// `fast_ttl` caps every fast-tier entry; `slow_ttl` applies to slow-tier
    /// writes that carry no TTL of their own.
    pub fn new(fast: F, slow: S, fast_ttl: Duration, slow_ttl: Option<Duration>) -> Self {
        TieredCache {
            fast,
            slow,
            fast_ttl,
            slow_ttl,
        }
    }

    pub fn fast(&self) -> &F {
        &self.fast
    }

    pub fn slow(&self) -> &S {
        &self.slow
    }

    fn fast_ttl_for(&self, ttl: Option<Duration>) -> Duration {
        ttl.map_or(self.fast_ttl, |ttl| ttl.min(self.fast_ttl))
    }
}

impl<F: CacheAdapter, S: CacheAdapter> CacheAdapter for TieredCache<F, S> {
    type Error = TieredError<F::Error, S::Error>;

    async fn get(&self, key: &str) -> Result<Option<Value>, Self::Error> {
        if let Some(hit) = self.fast.get(key).await.map_err(TieredError::Fast)? {
            return Ok(Some(hit));
        }
        let Some(hit) = self.slow.get(key).await.map_err(TieredError::Slow)? else {
            return Ok(None);
        };
        let left = self.slow.remaining_ttl(key).await.map_err(TieredError::Slow)?;
        trace!(%key, ?left, "promoting slow tier hit");
        self.fast
            .set(key, hit.clone(), Some(self.fast_ttl_for(left)))
            .await
            .map_err(TieredError::Fast)?;
        Ok(Some(hit))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), Self::Error> {
        self.fast
            .set(key, value.clone(), Some(self.fast_ttl_for(ttl)))
            .await
            .map_err(TieredError::Fast)?;
        self.slow
            .set(key, value, ttl.or(self.slow_ttl))
            .await
            .map_err(TieredError::Slow)
    }

    async fn delete(&self, key: &str) -> Result<bool, Self::Error> {
        let fast = self.fast.delete(key).await.map_err(TieredError::Fast)?;
        let slow = self.slow.delete(key).await.map_err(TieredError::Slow)?;
        Ok(fast || slow)
    }

    async fn clear(&self) -> Result<(), Self::Error> {
        self.fast.clear().await.map_err(TieredError::Fast)?;
        self.slow.clear().await.map_err(TieredError::Slow)
    }

    async fn has(&self, key: &str) -> Result<bool, Self::Error> {
        if self.fast.has(key).await.map_err(TieredError::Fast)? {
            return Ok(true);
        }
        self.slow.has(key).await.map_err(TieredError::Slow)
    }

    /// Entry count of the slow tier, the tier of record.
    async fn size(&self) -> Result<usize, Self::Error> {
        self.slow.size().await.map_err(TieredError::Slow)
    }

    /// Remaining TTL in the slow tier, the tier of record.
    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, Self::Error> {
        self.slow.remaining_ttl(key).await.map_err(TieredError::Slow)
    }
}
