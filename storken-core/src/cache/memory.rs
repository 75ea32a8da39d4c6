use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

use super::CacheAdapter;
use crate::value::Value;

struct Slot {
    value: Value,
    expires_at: Option<Instant>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct Slots {
    entries: HashMap<String, Slot>,
    generation: u64,
}

/// In-process cache where each TTL entry schedules its own deletion.
///
/// Expiry timers are tokio tasks. Outside a runtime no timer is spawned and
/// expired entries are dropped lazily when read.
#[derive(Default)]
pub struct MemoryCache {
    slots: Arc<Mutex<Slots>>,
}

fn lock(slots: &Mutex<Slots>) -> MutexGuard<'_, Slots> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn schedule_expiry(&self, key: &str, generation: u64, at: Instant) -> Option<JoinHandle<()>> {
        let handle = Handle::try_current().ok()?;
        let slots: Weak<Mutex<Slots>> = Arc::downgrade(&self.slots);
        let key = key.to_string();
        Some(handle.spawn(async move {
            tokio::time::sleep_until(at).await;
            let Some(slots) = slots.upgrade() else {
                return;
            };
            let mut slots = lock(&slots);
            if slots
                .entries
                .get(&key)
                .is_some_and(|slot| slot.generation == generation)
            {
                slots.entries.remove(&key);
                trace!(%key, "cache entry expired");
            }
        }))
    }
}

impl CacheAdapter for MemoryCache {
    type Error = Infallible;

    async fn get(&self, key: &str) -> Result<Option<Value>, Self::Error> {
        let now = Instant::now();
        let mut slots = lock(&self.slots);
        match slots.entries.get(key) {
            Some(slot) if slot.is_live(now) => Ok(Some(slot.value.clone())),
            Some(_) => {
                if let Some(mut slot) = slots.entries.remove(key) {
                    slot.cancel_timer();
                }
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), Self::Error> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        let generation = {
            let mut slots = lock(&self.slots);
            slots.generation += 1;
            slots.generation
        };
        let timer = expires_at.and_then(|at| self.schedule_expiry(key, generation, at));
        let mut slots = lock(&self.slots);
        let previous = slots.entries.insert(
            key.to_string(),
            Slot {
                value,
                expires_at,
                generation,
                timer,
            },
        );
        if let Some(mut previous) = previous {
            previous.cancel_timer();
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, Self::Error> {
        let now = Instant::now();
        let removed = lock(&self.slots).entries.remove(key);
        Ok(removed.is_some_and(|mut slot| {
            slot.cancel_timer();
            slot.is_live(now)
        }))
    }

    async fn clear(&self) -> Result<(), Self::Error> {
        let mut slots = lock(&self.slots);
        for slot in slots.entries.values_mut() {
            slot.cancel_timer();
        }
        slots.entries.clear();
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool, Self::Error> {
        Ok(self.get(key).await?.is_some())
    }

    async fn size(&self) -> Result<usize, Self::Error> {
        let now = Instant::now();
        Ok(lock(&self.slots)
            .entries
            .values()
            .filter(|slot| slot.is_live(now))
            .count())
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, Self::Error> {
        let now = Instant::now();
        Ok(lock(&self.slots)
            .entries
            .get(key)
            .and_then(|slot| slot.expires_at)
            .filter(|at| *at > now)
            .map(|at| at - now))
    }
}

impl Drop for MemoryCache {
    fn drop(&mut self) {
        for slot in lock(&self.slots).entries.values_mut() {
            slot.cancel_timer();
        }
    }
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entries", &lock(&self.slots).entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        let cache = MemoryCache::new();
        cache.set("a", Value::from(1), None).await.unwrap();
        assert_eq!(cache.get("a").await.unwrap(), Some(Value::from(1)));
        assert!(cache.has("a").await.unwrap());
        assert!(cache.delete("a").await.unwrap());
        assert!(!cache.delete("a").await.unwrap());
        assert_eq!(cache.get("a").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_entry_deletes_itself() {
        let cache = MemoryCache::new();
        cache
            .set("short", Value::from("x"), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        cache.set("forever", Value::from("y"), None).await.unwrap();
        assert_eq!(cache.size().await.unwrap(), 2);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!cache.has("short").await.unwrap());
        assert!(cache.has("forever").await.unwrap());
        assert_eq!(lock(&cache.slots).entries.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overwrite_cancels_old_timer() {
        let cache = MemoryCache::new();
        cache
            .set("k", Value::from(1), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        cache.set("k", Value::from(2), None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(cache.get("k").await.unwrap(), Some(Value::from(2)));
    }

    #[tokio::test]
    async fn clear_empties() {
        let cache = MemoryCache::new();
        for i in 0..5 {
            cache.set(&format!("k{i}"), Value::from(i), None).await.unwrap();
        }
        cache.clear().await.unwrap();
        assert_eq!(cache.size().await.unwrap(), 0);
    }
}
