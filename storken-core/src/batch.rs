//! Request coalescing.
//!
//! A [`BatchLoader`] collects every [`load`](BatchLoader::load) issued within
//! one scheduling window and resolves them with a single call to the batch
//! function. Results are matched to requests by index, so the batch function
//! must return exactly one value per key, in key order.
//!
//! No background task is involved. `load` joins the open window right away,
//! and the first of the window's futures to be polled again after the
//! [`Schedule`] has elapsed closes the window and runs the batch function in
//! its own task. Loads issued before any of them is awaited therefore always
//! share a window, whatever runtime flavor drives them.
//!
//! ```ignore
//! let users = BatchLoader::new(|ids: Vec<u64>| async move {
//!     Ok::<_, BoxError>(db.users_by_ids(&ids).await?)
//! });
//! let (a, b) = tokio::join!(users.load(1), users.load(2)); // one query
//! ```

use futures::future::{self, BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, instrument, trace};

use crate::cell::{BoxError, Cell, Getter};
use crate::value::Value;

/// Error type for batch loads. Cloneable so one failure can reject a whole
/// window.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoaderError {
    #[error("batch function failed: {0}")]
    Batch(Arc<dyn std::error::Error + Send + Sync>),
    #[error("batch function returned {actual} values for {expected} keys")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("cannot derive cache key: {0}")]
    CacheKey(String),
    #[error("batch was dropped before completing")]
    Dropped,
    #[error("batch loading requires a tokio runtime")]
    NoRuntime,
}

/// How long a waiting load holds its window open before flushing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Schedule {
    /// Until the waiting task has yielded once.
    #[default]
    NextTick,
    /// After a fixed delay, collecting more requests per window.
    Delay(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderOptions {
    /// Coalesce requests. When false every load calls the batch function
    /// with a single key and nothing is cached.
    pub batch: bool,
    /// A window reaching this many requests is flushed without waiting for
    /// the schedule.
    pub max_batch_size: usize,
    /// Memoize results (and in-flight requests) per cache key.
    pub cache: bool,
    pub schedule: Schedule,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        LoaderOptions {
            batch: true,
            max_batch_size: usize::MAX,
            cache: true,
            schedule: Schedule::NextTick,
        }
    }
}

type BatchFn<K, V> = dyn Fn(Vec<K>) -> BoxFuture<'static, Result<Vec<V>, BoxError>> + Send + Sync;
type CacheKeyFn<K> = dyn Fn(&K) -> Result<String, LoaderError> + Send + Sync;
type SharedLoad<V> = Shared<BoxFuture<'static, Result<V, LoaderError>>>;

struct Pending<K, V> {
    key: K,
    cache_key: Option<String>,
    tx: oneshot::Sender<Result<V, LoaderError>>,
}

struct LoaderState<K, V> {
    /// Windows not yet taken by a waiter, by id. Only `open` accepts loads.
    windows: HashMap<u64, Vec<Pending<K, V>>>,
    open: u64,
    cache: HashMap<String, SharedLoad<V>>,
}

struct LoaderInner<K, V> {
    batch_fn: Box<BatchFn<K, V>>,
    cache_key: Box<CacheKeyFn<K>>,
    options: LoaderOptions,
    state: Mutex<LoaderState<K, V>>,
}

/// Coalesces single-key loads into batched calls.
pub struct BatchLoader<K, V> {
    inner: Arc<LoaderInner<K, V>>,
}

impl<K, V> Clone for BatchLoader<K, V> {
    fn clone(&self) -> Self {
        BatchLoader {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> BatchLoader<K, V>
where
    K: Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a loader with default options, caching by the key's JSON form.
    pub fn new<F, Fut>(batch_fn: F) -> Self
    where
        K: Serialize,
        F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<V>, BoxError>> + Send + 'static,
    {
        Self::with_options(batch_fn, LoaderOptions::default())
    }

    pub fn with_options<F, Fut>(batch_fn: F, options: LoaderOptions) -> Self
    where
        K: Serialize,
        F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<V>, BoxError>> + Send + 'static,
    {
        Self::build(batch_fn, options, |key: &K| {
            serde_json::to_string(key).map_err(|e| LoaderError::CacheKey(e.to_string()))
        })
    }

    /// Creates a loader with a custom cache-key function.
    pub fn with_cache_key<F, Fut, C>(batch_fn: F, options: LoaderOptions, cache_key: C) -> Self
    where
        F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<V>, BoxError>> + Send + 'static,
        C: Fn(&K) -> String + Send + Sync + 'static,
    {
        Self::build(batch_fn, options, move |key: &K| Ok(cache_key(key)))
    }

    fn build<F, Fut, C>(batch_fn: F, options: LoaderOptions, cache_key: C) -> Self
    where
        F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<V>, BoxError>> + Send + 'static,
        C: Fn(&K) -> Result<String, LoaderError> + Send + Sync + 'static,
    {
        BatchLoader {
            inner: Arc::new(LoaderInner {
                batch_fn: Box::new(move |keys: Vec<K>| batch_fn(keys).boxed()),
                cache_key: Box::new(cache_key),
                options,
                state: Mutex::new(LoaderState {
                    windows: HashMap::new(),
                    open: 0,
                    cache: HashMap::new(),
                }),
            }),
        }
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.inner.options
    }

    fn state(&self) -> MutexGuard<'_, LoaderState<K, V>> {
        lock(&self.inner)
    }

    /// Loads one key.
    ///
    /// The request joins the open window immediately. Awaiting the returned
    /// future flushes the window once the schedule has elapsed, unless
    /// another waiter of the same window got there first. Requests for a key
    /// that is cached, or already pending, share that result.
    ///
    /// Dropping a future while it runs the batch function rejects the rest
    /// of its window with [`LoaderError::Dropped`].
    pub fn load(&self, key: K) -> BoxFuture<'static, Result<V, LoaderError>> {
        if !self.inner.options.batch {
            return self.load_unbatched(key);
        }
        if Handle::try_current().is_err() {
            return future::ready(Err(LoaderError::NoRuntime)).boxed();
        }

        let cache_key = if self.inner.options.cache {
            match (self.inner.cache_key)(&key) {
                Ok(cache_key) => Some(cache_key),
                Err(e) => return future::ready(Err(e)).boxed(),
            }
        } else {
            None
        };

        let mut state = self.state();
        if let Some(hit) = cache_key.as_ref().and_then(|k| state.cache.get(k)) {
            trace!(key = cache_key.as_deref(), "load served from cache");
            return hit.clone().boxed();
        }

        let (tx, rx) = oneshot::channel();
        let window = state.open;
        let items = state.windows.entry(window).or_default();
        items.push(Pending {
            key,
            cache_key: cache_key.clone(),
            tx,
        });
        let full = items.len() >= self.inner.options.max_batch_size.max(1);
        if full {
            state.open += 1;
        }

        let waiter = wait_and_flush(Arc::downgrade(&self.inner), window, full, rx).boxed();
        match cache_key {
            Some(k) => {
                let shared = waiter.shared();
                state.cache.insert(k, shared.clone());
                shared.boxed()
            }
            None => waiter,
        }
    }

    fn load_unbatched(&self, key: K) -> BoxFuture<'static, Result<V, LoaderError>> {
        let call = (self.inner.batch_fn)(vec![key]);
        async move {
            let mut values = call.await.map_err(|e| LoaderError::Batch(Arc::from(e)))?;
            if values.len() != 1 {
                return Err(LoaderError::LengthMismatch {
                    expected: 1,
                    actual: values.len(),
                });
            }
            values.pop().ok_or(LoaderError::Dropped)
        }
        .boxed()
    }

    /// Loads several keys; they share the current window.
    pub async fn load_many<I>(&self, keys: I) -> Result<Vec<V>, LoaderError>
    where
        I: IntoIterator<Item = K>,
    {
        future::try_join_all(keys.into_iter().map(|key| self.load(key))).await
    }

    /// Forgets the cached result for `key`. Returns whether one existed.
    pub fn clear(&self, key: &K) -> bool {
        match (self.inner.cache_key)(key) {
            Ok(cache_key) => self.state().cache.remove(&cache_key).is_some(),
            Err(_) => false,
        }
    }

    pub fn clear_all(&self) {
        self.state().cache.clear();
    }

    /// Seeds the cache with a known value. An existing entry is kept.
    /// Returns whether the value was stored.
    pub fn prime(&self, key: &K, value: V) -> bool {
        if !(self.inner.options.batch && self.inner.options.cache) {
            return false;
        }
        let Ok(cache_key) = (self.inner.cache_key)(key) else {
            return false;
        };
        let mut state = self.state();
        if state.cache.contains_key(&cache_key) {
            return false;
        }
        let ready = future::ready(Ok(value)).boxed().shared();
        state.cache.insert(cache_key, ready);
        true
    }
}

impl BatchLoader<String, Value> {
    /// A cell getter that loads the cell's key through this loader, so
    /// cells fetched together are fetched in one batch.
    pub fn getter(&self) -> Getter {
        let loader = self.clone();
        Getter::new(move |cell: Cell, _args: Vec<Value>| {
            let load = loader.load(cell.key().to_string());
            async move { load.await.map_err(|e| Box::new(e) as BoxError) }
        })
    }
}

fn lock<K, V>(inner: &LoaderInner<K, V>) -> MutexGuard<'_, LoaderState<K, V>> {
    inner.state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Waits out the schedule (skipped for a full window), flushes `window` if
/// no other waiter has, then waits for this request's result.
async fn wait_and_flush<K, V>(
    inner: Weak<LoaderInner<K, V>>,
    window: u64,
    full: bool,
    rx: oneshot::Receiver<Result<V, LoaderError>>,
) -> Result<V, LoaderError>
where
    K: Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    if !full {
        let schedule = match inner.upgrade() {
            Some(inner) => inner.options.schedule,
            None => return Err(LoaderError::Dropped),
        };
        match schedule {
            Schedule::NextTick => tokio::task::yield_now().await,
            Schedule::Delay(delay) => tokio::time::sleep(delay).await,
        }
    }
    if let Some(inner) = inner.upgrade() {
        let items = {
            let mut state = lock(&inner);
            if state.open == window {
                state.open += 1;
            }
            state.windows.remove(&window)
        };
        if let Some(items) = items {
            dispatch(inner, items).await;
        }
    }
    rx.await.unwrap_or(Err(LoaderError::Dropped))
}

#[instrument(skip_all, fields(keys = items.len()))]
async fn dispatch<K, V>(inner: Arc<LoaderInner<K, V>>, items: Vec<Pending<K, V>>)
where
    K: Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    let mut keys = Vec::with_capacity(items.len());
    let mut waiters = Vec::with_capacity(items.len());
    for Pending { key, cache_key, tx } in items {
        keys.push(key);
        waiters.push((cache_key, tx));
    }
    let expected = keys.len();
    debug!("dispatching batch");

    let failure = match (inner.batch_fn)(keys).await {
        Ok(values) if values.len() == expected => {
            for ((_, tx), value) in waiters.into_iter().zip(values) {
                let _ = tx.send(Ok(value));
            }
            return;
        }
        Ok(values) => LoaderError::LengthMismatch {
            expected,
            actual: values.len(),
        },
        Err(e) => LoaderError::Batch(Arc::from(e)),
    };

    debug!(error = %failure, "batch failed, rejecting window");
    {
        let mut state = lock(&inner);
        for (cache_key, _) in &waiters {
            if let Some(cache_key) = cache_key {
                state.cache.remove(cache_key);
            }
        }
    }
    for (_, tx) in waiters {
        let _ = tx.send(Err(failure.clone()));
    }
}
