//! The reactive state cell.
//!
//! A [`Cell`] holds one value plus its loading state, listeners, event bus and
//! plugin capabilities. Every write goes through one commit path:
//!
//! 1. resolve the new value (plain or functional update);
//! 2. skip if it equals the current value and `force` is not set;
//! 3. dispatch `will_set`, then run the setter if one is configured;
//! 4. commit: store the value, notify value listeners in registration order,
//!    dispatch `set`.
//!
//! Listener callbacks run synchronously right after the commit and never
//! while the cell's internal lock is held, so they may read or write the cell.
//!
//! # Loading states
//!
//! `Idle -> Loading` while a getter or setter is in flight, back to `Idle`
//! afterwards, whether the hook succeeded or failed. A `reset()` whose setter
//! is in flight uses `SuspendedWrite` instead of `Loading`, so bindings can
//! keep spinners hidden for programmatic resets.

use futures::future::BoxFuture;
use futures::FutureExt;
use indexmap::IndexMap;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, instrument, trace};

use crate::options::Options;
use crate::plugin::{self, Capability, PluginFactory};
use crate::value::Value;

/// Error type produced by user hooks (getters, setters, batch functions).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Event names dispatched by the cell itself.
pub mod events {
    /// Before a write runs the setter or commits. Args: `[new_value]`.
    pub const WILL_SET: &str = "will_set";
    /// After a value is committed and listeners ran. Args: `[value]`.
    pub const SET: &str = "set";
    /// Before the getter is invoked. Args: the getter arguments.
    pub const GETTING: &str = "getting";
    /// After the getter resolved. Args: `[result]`.
    pub const GETTED: &str = "getted";
    /// When the loading state changes. Args: `[true | false | null]`.
    pub const LOADING: &str = "loading";
    /// After a listener pair is registered and synchronized.
    pub const EFFECT: &str = "effect";
    /// After a listener pair is removed.
    pub const UNMOUNTED: &str = "unmounted";
}

/// Error type for cell operations.
#[derive(Debug, thiserror::Error)]
pub enum CellError {
    #[error("getter for `{key}` failed: {source}")]
    Getter {
        key: String,
        #[source]
        source: BoxError,
    },
    #[error("setter for `{key}` failed: {source}")]
    Setter {
        key: String,
        #[source]
        source: BoxError,
    },
}

/// Loading flag of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadingState {
    #[default]
    Idle,
    Loading,
    /// A write is in flight that should not show as loading.
    SuspendedWrite,
}

impl LoadingState {
    pub fn is_loading(self) -> bool {
        self == LoadingState::Loading
    }
}

impl From<LoadingState> for Value {
    fn from(state: LoadingState) -> Self {
        match state {
            LoadingState::Idle => Value::Bool(false),
            LoadingState::Loading => Value::Bool(true),
            LoadingState::SuspendedWrite => Value::Null,
        }
    }
}

type GetterFn = dyn Fn(Cell, Vec<Value>) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync;
type SetterFn =
    dyn Fn(Cell, Value, Vec<Value>) -> BoxFuture<'static, Result<Option<Value>, BoxError>> + Send + Sync;

/// Produces a cell's value from a remote or computed source.
#[derive(Clone)]
pub struct Getter(Arc<GetterFn>);

impl Getter {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Cell, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        Getter(Arc::new(move |cell: Cell, args: Vec<Value>| f(cell, args).boxed()))
    }

    /// A getter that completes synchronously.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&Cell, &[Value]) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        Getter(Arc::new(move |cell: Cell, args: Vec<Value>| {
            futures::future::ready(f(&cell, &args)).boxed()
        }))
    }

    pub(crate) fn call(&self, cell: Cell, args: Vec<Value>) -> BoxFuture<'static, Result<Value, BoxError>> {
        (self.0)(cell, args)
    }
}

/// Invoked when a cell is written, typically to persist the value remotely.
///
/// Returning `Some(value)` hands a value back; it is committed instead of the
/// requested one when the cell has `set_with_setter` enabled.
#[derive(Clone)]
pub struct Setter(Arc<SetterFn>);

impl Setter {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Cell, Value, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>, BoxError>> + Send + 'static,
    {
        Setter(Arc::new(move |cell: Cell, value: Value, args: Vec<Value>| {
            f(cell, value, args).boxed()
        }))
    }

    /// A setter that completes synchronously.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&Cell, &Value, &[Value]) -> Result<Option<Value>, BoxError> + Send + Sync + 'static,
    {
        Setter(Arc::new(move |cell: Cell, value: Value, args: Vec<Value>| {
            futures::future::ready(f(&cell, &value, &args)).boxed()
        }))
    }

    pub(crate) fn call(
        &self,
        cell: Cell,
        value: Value,
        args: Vec<Value>,
    ) -> BoxFuture<'static, Result<Option<Value>, BoxError>> {
        (self.0)(cell, value, args)
    }
}

impl std::fmt::Debug for Getter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Getter")
    }
}

impl std::fmt::Debug for Setter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Setter")
    }
}

/// Flags for a single write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Commit and notify even if the value is unchanged.
    pub force: bool,
    /// Commit without invoking the setter.
    pub disable_setter: bool,
}

impl SetOptions {
    pub fn forced() -> Self {
        SetOptions {
            force: true,
            disable_setter: false,
        }
    }

    pub fn without_setter() -> Self {
        SetOptions {
            force: false,
            disable_setter: true,
        }
    }
}

/// Handle of an event listener registered with [`Cell::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type ValueListener = Arc<dyn Fn(&Value) + Send + Sync>;
type LoadingListener = Arc<dyn Fn(LoadingState) + Send + Sync>;
type EventListener = Arc<dyn Fn(&[Value]) + Send + Sync>;

struct CellState {
    value: Value,
    loading: LoadingState,
    args: Vec<Value>,
    getted: bool,
    write_seq: u64,
    next_id: u64,
    listeners: BTreeMap<u64, ValueListener>,
    loading_listeners: BTreeMap<u64, LoadingListener>,
    events: HashMap<String, BTreeMap<u64, EventListener>>,
}

impl CellState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

struct CellInner {
    key: String,
    initial: Value,
    options: Options,
    getter: Option<Getter>,
    setter: Option<Setter>,
    state: Mutex<CellState>,
    plugins: Mutex<IndexMap<String, Arc<dyn Capability>>>,
}

/// A shared handle to one piece of reactive state.
///
/// Cloning is cheap; all clones refer to the same cell.
#[derive(Clone)]
pub struct Cell {
    inner: Arc<CellInner>,
}

/// A non-owning handle to a [`Cell`].
#[derive(Clone)]
pub struct WeakCell {
    inner: Weak<CellInner>,
}

impl WeakCell {
    pub fn upgrade(&self) -> Option<Cell> {
        self.inner.upgrade().map(|inner| Cell { inner })
    }
}

impl Cell {
    pub(crate) fn new(
        key: impl Into<String>,
        initial: Value,
        options: Options,
        getter: Option<Getter>,
        setter: Option<Setter>,
        args: Vec<Value>,
    ) -> Self {
        let loading = if options.loading {
            LoadingState::Loading
        } else {
            LoadingState::Idle
        };
        Cell {
            inner: Arc::new(CellInner {
                key: key.into(),
                initial: initial.clone(),
                options,
                getter,
                setter,
                state: Mutex::new(CellState {
                    value: initial,
                    loading,
                    args,
                    getted: false,
                    write_seq: 0,
                    next_id: 0,
                    listeners: BTreeMap::new(),
                    loading_listeners: BTreeMap::new(),
                    events: HashMap::new(),
                }),
                plugins: Mutex::new(IndexMap::new()),
            }),
        }
    }

    /// Creates a standalone cell, outside any registry.
    pub fn standalone(key: impl Into<String>, initial: impl Into<Value>) -> Self {
        Self::new(key, initial.into(), Options::default(), None, None, Vec::new())
    }

    fn state(&self) -> MutexGuard<'_, CellState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn plugin_map(&self) -> MutexGuard<'_, IndexMap<String, Arc<dyn Capability>>> {
        self.inner
            .plugins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Returns a clone of the committed value.
    pub fn value(&self) -> Value {
        self.state().value.clone()
    }

    /// Runs `f` against the committed value without cloning it.
    ///
    /// `f` must not call back into this cell.
    pub fn with_value<R>(&self, f: impl FnOnce(&Value) -> R) -> R {
        f(&self.state().value)
    }

    pub fn initial_value(&self) -> &Value {
        &self.inner.initial
    }

    pub fn loading(&self) -> LoadingState {
        self.state().loading
    }

    pub fn args(&self) -> Vec<Value> {
        self.state().args.clone()
    }

    /// Replaces the arguments passed to subsequent getter/setter calls.
    pub fn set_args(&self, args: Vec<Value>) {
        self.state().args = args;
    }

    /// Whether the getter has completed at least once.
    pub fn is_getted(&self) -> bool {
        self.state().getted
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    pub fn has_getter(&self) -> bool {
        self.inner.getter.is_some()
    }

    pub fn has_setter(&self) -> bool {
        self.inner.setter.is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.state().listeners.len()
    }

    pub fn downgrade(&self) -> WeakCell {
        WeakCell {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(&self, other: &Cell) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    pub async fn set(&self, value: impl Into<Value>) -> Result<(), CellError> {
        self.apply(value.into(), SetOptions::default(), LoadingState::Loading)
            .await
    }

    pub async fn set_with_options(
        &self,
        value: impl Into<Value>,
        options: SetOptions,
    ) -> Result<(), CellError> {
        self.apply(value.into(), options, LoadingState::Loading).await
    }

    /// Functional update: computes the new value from the current one.
    pub async fn modify<F>(&self, f: F) -> Result<(), CellError>
    where
        F: FnOnce(&Value) -> Value,
    {
        self.modify_with_options(f, SetOptions::default()).await
    }

    pub async fn modify_with_options<F>(&self, f: F, options: SetOptions) -> Result<(), CellError>
    where
        F: FnOnce(&Value) -> Value,
    {
        let current = self.value();
        let next = f(&current);
        self.apply(next, options, LoadingState::Loading).await
    }

    /// Writes the configured initial value back, through the setter path.
    pub async fn reset(&self) -> Result<(), CellError> {
        let initial = self.inner.initial.clone();
        self.apply(initial, SetOptions::forced(), LoadingState::SuspendedWrite)
            .await
    }

    #[instrument(skip_all, fields(key = %self.inner.key, ns = ?self.inner.options.namespace))]
    async fn apply(
        &self,
        value: Value,
        options: SetOptions,
        in_flight: LoadingState,
    ) -> Result<(), CellError> {
        if !options.force && self.with_value(|current| *current == value) {
            trace!("value unchanged, skipping");
            return Ok(());
        }

        self.dispatch_event(events::WILL_SET, std::slice::from_ref(&value));

        // Every write that gets this far is sequenced, setter or not.
        let seq = {
            let mut state = self.state();
            state.write_seq += 1;
            state.write_seq
        };

        let setter = match &self.inner.setter {
            Some(setter) if !options.disable_setter => setter.clone(),
            _ => {
                self.commit(value);
                return Ok(());
            }
        };

        self.set_loading(in_flight);
        debug!(seq, "invoking setter");
        let outcome = setter.call(self.clone(), value.clone(), self.args()).await;

        match outcome {
            Ok(produced) => {
                let committed = match produced {
                    Some(produced) if self.inner.options.set_with_setter => produced,
                    _ => value,
                };
                let stale = self.inner.options.drop_stale_writes && self.state().write_seq != seq;
                if stale {
                    debug!(seq, "dropping stale setter completion");
                } else {
                    self.commit(committed);
                }
                self.set_loading(LoadingState::Idle);
                Ok(())
            }
            Err(source) => {
                debug!(error = %source, "setter failed");
                self.set_loading(LoadingState::Idle);
                Err(CellError::Setter {
                    key: self.inner.key.clone(),
                    source,
                })
            }
        }
    }

    fn commit(&self, value: Value) {
        let listeners: Vec<ValueListener> = {
            let mut state = self.state();
            state.value = value.clone();
            state.listeners.values().cloned().collect()
        };
        for listener in &listeners {
            listener(&value);
        }
        self.dispatch_event(events::SET, std::slice::from_ref(&value));
    }

    fn set_loading(&self, loading: LoadingState) {
        let listeners: Vec<LoadingListener> = {
            let mut state = self.state();
            if state.loading == loading {
                return;
            }
            state.loading = loading;
            state.loading_listeners.values().cloned().collect()
        };
        for listener in &listeners {
            listener(loading);
        }
        self.dispatch_event(events::LOADING, &[loading.into()]);
    }

    // ------------------------------------------------------------------
    // Getter
    // ------------------------------------------------------------------

    /// Runs the getter with the stored arguments and commits its result.
    pub async fn update(&self) -> Result<Value, CellError> {
        let args = self.args();
        self.set_from_getter(args).await
    }

    /// Runs the getter with `args` and commits a truthy result.
    ///
    /// Without a getter this returns the current value. With
    /// `disable_getter_on_loading` and a fetch already in flight, it returns
    /// the current value without calling the getter again.
    #[instrument(skip_all, fields(key = %self.inner.key, ns = ?self.inner.options.namespace))]
    pub async fn set_from_getter(&self, args: Vec<Value>) -> Result<Value, CellError> {
        let Some(getter) = self.inner.getter.clone() else {
            return Ok(self.value());
        };
        if self.inner.options.disable_getter_on_loading && self.loading().is_loading() {
            trace!("getter already in flight");
            return Ok(self.value());
        }

        self.set_loading(LoadingState::Loading);
        self.dispatch_event(events::GETTING, &args);
        debug!("invoking getter");

        let fetched = match getter.call(self.clone(), args).await {
            Ok(fetched) => fetched,
            Err(source) => {
                debug!(error = %source, "getter failed");
                self.set_loading(LoadingState::Idle);
                return Err(CellError::Getter {
                    key: self.inner.key.clone(),
                    source,
                });
            }
        };

        self.state().getted = true;
        self.dispatch_event(events::GETTED, std::slice::from_ref(&fetched));

        let outcome = if fetched.is_truthy() {
            let options = SetOptions {
                force: true,
                disable_setter: self.inner.options.disable_setter_on_getter,
            };
            self.apply(fetched.clone(), options, LoadingState::Loading)
                .await
        } else {
            trace!("getter returned a falsy value, not committing");
            Ok(())
        };
        self.set_loading(LoadingState::Idle);
        outcome.map(|()| fetched)
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    /// Registers a value listener and a loading listener.
    ///
    /// Both are called once immediately with the current state, then on
    /// every change, until the returned subscription is dropped.
    pub fn subscribe<V, L>(&self, on_value: V, on_loading: L) -> Subscription
    where
        V: Fn(&Value) + Send + Sync + 'static,
        L: Fn(LoadingState) + Send + Sync + 'static,
    {
        let on_value: ValueListener = Arc::new(on_value);
        let on_loading: LoadingListener = Arc::new(on_loading);
        let (id, value, loading) = {
            let mut state = self.state();
            let id = state.next_id();
            state.listeners.insert(id, Arc::clone(&on_value));
            state.loading_listeners.insert(id, Arc::clone(&on_loading));
            (id, state.value.clone(), state.loading)
        };
        on_value(&value);
        on_loading(loading);
        self.dispatch_event(events::EFFECT, &[]);
        Subscription {
            cell: Some(self.clone()),
            id,
        }
    }

    /// Subscribes and, unless disabled, runs the getter.
    ///
    /// `args`, when given, replace the stored getter arguments first. The
    /// getter is skipped when `disable_auto_getter` is set, or when
    /// `get_once` is set and a fetch already completed. A getter failure
    /// drops the subscription and is returned; it does not count as the
    /// single fetch of a `get_once` cell.
    pub async fn listen<V, L>(
        &self,
        on_value: V,
        on_loading: L,
        args: Option<Vec<Value>>,
    ) -> Result<Subscription, CellError>
    where
        V: Fn(&Value) + Send + Sync + 'static,
        L: Fn(LoadingState) + Send + Sync + 'static,
    {
        if let Some(args) = args {
            self.set_args(args);
        }
        let subscription = self.subscribe(on_value, on_loading);
        if self.should_auto_fetch() {
            if let Err(e) = self.update().await {
                subscription.discard();
                return Err(e);
            }
        }
        Ok(subscription)
    }

    fn should_auto_fetch(&self) -> bool {
        let options = &self.inner.options;
        !options.disable_auto_getter && !(options.get_once && self.is_getted())
    }

    fn unlisten(&self, id: u64, settle_get_once: bool) {
        {
            let mut state = self.state();
            state.listeners.remove(&id);
            state.loading_listeners.remove(&id);
            if settle_get_once && self.inner.options.get_once {
                state.getted = true;
            }
        }
        self.dispatch_event(events::UNMOUNTED, &[]);
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Registers an event callback. Callbacks for one event run in
    /// registration order.
    pub fn on<F>(&self, event: impl Into<String>, callback: F) -> ListenerId
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let mut state = self.state();
        let id = state.next_id();
        state
            .events
            .entry(event.into())
            .or_default()
            .insert(id, Arc::new(callback));
        ListenerId(id)
    }

    /// Removes an event callback. Returns whether it was registered.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let mut state = self.state();
        let Some(listeners) = state.events.get_mut(event) else {
            return false;
        };
        let removed = listeners.remove(&id.0).is_some();
        if listeners.is_empty() {
            state.events.remove(event);
        }
        removed
    }

    pub fn dispatch_event(&self, event: &str, args: &[Value]) {
        let callbacks: Vec<EventListener> = match self.state().events.get(event) {
            Some(listeners) => listeners.values().cloned().collect(),
            None => return,
        };
        for callback in &callbacks {
            callback(args);
        }
    }

    // ------------------------------------------------------------------
    // Plugins
    // ------------------------------------------------------------------

    pub(crate) fn install_plugins(&self, factories: &IndexMap<String, PluginFactory>) {
        for (name, factory) in factories {
            let capability = factory.instantiate(self);
            self.plugin_map().insert(name.clone(), capability);
        }
    }

    /// Returns the capability a plugin attached under `name`, if it has
    /// type `T`.
    pub fn plugin<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        let capability = self.plugin_map().get(name).cloned()?;
        plugin::downcast::<T>(&capability)
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.plugin_map().keys().cloned().collect()
    }

    /// Disposes and detaches every plugin capability.
    pub(crate) fn dispose_plugins(&self) {
        let plugins: Vec<(String, Arc<dyn Capability>)> = self.plugin_map().drain(..).collect();
        for (name, capability) in plugins {
            trace!(key = %self.inner.key, plugin = %name, "disposing plugin");
            capability.dispose();
        }
    }
}

impl std::fmt::Debug for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Cell")
            .field("key", &self.inner.key)
            .field("value", &state.value)
            .field("loading", &state.loading)
            .finish()
    }
}

/// Keeps a listener pair registered on a cell.
///
/// Dropping it (or calling [`unsubscribe`](Self::unsubscribe)) removes both
/// listeners and dispatches `unmounted`.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cell: Option<Cell>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.release(true);
    }

    /// Unsubscribes after a failed fetch, leaving a `get_once` cell free to
    /// fetch again on the next `listen`.
    fn discard(mut self) {
        self.release(false);
    }

    fn release(&mut self, settle_get_once: bool) {
        if let Some(cell) = self.cell.take() {
            cell.unlisten(self.id, settle_get_once);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release(true);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.cell.as_ref().map(Cell::key))
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder() -> (Arc<Mutex<Vec<Value>>>, impl Fn(&Value) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |v: &Value| sink.lock().unwrap().push(v.clone()))
    }

    fn cell_with(
        initial: Value,
        options: Options,
        getter: Option<Getter>,
        setter: Option<Setter>,
    ) -> Cell {
        Cell::new("test", initial, options, getter, setter, Vec::new())
    }

    #[tokio::test]
    async fn equal_set_is_a_noop() {
        let cell = Cell::standalone("n", 0);
        let (seen, listener) = recorder();
        let _sub = cell.subscribe(listener, |_| {});

        cell.set(1).await.unwrap();
        cell.set(1).await.unwrap();

        // initial sync + one commit
        assert_eq!(*seen.lock().unwrap(), vec![Value::from(0), Value::from(1)]);
    }

    #[tokio::test]
    async fn forced_set_always_notifies() {
        let cell = Cell::standalone("n", 0);
        let (seen, listener) = recorder();
        let _sub = cell.subscribe(listener, |_| {});

        cell.set_with_options(1, SetOptions::forced()).await.unwrap();
        cell.set_with_options(1, SetOptions::forced()).await.unwrap();

        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn modify_uses_current_value() {
        let cell = Cell::standalone("n", 10);
        cell.modify(|v| Value::from(v.as_i64().unwrap() + 5))
            .await
            .unwrap();
        assert_eq!(cell.value(), Value::from(15));
    }

    #[tokio::test]
    async fn reset_restores_initial() {
        let cell = Cell::standalone("n", 0);
        for i in 1..5 {
            cell.set(i).await.unwrap();
        }
        cell.reset().await.unwrap();
        assert_eq!(cell.value(), Value::from(0));
    }

    #[tokio::test]
    async fn listeners_run_in_registration_order() {
        let cell = Cell::standalone("n", 0);
        let order = Arc::new(Mutex::new(Vec::new()));
        let subs: Vec<Subscription> = (0..3)
            .map(|i| {
                let order = Arc::clone(&order);
                cell.subscribe(
                    move |v| {
                        if v.as_i64() == Some(1) {
                            order.lock().unwrap().push(i);
                        }
                    },
                    |_| {},
                )
            })
            .collect();

        cell.set(1).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        drop(subs);
        assert_eq!(cell.listener_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_keeps_order_of_survivors() {
        let cell = Cell::standalone("n", 0);
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut subs: Vec<Option<Subscription>> = (0..4)
            .map(|i| {
                let order = Arc::clone(&order);
                Some(cell.subscribe(
                    move |v| {
                        if v.as_i64() == Some(1) {
                            order.lock().unwrap().push(i);
                        }
                    },
                    |_| {},
                ))
            })
            .collect();

        if let Some(sub) = subs[1].take() {
            sub.unsubscribe();
        }
        cell.set(1).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 2, 3]);
    }

    #[tokio::test]
    async fn setter_receives_value_and_loading_brackets_it() {
        let recorded = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&recorded);
        let setter = Setter::from_fn(move |_, value, _| {
            *sink.lock().unwrap() = Some(value.clone());
            Ok(None)
        });
        let cell = cell_with(Value::Null, Options::default(), None, Some(setter));

        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&states);
        let _sub = cell.subscribe(|_| {}, move |s| sink.lock().unwrap().push(s));

        cell.set("x").await.unwrap();
        assert_eq!(*recorded.lock().unwrap(), Some(Value::from("x")));
        assert_eq!(cell.value(), Value::from("x"));
        assert_eq!(
            *states.lock().unwrap(),
            vec![LoadingState::Idle, LoadingState::Loading, LoadingState::Idle]
        );
    }

    #[tokio::test]
    async fn set_with_setter_commits_setter_output() {
        let setter = Setter::from_fn(|_, value, _| {
            Ok(Some(Value::from(format!("{}!", value.as_str().unwrap_or("")))))
        });
        let options = Options {
            set_with_setter: true,
            ..Options::default()
        };
        let cell = cell_with(Value::Null, options, None, Some(setter));
        cell.set("hi").await.unwrap();
        assert_eq!(cell.value(), Value::from("hi!"));
    }

    #[tokio::test]
    async fn failing_setter_does_not_commit() {
        let setter = Setter::from_fn(|_, _, _| Err("backend down".into()));
        let cell = cell_with(Value::from(1), Options::default(), None, Some(setter));

        let err = cell.set(2).await.unwrap_err();
        assert!(matches!(err, CellError::Setter { .. }));
        assert_eq!(cell.value(), Value::from(1));
        assert_eq!(cell.loading(), LoadingState::Idle);
    }

    #[tokio::test]
    async fn disable_setter_skips_it() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let setter = Setter::from_fn(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        });
        let cell = cell_with(Value::Null, Options::default(), None, Some(setter));
        cell.set_with_options(1, SetOptions::without_setter())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cell.value(), Value::from(1));
    }

    #[tokio::test]
    async fn reset_uses_suspended_write_state() {
        let setter = Setter::from_fn(|_, _, _| Ok(None));
        let cell = cell_with(Value::from(0), Options::default(), None, Some(setter));
        cell.set(3).await.unwrap();

        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&states);
        cell.on(events::LOADING, move |args| sink.lock().unwrap().push(args[0].clone()));

        cell.reset().await.unwrap();
        assert_eq!(cell.value(), Value::from(0));
        assert_eq!(*states.lock().unwrap(), vec![Value::Null, Value::from(false)]);
    }

    #[tokio::test]
    async fn getter_commits_result_and_dispatches_events() {
        let getter = Getter::new(|_, _| async { Ok(Value::object([("name", "John")])) });
        let cell = cell_with(Value::Null, Options::default(), Some(getter), None);

        let log = Arc::new(Mutex::new(Vec::new()));
        for event in [events::GETTING, events::GETTED, events::SET] {
            let log = Arc::clone(&log);
            cell.on(event, move |_| log.lock().unwrap().push(event));
        }

        let fetched = cell.update().await.unwrap();
        assert_eq!(fetched, Value::object([("name", "John")]));
        assert_eq!(cell.value(), fetched);
        assert!(cell.is_getted());
        assert_eq!(cell.loading(), LoadingState::Idle);
        assert_eq!(
            *log.lock().unwrap(),
            vec![events::GETTING, events::GETTED, events::SET]
        );
    }

    #[tokio::test]
    async fn getter_receives_args() {
        let getter = Getter::from_fn(|cell, args| {
            Ok(Value::from(format!("{}:{}", cell.key(), args[0].as_i64().unwrap_or(0))))
        });
        let cell = cell_with(Value::Null, Options::default(), Some(getter), None);
        let fetched = cell.set_from_getter(vec![Value::from(7)]).await.unwrap();
        assert_eq!(fetched, Value::from("test:7"));
    }

    #[tokio::test]
    async fn falsy_getter_result_is_not_committed() {
        let getter = Getter::from_fn(|_, _| Ok(Value::from(0)));
        let cell = cell_with(Value::from(5), Options::default(), Some(getter), None);
        assert_eq!(cell.update().await.unwrap(), Value::from(0));
        assert_eq!(cell.value(), Value::from(5));
    }

    #[tokio::test]
    async fn getter_failure_propagates_and_clears_loading() {
        let getter = Getter::from_fn(|_, _| Err("nope".into()));
        let cell = cell_with(Value::Null, Options::default(), Some(getter), None);
        let err = cell.update().await.unwrap_err();
        assert!(matches!(err, CellError::Getter { .. }));
        assert_eq!(cell.loading(), LoadingState::Idle);
        assert!(!cell.is_getted());
    }

    #[tokio::test]
    async fn getter_skips_setter_by_default() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let setter = Setter::from_fn(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        });
        let getter = Getter::from_fn(|_, _| Ok(Value::from(1)));
        let cell = cell_with(Value::Null, Options::default(), Some(getter.clone()), Some(setter.clone()));
        cell.update().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let options = Options {
            disable_setter_on_getter: false,
            ..Options::default()
        };
        let cell = cell_with(Value::Null, options, Some(getter), Some(setter));
        cell.update().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disable_getter_on_loading_skips_reentry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let getter = Getter::from_fn(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::from(1))
        });
        let options = Options {
            loading: true,
            disable_getter_on_loading: true,
            ..Options::default()
        };
        let cell = cell_with(Value::from(9), options, Some(getter), None);
        assert_eq!(cell.update().await.unwrap(), Value::from(9));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn listen_fetches_unless_disabled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let getter = Getter::from_fn(move |_, _| {
            Ok(Value::from(counter.fetch_add(1, Ordering::SeqCst) as i64 + 1))
        });

        let cell = cell_with(Value::Null, Options::default(), Some(getter.clone()), None);
        let (seen, listener) = recorder();
        let sub = cell.listen(listener, |_| {}, None).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![Value::Null, Value::from(1)]);
        drop(sub);

        let options = Options {
            disable_auto_getter: true,
            ..Options::default()
        };
        let cell = cell_with(Value::Null, options, Some(getter), None);
        let _sub = cell.listen(|_| {}, |_| {}, None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_once_fetches_a_single_time() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let getter = Getter::from_fn(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::from("data"))
        });
        let options = Options {
            get_once: true,
            ..Options::default()
        };
        let cell = cell_with(Value::Null, options, Some(getter), None);

        let unmounted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&unmounted);
        cell.on(events::UNMOUNTED, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        cell.listen(|_| {}, |_| {}, None).await.unwrap().unsubscribe();
        cell.listen(|_| {}, |_| {}, None).await.unwrap().unsubscribe();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(unmounted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn listen_replaces_args() {
        let getter = Getter::from_fn(|_, args| Ok(args.first().cloned().unwrap_or_default()));
        let cell = cell_with(Value::Null, Options::default(), Some(getter), None);
        let _sub = cell
            .listen(|_| {}, |_| {}, Some(vec![Value::from("page-2")]))
            .await
            .unwrap();
        assert_eq!(cell.args(), vec![Value::from("page-2")]);
        assert_eq!(cell.value(), Value::from("page-2"));
    }

    #[tokio::test]
    async fn stale_writes_are_dropped_when_guarded() {
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release = Arc::new(Mutex::new(Some(release_rx)));
        let setter = Setter::new(move |_, value: Value, _| {
            let gate = if value.as_i64() == Some(1) {
                release.lock().unwrap().take()
            } else {
                None
            };
            async move {
                if let Some(gate) = gate {
                    let _ = gate.await;
                }
                Ok(None)
            }
        });
        let options = Options {
            drop_stale_writes: true,
            ..Options::default()
        };
        let cell = cell_with(Value::from(0), options, None, Some(setter));

        let slow = cell.clone();
        let first = tokio::spawn(async move { slow.set(1).await });
        tokio::task::yield_now().await;
        cell.set(2).await.unwrap();
        release_tx.send(()).unwrap();
        first.await.unwrap().unwrap();

        assert_eq!(cell.value(), Value::from(2));
    }

    #[tokio::test]
    async fn direct_commit_overtakes_pending_setter() {
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release = Arc::new(Mutex::new(Some(release_rx)));
        let setter = Setter::new(move |_, _, _| {
            let gate = release.lock().unwrap().take();
            async move {
                if let Some(gate) = gate {
                    let _ = gate.await;
                }
                Ok(None)
            }
        });
        let options = Options {
            drop_stale_writes: true,
            ..Options::default()
        };
        let cell = cell_with(Value::from(0), options, None, Some(setter));

        let slow = cell.clone();
        let first = tokio::spawn(async move { slow.set(1).await });
        tokio::task::yield_now().await;
        cell.set_with_options(2, SetOptions::without_setter())
            .await
            .unwrap();
        release_tx.send(()).unwrap();
        first.await.unwrap().unwrap();

        assert_eq!(cell.value(), Value::from(2));
        assert_eq!(cell.loading(), LoadingState::Idle);
    }

    #[tokio::test]
    async fn failed_fetch_does_not_use_up_get_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let getter = Getter::from_fn(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err("offline".into())
            } else {
                Ok(Value::from("data"))
            }
        });
        let options = Options {
            get_once: true,
            ..Options::default()
        };
        let cell = cell_with(Value::Null, options, Some(getter), None);

        assert!(cell.listen(|_| {}, |_| {}, None).await.is_err());
        assert!(!cell.is_getted());
        assert_eq!(cell.listener_count(), 0);

        let _sub = cell.listen(|_| {}, |_| {}, None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cell.value(), Value::from("data"));
    }

    #[tokio::test]
    async fn event_listeners_can_be_removed() {
        let cell = Cell::standalone("n", 0);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let id = cell.on("custom", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        cell.dispatch_event("custom", &[]);
        assert!(cell.off("custom", id));
        assert!(!cell.off("custom", id));
        cell.dispatch_event("custom", &[]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn listener_may_read_the_cell() {
        let cell = Cell::standalone("n", 0);
        let reader = cell.downgrade();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = cell.subscribe(
            move |_| {
                if let Some(cell) = reader.upgrade() {
                    sink.lock().unwrap().push(cell.value());
                }
            },
            |_| {},
        );
        cell.set(4).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![Value::from(0), Value::from(4)]);
    }
}
