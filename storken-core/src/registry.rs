use indexmap::IndexMap;
use serde_json::Value as Json;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace};

use crate::cell::{Cell, CellError, Getter, Setter};
use crate::hydrate::{self, HydrationError};
use crate::options::{KeyOptions, Options, OptionsFile};
use crate::plugin::PluginFactory;
use crate::value::Value;

/// Immutable construction-time configuration, shared by a registry and its
/// scopes.
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    pub initial_values: IndexMap<String, Value>,
    /// Initial value for keys absent from `initial_values`.
    pub default_value: Value,
    pub getters: HashMap<String, Getter>,
    pub setters: HashMap<String, Setter>,
    pub plugins: IndexMap<String, PluginFactory>,
    pub options: Options,
    pub key_options: IndexMap<String, KeyOptions>,
}

impl RegistryConfig {
    /// Global options with the per-key override for `key` applied.
    pub fn options_for(&self, key: &str) -> Options {
        match self.key_options.get(key) {
            Some(overrides) => self.options.merged(overrides),
            None => self.options.clone(),
        }
    }
}

/// Builder for [`Registry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    config: RegistryConfig,
}

impl RegistryBuilder {
    pub fn initial_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.initial_values.insert(key.into(), value.into());
        self
    }

    pub fn initial_values<I, K, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.config
            .initial_values
            .extend(values.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.config.default_value = value.into();
        self
    }

    pub fn getter(mut self, key: impl Into<String>, getter: Getter) -> Self {
        self.config.getters.insert(key.into(), getter);
        self
    }

    pub fn setter(mut self, key: impl Into<String>, setter: Setter) -> Self {
        self.config.setters.insert(key.into(), setter);
        self
    }

    /// Attaches a plugin to every cell under `name`.
    pub fn plugin(mut self, name: impl Into<String>, factory: PluginFactory) -> Self {
        self.config.plugins.insert(name.into(), factory);
        self
    }

    pub fn options(mut self, options: Options) -> Self {
        self.config.options = options;
        self
    }

    pub fn key_options(mut self, key: impl Into<String>, options: KeyOptions) -> Self {
        self.config.key_options.insert(key.into(), options);
        self
    }

    /// Loads global options and per-key overrides from TOML.
    pub fn config_toml(mut self, input: &str) -> Result<Self, toml::de::Error> {
        let file = OptionsFile::from_toml_str(input)?;
        self.config.options = file.options;
        self.config.key_options.extend(file.keys);
        Ok(self)
    }

    pub fn build(self) -> Registry {
        Registry::from_config(Arc::new(self.config))
    }
}

struct RegistryInner {
    config: Arc<RegistryConfig>,
    initial_values: RwLock<IndexMap<String, Value>>,
    bundles: RwLock<IndexMap<String, Cell>>,
}

/// Key-addressed collection of lazily created cells.
///
/// Responsibilities:
/// - Lazy creation: any operation on an unknown key creates its cell first
/// - Wiring: each cell gets its key's getter, setter, merged options and the
///   shared plugins
/// - Teardown: removing a cell disposes its plugin capabilities
///
/// `Registry` is a cheap handle; clones share the same cells. For per-request
/// isolation use [`scope`](Self::scope).
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Creates an empty registry with default options.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    fn from_config(config: Arc<RegistryConfig>) -> Self {
        Registry {
            inner: Arc::new(RegistryInner {
                initial_values: RwLock::new(config.initial_values.clone()),
                config,
                bundles: RwLock::new(IndexMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    fn bundles(&self) -> RwLockReadGuard<'_, IndexMap<String, Cell>> {
        self.inner
            .bundles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn bundles_mut(&self) -> RwLockWriteGuard<'_, IndexMap<String, Cell>> {
        self.inner
            .bundles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn initial_for(&self, key: &str) -> Value {
        let initial = self
            .inner
            .initial_values
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        initial
            .get(key)
            .cloned()
            .unwrap_or_else(|| self.inner.config.default_value.clone())
    }

    fn create(&self, key: &str, args: Vec<Value>) -> Cell {
        let config = &self.inner.config;
        let cell = Cell::new(
            key,
            self.initial_for(key),
            config.options_for(key),
            config.getters.get(key).cloned(),
            config.setters.get(key).cloned(),
            args,
        );
        cell.install_plugins(&config.plugins);
        cell
    }

    /// Returns the cell for `key`, creating it if absent.
    pub fn cell(&self, key: &str) -> Cell {
        if let Some(cell) = self.bundles().get(key) {
            return cell.clone();
        }
        self.insert_new(key, None)
    }

    /// Like [`cell`](Self::cell), but replaces the stored getter/setter
    /// arguments of an existing cell with `args`.
    pub fn cell_with_args(&self, key: &str, args: Vec<Value>) -> Cell {
        if let Some(cell) = self.bundles().get(key) {
            cell.set_args(args);
            return cell.clone();
        }
        self.insert_new(key, Some(args))
    }

    fn insert_new(&self, key: &str, args: Option<Vec<Value>>) -> Cell {
        // Plugins run user code, so the cell is built outside the lock.
        let created = self.create(key, args.clone().unwrap_or_default());
        let mut bundles = self.bundles_mut();
        if let Some(existing) = bundles.get(key) {
            let existing = existing.clone();
            drop(bundles);
            created.dispose_plugins();
            if let Some(args) = args {
                existing.set_args(args);
            }
            return existing;
        }
        bundles.insert(key.to_string(), created.clone());
        drop(bundles);
        debug!(%key, "created cell");
        created
    }

    /// Returns the committed value of `key`.
    pub fn get(&self, key: &str) -> Value {
        self.cell(key).value()
    }

    pub fn get_with_args(&self, key: &str, args: Vec<Value>) -> Value {
        self.cell_with_args(key, args).value()
    }

    pub async fn set(&self, key: &str, value: impl Into<Value>) -> Result<(), CellError> {
        self.cell(key).set(value).await
    }

    pub async fn set_with_args(
        &self,
        key: &str,
        value: impl Into<Value>,
        args: Vec<Value>,
    ) -> Result<(), CellError> {
        self.cell_with_args(key, args).set(value).await
    }

    /// Removes `key`, optionally resetting it to its initial value first.
    ///
    /// The cell is removed and its plugins disposed even when the reset
    /// fails; the reset error is then returned. Returns `Ok(false)` when
    /// the key had no cell.
    pub async fn remove(&self, key: &str, reset_first: bool) -> Result<bool, CellError> {
        let Some(cell) = self.bundles().get(key).cloned() else {
            return Ok(false);
        };
        let reset = if reset_first {
            cell.reset().await
        } else {
            Ok(())
        };
        self.detach(key, &cell);
        reset.map(|()| true)
    }

    pub async fn multi_remove<I, K>(&self, keys: I, reset_first: bool) -> Result<(), CellError>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        for key in keys {
            self.remove(key.as_ref(), reset_first).await?;
        }
        Ok(())
    }

    /// Commits a terminal value, then removes the key without resetting it.
    pub async fn destroy(&self, key: &str, value: impl Into<Value>) -> Result<(), CellError> {
        let cell = self.cell(key);
        let outcome = cell.set(value).await;
        self.detach(key, &cell);
        outcome
    }

    pub async fn multi_destroy<I, K, V>(&self, entries: I) -> Result<(), CellError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        for (key, value) in entries {
            self.destroy(key.as_ref(), value).await?;
        }
        Ok(())
    }

    fn detach(&self, key: &str, cell: &Cell) {
        let removed = {
            let mut bundles = self.bundles_mut();
            match bundles.get(key) {
                Some(current) if current.ptr_eq(cell) => bundles.shift_remove(key),
                _ => None,
            }
        };
        if let Some(removed) = removed {
            removed.dispose_plugins();
            debug!(%key, "removed cell");
        }
    }

    /// Seeds initial values and eagerly creates each cell.
    ///
    /// Cells that already exist are left untouched.
    pub fn restore<I, K, V>(&self, values: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let values: Vec<(String, Value)> = values
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        {
            let mut initial = self
                .inner
                .initial_values
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for (key, value) in &values {
                initial.insert(key.clone(), value.clone());
            }
        }
        for (key, _) in &values {
            self.cell(key);
        }
        trace!(keys = values.len(), "restored initial values");
    }

    /// Decodes a dehydrated envelope and [`restore`](Self::restore)s it.
    pub fn hydrate(&self, envelope: &Json) -> Result<(), HydrationError> {
        let values = hydrate::hydrate(envelope)?;
        self.restore(values);
        Ok(())
    }

    /// Shallow snapshot of the live cells.
    pub fn dump(&self) -> IndexMap<String, Cell> {
        self.bundles().clone()
    }

    /// Snapshot of every live cell's committed value.
    pub fn values(&self) -> IndexMap<String, Value> {
        self.bundles()
            .iter()
            .map(|(key, cell)| (key.clone(), cell.value()))
            .collect()
    }

    /// Capability of plugin `name` on `key`, if present and of type `T`.
    pub fn get_plugin<T: Any + Send + Sync>(&self, key: &str, name: &str) -> Option<Arc<T>> {
        self.cell(key).plugin::<T>(name)
    }

    pub fn keys(&self) -> Vec<String> {
        self.bundles().keys().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.bundles().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.bundles().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles().is_empty()
    }

    /// A fresh registry sharing this one's configuration but none of its
    /// cells. Call [`dispose`](Self::dispose) when the scope ends.
    pub fn scope(&self) -> Registry {
        Registry::from_config(Arc::clone(&self.inner.config))
    }

    /// Drops every cell and disposes all plugin capabilities.
    pub fn dispose(&self) {
        let cells: Vec<(String, Cell)> = self.bundles_mut().drain(..).collect();
        for (key, cell) in &cells {
            trace!(%key, "disposing cell");
            cell.dispose_plugins();
        }
        debug!(cells = cells.len(), "disposed registry");
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("keys", &self.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::events;
    use crate::plugin::Capability;
    use crate::plugins::History;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Tracker {
        key: String,
        label: Value,
        disposed: Arc<AtomicUsize>,
    }

    impl Capability for Tracker {
        fn dispose(&self) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tracker_factory(disposed: Arc<AtomicUsize>) -> PluginFactory {
        PluginFactory::with_config(
            move |cell: &Cell, config: &[Value]| Tracker {
                key: cell.key().to_string(),
                label: config.first().cloned().unwrap_or_default(),
                disposed: Arc::clone(&disposed),
            },
            vec![Value::from("tracker")],
        )
    }

    #[tokio::test]
    async fn counter_scenario() {
        let registry = Registry::builder().initial_value("counter", 0).build();
        assert_eq!(registry.get("counter"), Value::from(0));
        registry.set("counter", 5).await.unwrap();
        assert_eq!(registry.get("counter"), Value::from(5));
        registry.cell("counter").reset().await.unwrap();
        assert_eq!(registry.get("counter"), Value::from(0));
    }

    #[test]
    fn unknown_keys_are_created_with_default_value() {
        let registry = Registry::builder().default_value("none").build();
        assert!(!registry.contains("anything"));
        assert_eq!(registry.get("anything"), Value::from("none"));
        assert!(registry.contains("anything"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn same_key_yields_same_cell() {
        let registry = Registry::new();
        assert!(registry.cell("a").ptr_eq(&registry.cell("a")));
        assert!(!registry.cell("a").ptr_eq(&registry.cell("b")));
        assert_eq!(registry.keys(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn args_are_overwritten_on_existing_cell() {
        let registry = Registry::new();
        let cell = registry.cell_with_args("page", vec![Value::from(1)]);
        assert_eq!(cell.args(), vec![Value::from(1)]);
        registry.get_with_args("page", vec![Value::from(2)]);
        assert_eq!(cell.args(), vec![Value::from(2)]);
    }

    #[tokio::test]
    async fn getters_setters_and_options_are_wired_per_key() {
        let recorded = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&recorded);
        let registry = Registry::builder()
            .getter("user", Getter::from_fn(|_, _| Ok(Value::object([("name", "John")]))))
            .setter(
                "tracked",
                Setter::from_fn(move |_, value, _| {
                    *sink.lock().unwrap() = Some(value.clone());
                    Ok(None)
                }),
            )
            .key_options(
                "user",
                KeyOptions {
                    get_once: Some(true),
                    ..KeyOptions::default()
                },
            )
            .build();

        let user = registry.cell("user");
        assert!(user.options().get_once);
        assert!(!registry.cell("tracked").options().get_once);
        assert_eq!(
            user.set_from_getter(Vec::new()).await.unwrap(),
            Value::object([("name", "John")])
        );

        registry.set("tracked", "x").await.unwrap();
        assert_eq!(*recorded.lock().unwrap(), Some(Value::from("x")));
    }

    #[test]
    fn options_from_toml() {
        let registry = Registry::builder()
            .config_toml(
                r#"
                [options]
                disable_auto_getter = true

                [keys.feed]
                disable_auto_getter = false
                "#,
            )
            .unwrap()
            .build();
        assert!(registry.cell("other").options().disable_auto_getter);
        assert!(!registry.cell("feed").options().disable_auto_getter);
    }

    #[tokio::test]
    async fn remove_resets_then_disposes_plugins() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let registry = Registry::builder()
            .initial_value("n", 0)
            .plugin("tracker", tracker_factory(Arc::clone(&disposed)))
            .build();

        let cell = registry.cell("n");
        let resets = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&resets);
        cell.on(events::SET, move |args| sink.lock().unwrap().push(args[0].clone()));
        registry.set("n", 3).await.unwrap();

        assert!(registry.remove("n", true).await.unwrap());
        assert_eq!(*resets.lock().unwrap(), vec![Value::from(3), Value::from(0)]);
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert!(!registry.contains("n"));
        assert!(!registry.remove("n", true).await.unwrap());
    }

    #[tokio::test]
    async fn destroy_sets_terminal_value_without_reset() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let registry = Registry::builder()
            .initial_value("session", "active")
            .plugin("tracker", tracker_factory(Arc::clone(&disposed)))
            .build();
        let cell = registry.cell("session");

        registry.destroy("session", "closed").await.unwrap();
        assert_eq!(cell.value(), Value::from("closed"));
        assert!(!registry.contains("session"));
        assert_eq!(disposed.load(Ordering::SeqCst), 1);

        registry
            .multi_destroy([("a", Value::from(1)), ("b", Value::from(2))])
            .await
            .unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn multi_remove_sequences_keys() {
        let registry = Registry::new();
        registry.cell("a");
        registry.cell("b");
        registry.cell("c");
        registry.multi_remove(["a", "c"], false).await.unwrap();
        assert_eq!(registry.keys(), vec!["b".to_string()]);
    }

    #[test]
    fn plugins_receive_cell_and_config() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let registry = Registry::builder()
            .plugin("tracker", tracker_factory(Arc::clone(&disposed)))
            .build();

        let tracker = registry.get_plugin::<Tracker>("x", "tracker").unwrap();
        assert_eq!(tracker.key, "x");
        assert_eq!(tracker.label, Value::from("tracker"));
        assert!(registry.get_plugin::<Tracker>("x", "missing").is_none());
        assert!(registry.get_plugin::<History>("x", "tracker").is_none());
    }

    #[tokio::test]
    async fn history_plugin_through_registry() {
        let registry = Registry::builder()
            .initial_value("draft", "")
            .plugin("history", History::factory(5))
            .build();
        registry.set("draft", "hello").await.unwrap();
        registry.set("draft", "hello world").await.unwrap();

        let history = registry.get_plugin::<History>("draft", "history").unwrap();
        assert!(history.undo().await.unwrap());
        assert_eq!(registry.get("draft"), Value::from("hello"));
    }

    #[test]
    fn restore_seeds_cells_eagerly() {
        let registry = Registry::builder().initial_value("n", 0).build();
        registry.restore([("n", Value::from(7)), ("user", Value::from("Ann"))]);
        assert!(registry.contains("user"));
        assert_eq!(registry.get("n"), Value::from(7));
        assert_eq!(registry.get("user"), Value::from("Ann"));
    }

    #[tokio::test]
    async fn restored_value_becomes_reset_target() {
        let registry = Registry::builder().initial_value("n", 0).build();
        registry.restore([("n", 7)]);
        registry.set("n", 9).await.unwrap();
        registry.cell("n").reset().await.unwrap();
        assert_eq!(registry.get("n"), Value::from(7));
    }

    #[tokio::test]
    async fn scope_shares_config_not_cells() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let registry = Registry::builder()
            .initial_value("n", 1)
            .plugin("tracker", tracker_factory(Arc::clone(&disposed)))
            .build();
        registry.set("n", 2).await.unwrap();

        let scope = registry.scope();
        assert_eq!(scope.get("n"), Value::from(1));
        scope.set("n", 3).await.unwrap();
        assert_eq!(registry.get("n"), Value::from(2));

        scope.dispose();
        assert!(scope.is_empty());
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn values_snapshot() {
        let registry = Registry::builder()
            .initial_values([("a", 1), ("b", 2)])
            .build();
        registry.cell("b");
        registry.cell("a");
        let values = registry.values();
        assert_eq!(values.keys().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(values["a"], Value::from(1));
        assert_eq!(registry.dump().len(), 2);
    }
}
