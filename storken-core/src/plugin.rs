use std::any::Any;
use std::sync::Arc;

use crate::cell::Cell;
use crate::value::Value;

/// Upcast helper so capabilities can be downcast to their concrete type.
pub trait AsAny {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// The object a plugin factory attaches to a cell.
///
/// Capabilities that own resources (timers, event listeners, buffers) release
/// them in `dispose`. The registry calls it exactly once when the cell is
/// removed, destroyed or the registry itself is disposed.
pub trait Capability: AsAny + Send + Sync {
    fn dispose(&self) {}
}

type FactoryFn = dyn Fn(&Cell, &[Value]) -> Arc<dyn Capability> + Send + Sync;

/// Builds one capability per cell.
///
/// The factory receives the freshly created cell and the static config given
/// at registration. Factories that keep the cell around should hold a
/// [`WeakCell`](crate::WeakCell) so the capability does not keep it alive.
#[derive(Clone)]
pub struct PluginFactory {
    factory: Arc<FactoryFn>,
    config: Vec<Value>,
}

impl PluginFactory {
    pub fn new<F, C>(factory: F) -> Self
    where
        F: Fn(&Cell, &[Value]) -> C + Send + Sync + 'static,
        C: Capability + 'static,
    {
        Self::with_config(factory, Vec::new())
    }

    pub fn with_config<F, C>(factory: F, config: Vec<Value>) -> Self
    where
        F: Fn(&Cell, &[Value]) -> C + Send + Sync + 'static,
        C: Capability + 'static,
    {
        PluginFactory {
            factory: Arc::new(move |cell: &Cell, config: &[Value]| {
                Arc::new(factory(cell, config)) as Arc<dyn Capability>
            }),
            config,
        }
    }

    pub fn config(&self) -> &[Value] {
        &self.config
    }

    pub(crate) fn instantiate(&self, cell: &Cell) -> Arc<dyn Capability> {
        (self.factory)(cell, &self.config)
    }
}

impl std::fmt::Debug for PluginFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginFactory")
            .field("config", &self.config)
            .finish()
    }
}

pub(crate) fn downcast<T: Any + Send + Sync>(capability: &Arc<dyn Capability>) -> Option<Arc<T>> {
    AsAny::into_any(Arc::clone(capability))
        .downcast::<T>()
        .ok()
}
