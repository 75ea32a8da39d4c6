//! Storken is a reactive state-sync engine.
//!
//! Core concepts:
//! - **Cell**: one piece of reactive state with listeners, an event bus, and
//!   optional getter/setter hooks to a remote source
//! - **Registry**: creates cells lazily by key and wires their hooks, options
//!   and plugins
//! - **Plugin**: a factory attaching a capability object to every cell
//! - **Codec**: turns non-primitive values (dates, maps, big integers, ...)
//!   into transportable `{"tag", "value"}` wrappers and back
//! - **Hydration**: ships committed values from one process to another in a
//!   versioned envelope
//! - **Cache adapters** and the **batch loader**: cut down the remote calls
//!   getters make
//!
//! # Example
//!
//! ```
//! use storken_core::{Registry, Value};
//!
//! let registry = Registry::builder().initial_value("counter", 0).build();
//! assert_eq!(registry.get("counter"), Value::from(0));
//!
//! futures::executor::block_on(async {
//!     registry.set("counter", 5).await.unwrap();
//!     assert_eq!(registry.get("counter"), Value::from(5));
//!
//!     registry.cell("counter").reset().await.unwrap();
//!     assert_eq!(registry.get("counter"), Value::from(0));
//! });
//! ```
//!
//! Listener callbacks run synchronously after each commit, in registration
//! order. Getters and setters are the only suspension points.

mod async_kv;
mod batch;
pub mod cache;
mod cell;
pub mod codec;
pub mod hydrate;
mod kv;
mod options;
mod plugin;
pub mod plugins;
mod registry;
mod value;

pub use async_kv::AsyncKv;
pub use batch::{BatchLoader, LoaderError, LoaderOptions, Schedule};
pub use cache::{cached_getter, CacheAdapter};
pub use cell::{
    events, BoxError, Cell, CellError, Getter, ListenerId, LoadingState, SetOptions, Setter,
    Subscription, WeakCell,
};
pub use codec::{CodecError, CodecRegistry, TypeCodec};
pub use hydrate::{dehydrate, hydrate, DehydrateOptions, Envelope, HydrationError};
pub use kv::{KvStore, MemoryKv};
pub use options::{KeyOptions, Options, OptionsFile};
pub use plugin::{AsAny, Capability, PluginFactory};
pub use registry::{Registry, RegistryBuilder, RegistryConfig};
pub use value::{CustomValue, Pattern, Value};
