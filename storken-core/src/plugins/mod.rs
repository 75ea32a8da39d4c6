//! Built-in plugins.

pub mod history;

pub use history::History;
