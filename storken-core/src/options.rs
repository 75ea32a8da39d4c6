use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Behavior switches for a cell.
///
/// A registry carries one global `Options`; individual keys may override any
/// subset of it through [`KeyOptions`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Start cells in the loading state.
    pub loading: bool,
    /// Do not run the getter when a listener mounts.
    pub disable_auto_getter: bool,
    /// Skip getter calls while one is already in flight.
    pub disable_getter_on_loading: bool,
    /// Getter results are committed without invoking the setter.
    pub disable_setter_on_getter: bool,
    /// Fetch at most once per cell lifetime.
    pub get_once: bool,
    /// Label attached to the cell's tracing spans.
    pub namespace: Option<String>,
    /// Commit the setter's return value instead of the requested one.
    pub set_with_setter: bool,
    /// Discard setter completions that were overtaken by a later write.
    pub drop_stale_writes: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            loading: false,
            disable_auto_getter: false,
            disable_getter_on_loading: false,
            disable_setter_on_getter: true,
            get_once: false,
            namespace: None,
            set_with_setter: false,
            drop_stale_writes: false,
        }
    }
}

impl Options {
    pub fn from_toml_str(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    /// Returns these options with every field set in `overrides` replaced.
    pub fn merged(&self, overrides: &KeyOptions) -> Options {
        Options {
            loading: overrides.loading.unwrap_or(self.loading),
            disable_auto_getter: overrides
                .disable_auto_getter
                .unwrap_or(self.disable_auto_getter),
            disable_getter_on_loading: overrides
                .disable_getter_on_loading
                .unwrap_or(self.disable_getter_on_loading),
            disable_setter_on_getter: overrides
                .disable_setter_on_getter
                .unwrap_or(self.disable_setter_on_getter),
            get_once: overrides.get_once.unwrap_or(self.get_once),
            namespace: overrides
                .namespace
                .clone()
                .or_else(|| self.namespace.clone()),
            set_with_setter: overrides.set_with_setter.unwrap_or(self.set_with_setter),
            drop_stale_writes: overrides
                .drop_stale_writes
                .unwrap_or(self.drop_stale_writes),
        }
    }
}

/// Per-key partial override of [`Options`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyOptions {
    pub loading: Option<bool>,
    pub disable_auto_getter: Option<bool>,
    pub disable_getter_on_loading: Option<bool>,
    pub disable_setter_on_getter: Option<bool>,
    pub get_once: Option<bool>,
    pub namespace: Option<String>,
    pub set_with_setter: Option<bool>,
    pub drop_stale_writes: Option<bool>,
}

/// On-disk configuration: global options plus per-key overrides.
///
/// ```toml
/// [options]
/// disable_getter_on_loading = true
///
/// [keys.user]
/// get_once = true
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionsFile {
    pub options: Options,
    pub keys: IndexMap<String, KeyOptions>,
}

impl OptionsFile {
    pub fn from_toml_str(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }
}
