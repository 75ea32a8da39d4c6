//! Server-to-client state transfer.
//!
//! [`dehydrate`] snapshots committed cell values into an [`Envelope`];
//! [`hydrate`] turns an envelope back into a key/value map that
//! [`Registry::restore`](crate::Registry::restore) can seed cells from.
//!
//! # Wire format
//!
//! ```json
//! { "marker": true, "version": "1", "timestamp": 1700000000000,
//!   "data": { "user": { "name": "John" },
//!             "seen": { "tag": "Date", "value": "2024-01-02T03:04:05Z" } } }
//! ```

use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::codec::{self, CodecError, CodecRegistry};
use crate::registry::Registry;
use crate::value::Value;

/// Envelope format version written by this crate.
pub const ENVELOPE_VERSION: &str = "1";

/// Error type for hydration and dehydration.
#[derive(Debug, thiserror::Error)]
pub enum HydrationError {
    #[error("payload is not a state envelope: {0}")]
    UnknownEnvelope(String),
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CBOR encode error: {0}")]
    CborEncode(String),
    #[error("CBOR decode error: {0}")]
    CborDecode(String),
    #[error("codec error for `{key}`: {source}")]
    Codec {
        key: String,
        #[source]
        source: CodecError,
    },
}

/// A versioned, timestamped snapshot of codec-encoded cell values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub marker: bool,
    pub version: String,
    /// Milliseconds since the Unix epoch at dehydration time.
    pub timestamp: i64,
    pub data: IndexMap<String, Json>,
}

impl Envelope {
    pub fn new(data: IndexMap<String, Json>) -> Self {
        Envelope {
            marker: true,
            version: ENVELOPE_VERSION.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            data,
        }
    }

    pub fn to_json(&self) -> Result<String, HydrationError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_value(&self) -> Result<Json, HydrationError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Parses an envelope, failing fast when the marker is missing.
    pub fn from_json(input: &str) -> Result<Self, HydrationError> {
        let json: Json = serde_json::from_str(input)?;
        Self::from_json_value(&json)
    }

    pub fn from_json_value(json: &Json) -> Result<Self, HydrationError> {
        validate_marker(json)?;
        Ok(Envelope::deserialize(json)?)
    }

    /// Binary form of the envelope, for transports that prefer CBOR.
    pub fn to_cbor(&self) -> Result<Vec<u8>, HydrationError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| HydrationError::CborEncode(e.to_string()))?;
        Ok(buf)
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self, HydrationError> {
        let json: Json = ciborium::from_reader(bytes)
            .map_err(|e| HydrationError::CborDecode(e.to_string()))?;
        Self::from_json_value(&json)
    }
}

type TransformFn = dyn Fn(&Value) -> Value + Send + Sync;

/// Key filtering and per-key transforms applied while dehydrating.
#[derive(Clone, Default)]
pub struct DehydrateOptions {
    include: Option<HashSet<String>>,
    exclude: HashSet<String>,
    transforms: HashMap<String, Arc<TransformFn>>,
}

impl DehydrateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the snapshot to the given keys.
    pub fn include<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.include
            .get_or_insert_with(HashSet::new)
            .extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn exclude<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.exclude.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Rewrites one key's value before it is encoded, e.g. to strip secrets.
    pub fn transform<F>(mut self, key: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.transforms.insert(key.into(), Arc::new(f));
        self
    }

    fn admits(&self, key: &str) -> bool {
        if self.exclude.contains(key) {
            return false;
        }
        self.include.as_ref().is_none_or(|keys| keys.contains(key))
    }
}

/// Snapshots every committed value of `registry` into an envelope.
pub fn dehydrate(registry: &Registry, options: &DehydrateOptions) -> Result<Envelope, HydrationError> {
    dehydrate_values(registry.values(), options)
}

/// Like [`dehydrate`], for an arbitrary key/value map.
pub fn dehydrate_values<I>(values: I, options: &DehydrateOptions) -> Result<Envelope, HydrationError>
where
    I: IntoIterator<Item = (String, Value)>,
{
    dehydrate_with(&codec::global(), values, options)
}

pub fn dehydrate_with<I>(
    codecs: &CodecRegistry,
    values: I,
    options: &DehydrateOptions,
) -> Result<Envelope, HydrationError>
where
    I: IntoIterator<Item = (String, Value)>,
{
    let mut data = IndexMap::new();
    for (key, value) in values {
        if !options.admits(&key) {
            continue;
        }
        let value = match options.transforms.get(&key) {
            Some(transform) => transform(&value),
            None => value,
        };
        match codecs.encode(&value) {
            Ok(Some(json)) => {
                data.insert(key, json);
            }
            Ok(None) => trace!(%key, "skipping non-transportable value"),
            Err(source) => return Err(HydrationError::Codec { key, source }),
        }
    }
    debug!(keys = data.len(), "dehydrated state");
    Ok(Envelope::new(data))
}

/// Reconstructs cell values from a JSON envelope.
pub fn hydrate(json: &Json) -> Result<IndexMap<String, Value>, HydrationError> {
    hydrate_envelope(Envelope::from_json_value(json)?)
}

pub fn hydrate_envelope(envelope: Envelope) -> Result<IndexMap<String, Value>, HydrationError> {
    hydrate_with(&codec::global(), envelope)
}

pub fn hydrate_with(
    codecs: &CodecRegistry,
    envelope: Envelope,
) -> Result<IndexMap<String, Value>, HydrationError> {
    if !envelope.marker {
        return Err(HydrationError::UnknownEnvelope("marker is not set".into()));
    }
    if envelope.version != ENVELOPE_VERSION {
        debug!(version = %envelope.version, "hydrating envelope from another version");
    }
    let mut out = IndexMap::with_capacity(envelope.data.len());
    for (key, json) in envelope.data {
        match codecs.decode(json) {
            Ok(value) => {
                out.insert(key, value);
            }
            Err(source) => return Err(HydrationError::Codec { key, source }),
        }
    }
    Ok(out)
}

fn validate_marker(json: &Json) -> Result<(), HydrationError> {
    let Some(object) = json.as_object() else {
        return Err(HydrationError::UnknownEnvelope(
            "expected a JSON object".into(),
        ));
    };
    match object.get("marker") {
        Some(Json::Bool(true)) => Ok(()),
        Some(_) => Err(HydrationError::UnknownEnvelope(
            "`marker` must be true".into(),
        )),
        None => Err(HydrationError::UnknownEnvelope("missing `marker`".into())),
    }
}
