//! Type codecs: how non-primitive values cross a process boundary.
//!
//! A [`TypeCodec`] pairs a type check with a serialize/deserialize function
//! under a string tag. Encoding walks a [`Value`] and replaces every value a
//! codec claims with a `{"tag": .., "value": ..}` wrapper; decoding reverses
//! it. Arrays and objects are walked recursively, and codec payloads are
//! themselves encoded, so a `Map` keyed by dates round-trips.
//!
//! The process-wide registry ([`global`], [`register`]) starts with codecs for
//! `Date`, `Map`, `Set`, `BigInt`, `URL` and `RegExp`, and only ever grows.

use chrono::{DateTime, SecondsFormat, Utc};
use num_bigint::BigInt;
use serde_json::Value as Json;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};
use tracing::trace;
use url::Url;

use crate::value::{number_to_value, Pattern, Value};

/// Wrapper field carrying the codec tag.
pub const TAG_KEY: &str = "tag";
/// Wrapper field carrying the encoded payload.
pub const VALUE_KEY: &str = "value";
/// Reserved tag for plain objects that would otherwise read as a wrapper.
/// A codec registered under this tag is never used for decoding.
pub const OBJECT_TAG: &str = "Object";

/// Error type for codec operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("codec `{tag}` cannot serialize a {found} value")]
    Unsupported { tag: String, found: &'static str },
    #[error("invalid `{tag}` payload: {reason}")]
    InvalidPayload { tag: String, reason: String },
}

impl CodecError {
    pub fn invalid(tag: &str, reason: impl Into<String>) -> Self {
        CodecError::InvalidPayload {
            tag: tag.to_string(),
            reason: reason.into(),
        }
    }

    pub fn unsupported(tag: &str, value: &Value) -> Self {
        CodecError::Unsupported {
            tag: tag.to_string(),
            found: value.kind(),
        }
    }
}

type CheckFn = dyn Fn(&Value) -> bool + Send + Sync;
type TransformFn = dyn Fn(Value) -> Result<Value, CodecError> + Send + Sync;
type SerializeFn = dyn Fn(&Value) -> Result<Value, CodecError> + Send + Sync;

/// A (check, serialize, deserialize) triplet registered under a tag.
///
/// `serialize` returns a plain payload which is then encoded recursively;
/// `deserialize` receives the payload after it has been decoded.
#[derive(Clone)]
pub struct TypeCodec {
    tag: String,
    check: Arc<CheckFn>,
    serialize: Arc<SerializeFn>,
    deserialize: Arc<TransformFn>,
}

impl TypeCodec {
    pub fn new<C, S, D>(tag: impl Into<String>, check: C, serialize: S, deserialize: D) -> Self
    where
        C: Fn(&Value) -> bool + Send + Sync + 'static,
        S: Fn(&Value) -> Result<Value, CodecError> + Send + Sync + 'static,
        D: Fn(Value) -> Result<Value, CodecError> + Send + Sync + 'static,
    {
        TypeCodec {
            tag: tag.into(),
            check: Arc::new(check),
            serialize: Arc::new(serialize),
            deserialize: Arc::new(deserialize),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn handles(&self, value: &Value) -> bool {
        (self.check)(value)
    }
}

impl std::fmt::Debug for TypeCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeCodec").field("tag", &self.tag).finish()
    }
}

/// An ordered set of codecs. The first codec whose check accepts a value wins.
#[derive(Clone, Debug, Default)]
pub struct CodecRegistry {
    codecs: Vec<TypeCodec>,
}

impl CodecRegistry {
    /// Creates a registry with no codecs at all.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in codecs.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for codec in default_codecs() {
            registry.register(codec);
        }
        registry
    }

    /// Adds a codec. A codec with an already registered tag replaces the old
    /// one in place, keeping its precedence.
    pub fn register(&mut self, codec: TypeCodec) {
        match self.codecs.iter_mut().find(|c| c.tag == codec.tag) {
            Some(slot) => *slot = codec,
            None => self.codecs.push(codec),
        }
    }

    pub fn by_tag(&self, tag: &str) -> Option<&TypeCodec> {
        self.codecs.iter().find(|c| c.tag == tag)
    }

    pub fn find(&self, value: &Value) -> Option<&TypeCodec> {
        self.codecs.iter().find(|c| c.handles(value))
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.codecs.iter().map(|c| c.tag.as_str())
    }

    /// Encodes a value for transport.
    ///
    /// Returns `Ok(None)` for values that cannot be transported (a custom
    /// value with no matching codec). Such values are dropped from objects
    /// and become `null` inside arrays.
    pub fn encode(&self, value: &Value) -> Result<Option<Json>, CodecError> {
        if let Some(codec) = self.find(value) {
            let payload = (codec.serialize)(value)?;
            let inner = self.encode(&payload)?.unwrap_or(Json::Null);
            let mut wrapper = serde_json::Map::with_capacity(2);
            wrapper.insert(TAG_KEY.to_string(), Json::String(codec.tag.clone()));
            wrapper.insert(VALUE_KEY.to_string(), inner);
            return Ok(Some(Json::Object(wrapper)));
        }

        let json = match value {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f).map_or(Json::Null, Json::Number),
            Value::String(s) => Json::String(s.clone()),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.encode(item)?.unwrap_or(Json::Null));
                }
                Json::Array(out)
            }
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    match self.encode(v)? {
                        Some(json) => {
                            out.insert(k.clone(), json);
                        }
                        None => trace!(field = %k, "dropping non-transportable field"),
                    }
                }
                if is_wrapper_shaped(&out) {
                    let mut escaped = serde_json::Map::with_capacity(2);
                    escaped.insert(TAG_KEY.to_string(), Json::String(OBJECT_TAG.to_string()));
                    escaped.insert(VALUE_KEY.to_string(), Json::Object(out));
                    return Ok(Some(Json::Object(escaped)));
                }
                Json::Object(out)
            }
            other => {
                trace!(kind = other.kind(), "no codec for value, dropping");
                return Ok(None);
            }
        };
        Ok(Some(json))
    }

    /// Decodes a transported value, reconstructing codec-wrapped values.
    ///
    /// Wrappers with an unknown tag are left as plain objects.
    pub fn decode(&self, json: Json) -> Result<Value, CodecError> {
        match json {
            Json::Object(mut map) => {
                if is_escaped_object(&map) {
                    return match map.remove(VALUE_KEY) {
                        Some(Json::Object(fields)) => self.decode_fields(fields),
                        _ => Err(CodecError::invalid(OBJECT_TAG, "payload is not an object")),
                    };
                }
                if let Some(codec) = self.wrapper_codec(&map) {
                    let payload = map.remove(VALUE_KEY).unwrap_or(Json::Null);
                    let decoded = self.decode(payload)?;
                    return (codec.deserialize)(decoded);
                }
                self.decode_fields(map)
            }
            Json::Array(items) => items
                .into_iter()
                .map(|item| self.decode(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Json::Number(n) => Ok(number_to_value(&n)),
            Json::String(s) => Ok(Value::String(s)),
            Json::Bool(b) => Ok(Value::Bool(b)),
            Json::Null => Ok(Value::Null),
        }
    }

    /// Encodes straight to a JSON string.
    pub fn to_json_string(&self, value: &Value) -> Result<String, CodecError> {
        let json = self.encode(value)?.unwrap_or(Json::Null);
        Ok(json.to_string())
    }

    fn decode_fields(&self, map: serde_json::Map<String, Json>) -> Result<Value, CodecError> {
        let mut out = indexmap::IndexMap::with_capacity(map.len());
        for (k, v) in map {
            out.insert(k, self.decode(v)?);
        }
        Ok(Value::Object(out))
    }

    fn wrapper_codec(&self, map: &serde_json::Map<String, Json>) -> Option<TypeCodec> {
        if !is_wrapper_shaped(map) {
            return None;
        }
        match map.get(TAG_KEY) {
            Some(Json::String(tag)) => self.by_tag(tag).cloned(),
            _ => None,
        }
    }
}

/// Exactly a string `tag` plus a `value`, whether or not the tag is known.
fn is_wrapper_shaped(map: &serde_json::Map<String, Json>) -> bool {
    map.len() == 2 && map.contains_key(VALUE_KEY) && matches!(map.get(TAG_KEY), Some(Json::String(_)))
}

fn is_escaped_object(map: &serde_json::Map<String, Json>) -> bool {
    is_wrapper_shaped(map) && matches!(map.get(TAG_KEY), Some(Json::String(tag)) if tag == OBJECT_TAG)
}

static GLOBAL: LazyLock<RwLock<CodecRegistry>> =
    LazyLock::new(|| RwLock::new(CodecRegistry::with_defaults()));

/// Registers a codec in the process-wide registry.
pub fn register(codec: TypeCodec) {
    GLOBAL
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .register(codec);
}

/// Returns a snapshot of the process-wide registry.
pub fn global() -> CodecRegistry {
    GLOBAL
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

fn default_codecs() -> Vec<TypeCodec> {
    vec![
        TypeCodec::new(
            "Date",
            |v| matches!(v, Value::Date(_)),
            |v| match v {
                Value::Date(d) => Ok(Value::String(d.to_rfc3339_opts(SecondsFormat::AutoSi, true))),
                other => Err(CodecError::unsupported("Date", other)),
            },
            |payload| {
                let s = expect_str("Date", &payload)?;
                DateTime::parse_from_rfc3339(s)
                    .map(|d| Value::Date(d.with_timezone(&Utc)))
                    .map_err(|e| CodecError::invalid("Date", e.to_string()))
            },
        ),
        TypeCodec::new(
            "Map",
            |v| matches!(v, Value::Map(_)),
            |v| match v {
                Value::Map(entries) => Ok(Value::Array(
                    entries
                        .iter()
                        .map(|(k, v)| Value::Array(vec![k.clone(), v.clone()]))
                        .collect(),
                )),
                other => Err(CodecError::unsupported("Map", other)),
            },
            |payload| {
                let Value::Array(entries) = payload else {
                    return Err(CodecError::invalid("Map", "expected an array of entries"));
                };
                let mut out = Vec::with_capacity(entries.len());
                for entry in entries {
                    match entry {
                        Value::Array(pair) if pair.len() == 2 => {
                            let mut pair = pair.into_iter();
                            if let (Some(k), Some(v)) = (pair.next(), pair.next()) {
                                out.push((k, v));
                            }
                        }
                        _ => return Err(CodecError::invalid("Map", "entry is not a [key, value] pair")),
                    }
                }
                Ok(Value::Map(out))
            },
        ),
        TypeCodec::new(
            "Set",
            |v| matches!(v, Value::Set(_)),
            |v| match v {
                Value::Set(items) => Ok(Value::Array(items.clone())),
                other => Err(CodecError::unsupported("Set", other)),
            },
            |payload| match payload {
                Value::Array(items) => Ok(Value::set(items)),
                _ => Err(CodecError::invalid("Set", "expected an array")),
            },
        ),
        TypeCodec::new(
            "BigInt",
            |v| matches!(v, Value::BigInt(_)),
            |v| match v {
                Value::BigInt(n) => Ok(Value::String(n.to_string())),
                other => Err(CodecError::unsupported("BigInt", other)),
            },
            |payload| {
                let s = expect_str("BigInt", &payload)?;
                s.parse::<BigInt>()
                    .map(Value::BigInt)
                    .map_err(|e| CodecError::invalid("BigInt", e.to_string()))
            },
        ),
        TypeCodec::new(
            "URL",
            |v| matches!(v, Value::Url(_)),
            |v| match v {
                Value::Url(url) => Ok(Value::String(url.as_str().to_string())),
                other => Err(CodecError::unsupported("URL", other)),
            },
            |payload| {
                let s = expect_str("URL", &payload)?;
                Url::parse(s)
                    .map(Value::Url)
                    .map_err(|e| CodecError::invalid("URL", e.to_string()))
            },
        ),
        TypeCodec::new(
            "RegExp",
            |v| matches!(v, Value::Regex(_)),
            |v| match v {
                Value::Regex(p) => Ok(Value::object([
                    ("source", p.source()),
                    ("flags", p.flags()),
                ])),
                other => Err(CodecError::unsupported("RegExp", other)),
            },
            |payload| {
                let source = payload.get("source").and_then(Value::as_str);
                let flags = payload.get("flags").and_then(Value::as_str).unwrap_or("");
                let Some(source) = source else {
                    return Err(CodecError::invalid("RegExp", "missing `source`"));
                };
                Pattern::new(source, flags)
                    .map(Value::Regex)
                    .map_err(|e| CodecError::invalid("RegExp", e.to_string()))
            },
        ),
    ]
}

fn expect_str<'a>(tag: &str, payload: &'a Value) -> Result<&'a str, CodecError> {
    payload
        .as_str()
        .ok_or_else(|| CodecError::invalid(tag, format!("expected a string, got {}", payload.kind())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn roundtrip(value: &Value) -> Value {
        let codecs = CodecRegistry::with_defaults();
        let json = codecs.encode(value).unwrap().unwrap();
        codecs.decode(json).unwrap()
    }

    #[test]
    fn date_wire_shape() {
        let codecs = CodecRegistry::with_defaults();
        let date = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let json = codecs.encode(&Value::Date(date)).unwrap().unwrap();
        assert_eq!(json, json!({"tag": "Date", "value": "2024-01-02T03:04:05Z"}));
    }

    #[test]
    fn nested_structures_roundtrip() {
        let date = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let value = Value::object([
            ("when", Value::Date(date)),
            (
                "index",
                Value::map([(Value::Date(date), Value::set(["a", "b"]))]),
            ),
            ("big", Value::BigInt("123456789012345678901234567890".parse().unwrap())),
            ("home", Value::Url(Url::parse("https://example.com/a?b=c").unwrap())),
            ("pattern", Value::Regex(Pattern::new("^a+$", "i").unwrap())),
            ("list", Value::array([Value::from(1), Value::Null, Value::from("x")])),
        ]);
        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn wrapper_shaped_objects_stay_plain() {
        let codecs = CodecRegistry::with_defaults();
        let link = Value::object([("tag", "URL"), ("value", "https://a.example/")]);
        let json = codecs.encode(&link).unwrap().unwrap();
        assert_eq!(
            json,
            json!({"tag": "Object", "value": {"tag": "URL", "value": "https://a.example/"}})
        );
        assert_eq!(codecs.decode(json).unwrap(), link);

        let not_a_date = Value::object([("tag", "Date"), ("value", "soon")]);
        assert_eq!(roundtrip(&not_a_date), not_a_date);

        let escaped_twice = Value::object([
            ("tag", Value::from("Object")),
            ("value", Value::object([("tag", "Set"), ("value", "x")])),
        ]);
        assert_eq!(roundtrip(&escaped_twice), escaped_twice);
    }

    #[test]
    fn unknown_tag_stays_plain() {
        let codecs = CodecRegistry::with_defaults();
        let json = json!({"tag": "Nope", "value": 1});
        assert_eq!(
            codecs.decode(json).unwrap(),
            Value::object([("tag", Value::from("Nope")), ("value", Value::from(1))])
        );
    }

    #[test]
    fn custom_without_codec_is_dropped() {
        #[derive(Debug, PartialEq)]
        struct Handle;

        let codecs = CodecRegistry::with_defaults();
        let value = Value::object([
            ("keep", Value::from(1)),
            ("drop", Value::custom(Handle)),
            ("list", Value::array([Value::custom(Handle)])),
        ]);
        let json = codecs.encode(&value).unwrap().unwrap();
        assert_eq!(json, json!({"keep": 1, "list": [null]}));
    }

    #[test]
    fn custom_codec() {
        #[derive(Debug, PartialEq)]
        struct Money {
            cents: i64,
        }

        let mut codecs = CodecRegistry::with_defaults();
        codecs.register(TypeCodec::new(
            "Money",
            |v| v.downcast_custom::<Money>().is_some(),
            |v| {
                v.downcast_custom::<Money>()
                    .map(|m| Value::Int(m.cents))
                    .ok_or_else(|| CodecError::unsupported("Money", v))
            },
            |payload| {
                payload
                    .as_i64()
                    .map(|cents| Value::custom(Money { cents }))
                    .ok_or_else(|| CodecError::invalid("Money", "expected integer cents"))
            },
        ));

        let value = Value::array([Value::custom(Money { cents: 995 })]);
        let json = codecs.encode(&value).unwrap().unwrap();
        assert_eq!(json, json!([{"tag": "Money", "value": 995}]));
        assert_eq!(codecs.decode(json).unwrap(), value);
    }

    #[test]
    fn invalid_payload_is_an_error() {
        let codecs = CodecRegistry::with_defaults();
        let err = codecs
            .decode(json!({"tag": "Date", "value": "not a date"}))
            .unwrap_err();
        assert!(matches!(err, CodecError::InvalidPayload { .. }));
    }

    #[test]
    fn register_replaces_same_tag() {
        let mut codecs = CodecRegistry::with_defaults();
        let before = codecs.tags().count();
        codecs.register(TypeCodec::new(
            "Set",
            |v| matches!(v, Value::Set(_)),
            |_| Ok(Value::Null),
            |_| Ok(Value::Null),
        ));
        assert_eq!(codecs.tags().count(), before);
        assert_eq!(codecs.tags().nth(2), Some("Set"));
    }
}
