//! RocksDB-backed key-value store for Storken's remote cache adapter.

use std::fmt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rocksdb::{DB, Direction, IteratorMode, Options};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use storken_core::KvStore;
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum RocksError {
    #[error("RocksDB error: {0}")]
    Db(#[from] rocksdb::Error),
    #[error("corrupt record for `{key}`: {reason}")]
    Record { key: String, reason: String },
    #[error("cannot encode record: {0}")]
    Encode(String),
}

/// On-disk form of one entry.
#[derive(Debug, Serialize, Deserialize)]
struct Record {
    /// Milliseconds since the Unix epoch after which the entry is gone.
    expires_at_ms: Option<u64>,
    value: Payload,
}

/// Stored bytes, serialized as a CBOR byte string (major type 2), not as an
/// array of integers.
#[derive(Debug, PartialEq, Eq)]
struct Payload(Vec<u8>);

impl Serialize for Payload {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PayloadVisitor;

        impl<'de> serde::de::Visitor<'de> for PayloadVisitor {
            type Value = Payload;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a byte string")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(Payload(v.to_vec()))
            }

            fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(Payload(v))
            }

            // Records written as integer arrays still read back.
            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(byte) = seq.next_element::<u8>()? {
                    bytes.push(byte);
                }
                Ok(Payload(bytes))
            }
        }

        deserializer.deserialize_byte_buf(PayloadVisitor)
    }
}

impl Record {
    fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_none_or(|at| at > now_ms)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

fn ttl_ms(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

/// A persistent key-value store backed by RocksDB.
///
/// Entries carry their own expiry; expired entries are invisible to reads
/// and removed when next touched.
pub struct RocksKv {
    db: DB,
}

impl RocksKv {
    /// Opens a RocksDB store at the given path.
    ///
    /// Creates the database if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RocksError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }

    fn read(&self, key: &str) -> Result<Option<Record>, RocksError> {
        let Some(bytes) = self.db.get_pinned(key.as_bytes())? else {
            return Ok(None);
        };
        let record: Record =
            ciborium::from_reader(bytes.as_ref()).map_err(|e| RocksError::Record {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Some(record))
    }

    /// Reads a live record, purging it if it has expired.
    fn read_live(&self, key: &str) -> Result<Option<Record>, RocksError> {
        match self.read(key)? {
            Some(record) if record.is_live(now_ms()) => Ok(Some(record)),
            Some(_) => {
                trace!(%key, "purging expired entry");
                self.db.delete(key.as_bytes())?;
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

impl KvStore for RocksKv {
    type Error = RocksError;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self.read_live(key)?.map(|record| record.value.0))
    }

    fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), Self::Error> {
        let record = Record {
            expires_at_ms: ttl.map(|ttl| now_ms().saturating_add(ttl_ms(ttl))),
            value: Payload(value.to_vec()),
        };
        let mut buf = Vec::new();
        ciborium::into_writer(&record, &mut buf).map_err(|e| RocksError::Encode(e.to_string()))?;
        self.db.put(key.as_bytes(), buf)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, Self::Error> {
        let existed = self.read_live(key)?.is_some();
        if existed {
            self.db.delete(key.as_bytes())?;
        }
        Ok(existed)
    }

    fn has(&self, key: &str) -> Result<bool, Self::Error> {
        Ok(self.read_live(key)?.is_some())
    }

    fn ttl(&self, key: &str) -> Result<Option<Duration>, Self::Error> {
        let now = now_ms();
        Ok(self
            .read_live(key)?
            .and_then(|record| record.expires_at_ms)
            .filter(|at| *at > now)
            .map(|at| Duration::from_millis(at - now)))
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, Self::Error> {
        let now = now_ms();
        let mut keys = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for item in iter {
            let (raw_key, raw_value) = item?;
            if !raw_key.starts_with(prefix.as_bytes()) {
                break;
            }
            let key = String::from_utf8_lossy(&raw_key).into_owned();
            let record: Record =
                ciborium::from_reader(raw_value.as_ref()).map_err(|e| RocksError::Record {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
            if record.is_live(now) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}
