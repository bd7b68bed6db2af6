//! Primary key values.
//!
//! Variant order doubles as sort order: integers, then dates, then strings,
//! then binary blobs. In SQLite a key is stored as `(pk_kind, pk_value)` so
//! the same order falls out of `ORDER BY pk_kind, pk_value`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

const DATE_TAG: &str = "$date";
const BINARY_TAG: &str = "$binary";
/// Dates are stored as microseconds since the epoch.
const DATE_PRECISION: u16 = 6;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    Int(i64),
    Date(DateTime<Utc>),
    Text(String),
    Binary(Vec<u8>),
}

impl Key {
    /// Interpret a JSON value as a key. Booleans, floats with a fraction,
    /// arrays and untagged objects are not valid keys.
    pub fn from_json(value: &Value) -> Option<Key> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(Key::Int),
            Value::String(s) => Some(Key::Text(s.clone())),
            Value::Object(map) if map.len() == 1 => {
                if let Some(Value::String(raw)) = map.get(DATE_TAG) {
                    return DateTime::parse_from_rfc3339(raw)
                        .ok()
                        .map(|d| Key::from(d.with_timezone(&Utc)));
                }
                if let Some(Value::String(raw)) = map.get(BINARY_TAG) {
                    return BASE64.decode(raw).ok().map(Key::Binary);
                }
                None
            }
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Key::Int(n) => json!(n),
            Key::Date(d) => json!({ DATE_TAG: d.to_rfc3339() }),
            Key::Text(s) => json!(s),
            Key::Binary(b) => json!({ BINARY_TAG: BASE64.encode(b) }),
        }
    }

    /// The key as it reads back from the store: dates lose anything finer
    /// than a microsecond.
    pub fn normalized(self) -> Key {
        match self {
            Key::Date(d) => Key::Date(d.trunc_subsecs(DATE_PRECISION)),
            other => other,
        }
    }

    pub(crate) fn kind_code(&self) -> i64 {
        match self {
            Key::Int(_) => 0,
            Key::Date(_) => 1,
            Key::Text(_) => 2,
            Key::Binary(_) => 3,
        }
    }

    pub(crate) fn sql_value(&self) -> ToSqlOutput<'_> {
        match self {
            Key::Int(n) => ToSqlOutput::Owned(SqlValue::Integer(*n)),
            Key::Date(d) => ToSqlOutput::Owned(SqlValue::Integer(d.timestamp_micros())),
            Key::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Key::Binary(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        }
    }

    /// Rebuild a key from its stored `(pk_kind, pk_value)` columns.
    pub(crate) fn from_sql(kind: i64, value: ValueRef<'_>) -> rusqlite::Result<Key> {
        let key = match (kind, value) {
            (0, ValueRef::Integer(n)) => Key::Int(n),
            (1, ValueRef::Integer(micros)) => match Utc.timestamp_micros(micros).single() {
                Some(d) => Key::Date(d),
                None => return Err(rusqlite::Error::IntegralValueOutOfRange(1, micros)),
            },
            (2, ValueRef::Text(t)) => Key::Text(String::from_utf8_lossy(t).into_owned()),
            (3, ValueRef::Blob(b)) => Key::Binary(b.to_vec()),
            (_, other) => {
                return Err(rusqlite::Error::InvalidColumnType(
                    1,
                    "pk_value".to_string(),
                    other.data_type(),
                ))
            }
        };
        Ok(key)
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Int(n) => write!(f, "{n}"),
            Key::Date(d) => write!(f, "{}", d.to_rfc3339()),
            Key::Text(s) => write!(f, "{s:?}"),
            Key::Binary(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Key::from_json(&raw).ok_or_else(|| D::Error::custom(format!("not a valid key: {raw}")))
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Int(value)
    }
}

impl From<i32> for Key {
    fn from(value: i32) -> Self {
        Key::Int(i64::from(value))
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Text(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Text(value)
    }
}

impl From<DateTime<Utc>> for Key {
    fn from(value: DateTime<Utc>) -> Self {
        Key::Date(value.trunc_subsecs(DATE_PRECISION))
    }
}

impl From<Vec<u8>> for Key {
    fn from(value: Vec<u8>) -> Self {
        Key::Binary(value)
    }
}

/// One key or a list of keys, for operations that accept either.
#[derive(Debug, Clone, PartialEq)]
pub enum Keys {
    One(Key),
    Many(Vec<Key>),
}

impl Keys {
    /// The keys in stored form; see [`Key::normalized`].
    pub fn into_vec(self) -> Vec<Key> {
        match self {
            Keys::One(k) => vec![k.normalized()],
            Keys::Many(ks) => ks.into_iter().map(Key::normalized).collect(),
        }
    }
}

impl From<Key> for Keys {
    fn from(value: Key) -> Self {
        Keys::One(value)
    }
}

impl From<i64> for Keys {
    fn from(value: i64) -> Self {
        Keys::One(Key::Int(value))
    }
}

impl From<i32> for Keys {
    fn from(value: i32) -> Self {
        Keys::One(Key::from(value))
    }
}

impl From<&str> for Keys {
    fn from(value: &str) -> Self {
        Keys::One(Key::from(value))
    }
}

impl From<Vec<Key>> for Keys {
    fn from(value: Vec<Key>) -> Self {
        Keys::Many(value)
    }
}
