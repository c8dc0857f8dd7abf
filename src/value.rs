use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use std::collections::BTreeMap;
use std::fmt;

pub const BINARY_TAG: &str = "$binary";
pub const FLOAT_TAG: &str = "$float";
/// Wraps a real single-entry map whose key is itself a tag.
pub const MAP_TAG: &str = "$map";

const TAGS: [&str; 3] = [BINARY_TAG, FLOAT_TAG, MAP_TAG];

pub type Mapping = BTreeMap<String, Value>;

/// A record value. Human-readable formats write binary blobs, non-finite
/// floats and tag-shaped maps as single-key `$`-tagged objects; binary formats
/// write them natively.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<Value>),
    Map(Mapping),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Mapping> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn into_map(self) -> Option<Mapping> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(field))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Binary(bytes)
    }
}

impl From<Mapping> for Value {
    fn from(m: Mapping) -> Self {
        Value::Map(m)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Nil => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Integer(n) => serializer.serialize_i64(*n),
            Value::Float(n) if !n.is_finite() && serializer.is_human_readable() => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(FLOAT_TAG, float_name(*n))?;
                map.end()
            }
            Value::Float(n) => serializer.serialize_f64(*n),
            Value::String(s) => serializer.serialize_str(s),
            Value::Binary(bytes) => {
                if serializer.is_human_readable() {
                    let mut map = serializer.serialize_map(Some(1))?;
                    map.serialize_entry(BINARY_TAG, &STANDARD.encode(bytes))?;
                    map.end()
                } else {
                    serializer.serialize_bytes(bytes)
                }
            }
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(entries) => MapRef(entries).serialize(serializer),
        }
    }
}

/// Serializes a borrowed [`Mapping`] exactly as `Value::Map` would.
pub struct MapRef<'a>(pub &'a Mapping);

impl Serialize for MapRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let entries = self.0;
        if serializer.is_human_readable() && is_tag_shaped(entries) {
            let mut map = serializer.serialize_map(Some(1))?;
            map.serialize_entry(MAP_TAG, &EscapedEntries(entries))?;
            return map.end();
        }

        let mut map = serializer.serialize_map(Some(entries.len()))?;
        for (k, v) in entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

// Written as `[[key, value]]` so the inner pair is never read back as a tag.
struct EscapedEntries<'a>(&'a Mapping);

impl Serialize for EscapedEntries<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter())
    }
}

fn is_tag_shaped(entries: &Mapping) -> bool {
    entries.len() == 1 && entries.keys().all(|k| TAGS.contains(&k.as_str()))
}

fn float_name(n: f64) -> &'static str {
    if n.is_nan() {
        "NaN"
    } else if n > 0.0 {
        "Infinity"
    } else {
        "-Infinity"
    }
}

fn untag(tag: &str, payload: Value) -> Result<Value, String> {
    match (tag, payload) {
        (BINARY_TAG, Value::String(encoded)) => STANDARD
            .decode(&encoded)
            .map(Value::Binary)
            .map_err(|e| format!("invalid {} payload: {}", BINARY_TAG, e)),
        (FLOAT_TAG, Value::String(name)) => match name.as_str() {
            "NaN" => Ok(Value::Float(f64::NAN)),
            "Infinity" => Ok(Value::Float(f64::INFINITY)),
            "-Infinity" => Ok(Value::Float(f64::NEG_INFINITY)),
            other => Err(format!("invalid {} payload: {:?}", FLOAT_TAG, other)),
        },
        (MAP_TAG, Value::Array(pairs)) => pairs
            .into_iter()
            .map(|pair| match pair {
                Value::Array(mut kv) if kv.len() == 2 => match (kv.pop(), kv.pop()) {
                    (Some(value), Some(Value::String(key))) => Ok((key, value)),
                    _ => Err(format!("invalid {} entry", MAP_TAG)),
                },
                _ => Err(format!("invalid {} entry", MAP_TAG)),
            })
            .collect::<Result<Mapping, String>>()
            .map(Value::Map),
        (tag, _) => Err(format!("invalid {} payload", tag)),
    }
}

struct ValueVisitor {
    tagged: bool,
}

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a structured value")
    }

    fn visit_unit<E>(self) -> Result<Value, E> {
        Ok(Value::Nil)
    }

    fn visit_none<E>(self) -> Result<Value, E> {
        Ok(Value::Nil)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        Value::deserialize(deserializer)
    }

    fn visit_bool<E>(self, b: bool) -> Result<Value, E> {
        Ok(Value::Bool(b))
    }

    fn visit_i64<E>(self, n: i64) -> Result<Value, E> {
        Ok(Value::Integer(n))
    }

    fn visit_u64<E: de::Error>(self, n: u64) -> Result<Value, E> {
        i64::try_from(n)
            .map(Value::Integer)
            .map_err(|_| E::custom(format!("integer {} out of range", n)))
    }

    fn visit_f64<E>(self, n: f64) -> Result<Value, E> {
        Ok(Value::Float(n))
    }

    fn visit_str<E>(self, s: &str) -> Result<Value, E> {
        Ok(Value::String(s.to_string()))
    }

    fn visit_string<E>(self, s: String) -> Result<Value, E> {
        Ok(Value::String(s))
    }

    fn visit_bytes<E>(self, bytes: &[u8]) -> Result<Value, E> {
        Ok(Value::Binary(bytes.to_vec()))
    }

    fn visit_byte_buf<E>(self, bytes: Vec<u8>) -> Result<Value, E> {
        Ok(Value::Binary(bytes))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(4096));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Value, A::Error> {
        let mut entries = Mapping::new();
        while let Some((key, value)) = access.next_entry::<String, Value>()? {
            entries.insert(key, value);
        }

        if !self.tagged || !is_tag_shaped(&entries) {
            return Ok(Value::Map(entries));
        }

        match entries.pop_first() {
            Some((tag, payload)) => untag(&tag, payload).map_err(<A::Error as de::Error>::custom),
            None => Ok(Value::Map(entries)),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Value, D::Error> {
        let tagged = deserializer.is_human_readable();
        deserializer.deserialize_any(ValueVisitor { tagged })
    }
}

/// Builds a [`Mapping`] from `(field, value)` pairs.
pub fn mapping<K, V, I>(entries: I) -> Mapping
where
    K: Into<String>,
    V: Into<Value>,
    I: IntoIterator<Item = (K, V)>,
{
    entries
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
