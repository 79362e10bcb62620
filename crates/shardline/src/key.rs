//! Shard key values, tuples and patterns.
//!
//! Key values follow a fixed cross-type order so that every document maps to
//! exactly one point of the keyspace:
//! `MinKey < Null < Int < Str < Bool < MaxKey`.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{ShardError, ShardResult};

/// A stored document.
pub type Document = Map<String, Value>;

/// Field every document carries as its primary identity.
pub const ID_FIELD: &str = "_id";

/// One component of a shard key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyValue {
    MinKey,
    Null,
    Int(i64),
    Str(String),
    Bool(bool),
    MaxKey,
}

impl KeyValue {
    /// Convert a JSON scalar (or a `$minKey`/`$maxKey` marker) into a key value.
    pub fn from_json(value: &Value) -> ShardResult<Self> {
        match value {
            Value::Null => Ok(KeyValue::Null),
            Value::Bool(b) => Ok(KeyValue::Bool(*b)),
            Value::String(s) => Ok(KeyValue::Str(s.clone())),
            Value::Number(n) => {
                if let Some(v) = n.as_i64() {
                    return Ok(KeyValue::Int(v));
                }
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
                        Ok(KeyValue::Int(f as i64))
                    }
                    _ => Err(ShardError::InvalidOptions(format!(
                        "shard key value {n} is not an integer"
                    ))),
                }
            }
            Value::Object(obj) if obj.len() == 1 && obj.contains_key("$minKey") => {
                Ok(KeyValue::MinKey)
            }
            Value::Object(obj) if obj.len() == 1 && obj.contains_key("$maxKey") => {
                Ok(KeyValue::MaxKey)
            }
            other => Err(ShardError::InvalidOptions(format!(
                "shard key value {other} must be a scalar"
            ))),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            KeyValue::MinKey => serde_json::json!({ "$minKey": 1 }),
            KeyValue::MaxKey => serde_json::json!({ "$maxKey": 1 }),
            KeyValue::Null => Value::Null,
            KeyValue::Int(v) => Value::from(*v),
            KeyValue::Str(s) => Value::String(s.clone()),
            KeyValue::Bool(b) => Value::Bool(*b),
        }
    }

    /// Append the order-preserving byte encoding of this value.
    ///
    /// Strings escape `0x00` as `0x00 0xFF` and terminate with `0x00 0x01`, so
    /// encodings are prefix-free and byte order equals value order.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            KeyValue::MinKey => out.push(0x00),
            KeyValue::Null => out.push(0x10),
            KeyValue::Int(v) => {
                out.push(0x20);
                out.extend_from_slice(&((*v as u64) ^ (1u64 << 63)).to_be_bytes());
            }
            KeyValue::Str(s) => {
                out.push(0x30);
                for b in s.as_bytes() {
                    if *b == 0x00 {
                        out.extend_from_slice(&[0x00, 0xFF]);
                    } else {
                        out.push(*b);
                    }
                }
                out.extend_from_slice(&[0x00, 0x01]);
            }
            KeyValue::Bool(b) => {
                out.push(0x40);
                out.push(u8::from(*b));
            }
            KeyValue::MaxKey => out.push(0xFF),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::MinKey => write!(f, "MinKey"),
            KeyValue::MaxKey => write!(f, "MaxKey"),
            KeyValue::Null => write!(f, "null"),
            KeyValue::Int(v) => write!(f, "{v}"),
            KeyValue::Str(s) => write!(f, "{s:?}"),
            KeyValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl Serialize for KeyValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for KeyValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        KeyValue::from_json(&value).map_err(serde::de::Error::custom)
    }
}

/// A point in a collection's keyspace: one value per shard key field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardKey(pub Vec<KeyValue>);

impl ShardKey {
    pub fn new(values: Vec<KeyValue>) -> Self {
        Self(values)
    }

    /// Single-field key, the common case in tests and tooling.
    pub fn single(value: KeyValue) -> Self {
        Self(vec![value])
    }

    pub fn int(v: i64) -> Self {
        Self::single(KeyValue::Int(v))
    }

    pub fn min(width: usize) -> Self {
        Self(vec![KeyValue::MinKey; width])
    }

    pub fn max(width: usize) -> Self {
        Self(vec![KeyValue::MaxKey; width])
    }

    pub fn width(&self) -> usize {
        self.0.len()
    }

    pub fn values(&self) -> &[KeyValue] {
        &self.0
    }

    pub fn is_global_max(&self) -> bool {
        self.0.iter().all(|v| *v == KeyValue::MaxKey)
    }

    /// Pad the tuple to `width` fields, filling with MinKey (MaxKey for the global max).
    pub fn extend_to(&self, width: usize) -> Self {
        let fill = if self.is_global_max() {
            KeyValue::MaxKey
        } else {
            KeyValue::MinKey
        };
        let mut values = self.0.clone();
        while values.len() < width {
            values.push(fill.clone());
        }
        Self(values)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for v in &self.0 {
            v.encode_into(&mut out);
        }
        out
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (idx, v) in self.0.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, "}}")
    }
}

/// Ordered list of (possibly dotted) field paths forming a shard key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardKeyPattern {
    fields: Vec<String>,
}

impl ShardKeyPattern {
    pub fn new<S: Into<String>>(fields: impl IntoIterator<Item = S>) -> ShardResult<Self> {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        if fields.is_empty() {
            return Err(ShardError::InvalidOptions(
                "shard key pattern must name at least one field".to_string(),
            ));
        }
        for (idx, field) in fields.iter().enumerate() {
            if field.is_empty() || field.split('.').any(str::is_empty) {
                return Err(ShardError::InvalidOptions(format!(
                    "invalid shard key field {field:?}"
                )));
            }
            if fields[..idx].contains(field) {
                return Err(ShardError::InvalidOptions(format!(
                    "duplicate shard key field {field:?}"
                )));
            }
        }
        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn width(&self) -> usize {
        self.fields.len()
    }

    pub fn global_min(&self) -> ShardKey {
        ShardKey::min(self.width())
    }

    pub fn global_max(&self) -> ShardKey {
        ShardKey::max(self.width())
    }

    /// True when `other` starts with exactly this pattern's fields.
    pub fn is_prefix_of(&self, other: &ShardKeyPattern) -> bool {
        other.fields.len() >= self.fields.len() && other.fields[..self.fields.len()] == self.fields[..]
    }

    /// Extract the shard key of `doc`; missing fields map to null.
    pub fn extract(&self, doc: &Document) -> ShardResult<ShardKey> {
        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let value = match lookup_path(doc, field) {
                None => KeyValue::Null,
                Some(v) => match v {
                    Value::Object(_) | Value::Array(_) => {
                        return Err(ShardError::InvalidOptions(format!(
                            "shard key field {field:?} must be a scalar"
                        )))
                    }
                    other => KeyValue::from_json(other)?,
                },
            };
            values.push(value);
        }
        Ok(ShardKey(values))
    }
}

impl fmt::Display for ShardKeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (idx, field) in self.fields.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{field}: 1")?;
        }
        write!(f, "}}")
    }
}

/// Resolve a dotted path inside a document.
pub fn lookup_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = doc.get(first)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// The `_id` of a document as a key value.
pub fn document_id(doc: &Document) -> ShardResult<KeyValue> {
    let id = doc.get(ID_FIELD).ok_or_else(|| {
        ShardError::InvalidOptions("document is missing the _id field".to_string())
    })?;
    KeyValue::from_json(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn cross_type_order_is_fixed() {
        let ordered = vec![
            KeyValue::MinKey,
            KeyValue::Null,
            KeyValue::Int(-5),
            KeyValue::Int(7),
            KeyValue::Str("a".into()),
            KeyValue::Str("b".into()),
            KeyValue::Bool(false),
            KeyValue::Bool(true),
            KeyValue::MaxKey,
        ];
        let mut shuffled = ordered.clone();
        shuffled.reverse();
        shuffled.sort();
        assert_eq!(shuffled, ordered);
    }

    #[test]
    fn encoding_preserves_order() {
        let values = vec![
            KeyValue::MinKey,
            KeyValue::Null,
            KeyValue::Int(i64::MIN),
            KeyValue::Int(-1),
            KeyValue::Int(0),
            KeyValue::Int(42),
            KeyValue::Str(String::new()),
            KeyValue::Str("a\0b".into()),
            KeyValue::Str("ab".into()),
            KeyValue::Bool(false),
            KeyValue::Bool(true),
            KeyValue::MaxKey,
        ];
        for pair in values.windows(2) {
            assert!(
                pair[0].encode() < pair[1].encode(),
                "encoding of {} should sort before {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn json_markers_round_trip() {
        let min: KeyValue = serde_json::from_value(json!({"$minKey": 1})).expect("min");
        let max: KeyValue = serde_json::from_value(json!({"$maxKey": 1})).expect("max");
        assert_eq!(min, KeyValue::MinKey);
        assert_eq!(max, KeyValue::MaxKey);
        let key: ShardKey = serde_json::from_value(json!([5, "x"])).expect("tuple");
        assert_eq!(
            key,
            ShardKey::new(vec![KeyValue::Int(5), KeyValue::Str("x".into())])
        );
    }

    #[test]
    fn extract_handles_dotted_and_missing_fields() {
        let pattern = ShardKeyPattern::new(["a.b", "c"]).expect("pattern");
        let key = pattern
            .extract(&doc(json!({"_id": 1, "a": {"b": 3}})))
            .expect("extract");
        assert_eq!(key, ShardKey::new(vec![KeyValue::Int(3), KeyValue::Null]));

        let err = pattern
            .extract(&doc(json!({"_id": 1, "a": {"b": [1, 2]}})))
            .expect_err("arrays are rejected");
        assert!(matches!(err, ShardError::InvalidOptions(_)));
    }

    #[test]
    fn extend_pads_with_min_or_max() {
        assert_eq!(
            ShardKey::int(5).extend_to(2),
            ShardKey::new(vec![KeyValue::Int(5), KeyValue::MinKey])
        );
        assert_eq!(ShardKey::max(1).extend_to(2), ShardKey::max(2));
        assert_eq!(ShardKey::min(1).extend_to(2), ShardKey::min(2));
    }

    #[test]
    fn pattern_rejects_duplicates_and_empty() {
        assert!(ShardKeyPattern::new(Vec::<String>::new()).is_err());
        assert!(ShardKeyPattern::new(["x", "x"]).is_err());
        assert!(ShardKeyPattern::new(["a..b"]).is_err());
        let old = ShardKeyPattern::new(["x"]).expect("old");
        let new = ShardKeyPattern::new(["x", "y"]).expect("new");
        assert!(old.is_prefix_of(&new));
        assert!(!new.is_prefix_of(&old));
    }
}
