// Value serialization for the key-value store
//
// Values are written through a closed set of shapes and read back through a
// fallback chain: JSON, then the binary object envelope, then plain text.

use crate::errors::StoreError;
use bincode::config;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Prefix marking a binary object envelope. Never valid UTF-8 JSON.
const OBJECT_MAGIC: &[u8] = b"\x00RSO";

/// An opaque serialized object of any `serde` type
#[derive(Debug, Clone, PartialEq, Eq, Hash, bincode::Encode, bincode::Decode)]
pub struct ObjectBlob {
    type_name: String,
    payload: Vec<u8>,
}

impl ObjectBlob {
    pub fn from_value<T: Serialize + ?Sized>(value: &T) -> Result<Self, StoreError> {
        Ok(Self {
            type_name: std::any::type_name::<T>().to_string(),
            payload: bincode::serde::encode_to_vec(value, config::standard())?,
        })
    }

    /// Name of the Rust type the object was created from
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        let (value, _) = bincode::serde::decode_from_slice(&self.payload, config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(value)
    }

    fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        let mut bytes = OBJECT_MAGIC.to_vec();
        bytes.extend(bincode::encode_to_vec(self, config::standard())?);
        Ok(bytes)
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let body = bytes.strip_prefix(OBJECT_MAGIC)?;
        let (blob, read) = bincode::decode_from_slice::<Self, _>(body, config::standard()).ok()?;
        (read == body.len()).then_some(blob)
    }
}

/// A value accepted by write operations
#[derive(Debug, Clone, PartialEq)]
pub enum StoreValue {
    Text(String),
    Binary(Vec<u8>),
    Integer(i64),
    Float(f64),
    /// Mappings and sequences; always stored as JSON text
    Json(Value),
    /// Anything else, stored with the binary object serializer
    Object(ObjectBlob),
}

impl StoreValue {
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, StoreError> {
        Ok(StoreValue::Json(serde_json::to_value(value)?))
    }

    pub fn object<T: Serialize + ?Sized>(value: &T) -> Result<Self, StoreError> {
        Ok(StoreValue::Object(ObjectBlob::from_value(value)?))
    }

    /// Bytes sent to the store
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        match self {
            StoreValue::Text(s) => Ok(s.as_bytes().to_vec()),
            StoreValue::Binary(b) => Ok(b.clone()),
            StoreValue::Integer(i) => Ok(i.to_string().into_bytes()),
            StoreValue::Float(f) => Ok(f.to_string().into_bytes()),
            StoreValue::Json(v) => Ok(serde_json::to_vec(v)?),
            StoreValue::Object(blob) => blob.to_bytes(),
        }
    }
}

impl From<&str> for StoreValue {
    fn from(value: &str) -> Self {
        StoreValue::Text(value.to_string())
    }
}

impl From<String> for StoreValue {
    fn from(value: String) -> Self {
        StoreValue::Text(value)
    }
}

impl From<Vec<u8>> for StoreValue {
    fn from(value: Vec<u8>) -> Self {
        StoreValue::Binary(value)
    }
}

impl From<&[u8]> for StoreValue {
    fn from(value: &[u8]) -> Self {
        StoreValue::Binary(value.to_vec())
    }
}

impl From<i64> for StoreValue {
    fn from(value: i64) -> Self {
        StoreValue::Integer(value)
    }
}

impl From<i32> for StoreValue {
    fn from(value: i32) -> Self {
        StoreValue::Integer(value.into())
    }
}

impl From<f64> for StoreValue {
    fn from(value: f64) -> Self {
        StoreValue::Float(value)
    }
}

impl From<Value> for StoreValue {
    fn from(value: Value) -> Self {
        StoreValue::Json(value)
    }
}

impl From<ObjectBlob> for StoreValue {
    fn from(value: ObjectBlob) -> Self {
        StoreValue::Object(value)
    }
}

/// A value returned by read operations
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue {
    Text(String),
    Json(Value),
    Object(ObjectBlob),
}

impl DecodedValue {
    /// Decode bytes read from the store. Never fails.
    ///
    /// Without `decode_json` the bytes come back as text. With it, JSON is
    /// tried first, then the binary object envelope, then plain text.
    pub fn decode(bytes: &[u8], decode_json: bool) -> Self {
        if decode_json {
            if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
                return DecodedValue::Json(value);
            }
            if let Some(blob) = ObjectBlob::from_bytes(bytes) {
                return DecodedValue::Object(blob);
            }
        }
        DecodedValue::Text(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            DecodedValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            DecodedValue::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectBlob> {
        match self {
            DecodedValue::Object(blob) => Some(blob),
            _ => None,
        }
    }
}

/// A member of a set read back from the store
///
/// Members must be hashable, so decoded mappings, sequences and non-integral
/// numbers are carried as their JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SetMember {
    Text(String),
    Integer(i64),
    Bool(bool),
    Null,
    Object(ObjectBlob),
}

impl From<DecodedValue> for SetMember {
    fn from(value: DecodedValue) -> Self {
        match value {
            DecodedValue::Text(s) => SetMember::Text(s),
            DecodedValue::Object(blob) => SetMember::Object(blob),
            DecodedValue::Json(Value::String(s)) => SetMember::Text(s),
            DecodedValue::Json(Value::Bool(b)) => SetMember::Bool(b),
            DecodedValue::Json(Value::Null) => SetMember::Null,
            DecodedValue::Json(Value::Number(n)) if n.is_i64() => {
                n.as_i64().map_or_else(|| SetMember::Text(n.to_string()), SetMember::Integer)
            }
            DecodedValue::Json(other) => SetMember::Text(other.to_string()),
        }
    }
}
