//! JSON codec using `serde_json`.
//!
//! Textual fallback for peers without a msgpack implementation. JSON cannot
//! carry two [`Value`] variants natively:
//!
//! - `bytes` are encoded as base64 (standard alphabet) strings,
//! - non-string map keys are stringified.
//!
//! Decoding without a tag keeps those as strings; decoding with an advisory
//! tag folds them back via [`TypeTag::coerce`].

use base64::Engine as _;
use bytes::Bytes;

use crate::error::{Result, RpcError};
use crate::value::{TypeTag, Value};

pub fn encode(value: &Value, _tag: Option<&TypeTag>) -> Result<Bytes> {
    let json = to_json(value)?;
    Ok(Bytes::from(serde_json::to_vec(&json)?))
}

pub fn decode(data: &[u8], tag: Option<&TypeTag>) -> Result<Value> {
    let json: serde_json::Value = serde_json::from_slice(data)?;
    let value = from_json(json)?;
    match tag {
        Some(tag) => tag.coerce(value),
        None => Ok(value),
    }
}

fn to_json(value: &Value) -> Result<serde_json::Value> {
    use serde_json::Value as Json;

    Ok(match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(n) => Json::Number((*n).into()),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(Json::Number)
            .ok_or_else(|| RpcError::Codec(format!("non-finite float: {f}")))?,
        Value::Str(s) => Json::String(s.clone()),
        Value::Bytes(b) => Json::String(base64::engine::general_purpose::STANDARD.encode(b)),
        Value::List(items) => Json::Array(items.iter().map(to_json).collect::<Result<_>>()?),
        Value::Map(entries) => {
            let mut map = serde_json::Map::with_capacity(entries.len());
            for (key, val) in entries {
                map.insert(key_string(key)?, to_json(val)?);
            }
            Json::Object(map)
        }
    })
}

/// JSON object keys must be strings; render scalar keys as text.
fn key_string(key: &Value) -> Result<String> {
    Ok(match key {
        Value::Str(s) => s.clone(),
        Value::Int(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Float(f) => f.to_string(),
        other => {
            return Err(RpcError::Codec(format!(
                "unsupported json map key: {}",
                other.kind_name()
            )))
        }
    })
}

fn from_json(json: serde_json::Value) -> Result<Value> {
    use serde_json::Value as Json;

    Ok(match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(f) = n.as_f64() {
                Value::Float(f)
            } else {
                return Err(RpcError::Codec(format!("integer out of range: {n}")));
            }
        }
        Json::String(s) => Value::Str(s),
        Json::Array(items) => Value::List(items.into_iter().map(from_json).collect::<Result<_>>()?),
        Json::Object(map) => Value::Map(
            map.into_iter()
                .map(|(k, v)| Ok((Value::Str(k), from_json(v)?)))
                .collect::<Result<_>>()?,
        ),
    })
}
