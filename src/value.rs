//! Codec-neutral values and type tags.
//!
//! Commands exchange [`Value`] trees: a small dynamic data model every codec
//! can represent. [`TypeTag`] is the portable type descriptor published by
//! the metadata service; tags are advisory to codecs and drive client-side
//! coercion (e.g. base64 strings back into bytes under JSON).

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

use crate::error::{RpcError, Result};

/// A dynamic RPC value.
///
/// Maps preserve entry order; producers that need deterministic output (the
/// metadata service) emit entries sorted by key.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
}

impl Value {
    /// Short name of the variant, used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric view: integers widen to f64.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Look up a string key in a map value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map()?.iter().find_map(|(k, v)| match k {
            Value::Str(s) if s == key => Some(v),
            _ => None,
        })
    }

    /// Consuming variant of [`Value::get`].
    pub fn take(self, key: &str) -> Option<Value> {
        match self {
            Value::Map(entries) => entries.into_iter().find_map(|(k, v)| match k {
                Value::Str(s) if s == key => Some(v),
                _ => None,
            }),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Value {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Value {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Value {
        Value::List(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Value {
        match v {
            Some(inner) => inner.into(),
            None => Value::Null,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(n) => serializer.serialize_i64(*n),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Bytes(b) => serializer.serialize_bytes(b),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an rpc value")
    }

    fn visit_bool<E>(self, v: bool) -> std::result::Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E>(self, v: i64) -> std::result::Result<Value, E> {
        Ok(Value::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Value, E> {
        i64::try_from(v)
            .map(Value::Int)
            .map_err(|_| E::custom("integer out of range"))
    }

    fn visit_f64<E>(self, v: f64) -> std::result::Result<Value, E> {
        Ok(Value::Float(v))
    }

    fn visit_str<E>(self, v: &str) -> std::result::Result<Value, E> {
        Ok(Value::Str(v.to_string()))
    }

    fn visit_string<E>(self, v: String) -> std::result::Result<Value, E> {
        Ok(Value::Str(v))
    }

    fn visit_bytes<E>(self, v: &[u8]) -> std::result::Result<Value, E> {
        Ok(Value::Bytes(v.to_vec()))
    }

    fn visit_byte_buf<E>(self, v: Vec<u8>) -> std::result::Result<Value, E> {
        Ok(Value::Bytes(v))
    }

    fn visit_unit<E>(self) -> std::result::Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E>(self) -> std::result::Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> std::result::Result<Value, D::Error> {
        Value::deserialize(d)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Value, A::Error> {
        let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((key, value)) = map.next_entry()? {
            entries.push((key, value));
        }
        Ok(Value::Map(entries))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Value, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

/// Portable type descriptor drawn from a closed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeTag {
    Int,
    Float,
    Bool,
    Str,
    Bytes,
    None,
    Any,
    List(Box<TypeTag>),
    Map(Box<TypeTag>, Box<TypeTag>),
    Optional(Box<TypeTag>),
    Union(Vec<TypeTag>),
    Stream(Box<TypeTag>),
}

impl TypeTag {
    pub fn list(inner: TypeTag) -> TypeTag {
        TypeTag::List(Box::new(inner))
    }

    pub fn map(key: TypeTag, value: TypeTag) -> TypeTag {
        TypeTag::Map(Box::new(key), Box::new(value))
    }

    pub fn optional(inner: TypeTag) -> TypeTag {
        TypeTag::Optional(Box::new(inner))
    }

    pub fn stream(inner: TypeTag) -> TypeTag {
        TypeTag::Stream(Box::new(inner))
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, TypeTag::Stream(_))
    }

    /// Element tag of a `stream<T>`, if this is one.
    pub fn stream_element(&self) -> Option<&TypeTag> {
        match self {
            TypeTag::Stream(inner) => Some(inner),
            _ => None,
        }
    }

    /// Coerce a decoded value toward this tag.
    ///
    /// Used after decoding under codecs that cannot represent every variant
    /// natively (JSON has no bytes or int/float distinction). Values that
    /// already match pass through; impossible conversions are codec errors.
    pub fn coerce(&self, value: Value) -> Result<Value> {
        use base64::Engine as _;

        match (self, value) {
            (TypeTag::Any, v) => Ok(v),
            (TypeTag::None, Value::Null) => Ok(Value::Null),
            (TypeTag::Bool, Value::Bool(b)) => Ok(Value::Bool(b)),
            (TypeTag::Int, Value::Int(n)) => Ok(Value::Int(n)),
            // JSON round-trips may widen integers to floats.
            (TypeTag::Int, Value::Float(f)) if f.fract() == 0.0 => Ok(Value::Int(f as i64)),
            (TypeTag::Float, Value::Float(f)) => Ok(Value::Float(f)),
            (TypeTag::Float, Value::Int(n)) => Ok(Value::Float(n as f64)),
            (TypeTag::Str, Value::Str(s)) => Ok(Value::Str(s)),
            (TypeTag::Bytes, Value::Bytes(b)) => Ok(Value::Bytes(b)),
            (TypeTag::Bytes, Value::Str(s)) => base64::engine::general_purpose::STANDARD
                .decode(s.as_bytes())
                .map(Value::Bytes)
                .map_err(|err| RpcError::Codec(format!("invalid base64 bytes: {err}"))),
            (TypeTag::List(inner), Value::List(items)) => items
                .into_iter()
                .map(|item| inner.coerce(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::List),
            (TypeTag::Map(key_tag, value_tag), Value::Map(entries)) => entries
                .into_iter()
                .map(|(k, v)| Ok((key_tag.coerce(k)?, value_tag.coerce(v)?)))
                .collect::<Result<Vec<_>>>()
                .map(Value::Map),
            // JSON map keys are always strings; fold numeric keys back.
            (TypeTag::Int, Value::Str(s)) if s.parse::<i64>().is_ok() => {
                Ok(Value::Int(s.parse().unwrap()))
            }
            (TypeTag::Optional(_), Value::Null) => Ok(Value::Null),
            (TypeTag::Optional(inner), v) => inner.coerce(v),
            (TypeTag::Union(arms), v) => {
                for arm in arms {
                    if let Ok(coerced) = arm.coerce(v.clone()) {
                        return Ok(coerced);
                    }
                }
                Err(RpcError::Codec(format!(
                    "value {} matches no union arm",
                    v.kind_name()
                )))
            }
            // Stream elements are coerced individually by the caller.
            (TypeTag::Stream(inner), v) => inner.coerce(v),
            (tag, v) => Err(RpcError::Codec(format!(
                "cannot interpret {} as {tag}",
                v.kind_name()
            ))),
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeTag::Int => f.write_str("int"),
            TypeTag::Float => f.write_str("float"),
            TypeTag::Bool => f.write_str("bool"),
            TypeTag::Str => f.write_str("str"),
            TypeTag::Bytes => f.write_str("bytes"),
            TypeTag::None => f.write_str("none"),
            TypeTag::Any => f.write_str("any"),
            TypeTag::List(inner) => write!(f, "list<{inner}>"),
            TypeTag::Map(key, value) => write!(f, "map<{key},{value}>"),
            TypeTag::Optional(inner) => write!(f, "optional<{inner}>"),
            TypeTag::Union(arms) => {
                f.write_str("union<")?;
                for (i, arm) in arms.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{arm}")?;
                }
                f.write_str(">")
            }
            TypeTag::Stream(inner) => write!(f, "stream<{inner}>"),
        }
    }
}

impl FromStr for TypeTag {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<TypeTag> {
        parse_tag(s.trim())
    }
}

fn parse_tag(s: &str) -> Result<TypeTag> {
    let bad = || RpcError::Protocol(format!("invalid type tag: {s}"));

    match s {
        "int" => return Ok(TypeTag::Int),
        "float" => return Ok(TypeTag::Float),
        "bool" => return Ok(TypeTag::Bool),
        "str" => return Ok(TypeTag::Str),
        "bytes" => return Ok(TypeTag::Bytes),
        "none" => return Ok(TypeTag::None),
        "any" => return Ok(TypeTag::Any),
        _ => {}
    }

    let open = s.find('<').ok_or_else(bad)?;
    if !s.ends_with('>') {
        return Err(bad());
    }
    let name = &s[..open];
    let inner = &s[open + 1..s.len() - 1];
    let args = split_args(inner).ok_or_else(bad)?;

    match (name, args.as_slice()) {
        ("list", [elem]) => Ok(TypeTag::list(parse_tag(elem)?)),
        ("optional", [elem]) => Ok(TypeTag::optional(parse_tag(elem)?)),
        ("stream", [elem]) => Ok(TypeTag::stream(parse_tag(elem)?)),
        ("map", [key, value]) => Ok(TypeTag::map(parse_tag(key)?, parse_tag(value)?)),
        ("union", arms) if !arms.is_empty() => Ok(TypeTag::Union(
            arms.iter()
                .map(|arm| parse_tag(arm))
                .collect::<Result<Vec<_>>>()?,
        )),
        _ => Err(bad()),
    }
}

/// Split comma-separated tag arguments at angle-bracket depth zero.
fn split_args(s: &str) -> Option<Vec<&str>> {
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;

    for (i, c) in s.char_indices() {
        match c {
            '<' => depth += 1,
            '>' => depth = depth.checked_sub(1)?,
            ',' if depth == 0 => {
                args.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return None;
    }
    args.push(s[start..].trim());
    if args.iter().any(|a| a.is_empty()) {
        return None;
    }
    Some(args)
}
