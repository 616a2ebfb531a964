//! Codec module - serialization/deserialization for wire payloads.
//!
//! A [`Codec`] converts [`Value`] trees to and from bytes. The set is closed
//! and addressed by the short names exchanged during the handshake:
//!
//! - [`Codec::Msgpack`] (`"msgpack"`) - compact binary, handles bytes
//!   natively, the preferred default.
//! - [`Codec::Json`] (`"json"`) - UTF-8 text, bytes as base64 strings.
//!
//! Codecs are symmetric and self-delimiting within the bytes handed to them.
//! Type tags are advisory: msgpack ignores them, JSON uses them to recover
//! variants it cannot represent natively.

mod json;
mod msgpack;

use bytes::Bytes;

use crate::error::Result;
use crate::value::{TypeTag, Value};

/// A wire codec, selected during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    Msgpack,
    Json,
}

impl Codec {
    /// Codec names offered by default, in preference order.
    pub const SUPPORTED: &'static [&'static str] = &["msgpack", "json"];

    /// Look up a codec by its handshake name.
    pub fn by_name(name: &str) -> Option<Codec> {
        match name {
            "msgpack" => Some(Codec::Msgpack),
            "json" => Some(Codec::Json),
            _ => None,
        }
    }

    /// The handshake name of this codec.
    pub fn name(&self) -> &'static str {
        match self {
            Codec::Msgpack => "msgpack",
            Codec::Json => "json",
        }
    }

    /// Encode a value to bytes.
    pub fn encode(&self, value: &Value, tag: Option<&TypeTag>) -> Result<Bytes> {
        match self {
            Codec::Msgpack => msgpack::encode(value, tag),
            Codec::Json => json::encode(value, tag),
        }
    }

    /// Decode bytes back into a value, coercing toward `tag` if given.
    pub fn decode(&self, data: &[u8], tag: Option<&TypeTag>) -> Result<Value> {
        match self {
            Codec::Msgpack => msgpack::decode(data, tag),
            Codec::Json => json::decode(data, tag),
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Pick the first client-offered codec the server supports.
pub fn negotiate(offered: &[String]) -> Option<Codec> {
    offered.iter().find_map(|name| Codec::by_name(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_values() -> Vec<Value> {
        vec![
            Value::Null,
            Value::Bool(true),
            Value::Bool(false),
            Value::Int(0),
            Value::Int(-42),
            Value::Int(i64::MAX),
            Value::Float(3.25),
            Value::Str("hello".into()),
            Value::Str(String::new()),
            Value::Bytes(vec![0, 1, 2, 254, 255]),
            Value::List(vec![Value::Int(1), Value::Str("two".into()), Value::Null]),
            Value::Map(vec![
                (Value::Str("a".into()), Value::Int(1)),
                (Value::Str("b".into()), Value::List(vec![Value::Bool(true)])),
            ]),
        ]
    }

    #[test]
    fn test_by_name() {
        assert_eq!(Codec::by_name("msgpack"), Some(Codec::Msgpack));
        assert_eq!(Codec::by_name("json"), Some(Codec::Json));
        assert_eq!(Codec::by_name("protobuf"), None);
    }

    #[test]
    fn test_msgpack_roundtrip() {
        let codec = Codec::Msgpack;
        for value in sample_values() {
            let encoded = codec.encode(&value, None).unwrap();
            let decoded = codec.decode(&encoded, None).unwrap();
            assert_eq!(decoded, value, "msgpack roundtrip of {value:?}");
        }
    }

    #[test]
    fn test_json_roundtrip_with_tags() {
        use crate::value::TypeTag;

        let codec = Codec::Json;
        let cases: Vec<(Value, TypeTag)> = vec![
            (Value::Null, TypeTag::None),
            (Value::Bool(true), TypeTag::Bool),
            (Value::Int(-42), TypeTag::Int),
            (Value::Float(3.25), TypeTag::Float),
            (Value::Str("hello".into()), TypeTag::Str),
            (Value::Bytes(vec![0, 1, 2, 255]), TypeTag::Bytes),
            (
                Value::List(vec![Value::Bytes(b"ab".to_vec())]),
                "list<bytes>".parse().unwrap(),
            ),
            (
                Value::Map(vec![(Value::Str("k".into()), Value::Int(1))]),
                "map<str,int>".parse().unwrap(),
            ),
        ];
        for (value, tag) in cases {
            let encoded = codec.encode(&value, Some(&tag)).unwrap();
            let decoded = codec.decode(&encoded, Some(&tag)).unwrap();
            assert_eq!(decoded, value, "json roundtrip of {value:?} as {tag}");
        }
    }

    #[test]
    fn test_json_bytes_are_base64_text() {
        let codec = Codec::Json;
        let encoded = codec
            .encode(&Value::Bytes(b"ABCD".to_vec()), None)
            .unwrap();
        let text = std::str::from_utf8(&encoded).unwrap();
        assert_eq!(text, "\"QUJDRA==\"");
    }

    #[test]
    fn test_json_untagged_decode_keeps_strings() {
        let codec = Codec::Json;
        let decoded = codec.decode(b"\"QUJDRA==\"", None).unwrap();
        assert_eq!(decoded, Value::Str("QUJDRA==".into()));
    }

    #[test]
    fn test_decode_error_on_garbage() {
        assert!(Codec::Json.decode(b"{not json", None).is_err());
        assert!(Codec::Msgpack.decode(&[0xc1], None).is_err());
    }

    #[test]
    fn test_negotiate_prefers_client_order() {
        let offered = vec!["json".to_string(), "msgpack".to_string()];
        assert_eq!(negotiate(&offered), Some(Codec::Json));

        let offered = vec!["protobuf".to_string(), "msgpack".to_string()];
        assert_eq!(negotiate(&offered), Some(Codec::Msgpack));

        let offered = vec!["protobuf".to_string()];
        assert_eq!(negotiate(&offered), None);
    }
}
