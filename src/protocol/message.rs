//! Wire message schema.
//!
//! Every frame body is a codec-encoded `[kind, id, payload]` triple. The
//! `id` multiplexes concurrent calls on one connection; id 0 is reserved for
//! the handshake. Message kinds form a closed set; an unknown kind on the
//! wire is a protocol error.
//!
//! Handshake messages (`HELLO`/`WELCOME`) are always msgpack-encoded so the
//! first frame of a connection is decodable before negotiation completes.
//! Everything else uses the negotiated codec.

use bytes::Bytes;

use crate::codec::Codec;
use crate::error::{ErrorKind, Result, RpcError};
use crate::value::Value;

/// Call id reserved for handshake traffic.
pub const HANDSHAKE_ID: u64 = 0;

/// Protocol version advertised in `HELLO`/`WELCOME`.
pub const PROTOCOL_VERSION: &str = "1";

/// A wire message, without its call id.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Client opener: codec names in preference order plus version.
    Hello { codecs: Vec<String>, version: String },
    /// Server answer: the chosen codec.
    Welcome { codec: String, version: String },
    /// Invoke `service.command`.
    Call {
        service: String,
        command: String,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        has_input_stream: bool,
    },
    /// Terminal unary result.
    Reply { value: Value },
    /// One element of a stream, either direction.
    Chunk { value: Value },
    /// Normal terminal close of a stream.
    End,
    /// Terminal failure.
    Error {
        kind: ErrorKind,
        message: String,
        traceback: Option<String>,
    },
    /// Request that the peer terminate the call early.
    Cancel,
}

const KIND_HELLO: i64 = 0;
const KIND_WELCOME: i64 = 1;
const KIND_CALL: i64 = 2;
const KIND_REPLY: i64 = 3;
const KIND_CHUNK: i64 = 4;
const KIND_END: i64 = 5;
const KIND_ERROR: i64 = 6;
const KIND_CANCEL: i64 = 7;

impl Message {
    /// Wire value of the message kind.
    pub fn kind(&self) -> i64 {
        match self {
            Message::Hello { .. } => KIND_HELLO,
            Message::Welcome { .. } => KIND_WELCOME,
            Message::Call { .. } => KIND_CALL,
            Message::Reply { .. } => KIND_REPLY,
            Message::Chunk { .. } => KIND_CHUNK,
            Message::End => KIND_END,
            Message::Error { .. } => KIND_ERROR,
            Message::Cancel => KIND_CANCEL,
        }
    }

    /// Short name for logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "HELLO",
            Message::Welcome { .. } => "WELCOME",
            Message::Call { .. } => "CALL",
            Message::Reply { .. } => "REPLY",
            Message::Chunk { .. } => "CHUNK",
            Message::End => "END",
            Message::Error { .. } => "ERROR",
            Message::Cancel => "CANCEL",
        }
    }

    /// True for messages that retire a call in the sender's direction.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Message::Reply { .. } | Message::End | Message::Error { .. })
    }

    /// Build an `ERROR` message from a local error.
    pub fn error(err: &RpcError, traceback: Option<String>) -> Message {
        let traceback = match err {
            // Relayed remote errors keep their original traceback.
            RpcError::Remote(remote) => remote.traceback.clone(),
            _ => traceback,
        };
        Message::Error {
            kind: err.kind(),
            message: err.wire_message(),
            traceback,
        }
    }
}

/// A message paired with its call id, as it appears on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: u64,
    pub msg: Message,
}

/// Encode a message under `codec` for call `id`.
pub fn encode(codec: Codec, id: u64, msg: &Message) -> Result<Bytes> {
    let payload = match msg {
        Message::Hello { codecs, version } => map(vec![
            ("codecs", Value::List(codecs.iter().map(|c| c.as_str().into()).collect())),
            ("version", version.as_str().into()),
        ]),
        Message::Welcome { codec, version } => map(vec![
            ("codec", codec.as_str().into()),
            ("version", version.as_str().into()),
        ]),
        Message::Call {
            service,
            command,
            args,
            kwargs,
            has_input_stream,
        } => map(vec![
            ("service", service.as_str().into()),
            ("command", command.as_str().into()),
            ("args", Value::List(args.clone())),
            (
                "kwargs",
                Value::Map(
                    kwargs
                        .iter()
                        .map(|(k, v)| (Value::Str(k.clone()), v.clone()))
                        .collect(),
                ),
            ),
            ("has_input_stream", (*has_input_stream).into()),
        ]),
        Message::Reply { value } => map(vec![("value", value.clone())]),
        Message::Chunk { value } => map(vec![("value", value.clone())]),
        Message::End | Message::Cancel => Value::Map(Vec::new()),
        Message::Error {
            kind,
            message,
            traceback,
        } => map(vec![
            ("kind", kind.as_str().into()),
            ("message", message.as_str().into()),
            ("traceback", traceback.clone().into()),
        ]),
    };

    let frame = Value::List(vec![
        Value::Int(msg.kind()),
        Value::Int(id as i64),
        payload,
    ]);
    codec.encode(&frame, None)
}

/// Decode a frame body under `codec` into an [`Envelope`].
pub fn decode(codec: Codec, data: &[u8]) -> Result<Envelope> {
    let value = codec.decode(data, None)?;
    let items = match value {
        Value::List(items) if items.len() == 3 => items,
        other => {
            return Err(RpcError::Protocol(format!(
                "expected [kind, id, payload] triple, got {}",
                other.kind_name()
            )))
        }
    };
    let mut items = items.into_iter();
    let kind = items
        .next()
        .and_then(|v| v.as_int())
        .ok_or_else(|| RpcError::Protocol("message kind is not an integer".into()))?;
    let id = match items.next() {
        Some(Value::Int(id)) if id >= 0 => id as u64,
        _ => return Err(RpcError::Protocol("message id is not a valid integer".into())),
    };
    let payload = items.next().unwrap_or(Value::Null);

    let msg = match kind {
        KIND_HELLO => Message::Hello {
            codecs: str_list(&payload, "codecs")?,
            version: str_field(&payload, "version")?,
        },
        KIND_WELCOME => Message::Welcome {
            codec: str_field(&payload, "codec")?,
            version: str_field(&payload, "version")?,
        },
        KIND_CALL => Message::Call {
            service: str_field(&payload, "service")?,
            command: str_field(&payload, "command")?,
            args: match payload.get("args") {
                Some(Value::List(items)) => items.clone(),
                Some(other) => {
                    return Err(RpcError::Protocol(format!(
                        "call args must be a list, got {}",
                        other.kind_name()
                    )))
                }
                None => Vec::new(),
            },
            kwargs: match payload.get("kwargs") {
                Some(Value::Map(entries)) => entries
                    .iter()
                    .map(|(k, v)| match k {
                        Value::Str(name) => Ok((name.clone(), v.clone())),
                        other => Err(RpcError::Protocol(format!(
                            "kwarg name must be a string, got {}",
                            other.kind_name()
                        ))),
                    })
                    .collect::<Result<Vec<_>>>()?,
                Some(other) => {
                    return Err(RpcError::Protocol(format!(
                        "call kwargs must be a map, got {}",
                        other.kind_name()
                    )))
                }
                None => Vec::new(),
            },
            has_input_stream: payload
                .get("has_input_stream")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        },
        KIND_REPLY => Message::Reply {
            value: payload.get("value").cloned().unwrap_or(Value::Null),
        },
        KIND_CHUNK => Message::Chunk {
            value: payload.get("value").cloned().unwrap_or(Value::Null),
        },
        KIND_END => Message::End,
        KIND_ERROR => Message::Error {
            kind: ErrorKind::from_wire(&str_field(&payload, "kind")?),
            message: str_field(&payload, "message")?,
            traceback: match payload.get("traceback") {
                Some(Value::Str(tb)) if !tb.is_empty() => Some(tb.clone()),
                _ => None,
            },
        },
        KIND_CANCEL => Message::Cancel,
        other => return Err(RpcError::Protocol(format!("unknown message kind: {other}"))),
    };

    Ok(Envelope { id, msg })
}

/// Encode a handshake message. Always msgpack, always id 0.
pub fn encode_handshake(msg: &Message) -> Result<Bytes> {
    encode(Codec::Msgpack, HANDSHAKE_ID, msg)
}

/// Decode a handshake frame.
pub fn decode_handshake(data: &[u8]) -> Result<Envelope> {
    decode(Codec::Msgpack, data)
}

fn map(entries: Vec<(&str, Value)>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(k, v)| (Value::Str(k.to_string()), v))
            .collect(),
    )
}

fn str_field(payload: &Value, key: &str) -> Result<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RpcError::Protocol(format!("missing or invalid field: {key}")))
}

fn str_list(payload: &Value, key: &str) -> Result<Vec<String>> {
    let items = payload
        .get(key)
        .and_then(Value::as_list)
        .ok_or_else(|| RpcError::Protocol(format!("missing or invalid field: {key}")))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| RpcError::Protocol(format!("non-string entry in {key}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(codec: Codec, id: u64, msg: Message) {
        let encoded = encode(codec, id, &msg).unwrap();
        let envelope = decode(codec, &encoded).unwrap();
        assert_eq!(envelope.id, id);
        assert_eq!(envelope.msg, msg, "under {codec}");
    }

    #[test]
    fn test_roundtrip_all_kinds() {
        for codec in [Codec::Msgpack, Codec::Json] {
            roundtrip(
                codec,
                HANDSHAKE_ID,
                Message::Hello {
                    codecs: vec!["msgpack".into(), "json".into()],
                    version: PROTOCOL_VERSION.into(),
                },
            );
            roundtrip(
                codec,
                HANDSHAKE_ID,
                Message::Welcome {
                    codec: "msgpack".into(),
                    version: PROTOCOL_VERSION.into(),
                },
            );
            roundtrip(
                codec,
                1,
                Message::Call {
                    service: "echo".into(),
                    command: "echo".into(),
                    args: vec![Value::Str("hello".into())],
                    kwargs: vec![("flag".into(), Value::Bool(true))],
                    has_input_stream: false,
                },
            );
            roundtrip(codec, 3, Message::Reply { value: Value::Int(5) });
            roundtrip(codec, 5, Message::Chunk { value: Value::Bool(true) });
            roundtrip(codec, 5, Message::End);
            roundtrip(
                codec,
                7,
                Message::Error {
                    kind: ErrorKind::UnknownCommand,
                    message: "echo.nope".into(),
                    traceback: None,
                },
            );
            roundtrip(codec, 9, Message::Cancel);
        }
    }

    #[test]
    fn test_error_traceback_carried() {
        let msg = Message::Error {
            kind: ErrorKind::Command,
            message: "boom".into(),
            traceback: Some("at line 1".into()),
        };
        let encoded = encode(Codec::Msgpack, 11, &msg).unwrap();
        let envelope = decode(Codec::Msgpack, &encoded).unwrap();
        assert_eq!(envelope.msg, msg);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let frame = Value::List(vec![Value::Int(99), Value::Int(1), Value::Map(vec![])]);
        let encoded = Codec::Msgpack.encode(&frame, None).unwrap();
        let err = decode(Codec::Msgpack, &encoded).unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
        assert!(err.to_string().contains("unknown message kind"));
    }

    #[test]
    fn test_negative_id_rejected() {
        let frame = Value::List(vec![Value::Int(5), Value::Int(-1), Value::Map(vec![])]);
        let encoded = Codec::Msgpack.encode(&frame, None).unwrap();
        assert!(decode(Codec::Msgpack, &encoded).is_err());
    }

    #[test]
    fn test_non_triple_rejected() {
        let encoded = Codec::Msgpack.encode(&Value::Int(1), None).unwrap();
        assert!(decode(Codec::Msgpack, &encoded).is_err());

        let frame = Value::List(vec![Value::Int(5), Value::Int(1)]);
        let encoded = Codec::Msgpack.encode(&frame, None).unwrap();
        assert!(decode(Codec::Msgpack, &encoded).is_err());
    }

    #[test]
    fn test_is_terminal() {
        assert!(Message::Reply { value: Value::Null }.is_terminal());
        assert!(Message::End.is_terminal());
        assert!(Message::Error {
            kind: ErrorKind::Cancelled,
            message: String::new(),
            traceback: None,
        }
        .is_terminal());
        assert!(!Message::Chunk { value: Value::Null }.is_terminal());
        assert!(!Message::Cancel.is_terminal());
    }

    #[test]
    fn test_handshake_is_msgpack_regardless_of_session_codec() {
        let hello = Message::Hello {
            codecs: vec!["json".into()],
            version: PROTOCOL_VERSION.into(),
        };
        let encoded = encode_handshake(&hello).unwrap();
        // Decodes under msgpack even though the client prefers json.
        let envelope = decode_handshake(&encoded).unwrap();
        assert_eq!(envelope.id, HANDSHAKE_ID);
        assert_eq!(envelope.msg, hello);
    }
}
