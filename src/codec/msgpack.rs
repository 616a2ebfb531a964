//! MessagePack codec using `rmp-serde`.
//!
//! The binary default: compact, self-describing, and able to carry every
//! [`Value`] variant natively (bytes as msgpack bin, null as nil). Type tags
//! are ignored because the encoding embeds enough structure on its own.

use bytes::Bytes;

use crate::error::Result;
use crate::value::{TypeTag, Value};

pub fn encode(value: &Value, _tag: Option<&TypeTag>) -> Result<Bytes> {
    Ok(Bytes::from(rmp_serde::to_vec(value)?))
}

pub fn decode(data: &[u8], _tag: Option<&TypeTag>) -> Result<Value> {
    Ok(rmp_serde::from_slice(data)?)
}
