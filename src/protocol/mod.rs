//! Protocol module - wire messages and frame accumulation.
//!
//! The wire carries codec-encoded [`Message`]s multiplexed by call id
//! ([`Envelope`]); stream transports delimit them with a 4-byte big-endian
//! length prefix handled by [`FrameBuffer`].

mod frame_buffer;
mod message;

pub use frame_buffer::{build_frame, FrameBuffer, DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX};
pub use message::{
    decode, decode_handshake, encode, encode_handshake, Envelope, Message, HANDSHAKE_ID,
    PROTOCOL_VERSION,
};
