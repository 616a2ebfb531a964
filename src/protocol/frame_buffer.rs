//! Frame accumulation for length-delimited byte streams.
//!
//! TCP and Unix transports carry each message as a 4-byte big-endian length
//! prefix followed by the codec-encoded body. Reads arrive in arbitrary
//! chunks, so a state machine buffers partial data:
//!
//! - `WaitingForLength`: need the 4 prefix bytes
//! - `WaitingForBody`: length parsed, need N more body bytes
//!
//! Uses `bytes::BytesMut` so completed frames are split off without copying.

use bytes::{Bytes, BytesMut};

use crate::error::{Result, RpcError};

/// Length prefix size in bytes.
pub const LENGTH_PREFIX: usize = 4;

/// Default maximum frame body size (64 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForLength,
    WaitingForBody { remaining: u32 },
}

/// Buffer that accumulates raw reads and yields complete frame bodies.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_frame_size: u32,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
            state: State::WaitingForLength,
            max_frame_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Fragmented data is retained for the next push. Frames larger than the
    /// configured maximum are a protocol error.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Bytes>> {
        match self.state {
            State::WaitingForLength => {
                if self.buffer.len() < LENGTH_PREFIX {
                    return Ok(None);
                }

                let len = u32::from_be_bytes([
                    self.buffer[0],
                    self.buffer[1],
                    self.buffer[2],
                    self.buffer[3],
                ]);
                if len > self.max_frame_size {
                    return Err(RpcError::Protocol(format!(
                        "frame of {len} bytes exceeds maximum {}",
                        self.max_frame_size
                    )));
                }

                let _ = self.buffer.split_to(LENGTH_PREFIX);

                if len == 0 {
                    return Ok(Some(Bytes::new()));
                }

                self.state = State::WaitingForBody { remaining: len };
                self.try_extract_one()
            }

            State::WaitingForBody { remaining } => {
                let remaining = remaining as usize;
                if self.buffer.len() < remaining {
                    return Ok(None);
                }

                let body = self.buffer.split_to(remaining).freeze();
                self.state = State::WaitingForLength;
                Ok(Some(body))
            }
        }
    }

    /// Number of buffered bytes not yet part of a complete frame.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// True when the buffer holds a partially received frame.
    pub fn mid_frame(&self) -> bool {
        !self.buffer.is_empty() || matches!(self.state, State::WaitingForBody { .. })
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a complete length-prefixed frame as a single byte vector.
pub fn build_frame(body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(LENGTH_PREFIX + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(body);
    buf
}
