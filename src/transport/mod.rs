//! Transport module - the framed message plane.
//!
//! A transport delivers whole frames (codec-encoded messages) in FIFO order
//! over a bidirectional connection. The variant set is closed and selected
//! by URL scheme:
//!
//! - `tcp://host:port` - raw sockets, 4-byte big-endian length prefix
//! - `unix:///path` - Unix domain sockets, same framing
//! - `http://host:port` - hyper carrier, one frame per request/response body
//!
//! [`Listener`] accepts [`MsgConnection`]s; [`connect`] produces one. The
//! engine never sees transport internals, only `recv`/`send` of frame
//! bodies tagged with their call id (the id is meaningful to the HTTP
//! carrier, which needs it for its correlation header).

mod http;
mod tcp;
mod unix;

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{Result, RpcError};
use crate::protocol::FrameBuffer;
use crate::url::{Scheme, Url};

pub use http::CallTracker;

/// Read buffer size for stream transports.
const READ_CHUNK: usize = 64 * 1024;

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// A connected, framed, bidirectional message channel.
pub struct MsgConnection {
    pub reader: MsgReader,
    pub writer: MsgWriter,
    tracker: CallTracker,
    peer: String,
}

impl MsgConnection {
    pub(crate) fn from_stream<R, W>(reader: R, writer: W, peer: String) -> MsgConnection
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        MsgConnection {
            reader: MsgReader::Stream(StreamReader::new(Box::new(reader))),
            writer: MsgWriter::Stream(Box::new(writer)),
            tracker: CallTracker::disabled(),
            peer,
        }
    }

    /// Peer address for logging.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Handle the client core uses to tell the transport which calls are
    /// awaiting peer frames. A no-op for stream transports; the HTTP
    /// carrier polls the server for exactly these ids.
    pub fn tracker(&self) -> CallTracker {
        self.tracker.clone()
    }

    /// Split into independently owned halves.
    pub fn into_parts(self) -> (MsgReader, MsgWriter, CallTracker, String) {
        (self.reader, self.writer, self.tracker, self.peer)
    }
}

/// Receiving half of a connection.
pub enum MsgReader {
    /// Byte stream with length-prefix framing (tcp, unix).
    Stream(StreamReader),
    /// Frames delivered by a transport task (http).
    Channel(mpsc::Receiver<Bytes>),
}

impl MsgReader {
    /// Receive the next frame body; `None` on clean end of stream.
    pub async fn recv(&mut self) -> Result<Option<Bytes>> {
        match self {
            MsgReader::Stream(reader) => reader.recv().await,
            MsgReader::Channel(rx) => Ok(rx.recv().await),
        }
    }
}

/// Framed reader over a raw byte stream.
pub struct StreamReader {
    io: BoxedRead,
    frames: FrameBuffer,
    pending: VecDeque<Bytes>,
    chunk: Vec<u8>,
}

impl StreamReader {
    fn new(io: BoxedRead) -> StreamReader {
        StreamReader {
            io,
            frames: FrameBuffer::new(),
            pending: VecDeque::new(),
            chunk: vec![0u8; READ_CHUNK],
        }
    }

    async fn recv(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }

            let n = self.io.read(&mut self.chunk).await?;
            if n == 0 {
                if self.frames.mid_frame() {
                    return Err(RpcError::Protocol("connection closed mid-frame".into()));
                }
                return Ok(None);
            }
            self.pending.extend(self.frames.push(&self.chunk[..n])?);
        }
    }
}

/// Sending half of a connection.
pub enum MsgWriter {
    /// Byte stream with length-prefix framing (tcp, unix).
    Stream(BoxedWrite),
    /// HTTP client carrier: each frame becomes a POST.
    HttpClient(http::HttpSendHalf),
    /// HTTP server carrier: frames queue in per-call outboxes.
    HttpServer(http::OutboxSendHalf),
}

impl MsgWriter {
    /// Send one frame, all-or-nothing, awaiting transport backpressure.
    pub async fn send(&mut self, id: u64, frame: Bytes) -> Result<()> {
        match self {
            MsgWriter::Stream(io) => {
                io.write_all(&(frame.len() as u32).to_be_bytes()).await?;
                io.write_all(&frame).await?;
                io.flush().await?;
                Ok(())
            }
            MsgWriter::HttpClient(half) => half.send(id, frame).await,
            MsgWriter::HttpServer(half) => half.send(id, frame).await,
        }
    }

    /// Record the negotiated codec name (carried in HTTP headers).
    pub fn set_codec(&mut self, name: &str) {
        if let MsgWriter::HttpClient(half) = self {
            half.set_codec(name);
        }
    }

    /// Flush and close the send path.
    pub async fn shutdown(&mut self) {
        if let MsgWriter::Stream(io) = self {
            let _ = io.shutdown().await;
        }
    }
}

/// A bound listener yielding accepted connections.
pub enum Listener {
    Tcp(tcp::TcpMsgListener),
    Unix(unix::UnixMsgListener),
    Http(http::HttpMsgListener),
}

impl Listener {
    /// Bind to `url`. Returns the listener and the effective URL, which
    /// differs from the requested one when port 0 was asked for.
    pub async fn bind(url: &Url) -> Result<(Listener, Url)> {
        match url.scheme() {
            Scheme::Tcp => {
                let (listener, bound) = tcp::TcpMsgListener::bind(url).await?;
                Ok((Listener::Tcp(listener), bound))
            }
            Scheme::Unix => {
                let (listener, bound) = unix::UnixMsgListener::bind(url).await?;
                Ok((Listener::Unix(listener), bound))
            }
            Scheme::Http => {
                let (listener, bound) = http::HttpMsgListener::bind(url).await?;
                Ok((Listener::Http(listener), bound))
            }
        }
    }

    /// Accept the next connection.
    pub async fn accept(&mut self) -> Result<MsgConnection> {
        match self {
            Listener::Tcp(listener) => listener.accept().await,
            Listener::Unix(listener) => listener.accept().await,
            Listener::Http(listener) => listener.accept().await,
        }
    }
}

/// Establish a connection to `url` within `timeout`.
pub async fn connect(url: &Url, timeout: std::time::Duration) -> Result<MsgConnection> {
    let fut = async {
        match url.scheme() {
            Scheme::Tcp => tcp::connect(url).await,
            Scheme::Unix => unix::connect(url).await,
            Scheme::Http => http::connect(url).await,
        }
    };
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(RpcError::Transport(format!("connect to {url} timed out"))),
    }
}
