//! Dedicated writer task for the connection send path.
//!
//! The writer is the single owner of a connection's [`MsgWriter`]; call
//! workers enqueue pre-encoded frames through a cloneable [`WriterHandle`].
//! The channel is bounded, so a slow transport backpressures the producing
//! worker instead of queueing without limit.
//!
//! ```text
//! worker 1 ─┐
//! worker 2 ─┼─► mpsc::Sender<OutboundFrame> ─► writer task ─► transport
//! worker N ─┘
//! ```

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, RpcError};
use crate::transport::MsgWriter;

/// Frames buffered toward the transport before senders block.
pub const WRITER_QUEUE: usize = 64;

/// A frame ready to be written, already codec-encoded.
#[derive(Debug)]
pub struct OutboundFrame {
    pub id: u64,
    pub bytes: Bytes,
}

/// Handle for enqueueing frames to the writer task.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
}

impl WriterHandle {
    /// Enqueue a frame, awaiting space if the writer is congested.
    pub async fn send(&self, id: u64, bytes: Bytes) -> Result<()> {
        self.tx
            .send(OutboundFrame { id, bytes })
            .await
            .map_err(|_| RpcError::ConnectionClosed)
    }

    /// Enqueue without waiting. Used from `Drop` paths where blocking is
    /// not an option; a full queue drops the frame.
    pub fn try_send(&self, id: u64, bytes: Bytes) -> Result<()> {
        self.tx
            .try_send(OutboundFrame { id, bytes })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => {
                    RpcError::Transport("writer queue full".into())
                }
                mpsc::error::TrySendError::Closed(_) => RpcError::ConnectionClosed,
            })
    }
}

/// Spawn the writer task owning `writer`.
///
/// The task exits when every handle is dropped (clean shutdown) or the
/// transport fails; the returned join handle reports which.
pub fn spawn_writer(writer: MsgWriter) -> (WriterHandle, JoinHandle<Result<()>>) {
    let (tx, rx) = mpsc::channel(WRITER_QUEUE);
    let task = tokio::spawn(writer_loop(rx, writer));
    (WriterHandle { tx }, task)
}

async fn writer_loop(mut rx: mpsc::Receiver<OutboundFrame>, mut writer: MsgWriter) -> Result<()> {
    while let Some(frame) = rx.recv().await {
        if let Err(err) = writer.send(frame.id, frame.bytes).await {
            tracing::debug!(error = %err, "writer task stopping");
            return Err(err);
        }
    }
    writer.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MsgConnection;

    fn duplex_pair() -> (MsgConnection, MsgConnection) {
        let (a, b) = tokio::io::duplex(4096);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (
            MsgConnection::from_stream(ar, aw, "a".into()),
            MsgConnection::from_stream(br, bw, "b".into()),
        )
    }

    #[tokio::test]
    async fn test_writer_sends_frames() {
        let (conn_a, mut conn_b) = duplex_pair();
        let (_reader, writer, _tracker, _peer) = conn_a.into_parts();
        let (handle, task) = spawn_writer(writer);

        handle.send(1, Bytes::from_static(b"one")).await.unwrap();
        handle.send(2, Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(&conn_b.reader.recv().await.unwrap().unwrap()[..], b"one");
        assert_eq!(&conn_b.reader.recv().await.unwrap().unwrap()[..], b"two");

        drop(handle);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_handle_drop() {
        let (conn_a, conn_b) = duplex_pair();
        let (_reader, writer, _tracker, _peer) = conn_a.into_parts();
        let (handle, task) = spawn_writer(writer);

        drop(handle);
        assert!(task.await.unwrap().is_ok());
        drop(conn_b);
    }

    #[tokio::test]
    async fn test_try_send() {
        let (conn_a, mut conn_b) = duplex_pair();
        let (_reader, writer, _tracker, _peer) = conn_a.into_parts();
        let (handle, _task) = spawn_writer(writer);

        handle.try_send(1, Bytes::from_static(b"x")).unwrap();
        assert_eq!(&conn_b.reader.recv().await.unwrap().unwrap()[..], b"x");
    }
}
