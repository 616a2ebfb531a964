//! Lazy value sequences and cancellation.
//!
//! Streams are single-pass: a [`ValueStream`] yields elements until it ends
//! or fails, backed by a bounded channel so producers feel backpressure.
//! Output-streaming commands return one; input-streaming commands consume
//! one. [`CancelToken`] is the cooperative cancellation primitive checked at
//! suspension points.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

use crate::error::{Result, RpcError};
use crate::value::Value;

/// Channel capacity between a stream producer and its consumer.
pub const STREAM_BUFFER: usize = 16;

/// A lazy, single-pass sequence of values.
pub struct ValueStream {
    rx: mpsc::Receiver<Result<Value>>,
}

impl ValueStream {
    /// Create a connected sender/stream pair.
    pub fn channel() -> (StreamSender, ValueStream) {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        (StreamSender { tx }, ValueStream { rx })
    }

    /// A stream over an in-memory list of values.
    pub fn from_values<I>(values: I) -> ValueStream
    where
        I: IntoIterator<Item = Value> + Send + 'static,
        I::IntoIter: Send,
    {
        Self::spawn(|tx| async move {
            for value in values {
                tx.send(value).await?;
            }
            Ok(())
        })
    }

    /// Spawn a producer task feeding a new stream.
    ///
    /// If the producer returns an error it becomes the stream's terminal
    /// error. A dropped consumer surfaces as [`RpcError::Cancelled`] from
    /// [`StreamSender::send`], which ends the producer quietly.
    pub fn spawn<F, Fut>(producer: F) -> ValueStream
    where
        F: FnOnce(StreamSender) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, stream) = Self::channel();
        tokio::spawn(async move {
            let failer = tx.clone();
            if let Err(err) = producer(tx).await {
                if !matches!(err, RpcError::Cancelled) {
                    failer.fail(err).await;
                }
            }
        });
        stream
    }

    /// Next element: `Some(Ok(v))` per value, `Some(Err(e))` on terminal
    /// failure, `None` on normal end. Single-pass; not restartable.
    pub async fn next(&mut self) -> Option<Result<Value>> {
        self.rx.recv().await
    }

    /// Drain the rest of the stream into a vector.
    pub async fn collect(mut self) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }
}

impl std::fmt::Debug for ValueStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ValueStream")
    }
}

/// Producer half of a [`ValueStream`].
#[derive(Clone)]
pub struct StreamSender {
    tx: mpsc::Sender<Result<Value>>,
}

impl StreamSender {
    /// Send one element, awaiting buffer space.
    ///
    /// Returns [`RpcError::Cancelled`] when the consumer is gone, so
    /// producers stop at their next yield point.
    pub async fn send(&self, value: Value) -> Result<()> {
        self.tx
            .send(Ok(value))
            .await
            .map_err(|_| RpcError::Cancelled)
    }

    /// Terminate the stream with an error.
    pub async fn fail(&self, err: RpcError) {
        let _ = self.tx.send(Err(err)).await;
    }

    /// True once the consumer has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation flag shared between a call's tasks.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<CancelInner>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    /// Trip the token and wake every waiter.
    pub fn cancel(&self) {
        self.0.flag.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.flag.load(Ordering::SeqCst)
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            // Register interest before re-checking to avoid a lost wakeup.
            let notified = self.0.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_values() {
        let stream = ValueStream::from_values(vec![Value::Int(1), Value::Int(2)]);
        let items = stream.collect().await.unwrap();
        assert_eq!(items, vec![Value::Int(1), Value::Int(2)]);
    }

    #[tokio::test]
    async fn test_spawn_producer() {
        let stream = ValueStream::spawn(|tx| async move {
            for i in 0..5 {
                tx.send(Value::Int(i)).await?;
            }
            Ok(())
        });
        let items = stream.collect().await.unwrap();
        assert_eq!(items.len(), 5);
    }

    #[tokio::test]
    async fn test_producer_error_is_terminal() {
        let mut stream = ValueStream::spawn(|tx| async move {
            tx.send(Value::Int(1)).await?;
            Err(RpcError::Command("boom".into()))
        });
        assert_eq!(stream.next().await.unwrap().unwrap(), Value::Int(1));
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::Command(_)));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_consumer_cancels_producer() {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let stream = ValueStream::spawn(|tx| async move {
            let mut i = 0i64;
            loop {
                if let Err(err) = tx.send(Value::Int(i)).await {
                    let _ = done_tx.send(i);
                    return Err(err);
                }
                i += 1;
            }
        });
        drop(stream);
        // Producer notices within a buffer's worth of sends.
        let stopped_at = done_rx.await.unwrap();
        assert!(stopped_at <= STREAM_BUFFER as i64 + 1);
    }

    #[tokio::test]
    async fn test_cancel_token_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(handle.await.unwrap());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_before_wait_resolves_immediately() {
        let token = CancelToken::new();
        token.cancel();
        token.cancelled().await;
    }
}
