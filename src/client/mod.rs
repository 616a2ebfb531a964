//! Client module - connection management and the call primitive.
//!
//! A [`Client`] lazily opens one connection to the configured endpoint,
//! performs the codec handshake (unless a codec is pinned), and multiplexes
//! calls over it. A reader task routes inbound frames to per-call inboxes;
//! a writer task owns the send path.
//!
//! Only connection establishment is retried. Once a `CALL` has been sent it
//! is never retransmitted: failures surface to the caller (at-most-once).

mod proxy;

pub use proxy::ServiceProxy;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::Codec;
use crate::error::{Result, RpcError};
use crate::protocol::{self, Envelope, Message, HANDSHAKE_ID, PROTOCOL_VERSION};
use crate::stream::{CancelToken, ValueStream};
use crate::transport::{self, CallTracker, MsgReader};
use crate::url::{Scheme, Url};
use crate::value::{TypeTag, Value};
use crate::writer::{spawn_writer, WriterHandle};

/// Per-call inbox capacity.
const CALL_INBOX: usize = 32;

/// Client configuration with defaulted fields; no process-wide globals.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Endpoint to connect to.
    pub url: Url,
    /// Pin a codec and skip the handshake; `None` negotiates.
    pub codec: Option<Codec>,
    /// Connection-establishment retries after the first attempt.
    pub retry_count: u32,
    /// Pause between establishment retries.
    pub retry_interval: Duration,
    /// Connection-establishment timeout.
    pub connect_timeout: Duration,
    /// Default per-call deadline; `None` waits indefinitely.
    pub call_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            url: Url::default(),
            codec: None,
            retry_count: 0,
            retry_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            call_timeout: None,
        }
    }
}

/// An RPC client. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    conn: tokio::sync::Mutex<Option<Arc<Connection>>>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                config,
                conn: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Client for `url` with otherwise default configuration.
    pub fn connect_to(url: &str) -> Result<Client> {
        Ok(Client::new(ClientConfig {
            url: url.parse()?,
            ..ClientConfig::default()
        }))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Establish the connection eagerly (it is otherwise opened on first
    /// call).
    pub async fn connect(&self) -> Result<()> {
        self.connection().await.map(|_| ())
    }

    /// Close the connection. Open calls fail; the next call reconnects.
    pub async fn close(&self) {
        if let Some(conn) = self.inner.conn.lock().await.take() {
            conn.shutdown();
        }
    }

    pub(crate) async fn connection(&self) -> Result<Arc<Connection>> {
        let mut guard = self.inner.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
        }

        let config = &self.inner.config;
        let mut attempt = 0u32;
        let conn = loop {
            match Connection::open(config).await {
                Ok(conn) => break Arc::new(conn),
                Err(err) if err.is_transport() && attempt < config.retry_count => {
                    attempt += 1;
                    tracing::warn!(
                        error = %err,
                        attempt,
                        of = config.retry_count,
                        "connect failed, retrying"
                    );
                    tokio::time::sleep(config.retry_interval).await;
                }
                Err(err) => return Err(err),
            }
        };
        *guard = Some(conn.clone());
        Ok(conn)
    }

    pub(crate) async fn start_call(
        &self,
        service: &str,
        command: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        opts: CallOptions,
    ) -> Result<CallOutcome> {
        let conn = self.connection().await?;
        conn.start_call(service, command, args, kwargs, opts).await
    }
}

/// Options for one call.
pub(crate) struct CallOptions {
    pub input: Option<ValueStream>,
    pub expect_stream: bool,
    /// Element tag for coercing received chunks.
    pub chunk_tag: Option<TypeTag>,
    pub timeout: Option<Duration>,
}

/// What a call produced.
pub(crate) enum CallOutcome {
    Value(Value),
    Stream(CallStream),
}

struct PendingCall {
    tx: mpsc::Sender<Message>,
    cancel: CancelToken,
}

#[derive(Default)]
struct ConnShared {
    calls: Mutex<HashMap<u64, PendingCall>>,
    closed: AtomicBool,
}

pub(crate) struct Connection {
    codec: Codec,
    writer: WriterHandle,
    shared: Arc<ConnShared>,
    tracker: CallTracker,
    next_id: AtomicU64,
    reader_task: JoinHandle<()>,
}

impl Connection {
    async fn open(config: &ClientConfig) -> Result<Connection> {
        let conn = transport::connect(&config.url, config.connect_timeout).await?;
        let (mut reader, mut writer, tracker, peer) = conn.into_parts();

        let codec = match config.codec {
            Some(pinned) => pinned,
            None => {
                tracker.open(HANDSHAKE_ID);
                let hello = Message::Hello {
                    codecs: Codec::SUPPORTED.iter().map(|s| s.to_string()).collect(),
                    version: PROTOCOL_VERSION.into(),
                };
                writer
                    .send(HANDSHAKE_ID, protocol::encode_handshake(&hello)?)
                    .await?;
                let frame = reader
                    .recv()
                    .await?
                    .ok_or(RpcError::ConnectionClosed)?;
                let env = protocol::decode_handshake(&frame)?;
                tracker.close(HANDSHAKE_ID);
                match env.msg {
                    Message::Welcome { codec, .. } => {
                        Codec::by_name(&codec).ok_or_else(|| {
                            RpcError::Protocol(format!("server chose unknown codec {codec}"))
                        })?
                    }
                    Message::Error {
                        kind,
                        message,
                        traceback,
                    } => return Err(RpcError::from_wire(kind, message, traceback)),
                    other => {
                        return Err(RpcError::Protocol(format!(
                            "expected WELCOME, got {}",
                            other.kind_name()
                        )))
                    }
                }
            }
        };
        writer.set_codec(codec.name());
        tracing::debug!(peer = %peer, codec = %codec, "client connected");

        let shared = Arc::new(ConnShared::default());
        let (writer_handle, _writer_task) = spawn_writer(writer);
        let reader_task = tokio::spawn(reader_loop(reader, shared.clone(), codec));

        // Client-originated ids are odd. Over the HTTP carrier the server
        // correlates call state by id alone, so start from a scattered
        // point instead of 1 to keep independent clients apart.
        let first_id = match config.url.scheme() {
            Scheme::Http => seed_odd_id(),
            _ => 1,
        };

        Ok(Connection {
            codec,
            writer: writer_handle,
            shared,
            tracker,
            next_id: AtomicU64::new(first_id),
            reader_task,
        })
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn retire(&self, id: u64) {
        self.shared.calls.lock().expect("calls lock").remove(&id);
        self.tracker.close(id);
    }

    fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.reader_task.abort();
        let pending: Vec<PendingCall> = {
            let mut calls = self.shared.calls.lock().expect("calls lock");
            calls.drain().map(|(_, call)| call).collect()
        };
        for call in pending {
            call.cancel.cancel();
        }
    }

    async fn start_call(
        self: &Arc<Self>,
        service: &str,
        command: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        opts: CallOptions,
    ) -> Result<CallOutcome> {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }

        let id = self.next_id.fetch_add(2, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(CALL_INBOX);
        let cancel = CancelToken::new();
        self.shared.calls.lock().expect("calls lock").insert(
            id,
            PendingCall {
                tx,
                cancel: cancel.clone(),
            },
        );
        self.tracker.open(id);

        let call_msg = Message::Call {
            service: service.to_string(),
            command: command.to_string(),
            args,
            kwargs,
            has_input_stream: opts.input.is_some(),
        };
        let frame = match protocol::encode(self.codec, id, &call_msg) {
            Ok(frame) => frame,
            Err(err) => {
                self.retire(id);
                return Err(err);
            }
        };
        if let Err(err) = self.writer.send(id, frame).await {
            self.retire(id);
            return Err(err);
        }

        if let Some(input) = opts.input {
            tokio::spawn(pump_input(
                self.writer.clone(),
                self.codec,
                id,
                input,
                cancel.clone(),
            ));
        }

        let deadline = opts.timeout.map(|t| tokio::time::Instant::now() + t);
        let mut call = CallHandle {
            conn: self.clone(),
            id,
            rx,
            cancel,
            deadline,
            finished: false,
        };

        if opts.expect_stream {
            Ok(CallOutcome::Stream(CallStream {
                call,
                tag: opts.chunk_tag,
            }))
        } else {
            call.await_reply().await.map(CallOutcome::Value)
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn reader_loop(mut reader: MsgReader, shared: Arc<ConnShared>, codec: Codec) {
    let reason = loop {
        match reader.recv().await {
            Ok(Some(frame)) => match protocol::decode(codec, &frame) {
                Ok(env) => deliver(&shared, env).await,
                Err(err) => {
                    tracing::warn!(error = %err, "undecodable frame, closing");
                    break err;
                }
            },
            Ok(None) => break RpcError::ConnectionClosed,
            Err(err) => break err,
        }
    };
    tracing::debug!(reason = %reason, "client reader stopping");

    shared.closed.store(true, Ordering::SeqCst);
    // Open calls observe the close through their dropped inbox senders.
    let pending: Vec<PendingCall> = {
        let mut calls = shared.calls.lock().expect("calls lock");
        calls.drain().map(|(_, call)| call).collect()
    };
    for call in pending {
        call.cancel.cancel();
    }
}

async fn deliver(shared: &Arc<ConnShared>, env: Envelope) {
    let tx = {
        let calls = shared.calls.lock().expect("calls lock");
        calls.get(&env.id).map(|call| call.tx.clone())
    };
    match tx {
        // A slow consumer backpressures the reader here, per call.
        Some(tx) => {
            let _ = tx.send(env.msg).await;
        }
        None => tracing::debug!(id = env.id, "frame for retired call dropped"),
    }
}

/// Send each input element as `CHUNK`, then `END`; abandon with `ERROR` if
/// the local stream fails. Stops silently once the call is finished.
async fn pump_input(
    writer: WriterHandle,
    codec: Codec,
    id: u64,
    mut input: ValueStream,
    cancel: CancelToken,
) {
    loop {
        let item = tokio::select! {
            item = input.next() => item,
            () = cancel.cancelled() => return,
        };
        match item {
            Some(Ok(value)) => {
                if send_msg(&writer, codec, id, &Message::Chunk { value })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Some(Err(err)) => {
                let _ = send_msg(&writer, codec, id, &Message::error(&err, None)).await;
                return;
            }
            None => {
                let _ = send_msg(&writer, codec, id, &Message::End).await;
                return;
            }
        }
    }
}

async fn send_msg(writer: &WriterHandle, codec: Codec, id: u64, msg: &Message) -> Result<()> {
    let frame = protocol::encode(codec, id, msg)?;
    writer.send(id, frame).await
}

/// Scattered odd starting id, mixed from the clock and pid.
fn seed_odd_id() -> u64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let pid = std::process::id() as u64;
    (nanos.wrapping_mul(0x517cc1b727220a95) ^ pid) & 0x3fff_ffff_ffff_ffff | 1
}

/// Client-side state for one in-flight call.
struct CallHandle {
    conn: Arc<Connection>,
    id: u64,
    rx: mpsc::Receiver<Message>,
    cancel: CancelToken,
    deadline: Option<tokio::time::Instant>,
    finished: bool,
}

impl CallHandle {
    async fn next_msg(&mut self) -> Result<Message> {
        let msg = match self.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(msg) => msg,
                Err(_) => return Err(RpcError::Timeout),
            },
            None => self.rx.recv().await,
        };
        msg.ok_or(RpcError::ConnectionClosed)
    }

    async fn await_reply(&mut self) -> Result<Value> {
        let msg = match self.next_msg().await {
            Ok(msg) => msg,
            Err(err) => {
                self.abort(matches!(err, RpcError::Timeout));
                return Err(err);
            }
        };
        match msg {
            Message::Reply { value } => {
                self.finish();
                Ok(value)
            }
            Message::Error {
                kind,
                message,
                traceback,
            } => {
                self.finish();
                Err(RpcError::from_wire(kind, message, traceback))
            }
            Message::Cancel => {
                self.finish();
                Err(RpcError::Cancelled)
            }
            other => {
                // CHUNK or END on a unary call is protocol misuse.
                self.abort(true);
                Err(RpcError::Protocol(format!(
                    "unary call received {}",
                    other.kind_name()
                )))
            }
        }
    }

    /// Mark terminal: stop the pump, retire the id.
    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.cancel.cancel();
        self.conn.retire(self.id);
    }

    /// Finish early, optionally asking the peer to stop too.
    fn abort(&mut self, send_cancel: bool) {
        if self.finished {
            return;
        }
        if send_cancel {
            if let Ok(frame) = protocol::encode(self.conn.codec, self.id, &Message::Cancel) {
                // Usually there is queue space; fall back to a task so a
                // congested writer cannot swallow the cancel.
                if self.conn.writer.try_send(self.id, frame.clone()).is_err() {
                    if let Ok(rt) = tokio::runtime::Handle::try_current() {
                        let writer = self.conn.writer.clone();
                        let id = self.id;
                        rt.spawn(async move {
                            let _ = writer.send(id, frame).await;
                        });
                    }
                }
            }
        }
        self.finish();
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        // Dropping an unfinished call is an implicit cancel.
        self.abort(true);
    }
}

/// A lazy sequence of results from an output-streaming call.
///
/// Yields one value per received `CHUNK`; ends on `END`; raises on `ERROR`.
/// Dropping the stream before its end sends `CANCEL` to the server.
pub struct CallStream {
    call: CallHandle,
    tag: Option<TypeTag>,
}

impl CallStream {
    /// Next element, or `None` after the stream's normal end.
    pub async fn next(&mut self) -> Option<Result<Value>> {
        if self.call.finished {
            return None;
        }
        let msg = match self.call.next_msg().await {
            Ok(msg) => msg,
            Err(err) => {
                self.call.abort(matches!(err, RpcError::Timeout));
                return Some(Err(err));
            }
        };
        match msg {
            Message::Chunk { value } => match &self.tag {
                Some(tag) => match tag.coerce(value) {
                    Ok(value) => Some(Ok(value)),
                    Err(err) => {
                        self.call.abort(true);
                        Some(Err(err))
                    }
                },
                None => Some(Ok(value)),
            },
            Message::End => {
                self.call.finish();
                None
            }
            Message::Error {
                kind,
                message,
                traceback,
            } => {
                self.call.finish();
                Some(Err(RpcError::from_wire(kind, message, traceback)))
            }
            Message::Cancel => {
                self.call.finish();
                Some(Err(RpcError::Cancelled))
            }
            other => {
                self.call.abort(true);
                Some(Err(RpcError::Protocol(format!(
                    "stream call received {}",
                    other.kind_name()
                ))))
            }
        }
    }

    /// Drain the remaining elements.
    pub async fn collect(mut self) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    /// Stop consuming and ask the server to stop producing.
    pub fn cancel(mut self) {
        self.call.abort(true);
    }
}

impl std::fmt::Debug for CallStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallStream")
            .field("id", &self.call.id)
            .field("finished", &self.call.finished)
            .finish()
    }
}
