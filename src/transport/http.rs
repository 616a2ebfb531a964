//! HTTP transport.
//!
//! HTTP here is a carrier, not a REST mapping: each request body holds one
//! logical frame (or is empty, which makes the request a poll), and each
//! response body holds at most one frame. Requests carry the headers
//! `X-Snekrpc-Codec` and `X-Snekrpc-Call-Id`; the server keeps per-call
//! outboxes correlated by call id and hands queued frames back one per
//! poll response.
//!
//! Each client HTTP connection is one logical RPC connection. The client
//! runs a poll task that repeatedly asks the server for pending frames of
//! every call the core has marked open via [`CallTracker`]; an empty
//! response body means "nothing pending". Data posts are acknowledged with
//! an empty body, so per-call frame order is preserved by the single,
//! sequential poll loop.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use super::{MsgConnection, MsgReader, MsgWriter};
use crate::error::{Result, RpcError};
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::url::Url;

/// Codec name header, set on every client request.
pub const HEADER_CODEC: &str = "x-snekrpc-codec";
/// Call id header correlating frames with call state.
pub const HEADER_CALL_ID: &str = "x-snekrpc-call-id";

/// Client backoff after a poll round that returned nothing.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Per-call outbox bound; writers wait for space beyond this.
const OUTBOX_CAP: usize = 64;

/// Frames buffered between the transport and the engine.
const INBOX_CAP: usize = 64;

// ---------------------------------------------------------------------------
// Call tracking (client side)
// ---------------------------------------------------------------------------

struct TrackerInner {
    ids: std::sync::Mutex<BTreeSet<u64>>,
    notify: Notify,
}

/// The set of call ids currently awaiting peer frames.
///
/// Stream transports ignore it (frames just arrive); the HTTP carrier polls
/// the server for exactly these ids.
#[derive(Clone)]
pub struct CallTracker(Option<Arc<TrackerInner>>);

impl CallTracker {
    pub(crate) fn new() -> CallTracker {
        CallTracker(Some(Arc::new(TrackerInner {
            ids: std::sync::Mutex::new(BTreeSet::new()),
            notify: Notify::new(),
        })))
    }

    pub(crate) fn disabled() -> CallTracker {
        CallTracker(None)
    }

    /// Mark a call as awaiting frames from the peer.
    pub fn open(&self, id: u64) {
        if let Some(inner) = &self.0 {
            inner.ids.lock().expect("tracker lock").insert(id);
            inner.notify.notify_waiters();
        }
    }

    /// Mark a call as retired.
    pub fn close(&self, id: u64) {
        if let Some(inner) = &self.0 {
            inner.ids.lock().expect("tracker lock").remove(&id);
        }
    }

    /// Wait until at least one call is open, then snapshot the set.
    async fn wait_open(&self) -> Vec<u64> {
        let inner = self.0.as_ref().expect("tracker is enabled");
        loop {
            let notified = inner.notify.notified();
            let snapshot: Vec<u64> = inner
                .ids
                .lock()
                .expect("tracker lock")
                .iter()
                .copied()
                .collect();
            if !snapshot.is_empty() {
                return snapshot;
            }
            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

struct OutboxState {
    queues: HashMap<u64, VecDeque<Bytes>>,
    closed: bool,
}

/// Per-call outbound frame queues for one logical connection.
struct Outboxes {
    state: std::sync::Mutex<OutboxState>,
    space: Notify,
}

impl Outboxes {
    fn new() -> Outboxes {
        Outboxes {
            state: std::sync::Mutex::new(OutboxState {
                queues: HashMap::new(),
                closed: false,
            }),
            space: Notify::new(),
        }
    }

    async fn push(&self, id: u64, frame: Bytes) -> Result<()> {
        loop {
            let notified = self.space.notified();
            {
                let mut state = self.state.lock().expect("outbox lock");
                if state.closed {
                    return Err(RpcError::ConnectionClosed);
                }
                let queue = state.queues.entry(id).or_default();
                if queue.len() < OUTBOX_CAP {
                    queue.push_back(frame);
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    fn try_pop(&self, id: u64) -> Option<Bytes> {
        let mut state = self.state.lock().expect("outbox lock");
        let queue = state.queues.get_mut(&id)?;
        let frame = queue.pop_front();
        if queue.is_empty() {
            state.queues.remove(&id);
        }
        if frame.is_some() {
            self.space.notify_waiters();
        }
        frame
    }

    fn close(&self) {
        self.state.lock().expect("outbox lock").closed = true;
        self.space.notify_waiters();
    }
}

/// Server writer half: frames queue in the connection's outboxes.
pub struct OutboxSendHalf {
    outboxes: Arc<Outboxes>,
}

impl OutboxSendHalf {
    pub(crate) async fn send(&self, id: u64, frame: Bytes) -> Result<()> {
        self.outboxes.push(id, frame).await
    }
}

pub struct HttpMsgListener {
    conns: mpsc::Receiver<MsgConnection>,
    _accept: JoinHandle<()>,
}

impl HttpMsgListener {
    pub async fn bind(url: &Url) -> Result<(HttpMsgListener, Url)> {
        let listener = TcpListener::bind(url.addr()).await?;
        let bound = url.with_port(listener.local_addr()?.port());
        tracing::info!(url = %bound, "listening");

        let (conn_tx, conn_rx) = mpsc::channel(16);
        let accept = tokio::spawn(async move {
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(error = %err, "http accept failed");
                        continue;
                    }
                };
                tokio::spawn(serve_client(stream, addr.to_string(), conn_tx.clone()));
            }
        });

        Ok((
            HttpMsgListener {
                conns: conn_rx,
                _accept: accept,
            },
            bound,
        ))
    }

    pub async fn accept(&mut self) -> Result<MsgConnection> {
        self.conns
            .recv()
            .await
            .ok_or_else(|| RpcError::Transport("http listener closed".into()))
    }
}

impl Drop for HttpMsgListener {
    fn drop(&mut self) {
        self._accept.abort();
    }
}

async fn serve_client(stream: TcpStream, peer: String, conn_tx: mpsc::Sender<MsgConnection>) {
    let _ = stream.set_nodelay(true);
    tracing::debug!(peer = %peer, "connection accepted");

    let (inbox_tx, inbox_rx) = mpsc::channel::<Bytes>(INBOX_CAP);
    let outboxes = Arc::new(Outboxes::new());

    let conn = MsgConnection {
        reader: MsgReader::Channel(inbox_rx),
        writer: MsgWriter::HttpServer(OutboxSendHalf {
            outboxes: outboxes.clone(),
        }),
        tracker: CallTracker::disabled(),
        peer: peer.clone(),
    };
    if conn_tx.send(conn).await.is_err() {
        return;
    }

    let service_outboxes = outboxes.clone();
    let service = service_fn(move |req| {
        let inbox = inbox_tx.clone();
        let outboxes = service_outboxes.clone();
        async move { handle_request(req, inbox, outboxes).await }
    });

    if let Err(err) = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        tracing::debug!(peer = %peer, error = %err, "http connection ended");
    }
    outboxes.close();
    tracing::debug!(peer = %peer, "disconnected");
}

async fn handle_request(
    req: Request<Incoming>,
    inbox: mpsc::Sender<Bytes>,
    outboxes: Arc<Outboxes>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let call_id = req
        .headers()
        .get(HEADER_CALL_ID)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let call_id = match call_id {
        Some(id) => id,
        None => return Ok(status_response(StatusCode::BAD_REQUEST)),
    };

    let body = req.into_body().collect().await?.to_bytes();
    if body.len() > DEFAULT_MAX_FRAME_SIZE as usize {
        return Ok(status_response(StatusCode::PAYLOAD_TOO_LARGE));
    }

    if body.is_empty() {
        // Poll: return the next pending frame for this call, if any.
        return Ok(match outboxes.try_pop(call_id) {
            Some(frame) => frame_response(call_id, frame),
            None => status_response(StatusCode::OK),
        });
    }

    // Data: feed the frame to the engine and acknowledge with an empty body.
    if inbox.send(body).await.is_err() {
        return Ok(status_response(StatusCode::SERVICE_UNAVAILABLE));
    }
    Ok(status_response(StatusCode::OK))
}

fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .expect("static response")
}

fn frame_response(call_id: u64, frame: Bytes) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/octet-stream")
        .header(HEADER_CALL_ID, call_id.to_string())
        .body(Full::new(frame))
        .expect("frame response")
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

type SendRequest = hyper::client::conn::http1::SendRequest<Full<Bytes>>;

/// Client writer half: each frame becomes a POST.
pub struct HttpSendHalf {
    sender: Arc<tokio::sync::Mutex<SendRequest>>,
    authority: String,
    codec: Arc<std::sync::Mutex<String>>,
    closed: Arc<AtomicBool>,
}

impl HttpSendHalf {
    pub(crate) fn set_codec(&mut self, name: &str) {
        *self.codec.lock().expect("codec lock") = name.to_string();
    }

    pub(crate) async fn send(&self, id: u64, frame: Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::ConnectionClosed);
        }
        let codec = self.codec.lock().expect("codec lock").clone();
        let response = post(&self.sender, &self.authority, &codec, id, frame).await;
        match response {
            Ok(_) => Ok(()),
            Err(err) => {
                self.closed.store(true, Ordering::SeqCst);
                Err(err)
            }
        }
    }
}

async fn post(
    sender: &Arc<tokio::sync::Mutex<SendRequest>>,
    authority: &str,
    codec: &str,
    id: u64,
    frame: Bytes,
) -> Result<Bytes> {
    let request = Request::builder()
        .method(Method::POST)
        .uri("/")
        .header("host", authority)
        .header(HEADER_CODEC, codec)
        .header(HEADER_CALL_ID, id.to_string())
        .body(Full::new(frame))
        .map_err(|err| RpcError::Transport(format!("http request build failed: {err}")))?;

    let response = {
        let mut sender = sender.lock().await;
        sender
            .send_request(request)
            .await
            .map_err(|err| RpcError::Transport(format!("http request failed: {err}")))?
    };

    let status = response.status();
    if !status.is_success() {
        return Err(RpcError::Transport(format!("http status {status}")));
    }
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|err| RpcError::Transport(format!("http body read failed: {err}")))?
        .to_bytes();
    Ok(body)
}

pub async fn connect(url: &Url) -> Result<MsgConnection> {
    let stream = TcpStream::connect(url.addr()).await?;
    stream.set_nodelay(true)?;
    let authority = url.addr();

    let (sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|err| RpcError::Transport(format!("http handshake failed: {err}")))?;

    let closed = Arc::new(AtomicBool::new(false));
    {
        let closed = closed.clone();
        tokio::spawn(async move {
            let _ = connection.await;
            closed.store(true, Ordering::SeqCst);
        });
    }

    let sender = Arc::new(tokio::sync::Mutex::new(sender));
    let codec = Arc::new(std::sync::Mutex::new("msgpack".to_string()));
    let tracker = CallTracker::new();
    let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAP);

    tokio::spawn(poll_loop(
        sender.clone(),
        authority.clone(),
        codec.clone(),
        tracker.clone(),
        inbox_tx,
        closed.clone(),
    ));

    tracing::debug!(peer = %authority, "connected");
    Ok(MsgConnection {
        reader: MsgReader::Channel(inbox_rx),
        writer: MsgWriter::HttpClient(HttpSendHalf {
            sender,
            authority: authority.clone(),
            codec,
            closed,
        }),
        tracker,
        peer: authority,
    })
}

/// Fetch pending server frames for every open call, in call-id order.
///
/// A single sequential loop keeps per-call delivery ordered; the backoff
/// only applies after a round in which nothing arrived.
async fn poll_loop(
    sender: Arc<tokio::sync::Mutex<SendRequest>>,
    authority: String,
    codec: Arc<std::sync::Mutex<String>>,
    tracker: CallTracker,
    inbox: mpsc::Sender<Bytes>,
    closed: Arc<AtomicBool>,
) {
    loop {
        if closed.load(Ordering::SeqCst) {
            // Dropping the inbox sender ends the engine's reader.
            return;
        }

        let ids = match tokio::time::timeout(Duration::from_millis(100), tracker.wait_open()).await
        {
            Ok(ids) => ids,
            Err(_) => continue,
        };

        let mut received_any = false;
        for id in ids {
            // Drain a bounded burst per call so one busy stream cannot
            // starve the other calls' polls.
            for _ in 0..OUTBOX_CAP {
                let codec_name = codec.lock().expect("codec lock").clone();
                match post(&sender, &authority, &codec_name, id, Bytes::new()).await {
                    Ok(frame) if frame.is_empty() => break,
                    Ok(frame) => {
                        received_any = true;
                        if inbox.send(frame).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "http poll failed");
                        closed.store(true, Ordering::SeqCst);
                        return;
                    }
                }
            }
        }

        if !received_any {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_outboxes_fifo_per_call() {
        let outboxes = Outboxes::new();
        outboxes.push(1, Bytes::from_static(b"a")).await.unwrap();
        outboxes.push(2, Bytes::from_static(b"x")).await.unwrap();
        outboxes.push(1, Bytes::from_static(b"b")).await.unwrap();

        assert_eq!(outboxes.try_pop(1).unwrap(), Bytes::from_static(b"a"));
        assert_eq!(outboxes.try_pop(1).unwrap(), Bytes::from_static(b"b"));
        assert!(outboxes.try_pop(1).is_none());
        assert_eq!(outboxes.try_pop(2).unwrap(), Bytes::from_static(b"x"));
    }

    #[tokio::test]
    async fn test_outboxes_closed_rejects_push() {
        let outboxes = Outboxes::new();
        outboxes.close();
        let err = outboxes.push(1, Bytes::new()).await.unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_outboxes_backpressure_releases_on_pop() {
        let outboxes = Arc::new(Outboxes::new());
        for _ in 0..OUTBOX_CAP {
            outboxes.push(1, Bytes::from_static(b"f")).await.unwrap();
        }

        let pusher = {
            let outboxes = outboxes.clone();
            tokio::spawn(async move { outboxes.push(1, Bytes::from_static(b"last")).await })
        };
        tokio::task::yield_now().await;
        assert!(!pusher.is_finished());

        assert!(outboxes.try_pop(1).is_some());
        pusher.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_tracker_snapshot_orders_ids() {
        let tracker = CallTracker::new();
        tracker.open(5);
        tracker.open(1);
        tracker.open(3);
        assert_eq!(tracker.wait_open().await, vec![1, 3, 5]);

        tracker.close(3);
        assert_eq!(tracker.wait_open().await, vec![1, 5]);
    }

    #[test]
    fn test_disabled_tracker_is_noop() {
        let tracker = CallTracker::disabled();
        tracker.open(1);
        tracker.close(1);
    }
}
