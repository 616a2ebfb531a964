//! Per-connection dispatcher.
//!
//! Each accepted connection runs three kinds of tasks:
//!
//! - this reader loop, which performs the handshake and then routes every
//!   inbound frame by call id,
//! - one writer task owning the send path (see [`crate::writer`]),
//! - one worker task per call, so a slow command never stalls the reader
//!   or other calls.
//!
//! Workers enqueue outbound frames through the bounded writer channel;
//! sending a `CHUNK` on a congested transport blocks the producing worker,
//! which is the backpressure story. A connection close implicitly cancels
//! every call still open on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::codec::{self, Codec};
use crate::error::{Result, RpcError};
use crate::protocol::{self, Envelope, Message, HANDSHAKE_ID, PROTOCOL_VERSION};
use crate::server::Registry;
use crate::service::{bind_args, CallContext, Reply};
use crate::stream::{CancelToken, StreamSender, ValueStream};
use crate::transport::MsgConnection;
use crate::value::{TypeTag, Value};
use crate::writer::{spawn_writer, WriterHandle};

/// Connection-scoped configuration shared by all dispatcher tasks.
pub(crate) struct ConnContext {
    pub registry: Arc<Registry>,
    /// Codec assumed when a pinned-codec client skips the handshake.
    pub codec: Codec,
    pub expose_tracebacks: bool,
    pub handshake_timeout: Duration,
}

/// Reader-side state for one in-flight call.
struct CallEntry {
    input: Option<StreamSender>,
    element_tag: Option<TypeTag>,
    cancel: CancelToken,
}

type Calls = Arc<Mutex<HashMap<u64, CallEntry>>>;

pub(crate) async fn handle_connection(ctx: Arc<ConnContext>, conn: MsgConnection) {
    let peer = conn.peer().to_string();
    match run_connection(ctx, conn).await {
        Ok(()) => tracing::debug!(peer = %peer, "connection finished"),
        Err(err) if err.is_transport() => {
            tracing::debug!(peer = %peer, error = %err, "connection dropped")
        }
        Err(err) => tracing::warn!(peer = %peer, error = %err, "connection failed"),
    }
}

async fn run_connection(ctx: Arc<ConnContext>, conn: MsgConnection) -> Result<()> {
    let (mut reader, mut writer, _tracker, peer) = conn.into_parts();

    // Handshake: exactly one HELLO precedes any CALL, unless the client
    // pinned a codec and leads with a CALL that decodes under it.
    let first = match tokio::time::timeout(ctx.handshake_timeout, reader.recv()).await {
        Ok(frame) => frame?,
        Err(_) => return Err(RpcError::Protocol("handshake timed out".into())),
    };
    let Some(first) = first else {
        return Ok(());
    };

    let mut pending: Option<Envelope> = None;
    let codec = match protocol::decode_handshake(&first) {
        Ok(Envelope {
            id: HANDSHAKE_ID,
            msg: Message::Hello { codecs, version },
        }) => {
            tracing::debug!(peer = %peer, offered = ?codecs, client_version = %version, "hello");
            match codec::negotiate(&codecs) {
                Some(chosen) => {
                    let welcome = Message::Welcome {
                        codec: chosen.name().into(),
                        version: PROTOCOL_VERSION.into(),
                    };
                    writer
                        .send(HANDSHAKE_ID, protocol::encode_handshake(&welcome)?)
                        .await?;
                    tracing::debug!(peer = %peer, codec = %chosen, "welcome");
                    chosen
                }
                None => {
                    let err = RpcError::CodecNegotiation(codecs.join(", "));
                    let frame = protocol::encode_handshake(&Message::error(&err, None))?;
                    let _ = writer.send(HANDSHAKE_ID, frame).await;
                    return Err(err);
                }
            }
        }
        decoded => {
            let env = match decoded {
                Ok(env) if ctx.codec == Codec::Msgpack => Ok(env),
                _ => protocol::decode(ctx.codec, &first),
            };
            match env {
                Ok(env) if matches!(env.msg, Message::Call { .. }) => {
                    tracing::debug!(peer = %peer, codec = %ctx.codec, "pinned-codec client");
                    pending = Some(env);
                    ctx.codec
                }
                _ => {
                    let err = RpcError::Protocol("expected HELLO".into());
                    let frame = protocol::encode_handshake(&Message::error(&err, None))?;
                    let _ = writer.send(HANDSHAKE_ID, frame).await;
                    return Err(err);
                }
            }
        }
    };
    writer.set_codec(codec.name());

    let (writer_handle, writer_task) = spawn_writer(writer);
    let calls: Calls = Arc::new(Mutex::new(HashMap::new()));

    if let Some(env) = pending.take() {
        route(&ctx, &calls, &writer_handle, codec, &peer, env).await;
    }

    let result = loop {
        let frame = match reader.recv().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        };
        match protocol::decode(codec, &frame) {
            Ok(env) => route(&ctx, &calls, &writer_handle, codec, &peer, env).await,
            Err(err) => {
                // Malformed frame outside any identifiable call: report on
                // id 0 best-effort and close.
                if let Ok(frame) = protocol::encode(codec, HANDSHAKE_ID, &Message::error(&err, None))
                {
                    let _ = writer_handle.try_send(HANDSHAKE_ID, frame);
                }
                break Err(err);
            }
        }
    };

    // Implicit cancel: fail every call still open on this connection.
    let entries: Vec<CallEntry> = {
        let mut calls = calls.lock().expect("calls lock");
        calls.drain().map(|(_, entry)| entry).collect()
    };
    for entry in &entries {
        entry.cancel.cancel();
    }
    for entry in entries {
        if let Some(input) = entry.input {
            input.fail(RpcError::ConnectionClosed).await;
        }
    }

    drop(writer_handle);
    let _ = writer_task.await;
    result
}

/// Route one inbound envelope. Never blocks on command execution; at most
/// it awaits space in a call's bounded input buffer, which preserves
/// per-call chunk order.
async fn route(
    ctx: &Arc<ConnContext>,
    calls: &Calls,
    writer: &WriterHandle,
    codec: Codec,
    peer: &str,
    env: Envelope,
) {
    let Envelope { id, msg } = env;
    match msg {
        Message::Call {
            service,
            command,
            args,
            kwargs,
            has_input_stream,
        } => {
            if id == HANDSHAKE_ID || calls.lock().expect("calls lock").contains_key(&id) {
                let err = RpcError::Protocol(format!("invalid call id {id}"));
                if let Ok(frame) = protocol::encode(codec, id, &Message::error(&err, None)) {
                    let _ = writer.send(id, frame).await;
                }
                return;
            }

            let cancel = CancelToken::new();
            let (input_sender, input_stream) = if has_input_stream {
                let (tx, rx) = ValueStream::channel();
                (Some(tx), Some(rx))
            } else {
                (None, None)
            };
            // The stream element tag, for coercing chunks decoded under
            // codecs that need the hint.
            let element_tag = ctx.registry.get(&service).and_then(|entry| {
                let def = entry.commands.get(&command)?;
                def.spec.params.first()?.ty.stream_element().cloned()
            });

            calls.lock().expect("calls lock").insert(
                id,
                CallEntry {
                    input: input_sender,
                    element_tag,
                    cancel: cancel.clone(),
                },
            );

            tracing::debug!(peer = %peer, id, service = %service, command = %command, "call");
            tokio::spawn(run_call(
                ctx.clone(),
                calls.clone(),
                writer.clone(),
                codec,
                peer.to_string(),
                id,
                service,
                command,
                args,
                kwargs,
                input_stream,
                cancel,
            ));
        }

        Message::Chunk { value } => {
            let (sender, tag) = {
                let calls = calls.lock().expect("calls lock");
                match calls.get(&id) {
                    Some(entry) => (entry.input.clone(), entry.element_tag.clone()),
                    None => {
                        tracing::debug!(id, "chunk for retired call dropped");
                        return;
                    }
                }
            };
            let Some(sender) = sender else {
                tracing::warn!(id, "chunk for call without input stream dropped");
                return;
            };
            let value = match tag {
                Some(tag) => match tag.coerce(value) {
                    Ok(value) => value,
                    Err(err) => {
                        sender.fail(err).await;
                        return;
                    }
                },
                None => value,
            };
            // A full input buffer suspends the reader here, propagating
            // backpressure to the peer through the transport.
            let _ = sender.send(value).await;
        }

        Message::End => {
            if let Some(entry) = calls.lock().expect("calls lock").get_mut(&id) {
                entry.input = None;
            } else {
                tracing::debug!(id, "end for retired call dropped");
            }
        }

        Message::Error {
            kind,
            message,
            traceback,
        } => {
            let input = {
                let mut calls = calls.lock().expect("calls lock");
                calls.get_mut(&id).and_then(|entry| entry.input.take())
            };
            match input {
                Some(input) => input.fail(RpcError::from_wire(kind, message, traceback)).await,
                None => tracing::debug!(id, "error for retired call dropped"),
            }
        }

        Message::Cancel => {
            let entry = {
                let mut calls = calls.lock().expect("calls lock");
                calls.get_mut(&id).map(|entry| {
                    let input = entry.input.take();
                    (entry.cancel.clone(), input)
                })
            };
            match entry {
                Some((cancel, input)) => {
                    tracing::debug!(peer = %peer, id, "cancel");
                    cancel.cancel();
                    if let Some(input) = input {
                        input.fail(RpcError::Cancelled).await;
                    }
                }
                None => tracing::debug!(id, "cancel for retired call dropped"),
            }
        }

        other => {
            tracing::warn!(peer = %peer, id, kind = %other.kind_name(), "unexpected message ignored");
        }
    }
}

/// Worker task for one call. Sends exactly one terminal message.
#[allow(clippy::too_many_arguments)]
async fn run_call(
    ctx: Arc<ConnContext>,
    calls: Calls,
    writer: WriterHandle,
    codec: Codec,
    peer: String,
    id: u64,
    service: String,
    command: String,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
    input: Option<ValueStream>,
    cancel: CancelToken,
) {
    let result = execute(
        &ctx, &writer, codec, &peer, id, &service, &command, args, kwargs, input, &cancel,
    )
    .await;

    if let Err(err) = result {
        tracing::debug!(peer = %peer, id, error = %err, "call failed");
        let traceback = ctx
            .expose_tracebacks
            .then(|| format!("{err:?}"));
        if let Ok(frame) = protocol::encode(codec, id, &Message::error(&err, traceback)) {
            let _ = writer.send(id, frame).await;
        }
    }

    calls.lock().expect("calls lock").remove(&id);
}

#[allow(clippy::too_many_arguments)]
async fn execute(
    ctx: &Arc<ConnContext>,
    writer: &WriterHandle,
    codec: Codec,
    peer: &str,
    id: u64,
    service: &str,
    command: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
    input: Option<ValueStream>,
    cancel: &CancelToken,
) -> Result<()> {
    let entry = ctx
        .registry
        .get(service)
        .ok_or_else(|| RpcError::UnknownService(service.to_string()))?;
    let def = entry
        .commands
        .get(command)
        .cloned()
        .ok_or_else(|| RpcError::UnknownCommand(format!("{service}.{command}")))?;

    if def.spec.input_streaming() != input.is_some() {
        return Err(RpcError::BadArguments(format!(
            "{service}.{command}: input stream flag does not match signature"
        )));
    }

    let bound = bind_args(&def.spec, args, kwargs, input)?;
    let call_ctx = CallContext::new(id, peer.to_string(), cancel.clone());

    let reply = tokio::select! {
        reply = def.invoke(call_ctx, bound) => reply?,
        () = cancel.cancelled() => return Err(RpcError::Cancelled),
    };

    match reply {
        Reply::Value(value) => {
            if def.spec.output_streaming {
                return Err(RpcError::Internal(format!(
                    "{service}.{command} must stream its output"
                )));
            }
            let frame = protocol::encode(codec, id, &Message::Reply { value })?;
            writer.send(id, frame).await?;
        }
        Reply::Stream(mut stream) => {
            if !def.spec.output_streaming {
                return Err(RpcError::Internal(format!(
                    "{service}.{command} returned an unexpected stream"
                )));
            }
            loop {
                let item = tokio::select! {
                    item = stream.next() => item,
                    () = cancel.cancelled() => return Err(RpcError::Cancelled),
                };
                match item {
                    Some(Ok(value)) => {
                        let frame = protocol::encode(codec, id, &Message::Chunk { value })?;
                        writer.send(id, frame).await?;
                    }
                    Some(Err(err)) => return Err(err),
                    None => {
                        let frame = protocol::encode(codec, id, &Message::End)?;
                        writer.send(id, frame).await?;
                        break;
                    }
                }
            }
        }
    }
    Ok(())
}
