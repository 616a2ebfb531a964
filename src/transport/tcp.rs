//! TCP transport.
//!
//! Raw sockets with the shared length-prefix framing. `TCP_NODELAY` is set
//! on both ends: frames are small and latency-sensitive.

use tokio::net::{TcpListener, TcpStream};

use super::MsgConnection;
use crate::error::Result;
use crate::url::Url;

pub struct TcpMsgListener {
    listener: TcpListener,
}

impl TcpMsgListener {
    pub async fn bind(url: &Url) -> Result<(TcpMsgListener, Url)> {
        let listener = TcpListener::bind(url.addr()).await?;
        let bound = url.with_port(listener.local_addr()?.port());
        tracing::info!(url = %bound, "listening");
        Ok((TcpMsgListener { listener }, bound))
    }

    pub async fn accept(&mut self) -> Result<MsgConnection> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        tracing::debug!(peer = %addr, "connection accepted");
        let (read, write) = stream.into_split();
        Ok(MsgConnection::from_stream(read, write, addr.to_string()))
    }
}

pub async fn connect(url: &Url) -> Result<MsgConnection> {
    let stream = TcpStream::connect(url.addr()).await?;
    stream.set_nodelay(true)?;
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| url.addr());
    tracing::debug!(peer = %peer, "connected");
    let (read, write) = stream.into_split();
    Ok(MsgConnection::from_stream(read, write, peer))
}
