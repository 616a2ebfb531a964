//! Unix domain socket transport.
//!
//! Same framing as TCP over a filesystem socket. The listener unlinks a
//! stale socket file before binding and removes its own on drop.

use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};

use super::MsgConnection;
use crate::error::Result;
use crate::url::Url;

pub struct UnixMsgListener {
    listener: UnixListener,
    path: PathBuf,
}

impl UnixMsgListener {
    pub async fn bind(url: &Url) -> Result<(UnixMsgListener, Url)> {
        let path = PathBuf::from(url.path());
        if Path::new(&path).exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        tracing::info!(url = %url, "listening");
        Ok((UnixMsgListener { listener, path }, url.clone()))
    }

    pub async fn accept(&mut self) -> Result<MsgConnection> {
        let (stream, _addr) = self.listener.accept().await?;
        let peer = self.path.display().to_string();
        tracing::debug!(peer = %peer, "connection accepted");
        let (read, write) = stream.into_split();
        Ok(MsgConnection::from_stream(read, write, peer))
    }
}

impl Drop for UnixMsgListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub async fn connect(url: &Url) -> Result<MsgConnection> {
    let stream = UnixStream::connect(url.path()).await?;
    tracing::debug!(peer = %url, "connected");
    let (read, write) = stream.into_split();
    Ok(MsgConnection::from_stream(read, write, url.path().to_string()))
}
