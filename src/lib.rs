//! # snekrpc
//!
//! A lightweight RPC runtime: a process exposes named *services*
//! (collections of commands) over a pluggable transport and codec, and
//! peers invoke those commands with unary or bi-directional streaming
//! calls. A built-in metadata service (`_meta`) describes every registered
//! command at runtime, which is what the generated client surface and the
//! CLI are built from.
//!
//! ## Layers
//!
//! - **Transport** ([`transport`]): framed byte channels over TCP, Unix
//!   sockets, or an HTTP carrier, selected by URL scheme.
//! - **Codec** ([`codec`]): [`Value`] trees to bytes and back; MessagePack
//!   by default, JSON as the textual fallback, negotiated per connection.
//! - **Protocol** ([`protocol`]): `[kind, id, payload]` messages
//!   multiplexing many calls over one connection.
//! - **Services** ([`service`]): typed command descriptors plus async
//!   handlers, registered under unique names.
//! - **Server** ([`server`]): per-connection dispatcher running each call
//!   on its own task.
//! - **Client** ([`client`]): handshake, call multiplexing, and
//!   metadata-driven [`ServiceProxy`] objects.
//!
//! ## Example
//!
//! ```ignore
//! use snekrpc::{Client, CommandBuilder, Reply, Server, ServerConfig, ServiceDef, TypeTag};
//!
//! #[tokio::main]
//! async fn main() -> snekrpc::Result<()> {
//!     let server = Server::new(ServerConfig::default());
//!     server.add_service(ServiceDef::new("echo").command(
//!         CommandBuilder::new("echo")
//!             .param("value", TypeTag::Str)
//!             .returns(TypeTag::Str)
//!             .handler(|_ctx, mut args| async move { Ok(Reply::Value(args.take(0))) }),
//!     ))?;
//!     let handle = server.bind().await?;
//!
//!     let client = Client::connect_to(&handle.url().to_string())?;
//!     let echo = client.service("echo").await?;
//!     let value = echo.call("echo", vec!["hello".into()]).await?;
//!     assert_eq!(value.as_str(), Some("hello"));
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod error;
pub mod protocol;
pub mod server;
pub mod service;
pub mod stream;
pub mod transport;
pub mod url;
pub mod value;

mod writer;

pub use client::{CallStream, Client, ClientConfig, ServiceProxy};
pub use codec::Codec;
pub use error::{ErrorKind, RemoteError, Result, RpcError};
pub use server::{Server, ServerConfig, ServerHandle};
pub use service::{
    file_service, health_service, Args, CallContext, CommandBuilder, CommandDef, CommandSpec,
    ParamSpec, Reply, ServiceDef, ServiceSpec, META_SERVICE,
};
pub use stream::{CancelToken, StreamSender, ValueStream};
pub use url::Url;
pub use value::{TypeTag, Value};
