//! Server module - service registry and connection acceptance.
//!
//! A [`Server`] owns the command registry and serves calls over the
//! configured transport. Each accepted connection is handled by its own
//! dispatcher task (see [`dispatch`]); the registry is read-mostly and
//! shared behind an `RwLock` so services can be added or removed while
//! serving.

pub(crate) mod dispatch;

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::codec::Codec;
use crate::error::{Result, RpcError};
use crate::service::meta::meta_service;
use crate::service::{CommandDef, ServiceDef, ServiceSpec, META_SERVICE};
use crate::transport::Listener;
use crate::url::Url;

/// Server configuration with defaulted fields; no process-wide globals.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Endpoint to listen on.
    pub url: Url,
    /// Codec assumed for clients that pin one and skip the handshake.
    pub codec: Codec,
    /// Application version reported by `_meta.status`.
    pub version: Option<String>,
    /// Include tracebacks in `ERROR` messages. Off by default.
    pub expose_tracebacks: bool,
    /// Grace period for the client's `HELLO` after connecting.
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            url: Url::default(),
            codec: Codec::default(),
            version: None,
            expose_tracebacks: false,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// One registered service: exposed name plus its command table.
pub(crate) struct ServiceEntry {
    pub name: String,
    pub doc: Option<String>,
    pub commands: BTreeMap<String, CommandDef>,
}

impl ServiceEntry {
    /// Metadata snapshot. Commands iterate in name order, so equal
    /// registries produce equal specs.
    pub fn spec(&self) -> ServiceSpec {
        ServiceSpec {
            name: self.name.clone(),
            doc: self.doc.clone(),
            commands: self.commands.values().map(|def| def.spec.clone()).collect(),
        }
    }
}

/// The service registry. Reads take a shared lock; mutations are
/// serialized under the write lock.
pub(crate) struct Registry {
    services: RwLock<BTreeMap<String, Arc<ServiceEntry>>>,
}

impl Registry {
    fn new() -> Registry {
        Registry {
            services: RwLock::new(BTreeMap::new()),
        }
    }

    fn insert(&self, svc: ServiceDef, alias: Option<&str>, allow_reserved: bool) -> Result<()> {
        svc.validate()?;

        let name = alias.unwrap_or(&svc.name).to_string();
        if name.is_empty() {
            return Err(RpcError::Registration("service name is empty".into()));
        }
        if name == META_SERVICE && !allow_reserved {
            return Err(RpcError::Registration(format!(
                "{META_SERVICE} is reserved"
            )));
        }

        let entry = ServiceEntry {
            name: name.clone(),
            doc: svc.doc.clone(),
            commands: svc
                .into_commands()
                .into_iter()
                .map(|def| (def.spec.name.clone(), def))
                .collect(),
        };

        let mut services = self.services.write().expect("registry lock");
        if services.contains_key(&name) {
            return Err(RpcError::Registration(format!(
                "service {name} already registered"
            )));
        }
        services.insert(name.clone(), Arc::new(entry));
        tracing::debug!(service = %name, "service added");
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        if name == META_SERVICE {
            return Err(RpcError::Registration(format!(
                "{META_SERVICE} is reserved"
            )));
        }
        let mut services = self.services.write().expect("registry lock");
        match services.remove(name) {
            Some(_) => {
                tracing::debug!(service = %name, "service removed");
                Ok(())
            }
            None => Err(RpcError::UnknownService(name.to_string())),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServiceEntry>> {
        self.services.read().expect("registry lock").get(name).cloned()
    }

    /// Exported names, sorted ascending. Reserved (underscore-prefixed)
    /// services are not exported.
    pub fn service_names(&self) -> Vec<String> {
        self.services
            .read()
            .expect("registry lock")
            .keys()
            .filter(|name| !name.starts_with('_'))
            .cloned()
            .collect()
    }

    /// Every registered service including `_meta`, in name order.
    pub fn entries(&self) -> Vec<Arc<ServiceEntry>> {
        self.services
            .read()
            .expect("registry lock")
            .values()
            .cloned()
            .collect()
    }
}

/// An RPC server: registry plus transport loop.
pub struct Server {
    config: ServerConfig,
    registry: Arc<Registry>,
}

impl Server {
    /// Create a server; `_meta` is registered automatically.
    pub fn new(config: ServerConfig) -> Server {
        let registry = Arc::new(Registry::new());
        let meta = meta_service(
            registry.clone(),
            config.codec.name().to_string(),
            config.url.scheme().as_str().to_string(),
            config.version.clone(),
        );
        registry
            .insert(meta, None, true)
            .expect("meta service registers");
        Server { config, registry }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Register a service under its declared name.
    pub fn add_service(&self, svc: ServiceDef) -> Result<()> {
        self.registry.insert(svc, None, false)
    }

    /// Register a service under a different exposed name.
    pub fn add_service_as(&self, svc: ServiceDef, alias: &str) -> Result<()> {
        self.registry.insert(svc, Some(alias), false)
    }

    /// Unregister a service. `_meta` cannot be removed.
    pub fn remove_service(&self, name: &str) -> Result<()> {
        self.registry.remove(name)
    }

    /// Metadata snapshot of every registered service.
    pub fn service_specs(&self) -> Vec<ServiceSpec> {
        self.registry.entries().iter().map(|e| e.spec()).collect()
    }

    /// Bind the listener and start accepting in the background.
    pub async fn bind(&self) -> Result<ServerHandle> {
        let (mut listener, bound) = Listener::bind(&self.config.url).await?;
        let ctx = Arc::new(dispatch::ConnContext {
            registry: self.registry.clone(),
            codec: self.config.codec,
            expose_tracebacks: self.config.expose_tracebacks,
            handshake_timeout: self.config.handshake_timeout,
        });

        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(conn) => {
                        tokio::spawn(dispatch::handle_connection(ctx.clone(), conn));
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                        if matches!(err, RpcError::Transport(_)) {
                            // The listener itself is gone.
                            return;
                        }
                    }
                }
            }
        });

        Ok(ServerHandle {
            url: bound,
            accept: Some(accept),
        })
    }

    /// Serve until the accept loop dies.
    pub async fn serve(&self) -> Result<()> {
        self.bind().await?.join().await
    }
}

/// A running server's accept loop. Dropping the handle stops accepting.
pub struct ServerHandle {
    url: Url,
    accept: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// The effective endpoint, with the real port if 0 was requested.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Wait for the accept loop to finish.
    pub async fn join(mut self) -> Result<()> {
        if let Some(accept) = self.accept.take() {
            accept
                .await
                .map_err(|err| RpcError::Internal(format!("accept loop panicked: {err}")))?;
        }
        Ok(())
    }

    /// Stop accepting new connections. Established connections run on
    /// until their peers disconnect.
    pub fn shutdown(mut self) {
        if let Some(accept) = self.accept.take() {
            accept.abort();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(accept) = &self.accept {
            accept.abort();
        }
    }
}

#[cfg(test)]
pub(crate) fn test_registry(server: &Server) -> Arc<Registry> {
    server.registry.clone()
}
