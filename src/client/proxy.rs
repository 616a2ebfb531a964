//! Metadata-driven service proxies.
//!
//! On first use a proxy fetches its service's metadata from `_meta` and
//! validates every invocation against the declared command signatures:
//! streaming shape, argument arity, and tag coercion of results. A client
//! that can reach `_meta` needs no build-time knowledge of the service.

use std::collections::BTreeMap;
use std::time::Duration;

use super::{CallOptions, CallOutcome, CallStream, Client};
use crate::error::{Result, RpcError};
use crate::service::{CommandSpec, ServiceSpec, META_SERVICE};
use crate::stream::ValueStream;
use crate::value::Value;

impl Client {
    /// A proxy for `name`, built from the server's metadata.
    pub async fn service(&self, name: &str) -> Result<ServiceProxy> {
        let value = self
            .meta_unary("service", vec![Value::Str(name.to_string())])
            .await?;
        let spec = ServiceSpec::from_value(&value)?;
        Ok(ServiceProxy {
            client: self.clone(),
            timeout: self.config().call_timeout,
            spec,
        })
    }

    /// Metadata for every service on the server, keyed by exposed name.
    pub async fn services(&self) -> Result<BTreeMap<String, ServiceSpec>> {
        let value = self.meta_unary("services", vec![]).await?;
        let entries = value
            .as_map()
            .ok_or_else(|| RpcError::Protocol("services metadata is not a map".into()))?;
        entries
            .iter()
            .map(|(name, spec)| {
                let name = name
                    .as_str()
                    .ok_or_else(|| RpcError::Protocol("service name is not a string".into()))?;
                Ok((name.to_string(), ServiceSpec::from_value(spec)?))
            })
            .collect()
    }

    /// Exported service names, sorted ascending.
    pub async fn service_names(&self) -> Result<Vec<String>> {
        let value = self.meta_unary("service_names", vec![]).await?;
        let names = value
            .as_list()
            .ok_or_else(|| RpcError::Protocol("service names are not a list".into()))?;
        names
            .iter()
            .map(|name| {
                name.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| RpcError::Protocol("service name is not a string".into()))
            })
            .collect()
    }

    /// The server's `_meta.status()`.
    pub async fn status(&self) -> Result<Value> {
        self.meta_unary("status", vec![]).await
    }

    async fn meta_unary(&self, command: &str, args: Vec<Value>) -> Result<Value> {
        let outcome = self
            .start_call(
                META_SERVICE,
                command,
                args,
                vec![],
                CallOptions {
                    input: None,
                    expect_stream: false,
                    chunk_tag: None,
                    timeout: self.config().call_timeout,
                },
            )
            .await?;
        match outcome {
            CallOutcome::Value(value) => Ok(value),
            CallOutcome::Stream(_) => Err(RpcError::Protocol("meta call streamed".into())),
        }
    }
}

/// A typed surface over one remote service, reconstructed from metadata.
#[derive(Clone)]
pub struct ServiceProxy {
    client: Client,
    timeout: Option<Duration>,
    spec: ServiceSpec,
}

impl ServiceProxy {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    /// Copy of this proxy with a per-call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> ServiceProxy {
        self.timeout = Some(timeout);
        self
    }

    fn command_spec(&self, command: &str) -> Result<&CommandSpec> {
        self.spec.command(command).ok_or_else(|| {
            RpcError::UnknownCommand(format!("{}.{command}", self.spec.name))
        })
    }

    fn prepare(&self, command: &str, streaming_out: bool, has_input: bool) -> Result<&CommandSpec> {
        let spec = self.command_spec(command)?;
        if spec.output_streaming != streaming_out {
            let hint = if spec.output_streaming {
                "streams its output; use call_stream"
            } else {
                "does not stream its output; use call"
            };
            return Err(RpcError::BadArguments(format!(
                "{}.{command} {hint}",
                self.spec.name
            )));
        }
        if spec.input_streaming() != has_input {
            let hint = if spec.input_streaming() {
                "requires an input stream"
            } else {
                "does not take an input stream"
            };
            return Err(RpcError::BadArguments(format!(
                "{}.{command} {hint}",
                self.spec.name
            )));
        }
        Ok(spec)
    }

    /// Unary call with positional arguments.
    pub async fn call(&self, command: &str, args: Vec<Value>) -> Result<Value> {
        self.call_kw(command, args, vec![]).await
    }

    /// Unary call with positional and keyword arguments.
    pub async fn call_kw(
        &self,
        command: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value> {
        let spec = self.prepare(command, false, false)?;
        let returns = spec.returns.clone();
        let outcome = self
            .client
            .start_call(
                &self.spec.name,
                command,
                args,
                kwargs,
                CallOptions {
                    input: None,
                    expect_stream: false,
                    chunk_tag: None,
                    timeout: self.timeout,
                },
            )
            .await?;
        match outcome {
            CallOutcome::Value(value) => returns.coerce(value),
            CallOutcome::Stream(_) => unreachable!("unary call produced a stream"),
        }
    }

    /// Output-streaming call; the result is drawn lazily.
    pub async fn call_stream(
        &self,
        command: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<CallStream> {
        let spec = self.prepare(command, true, false)?;
        let chunk_tag = spec.returns.stream_element().cloned();
        let outcome = self
            .client
            .start_call(
                &self.spec.name,
                command,
                args,
                kwargs,
                CallOptions {
                    input: None,
                    expect_stream: true,
                    chunk_tag,
                    timeout: self.timeout,
                },
            )
            .await?;
        match outcome {
            CallOutcome::Stream(stream) => Ok(stream),
            CallOutcome::Value(_) => unreachable!("stream call produced a unary value"),
        }
    }

    /// Input-streaming call with a unary result. `input` binds the first
    /// declared parameter; `args` fill the rest.
    pub async fn call_with_input(
        &self,
        command: &str,
        input: ValueStream,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value> {
        let spec = self.prepare(command, false, true)?;
        let returns = spec.returns.clone();
        let outcome = self
            .client
            .start_call(
                &self.spec.name,
                command,
                args,
                kwargs,
                CallOptions {
                    input: Some(input),
                    expect_stream: false,
                    chunk_tag: None,
                    timeout: self.timeout,
                },
            )
            .await?;
        match outcome {
            CallOutcome::Value(value) => returns.coerce(value),
            CallOutcome::Stream(_) => unreachable!("unary call produced a stream"),
        }
    }

    /// Bi-directional streaming call.
    pub async fn call_stream_with_input(
        &self,
        command: &str,
        input: ValueStream,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<CallStream> {
        let spec = self.prepare(command, true, true)?;
        let chunk_tag = spec.returns.stream_element().cloned();
        let outcome = self
            .client
            .start_call(
                &self.spec.name,
                command,
                args,
                kwargs,
                CallOptions {
                    input: Some(input),
                    expect_stream: true,
                    chunk_tag,
                    timeout: self.timeout,
                },
            )
            .await?;
        match outcome {
            CallOutcome::Stream(stream) => Ok(stream),
            CallOutcome::Value(_) => unreachable!("stream call produced a unary value"),
        }
    }
}

impl std::fmt::Debug for ServiceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProxy")
            .field("service", &self.spec.name)
            .field("commands", &self.spec.commands.len())
            .finish()
    }
}
