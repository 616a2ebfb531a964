//! Service definitions and command descriptors.
//!
//! A service is registered as a typed descriptor table: every command pairs
//! a [`CommandSpec`] (the metadata published by `_meta`) with an async
//! handler. Invocation is a table lookup plus tag-driven binding of the
//! wire arguments; no runtime reflection is involved.
//!
//! # Example
//!
//! ```ignore
//! let svc = ServiceDef::new("math").command(
//!     CommandBuilder::new("add")
//!         .param("a", TypeTag::Int)
//!         .param("b", TypeTag::Int)
//!         .returns(TypeTag::Int)
//!         .handler(|_ctx, args| async move {
//!             let sum = args.int(0)? + args.int(1)?;
//!             Ok(Reply::Value(sum.into()))
//!         }),
//! );
//! server.add_service(svc)?;
//! ```

mod file;
mod health;
pub(crate) mod meta;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub use file::file_service;
pub use health::health_service;

use crate::error::{Result, RpcError};
use crate::stream::{CancelToken, ValueStream};
use crate::value::{TypeTag, Value};

/// Boxed future returned by command handlers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Name of the reserved, auto-registered metadata service.
pub const META_SERVICE: &str = "_meta";

/// Context passed to command handlers.
#[derive(Clone)]
pub struct CallContext {
    call_id: u64,
    peer: String,
    cancel: CancelToken,
}

impl CallContext {
    pub(crate) fn new(call_id: u64, peer: String, cancel: CancelToken) -> CallContext {
        CallContext {
            call_id,
            peer,
            cancel,
        }
    }

    /// A detached context for exercising handlers directly in tests.
    pub fn local() -> CallContext {
        CallContext::new(0, "local".into(), CancelToken::new())
    }

    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    /// Peer address of the calling connection.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Cancellation token for this call. Long-running commands should
    /// check it at convenient points.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Bound arguments handed to a handler, ordered per the command's params.
pub struct Args {
    values: Vec<Value>,
    input: Option<ValueStream>,
}

impl Args {
    /// Construct bound arguments directly (tests, local invocation).
    pub fn new(values: Vec<Value>, input: Option<ValueStream>) -> Args {
        Args { values, input }
    }

    /// The value bound to parameter `idx` (a stream slot holds `Null`).
    pub fn get(&self, idx: usize) -> &Value {
        self.values.get(idx).unwrap_or(&Value::Null)
    }

    /// Move the value out of slot `idx`, leaving `Null`.
    pub fn take(&mut self, idx: usize) -> Value {
        match self.values.get_mut(idx) {
            Some(slot) => std::mem::take(slot),
            None => Value::Null,
        }
    }

    /// The input stream for input-streaming commands.
    pub fn take_input(&mut self) -> Result<ValueStream> {
        self.input
            .take()
            .ok_or_else(|| RpcError::Internal("no input stream bound".into()))
    }

    pub fn int(&self, idx: usize) -> Result<i64> {
        self.get(idx)
            .as_int()
            .ok_or_else(|| bad_type(idx, "int", self.get(idx)))
    }

    pub fn float(&self, idx: usize) -> Result<f64> {
        self.get(idx)
            .as_float()
            .ok_or_else(|| bad_type(idx, "float", self.get(idx)))
    }

    pub fn bool(&self, idx: usize) -> Result<bool> {
        self.get(idx)
            .as_bool()
            .ok_or_else(|| bad_type(idx, "bool", self.get(idx)))
    }

    pub fn str(&self, idx: usize) -> Result<&str> {
        self.get(idx)
            .as_str()
            .ok_or_else(|| bad_type(idx, "str", self.get(idx)))
    }

    pub fn bytes(&self, idx: usize) -> Result<&[u8]> {
        self.get(idx)
            .as_bytes()
            .ok_or_else(|| bad_type(idx, "bytes", self.get(idx)))
    }
}

fn bad_type(idx: usize, wanted: &str, got: &Value) -> RpcError {
    RpcError::BadArguments(format!(
        "parameter {idx} is {}, expected {wanted}",
        got.kind_name()
    ))
}

/// Result of a command invocation.
#[derive(Debug)]
pub enum Reply {
    /// Unary result, sent as a single `REPLY`.
    Value(Value),
    /// Lazy sequence, drained as `CHUNK`s and a terminal `END`.
    Stream(ValueStream),
}

/// Object-safe command implementation.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, ctx: CallContext, args: Args) -> BoxFuture<'static, Result<Reply>>;
}

struct FnHandler<F>(F);

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(CallContext, Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Reply>> + Send + 'static,
{
    fn call(&self, ctx: CallContext, args: Args) -> BoxFuture<'static, Result<Reply>> {
        Box::pin((self.0)(ctx, args))
    }
}

/// Metadata for a single parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub ty: TypeTag,
    pub default: Option<Value>,
    pub hidden: bool,
    pub doc: Option<String>,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, ty: TypeTag) -> ParamSpec {
        ParamSpec {
            name: name.into(),
            ty,
            default: None,
            hidden: false,
            doc: None,
        }
    }

    pub(crate) fn to_value(&self) -> Value {
        Value::Map(vec![
            (Value::Str("name".into()), self.name.as_str().into()),
            (Value::Str("type".into()), self.ty.to_string().into()),
            (Value::Str("default".into()), self.default.clone().into()),
            (
                Value::Str("has_default".into()),
                self.default.is_some().into(),
            ),
            (Value::Str("hidden".into()), self.hidden.into()),
            (Value::Str("doc".into()), self.doc.clone().into()),
        ])
    }

    pub(crate) fn from_value(value: &Value) -> Result<ParamSpec> {
        let name = req_str(value, "name")?;
        let ty: TypeTag = req_str(value, "type")?.parse()?;
        let has_default = value
            .get("has_default")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let default = if has_default {
            Some(value.get("default").cloned().unwrap_or(Value::Null))
        } else {
            None
        };
        Ok(ParamSpec {
            name,
            ty,
            default,
            hidden: value.get("hidden").and_then(Value::as_bool).unwrap_or(false),
            doc: opt_str(value, "doc"),
        })
    }
}

/// Metadata for a single command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub name: String,
    pub doc: Option<String>,
    pub params: Vec<ParamSpec>,
    pub returns: TypeTag,
    pub output_streaming: bool,
}

impl CommandSpec {
    /// True when the first parameter consumes an input stream.
    pub fn input_streaming(&self) -> bool {
        self.params.first().is_some_and(|p| p.ty.is_stream())
    }

    /// Check the §data-model invariants for one command.
    pub fn validate(&self) -> Result<()> {
        let err = |msg: String| Err(RpcError::Registration(msg));

        for (i, param) in self.params.iter().enumerate() {
            if param.ty.is_stream() && i != 0 {
                return err(format!(
                    "{}: stream parameter {} must come first",
                    self.name, param.name
                ));
            }
            if self.params[..i].iter().any(|p| p.name == param.name) {
                return err(format!("{}: duplicate parameter {}", self.name, param.name));
            }
        }
        if self.output_streaming != self.returns.is_stream() {
            return err(format!(
                "{}: output_streaming must match a stream return tag",
                self.name
            ));
        }
        Ok(())
    }

    pub(crate) fn to_value(&self) -> Value {
        Value::Map(vec![
            (Value::Str("name".into()), self.name.as_str().into()),
            (Value::Str("doc".into()), self.doc.clone().into()),
            (
                Value::Str("params".into()),
                Value::List(self.params.iter().map(ParamSpec::to_value).collect()),
            ),
            (
                Value::Str("returns".into()),
                self.returns.to_string().into(),
            ),
            (
                Value::Str("output_streaming".into()),
                self.output_streaming.into(),
            ),
        ])
    }

    pub(crate) fn from_value(value: &Value) -> Result<CommandSpec> {
        let params = value
            .get("params")
            .and_then(Value::as_list)
            .map(|items| items.iter().map(ParamSpec::from_value).collect())
            .transpose()?
            .unwrap_or_default();
        Ok(CommandSpec {
            name: req_str(value, "name")?,
            doc: opt_str(value, "doc"),
            params,
            returns: req_str(value, "returns")?.parse()?,
            output_streaming: value
                .get("output_streaming")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }
}

/// Metadata for a whole service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSpec {
    pub name: String,
    pub doc: Option<String>,
    pub commands: Vec<CommandSpec>,
}

impl ServiceSpec {
    pub fn command(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.iter().find(|c| c.name == name)
    }

    pub(crate) fn to_value(&self) -> Value {
        Value::Map(vec![
            (Value::Str("name".into()), self.name.as_str().into()),
            (Value::Str("doc".into()), self.doc.clone().into()),
            (
                Value::Str("commands".into()),
                Value::List(self.commands.iter().map(CommandSpec::to_value).collect()),
            ),
        ])
    }

    pub(crate) fn from_value(value: &Value) -> Result<ServiceSpec> {
        let commands = value
            .get("commands")
            .and_then(Value::as_list)
            .map(|items| items.iter().map(CommandSpec::from_value).collect())
            .transpose()?
            .unwrap_or_default();
        Ok(ServiceSpec {
            name: req_str(value, "name")?,
            doc: opt_str(value, "doc"),
            commands,
        })
    }
}

fn req_str(value: &Value, key: &str) -> Result<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RpcError::Protocol(format!("metadata missing field: {key}")))
}

fn opt_str(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

/// A command descriptor paired with its implementation.
#[derive(Clone)]
pub struct CommandDef {
    pub spec: CommandSpec,
    handler: Arc<dyn Handler>,
}

impl CommandDef {
    /// Invoke the handler with already bound arguments.
    pub fn invoke(&self, ctx: CallContext, args: Args) -> BoxFuture<'static, Result<Reply>> {
        self.handler.call(ctx, args)
    }
}

impl std::fmt::Debug for CommandDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDef").field("spec", &self.spec).finish()
    }
}

/// Fluent builder for a [`CommandDef`].
pub struct CommandBuilder {
    name: String,
    doc: Option<String>,
    params: Vec<ParamSpec>,
    returns: TypeTag,
}

impl CommandBuilder {
    pub fn new(name: impl Into<String>) -> CommandBuilder {
        CommandBuilder {
            name: name.into(),
            doc: None,
            params: Vec::new(),
            returns: TypeTag::None,
        }
    }

    pub fn doc(mut self, doc: impl Into<String>) -> CommandBuilder {
        self.doc = Some(doc.into());
        self
    }

    pub fn param(mut self, name: impl Into<String>, ty: TypeTag) -> CommandBuilder {
        self.params.push(ParamSpec::new(name, ty));
        self
    }

    pub fn param_default(
        mut self,
        name: impl Into<String>,
        ty: TypeTag,
        default: impl Into<Value>,
    ) -> CommandBuilder {
        let mut param = ParamSpec::new(name, ty);
        param.default = Some(default.into());
        self.params.push(param);
        self
    }

    /// Add a fully specified parameter (hidden flags, docs).
    pub fn param_spec(mut self, param: ParamSpec) -> CommandBuilder {
        self.params.push(param);
        self
    }

    /// Declare the return tag. `stream<…>` makes the command
    /// output-streaming; the handler must then return [`Reply::Stream`].
    pub fn returns(mut self, ty: TypeTag) -> CommandBuilder {
        self.returns = ty;
        self
    }

    /// Attach the implementation, completing the descriptor.
    pub fn handler<F, Fut>(self, f: F) -> CommandDef
    where
        F: Fn(CallContext, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply>> + Send + 'static,
    {
        let output_streaming = self.returns.is_stream();
        CommandDef {
            spec: CommandSpec {
                name: self.name,
                doc: self.doc,
                params: self.params,
                returns: self.returns,
                output_streaming,
            },
            handler: Arc::new(FnHandler(f)),
        }
    }
}

/// A named set of commands, ready for registration.
#[derive(Clone)]
pub struct ServiceDef {
    pub name: String,
    pub doc: Option<String>,
    commands: Vec<CommandDef>,
}

impl ServiceDef {
    pub fn new(name: impl Into<String>) -> ServiceDef {
        ServiceDef {
            name: name.into(),
            doc: None,
            commands: Vec::new(),
        }
    }

    pub fn doc(mut self, doc: impl Into<String>) -> ServiceDef {
        self.doc = Some(doc.into());
        self
    }

    pub fn command(mut self, def: CommandDef) -> ServiceDef {
        self.commands.push(def);
        self
    }

    pub fn commands(&self) -> &[CommandDef] {
        &self.commands
    }

    pub(crate) fn into_commands(self) -> Vec<CommandDef> {
        self.commands
    }

    /// Validate registration invariants; called by the server registry.
    pub fn validate(&self) -> Result<()> {
        for (i, def) in self.commands.iter().enumerate() {
            if self.commands[..i].iter().any(|d| d.spec.name == def.spec.name) {
                return Err(RpcError::Registration(format!(
                    "{}: duplicate command {}",
                    self.name, def.spec.name
                )));
            }
            def.spec.validate()?;
        }
        Ok(())
    }
}

/// Bind wire arguments against a command signature.
///
/// Positional arguments fill declared parameters in order, keyword
/// arguments by name; defaults fill the rest. The stream parameter, when
/// declared, is satisfied by `input` and its value slot holds `Null`.
/// Every mismatch is a `BadArguments` error.
pub fn bind_args(
    spec: &CommandSpec,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
    input: Option<ValueStream>,
) -> Result<Args> {
    let err = |msg: String| Err(RpcError::BadArguments(msg));

    let input_streaming = spec.input_streaming();
    if input_streaming && input.is_none() {
        return err(format!("{}: missing input stream", spec.name));
    }
    if !input_streaming && input.is_some() {
        return err(format!("{}: does not take an input stream", spec.name));
    }

    let positional: &[ParamSpec] = if input_streaming {
        &spec.params[1..]
    } else {
        &spec.params
    };

    if args.len() > positional.len() {
        return err(format!(
            "{}: takes at most {} arguments, got {}",
            spec.name,
            positional.len(),
            args.len()
        ));
    }

    let mut slots: Vec<Option<Value>> = args.into_iter().map(Some).collect();
    slots.resize_with(positional.len(), || None);

    for (name, value) in kwargs {
        let idx = match positional.iter().position(|p| p.name == name) {
            Some(idx) => idx,
            None => return err(format!("{}: unknown parameter {name}", spec.name)),
        };
        if slots[idx].is_some() {
            return err(format!("{}: parameter {name} given twice", spec.name));
        }
        slots[idx] = Some(value);
    }

    let mut values = Vec::with_capacity(spec.params.len());
    if input_streaming {
        values.push(Value::Null);
    }
    for (param, slot) in positional.iter().zip(slots) {
        let value = match slot {
            Some(value) => param.ty.coerce(value).map_err(|e| {
                RpcError::BadArguments(format!("{}: parameter {}: {e}", spec.name, param.name))
            })?,
            None => match &param.default {
                Some(default) => default.clone(),
                None => {
                    return err(format!(
                        "{}: missing required parameter {}",
                        spec.name, param.name
                    ))
                }
            },
        };
        values.push(value);
    }

    Ok(Args { values, input })
}
