//! The reserved `_meta` service.
//!
//! Self-description for clients and CLIs: enough metadata to render help,
//! bind arguments, and choose unary or streaming invocation without any
//! build-time knowledge of the registered services. The published metadata
//! is a pure function of the registry, so identical registries answer
//! identically.

use std::sync::Arc;

use super::{CommandBuilder, Reply, ServiceDef};
use crate::error::RpcError;
use crate::server::Registry;
use crate::value::{TypeTag, Value};

/// Build the `_meta` service over a server's registry.
pub(crate) fn meta_service(
    registry: Arc<Registry>,
    codec: String,
    transport: String,
    version: Option<String>,
) -> ServiceDef {
    let names_registry = registry.clone();
    let services_registry = registry.clone();

    ServiceDef::new("_meta")
        .doc("Runtime metadata about this server.")
        .command(
            CommandBuilder::new("status")
                .doc("Codec, transport, and version information.")
                .returns(TypeTag::map(TypeTag::Str, TypeTag::Any))
                .handler(move |_ctx, _args| {
                    let codec = codec.clone();
                    let transport = transport.clone();
                    let version = version.clone();
                    async move {
                        Ok(Reply::Value(Value::Map(vec![
                            (Value::Str("codec".into()), codec.into()),
                            (Value::Str("transport".into()), transport.into()),
                            (Value::Str("version".into()), version.into()),
                        ])))
                    }
                }),
        )
        .command(
            CommandBuilder::new("service_names")
                .doc("Exported service names, sorted ascending.")
                .returns(TypeTag::list(TypeTag::Str))
                .handler(move |_ctx, _args| {
                    let names = names_registry.service_names();
                    async move {
                        Ok(Reply::Value(Value::List(
                            names.into_iter().map(Value::from).collect(),
                        )))
                    }
                }),
        )
        .command(
            CommandBuilder::new("services")
                .doc("Metadata for every registered service.")
                .returns(TypeTag::map(TypeTag::Str, TypeTag::Any))
                .handler(move |_ctx, _args| {
                    let entries = services_registry.entries();
                    async move {
                        Ok(Reply::Value(Value::Map(
                            entries
                                .iter()
                                .map(|entry| {
                                    (Value::Str(entry.name.clone()), entry.spec().to_value())
                                })
                                .collect(),
                        )))
                    }
                }),
        )
        .command(
            CommandBuilder::new("service")
                .doc("Metadata for one service.")
                .param("name", TypeTag::Str)
                .returns(TypeTag::map(TypeTag::Str, TypeTag::Any))
                .handler(move |_ctx, args| {
                    let lookup = args.str(0).map(|name| {
                        registry
                            .get(name)
                            .ok_or_else(|| RpcError::UnknownService(name.to_string()))
                    });
                    async move {
                        let entry = lookup??;
                        Ok(Reply::Value(entry.spec().to_value()))
                    }
                }),
        )
}
