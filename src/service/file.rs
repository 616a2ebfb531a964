//! File transfer service.
//!
//! Worked example of both streaming directions: `upload` consumes an input
//! stream of byte chunks, `download` produces one.

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{CommandBuilder, Reply, ServiceDef};
use crate::error::RpcError;
use crate::stream::ValueStream;
use crate::value::{TypeTag, Value};

const DEFAULT_CHUNK_SIZE: i64 = 64 * 1024;

/// Build the `file` service.
pub fn file_service() -> ServiceDef {
    ServiceDef::new("file")
        .doc("Read and write files on the server.")
        .command(
            CommandBuilder::new("upload")
                .doc("Write streamed byte chunks to a path.")
                .param("data", TypeTag::stream(TypeTag::Bytes))
                .param("path", TypeTag::Str)
                .returns(TypeTag::None)
                .handler(|_ctx, mut args| async move {
                    let mut data = args.take_input()?;
                    let path = args.str(1)?.to_string();

                    let mut file = fs::File::create(&path)
                        .await
                        .map_err(|err| RpcError::Command(format!("create {path}: {err}")))?;
                    while let Some(chunk) = data.next().await {
                        let chunk = chunk?;
                        let bytes = chunk.as_bytes().ok_or_else(|| {
                            RpcError::BadArguments(format!(
                                "upload chunk is {}, expected bytes",
                                chunk.kind_name()
                            ))
                        })?;
                        file.write_all(bytes)
                            .await
                            .map_err(|err| RpcError::Command(format!("write {path}: {err}")))?;
                    }
                    file.flush()
                        .await
                        .map_err(|err| RpcError::Command(format!("flush {path}: {err}")))?;
                    Ok(Reply::Value(Value::Null))
                }),
        )
        .command(
            CommandBuilder::new("download")
                .doc("Stream a file back in byte chunks.")
                .param("path", TypeTag::Str)
                .param_default("chunk_size", TypeTag::Int, DEFAULT_CHUNK_SIZE)
                .returns(TypeTag::stream(TypeTag::Bytes))
                .handler(|_ctx, args| async move {
                    let path = args.str(0)?.to_string();
                    let chunk_size = args.int(1)?.max(1) as usize;

                    let mut file = fs::File::open(&path)
                        .await
                        .map_err(|err| RpcError::Command(format!("open {path}: {err}")))?;
                    Ok(Reply::Stream(ValueStream::spawn(move |tx| async move {
                        let mut buf = vec![0u8; chunk_size];
                        loop {
                            let n = file
                                .read(&mut buf)
                                .await
                                .map_err(|err| RpcError::Command(format!("read {path}: {err}")))?;
                            if n == 0 {
                                return Ok(());
                            }
                            tx.send(Value::Bytes(buf[..n].to_vec())).await?;
                        }
                    })))
                }),
        )
        .command(
            CommandBuilder::new("ls")
                .doc("List directory entries, sorted.")
                .param_default("path", TypeTag::Str, ".")
                .returns(TypeTag::list(TypeTag::Str))
                .handler(|_ctx, args| async move {
                    let path = args.str(0)?.to_string();
                    let mut dir = fs::read_dir(&path)
                        .await
                        .map_err(|err| RpcError::Command(format!("read {path}: {err}")))?;

                    let mut names = Vec::new();
                    while let Some(entry) = dir
                        .next_entry()
                        .await
                        .map_err(|err| RpcError::Command(format!("read {path}: {err}")))?
                    {
                        names.push(entry.file_name().to_string_lossy().into_owned());
                    }
                    names.sort();
                    Ok(Reply::Value(Value::List(
                        names.into_iter().map(Value::from).collect(),
                    )))
                }),
        )
}
