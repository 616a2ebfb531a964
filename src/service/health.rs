//! Heartbeat service.

use std::time::Duration;

use super::{CommandBuilder, Reply, ServiceDef};
use crate::stream::ValueStream;
use crate::value::{TypeTag, Value};

/// Build the `health` service.
///
/// `ping` streams `true` once per interval; a non-positive count keeps the
/// stream open until the caller cancels.
pub fn health_service() -> ServiceDef {
    ServiceDef::new("health")
        .doc("Heartbeat commands for monitoring.")
        .command(
            CommandBuilder::new("ping")
                .doc("Stream `true` to prove liveness.")
                .param_default("count", TypeTag::Int, 1i64)
                .param_default("interval", TypeTag::Float, 1.0f64)
                .returns(TypeTag::stream(TypeTag::Bool))
                .handler(|_ctx, args| async move {
                    let count = args.int(0)?;
                    let interval = args.float(1)?;
                    Ok(Reply::Stream(ValueStream::spawn(move |tx| async move {
                        let mut sent = 0i64;
                        loop {
                            if count > 0 && sent >= count {
                                return Ok(());
                            }
                            if sent > 0 && interval > 0.0 {
                                tokio::time::sleep(Duration::from_secs_f64(interval)).await;
                            }
                            tx.send(Value::Bool(true)).await?;
                            sent += 1;
                        }
                    })))
                }),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{bind_args, CallContext};

    #[tokio::test]
    async fn test_ping_counts() {
        let svc = health_service();
        let def = svc.commands().iter().find(|d| d.spec.name == "ping").unwrap();

        let args = bind_args(
            &def.spec,
            vec![Value::Int(3), Value::Float(0.0)],
            vec![],
            None,
        )
        .unwrap();
        let reply = def.invoke(CallContext::local(), args).await.unwrap();
        let stream = match reply {
            Reply::Stream(s) => s,
            Reply::Value(_) => panic!("ping streams"),
        };
        let items = stream.collect().await.unwrap();
        assert_eq!(items, vec![Value::Bool(true); 3]);
    }

    #[tokio::test]
    async fn test_ping_defaults_to_single_beat() {
        let svc = health_service();
        let def = svc.commands().iter().find(|d| d.spec.name == "ping").unwrap();

        let args = bind_args(&def.spec, vec![], vec![], None).unwrap();
        let reply = def.invoke(CallContext::local(), args).await.unwrap();
        let stream = match reply {
            Reply::Stream(s) => s,
            Reply::Value(_) => panic!("ping streams"),
        };
        assert_eq!(stream.collect().await.unwrap().len(), 1);
    }
}
