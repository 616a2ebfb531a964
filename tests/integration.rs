//! End-to-end tests: a real server and client talking over real
//! transports, exercising the documented call scenarios.

use std::time::Duration;

use snekrpc::{
    file_service, health_service, Client, ClientConfig, Codec, CommandBuilder, ErrorKind, Reply,
    RpcError, Server, ServerConfig, ServerHandle, ServiceDef, TypeTag, Value, ValueStream,
};

fn echo_service() -> ServiceDef {
    ServiceDef::new("echo").command(
        CommandBuilder::new("echo")
            .param("value", TypeTag::Str)
            .returns(TypeTag::Str)
            .handler(|_ctx, mut args| async move { Ok(Reply::Value(args.take(0))) }),
    )
}

fn math_service() -> ServiceDef {
    ServiceDef::new("math").command(
        CommandBuilder::new("add")
            .param("a", TypeTag::Int)
            .param("b", TypeTag::Int)
            .returns(TypeTag::Int)
            .handler(|_ctx, args| async move {
                Ok(Reply::Value(Value::Int(args.int(0)? + args.int(1)?)))
            }),
    )
}

fn slow_service() -> ServiceDef {
    ServiceDef::new("slow").command(
        CommandBuilder::new("nap")
            .param_default("seconds", TypeTag::Float, 5.0)
            .returns(TypeTag::None)
            .handler(|_ctx, args| async move {
                tokio::time::sleep(Duration::from_secs_f64(args.float(0)?)).await;
                Ok(Reply::Value(Value::Null))
            }),
    )
}

fn pipe_service() -> ServiceDef {
    ServiceDef::new("pipe").command(
        CommandBuilder::new("through")
            .param("data", TypeTag::stream(TypeTag::Any))
            .returns(TypeTag::stream(TypeTag::Any))
            .handler(|_ctx, mut args| async move {
                let mut input = args.take_input()?;
                Ok(Reply::Stream(ValueStream::spawn(move |tx| async move {
                    while let Some(item) = input.next().await {
                        tx.send(item?).await?;
                    }
                    Ok(())
                })))
            }),
    )
}

async fn start_server(url: &str) -> ServerHandle {
    let (_, handle) = start_server_with(url).await;
    handle
}

async fn start_server_with(url: &str) -> (Server, ServerHandle) {
    let server = Server::new(ServerConfig {
        url: url.parse().unwrap(),
        ..ServerConfig::default()
    });
    server.add_service(echo_service()).unwrap();
    server.add_service(math_service()).unwrap();
    server.add_service(slow_service()).unwrap();
    server.add_service(pipe_service()).unwrap();
    server.add_service(health_service()).unwrap();
    server.add_service(file_service()).unwrap();
    let handle = server.bind().await.unwrap();
    (server, handle)
}

fn client_for(handle: &ServerHandle) -> Client {
    Client::connect_to(&handle.url().to_string()).unwrap()
}

fn remote_kind(err: &RpcError) -> Option<ErrorKind> {
    match err {
        RpcError::Remote(remote) => Some(remote.kind),
        _ => None,
    }
}

#[tokio::test]
async fn test_echo_unary() {
    let handle = start_server("tcp://127.0.0.1:0").await;
    let client = client_for(&handle);

    let echo = client.service("echo").await.unwrap();
    let value = echo.call("echo", vec!["hello".into()]).await.unwrap();
    assert_eq!(value, Value::Str("hello".into()));
}

#[tokio::test]
async fn test_add_ints() {
    let handle = start_server("tcp://127.0.0.1:0").await;
    let client = client_for(&handle);

    let math = client.service("math").await.unwrap();
    let value = math
        .call("add", vec![Value::Int(2), Value::Int(3)])
        .await
        .unwrap();
    assert_eq!(value, Value::Int(5));

    // keyword arguments bind by name
    let value = math
        .call_kw(
            "add",
            vec![],
            vec![("b".into(), Value::Int(3)), ("a".into(), Value::Int(2))],
        )
        .await
        .unwrap();
    assert_eq!(value, Value::Int(5));
}

#[tokio::test]
async fn test_output_stream_ping() {
    let handle = start_server("tcp://127.0.0.1:0").await;
    let client = client_for(&handle);

    let health = client.service("health").await.unwrap();
    let stream = health
        .call_stream(
            "ping",
            vec![],
            vec![
                ("count".into(), Value::Int(3)),
                ("interval".into(), Value::Float(0.0)),
            ],
        )
        .await
        .unwrap();
    let items = stream.collect().await.unwrap();
    assert_eq!(items, vec![Value::Bool(true); 3]);
}

#[tokio::test]
async fn test_input_stream_upload() {
    let handle = start_server("tcp://127.0.0.1:0").await;
    let client = client_for(&handle);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("upload.bin");

    let file = client.service("file").await.unwrap();
    let input = ValueStream::from_values(vec![
        Value::Bytes(b"AB".to_vec()),
        Value::Bytes(b"CD".to_vec()),
    ]);
    let value = file
        .call_with_input(
            "upload",
            input,
            vec![path.to_str().unwrap().into()],
            vec![],
        )
        .await
        .unwrap();
    assert_eq!(value, Value::Null);
    assert_eq!(std::fs::read(&path).unwrap(), b"ABCD");
}

#[tokio::test]
async fn test_download_roundtrip() {
    let handle = start_server("tcp://127.0.0.1:0").await;
    let client = client_for(&handle);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.bin");
    let content: Vec<u8> = (0u8..=255).cycle().take(300_000).collect();
    std::fs::write(&path, &content).unwrap();

    let file = client.service("file").await.unwrap();
    let stream = file
        .call_stream("download", vec![path.to_str().unwrap().into()], vec![])
        .await
        .unwrap();
    let chunks = stream.collect().await.unwrap();

    let mut received = Vec::new();
    for chunk in chunks {
        received.extend_from_slice(chunk.as_bytes().unwrap());
    }
    assert_eq!(received, content);
}

#[tokio::test]
async fn test_unknown_command() {
    let handle = start_server("tcp://127.0.0.1:0").await;
    let client = client_for(&handle);

    let echo = client.service("echo").await.unwrap();
    // the proxy itself refuses commands missing from metadata
    let err = echo.call("nope", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::UnknownCommand(_)));
}

#[tokio::test]
async fn test_dispatch_miss_after_service_removal() {
    // A proxy built from earlier metadata goes stale once the service is
    // removed; the dispatcher reports the miss on the wire.
    let (server, handle) = start_server_with("tcp://127.0.0.1:0").await;
    let client = client_for(&handle);

    let echo = client.service("echo").await.unwrap();
    server.remove_service("echo").unwrap();

    let err = echo.call("echo", vec!["gone".into()]).await.unwrap_err();
    assert_eq!(remote_kind(&err), Some(ErrorKind::UnknownService));
}

#[tokio::test]
async fn test_unknown_service() {
    let handle = start_server("tcp://127.0.0.1:0").await;
    let client = client_for(&handle);

    let err = client.service("nope").await.unwrap_err();
    assert_eq!(remote_kind(&err), Some(ErrorKind::UnknownService));
}

#[tokio::test]
async fn test_bad_arguments() {
    let handle = start_server("tcp://127.0.0.1:0").await;
    let client = client_for(&handle);

    let echo = client.service("echo").await.unwrap();

    // missing required parameter
    let err = echo.call("echo", vec![]).await.unwrap_err();
    assert_eq!(remote_kind(&err), Some(ErrorKind::BadArguments));

    // type mismatch
    let err = echo.call("echo", vec![Value::Bool(true)]).await.unwrap_err();
    assert_eq!(remote_kind(&err), Some(ErrorKind::BadArguments));

    // unknown keyword
    let err = echo
        .call_kw("echo", vec!["x".into()], vec![("bogus".into(), Value::Int(1))])
        .await
        .unwrap_err();
    assert_eq!(remote_kind(&err), Some(ErrorKind::BadArguments));
}

#[tokio::test]
async fn test_concurrent_calls_are_isolated() {
    let handle = start_server("tcp://127.0.0.1:0").await;
    let client = client_for(&handle);
    let echo = client.service("echo").await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..100 {
        let echo = echo.clone();
        tasks.push(tokio::spawn(async move {
            let text = format!("message-{i}");
            let value = echo.call("echo", vec![text.as_str().into()]).await.unwrap();
            assert_eq!(value, Value::Str(text));
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn test_interleaved_streams() {
    let handle = start_server("tcp://127.0.0.1:0").await;
    let client = client_for(&handle);
    let health = client.service("health").await.unwrap();

    let mut streams = Vec::new();
    for count in [2i64, 5, 9] {
        let stream = health
            .call_stream(
                "ping",
                vec![],
                vec![
                    ("count".into(), Value::Int(count)),
                    ("interval".into(), Value::Float(0.001)),
                ],
            )
            .await
            .unwrap();
        streams.push((count, stream));
    }

    for (count, stream) in streams {
        let items = stream.collect().await.unwrap();
        assert_eq!(items.len(), count as usize);
    }
}

#[tokio::test]
async fn test_metadata_determinism() {
    let handle = start_server("tcp://127.0.0.1:0").await;
    let client = client_for(&handle);

    let first = client.services().await.unwrap();
    let second = client.services().await.unwrap();
    assert_eq!(first, second);
    assert!(first.contains_key("_meta"));
    assert!(first.contains_key("echo"));

    let names = client.service_names().await.unwrap();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
    assert!(!names.iter().any(|n| n.starts_with('_')));
}

#[tokio::test]
async fn test_metadata_drives_streaming_shape() {
    let handle = start_server("tcp://127.0.0.1:0").await;
    let client = client_for(&handle);

    let health = client.service("health").await.unwrap();
    let ping = health.spec().command("ping").unwrap();
    assert!(ping.output_streaming);
    assert_eq!(ping.returns, TypeTag::stream(TypeTag::Bool));
    assert_eq!(ping.params[0].default, Some(Value::Int(1)));

    // calling with the wrong shape is rejected before anything is sent
    let err = health.call("ping", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::BadArguments(_)));
}

#[tokio::test]
async fn test_dropping_stream_cancels() {
    let handle = start_server("tcp://127.0.0.1:0").await;
    let client = client_for(&handle);
    let health = client.service("health").await.unwrap();

    // endless ping
    let mut stream = health
        .call_stream(
            "ping",
            vec![],
            vec![
                ("count".into(), Value::Int(0)),
                ("interval".into(), Value::Float(0.001)),
            ],
        )
        .await
        .unwrap();
    for _ in 0..3 {
        assert_eq!(stream.next().await.unwrap().unwrap(), Value::Bool(true));
    }
    drop(stream);

    // the connection keeps working for other calls
    let echo = client.service("echo").await.unwrap();
    let value = echo.call("echo", vec!["still alive".into()]).await.unwrap();
    assert_eq!(value, Value::Str("still alive".into()));
}

#[tokio::test]
async fn test_call_timeout() {
    let handle = start_server("tcp://127.0.0.1:0").await;
    let client = client_for(&handle);

    let slow = client
        .service("slow")
        .await
        .unwrap()
        .with_timeout(Duration::from_millis(100));
    let err = slow.call("nap", vec![Value::Float(5.0)]).await.unwrap_err();
    assert!(matches!(err, RpcError::Timeout));

    // the connection survives the timed-out call
    let echo = client.service("echo").await.unwrap();
    assert!(echo.call("echo", vec!["ok".into()]).await.is_ok());
}

#[tokio::test]
async fn test_input_stream_error_aborts_call() {
    let handle = start_server("tcp://127.0.0.1:0").await;
    let client = client_for(&handle);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("partial.bin");

    let input = ValueStream::spawn(|tx| async move {
        tx.send(Value::Bytes(b"AB".to_vec())).await?;
        Err(RpcError::Command("local read failed".into()))
    });

    let file = client.service("file").await.unwrap();
    let err = file
        .call_with_input(
            "upload",
            input,
            vec![path.to_str().unwrap().into()],
            vec![],
        )
        .await
        .unwrap_err();
    assert_eq!(remote_kind(&err), Some(ErrorKind::Command));
}

#[tokio::test]
async fn test_dual_streaming() {
    let handle = start_server("tcp://127.0.0.1:0").await;
    let client = client_for(&handle);

    let pipe = client.service("pipe").await.unwrap();
    let input = ValueStream::from_values(vec![
        Value::Int(1),
        Value::Str("two".into()),
        Value::Bool(true),
    ]);
    let stream = pipe
        .call_stream_with_input("through", input, vec![], vec![])
        .await
        .unwrap();
    let items = stream.collect().await.unwrap();
    assert_eq!(
        items,
        vec![Value::Int(1), Value::Str("two".into()), Value::Bool(true)]
    );
}

#[tokio::test]
async fn test_service_alias() {
    let server = Server::new(ServerConfig {
        url: "tcp://127.0.0.1:0".parse().unwrap(),
        ..ServerConfig::default()
    });
    server.add_service_as(echo_service(), "repeat").unwrap();
    let handle = server.bind().await.unwrap();

    let client = client_for(&handle);
    let repeat = client.service("repeat").await.unwrap();
    let value = repeat.call("echo", vec!["aliased".into()]).await.unwrap();
    assert_eq!(value, Value::Str("aliased".into()));

    let err = client.service("echo").await.unwrap_err();
    assert_eq!(remote_kind(&err), Some(ErrorKind::UnknownService));
}

#[tokio::test]
async fn test_connect_failure_retries_then_errors() {
    // a port that nothing listens on
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let client = Client::new(ClientConfig {
        url: format!("tcp://127.0.0.1:{port}").parse().unwrap(),
        retry_count: 2,
        retry_interval: Duration::from_millis(10),
        ..ClientConfig::default()
    });
    let err = client.connect().await.unwrap_err();
    assert!(err.is_transport());
}

#[tokio::test]
async fn test_unix_transport() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("rpc.sock");
    let handle = start_server(&format!("unix://{}", sock.display())).await;
    let client = client_for(&handle);

    let echo = client.service("echo").await.unwrap();
    let value = echo.call("echo", vec!["over unix".into()]).await.unwrap();
    assert_eq!(value, Value::Str("over unix".into()));

    // streaming works the same over unix sockets
    let health = client.service("health").await.unwrap();
    let stream = health
        .call_stream(
            "ping",
            vec![],
            vec![
                ("count".into(), Value::Int(2)),
                ("interval".into(), Value::Float(0.0)),
            ],
        )
        .await
        .unwrap();
    assert_eq!(stream.collect().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_http_transport_unary_and_stream() {
    let handle = start_server("http://127.0.0.1:0").await;
    let client = client_for(&handle);

    let echo = client.service("echo").await.unwrap();
    let value = echo.call("echo", vec!["over http".into()]).await.unwrap();
    assert_eq!(value, Value::Str("over http".into()));

    let health = client.service("health").await.unwrap();
    let stream = health
        .call_stream(
            "ping",
            vec![],
            vec![
                ("count".into(), Value::Int(3)),
                ("interval".into(), Value::Float(0.0)),
            ],
        )
        .await
        .unwrap();
    assert_eq!(stream.collect().await.unwrap(), vec![Value::Bool(true); 3]);
}

#[tokio::test]
async fn test_http_transport_upload() {
    let handle = start_server("http://127.0.0.1:0").await;
    let client = client_for(&handle);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("http-upload.bin");

    let file = client.service("file").await.unwrap();
    let input = ValueStream::from_values(vec![
        Value::Bytes(b"over".to_vec()),
        Value::Bytes(b" http".to_vec()),
    ]);
    file.call_with_input(
        "upload",
        input,
        vec![path.to_str().unwrap().into()],
        vec![],
    )
    .await
    .unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"over http");
}

#[tokio::test]
async fn test_http_concurrent_calls() {
    let handle = start_server("http://127.0.0.1:0").await;
    let client = client_for(&handle);
    let echo = client.service("echo").await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..20 {
        let echo = echo.clone();
        tasks.push(tokio::spawn(async move {
            let text = format!("http-{i}");
            let value = echo.call("echo", vec![text.as_str().into()]).await.unwrap();
            assert_eq!(value, Value::Str(text));
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn test_pinned_codec_skips_handshake() {
    // server and client both fixed to json; no HELLO is exchanged
    let server = Server::new(ServerConfig {
        url: "tcp://127.0.0.1:0".parse().unwrap(),
        codec: Codec::Json,
        ..ServerConfig::default()
    });
    server.add_service(echo_service()).unwrap();
    let handle = server.bind().await.unwrap();

    let client = Client::new(ClientConfig {
        url: handle.url().to_string().parse().unwrap(),
        codec: Some(Codec::Json),
        ..ClientConfig::default()
    });
    let echo = client.service("echo").await.unwrap();
    let value = echo.call("echo", vec!["pinned".into()]).await.unwrap();
    assert_eq!(value, Value::Str("pinned".into()));
}

#[tokio::test]
async fn test_negotiated_json_bytes_roundtrip() {
    // json servers still carry bytes faithfully thanks to tag coercion
    let server = Server::new(ServerConfig {
        url: "tcp://127.0.0.1:0".parse().unwrap(),
        codec: Codec::Json,
        ..ServerConfig::default()
    });
    server.add_service(file_service()).unwrap();
    let handle = server.bind().await.unwrap();

    let client = Client::new(ClientConfig {
        url: handle.url().to_string().parse().unwrap(),
        codec: Some(Codec::Json),
        ..ClientConfig::default()
    });

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("json-bytes.bin");
    std::fs::write(&path, [0u8, 1, 2, 253, 254, 255]).unwrap();

    let file = client.service("file").await.unwrap();
    let stream = file
        .call_stream("download", vec![path.to_str().unwrap().into()], vec![])
        .await
        .unwrap();
    let chunks = stream.collect().await.unwrap();
    assert_eq!(chunks, vec![Value::Bytes(vec![0, 1, 2, 253, 254, 255])]);
}

#[tokio::test]
async fn test_remote_command_error_surfaces() {
    let handle = start_server("tcp://127.0.0.1:0").await;
    let client = client_for(&handle);

    let file = client.service("file").await.unwrap();
    let err = file
        .call_stream("download", vec!["/no/such/path".into()], vec![])
        .await
        .unwrap()
        .collect()
        .await
        .unwrap_err();
    assert_eq!(remote_kind(&err), Some(ErrorKind::Command));
}

#[tokio::test]
async fn test_status_reports_codec_and_transport() {
    let handle = start_server("tcp://127.0.0.1:0").await;
    let client = client_for(&handle);

    let status = client.status().await.unwrap();
    assert_eq!(status.get("codec").unwrap().as_str(), Some("msgpack"));
    assert_eq!(status.get("transport").unwrap().as_str(), Some("tcp"));
}
