//! # snekrpc CLI
//!
//! Metadata-driven front-end for snekrpc servers. The binary knows no
//! command at build time: `call` and `services` fetch `_meta` metadata and
//! use it to bind arguments, choose unary or streaming invocation, and
//! render help.
//!
//! ```bash
//! # Serve the built-in services over TCP
//! snekrpc serve -u tcp://127.0.0.1:12321 -s health -s file
//!
//! # Invoke a command; parameters are name=value pairs or positional
//! snekrpc call -u tcp://127.0.0.1:12321 health ping count=3 interval=0
//!
//! # Upload: a stream<bytes> first parameter takes a path, or - for stdin
//! snekrpc call -u tcp://127.0.0.1:12321 file upload ./local.bin path=/tmp/copy
//!
//! # Render metadata help
//! snekrpc services -u tcp://127.0.0.1:12321
//! ```

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use argh::FromArgs;
use tokio::io::AsyncReadExt;

use snekrpc::{
    file_service, health_service, Client, ClientConfig, Codec, CommandSpec, Server, ServerConfig,
    ServiceDef, ServiceSpec, TypeTag, Value, ValueStream,
};

/// File/stdin chunk size for streaming input parameters.
const UPLOAD_CHUNK: usize = 64 * 1024;

#[derive(FromArgs)]
/// snekrpc - service-oriented RPC over pluggable transports and codecs
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Call(CallArgs),
    Services(ServicesArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// serve built-in services
struct ServeArgs {
    /// endpoint to listen on (tcp://, unix://, http://)
    #[argh(option, short = 'u', default = "snekrpc::url::DEFAULT_URL.into()")]
    url: String,

    /// codec assumed for clients that skip the handshake
    #[argh(option, short = 'c', default = "\"msgpack\".into()")]
    codec: String,

    /// service to expose, NAME or NAME=ALIAS; repeatable (health, file)
    #[argh(option, short = 's', long = "service")]
    services: Vec<String>,

    /// include tracebacks in error responses
    #[argh(switch)]
    tracebacks: bool,

    /// version string reported by _meta.status
    #[argh(option)]
    version: Option<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call a command on a server
struct CallArgs {
    /// server endpoint
    #[argh(option, short = 'u', default = "snekrpc::url::DEFAULT_URL.into()")]
    url: String,

    /// pin a codec instead of negotiating (json, msgpack)
    #[argh(option, short = 'c')]
    codec: Option<String>,

    /// per-call deadline in seconds
    #[argh(option, short = 't')]
    timeout: Option<f64>,

    /// service name
    #[argh(positional)]
    service: String,

    /// command name
    #[argh(positional)]
    command: String,

    /// arguments: positional values or name=value pairs; a streaming
    /// first parameter takes a file path or - for stdin
    #[argh(positional)]
    args: Vec<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "services")]
/// render metadata help for a server's services
struct ServicesArgs {
    /// server endpoint
    #[argh(option, short = 'u', default = "snekrpc::url::DEFAULT_URL.into()")]
    url: String,

    /// pin a codec instead of negotiating (json, msgpack)
    #[argh(option, short = 'c')]
    codec: Option<String>,

    /// show a single service
    #[argh(positional)]
    service: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Keep call/services output clean for piping; log only when serving.
    if matches!(cli.command, Commands::Serve(_)) {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Call(args) => run_call(args).await,
        Commands::Services(args) => run_services(args).await,
    }
}

fn builtin_service(name: &str) -> Result<ServiceDef> {
    match name {
        "health" => Ok(health_service()),
        "file" => Ok(file_service()),
        other => bail!("unknown service {other:?} (known: health, file)"),
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let codec = Codec::by_name(&args.codec)
        .ok_or_else(|| anyhow!("unknown codec {:?} (known: msgpack, json)", args.codec))?;
    let server = Server::new(ServerConfig {
        url: args.url.parse()?,
        codec,
        version: args.version,
        expose_tracebacks: args.tracebacks,
        ..ServerConfig::default()
    });

    for spec in &args.services {
        let (name, alias) = match spec.split_once('=') {
            Some((name, alias)) => (name, Some(alias)),
            None => (spec.as_str(), None),
        };
        let svc = builtin_service(name)?;
        match alias {
            Some(alias) => server.add_service_as(svc, alias)?,
            None => server.add_service(svc)?,
        }
    }

    server.serve().await?;
    Ok(())
}

fn make_client(url: &str, codec: Option<&str>, timeout: Option<f64>) -> Result<Client> {
    let codec = codec
        .map(|name| {
            Codec::by_name(name).ok_or_else(|| anyhow!("unknown codec {name:?} (known: msgpack, json)"))
        })
        .transpose()?;
    Ok(Client::new(ClientConfig {
        url: url.parse()?,
        codec,
        call_timeout: timeout.map(Duration::from_secs_f64),
        ..ClientConfig::default()
    }))
}

async fn run_call(args: CallArgs) -> Result<()> {
    let client = make_client(&args.url, args.codec.as_deref(), args.timeout)?;
    let proxy = client.service(&args.service).await?;
    let spec = proxy
        .spec()
        .command(&args.command)
        .ok_or_else(|| anyhow!("unknown command {}.{}", args.service, args.command))?
        .clone();

    let (positional, kwargs, input) = bind_cli_args(&spec, &args.args).await?;

    if spec.output_streaming {
        let mut stream = match input {
            Some(input) => {
                proxy
                    .call_stream_with_input(&args.command, input, positional, kwargs)
                    .await?
            }
            None => proxy.call_stream(&args.command, positional, kwargs).await?,
        };
        while let Some(item) = stream.next().await {
            println!("{}", render(&item?)?);
        }
    } else {
        let value = match input {
            Some(input) => {
                proxy
                    .call_with_input(&args.command, input, positional, kwargs)
                    .await?
            }
            None => proxy.call_kw(&args.command, positional, kwargs).await?,
        };
        println!("{}", render(&value)?);
    }

    client.close().await;
    Ok(())
}

/// Partition raw CLI arguments into positional values, keyword values, and
/// the streaming input source, coercing each by its declared type tag.
async fn bind_cli_args(
    spec: &CommandSpec,
    raw: &[String],
) -> Result<(Vec<Value>, Vec<(String, Value)>, Option<ValueStream>)> {
    let mut raw = raw.iter();

    // A streaming first parameter consumes the first positional argument
    // as its source: a file path or - for standard input.
    let input = if spec.input_streaming() {
        let source = raw
            .next()
            .ok_or_else(|| anyhow!("{}: missing input source (path or -)", spec.name))?;
        Some(input_stream(source).await?)
    } else {
        None
    };

    let params: Vec<_> = if spec.input_streaming() {
        spec.params[1..].to_vec()
    } else {
        spec.params.clone()
    };

    let mut positional = Vec::new();
    let mut kwargs = Vec::new();
    for arg in raw {
        match arg.split_once('=') {
            Some((name, text)) if params.iter().any(|p| p.name == name) => {
                let param = params.iter().find(|p| p.name == name).expect("checked");
                kwargs.push((name.to_string(), parse_value(text, &param.ty)?));
            }
            _ => {
                let param = params.get(positional.len()).ok_or_else(|| {
                    anyhow!("{}: too many arguments at {arg:?}", spec.name)
                })?;
                positional.push(parse_value(arg, &param.ty)?);
            }
        }
    }

    Ok((positional, kwargs, input))
}

/// Parse one CLI argument by its declared tag. Strings pass through
/// verbatim; structured tags parse as JSON.
fn parse_value(text: &str, tag: &TypeTag) -> Result<Value> {
    match tag {
        TypeTag::Str => Ok(Value::Str(text.to_string())),
        TypeTag::Bytes => Ok(Value::Bytes(text.as_bytes().to_vec())),
        TypeTag::Any => Ok(Codec::Json
            .decode(text.as_bytes(), None)
            .unwrap_or_else(|_| Value::Str(text.to_string()))),
        TypeTag::Optional(_) if text == "null" => Ok(Value::Null),
        TypeTag::Optional(inner) => parse_value(text, inner),
        _ => Codec::Json
            .decode(text.as_bytes(), Some(tag))
            .with_context(|| format!("cannot parse {text:?} as {tag}")),
    }
}

/// Build a byte-chunk stream from a file path or standard input.
async fn input_stream(source: &str) -> Result<ValueStream> {
    if source == "-" {
        return Ok(ValueStream::spawn(|tx| async move {
            let mut stdin = tokio::io::stdin();
            let mut buf = vec![0u8; UPLOAD_CHUNK];
            loop {
                let n = stdin.read(&mut buf).await.map_err(snekrpc::RpcError::Io)?;
                if n == 0 {
                    return Ok(());
                }
                tx.send(Value::Bytes(buf[..n].to_vec())).await?;
            }
        }));
    }

    let mut file = tokio::fs::File::open(source)
        .await
        .with_context(|| format!("cannot open {source:?}"))?;
    Ok(ValueStream::spawn(move |tx| async move {
        let mut buf = vec![0u8; UPLOAD_CHUNK];
        loop {
            let n = file.read(&mut buf).await.map_err(snekrpc::RpcError::Io)?;
            if n == 0 {
                return Ok(());
            }
            tx.send(Value::Bytes(buf[..n].to_vec())).await?;
        }
    }))
}

/// Render a value as JSON text for the terminal.
fn render(value: &Value) -> Result<String> {
    let bytes = Codec::Json.encode(value, None)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

async fn run_services(args: ServicesArgs) -> Result<()> {
    let client = make_client(&args.url, args.codec.as_deref(), None)?;

    match &args.service {
        Some(name) => {
            let proxy = client.service(name).await?;
            print_service(proxy.spec());
        }
        None => {
            for (_, spec) in client.services().await? {
                print_service(&spec);
                println!();
            }
        }
    }

    client.close().await;
    Ok(())
}

fn print_service(spec: &ServiceSpec) {
    match &spec.doc {
        Some(doc) => println!("{} - {doc}", spec.name),
        None => println!("{}", spec.name),
    }
    for command in &spec.commands {
        let params: Vec<String> = command
            .params
            .iter()
            .filter(|p| !p.hidden)
            .map(|p| match &p.default {
                Some(default) => format!(
                    "{}: {} = {}",
                    p.name,
                    p.ty,
                    render(default).unwrap_or_else(|_| "?".into())
                ),
                None => format!("{}: {}", p.name, p.ty),
            })
            .collect();
        println!("  {}({}) -> {}", command.name, params.join(", "), command.returns);
        if let Some(doc) = &command.doc {
            println!("      {doc}");
        }
    }
}
