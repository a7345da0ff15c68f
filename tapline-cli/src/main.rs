use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use clap::Parser;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_openssl::SslStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tapline_intercept::{
    AuthorityProvider, CLIENT_IP_HEADER, DefaultResolver, InterceptConfig, Interceptor,
    TLS_MARKER_HEADER, TelemetryEvents, splice,
};
use tapline_net::{ParseStatus, RequestPreamble, RequestPreambleParser};

#[derive(Debug, Parser)]
#[command(name = "tapline")]
struct Cli {
    /// Address the proxy listens on.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Port the proxy listens on.
    #[arg(long, default_value_t = 8080)]
    port: u16,
    /// Directory holding the interception authority, created there on first
    /// use. Without it the authority lives in memory only.
    #[arg(long = "authority-dir")]
    authority_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "tapline_cli=info,tapline_intercept=info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let provider = match &cli.authority_dir {
        Some(dir) => AuthorityProvider::new(dir, "tapline").map_err(|err| err.to_string())?,
        None => AuthorityProvider::ephemeral("tapline").map_err(|err| err.to_string())?,
    };

    let config = InterceptConfig {
        host: cli.host.clone(),
        port: cli.port,
    };
    let (interceptor, events) =
        Interceptor::new(config, Arc::new(DefaultResolver), Arc::new(provider));
    let interceptor = Arc::new(interceptor);

    tokio::spawn(print_events(events));

    let listener = TcpListener::bind((cli.host.as_str(), cli.port))
        .await
        .map_err(|err| err.to_string())?;
    info!(host = %cli.host, port = cli.port, "tapline listening");

    let accept_loop = async {
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    debug!(peer = %peer, "connection accepted");
                    let interceptor = Arc::clone(&interceptor);
                    tokio::spawn(async move {
                        if let Err(err) = serve_connection(interceptor, socket).await {
                            debug!(error = %err, "connection failed");
                        }
                    });
                }
                Err(err) => warn!(error = %err, "accept failed"),
            }
        }
    };

    tokio::select! {
        _ = accept_loop => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            interceptor.teardown().await;
        }
    }

    Ok(())
}

/// Prints every exchange event as one JSON line on stdout.
async fn print_events(mut events: TelemetryEvents) {
    while let Some(event) = events.next().await {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(err) => debug!(error = %err, "event serialization failed"),
        }
    }
}

async fn serve_connection(
    interceptor: Arc<Interceptor>,
    mut socket: TcpStream,
) -> Result<(), String> {
    let Some(preamble) = read_preamble(&mut socket).await? else {
        return Ok(());
    };

    if preamble.head.line.method.eq_ignore_ascii_case("CONNECT") {
        let target = &preamble.head.line.target;
        let hostname = target
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(target.as_str())
            .to_string();
        socket
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await
            .map_err(|err| err.to_string())?;
        interceptor
            .dispatch(socket, &hostname)
            .await
            .map_err(|err| err.to_string())
    } else {
        forward_plain(preamble, socket).await
    }
}

async fn read_preamble(socket: &mut TcpStream) -> Result<Option<RequestPreamble>, String> {
    let mut parser = RequestPreambleParser::new();
    let mut temp = vec![0u8; 8192];
    loop {
        let n = socket.read(&mut temp).await.map_err(|err| err.to_string())?;
        if n == 0 {
            return Ok(None);
        }
        match parser.push(&temp[..n]) {
            ParseStatus::NeedMore { .. } => continue,
            ParseStatus::Complete { preamble, .. } => return Ok(Some(preamble)),
            ParseStatus::Error { error, .. } => {
                return Err(format!("malformed request head: {error:?}"));
            }
        }
    }
}

/// Minimal plaintext pipeline: reads the markers the interceptor adds when
/// it terminates TLS, strips them, and forwards the request to the host the
/// head names.
async fn forward_plain(preamble: RequestPreamble, socket: TcpStream) -> Result<(), String> {
    let mut head = preamble.head.clone();
    let was_tls = head.header(TLS_MARKER_HEADER) == Some("1");
    let client_ip = head.header(CLIENT_IP_HEADER).map(str::to_string);
    head.remove_header(TLS_MARKER_HEADER);
    head.remove_header(CLIENT_IP_HEADER);

    let Some(host_header) = head.header("host").map(str::to_string) else {
        return Err("request without host header".to_string());
    };
    let (host, port) = match host_header.rsplit_once(':') {
        Some((name, port)) => (
            name.to_string(),
            port.parse::<u16>().map_err(|err| err.to_string())?,
        ),
        None => (host_header.clone(), if was_tls { 443 } else { 80 }),
    };

    info!(
        method = %head.line.method,
        host = %host_header,
        target = %head.line.target,
        tls = was_tls,
        client_ip = client_ip.as_deref().unwrap_or("unknown"),
        "forwarding request"
    );

    let upstream = TcpStream::connect((host.as_str(), port))
        .await
        .map_err(|err| err.to_string())?;
    let outbound = preamble.rebuild(&head);
    if was_tls {
        let mut upstream = connect_tls(upstream, &host).await?;
        upstream
            .write_all(&outbound)
            .await
            .map_err(|err| err.to_string())?;
        splice(socket, upstream).await.map_err(|err| err.to_string())
    } else {
        let mut upstream = upstream;
        upstream
            .write_all(&outbound)
            .await
            .map_err(|err| err.to_string())?;
        splice(socket, upstream).await.map_err(|err| err.to_string())
    }
}

async fn connect_tls(stream: TcpStream, host: &str) -> Result<SslStream<TcpStream>, String> {
    let mut builder = SslConnector::builder(SslMethod::tls()).map_err(|err| err.to_string())?;
    builder.set_verify(SslVerifyMode::NONE);
    let ssl = builder
        .build()
        .configure()
        .map_err(|err| err.to_string())?
        .into_ssl(host)
        .map_err(|err| err.to_string())?;
    let mut session = SslStream::new(ssl, stream).map_err(|err| err.to_string())?;
    Pin::new(&mut session)
        .connect()
        .await
        .map_err(|err| err.to_string())?;
    Ok(session)
}
