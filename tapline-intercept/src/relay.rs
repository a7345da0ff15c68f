use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_openssl::SslStream;
use url::Url;
use uuid::Uuid;

use tapline_net::{Header, ParseStatus, RequestHead, RequestPreamble, ResponsePreambleParser};

use crate::config::LOOPBACK_HOST;
use crate::dispatch::InterceptState;
use crate::events::{ExchangeEvent, ExchangeEventKind};
use crate::record::{ExchangeRecord, RequestRecord, ResponseRecord, StatusValue, now_millis};
use crate::rules::ResolvedRules;

/// Budget for the whole upstream setup: rule evaluation, name resolution and
/// every connect hop. Cleared once bytes start moving.
const RELAY_TIMEOUT: Duration = Duration::from_secs(36);

pub(crate) enum RelayMode {
    /// Upgrade arrived in cleartext on the dispatcher.
    Plain,
    /// Upgrade arrived over a terminated TLS session. `client_ip` is the
    /// address recovered from the loopback bridge, when the bridge was still
    /// registered.
    Secure { client_ip: Option<String> },
}

enum RelayFailure {
    /// A side went away before the exchange produced a response.
    Abort,
    Error(String),
}

/// Upstream after every configured hop, ready to carry the upgrade.
enum ConnectedUpstream {
    Plain(TcpStream),
    Tls(SslStream<TcpStream>),
}

struct Telemetry {
    sender: Option<mpsc::Sender<ExchangeEvent>>,
    exchange_id: Uuid,
}

struct Exchange {
    record: ExchangeRecord,
    telemetry: Telemetry,
    full_url: String,
    secure: bool,
}

impl Exchange {
    async fn emit(&self, kind: ExchangeEventKind) {
        let Some(sender) = &self.telemetry.sender else {
            return;
        };
        let _ = sender
            .send(ExchangeEvent {
                event_id: Uuid::new_v4(),
                exchange_id: self.telemetry.exchange_id,
                kind,
                record: self.record.clone(),
            })
            .await;
    }
}

/// Relays one upgrade exchange end to end: resolves rules, dials the
/// upstream (through a proxy hop when configured), forwards the preamble,
/// mirrors the response and then splices bytes until either side closes.
///
/// Emits `Request` as soon as the head is accepted, `Send` once the upstream
/// address is known, and exactly one of `End`, `Abort` or `Error` as the
/// terminal, whatever order the sockets fail in.
pub(crate) async fn relay_upgrade<S>(
    state: Arc<InterceptState>,
    mut client: S,
    preamble: RequestPreamble,
    peer_ip: String,
    mode: RelayMode,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let secure = matches!(mode, RelayMode::Secure { .. });
    let Some(host_header) = preamble.head.header("host").map(str::to_string) else {
        return;
    };
    let scheme = if secure { "wss" } else { "ws" };
    let full_url = format!("{scheme}://{host_header}{}", preamble.head.line.target);

    let rules = state.resolver.resolve_rules(&full_url);
    let filter = state.resolver.resolve_filter(&full_url);
    let client_ip = match mode {
        RelayMode::Secure { client_ip } => client_ip.unwrap_or(peer_ip),
        RelayMode::Plain => peer_ip,
    };

    let mut exchange = Exchange {
        record: ExchangeRecord {
            url: full_url.clone(),
            real_url: None,
            resolved_rule: rules.rule.clone(),
            start_time: now_millis(),
            request_time: None,
            dns_time: None,
            response_time: None,
            end_time: None,
            req_error: false,
            res_error: false,
            request: RequestRecord {
                ip: client_ip,
                method: preamble.head.line.method.to_ascii_uppercase(),
                http_version: preamble.head.line.version.as_str().to_string(),
                headers: header_pairs(&preamble.head.headers),
                body: None,
            },
            response: ResponseRecord::default(),
        },
        telemetry: Telemetry {
            sender: (!filter.hide).then(|| state.sender.clone()),
            exchange_id: Uuid::new_v4(),
        },
        full_url,
        secure,
    };

    exchange.emit(ExchangeEventKind::Request).await;

    let result = run_exchange(&state, &mut client, &preamble, &rules, &mut exchange).await;
    if let Err(failure) = result {
        exchange.record.response_time = Some(now_millis());
        exchange.record.end_time = exchange.record.response_time;
        if exchange.record.response.ip.is_none() {
            exchange.record.response.ip = Some(LOOPBACK_HOST.to_string());
        }
        match failure {
            RelayFailure::Abort => {
                exchange.record.req_error = true;
                exchange.record.response.status = Some(StatusValue::Text("aborted".to_string()));
                exchange.record.request.body = Some("aborted".to_string());
                exchange.emit(ExchangeEventKind::Abort).await;
            }
            RelayFailure::Error(message) => {
                exchange.record.res_error = true;
                if exchange.record.response.status.is_none() {
                    exchange.record.response.status = Some(StatusValue::Code(502));
                }
                exchange.record.response.body = Some(message);
                exchange.emit(ExchangeEventKind::Error).await;
            }
        }
    }
}

async fn run_exchange<S>(
    state: &InterceptState,
    client: &mut S,
    preamble: &RequestPreamble,
    rules: &ResolvedRules,
    exchange: &mut Exchange,
) -> Result<(), RelayFailure>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // Bytes the client sends while the upstream is still being dialed are
    // held back and forwarded right after the preamble.
    let mut early = Vec::new();
    let (upstream, matched) = {
        let setup = establish_upstream(state, rules, &preamble.head, exchange);
        tokio::pin!(setup);
        let watchdog = tokio::time::sleep(RELAY_TIMEOUT);
        tokio::pin!(watchdog);
        let mut temp = vec![0u8; 8192];
        loop {
            tokio::select! {
                result = &mut setup => break result?,
                read = client.read(&mut temp) => match read {
                    Ok(0) => return Err(RelayFailure::Abort),
                    Ok(n) => early.extend_from_slice(&temp[..n]),
                    Err(err) => return Err(RelayFailure::Error(err.to_string())),
                },
                _ = &mut watchdog => {
                    return Err(RelayFailure::Error("connection timed out".to_string()));
                }
            }
        }
    };

    match upstream {
        ConnectedUpstream::Plain(stream) => {
            pipe(client, stream, preamble, matched, early, exchange).await
        }
        ConnectedUpstream::Tls(stream) => {
            pipe(client, stream, preamble, matched, early, exchange).await
        }
    }
}

/// Resolves where the exchange actually goes and dials it. Emits `Send` the
/// moment the address is known, before any connect attempt.
async fn establish_upstream(
    state: &InterceptState,
    rules: &ResolvedRules,
    head: &RequestHead,
    exchange: &mut Exchange,
) -> Result<(ConnectedUpstream, Option<Url>), RelayFailure> {
    if let Some(proxy_url) = rules.proxy_url() {
        let upstream = connect_via_proxy(state, proxy_url, head, exchange).await?;
        return Ok((upstream, None));
    }

    let matched = match rules.target_url() {
        Some(target) if target.starts_with("ws://") || target.starts_with("wss://") => {
            let parsed = Url::parse(target).map_err(|err| {
                RelayFailure::Error(format!("invalid target url {target}: {err}"))
            })?;
            exchange.record.real_url = Some(target.to_string());
            exchange.full_url = target.to_string();
            Some(parsed)
        }
        _ => None,
    };

    let target = Url::parse(&exchange.full_url)
        .map_err(|err| RelayFailure::Error(format!("invalid url {}: {err}", exchange.full_url)))?;
    let Some(host) = target.host_str().map(str::to_string) else {
        return Err(RelayFailure::Error(format!(
            "no host in {}",
            exchange.full_url
        )));
    };
    let port = target
        .port_or_known_default()
        .unwrap_or(if target.scheme() == "wss" { 443 } else { 80 });

    let lookup_url = exchange.full_url.clone();
    let ip = resolve_and_mark(state, &lookup_url, exchange).await?;
    let stream = TcpStream::connect((ip, port))
        .await
        .map_err(|err| RelayFailure::Error(err.to_string()))?;
    if target.scheme() == "wss" {
        let session = connect_tls_upstream(stream, &host).await?;
        Ok((ConnectedUpstream::Tls(session), matched))
    } else {
        Ok((ConnectedUpstream::Plain(stream), matched))
    }
}

/// Dials the configured proxy and tunnels through it toward the original
/// target, refusing to tunnel into this interceptor itself.
async fn connect_via_proxy(
    state: &InterceptState,
    proxy_url: &Url,
    head: &RequestHead,
    exchange: &mut Exchange,
) -> Result<ConnectedUpstream, RelayFailure> {
    let is_socks = matches!(proxy_url.scheme(), "socks" | "socks5");
    exchange.record.real_url = Some(proxy_url.to_string());

    let Some(proxy_host) = proxy_url.host_str().map(str::to_string) else {
        return Err(RelayFailure::Error(format!(
            "no host in proxy url {proxy_url}"
        )));
    };
    let scheme = if exchange.secure { "wss" } else { "ws" };
    let lookup_url = match proxy_url.port() {
        Some(port) => format!("{scheme}://{proxy_host}:{port}"),
        None => format!("{scheme}://{proxy_host}"),
    };
    let ip = resolve_and_mark(state, &lookup_url, exchange).await?;

    // the url crate strips scheme-default ports, so compare the port that
    // will actually be dialed
    let proxy_port = proxy_url
        .port_or_known_default()
        .unwrap_or(if is_socks { 1080 } else { 80 });
    if proxy_port == state.config.port && is_local_address(ip) {
        return Err(RelayFailure::Error(format!(
            "refusing to tunnel through this proxy itself at {ip}"
        )));
    }

    let target = Url::parse(&exchange.full_url)
        .map_err(|err| RelayFailure::Error(format!("invalid url {}: {err}", exchange.full_url)))?;
    let Some(target_host) = target.host_str().map(str::to_string) else {
        return Err(RelayFailure::Error(format!(
            "no host in {}",
            exchange.full_url
        )));
    };
    let target_port = target
        .port_or_known_default()
        .unwrap_or(if exchange.secure { 443 } else { 80 });

    let stream = TcpStream::connect((ip, proxy_port))
        .await
        .map_err(|err| RelayFailure::Error(err.to_string()))?;
    let stream = if is_socks {
        socks_tunnel(stream, proxy_url, &target_host, target_port).await?
    } else {
        connect_tunnel(stream, head, proxy_url, &target_host, target_port).await?
    };

    if exchange.secure {
        let session = connect_tls_upstream(stream, &target_host).await?;
        Ok(ConnectedUpstream::Tls(session))
    } else {
        Ok(ConnectedUpstream::Plain(stream))
    }
}

async fn resolve_and_mark(
    state: &InterceptState,
    url: &str,
    exchange: &mut Exchange,
) -> Result<IpAddr, RelayFailure> {
    let ip = state
        .resolver
        .resolve_host(url)
        .await
        .map_err(|err| RelayFailure::Error(err.to_string()))?;
    exchange.record.response.ip = Some(ip.to_string());
    let now = now_millis();
    exchange.record.request_time = Some(now);
    exchange.record.dns_time = Some(now);
    exchange.emit(ExchangeEventKind::Send).await;
    Ok(ip)
}

/// SOCKS5 handshake toward `host:port`, with username/password auth when the
/// proxy url carries credentials.
async fn socks_tunnel(
    mut stream: TcpStream,
    proxy_url: &Url,
    host: &str,
    port: u16,
) -> Result<TcpStream, RelayFailure> {
    use tapline_net::{
        METHOD_USER_PASS, SocksAddress, SocksAuth, SocksConnectParser, SocksParseStatus,
        SocksReply, build_auth_request, build_connect, build_greeting, parse_auth_response,
        parse_greeting_response,
    };

    let auth = match (proxy_url.username(), proxy_url.password()) {
        ("", None) => SocksAuth::NoAuth,
        (username, password) => SocksAuth::UserPass {
            username: username.to_string(),
            password: password.unwrap_or("").to_string(),
        },
    };

    stream
        .write_all(&build_greeting(&auth))
        .await
        .map_err(|err| RelayFailure::Error(err.to_string()))?;
    let mut reply = [0u8; 2];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|err| RelayFailure::Error(err.to_string()))?;
    let method = parse_greeting_response(&reply)
        .map_err(|err| RelayFailure::Error(format!("socks greeting rejected: {err:?}")))?;

    if method == METHOD_USER_PASS {
        let SocksAuth::UserPass { username, password } = &auth else {
            return Err(RelayFailure::Error(
                "socks proxy requires credentials".to_string(),
            ));
        };
        stream
            .write_all(&build_auth_request(username, password))
            .await
            .map_err(|err| RelayFailure::Error(err.to_string()))?;
        let mut reply = [0u8; 2];
        stream
            .read_exact(&mut reply)
            .await
            .map_err(|err| RelayFailure::Error(err.to_string()))?;
        parse_auth_response(&reply)
            .map_err(|err| RelayFailure::Error(format!("socks auth rejected: {err:?}")))?;
    }

    stream
        .write_all(&build_connect(SocksAddress::Domain(host.to_string()), port))
        .await
        .map_err(|err| RelayFailure::Error(err.to_string()))?;

    let mut parser = SocksConnectParser::new();
    let mut temp = vec![0u8; 512];
    loop {
        let n = stream
            .read(&mut temp)
            .await
            .map_err(|err| RelayFailure::Error(err.to_string()))?;
        if n == 0 {
            return Err(RelayFailure::Error(
                "socks proxy closed during connect".to_string(),
            ));
        }
        match parser.push(&temp[..n]) {
            SocksParseStatus::NeedMore => continue,
            SocksParseStatus::Complete { response } => {
                if response.reply != SocksReply::Succeeded {
                    return Err(RelayFailure::Error(format!(
                        "socks connect failed: {:?}",
                        response.reply
                    )));
                }
                return Ok(stream);
            }
            SocksParseStatus::Error { error } => {
                return Err(RelayFailure::Error(format!(
                    "socks response invalid: {error:?}"
                )));
            }
        }
    }
}

/// HTTP CONNECT toward `host:port`, mirroring the identifying headers of the
/// intercepted request so the hop looks like it came from the real client.
async fn connect_tunnel(
    mut stream: TcpStream,
    head: &RequestHead,
    proxy_url: &Url,
    host: &str,
    port: u16,
) -> Result<TcpStream, RelayFailure> {
    let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\n");
    if let Some(host_header) = head.header("host") {
        request.push_str(&format!("host: {host_header}\r\n"));
    }
    request.push_str("proxy-connection: keep-alive\r\n");
    if let Some(user_agent) = head.header("user-agent") {
        request.push_str(&format!("user-agent: {user_agent}\r\n"));
    }
    if !proxy_url.username().is_empty() || proxy_url.password().is_some() {
        let credentials = format!(
            "{}:{}",
            proxy_url.username(),
            proxy_url.password().unwrap_or("")
        );
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
        request.push_str(&format!("proxy-authorization: Basic {encoded}\r\n"));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|err| RelayFailure::Error(err.to_string()))?;

    let mut parser = ResponsePreambleParser::new();
    let mut temp = vec![0u8; 8192];
    loop {
        let n = stream
            .read(&mut temp)
            .await
            .map_err(|err| RelayFailure::Error(err.to_string()))?;
        if n == 0 {
            return Err(RelayFailure::Error(
                "proxy closed during connect".to_string(),
            ));
        }
        match parser.push(&temp[..n]) {
            ParseStatus::NeedMore { .. } => continue,
            ParseStatus::Complete { preamble, .. } => {
                let status = preamble.head.line.status_code;
                if status != 200 {
                    return Err(RelayFailure::Error(format!(
                        "proxy connect failed with status {status}"
                    )));
                }
                return Ok(stream);
            }
            ParseStatus::Error { error, .. } => {
                return Err(RelayFailure::Error(format!(
                    "proxy connect response invalid: {error:?}"
                )));
            }
        }
    }
}

/// TLS toward the origin. Certificate checks are off: the client already
/// trusts this interceptor, verifying the far end is out of scope here.
async fn connect_tls_upstream(
    stream: TcpStream,
    host: &str,
) -> Result<SslStream<TcpStream>, RelayFailure> {
    let mut builder = SslConnector::builder(SslMethod::tls())
        .map_err(|err| RelayFailure::Error(err.to_string()))?;
    builder.set_verify(SslVerifyMode::NONE);
    let connector = builder.build();
    let ssl = connector
        .configure()
        .map_err(|err| RelayFailure::Error(err.to_string()))?
        .into_ssl(host)
        .map_err(|err| RelayFailure::Error(err.to_string()))?;
    let mut session =
        SslStream::new(ssl, stream).map_err(|err| RelayFailure::Error(err.to_string()))?;
    Pin::new(&mut session)
        .connect()
        .await
        .map_err(|err| RelayFailure::Error(err.to_string()))?;
    Ok(session)
}

/// Forwards the upgrade preamble, waits for the response head while client
/// bytes keep flowing, then emits `Response` and `End` and keeps splicing
/// until either side closes.
async fn pipe<S, U>(
    client: &mut S,
    upstream: U,
    preamble: &RequestPreamble,
    matched: Option<Url>,
    early: Vec<u8>,
    exchange: &mut Exchange,
) -> Result<(), RelayFailure>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    U: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut saved_origin = None;
    let outbound = match &matched {
        Some(target) => {
            let mut head = preamble.head.clone();
            let authority = match (target.host_str(), target.port()) {
                (Some(host), Some(port)) => format!("{host}:{port}"),
                (Some(host), None) => host.to_string(),
                (None, _) => String::new(),
            };
            head.set_header("host", &authority);
            saved_origin = head.header("origin").map(str::to_string);
            let origin_scheme = if target.scheme() == "wss" { "https" } else { "http" };
            head.set_header("origin", &format!("{origin_scheme}://{authority}"));
            exchange.record.request.headers = header_pairs(&head.headers);
            preamble.rebuild(&head)
        }
        None => preamble.buffer().to_vec(),
    };

    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);
    upstream_write
        .write_all(&outbound)
        .await
        .map_err(|err| RelayFailure::Error(err.to_string()))?;
    if !early.is_empty() {
        upstream_write
            .write_all(&early)
            .await
            .map_err(|err| RelayFailure::Error(err.to_string()))?;
    }

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let request_copy = tokio::io::copy(&mut client_read, &mut upstream_write);
    tokio::pin!(request_copy);

    let mut parser = ResponsePreambleParser::new();
    let mut temp = vec![0u8; 8192];
    let response = loop {
        tokio::select! {
            finished = &mut request_copy => {
                // either side going quiet before the response head counts as
                // a walked-away client, not an upstream failure
                return Err(match finished {
                    Ok(_) => RelayFailure::Abort,
                    Err(err) => RelayFailure::Error(err.to_string()),
                });
            }
            read = upstream_read.read(&mut temp) => {
                let n = read.map_err(|err| RelayFailure::Error(err.to_string()))?;
                if n == 0 {
                    return Err(RelayFailure::Abort);
                }
                match parser.push(&temp[..n]) {
                    ParseStatus::NeedMore { .. } => continue,
                    ParseStatus::Complete { preamble, .. } => break preamble,
                    ParseStatus::Error { error, .. } => {
                        return Err(RelayFailure::Error(format!(
                            "upstream response invalid: {error:?}"
                        )));
                    }
                }
            }
        }
    };

    let mut response_head = response.head.clone();
    let inbound = if matched.is_some() {
        if let Some(origin) = saved_origin.as_deref() {
            response_head.set_header("access-control-allow-origin", origin);
        }
        response.rebuild(&response_head)
    } else {
        response.buffer().to_vec()
    };
    client_write
        .write_all(&inbound)
        .await
        .map_err(|err| RelayFailure::Error(err.to_string()))?;

    exchange.record.response.status = Some(StatusValue::Code(response_head.line.status_code));
    exchange.record.response.headers = header_pairs(&response_head.headers);
    exchange.emit(ExchangeEventKind::Response).await;

    exchange.record.response_time = Some(now_millis());
    exchange.record.end_time = exchange.record.response_time;
    if exchange.record.response.ip.is_none() {
        exchange.record.response.ip = Some(LOOPBACK_HOST.to_string());
    }
    exchange.emit(ExchangeEventKind::End).await;

    // the exchange is settled; whatever happens from here on is plain
    // teardown and produces no further events
    let response_copy = tokio::io::copy(&mut upstream_read, &mut client_write);
    tokio::pin!(response_copy);
    tokio::select! {
        _ = &mut request_copy => {}
        _ = &mut response_copy => {}
    }

    Ok(())
}

fn header_pairs(headers: &[Header]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|header| (header.name.clone(), header.value.clone()))
        .collect()
}

fn is_local_address(ip: IpAddr) -> bool {
    ip.is_loopback() || ip.is_unspecified()
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use super::is_local_address;

    #[test]
    fn loopback_and_unspecified_count_as_local() {
        assert!(is_local_address(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(is_local_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED)));
        assert!(is_local_address(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(!is_local_address(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))));
    }
}
