use std::sync::{Arc, OnceLock};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use tapline_net::{ParseStatus, RequestPreambleParser};

use crate::config::{InterceptConfig, LOOPBACK_HOST};
use crate::error::InterceptError;
use crate::events::{ExchangeEvent, TelemetryEvents, telemetry_channel};
use crate::pool::{ServerPool, TlsSessionHandler};
use crate::provider::CertificateProvider;
use crate::registry::ClientRegistry;
use crate::relay::{RelayMode, relay_upgrade};
use crate::rules::RuleResolver;
use crate::splice::splice;
use crate::tunnel::handle_tls_session;

pub(crate) struct InterceptState {
    pub(crate) config: InterceptConfig,
    pub(crate) registry: ClientRegistry,
    pub(crate) resolver: Arc<dyn RuleResolver>,
    pub(crate) sender: mpsc::Sender<ExchangeEvent>,
}

/// Entry point for connections whose CONNECT handshake is already done.
/// Sniffs the first bytes of each connection: cleartext websocket upgrades
/// are relayed directly, anything else is treated as TLS and bridged into a
/// pooled listener presenting a certificate for the CONNECT hostname.
pub struct Interceptor {
    state: Arc<InterceptState>,
    pool: ServerPool,
}

impl Interceptor {
    pub fn new(
        config: InterceptConfig,
        resolver: Arc<dyn RuleResolver>,
        provider: Arc<dyn CertificateProvider>,
    ) -> (Self, TelemetryEvents) {
        let (sender, events) = telemetry_channel();
        let state = Arc::new(InterceptState {
            config,
            registry: ClientRegistry::new(),
            resolver,
            sender,
        });
        let handler_state = Arc::clone(&state);
        let handler: TlsSessionHandler = Arc::new(move |session| {
            let state = Arc::clone(&handler_state);
            Box::pin(handle_tls_session(state, session))
        });
        let pool = ServerPool::new(provider, handler);
        (Self { state, pool }, events)
    }

    /// Takes over a tunneled connection. `hostname` is the name the client
    /// asked to CONNECT to; it decides which certificate the TLS side will
    /// present.
    pub async fn dispatch(
        &self,
        mut socket: TcpStream,
        hostname: &str,
    ) -> Result<(), InterceptError> {
        let mut chunk = vec![0u8; 8192];
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        chunk.truncate(n);

        if sniffs_websocket_upgrade(&chunk) {
            self.relay_plain_upgrade(socket, chunk).await
        } else {
            self.bridge_to_tls(socket, hostname, chunk).await
        }
    }

    pub fn pool(&self) -> &ServerPool {
        &self.pool
    }

    /// Retires every pooled listener. In-flight exchanges keep running on
    /// their own sockets.
    pub async fn teardown(&self) {
        self.pool.teardown().await;
    }

    async fn relay_plain_upgrade(
        &self,
        mut socket: TcpStream,
        chunk: Vec<u8>,
    ) -> Result<(), InterceptError> {
        let peer_ip = socket.peer_addr()?.ip().to_string();
        let mut parser = RequestPreambleParser::new();
        let mut status = parser.push(&chunk);
        let mut temp = vec![0u8; 8192];
        loop {
            match status {
                ParseStatus::NeedMore { .. } => {
                    let n = socket.read(&mut temp).await?;
                    if n == 0 {
                        return Ok(());
                    }
                    status = parser.push(&temp[..n]);
                }
                ParseStatus::Complete { preamble, .. } => {
                    let state = Arc::clone(&self.state);
                    relay_upgrade(state, socket, preamble, peer_ip, RelayMode::Plain).await;
                    return Ok(());
                }
                ParseStatus::Error { error, .. } => {
                    return Err(InterceptError::Runtime(format!(
                        "malformed upgrade request: {error:?}"
                    )));
                }
            }
        }
    }

    /// Connects back into the pooled TLS listener for `hostname` over
    /// loopback and splices the raw TLS bytes across, remembering which
    /// client the bridge connection stands for.
    async fn bridge_to_tls(
        &self,
        socket: TcpStream,
        hostname: &str,
        chunk: Vec<u8>,
    ) -> Result<(), InterceptError> {
        let client_ip = socket.peer_addr()?.ip().to_string();
        let port = self.pool.acquire(hostname).await?;
        let mut bridge = TcpStream::connect((LOOPBACK_HOST, port)).await?;
        let bridge_port = bridge.local_addr()?.port();
        self.state.registry.record(bridge_port, client_ip).await;
        bridge.write_all(&chunk).await?;
        let spliced = splice(socket, bridge).await;
        // normally consumed by the session handler; failed handshakes leave
        // the entry behind
        self.state.registry.take(bridge_port).await;
        spliced?;
        Ok(())
    }
}

fn sniffs_websocket_upgrade(chunk: &[u8]) -> bool {
    static UPGRADE: OnceLock<regex::bytes::Regex> = OnceLock::new();
    UPGRADE
        .get_or_init(|| {
            regex::bytes::Regex::new(r"(?i)upgrade\s*:\s*websocket")
                .expect("invalid upgrade pattern")
        })
        .is_match(chunk)
}

#[cfg(test)]
mod tests {
    use super::sniffs_websocket_upgrade;

    #[test]
    fn spots_upgrade_headers_in_the_first_chunk() {
        let chunk = b"GET /feed HTTP/1.1\r\nHost: a\r\nUpgrade : WebSocket\r\n";
        assert!(sniffs_websocket_upgrade(chunk));
    }

    #[test]
    fn leaves_tls_client_hellos_alone() {
        let chunk = [0x16, 0x03, 0x01, 0x02, 0x00, 0x01, 0x00];
        assert!(!sniffs_websocket_upgrade(&chunk));
    }

    #[test]
    fn plain_requests_without_upgrade_are_not_matched() {
        let chunk = b"GET / HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n";
        assert!(!sniffs_websocket_upgrade(chunk));
    }
}
