use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;
use tracing::debug;

use tapline_net::{ParseStatus, RequestPreamble, RequestPreambleParser};

use crate::config::{CLIENT_IP_HEADER, LOOPBACK_HOST, TLS_MARKER_HEADER};
use crate::dispatch::InterceptState;
use crate::error::InterceptError;
use crate::relay::{RelayMode, relay_upgrade};
use crate::splice::splice;

/// Handles one decrypted session from a pooled TLS listener: parses the
/// request preamble, then either relays a websocket upgrade or feeds the
/// request back into the plaintext pipeline over loopback.
pub(crate) async fn handle_tls_session(
    state: Arc<InterceptState>,
    mut session: SslStream<TcpStream>,
) {
    // the peer is the dispatcher's end of the loopback bridge; its port keys
    // the registry entry holding the real client address
    let bridge_port = match session.get_ref().peer_addr() {
        Ok(addr) => addr.port(),
        Err(err) => {
            debug!(error = %err, "tls session has no peer address");
            return;
        }
    };

    let mut parser = RequestPreambleParser::new();
    let mut temp = vec![0u8; 8192];
    let preamble = loop {
        let n = match session.read(&mut temp).await {
            Ok(n) => n,
            Err(err) => {
                debug!(error = %err, "tls session read failed");
                return;
            }
        };
        if n == 0 {
            return;
        }
        match parser.push(&temp[..n]) {
            ParseStatus::NeedMore { .. } => continue,
            ParseStatus::Complete { preamble, .. } => break preamble,
            ParseStatus::Error { error, .. } => {
                debug!(error = ?error, "malformed request on tls session");
                return;
            }
        }
    };

    let client_ip = state.registry.take(bridge_port).await;
    if preamble.head.upgrades_to("websocket") {
        let peer_ip = LOOPBACK_HOST.to_string();
        let mode = RelayMode::Secure { client_ip };
        relay_upgrade(state, session, preamble, peer_ip, mode).await;
    } else if let Err(err) = reenter_pipeline(&state, session, &preamble, client_ip).await {
        debug!(error = %err, "pipeline re-entry failed");
    }
}

/// Hands a terminated HTTPS request back to the plaintext pipeline over
/// loopback, tagged so the pipeline can tell the request was TLS and who
/// really sent it.
async fn reenter_pipeline(
    state: &InterceptState,
    session: SslStream<TcpStream>,
    preamble: &RequestPreamble,
    client_ip: Option<String>,
) -> Result<(), InterceptError> {
    let mut upstream = TcpStream::connect((LOOPBACK_HOST, state.config.port)).await?;
    let mut head = preamble.head.clone();
    head.set_header(TLS_MARKER_HEADER, "1");
    if let Some(ip) = client_ip.as_deref() {
        head.set_header(CLIENT_IP_HEADER, ip);
    }
    upstream.write_all(&preamble.rebuild(&head)).await?;
    splice(session, upstream).await?;
    Ok(())
}
