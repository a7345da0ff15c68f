use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use openssl::ssl::{Ssl, SslAcceptor};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify, oneshot};
use tokio_openssl::SslStream;
use tracing::{debug, warn};

use tapline_net::build_acceptor;

use crate::config::LOOPBACK_HOST;
use crate::error::InterceptError;
use crate::provider::CertificateProvider;

/// Most per-hostname listeners kept resident at once.
pub const MAX_SERVERS: usize = 256;

/// Grace period between a listener becoming ready, or being retired, and
/// that fact taking effect. Gives connections already in flight toward a
/// port a window to land.
pub const SETTLE_DELAY: Duration = Duration::from_millis(600);

const PORT_RANGE_LOW: u16 = 50_000;
const PORT_RANGE_HIGH: u16 = 60_000;
const PORT_RANGE_WRAP: u16 = 40_000;

/// Callback driven with every decrypted session accepted by a pooled
/// listener.
pub type TlsSessionHandler =
    Arc<dyn Fn(SslStream<TcpStream>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Pool of loopback TLS listeners, one per hostname, each presenting a leaf
/// certificate for its hostname. Listeners are created on demand, shared by
/// every connection for the hostname, and retired once the pool is over
/// capacity and they fall idle.
pub struct ServerPool {
    inner: Arc<PoolShared>,
}

struct PoolShared {
    provider: Arc<dyn CertificateProvider>,
    handler: TlsSessionHandler,
    state: Mutex<PoolState>,
}

struct PoolState {
    cache: HashMap<String, PoolEntry>,
    server_count: usize,
    next_port: u16,
}

enum PoolEntry {
    Pending(Arc<PendingServer>),
    Ready(ReadyServer),
}

/// Listener still coming up. Later requests for the same hostname park a
/// waiter here instead of starting a second listener.
struct PendingServer {
    waiters: Mutex<Vec<oneshot::Sender<u16>>>,
}

struct ReadyServer {
    port: u16,
    active: Arc<AtomicUsize>,
    shutdown: Arc<Notify>,
}

impl ServerPool {
    pub fn new(provider: Arc<dyn CertificateProvider>, handler: TlsSessionHandler) -> Self {
        Self {
            inner: Arc::new(PoolShared {
                provider,
                handler,
                state: Mutex::new(PoolState {
                    cache: HashMap::new(),
                    server_count: 0,
                    next_port: PORT_RANGE_LOW,
                }),
            }),
        }
    }

    /// Returns the loopback port of the TLS listener for `hostname`,
    /// creating one if none exists. Concurrent calls for one hostname share
    /// a single listener; only the first triggers certificate issuance.
    pub async fn acquire(&self, hostname: &str) -> Result<u16, InterceptError> {
        let receiver = {
            let mut state = self.inner.state.lock().await;
            match state.cache.get(hostname) {
                Some(PoolEntry::Ready(server)) => return Ok(server.port),
                Some(PoolEntry::Pending(pending)) => {
                    let (sender, receiver) = oneshot::channel();
                    let pending = Arc::clone(pending);
                    // parked while still holding the pool lock, so the
                    // resolve cannot slip in between the lookup and the park
                    pending.waiters.lock().await.push(sender);
                    receiver
                }
                None => {
                    evict_idle_at_capacity(&mut state);
                    let (sender, receiver) = oneshot::channel();
                    let pending = Arc::new(PendingServer {
                        waiters: Mutex::new(vec![sender]),
                    });
                    state
                        .cache
                        .insert(hostname.to_string(), PoolEntry::Pending(Arc::clone(&pending)));
                    state.server_count += 1;
                    tokio::spawn(provision(
                        Arc::clone(&self.inner),
                        hostname.to_string(),
                        pending,
                    ));
                    receiver
                }
            }
        };
        receiver
            .await
            .map_err(|_| InterceptError::Runtime(format!("tls listener for {hostname} failed")))
    }

    /// Number of listeners currently counted against [`MAX_SERVERS`],
    /// including ones still binding.
    pub async fn resident_count(&self) -> usize {
        self.inner.state.lock().await.server_count
    }

    /// Port of the ready listener for `hostname`, if one is resident.
    pub async fn cached_port(&self, hostname: &str) -> Option<u16> {
        match self.inner.state.lock().await.cache.get(hostname) {
            Some(PoolEntry::Ready(server)) => Some(server.port),
            _ => None,
        }
    }

    /// Empties the pool. Ready listeners close after [`SETTLE_DELAY`];
    /// listeners still binding hand their port to waiters before closing, so
    /// no acquire call is left hanging.
    pub async fn teardown(&self) {
        let cache = {
            let mut state = self.inner.state.lock().await;
            state.server_count = 0;
            std::mem::take(&mut state.cache)
        };
        for (_, entry) in cache {
            if let PoolEntry::Ready(server) = entry {
                tokio::spawn(close_after_settle(server.shutdown));
            }
        }
    }
}

/// Retires every idle listener once the pool is at capacity. Listeners with
/// connections in flight and listeners still binding are spared.
fn evict_idle_at_capacity(state: &mut PoolState) {
    if state.server_count < MAX_SERVERS {
        return;
    }
    let idle: Vec<String> = state
        .cache
        .iter()
        .filter(|(_, entry)| {
            matches!(entry, PoolEntry::Ready(server) if server.active.load(Ordering::SeqCst) == 0)
        })
        .map(|(hostname, _)| hostname.clone())
        .collect();
    for hostname in idle {
        if let Some(PoolEntry::Ready(server)) = state.cache.remove(&hostname) {
            debug!(hostname = %hostname, port = server.port, "retiring idle tls listener");
            state.server_count = state.server_count.saturating_sub(1);
            tokio::spawn(close_after_settle(server.shutdown));
        }
    }
}

async fn close_after_settle(shutdown: Arc<Notify>) {
    tokio::time::sleep(SETTLE_DELAY).await;
    shutdown.notify_one();
}

async fn provision(shared: Arc<PoolShared>, hostname: String, pending: Arc<PendingServer>) {
    let acceptor = match build_host_acceptor(&shared, &hostname) {
        Ok(acceptor) => acceptor,
        Err(err) => {
            warn!(hostname = %hostname, error = %err, "tls listener setup failed");
            abandon(&shared, &hostname, &pending).await;
            return;
        }
    };

    let (listener, port) = bind_listener(&shared).await;
    let active = Arc::new(AtomicUsize::new(0));
    let shutdown = Arc::new(Notify::new());
    tokio::spawn(accept_loop(
        Arc::clone(&shared.handler),
        hostname.clone(),
        listener,
        acceptor,
        Arc::clone(&active),
        Arc::clone(&shutdown),
    ));

    tokio::time::sleep(SETTLE_DELAY).await;

    let installed = {
        let mut state = shared.state.lock().await;
        match state.cache.get_mut(&hostname) {
            Some(entry) => {
                let ours =
                    matches!(&entry, PoolEntry::Pending(current) if Arc::ptr_eq(current, &pending));
                if ours {
                    *entry = PoolEntry::Ready(ReadyServer {
                        port,
                        active,
                        shutdown: Arc::clone(&shutdown),
                    });
                }
                ours
            }
            None => false,
        }
    };
    if !installed {
        // torn down while the listener was coming up; waiters still get the
        // port, the listener just closes again shortly after
        tokio::spawn(close_after_settle(shutdown));
    }

    let mut waiters = pending.waiters.lock().await;
    for waiter in waiters.drain(..) {
        let _ = waiter.send(port);
    }
}

fn build_host_acceptor(
    shared: &PoolShared,
    hostname: &str,
) -> Result<SslAcceptor, InterceptError> {
    let identity = shared.provider.create_certificate(hostname)?;
    build_acceptor(&identity).map_err(|err| InterceptError::Runtime(err.message))
}

/// Drops the pending entry and leaves its waiters to error out.
async fn abandon(shared: &PoolShared, hostname: &str, pending: &Arc<PendingServer>) {
    let mut state = shared.state.lock().await;
    if let Some(PoolEntry::Pending(current)) = state.cache.get(hostname) {
        if Arc::ptr_eq(current, pending) {
            state.cache.remove(hostname);
            state.server_count = state.server_count.saturating_sub(1);
        }
    }
    drop(state);
    pending.waiters.lock().await.clear();
}

/// Binds the next free port in the pooled range, skipping ports already in
/// use. Candidates start at 50000 and wrap to 40000 after 59999.
async fn bind_listener(shared: &PoolShared) -> (TcpListener, u16) {
    loop {
        let port = {
            let mut state = shared.state.lock().await;
            next_candidate(&mut state.next_port)
        };
        match TcpListener::bind((LOOPBACK_HOST, port)).await {
            Ok(listener) => return (listener, port),
            Err(err) => {
                debug!(port, error = %err, "port unavailable, trying the next one");
            }
        }
    }
}

fn next_candidate(next_port: &mut u16) -> u16 {
    if *next_port >= PORT_RANGE_HIGH {
        *next_port = PORT_RANGE_WRAP;
    }
    let port = *next_port;
    *next_port += 1;
    port
}

async fn accept_loop(
    handler: TlsSessionHandler,
    hostname: String,
    listener: TcpListener,
    acceptor: SslAcceptor,
    active: Arc<AtomicUsize>,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    spawn_session(&handler, &acceptor, stream, Some(&active));
                }
                Err(err) => {
                    warn!(hostname = %hostname, error = %err, "tls listener accept failed, rebinding");
                    let port = listener.local_addr().ok().map(|addr| addr.port());
                    drop(listener);
                    if let Some(port) = port {
                        recover_listener(&handler, &hostname, port, &acceptor, &shutdown).await;
                    }
                    return;
                }
            },
            _ = shutdown.notified() => {
                debug!(hostname = %hostname, "closing tls listener");
                return;
            }
        }
    }
}

fn spawn_session(
    handler: &TlsSessionHandler,
    acceptor: &SslAcceptor,
    stream: TcpStream,
    active: Option<&Arc<AtomicUsize>>,
) {
    let ssl = match Ssl::new(acceptor.context()) {
        Ok(ssl) => ssl,
        Err(err) => {
            debug!(error = %err, "ssl session setup failed");
            return;
        }
    };
    if let Some(active) = active {
        active.fetch_add(1, Ordering::SeqCst);
    }
    let handler = Arc::clone(handler);
    let active = active.map(Arc::clone);
    tokio::spawn(async move {
        match accept_tls(ssl, stream).await {
            Ok(session) => handler(session).await,
            Err(err) => debug!(error = %err, "tls handshake failed"),
        }
        if let Some(active) = active {
            active.fetch_sub(1, Ordering::SeqCst);
        }
    });
}

/// Failed accept calls leave the listener in an unknown state. The port has
/// already been handed out, so rebind it once and serve a single further
/// session before letting the port go dark.
async fn recover_listener(
    handler: &TlsSessionHandler,
    hostname: &str,
    port: u16,
    acceptor: &SslAcceptor,
    shutdown: &Notify,
) {
    let replacement = match TcpListener::bind((LOOPBACK_HOST, port)).await {
        Ok(replacement) => replacement,
        Err(err) => {
            warn!(hostname = %hostname, port, error = %err, "rebind failed, giving up on port");
            return;
        }
    };
    tokio::select! {
        accepted = replacement.accept() => {
            if let Ok((stream, _)) = accepted {
                // untracked: the replaced listener is already past the
                // pool's connection accounting
                spawn_session(handler, acceptor, stream, None);
            }
        }
        _ = shutdown.notified() => {}
    }
}

async fn accept_tls(ssl: Ssl, stream: TcpStream) -> Result<SslStream<TcpStream>, InterceptError> {
    let mut session =
        SslStream::new(ssl, stream).map_err(|err| InterceptError::Runtime(err.to_string()))?;
    Pin::new(&mut session)
        .accept()
        .await
        .map_err(|err| InterceptError::Runtime(err.to_string()))?;
    Ok(session)
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::sync::Arc;

    use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::{Notify, mpsc};
    use tokio_openssl::SslStream;

    use tapline_net::build_acceptor;

    use crate::config::LOOPBACK_HOST;
    use crate::provider::{AuthorityProvider, CertificateProvider};

    use super::{
        PORT_RANGE_HIGH, ServerPool, TlsSessionHandler, next_candidate, recover_listener,
    };

    fn noop_handler() -> TlsSessionHandler {
        Arc::new(|_session| Box::pin(async {}))
    }

    #[test]
    fn port_cursor_wraps_below_the_primary_range() {
        let mut cursor = 59_998;
        assert_eq!(next_candidate(&mut cursor), 59_998);
        assert_eq!(next_candidate(&mut cursor), 59_999);
        assert_eq!(next_candidate(&mut cursor), 40_000);
        assert_eq!(next_candidate(&mut cursor), 40_001);
    }

    #[test]
    fn port_cursor_starts_in_the_primary_range() {
        let mut cursor = super::PORT_RANGE_LOW;
        assert_eq!(next_candidate(&mut cursor), 50_000);
        assert_eq!(next_candidate(&mut cursor), 50_001);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_skips_an_occupied_candidate_port() {
        // squatter at an os-assigned port, below the wrap bound so the
        // cursor actually reaches it
        let squatter = loop {
            let listener = TcpListener::bind((LOOPBACK_HOST, 0)).await.unwrap();
            if listener.local_addr().unwrap().port() < PORT_RANGE_HIGH {
                break listener;
            }
        };
        let squatter_port = squatter.local_addr().unwrap().port();

        let provider = Arc::new(AuthorityProvider::ephemeral("pool test authority").unwrap());
        let pool = ServerPool::new(provider, noop_handler());
        pool.inner.state.lock().await.next_port = squatter_port;

        let port = pool.acquire("crowded.test").await.unwrap();
        assert_ne!(port, squatter_port);
        assert_eq!(pool.cached_port("crowded.test").await, Some(port));
    }

    #[tokio::test]
    async fn degraded_rebind_serves_a_single_session() {
        let provider = AuthorityProvider::ephemeral("pool test authority").unwrap();
        let identity = provider.create_certificate("degraded.test").unwrap();
        let acceptor = build_acceptor(&identity).unwrap();

        let parked = TcpListener::bind((LOOPBACK_HOST, 0)).await.unwrap();
        let port = parked.local_addr().unwrap().port();
        drop(parked);

        let (served_sender, mut served) = mpsc::unbounded_channel();
        let handler: TlsSessionHandler = Arc::new(move |_session| {
            let served_sender = served_sender.clone();
            Box::pin(async move {
                let _ = served_sender.send(());
            })
        });

        let shutdown = Notify::new();
        tokio::join!(
            recover_listener(&handler, "degraded.test", port, &acceptor, &shutdown),
            async {
                let stream = TcpStream::connect((LOOPBACK_HOST, port)).await.unwrap();
                let mut builder = SslConnector::builder(SslMethod::tls()).unwrap();
                builder.set_verify(SslVerifyMode::NONE);
                let ssl = builder
                    .build()
                    .configure()
                    .unwrap()
                    .into_ssl("degraded.test")
                    .unwrap();
                let mut session = SslStream::new(ssl, stream).unwrap();
                Pin::new(&mut session).connect().await.unwrap();
            },
        );

        served.recv().await.unwrap();
        assert!(served.try_recv().is_err());

        // one session is all the replacement listener gives out
        assert!(TcpStream::connect((LOOPBACK_HOST, port)).await.is_err());
    }
}
