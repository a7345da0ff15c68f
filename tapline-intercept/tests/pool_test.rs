use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use tokio::net::TcpStream;

use tapline_intercept::{
    AuthorityProvider, CertificateProvider, InterceptError, MAX_SERVERS, SETTLE_DELAY, ServerPool,
    TlsSessionHandler,
};
use tapline_net::ServerIdentity;

struct CountingProvider {
    inner: AuthorityProvider,
    calls: AtomicUsize,
}

impl CountingProvider {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: AuthorityProvider::ephemeral("pool test authority").unwrap(),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CertificateProvider for CountingProvider {
    fn create_certificate(&self, hostname: &str) -> Result<ServerIdentity, InterceptError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.create_certificate(hostname)
    }
}

struct FailingProvider;

impl CertificateProvider for FailingProvider {
    fn create_certificate(&self, hostname: &str) -> Result<ServerIdentity, InterceptError> {
        Err(InterceptError::Config(format!("no identity for {hostname}")))
    }
}

fn noop_handler() -> TlsSessionHandler {
    Arc::new(|_session| Box::pin(async {}))
}

#[tokio::test(start_paused = true)]
async fn concurrent_acquires_share_one_listener() {
    let provider = CountingProvider::new();
    let pool = ServerPool::new(provider.clone(), noop_handler());

    let (first, second) = tokio::join!(pool.acquire("a.test"), pool.acquire("a.test"));
    let first = first.unwrap();
    let second = second.unwrap();

    assert_eq!(first, second);
    assert!((50_000..60_000).contains(&first));
    assert_eq!(provider.calls(), 1);
    assert_eq!(pool.resident_count().await, 1);
    assert_eq!(pool.cached_port("a.test").await, Some(first));
}

#[tokio::test(start_paused = true)]
async fn distinct_hostnames_get_distinct_listeners() {
    let provider = CountingProvider::new();
    let pool = ServerPool::new(provider.clone(), noop_handler());

    let first = pool.acquire("a.test").await.unwrap();
    let second = pool.acquire("b.test").await.unwrap();

    assert_ne!(first, second);
    assert_eq!(provider.calls(), 2);
    assert_eq!(pool.resident_count().await, 2);
}

#[tokio::test(start_paused = true)]
async fn acquire_waits_out_the_settle_delay() {
    let provider = CountingProvider::new();
    let pool = ServerPool::new(provider.clone(), noop_handler());

    let started = tokio::time::Instant::now();
    let port = pool.acquire("a.test").await.unwrap();
    assert!(started.elapsed() >= SETTLE_DELAY);

    // once resident the port comes straight from the cache
    let again = tokio::time::Instant::now();
    assert_eq!(pool.acquire("a.test").await.unwrap(), port);
    assert!(again.elapsed() < SETTLE_DELAY);
}

#[tokio::test(start_paused = true)]
async fn capacity_eviction_spares_listeners_with_sessions_in_flight() {
    let provider = CountingProvider::new();
    let pool = ServerPool::new(provider.clone(), noop_handler());

    for index in 0..MAX_SERVERS {
        pool.acquire(&format!("site{index}.test")).await.unwrap();
    }
    assert_eq!(pool.resident_count().await, MAX_SERVERS);

    // park a connection on one listener so it counts as in flight
    let busy_port = pool.cached_port("site0.test").await.unwrap();
    let _pinned = TcpStream::connect(("127.0.0.1", busy_port)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    pool.acquire("overflow.test").await.unwrap();

    assert_eq!(pool.cached_port("site0.test").await, Some(busy_port));
    assert_eq!(pool.cached_port("site1.test").await, None);
    assert_eq!(pool.resident_count().await, 2);
}

#[tokio::test(start_paused = true)]
async fn teardown_still_resolves_acquires_in_flight() {
    let provider = CountingProvider::new();
    let pool = ServerPool::new(provider.clone(), noop_handler());

    let (acquired, _) = tokio::join!(pool.acquire("late.test"), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.teardown().await;
    });

    let port = acquired.unwrap();
    assert!((40_000..60_000).contains(&port));
    assert_eq!(pool.resident_count().await, 0);
    assert_eq!(pool.cached_port("late.test").await, None);
}

#[tokio::test]
async fn failing_certificate_provider_fails_the_acquire() {
    let pool = ServerPool::new(Arc::new(FailingProvider), noop_handler());

    let err = pool.acquire("broken.test").await.unwrap_err();
    assert!(err.to_string().contains("broken.test"));
    assert_matches!(err, InterceptError::Runtime(_));
    assert_eq!(pool.resident_count().await, 0);
}
