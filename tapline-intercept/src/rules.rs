use std::net::IpAddr;

use async_trait::async_trait;
use tokio::net::lookup_host;
use url::Url;

use crate::error::InterceptError;

/// Outcome of matching a url against the active rule set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedRules {
    /// Raw text of the matched rule, recorded on the exchange for display.
    pub rule: Option<String>,
    /// Upstream proxy to tunnel through (http, socks or socks5 scheme).
    pub proxy: Option<Url>,
    /// Replacement target url. Only honored when it carries a ws or wss
    /// scheme.
    pub rewrite: Option<String>,
}

impl ResolvedRules {
    pub fn proxy_url(&self) -> Option<&Url> {
        self.proxy.as_ref()
    }

    pub fn target_url(&self) -> Option<&str> {
        self.rewrite.as_deref()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficFilter {
    /// Suppresses every telemetry event for the exchange. The relay itself
    /// still runs.
    pub hide: bool,
}

/// Rule and name lookup seams of the relay. Rule matching is synchronous
/// against in-memory state, host resolution goes through whatever resolver
/// the implementation wires up.
#[async_trait]
pub trait RuleResolver: Send + Sync {
    fn resolve_rules(&self, url: &str) -> ResolvedRules;

    fn resolve_filter(&self, url: &str) -> TrafficFilter;

    async fn resolve_host(&self, url: &str) -> Result<IpAddr, InterceptError>;
}

/// Resolver with no rules at all: nothing is proxied, nothing is rewritten,
/// nothing is hidden, and hostnames go through the system resolver with a
/// preference for IPv4 answers.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResolver;

#[async_trait]
impl RuleResolver for DefaultResolver {
    fn resolve_rules(&self, _url: &str) -> ResolvedRules {
        ResolvedRules::default()
    }

    fn resolve_filter(&self, _url: &str) -> TrafficFilter {
        TrafficFilter::default()
    }

    async fn resolve_host(&self, url: &str) -> Result<IpAddr, InterceptError> {
        let parsed = Url::parse(url)
            .map_err(|err| InterceptError::Runtime(format!("invalid url {url}: {err}")))?;
        match parsed.host() {
            Some(url::Host::Ipv4(ip)) => Ok(IpAddr::V4(ip)),
            Some(url::Host::Ipv6(ip)) => Ok(IpAddr::V6(ip)),
            Some(url::Host::Domain(domain)) => {
                let addresses: Vec<_> = lookup_host((domain, 0))
                    .await
                    .map_err(|err| {
                        InterceptError::Runtime(format!("lookup failed for {domain}: {err}"))
                    })?
                    .collect();
                addresses
                    .iter()
                    .find(|addr| addr.is_ipv4())
                    .or_else(|| addresses.first())
                    .map(|addr| addr.ip())
                    .ok_or_else(|| {
                        InterceptError::Runtime(format!("no addresses for {domain}"))
                    })
            }
            None => Err(InterceptError::Runtime(format!("no host in {url}"))),
        }
    }
}
