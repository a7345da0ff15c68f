mod config;
mod dispatch;
mod error;
mod events;
mod pool;
mod provider;
mod record;
mod registry;
mod relay;
mod rules;
mod splice;
mod tunnel;

pub use config::{CLIENT_IP_HEADER, InterceptConfig, TLS_MARKER_HEADER};
pub use dispatch::Interceptor;
pub use error::InterceptError;
pub use events::{ExchangeEvent, ExchangeEventKind, TelemetryEvents, telemetry_channel};
pub use pool::{MAX_SERVERS, SETTLE_DELAY, ServerPool, TlsSessionHandler};
pub use provider::{AuthorityProvider, CertificateProvider};
pub use record::{ExchangeRecord, RequestRecord, ResponseRecord, StatusValue};
pub use registry::ClientRegistry;
pub use rules::{DefaultResolver, ResolvedRules, RuleResolver, TrafficFilter};
pub use splice::splice;
