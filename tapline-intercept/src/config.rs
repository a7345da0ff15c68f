use serde::{Deserialize, Serialize};

/// Header injected when a terminated TLS request re-enters the plaintext
/// pipeline over loopback. Downstream consumers read it to reconstruct the
/// original scheme, then strip it before forwarding.
pub const TLS_MARKER_HEADER: &str = "x-tapline-https";

/// Header carrying the address of the real client across the loopback hop,
/// where the TCP peer address is always 127.0.0.1.
pub const CLIENT_IP_HEADER: &str = "x-tapline-client-ip";

pub(crate) const LOOPBACK_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterceptConfig {
    pub host: String,
    pub port: u16,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}
