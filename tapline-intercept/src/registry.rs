use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

/// Maps the local port of a loopback bridge connection to the address of the
/// client that opened it. The TLS listeners sit behind a loopback hop, so the
/// peer address they observe is always 127.0.0.1; this registry is how the
/// original client address survives the hop.
#[derive(Debug, Clone, Default)]
pub struct ClientRegistry {
    entries: Arc<Mutex<HashMap<u16, String>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, bridge_port: u16, client_ip: String) {
        let mut entries = self.entries.lock().await;
        entries.insert(bridge_port, client_ip);
    }

    /// Looks up and removes the entry for `bridge_port`. Entries are single
    /// use, one bridge connection carries exactly one TLS session.
    pub async fn take(&self, bridge_port: u16) -> Option<String> {
        let mut entries = self.entries.lock().await;
        entries.remove(&bridge_port)
    }

    pub async fn len(&self) -> usize {
        let entries = self.entries.lock().await;
        entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::ClientRegistry;

    #[tokio::test]
    async fn take_removes_the_entry() {
        let registry = ClientRegistry::new();
        registry.record(51234, "203.0.113.7".to_string()).await;

        assert_eq!(registry.take(51234).await.as_deref(), Some("203.0.113.7"));
        assert_eq!(registry.take(51234).await, None);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn unknown_ports_resolve_to_none() {
        let registry = ClientRegistry::new();
        assert_eq!(registry.take(40000).await, None);
    }
}
