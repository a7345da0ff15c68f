use std::collections::{HashMap, VecDeque};

use super::types::ServerIdentity;

/// LRU cache of issued identities, keyed by hostname.
#[derive(Debug)]
pub struct IdentityCache {
    max_entries: usize,
    order: VecDeque<String>,
    entries: HashMap<String, ServerIdentity>,
}

impl IdentityCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    pub fn get(&mut self, host: &str) -> Option<ServerIdentity> {
        let identity = self.entries.get(host).cloned()?;
        self.touch(host);
        Some(identity)
    }

    pub fn insert(&mut self, host: String, identity: ServerIdentity) {
        if !self.entries.contains_key(&host) {
            self.order.push_back(host.clone());
        }
        self.entries.insert(host.clone(), identity);
        self.touch(&host);
        self.evict_if_needed();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn touch(&mut self, host: &str) {
        if let Some(pos) = self.order.iter().position(|item| item == host) {
            self.order.remove(pos);
            self.order.push_back(host.to_string());
        }
    }

    fn evict_if_needed(&mut self) {
        while self.order.len() > self.max_entries {
            if let Some(host) = self.order.pop_front() {
                self.entries.remove(&host);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::IdentityCache;
    use crate::tls::ServerIdentity;

    fn identity(tag: &str) -> ServerIdentity {
        ServerIdentity {
            cert_pem: tag.as_bytes().to_vec(),
            key_pem: tag.as_bytes().to_vec(),
        }
    }

    #[test]
    fn evicts_least_recently_used_entry() {
        let mut cache = IdentityCache::new(2);
        cache.insert("a.example".to_string(), identity("a"));
        cache.insert("b.example".to_string(), identity("b"));

        assert!(cache.get("a.example").is_some());
        cache.insert("c.example".to_string(), identity("c"));

        assert!(cache.get("b.example").is_none());
        assert!(cache.get("a.example").is_some());
        assert!(cache.get("c.example").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn reinsert_replaces_without_growing() {
        let mut cache = IdentityCache::new(2);
        cache.insert("a.example".to_string(), identity("a"));
        cache.insert("a.example".to_string(), identity("a2"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("a.example").map(|id| id.cert_pem), Some(b"a2".to_vec()));
    }
}
