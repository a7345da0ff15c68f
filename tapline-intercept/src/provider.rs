use std::path::Path;
use std::sync::Mutex;

use tapline_net::{
    Authority, IdentityCache, ServerIdentity, generate_authority, issue_identity,
    load_or_generate_authority,
};

use crate::error::InterceptError;

const IDENTITY_CACHE_ENTRIES: usize = 1024;

/// Source of per-hostname TLS identities for pooled listeners.
pub trait CertificateProvider: Send + Sync {
    fn create_certificate(&self, hostname: &str) -> Result<ServerIdentity, InterceptError>;
}

/// Issues leaf identities signed by a local authority, keeping recently
/// issued ones in an in-memory cache so a hostname is only signed once.
pub struct AuthorityProvider {
    authority: Authority,
    cache: Mutex<IdentityCache>,
}

impl AuthorityProvider {
    /// Loads the authority key pair from `dir`, generating and persisting a
    /// fresh one on first use.
    pub fn new(dir: impl AsRef<Path>, common_name: &str) -> Result<Self, InterceptError> {
        let authority = load_or_generate_authority(dir, common_name)
            .map_err(|err| InterceptError::Config(err.message))?;
        Ok(Self::with_authority(authority))
    }

    /// Generates a throwaway authority that is never written to disk.
    pub fn ephemeral(common_name: &str) -> Result<Self, InterceptError> {
        let authority = generate_authority(common_name)
            .map_err(|err| InterceptError::Config(err.message))?;
        Ok(Self::with_authority(authority))
    }

    fn with_authority(authority: Authority) -> Self {
        Self {
            authority,
            cache: Mutex::new(IdentityCache::new(IDENTITY_CACHE_ENTRIES)),
        }
    }

    /// PEM of the authority certificate, for export into client trust
    /// stores.
    pub fn authority_cert_pem(&self) -> &[u8] {
        &self.authority.material.cert_pem
    }
}

impl CertificateProvider for AuthorityProvider {
    fn create_certificate(&self, hostname: &str) -> Result<ServerIdentity, InterceptError> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| InterceptError::Runtime("identity cache poisoned".to_string()))?;
        if let Some(identity) = cache.get(hostname) {
            return Ok(identity);
        }
        let identity = issue_identity(hostname, &self.authority)
            .map_err(|err| InterceptError::Runtime(err.message))?;
        cache.insert(hostname.to_string(), identity.clone());
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::{AuthorityProvider, CertificateProvider};

    #[test]
    fn repeated_requests_reuse_the_cached_identity() {
        let provider = AuthorityProvider::ephemeral("Test Authority").unwrap();

        let first = provider.create_certificate("api.example.com").unwrap();
        let second = provider.create_certificate("api.example.com").unwrap();

        assert_eq!(first.cert_pem, second.cert_pem);
        assert_eq!(first.key_pem, second.key_pem);
    }

    #[test]
    fn distinct_hostnames_get_distinct_identities() {
        let provider = AuthorityProvider::ephemeral("Test Authority").unwrap();

        let first = provider.create_certificate("a.example.com").unwrap();
        let second = provider.create_certificate("b.example.com").unwrap();

        assert_ne!(first.cert_pem, second.cert_pem);
    }
}
