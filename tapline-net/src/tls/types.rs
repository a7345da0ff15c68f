use std::path::PathBuf;

#[derive(Debug)]
pub struct AuthorityMaterial {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

#[derive(Debug)]
pub struct AuthorityPaths {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Signing authority for interception certificates.
///
/// `material` holds the PEM pair as written to (or read from) disk, which is
/// what gets installed into a client trust store. `cert` is the rcgen signer
/// used to issue per-hostname identities.
pub struct Authority {
    pub material: AuthorityMaterial,
    pub cert: rcgen::Certificate,
}

#[derive(Debug, Clone)]
pub struct ServerIdentity {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

#[derive(Debug)]
pub struct TlsError {
    pub kind: TlsErrorKind,
    pub message: String,
}

#[derive(Debug)]
pub enum TlsErrorKind {
    Rcgen,
    Io,
    OpenSsl,
}

impl TlsError {
    pub fn new(kind: TlsErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
