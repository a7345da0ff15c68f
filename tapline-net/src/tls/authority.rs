use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use chrono::Datelike;
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};

use super::types::{Authority, AuthorityMaterial, AuthorityPaths, TlsError, TlsErrorKind};

const AUTHORITY_VALIDITY_DAYS: u64 = 3650;
const AUTHORITY_CERT_FILE: &str = "tapline-authority.pem";
const AUTHORITY_KEY_FILE: &str = "tapline-authority-key.pem";

pub fn generate_authority(common_name: &str) -> Result<Authority, TlsError> {
    let mut params = CertificateParams::new(Vec::new());
    params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "Tapline");
    params.distinguished_name = dn;

    let now = SystemTime::now();
    params.not_before = rcgen::date_time_ymd(2024, 1, 1);
    params.not_after = rcgen::date_time_ymd(2024, 1, 1);
    if let Some(valid_until) =
        now.checked_add(Duration::from_secs(AUTHORITY_VALIDITY_DAYS * 24 * 3600))
    {
        let datetime = chrono::DateTime::<chrono::Utc>::from(valid_until);
        params.not_after = rcgen::date_time_ymd(
            datetime.year(),
            datetime.month() as u8,
            datetime.day() as u8,
        );
    }

    let cert = Certificate::from_params(params)
        .map_err(|err| TlsError::new(TlsErrorKind::Rcgen, err.to_string()))?;

    let cert_pem = cert
        .serialize_pem()
        .map_err(|err| TlsError::new(TlsErrorKind::Rcgen, err.to_string()))?
        .into_bytes();
    let key_pem = cert.serialize_private_key_pem().into_bytes();

    Ok(Authority {
        material: AuthorityMaterial { cert_pem, key_pem },
        cert,
    })
}

/// Reuses the authority PEM pair under `dir` when present so previously
/// installed trust-store entries stay valid, otherwise generates a fresh
/// authority and writes it there.
pub fn load_or_generate_authority(
    dir: impl AsRef<Path>,
    common_name: &str,
) -> Result<Authority, TlsError> {
    let dir = dir.as_ref();
    let cert_path = dir.join(AUTHORITY_CERT_FILE);
    let key_path = dir.join(AUTHORITY_KEY_FILE);

    if cert_path.exists() && key_path.exists() {
        let cert_pem = fs::read_to_string(&cert_path)
            .map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;
        let key_pem = fs::read_to_string(&key_path)
            .map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;

        let key = KeyPair::from_pem(&key_pem)
            .map_err(|err| TlsError::new(TlsErrorKind::Rcgen, err.to_string()))?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem, key)
            .map_err(|err| TlsError::new(TlsErrorKind::Rcgen, err.to_string()))?;
        let cert = Certificate::from_params(params)
            .map_err(|err| TlsError::new(TlsErrorKind::Rcgen, err.to_string()))?;

        return Ok(Authority {
            material: AuthorityMaterial {
                cert_pem: cert_pem.into_bytes(),
                key_pem: key_pem.into_bytes(),
            },
            cert,
        });
    }

    let authority = generate_authority(common_name)?;
    write_authority_to_dir(dir, &authority.material)?;
    Ok(authority)
}

pub fn write_authority_to_dir(
    dir: impl AsRef<Path>,
    material: &AuthorityMaterial,
) -> Result<AuthorityPaths, TlsError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;

    let cert_path = dir.join(AUTHORITY_CERT_FILE);
    let key_path = dir.join(AUTHORITY_KEY_FILE);

    fs::write(&cert_path, &material.cert_pem)
        .map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;
    fs::write(&key_path, &material.key_pem)
        .map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;

    Ok(AuthorityPaths {
        cert_path,
        key_path,
    })
}
