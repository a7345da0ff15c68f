use std::net::IpAddr;

use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, IsCa, SanType};

use super::types::{Authority, ServerIdentity, TlsError, TlsErrorKind};

/// Issues a certificate for `host`, signed by the interception authority.
/// Hostnames become DNS SANs, addresses become IP SANs.
pub fn issue_identity(host: &str, authority: &Authority) -> Result<ServerIdentity, TlsError> {
    let mut params = CertificateParams::new(Vec::new());
    params.is_ca = IsCa::NoCa;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    if let Ok(ip) = host.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params
            .subject_alt_names
            .push(SanType::DnsName(host.to_string()));
    }

    let cert = Certificate::from_params(params)
        .map_err(|err| TlsError::new(TlsErrorKind::Rcgen, err.to_string()))?;

    let cert_pem = cert
        .serialize_pem_with_signer(&authority.cert)
        .map_err(|err| TlsError::new(TlsErrorKind::Rcgen, err.to_string()))?
        .into_bytes();
    let key_pem = cert.serialize_private_key_pem().into_bytes();

    Ok(ServerIdentity { cert_pem, key_pem })
}
