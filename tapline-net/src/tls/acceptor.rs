use openssl::pkey::PKey;
use openssl::ssl::{SslAcceptor, SslMethod, SslOptions, SslVerifyMode};
use openssl::x509::X509;

use super::types::{ServerIdentity, TlsError, TlsErrorKind};

pub fn build_acceptor(identity: &ServerIdentity) -> Result<SslAcceptor, TlsError> {
    let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls())
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;

    builder.set_options(SslOptions::NO_SSLV2 | SslOptions::NO_SSLV3);

    let cert = X509::from_pem(&identity.cert_pem)
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;
    let key = PKey::private_key_from_pem(&identity.key_pem)
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;

    builder
        .set_certificate(&cert)
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;
    builder
        .set_private_key(&key)
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;

    builder.set_verify(SslVerifyMode::NONE);

    Ok(builder.build())
}
