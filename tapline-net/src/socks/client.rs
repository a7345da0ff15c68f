use super::types::{
    SocksAddress, SocksError, SocksErrorKind, SocksReply, SocksResponse,
};

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_USER_PASS: u8 = 0x02;
const METHOD_REJECTED: u8 = 0xFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksAuth {
    NoAuth,
    UserPass { username: String, password: String },
}

pub fn build_greeting(auth: &SocksAuth) -> Vec<u8> {
    let methods = match auth {
        SocksAuth::NoAuth => vec![METHOD_NO_AUTH],
        SocksAuth::UserPass { .. } => vec![METHOD_NO_AUTH, METHOD_USER_PASS],
    };
    let mut buf = Vec::with_capacity(2 + methods.len());
    buf.push(0x05);
    buf.push(methods.len() as u8);
    buf.extend_from_slice(&methods);
    buf
}

pub fn parse_greeting_response(bytes: &[u8]) -> Result<u8, SocksError> {
    if bytes.len() < 2 {
        return Err(SocksError {
            kind: SocksErrorKind::UnexpectedEof,
            offset: bytes.len(),
        });
    }
    if bytes[0] != 0x05 {
        return Err(SocksError {
            kind: SocksErrorKind::InvalidVersion,
            offset: 0,
        });
    }
    if bytes[1] == METHOD_REJECTED {
        return Err(SocksError {
            kind: SocksErrorKind::NoAcceptableAuth,
            offset: 1,
        });
    }
    Ok(bytes[1])
}

/// RFC 1929 username/password subnegotiation request.
pub fn build_auth_request(username: &str, password: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(3 + username.len() + password.len());
    buf.push(0x01);
    buf.push(username.len() as u8);
    buf.extend_from_slice(username.as_bytes());
    buf.push(password.len() as u8);
    buf.extend_from_slice(password.as_bytes());
    buf
}

pub fn parse_auth_response(bytes: &[u8]) -> Result<(), SocksError> {
    if bytes.len() < 2 {
        return Err(SocksError {
            kind: SocksErrorKind::UnexpectedEof,
            offset: bytes.len(),
        });
    }
    if bytes[0] != 0x01 {
        return Err(SocksError {
            kind: SocksErrorKind::InvalidVersion,
            offset: 0,
        });
    }
    if bytes[1] != 0x00 {
        return Err(SocksError {
            kind: SocksErrorKind::AuthRejected,
            offset: 1,
        });
    }
    Ok(())
}

pub fn build_connect(address: SocksAddress, port: u16) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(0x05);
    buf.push(0x01);
    buf.push(0x00);

    encode_address(&mut buf, &address);
    buf.extend_from_slice(&port.to_be_bytes());
    buf
}

pub fn parse_connect_response(bytes: &[u8]) -> Result<SocksResponse, SocksError> {
    if bytes.len() < 5 {
        return Err(SocksError {
            kind: SocksErrorKind::UnexpectedEof,
            offset: bytes.len(),
        });
    }
    if bytes[0] != 0x05 {
        return Err(SocksError {
            kind: SocksErrorKind::InvalidVersion,
            offset: 0,
        });
    }
    if bytes[1] == METHOD_REJECTED {
        return Err(SocksError {
            kind: SocksErrorKind::InvalidResponse,
            offset: 1,
        });
    }

    let reply = map_reply(bytes[1]);
    let address_type = bytes[3];
    let mut cursor = 4;
    let address = match address_type {
        0x01 => {
            if bytes.len() < cursor + 4 {
                return Err(SocksError {
                    kind: SocksErrorKind::UnexpectedEof,
                    offset: bytes.len(),
                });
            }
            let ip = [
                bytes[cursor],
                bytes[cursor + 1],
                bytes[cursor + 2],
                bytes[cursor + 3],
            ];
            cursor += 4;
            SocksAddress::IpV4(ip)
        }
        0x03 => {
            if bytes.len() < cursor + 1 {
                return Err(SocksError {
                    kind: SocksErrorKind::UnexpectedEof,
                    offset: bytes.len(),
                });
            }
            let len = bytes[cursor] as usize;
            cursor += 1;
            if bytes.len() < cursor + len {
                return Err(SocksError {
                    kind: SocksErrorKind::UnexpectedEof,
                    offset: bytes.len(),
                });
            }
            let domain = String::from_utf8_lossy(&bytes[cursor..cursor + len]).to_string();
            cursor += len;
            SocksAddress::Domain(domain)
        }
        0x04 => {
            if bytes.len() < cursor + 16 {
                return Err(SocksError {
                    kind: SocksErrorKind::UnexpectedEof,
                    offset: bytes.len(),
                });
            }
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&bytes[cursor..cursor + 16]);
            cursor += 16;
            SocksAddress::IpV6(ip)
        }
        _ => {
            return Err(SocksError {
                kind: SocksErrorKind::UnsupportedAddressType,
                offset: cursor,
            });
        }
    };

    if bytes.len() < cursor + 2 {
        return Err(SocksError {
            kind: SocksErrorKind::UnexpectedEof,
            offset: bytes.len(),
        });
    }
    let port = u16::from_be_bytes([bytes[cursor], bytes[cursor + 1]]);

    Ok(SocksResponse {
        reply,
        address,
        port,
    })
}

fn map_reply(code: u8) -> SocksReply {
    match code {
        0x00 => SocksReply::Succeeded,
        0x01 => SocksReply::GeneralFailure,
        0x02 => SocksReply::ConnectionNotAllowed,
        0x03 => SocksReply::NetworkUnreachable,
        0x04 => SocksReply::HostUnreachable,
        0x05 => SocksReply::ConnectionRefused,
        0x06 => SocksReply::TtlExpired,
        0x07 => SocksReply::CommandNotSupported,
        0x08 => SocksReply::AddressTypeNotSupported,
        other => SocksReply::Other(other),
    }
}

fn encode_address(buf: &mut Vec<u8>, address: &SocksAddress) {
    match address {
        SocksAddress::IpV4(ip) => {
            buf.push(0x01);
            buf.extend_from_slice(ip);
        }
        SocksAddress::Domain(domain) => {
            buf.push(0x03);
            buf.push(domain.len() as u8);
            buf.extend_from_slice(domain.as_bytes());
        }
        SocksAddress::IpV6(ip) => {
            buf.push(0x04);
            buf.extend_from_slice(ip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_greeting_no_auth() {
        let bytes = build_greeting(&SocksAuth::NoAuth);
        assert_eq!(bytes, vec![0x05, 0x01, 0x00]);
    }

    #[test]
    fn builds_greeting_user_pass() {
        let bytes = build_greeting(&SocksAuth::UserPass {
            username: "user".to_string(),
            password: "pass".to_string(),
        });
        assert_eq!(bytes, vec![0x05, 0x02, 0x00, 0x02]);
    }

    #[test]
    fn parses_greeting_response() {
        let method = parse_greeting_response(&[0x05, 0x02]).unwrap();
        assert_eq!(method, METHOD_USER_PASS);
    }

    #[test]
    fn rejects_greeting_with_no_acceptable_method() {
        let error = parse_greeting_response(&[0x05, 0xFF]).unwrap_err();
        assert_eq!(error.kind, SocksErrorKind::NoAcceptableAuth);
    }

    #[test]
    fn builds_auth_request() {
        let bytes = build_auth_request("ab", "cd");
        assert_eq!(bytes, vec![0x01, 0x02, b'a', b'b', 0x02, b'c', b'd']);
    }

    #[test]
    fn parses_auth_rejection() {
        let error = parse_auth_response(&[0x01, 0x01]).unwrap_err();
        assert_eq!(error.kind, SocksErrorKind::AuthRejected);
    }

    #[test]
    fn builds_connect_for_domain() {
        let bytes = build_connect(SocksAddress::Domain("example.com".to_string()), 443);
        assert_eq!(
            bytes,
            vec![
                0x05, 0x01, 0x00, 0x03, 11, b'e', b'x', b'a', b'm', b'p', b'l', b'e', b'.', b'c',
                b'o', b'm', 0x01, 0xbb,
            ]
        );
    }

    #[test]
    fn parses_connect_response_ipv4() {
        let bytes = vec![0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90];
        let response = parse_connect_response(&bytes).unwrap();
        assert_eq!(response.reply, SocksReply::Succeeded);
        assert_eq!(response.port, 8080);
    }

    #[test]
    fn maps_refused_reply() {
        let bytes = vec![0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        let response = parse_connect_response(&bytes).unwrap();
        assert_eq!(response.reply, SocksReply::ConnectionRefused);
    }
}
