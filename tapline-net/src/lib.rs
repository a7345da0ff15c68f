mod http1;
mod socks;
mod tls;

pub use http1::{
    Header, HttpVersion, Limits, ParseError, ParseErrorKind, ParseStatus, ParseWarning,
    ParseWarningKind, RequestHead, RequestLine, RequestPreamble, RequestPreambleParser,
    ResponseHead, ResponsePreamble, ResponsePreambleParser, StatusLine, header_value,
    serialize_headers, set_header,
};

pub use tls::{
    Authority, AuthorityMaterial, AuthorityPaths, IdentityCache, ServerIdentity, TlsError,
    TlsErrorKind, build_acceptor, generate_authority, issue_identity, load_or_generate_authority,
    write_authority_to_dir,
};

pub use socks::{
    METHOD_NO_AUTH, METHOD_USER_PASS, SocksAddress, SocksAuth, SocksConnectParser, SocksError,
    SocksErrorKind, SocksParseStatus, SocksReply, SocksResponse, build_auth_request,
    build_connect, build_greeting, parse_auth_response, parse_connect_response,
    parse_greeting_response,
};
