mod client;
mod parser;
mod types;

pub use client::{
    METHOD_NO_AUTH, METHOD_USER_PASS, SocksAuth, build_auth_request, build_connect,
    build_greeting, parse_auth_response, parse_connect_response, parse_greeting_response,
};
pub use parser::{SocksConnectParser, SocksParseStatus};
pub use types::{
    SocksAddress, SocksError, SocksErrorKind, SocksReply, SocksResponse,
};
