mod parser;
mod types;

pub use parser::{
    ParseStatus, RequestPreamble, RequestPreambleParser, ResponsePreamble, ResponsePreambleParser,
};
pub use types::{
    Header, HttpVersion, Limits, ParseError, ParseErrorKind, ParseWarning, ParseWarningKind,
    RequestHead, RequestLine, ResponseHead, StatusLine, header_value, serialize_headers,
    set_header,
};
