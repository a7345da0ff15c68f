#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
    pub raw_name: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            raw_name: name.clone(),
            name,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
    Other(String),
}

impl HttpVersion {
    pub fn as_str(&self) -> &str {
        match self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
            HttpVersion::Other(other) => other.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub version: HttpVersion,
    pub status_code: u16,
    pub reason: String,
}

/// Request line plus header block, without any body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub line: RequestLine,
    pub headers: Vec<Header>,
}

/// Status line plus header block, without any body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub line: StatusLine,
    pub headers: Vec<Header>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        set_header(&mut self.headers, name, value);
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers
            .retain(|header| !header.name.eq_ignore_ascii_case(name));
    }

    /// True when the head carries `Upgrade: <protocol>` (value compared
    /// case-insensitively, as the original header is client-controlled).
    pub fn upgrades_to(&self, protocol: &str) -> bool {
        self.header("upgrade")
            .is_some_and(|value| value.eq_ignore_ascii_case(protocol))
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = format!(
            "{} {} {}\r\n",
            self.line.method,
            self.line.target,
            self.line.version.as_str()
        )
        .into_bytes();
        serialize_headers(&mut bytes, &self.headers);
        bytes
    }
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        set_header(&mut self.headers, name, value);
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = format!(
            "{} {} {}\r\n",
            self.line.version.as_str(),
            self.line.status_code,
            self.line.reason
        )
        .into_bytes();
        serialize_headers(&mut bytes, &self.headers);
        bytes
    }
}

pub fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .map(|header| header.value.as_str())
}

pub fn set_header(headers: &mut Vec<Header>, name: &str, value: &str) {
    if let Some(header) = headers
        .iter_mut()
        .find(|header| header.name.eq_ignore_ascii_case(name))
    {
        header.value = value.to_string();
    } else {
        headers.push(Header::new(name, value));
    }
}

pub fn serialize_headers(bytes: &mut Vec<u8>, headers: &[Header]) {
    for header in headers {
        bytes.extend_from_slice(header.raw_name.as_bytes());
        bytes.extend_from_slice(b": ");
        bytes.extend_from_slice(header.value.as_bytes());
        bytes.extend_from_slice(b"\r\n");
    }
    bytes.extend_from_slice(b"\r\n");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_head_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_head_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseWarning {
    pub kind: ParseWarningKind,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseWarningKind {
    UnknownVersion(String),
    ObsFoldDetected,
    InvalidHeaderName,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    InvalidRequestLine,
    InvalidStatusLine,
    HeadTooLarge,
}
