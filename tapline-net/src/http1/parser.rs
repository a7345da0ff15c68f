use super::types::{
    Header, HttpVersion, Limits, ParseError, ParseErrorKind, ParseWarning, ParseWarningKind,
    RequestHead, RequestLine, ResponseHead, StatusLine,
};

const CRLF: &[u8] = b"\r\n";
const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStatus<T> {
    NeedMore {
        warnings: Vec<ParseWarning>,
    },
    Complete {
        preamble: T,
        warnings: Vec<ParseWarning>,
    },
    Error {
        error: ParseError,
        warnings: Vec<ParseWarning>,
    },
}

/// A parsed request head plus every byte consumed while reading it.
///
/// The retained buffer includes any bytes that arrived beyond the head
/// terminator, so a caller can replay the connection verbatim after
/// inspecting the head, or re-serialize the head with substituted headers
/// while keeping the trailing bytes intact.
#[derive(Debug, Clone)]
pub struct RequestPreamble {
    pub head: RequestHead,
    head_len: usize,
    buffer: Vec<u8>,
}

impl RequestPreamble {
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn trailing(&self) -> &[u8] {
        &self.buffer[self.head_len..]
    }

    pub fn rebuild(&self, head: &RequestHead) -> Vec<u8> {
        let mut bytes = head.serialize();
        bytes.extend_from_slice(self.trailing());
        bytes
    }
}

#[derive(Debug, Clone)]
pub struct ResponsePreamble {
    pub head: ResponseHead,
    head_len: usize,
    buffer: Vec<u8>,
}

impl ResponsePreamble {
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn trailing(&self) -> &[u8] {
        &self.buffer[self.head_len..]
    }

    pub fn rebuild(&self, head: &ResponseHead) -> Vec<u8> {
        let mut bytes = head.serialize();
        bytes.extend_from_slice(self.trailing());
        bytes
    }
}

#[derive(Debug, Default)]
pub struct RequestPreambleParser {
    buffer: Vec<u8>,
    warnings: Vec<ParseWarning>,
    limits: Limits,
}

impl RequestPreambleParser {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            buffer: Vec::new(),
            warnings: Vec::new(),
            limits,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> ParseStatus<RequestPreamble> {
        self.buffer.extend_from_slice(bytes);

        let head_end = match find_head_end(&self.buffer, self.limits) {
            Ok(Some(index)) => index,
            Ok(None) => {
                return ParseStatus::NeedMore {
                    warnings: self.warnings.clone(),
                };
            }
            Err(error) => {
                let warnings = std::mem::take(&mut self.warnings);
                return ParseStatus::Error { error, warnings };
            }
        };

        let head = match parse_request_head(&self.buffer[..head_end], &mut self.warnings) {
            Ok(head) => head,
            Err(error) => {
                let warnings = std::mem::take(&mut self.warnings);
                return ParseStatus::Error { error, warnings };
            }
        };

        let warnings = std::mem::take(&mut self.warnings);
        ParseStatus::Complete {
            preamble: RequestPreamble {
                head,
                head_len: head_end + HEAD_TERMINATOR.len(),
                buffer: std::mem::take(&mut self.buffer),
            },
            warnings,
        }
    }
}

#[derive(Debug, Default)]
pub struct ResponsePreambleParser {
    buffer: Vec<u8>,
    warnings: Vec<ParseWarning>,
    limits: Limits,
}

impl ResponsePreambleParser {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            buffer: Vec::new(),
            warnings: Vec::new(),
            limits,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> ParseStatus<ResponsePreamble> {
        self.buffer.extend_from_slice(bytes);

        let head_end = match find_head_end(&self.buffer, self.limits) {
            Ok(Some(index)) => index,
            Ok(None) => {
                return ParseStatus::NeedMore {
                    warnings: self.warnings.clone(),
                };
            }
            Err(error) => {
                let warnings = std::mem::take(&mut self.warnings);
                return ParseStatus::Error { error, warnings };
            }
        };

        let head = match parse_response_head(&self.buffer[..head_end], &mut self.warnings) {
            Ok(head) => head,
            Err(error) => {
                let warnings = std::mem::take(&mut self.warnings);
                return ParseStatus::Error { error, warnings };
            }
        };

        let warnings = std::mem::take(&mut self.warnings);
        ParseStatus::Complete {
            preamble: ResponsePreamble {
                head,
                head_len: head_end + HEAD_TERMINATOR.len(),
                buffer: std::mem::take(&mut self.buffer),
            },
            warnings,
        }
    }
}

fn find_head_end(buffer: &[u8], limits: Limits) -> Result<Option<usize>, ParseError> {
    match twoway::find_bytes(buffer, HEAD_TERMINATOR) {
        Some(index) if index > limits.max_head_bytes => Err(ParseError {
            kind: ParseErrorKind::HeadTooLarge,
            offset: limits.max_head_bytes,
        }),
        Some(index) => Ok(Some(index)),
        None if buffer.len() > limits.max_head_bytes => Err(ParseError {
            kind: ParseErrorKind::HeadTooLarge,
            offset: limits.max_head_bytes,
        }),
        None => Ok(None),
    }
}

fn parse_request_head(
    bytes: &[u8],
    warnings: &mut Vec<ParseWarning>,
) -> Result<RequestHead, ParseError> {
    let line_end = twoway::find_bytes(bytes, CRLF).unwrap_or(bytes.len());
    let line = parse_request_line(&bytes[..line_end], warnings)?;
    let header_bytes = bytes.get(line_end + CRLF.len()..).unwrap_or_default();
    let headers = parse_header_block(header_bytes, line_end, warnings).ok_or(ParseError {
        kind: ParseErrorKind::InvalidRequestLine,
        offset: line_end,
    })?;
    Ok(RequestHead { line, headers })
}

fn parse_response_head(
    bytes: &[u8],
    warnings: &mut Vec<ParseWarning>,
) -> Result<ResponseHead, ParseError> {
    let line_end = twoway::find_bytes(bytes, CRLF).unwrap_or(bytes.len());
    let line = parse_status_line(&bytes[..line_end], warnings)?;
    let header_bytes = bytes.get(line_end + CRLF.len()..).unwrap_or_default();
    let headers = parse_header_block(header_bytes, line_end, warnings).ok_or(ParseError {
        kind: ParseErrorKind::InvalidStatusLine,
        offset: line_end,
    })?;
    Ok(ResponseHead { line, headers })
}

fn parse_request_line(
    line: &[u8],
    warnings: &mut Vec<ParseWarning>,
) -> Result<RequestLine, ParseError> {
    let invalid = ParseError {
        kind: ParseErrorKind::InvalidRequestLine,
        offset: 0,
    };
    let text = std::str::from_utf8(line).map_err(|_| invalid.clone())?;

    let mut parts = text.split_whitespace();
    let method = parts.next().ok_or_else(|| invalid.clone())?;
    let target = parts.next().ok_or_else(|| invalid.clone())?;
    let version_raw = parts.next().unwrap_or("HTTP/1.1");
    if parts.next().is_some() {
        return Err(invalid);
    }

    Ok(RequestLine {
        method: method.to_string(),
        target: target.to_string(),
        version: parse_http_version(version_raw, 0, warnings),
    })
}

fn parse_status_line(
    line: &[u8],
    warnings: &mut Vec<ParseWarning>,
) -> Result<StatusLine, ParseError> {
    let invalid = ParseError {
        kind: ParseErrorKind::InvalidStatusLine,
        offset: 0,
    };
    let text = std::str::from_utf8(line).map_err(|_| invalid.clone())?;

    let mut parts = text.splitn(3, ' ');
    let version_raw = parts.next().unwrap_or("HTTP/1.1");
    let status_raw = parts.next().ok_or_else(|| invalid.clone())?;
    let reason = parts.next().unwrap_or("");
    let status_code = status_raw.parse::<u16>().map_err(|_| invalid.clone())?;

    Ok(StatusLine {
        version: parse_http_version(version_raw, 0, warnings),
        status_code,
        reason: reason.to_string(),
    })
}

fn parse_http_version(
    version_raw: &str,
    offset: usize,
    warnings: &mut Vec<ParseWarning>,
) -> HttpVersion {
    match version_raw {
        "HTTP/1.0" => HttpVersion::Http10,
        "HTTP/1.1" => HttpVersion::Http11,
        other => {
            warnings.push(ParseWarning {
                kind: ParseWarningKind::UnknownVersion(other.to_string()),
                offset,
            });
            HttpVersion::Other(other.to_string())
        }
    }
}

fn parse_header_block(
    bytes: &[u8],
    base_offset: usize,
    warnings: &mut Vec<ParseWarning>,
) -> Option<Vec<Header>> {
    if bytes.is_empty() {
        return Some(Vec::new());
    }

    let text = std::str::from_utf8(bytes).ok()?;

    let mut headers: Vec<Header> = Vec::new();
    let mut offset = base_offset;

    for line in text.split("\r\n") {
        if line.is_empty() {
            continue;
        }

        let first = line.as_bytes()[0];
        if first == b' ' || first == b'\t' {
            // obs-fold continuation: append onto the previous header.
            warnings.push(ParseWarning {
                kind: ParseWarningKind::ObsFoldDetected,
                offset,
            });
            if let Some(last) = headers.last_mut() {
                last.value.push(' ');
                last.value.push_str(line.trim());
            }
            offset += line.len() + CRLF.len();
            continue;
        }

        let mut parts = line.splitn(2, ':');
        let raw_name = parts.next().unwrap_or("");
        let value = parts.next().unwrap_or("");

        if raw_name.trim().is_empty() {
            warnings.push(ParseWarning {
                kind: ParseWarningKind::InvalidHeaderName,
                offset,
            });
        }

        headers.push(Header {
            name: raw_name.trim().to_string(),
            raw_name: raw_name.to_string(),
            value: value.trim().to_string(),
        });
        offset += line.len() + CRLF.len();
    }

    Some(headers)
}

#[cfg(test)]
mod tests {
    use super::{ParseStatus, RequestPreambleParser, ResponsePreambleParser};
    use crate::http1::{Header, Limits, ParseWarningKind};

    #[test]
    fn parses_upgrade_request_head() {
        let mut parser = RequestPreambleParser::new();
        let input = b"GET /chat HTTP/1.1\r\nHost: example.com\r\nUpgrade: WebSocket\r\n\r\n";
        match parser.push(input) {
            ParseStatus::Complete { preamble, .. } => {
                assert_eq!(preamble.head.line.method, "GET");
                assert_eq!(preamble.head.line.target, "/chat");
                assert!(preamble.head.upgrades_to("websocket"));
                assert_eq!(preamble.buffer(), input);
                assert!(preamble.trailing().is_empty());
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn retains_bytes_past_the_head() {
        let mut parser = RequestPreambleParser::new();
        let part1: &[u8] = b"GET / HTTP/1.1\r\nHost:";
        let part2: &[u8] = b" a.example\r\n\r\n\x81\x05hello";

        assert!(matches!(parser.push(part1), ParseStatus::NeedMore { .. }));
        match parser.push(part2) {
            ParseStatus::Complete { preamble, .. } => {
                assert_eq!(preamble.trailing(), b"\x81\x05hello");
                assert_eq!(preamble.buffer().len(), part1.len() + part2.len());
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn rebuild_substitutes_headers_and_keeps_trailing_bytes() {
        let mut parser = RequestPreambleParser::new();
        let input = b"GET /ws HTTP/1.1\r\nHost: old.example\r\nOrigin: http://old.example\r\n\r\nXY";
        let ParseStatus::Complete { preamble, .. } = parser.push(input) else {
            panic!("expected complete preamble");
        };

        let mut head = preamble.head.clone();
        head.set_header("Host", "new.example:9000");
        head.set_header("Origin", "https://new.example:9000");
        let rebuilt = preamble.rebuild(&head);
        let text = String::from_utf8_lossy(&rebuilt);

        assert!(text.starts_with("GET /ws HTTP/1.1\r\n"));
        assert!(text.contains("Host: new.example:9000\r\n"));
        assert!(!text.contains("old.example\r\n"));
        assert!(rebuilt.ends_with(b"XY"));
    }

    #[test]
    fn parses_switching_protocols_response() {
        let mut parser = ResponsePreambleParser::new();
        let input =
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        match parser.push(input) {
            ParseStatus::Complete { preamble, .. } => {
                assert_eq!(preamble.head.line.status_code, 101);
                assert_eq!(preamble.head.header("connection"), Some("Upgrade"));
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn response_rebuild_appends_injected_header() {
        let mut parser = ResponsePreambleParser::new();
        let input = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n";
        let ParseStatus::Complete { preamble, .. } = parser.push(input) else {
            panic!("expected complete preamble");
        };

        let mut head = preamble.head.clone();
        head.headers
            .push(Header::new("access-control-allow-origin", "http://a.example"));
        let rebuilt = preamble.rebuild(&head);
        assert!(
            String::from_utf8_lossy(&rebuilt)
                .contains("access-control-allow-origin: http://a.example\r\n")
        );
    }

    #[test]
    fn rejects_oversized_head() {
        let mut parser = RequestPreambleParser::with_limits(Limits { max_head_bytes: 32 });
        let input = b"GET / HTTP/1.1\r\nHost: far-too-long-for-the-limit.example\r\n\r\n";
        assert!(matches!(parser.push(input), ParseStatus::Error { .. }));
    }

    #[test]
    fn garbage_request_line_is_an_error() {
        let mut parser = RequestPreambleParser::new();
        assert!(matches!(
            parser.push(b"\x16\x03\x01\x02\x00garbage\r\n\r\n"),
            ParseStatus::Error { .. }
        ));
    }

    #[test]
    fn warns_on_obs_fold_continuation() {
        let mut parser = RequestPreambleParser::new();
        let input = b"GET / HTTP/1.1\r\nX-Long: one\r\n\ttwo\r\n\r\n";
        match parser.push(input) {
            ParseStatus::Complete {
                preamble, warnings, ..
            } => {
                assert_eq!(preamble.head.header("x-long"), Some("one two"));
                assert!(
                    warnings
                        .iter()
                        .any(|warning| matches!(warning.kind, ParseWarningKind::ObsFoldDetected))
                );
            }
            other => panic!("unexpected status {other:?}"),
        }
    }
}
