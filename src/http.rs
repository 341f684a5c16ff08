//! Minimal HTTP/1.x message model for the socket engine.
//!
//! Only what the exchange needs: an incremental head parse, body framing
//! from `Content-Length`, the RFC 7230 keep-alive decision, and a response
//! encoder. Richer HTTP semantics belong to the layer above.

use bytes::Bytes;
use thiserror::Error;

/// Most headers a request head may carry.
pub const MAX_HEADER_COUNT: usize = 128;

/// Violations of the wire grammar this engine accepts.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The request line was not `METHOD SP TARGET SP VERSION`.
    #[error("malformed request line")]
    BadRequestLine,
    /// The version was not HTTP/1.0 or HTTP/1.1.
    #[error("unsupported protocol version")]
    BadVersion,
    /// A header line was not `name: value` with a token name.
    #[error("malformed header line")]
    BadHeader,
    /// More than [`MAX_HEADER_COUNT`] headers arrived.
    #[error("too many headers")]
    TooManyHeaders,
    /// The head grew past the configured cap without terminating.
    #[error("request head exceeds {max} bytes")]
    HeadTooLarge { max: usize },
    /// `Content-Length` was unparsable or self-contradictory.
    #[error("invalid content length")]
    BadContentLength,
    /// A transfer coding other than identity was requested.
    #[error("unsupported transfer encoding")]
    UnsupportedTransferEncoding,
    /// The declared body exceeds the configured cap.
    #[error("request body exceeds {max} bytes")]
    BodyTooLarge { max: usize },
}

/// Protocol versions the engine speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    /// Wire form of the version token.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

/// Request method, validated to RFC 7230 token bytes at parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method(String);

impl Method {
    /// The method token as it appeared on the wire.
    #[must_use]
    pub fn as_str(&self) -> &str { &self.0 }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for Method {
    fn eq(&self, other: &str) -> bool { self.0 == other }
}

impl PartialEq<&str> for Method {
    fn eq(&self, other: &&str) -> bool { self.0 == *other }
}

/// Parsed request line plus header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    headers: Vec<(String, String)>,
}

/// How the body after a head is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the head.
    None,
    /// Exactly this many bytes follow the head.
    Length(usize),
}

impl RequestHead {
    /// Assemble a head from parts the incremental parser collected.
    pub(crate) fn from_parts(
        method: Method,
        target: String,
        version: Version,
        headers: Vec<(String, String)>,
    ) -> Self {
        Self {
            method,
            target,
            version,
            headers,
        }
    }

    /// First value for `name`, compared case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All parsed headers in arrival order.
    #[must_use]
    pub fn headers(&self) -> &[(String, String)] { &self.headers }

    /// Determine how the body is delimited.
    ///
    /// # Errors
    /// Transfer codings other than identity and malformed or oversized
    /// `Content-Length` values are rejected.
    pub fn body_framing(&self, max_body: usize) -> Result<BodyFraming, ProtocolError> {
        if let Some(te) = self.header("transfer-encoding")
            && !te.trim().eq_ignore_ascii_case("identity")
        {
            return Err(ProtocolError::UnsupportedTransferEncoding);
        }
        let mut declared: Option<usize> = None;
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("content-length") {
                // Digits only; `str::parse` alone would admit a leading `+`.
                if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(ProtocolError::BadContentLength);
                }
                let parsed: usize =
                    value.parse().map_err(|_| ProtocolError::BadContentLength)?;
                // Repeated headers must agree.
                if declared.is_some_and(|seen| seen != parsed) {
                    return Err(ProtocolError::BadContentLength);
                }
                declared = Some(parsed);
            }
        }
        match declared {
            None | Some(0) => Ok(BodyFraming::None),
            Some(len) if len > max_body => Err(ProtocolError::BodyTooLarge { max: max_body }),
            Some(len) => Ok(BodyFraming::Length(len)),
        }
    }

    /// RFC 7230 keep-alive decision: `close` always wins, an explicit
    /// `keep-alive` token wins next, otherwise the version default applies.
    #[must_use]
    pub fn keep_alive(&self) -> bool {
        let mut close = false;
        let mut keep = false;
        if let Some(value) = self.header("connection") {
            for token in value.split(',') {
                let token = token.trim();
                if token.eq_ignore_ascii_case("close") {
                    close = true;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    keep = true;
                }
            }
        }
        if close {
            false
        } else if keep {
            true
        } else {
            self.version == Version::Http11
        }
    }
}

/// A framed request handed to the application collaborator.
#[derive(Debug, Clone)]
pub struct Request {
    pub head: RequestHead,
    pub body: Bytes,
}

/// Response produced by the application collaborator.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl Response {
    /// Start a response with the given status code.
    #[must_use]
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Append a header. Framing headers the engine owns are skipped during
    /// encoding, so callers cannot desynchronise the connection.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the response body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Status code carried by this response.
    #[must_use]
    pub fn status(&self) -> u16 { self.status }

    /// Body length in bytes.
    #[must_use]
    pub fn body_len(&self) -> usize { self.body.len() }

    /// Encode the full wire form into `out`.
    ///
    /// `Content-Length` and `Connection` are written by the engine from its
    /// own framing decision; caller copies of those headers are dropped.
    pub(crate) fn encode_into(&self, out: &mut Vec<u8>, version: Version, keep_alive: bool) {
        out.extend_from_slice(version.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(reason_phrase(self.status).as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("connection")
            {
                continue;
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"Content-Length: ");
        out.extend_from_slice(self.body.len().to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(if keep_alive {
            b"Connection: keep-alive\r\n".as_slice()
        } else {
            b"Connection: close\r\n".as_slice()
        });
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
    }
}

pub(crate) fn parse_request_line(
    line: &[u8],
) -> Result<(Method, String, Version), ProtocolError> {
    let text = std::str::from_utf8(line).map_err(|_| ProtocolError::BadRequestLine)?;
    let mut parts = text.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ProtocolError::BadRequestLine);
    };
    if method.is_empty() || !method.bytes().all(is_token_byte) {
        return Err(ProtocolError::BadRequestLine);
    }
    if target.is_empty() || target.contains(|c: char| c.is_ascii_whitespace()) {
        return Err(ProtocolError::BadRequestLine);
    }
    let version = match version {
        "HTTP/1.1" => Version::Http11,
        "HTTP/1.0" => Version::Http10,
        _ => return Err(ProtocolError::BadVersion),
    };
    Ok((Method(method.to_owned()), target.to_owned(), version))
}

pub(crate) fn parse_header_line(line: &[u8]) -> Result<(String, String), ProtocolError> {
    let text = std::str::from_utf8(line).map_err(|_| ProtocolError::BadHeader)?;
    let (name, value) = text.split_once(':').ok_or(ProtocolError::BadHeader)?;
    if name.is_empty() || !name.bytes().all(is_token_byte) {
        return Err(ProtocolError::BadHeader);
    }
    Ok((name.to_owned(), value.trim().to_owned()))
}

/// RFC 7230 token characters, the only bytes legal in methods and header
/// names.
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// Canonical reason phrase for the handful of statuses this layer emits
/// itself; anything unknown gets a neutral phrase.
fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Status",
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    /// Run a full head through the line parsers the exchange uses.
    fn parse_head(buf: &[u8]) -> Result<RequestHead, ProtocolError> {
        let mut lines = buf
            .split(|&b| b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line));
        let request_line = lines.next().ok_or(ProtocolError::BadRequestLine)?;
        let (method, target, version) = parse_request_line(request_line)?;
        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            headers.push(parse_header_line(line)?);
        }
        Ok(RequestHead::from_parts(method, target, version, headers))
    }

    fn complete(buf: &[u8]) -> RequestHead { parse_head(buf).unwrap() }

    #[test]
    fn parses_a_minimal_head() {
        let head = complete(b"GET /index.html HTTP/1.1\r\nHost: a\r\n\r\n");
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/index.html");
        assert_eq!(head.version, Version::Http11);
        assert_eq!(head.header("host"), Some("a"));
    }

    #[rstest]
    #[case(b"GET /\r\n\r\n".as_slice(), ProtocolError::BadRequestLine)]
    #[case(b"GET / extra HTTP/1.1\r\n\r\n".as_slice(), ProtocolError::BadRequestLine)]
    #[case(b"G@T / HTTP/1.1\r\n\r\n".as_slice(), ProtocolError::BadRequestLine)]
    #[case(b"GET / HTTP/2.0\r\n\r\n".as_slice(), ProtocolError::BadVersion)]
    #[case(b"GET / HTTP/1.1\r\nno-colon\r\n\r\n".as_slice(), ProtocolError::BadHeader)]
    #[case(b"GET / HTTP/1.1\r\nbad name: x\r\n\r\n".as_slice(), ProtocolError::BadHeader)]
    fn grammar_violations_are_rejected(#[case] buf: &[u8], #[case] expected: ProtocolError) {
        assert_eq!(parse_head(buf), Err(expected));
    }

    #[test]
    fn method_token_survives_round_trip() {
        let (method, _, _) = parse_request_line(b"PATCH /x HTTP/1.1").unwrap();
        assert_eq!(method.as_str(), "PATCH");
        assert_eq!(method.to_string(), "PATCH");
    }

    #[rstest]
    #[case::http11_default(b"GET / HTTP/1.1\r\n\r\n".as_slice(), true)]
    #[case::http10_default(b"GET / HTTP/1.0\r\n\r\n".as_slice(), false)]
    #[case::explicit_close(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n".as_slice(), false)]
    #[case::close_wins(
        b"GET / HTTP/1.1\r\nConnection: keep-alive, close\r\n\r\n".as_slice(),
        false
    )]
    #[case::http10_keep_alive(
        b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n".as_slice(),
        true
    )]
    fn keep_alive_follows_version_and_tokens(#[case] buf: &[u8], #[case] expected: bool) {
        let head = complete(buf);
        assert_eq!(head.keep_alive(), expected);
    }

    #[rstest]
    #[case(b"GET / HTTP/1.1\r\n\r\n".as_slice(), Ok(BodyFraming::None))]
    #[case(
        b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\n".as_slice(),
        Ok(BodyFraming::Length(5))
    )]
    #[case(b"POST / HTTP/1.1\r\nContent-Length: 0\r\n\r\n".as_slice(), Ok(BodyFraming::None))]
    #[case(
        b"POST / HTTP/1.1\r\nContent-Length: x\r\n\r\n".as_slice(),
        Err(ProtocolError::BadContentLength)
    )]
    #[case(
        b"POST / HTTP/1.1\r\nContent-Length: +5\r\n\r\n".as_slice(),
        Err(ProtocolError::BadContentLength)
    )]
    #[case(
        b"POST / HTTP/1.1\r\nContent-Length: 4\r\nContent-Length: 5\r\n\r\n".as_slice(),
        Err(ProtocolError::BadContentLength)
    )]
    #[case(
        b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n".as_slice(),
        Err(ProtocolError::UnsupportedTransferEncoding)
    )]
    fn body_framing_follows_headers(
        #[case] buf: &[u8],
        #[case] expected: Result<BodyFraming, ProtocolError>,
    ) {
        let head = complete(buf);
        assert_eq!(head.body_framing(1024), expected);
    }

    #[test]
    fn declared_body_over_cap_is_rejected() {
        let head = complete(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n");
        assert_eq!(
            head.body_framing(4),
            Err(ProtocolError::BodyTooLarge { max: 4 })
        );
    }

    #[test]
    fn response_encodes_engine_owned_framing() {
        let response = Response::new(200)
            .header("X-Trace", "1")
            .header("Content-Length", "999")
            .body("hi");
        let mut out = Vec::new();
        response.encode_into(&mut out, Version::Http11, true);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("X-Trace: 1\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(!text.contains("999"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\nhi"));
    }

    #[test]
    fn close_decision_reaches_the_wire() {
        let mut out = Vec::new();
        Response::new(204).encode_into(&mut out, Version::Http10, false);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.0 204 No Content\r\n"));
        assert!(text.contains("Connection: close\r\n"));
    }
}
