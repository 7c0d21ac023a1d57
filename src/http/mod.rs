//! HTTP/1.x wire handling.
//!
//! # Data Flow
//! ```text
//! Client TCP connection
//!     → server.rs (accept loop, client session keep-alive loop)
//!     → codec.rs (read a header block off a connection, keep pipelined bytes)
//!     → request.rs / response.rs (httparse → http types, serialize back)
//!     → headers.rs (hop-by-hop stripping, Via, X-Forwarded-For, X-Request-Id, Age)
//!     → txn engine owns everything after the request head is read
//! ```
//!
//! # Design Decisions
//! - Heads are parsed with `httparse` and held as `http` crate types
//! - Bodies never pass through here; the tunnel moves them
//! - Framing is computed once from the head and drives the tunnel's chunk action

pub mod codec;
pub mod headers;
pub mod request;
pub mod response;
pub mod server;

pub use codec::read_head;
pub use request::RequestHead;
pub use response::ResponseHead;
pub use server::ProxyServer;

use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;

/// Most headers accepted in one message head.
pub const MAX_HEADERS: usize = 128;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed message head: {0}")]
    Malformed(#[from] httparse::Error),

    #[error("header block exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("connection closed mid-header")]
    Incomplete,

    #[error("invalid method")]
    InvalidMethod,

    #[error("invalid request target: {0}")]
    InvalidTarget(String),

    #[error("invalid header field")]
    InvalidHeader,

    #[error("invalid status code")]
    InvalidStatus,

    #[error("unsupported HTTP version 1.{0}")]
    UnsupportedVersion(u8),

    #[error("bad message framing: {0}")]
    BadFraming(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ParseError {
    /// Status for a generated response to a client message that failed to parse.
    pub fn status(&self) -> StatusCode {
        match self {
            ParseError::TooLarge { .. } => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body at all.
    Empty,
    Length(u64),
    Chunked,
    /// Body runs until the sender closes (responses only).
    UntilClose,
}

impl BodyFraming {
    pub fn has_body(&self) -> bool {
        !matches!(self, BodyFraming::Empty)
    }

    /// The end of the body is visible without a close.
    pub fn is_delimited(&self) -> bool {
        !matches!(self, BodyFraming::UntilClose)
    }
}

fn is_chunked(headers: &HeaderMap) -> Result<Option<bool>, ParseError> {
    let mut codings = Vec::new();
    for value in headers.get_all(TRANSFER_ENCODING) {
        let value = value.to_str().map_err(|_| ParseError::InvalidHeader)?;
        codings.extend(
            value
                .split(',')
                .map(|c| c.trim().to_ascii_lowercase())
                .filter(|c| !c.is_empty()),
        );
    }
    match codings.last() {
        None => Ok(None),
        Some(last) => Ok(Some(last == "chunked")),
    }
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>, ParseError> {
    let mut found: Option<u64> = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let text = value.to_str().map_err(|_| ParseError::InvalidHeader)?;
        for part in text.split(',') {
            let n: u64 = part
                .trim()
                .parse()
                .map_err(|_| ParseError::BadFraming("invalid content-length"))?;
            match found {
                Some(prev) if prev != n => {
                    return Err(ParseError::BadFraming("conflicting content-length"))
                }
                _ => found = Some(n),
            }
        }
    }
    Ok(found)
}

/// Body framing of a request.
pub fn request_framing(head: &RequestHead) -> Result<BodyFraming, ParseError> {
    match is_chunked(&head.headers)? {
        Some(true) => return Ok(BodyFraming::Chunked),
        Some(false) => return Err(ParseError::BadFraming("request transfer-coding not chunked")),
        None => {}
    }
    Ok(match content_length(&head.headers)? {
        None | Some(0) => BodyFraming::Empty,
        Some(n) => BodyFraming::Length(n),
    })
}

/// Body framing of a response to a request with `method`.
pub fn response_framing(method: &Method, head: &ResponseHead) -> Result<BodyFraming, ParseError> {
    let status = head.status;
    if method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(BodyFraming::Empty);
    }
    match is_chunked(&head.headers)? {
        Some(true) => return Ok(BodyFraming::Chunked),
        Some(false) => return Ok(BodyFraming::UntilClose),
        None => {}
    }
    Ok(match content_length(&head.headers)? {
        Some(0) => BodyFraming::Empty,
        Some(n) => BodyFraming::Length(n),
        None => BodyFraming::UntilClose,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(raw: &str) -> RequestHead {
        let (head, _) = request::parse_request(raw.as_bytes()).unwrap().unwrap();
        head
    }

    fn response(raw: &str) -> ResponseHead {
        let (head, _) = response::parse_response(raw.as_bytes()).unwrap().unwrap();
        head
    }

    #[test]
    fn request_framing_prefers_chunked() {
        let head = request("POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: gzip, chunked\r\nContent-Length: 5\r\n\r\n");
        assert_eq!(request_framing(&head).unwrap(), BodyFraming::Chunked);

        let head = request("POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\n");
        assert_eq!(request_framing(&head).unwrap(), BodyFraming::Length(5));

        let head = request("GET / HTTP/1.1\r\nHost: a\r\n\r\n");
        assert_eq!(request_framing(&head).unwrap(), BodyFraming::Empty);
    }

    #[test]
    fn conflicting_lengths_are_rejected() {
        let head = request("POST / HTTP/1.1\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n");
        assert!(matches!(request_framing(&head), Err(ParseError::BadFraming(_))));
    }

    #[test]
    fn response_framing_rules() {
        let ok = response("HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n");
        assert_eq!(response_framing(&Method::GET, &ok).unwrap(), BodyFraming::Length(10));
        assert_eq!(response_framing(&Method::HEAD, &ok).unwrap(), BodyFraming::Empty);

        let eos = response("HTTP/1.0 200 OK\r\n\r\n");
        assert_eq!(response_framing(&Method::GET, &eos).unwrap(), BodyFraming::UntilClose);

        let none = response("HTTP/1.1 304 Not Modified\r\nContent-Length: 10\r\n\r\n");
        assert_eq!(response_framing(&Method::GET, &none).unwrap(), BodyFraming::Empty);
    }

    #[test]
    fn too_large_maps_to_431() {
        assert_eq!(
            ParseError::TooLarge { limit: 1 }.status(),
            StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
        );
        assert_eq!(ParseError::InvalidMethod.status(), StatusCode::BAD_REQUEST);
    }
}
