//! Response heads and generated responses.

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderValue, CACHE_CONTROL, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, StatusCode, Version};

use crate::http::headers::connection_keep_alive;
use crate::http::request::{collect_headers, encode_headers, version_from_minor, version_str};
use crate::http::{ParseError, MAX_HEADERS};

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    /// Reason phrase as received; the canonical one is used when absent.
    pub reason: Option<String>,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: Version::HTTP_11,
            status,
            reason: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn keep_alive(&self) -> bool {
        connection_keep_alive(self.version, &self.headers)
    }

    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or_else(|| self.status.canonical_reason())
            .unwrap_or("")
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(256);
        out.put_slice(version_str(self.version).as_bytes());
        out.put_u8(b' ');
        out.put_slice(self.status.as_str().as_bytes());
        out.put_u8(b' ');
        out.put_slice(self.reason().as_bytes());
        out.put_slice(b"\r\n");
        encode_headers(&self.headers, &mut out);
        out.freeze()
    }
}

/// Parse a response head. `Ok(None)` means more bytes are needed.
pub fn parse_response(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>, ParseError> {
    let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut raw);
    let len = match res.parse(buf)? {
        httparse::Status::Partial => return Ok(None),
        httparse::Status::Complete(len) => len,
    };

    let status = res
        .code
        .and_then(|c| StatusCode::from_u16(c).ok())
        .ok_or(ParseError::InvalidStatus)?;
    let version = version_from_minor(res.version)?;
    let reason = res
        .reason
        .filter(|r| !r.is_empty() && Some(*r) != status.canonical_reason())
        .map(str::to_string);
    let headers = collect_headers(res.headers)?;

    Ok(Some((
        ResponseHead {
            version,
            status,
            reason,
            headers,
        },
        len,
    )))
}

/// Head and body of a proxy-generated error response.
pub fn error_response(status: StatusCode, detail: &str) -> (ResponseHead, Bytes) {
    let reason = status.canonical_reason().unwrap_or("Error");
    let body = Bytes::from(format!(
        "<html><head><title>{code} {reason}</title></head>\n<body><h1>{code} {reason}</h1>\n<p>{detail}</p>\n</body></html>\n",
        code = status.as_u16(),
    ));

    let mut head = ResponseHead::new(status);
    head.headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
    head.headers
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    head.headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    head.headers.insert(CONNECTION, HeaderValue::from_static("close"));
    (head, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_line() {
        let raw = b"HTTP/1.1 302 Found\r\nLocation: /next\r\nContent-Length: 0\r\n\r\n";
        let (head, len) = parse_response(raw).unwrap().unwrap();
        assert_eq!(len, raw.len());
        assert_eq!(head.status, StatusCode::FOUND);
        assert!(head.reason.is_none());
        assert_eq!(head.headers["location"], "/next");
        assert!(head.keep_alive());
    }

    #[test]
    fn keeps_custom_reason() {
        let (head, _) = parse_response(b"HTTP/1.0 200 Fine Thanks\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.reason(), "Fine Thanks");
        assert!(head.encode().starts_with(b"HTTP/1.0 200 Fine Thanks\r\n"));
        assert!(!head.keep_alive());
    }

    #[test]
    fn error_page_is_self_delimited() {
        let (head, body) = error_response(StatusCode::BAD_GATEWAY, "origin unreachable");
        assert_eq!(head.headers[CONTENT_LENGTH], body.len().to_string().as_str());
        assert!(!head.keep_alive());
        assert!(std::str::from_utf8(&body).unwrap().contains("502 Bad Gateway"));
    }
}
