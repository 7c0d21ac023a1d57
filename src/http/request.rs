//! Request heads.

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, HOST};
use http::{HeaderMap, Method, Uri, Version};
use url::Url;

use crate::http::headers::connection_keep_alive;
use crate::http::{ParseError, MAX_HEADERS};

/// Parsed request line and header block.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }

    /// Request target carries scheme and authority (forward-proxy form).
    pub fn is_absolute_form(&self) -> bool {
        self.uri.scheme().is_some() && self.uri.authority().is_some()
    }

    /// Host from the target, else from the Host header, without the port.
    pub fn host(&self) -> Option<String> {
        if let Some(authority) = self.uri.authority() {
            return Some(authority.host().to_ascii_lowercase());
        }
        let value = self.headers.get(HOST)?.to_str().ok()?;
        let authority: http::uri::Authority = value.parse().ok()?;
        Some(authority.host().to_ascii_lowercase())
    }

    pub fn path_and_query(&self) -> &str {
        self.uri.path_and_query().map(|p| p.as_str()).unwrap_or("/")
    }

    /// Full URL of the requested resource, built from the Host header for
    /// origin-form targets.
    pub fn effective_url(&self) -> Option<Url> {
        if self.is_absolute_form() {
            return Url::parse(&self.uri.to_string()).ok();
        }
        let host = self.headers.get(HOST)?.to_str().ok()?;
        Url::parse(&format!("http://{}{}", host, self.path_and_query())).ok()
    }

    pub fn keep_alive(&self) -> bool {
        connection_keep_alive(self.version, &self.headers)
    }

    /// Encode with the target as stored.
    pub fn encode(&self) -> Bytes {
        self.encode_with_target(&self.uri.to_string())
    }

    /// Encode with an origin-form target, as sent to an origin server.
    pub fn encode_origin_form(&self) -> Bytes {
        self.encode_with_target(self.path_and_query())
    }

    fn encode_with_target(&self, target: &str) -> Bytes {
        let mut out = BytesMut::with_capacity(256);
        out.put_slice(self.method.as_str().as_bytes());
        out.put_u8(b' ');
        out.put_slice(target.as_bytes());
        out.put_u8(b' ');
        out.put_slice(version_str(self.version).as_bytes());
        out.put_slice(b"\r\n");
        encode_headers(&self.headers, &mut out);
        out.freeze()
    }
}

pub(crate) fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

pub(crate) fn version_from_minor(minor: Option<u8>) -> Result<Version, ParseError> {
    match minor {
        Some(0) => Ok(Version::HTTP_10),
        Some(1) => Ok(Version::HTTP_11),
        Some(other) => Err(ParseError::UnsupportedVersion(other)),
        None => Err(ParseError::UnsupportedVersion(0)),
    }
}

pub(crate) fn encode_headers(headers: &HeaderMap, out: &mut BytesMut) {
    for (name, value) in headers {
        out.put_slice(name.as_str().as_bytes());
        out.put_slice(b": ");
        out.put_slice(value.as_bytes());
        out.put_slice(b"\r\n");
    }
    out.put_slice(b"\r\n");
}

pub(crate) fn collect_headers(raw: &[httparse::Header<'_>]) -> Result<HeaderMap, ParseError> {
    let mut headers = HeaderMap::with_capacity(raw.len());
    for h in raw {
        let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(|_| ParseError::InvalidHeader)?;
        let value = HeaderValue::from_bytes(h.value).map_err(|_| ParseError::InvalidHeader)?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Parse a request head. `Ok(None)` means more bytes are needed; on success
/// the second value is the head length.
pub fn parse_request(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, ParseError> {
    let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut raw);
    let len = match req.parse(buf)? {
        httparse::Status::Partial => return Ok(None),
        httparse::Status::Complete(len) => len,
    };

    let method = req
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or(ParseError::InvalidMethod)?;
    let target = req.path.unwrap_or_default();
    let uri = if method == Method::CONNECT {
        // authority-form
        let authority: http::uri::Authority = target
            .parse()
            .map_err(|_| ParseError::InvalidTarget(target.to_string()))?;
        Uri::from(authority)
    } else {
        target
            .parse::<Uri>()
            .map_err(|_| ParseError::InvalidTarget(target.to_string()))?
    };
    let version = version_from_minor(req.version)?;
    let headers = collect_headers(req.headers)?;

    Ok(Some((
        RequestHead {
            method,
            uri,
            version,
            headers,
        },
        len,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_origin_form() {
        let raw = b"GET /a/b?x=1 HTTP/1.1\r\nHost: Example.com:8080\r\nAccept: */*\r\n\r\nrest";
        let (head, len) = parse_request(raw).unwrap().unwrap();
        assert_eq!(len, raw.len() - 4);
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.path_and_query(), "/a/b?x=1");
        assert_eq!(head.host().as_deref(), Some("example.com"));
        assert!(!head.is_absolute_form());
        assert_eq!(
            head.effective_url().unwrap().as_str(),
            "http://example.com:8080/a/b?x=1"
        );
    }

    #[test]
    fn parses_absolute_and_connect_forms() {
        let (head, _) = parse_request(b"GET http://origin.test/x HTTP/1.1\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(head.is_absolute_form());
        assert_eq!(head.host().as_deref(), Some("origin.test"));
        assert_eq!(&head.encode_origin_form()[..16], b"GET /x HTTP/1.1\r");

        let (head, _) = parse_request(b"CONNECT secure.test:443 HTTP/1.1\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.method, Method::CONNECT);
        assert_eq!(head.uri.port_u16(), Some(443));
    }

    #[test]
    fn partial_head_needs_more() {
        assert!(parse_request(b"GET / HTTP/1.1\r\nHost: a\r\n").unwrap().is_none());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_request(b"\x01\x02 nonsense\r\n\r\n").is_err());
        assert!(matches!(
            parse_request(b"GET / HTTP/1.1\r\nbad header\r\n\r\n"),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn encode_keeps_header_order() {
        let (head, _) = parse_request(b"GET / HTTP/1.0\r\nHost: a\r\nX-One: 1\r\n\r\n")
            .unwrap()
            .unwrap();
        let wire = head.encode();
        assert_eq!(&wire[..], b"GET / HTTP/1.0\r\nhost: a\r\nx-one: 1\r\n\r\n");
        assert!(!head.keep_alive());
    }
}
