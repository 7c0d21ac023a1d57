//! Remap rule conditions.
//!
//! Host matching is case-insensitive, path matching is case-sensitive and an
//! empty condition list matches everything.

use crate::http::RequestHead;

pub trait Matcher: Send + Sync + std::fmt::Debug {
    fn matches(&self, req: &RequestHead) -> bool;
}

/// Matches the request host, from the target or the Host header.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    expected_host: String,
}

impl HostMatcher {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            expected_host: host.into().to_lowercase(),
        }
    }
}

impl Matcher for HostMatcher {
    fn matches(&self, req: &RequestHead) -> bool {
        req.host().map(|h| h == self.expected_host).unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct PathPrefixMatcher {
    prefix: String,
}

impl PathPrefixMatcher {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Matcher for PathPrefixMatcher {
    fn matches(&self, req: &RequestHead) -> bool {
        req.uri.path().starts_with(&self.prefix)
    }
}

/// All conditions must hold.
#[derive(Debug, Default)]
pub struct AndMatcher {
    matchers: Vec<Box<dyn Matcher>>,
}

impl AndMatcher {
    pub fn new(matchers: Vec<Box<dyn Matcher>>) -> Self {
        Self { matchers }
    }
}

impl Matcher for AndMatcher {
    fn matches(&self, req: &RequestHead) -> bool {
        self.matchers.iter().all(|m| m.matches(req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::parse_request;

    fn head(raw: &str) -> RequestHead {
        parse_request(raw.as_bytes()).unwrap().unwrap().0
    }

    #[test]
    fn host_matcher_ignores_case_and_port() {
        let matcher = HostMatcher::new("example.com");
        assert!(matcher.matches(&head("GET / HTTP/1.1\r\nHost: EXAMPLE.com:8080\r\n\r\n")));
        assert!(matcher.matches(&head("GET http://example.com/ HTTP/1.1\r\n\r\n")));
        assert!(!matcher.matches(&head("GET / HTTP/1.1\r\nHost: other.com\r\n\r\n")));
        assert!(!matcher.matches(&head("GET / HTTP/1.1\r\n\r\n")));
    }

    #[test]
    fn path_and_combined() {
        let matcher = AndMatcher::new(vec![
            Box::new(HostMatcher::new("a.test")),
            Box::new(PathPrefixMatcher::new("/api")),
        ]);
        assert!(matcher.matches(&head("GET /api/v1 HTTP/1.1\r\nHost: a.test\r\n\r\n")));
        assert!(!matcher.matches(&head("GET /API HTTP/1.1\r\nHost: a.test\r\n\r\n")));
        assert!(AndMatcher::default().matches(&head("GET / HTTP/1.1\r\n\r\n")));
    }
}
