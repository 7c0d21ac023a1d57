//! Remap table: maps a client request to the origin URL it is sent to.

use url::Url;

use crate::config::RemapConfig;
use crate::http::RequestHead;
use crate::routing::matcher::{AndMatcher, HostMatcher, Matcher, PathPrefixMatcher};

#[derive(Debug)]
struct CompiledRule {
    name: String,
    matcher: AndMatcher,
    origin: Url,
    preserve_host: bool,
}

/// Result of mapping one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemapOutcome {
    Mapped {
        rule: String,
        url: Url,
        preserve_host: bool,
    },
    /// No rule matched; the request is forwarded to the URL it names.
    Forward(Url),
    Miss,
}

#[derive(Debug, Default)]
pub struct RemapTable {
    rules: Vec<CompiledRule>,
    required: bool,
    allow_forward_proxy: bool,
}

impl RemapTable {
    pub fn from_config(config: &RemapConfig) -> Self {
        let mut sorted = config.rules.clone();
        // Stable sort keeps file order among equal priorities.
        sorted.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut rules = Vec::with_capacity(sorted.len());
        for rule in sorted {
            let origin = match Url::parse(&rule.origin) {
                Ok(url) => url,
                Err(e) => {
                    tracing::warn!(rule = %rule.name, origin = %rule.origin, error = %e, "Skipping remap rule with invalid origin");
                    continue;
                }
            };
            let mut conditions: Vec<Box<dyn Matcher>> = Vec::new();
            if let Some(host) = &rule.host {
                conditions.push(Box::new(HostMatcher::new(host.clone())));
            }
            if let Some(prefix) = &rule.path_prefix {
                conditions.push(Box::new(PathPrefixMatcher::new(prefix.clone())));
            }
            rules.push(CompiledRule {
                name: rule.name,
                matcher: AndMatcher::new(conditions),
                origin,
                preserve_host: rule.preserve_host,
            });
        }

        Self {
            rules,
            required: config.required,
            allow_forward_proxy: config.allow_forward_proxy,
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn map(&self, req: &RequestHead) -> RemapOutcome {
        if let Some(rule) = self.rules.iter().find(|r| r.matcher.matches(req)) {
            return RemapOutcome::Mapped {
                rule: rule.name.clone(),
                url: rewrite(&rule.origin, req),
                preserve_host: rule.preserve_host,
            };
        }
        if self.required || !self.allow_forward_proxy {
            return RemapOutcome::Miss;
        }
        match req.effective_url() {
            Some(url) => RemapOutcome::Forward(url),
            None => RemapOutcome::Miss,
        }
    }
}

/// Origin scheme/authority with the origin path prefixed to the request path.
fn rewrite(origin: &Url, req: &RequestHead) -> Url {
    let mut url = origin.clone();
    let base = origin.path().trim_end_matches('/');
    url.set_path(&format!("{}{}", base, req.uri.path()));
    url.set_query(req.uri.query());
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemapRule;
    use crate::http::request::parse_request;

    fn head(raw: &str) -> RequestHead {
        parse_request(raw.as_bytes()).unwrap().unwrap().0
    }

    fn rule(name: &str, host: Option<&str>, prefix: Option<&str>, origin: &str, priority: u32) -> RemapRule {
        RemapRule {
            name: name.to_string(),
            host: host.map(str::to_string),
            path_prefix: prefix.map(str::to_string),
            origin: origin.to_string(),
            preserve_host: false,
            priority,
        }
    }

    #[test]
    fn highest_priority_rule_wins() {
        let config = RemapConfig {
            required: true,
            allow_forward_proxy: false,
            rules: vec![
                rule("catch-all", None, None, "http://10.0.0.1:80", 0),
                rule("api", Some("a.test"), Some("/api"), "http://10.0.0.2:3000/v2/", 10),
            ],
        };
        let table = RemapTable::from_config(&config);

        match table.map(&head("GET /api/users?id=1 HTTP/1.1\r\nHost: a.test\r\n\r\n")) {
            RemapOutcome::Mapped { rule, url, .. } => {
                assert_eq!(rule, "api");
                assert_eq!(url.as_str(), "http://10.0.0.2:3000/v2/api/users?id=1");
            }
            other => panic!("unexpected {:?}", other),
        }
        match table.map(&head("GET /x HTTP/1.1\r\nHost: b.test\r\n\r\n")) {
            RemapOutcome::Mapped { rule, url, .. } => {
                assert_eq!(rule, "catch-all");
                assert_eq!(url.as_str(), "http://10.0.0.1/x");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn required_rejects_unmapped() {
        let config = RemapConfig {
            required: true,
            allow_forward_proxy: true,
            rules: vec![rule("api", Some("a.test"), None, "http://10.0.0.2", 0)],
        };
        let table = RemapTable::from_config(&config);
        assert_eq!(
            table.map(&head("GET http://b.test/ HTTP/1.1\r\n\r\n")),
            RemapOutcome::Miss
        );
    }

    #[test]
    fn forward_proxy_uses_request_target() {
        let table = RemapTable::from_config(&RemapConfig::default());
        assert_eq!(
            table.map(&head("GET http://origin.test:8080/p HTTP/1.1\r\n\r\n")),
            RemapOutcome::Forward(Url::parse("http://origin.test:8080/p").unwrap())
        );
        assert_eq!(table.map(&head("GET /p HTTP/1.1\r\n\r\n")), RemapOutcome::Miss);
    }

    #[test]
    fn invalid_origins_are_skipped() {
        let config = RemapConfig {
            rules: vec![rule("bad", None, None, "not a url", 0)],
            ..RemapConfig::default()
        };
        assert!(RemapTable::from_config(&config).is_empty());
    }
}
