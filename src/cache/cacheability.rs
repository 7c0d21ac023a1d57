//! Whether a request may use the cache and how long a response stays fresh.

use std::time::Duration;

use http::header::{CACHE_CONTROL, PRAGMA};
use http::{HeaderMap, Method, StatusCode};

use crate::http::{RequestHead, ResponseHead};

const CACHEABLE_STATUSES: [u16; 7] = [200, 203, 204, 300, 301, 404, 410];

fn directives(headers: &HeaderMap) -> Vec<(String, Option<String>)> {
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|d| {
            let d = d.trim();
            if d.is_empty() {
                return None;
            }
            let mut parts = d.splitn(2, '=');
            let name = parts.next()?.trim().to_ascii_lowercase();
            let value = parts.next().map(|v| v.trim().trim_matches('"').to_string());
            Some((name, value))
        })
        .collect()
}

fn has_directive(list: &[(String, Option<String>)], name: &str) -> bool {
    list.iter().any(|(n, _)| n == name)
}

fn seconds(list: &[(String, Option<String>)], name: &str) -> Option<u64> {
    list.iter()
        .find(|(n, _)| n == name)
        .and_then(|(_, v)| v.as_deref())
        .and_then(|v| v.parse().ok())
}

/// Request may be stored: GET without `no-store`.
pub fn request_cacheable(req: &RequestHead) -> bool {
    req.method == Method::GET && !has_directive(&directives(&req.headers), "no-store")
}

/// Request asks to bypass stored objects (`no-cache` or `Pragma: no-cache`).
pub fn skip_lookup(req: &RequestHead) -> bool {
    if has_directive(&directives(&req.headers), "no-cache") {
        return true;
    }
    req.headers
        .get(PRAGMA)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("no-cache"))
}

/// Freshness lifetime of a response, or `None` when it must not be stored.
pub fn response_ttl(head: &ResponseHead, default: Duration) -> Option<Duration> {
    if !CACHEABLE_STATUSES.contains(&head.status.as_u16()) {
        return None;
    }
    let list = directives(&head.headers);
    if ["no-store", "private", "no-cache"]
        .iter()
        .any(|d| has_directive(&list, d))
    {
        return None;
    }
    let ttl = seconds(&list, "s-maxage")
        .or_else(|| seconds(&list, "max-age"))
        .map(Duration::from_secs)
        .unwrap_or(default);
    (!ttl.is_zero()).then_some(ttl)
}

/// Status codes the engine treats as cacheable.
pub fn status_cacheable(status: StatusCode) -> bool {
    CACHEABLE_STATUSES.contains(&status.as_u16())
}
