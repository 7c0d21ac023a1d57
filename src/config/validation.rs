//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntax)
//! - Validate addresses, origin URLs and value ranges
//! - Detect duplicate remap rule names
//!
//! # Design Decisions
//! - Returns all validation errors, not just the first
//! - Pure function: &ProxyConfig → Result<(), Vec<ValidationError>>

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;
use url::Url;

use crate::config::schema::ProxyConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{field}: invalid socket address {value:?}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("remap rule {rule:?}: invalid origin {origin:?}")]
    InvalidOrigin { rule: String, origin: String },

    #[error("remap rule {0:?} defined more than once")]
    DuplicateRule(String),

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must be within 0.0..=1.0, got {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("observability.log_format must be \"pretty\" or \"json\", got {0:?}")]
    LogFormat(String),

    #[error("dns.hosts entry {host:?}: invalid address {value:?}")]
    InvalidHostEntry { host: String, value: String },
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_addr(&mut errors, "listener.bind_address", &config.listener.bind_address);
    if config.admin.enabled {
        check_addr(&mut errors, "admin.bind_address", &config.admin.bind_address);
    }
    if config.observability.metrics_enabled {
        check_addr(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }

    let mut names = HashSet::new();
    for rule in &config.remap.rules {
        if !names.insert(rule.name.as_str()) {
            errors.push(ValidationError::DuplicateRule(rule.name.clone()));
        }
        let valid = Url::parse(&rule.origin)
            .map(|u| u.scheme() == "http" && u.host_str().is_some())
            .unwrap_or(false);
        if !valid {
            errors.push(ValidationError::InvalidOrigin {
                rule: rule.name.clone(),
                origin: rule.origin.clone(),
            });
        }
    }

    let nonzero: [(&'static str, u64); 8] = [
        ("listener.max_connections", config.listener.max_connections as u64),
        ("timeouts.client_header_secs", config.timeouts.client_header_secs),
        ("timeouts.dns_secs", config.timeouts.dns_secs),
        ("timeouts.connect_secs", config.timeouts.connect_secs),
        ("timeouts.origin_response_secs", config.timeouts.origin_response_secs),
        ("timeouts.activity_secs", config.timeouts.activity_secs),
        ("origin.connect_attempts", u64::from(config.origin.connect_attempts)),
        ("hooks.callout_timeout_secs", config.hooks.callout_timeout_secs),
    ];
    for (field, value) in nonzero {
        if value == 0 {
            errors.push(ValidationError::Zero { field });
        }
    }
    if config.tunnel.buffer_bytes == 0 {
        errors.push(ValidationError::Zero { field: "tunnel.buffer_bytes" });
    }

    let threshold = config.background_fill.completed_threshold;
    if !(0.0..=1.0).contains(&threshold) {
        errors.push(ValidationError::OutOfRange {
            field: "background_fill.completed_threshold",
            value: threshold,
        });
    }

    let format = config.observability.log_format.as_str();
    if format != "pretty" && format != "json" {
        errors.push(ValidationError::LogFormat(format.to_string()));
    }

    for (host, values) in &config.dns.hosts {
        for value in values {
            if value.parse::<std::net::IpAddr>().is_err() {
                errors.push(ValidationError::InvalidHostEntry {
                    host: host.clone(),
                    value: value.clone(),
                });
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_addr(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::RemapRule;

    fn rule(name: &str, origin: &str) -> RemapRule {
        RemapRule {
            name: name.into(),
            host: None,
            path_prefix: None,
            origin: origin.into(),
            preserve_host: false,
            priority: 0,
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&ProxyConfig::default()).is_ok());
    }

    #[test]
    fn bad_origins_and_duplicates_are_reported() {
        let mut config = ProxyConfig::default();
        config.remap.rules.push(rule("a", "http://127.0.0.1:3000"));
        config.remap.rules.push(rule("a", "ftp://example.com"));
        config.remap.rules.push(rule("b", "not a url"));

        let errors = validate_config(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::DuplicateRule("a".into())));
        assert_eq!(
            errors
                .iter()
                .filter(|e| matches!(e, ValidationError::InvalidOrigin { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let mut config = ProxyConfig::default();
        config.timeouts.connect_secs = 0;
        config.origin.connect_attempts = 0;

        let errors = validate_config(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::Zero { field: "timeouts.connect_secs" }));
        assert!(errors.contains(&ValidationError::Zero { field: "origin.connect_attempts" }));
    }

    #[test]
    fn static_hosts_must_be_ip_addresses() {
        let mut config = ProxyConfig::default();
        config
            .dns
            .hosts
            .insert("origin.test".into(), vec!["127.0.0.1".into(), "localhost".into()]);

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
    }
}
