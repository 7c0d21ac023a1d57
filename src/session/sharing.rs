//! Whether a transaction may use shared origin sessions.

use http::HeaderMap;

use crate::config::{SessionConfig, SharingMatch};
use crate::http::headers::has_credentials;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    pub sharing: SharingMatch,
    /// Session is bound to this transaction and never pooled.
    pub private: bool,
}

impl SessionPolicy {
    pub fn evaluate(config: &SessionConfig, request_headers: &HeaderMap, txn_private: bool) -> Self {
        let credentials = config.auth_private && has_credentials(request_headers);
        Self {
            sharing: config.sharing_match,
            private: txn_private || credentials,
        }
    }

    /// May take an idle session from the pool and give one back.
    pub fn shareable(&self) -> bool {
        !self.private && self.sharing != SharingMatch::None
    }
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            sharing: SharingMatch::Both,
            private: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderValue, AUTHORIZATION};

    #[test]
    fn credentials_make_private() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer x"));
        let config = SessionConfig::default();
        assert!(!SessionPolicy::evaluate(&config, &headers, false).shareable());

        let relaxed = SessionConfig {
            auth_private: false,
            ..SessionConfig::default()
        };
        assert!(SessionPolicy::evaluate(&relaxed, &headers, false).shareable());
    }

    #[test]
    fn sharing_none_and_private_txn_disable_pooling() {
        let none = SessionConfig {
            sharing_match: SharingMatch::None,
            ..SessionConfig::default()
        };
        assert!(!SessionPolicy::evaluate(&none, &HeaderMap::new(), false).shareable());
        assert!(!SessionPolicy::evaluate(&SessionConfig::default(), &HeaderMap::new(), true).shareable());
        assert!(SessionPolicy::evaluate(&SessionConfig::default(), &HeaderMap::new(), false).shareable());
    }
}
