//! Configuration for the provisioning panel client.

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Connection settings for the provisioning panel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PanelConfig {
    /// Panel base URL (e.g., "https://panel.example.com:8000").
    pub base_url: String,

    /// Value sent verbatim in the `Authorization` header.
    pub api_token: String,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Accept self-signed TLS certificates.
    #[serde(default = "default_accept_invalid_certs")]
    pub accept_invalid_certs: bool,

    /// Concurrent IP limit applied to freshly created users.
    #[serde(default = "default_ip_limit")]
    pub ip_limit: u32,

    /// Retry policy for idempotent requests.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_timeout() -> u64 {
    30
}

fn default_accept_invalid_certs() -> bool {
    true
}

fn default_ip_limit() -> u32 {
    3
}

impl PanelConfig {
    /// Create a new panel configuration.
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_token: api_token.into(),
            timeout_secs: default_timeout(),
            accept_invalid_certs: default_accept_invalid_certs(),
            ip_limit: default_ip_limit(),
            retry: RetryPolicy::default(),
        }
    }

    /// Load from `TUNNELKIT_PANEL_URL` and `TUNNELKIT_PANEL_TOKEN`.
    ///
    /// Returns `None` if either variable is unset.
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("TUNNELKIT_PANEL_URL").ok()?;
        let token = std::env::var("TUNNELKIT_PANEL_TOKEN").ok()?;
        Some(Self::new(url, token))
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Require valid TLS certificates.
    pub fn with_strict_tls(mut self) -> Self {
        self.accept_invalid_certs = false;
        self
    }

    /// Set the per-user IP limit.
    pub fn with_ip_limit(mut self, limit: u32) -> Self {
        self.ip_limit = limit;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_partial_json() {
        let config: PanelConfig =
            serde_json::from_str(r#"{"base_url": "https://p", "api_token": "t"}"#).unwrap();
        assert_eq!(config.timeout_secs, 30);
        assert!(config.accept_invalid_certs);
        assert_eq!(config.ip_limit, 3);
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn test_builder() {
        let config = PanelConfig::new("https://p", "t")
            .with_timeout(5)
            .with_strict_tls()
            .with_retry(RetryPolicy::disabled());
        assert_eq!(config.timeout_secs, 5);
        assert!(!config.accept_invalid_certs);
        assert_eq!(config.retry.max_retries, 0);
    }
}
