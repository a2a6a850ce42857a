//! Configuration for the Crypto Pay client.

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Public Crypto Pay API endpoint.
pub const CRYPTOPAY_MAINNET_URL: &str = "https://pay.crypt.bot/api";

/// Crypto Pay testnet endpoint.
pub const CRYPTOPAY_TESTNET_URL: &str = "https://testnet-pay.crypt.bot/api";

/// Connection settings for Crypto Pay.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CryptoPayConfig {
    /// API base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Value of the `Crypto-Pay-API-Token` header.
    pub api_token: String,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Retry policy for status queries.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_base_url() -> String {
    CRYPTOPAY_MAINNET_URL.to_string()
}

fn default_timeout() -> u64 {
    30
}

impl CryptoPayConfig {
    /// Mainnet configuration for the given token.
    pub fn new(api_token: impl Into<String>) -> Self {
        Self {
            base_url: default_base_url(),
            api_token: api_token.into(),
            timeout_secs: default_timeout(),
            retry: RetryPolicy::default(),
        }
    }

    /// Testnet configuration for the given token.
    pub fn testnet(api_token: impl Into<String>) -> Self {
        Self::new(api_token).with_base_url(CRYPTOPAY_TESTNET_URL)
    }

    /// Load from `TUNNELKIT_CRYPTOPAY_TOKEN` and optional `TUNNELKIT_CRYPTOPAY_URL`.
    pub fn from_env() -> Option<Self> {
        let token = std::env::var("TUNNELKIT_CRYPTOPAY_TOKEN").ok()?;
        let mut config = Self::new(token);
        if let Ok(url) = std::env::var("TUNNELKIT_CRYPTOPAY_URL") {
            config.base_url = url;
        }
        Some(config)
    }

    /// Override the base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
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
    fn test_default_endpoint() {
        let config: CryptoPayConfig = serde_json::from_str(r#"{"api_token": "123:abc"}"#).unwrap();
        assert_eq!(config.base_url, CRYPTOPAY_MAINNET_URL);
        assert_eq!(CryptoPayConfig::testnet("t").base_url, CRYPTOPAY_TESTNET_URL);
    }
}
