//! Tunnelkit client library.
//!
//! This crate intentionally stays stateless: it holds the adapters for the
//! two external services the subscription engine orchestrates and nothing
//! else. Durable state lives in `tunnelkit-subscriptions`.
//!
//! # Features
//!
//! - **Provisioning**: create, fetch, extend and delete panel users through
//!   the [`ProvisioningClient`](provisioning::ProvisioningClient) trait
//! - **Payments**: open invoices, query their status and parse settlement
//!   pushes through [`PaymentProvider`](payments::PaymentProvider)
//! - **Retry**: bounded exponential backoff for transient upstream failures
//!
//! # Example
//!
//! ```ignore
//! use tunnelkit_lib::prelude::*;
//!
//! let panel = BlitzClient::new(PanelConfig::new("https://panel:8000", "token"))?;
//! let created = panel.create(&AccountId(42).username("vpn_"), 0, 30).await?;
//! ```

use std::fmt;

pub mod errors;
pub mod health;
pub mod payments;
pub mod prelude;
pub mod provisioning;
pub mod retry;

/// In-memory doubles for the panel and the payment provider.
///
/// This module is only available with the `test-utils` feature or in test builds.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use errors::{ErrorClass, TunnelkitError, TunnelkitErrorCode};

/// Common result alias for Tunnelkit client operations.
pub type Result<T> = std::result::Result<T, TunnelkitError>;

/// Chat account identifier.
///
/// # Example
///
/// ```
/// use tunnelkit_lib::AccountId;
///
/// let account = AccountId(42);
/// assert_eq!(account.username("vpn_"), "vpn_42");
/// ```
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct AccountId(pub i64);

impl AccountId {
    /// Panel username for this account.
    pub fn username(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.0)
    }

    /// Parse an account id from an invoice payload.
    pub fn from_payload(payload: &str) -> Option<Self> {
        payload.trim().parse().ok().map(Self)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payment provider invoice identifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct InvoiceId(pub String);

impl InvoiceId {
    /// Create a new InvoiceId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the invoice ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for InvoiceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for InvoiceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for InvoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
