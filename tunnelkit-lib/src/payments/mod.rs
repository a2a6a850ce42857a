//! Payment provider adapter.
//!
//! The reconciliation engine only needs three things from the provider:
//! open an invoice, ask for its status, and understand the push
//! notification sent when it is paid. [`PaymentProvider`] is that surface;
//! [`CryptoPayClient`] implements it against the Crypto Pay REST API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::health::HealthCheckResult;
use crate::{InvoiceId, Result};

pub mod config;
pub mod cryptopay;
pub mod webhook;

pub use config::CryptoPayConfig;
pub use cryptopay::CryptoPayClient;
pub use webhook::{WebhookInvoice, WebhookUpdate};

/// Provider-side invoice status.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InvoiceStatus {
    /// Awaiting payment.
    Active,
    /// Paid by the customer.
    Paid,
    /// Payment window elapsed.
    Expired,
    /// Anything the provider adds later.
    Unknown(String),
}

impl InvoiceStatus {
    /// Whether the invoice has been paid.
    pub fn is_paid(&self) -> bool {
        *self == Self::Paid
    }
}

impl From<String> for InvoiceStatus {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "active" => Self::Active,
            "paid" => Self::Paid,
            "expired" => Self::Expired,
            _ => Self::Unknown(raw),
        }
    }
}

impl From<InvoiceStatus> for String {
    fn from(status: InvoiceStatus) -> Self {
        match status {
            InvoiceStatus::Active => "active".to_string(),
            InvoiceStatus::Paid => "paid".to_string(),
            InvoiceStatus::Expired => "expired".to_string(),
            InvoiceStatus::Unknown(raw) => raw,
        }
    }
}

/// Parameters for a new invoice.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceRequest {
    /// Asset ticker ("TON", "USDT", ...).
    pub asset: String,
    /// Decimal amount as a string.
    pub amount: String,
    /// Text shown to the payer.
    pub description: String,
    /// Opaque value echoed back by the provider (the account id).
    pub payload: String,
    /// Payment window in seconds.
    pub expires_in_secs: u64,
}

/// Invoice as returned by the provider on creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedInvoice {
    /// Provider invoice id.
    pub invoice_id: InvoiceId,
    /// Link the payer opens.
    pub pay_url: String,
    /// Asset ticker.
    pub asset: String,
    /// Decimal amount as a string.
    pub amount: String,
    /// End of the payment window, when reported.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Status snapshot of one invoice.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceInfo {
    /// Provider invoice id.
    #[serde(deserialize_with = "invoice_id_from_any")]
    pub invoice_id: InvoiceId,
    /// Current status.
    pub status: InvoiceStatus,
    /// Asset ticker.
    #[serde(default)]
    pub asset: Option<String>,
    /// Decimal amount.
    #[serde(default, deserialize_with = "opt_string_from_any")]
    pub amount: Option<String>,
    /// Payload echoed from creation.
    #[serde(default)]
    pub payload: Option<String>,
}

/// Narrow client contract for the payment provider.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Open an invoice.
    async fn create_invoice(&self, request: &InvoiceRequest) -> Result<CreatedInvoice>;

    /// Fetch status snapshots for the given invoice ids.
    async fn get_invoices(&self, ids: &[InvoiceId]) -> Result<Vec<InvoiceInfo>>;

    /// Probe the provider.
    async fn health(&self) -> HealthCheckResult;

    /// Status of a single invoice; `None` if the provider does not know it.
    async fn invoice_status(&self, id: &InvoiceId) -> Result<Option<InvoiceStatus>> {
        let infos = self.get_invoices(std::slice::from_ref(id)).await?;
        Ok(infos
            .into_iter()
            .find(|info| &info.invoice_id == id)
            .map(|info| info.status))
    }
}

/// Accept an invoice id encoded as a JSON number or string.
pub(crate) fn invoice_id_from_any<'de, D>(deserializer: D) -> std::result::Result<InvoiceId, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    scalar_to_string(&value)
        .map(InvoiceId)
        .ok_or_else(|| serde::de::Error::custom("invoice_id must be a number or string"))
}

/// Accept an optional scalar encoded as a JSON number or string.
pub(crate) fn opt_string_from_any<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(scalar_to_string))
}

fn scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parsing() {
        let info: InvoiceInfo = serde_json::from_str(
            r#"{"invoice_id": 528, "status": "paid", "asset": "TON", "amount": "1"}"#,
        )
        .unwrap();
        assert_eq!(info.invoice_id, InvoiceId::from("528"));
        assert!(info.status.is_paid());

        let odd: InvoiceStatus = serde_json::from_str(r#""refunded""#).unwrap();
        assert_eq!(odd, InvoiceStatus::Unknown("refunded".into()));
        assert_eq!(serde_json::to_string(&InvoiceStatus::Expired).unwrap(), r#""expired""#);
    }

    #[test]
    fn test_numeric_amount_accepted() {
        let info: InvoiceInfo =
            serde_json::from_str(r#"{"invoice_id": "9", "status": "active", "amount": 1.5}"#)
                .unwrap();
        assert_eq!(info.amount.as_deref(), Some("1.5"));
        assert_eq!(info.status, InvoiceStatus::Active);
    }
}
