//! Crypto Pay push notifications.
//!
//! Only `update_type == "invoice_paid"` with an invoice status of `paid`
//! counts as a settlement. Every other combination is parsed and then
//! ignored by the caller.

use serde::{Deserialize, Serialize};

use super::{invoice_id_from_any, opt_string_from_any};
use crate::{InvoiceId, Result, TunnelkitError};

/// Update type that signals a paid invoice.
pub const INVOICE_PAID: &str = "invoice_paid";

/// Invoice body of a webhook update.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookInvoice {
    /// Provider invoice id (number or string on the wire).
    #[serde(deserialize_with = "invoice_id_from_any")]
    pub invoice_id: InvoiceId,
    /// Invoice status at the time of the push.
    #[serde(default)]
    pub status: String,
    /// Asset ticker.
    #[serde(default)]
    pub asset: Option<String>,
    /// Paid amount.
    #[serde(default, deserialize_with = "opt_string_from_any")]
    pub amount: Option<String>,
    /// Payload attached at creation.
    #[serde(default)]
    pub payload: Option<String>,
}

/// One webhook delivery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookUpdate {
    /// Delivery id, when sent.
    #[serde(default)]
    pub update_id: Option<i64>,
    /// Kind of update.
    pub update_type: String,
    /// The invoice the update is about.
    pub payload: WebhookInvoice,
}

impl WebhookUpdate {
    /// Parse a raw request body.
    pub fn parse(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map_err(|e| TunnelkitError::invalid_data("webhook body", e.to_string()))
    }

    /// The invoice id, if this update reports a completed payment.
    pub fn settled_invoice(&self) -> Option<&InvoiceId> {
        if self.update_type == INVOICE_PAID && self.payload.status == "paid" {
            Some(&self.payload.invoice_id)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paid_update_settles() {
        let update = WebhookUpdate::parse(
            br#"{"update_id": 1, "update_type": "invoice_paid",
                 "payload": {"invoice_id": 12345, "status": "paid", "asset": "TON", "amount": "1"}}"#,
        )
        .unwrap();
        assert_eq!(update.settled_invoice(), Some(&InvoiceId::from("12345")));
        assert_eq!(update.payload.asset.as_deref(), Some("TON"));
    }

    #[test]
    fn test_other_updates_ignored() {
        let active = WebhookUpdate::parse(
            br#"{"update_type": "invoice_paid", "payload": {"invoice_id": "7", "status": "active"}}"#,
        )
        .unwrap();
        assert!(active.settled_invoice().is_none());

        let other = WebhookUpdate::parse(
            br#"{"update_type": "invoice_created", "payload": {"invoice_id": "7", "status": "paid"}}"#,
        )
        .unwrap();
        assert!(other.settled_invoice().is_none());
    }

    #[test]
    fn test_malformed_body_rejected() {
        assert!(WebhookUpdate::parse(b"not json").is_err());
        assert!(WebhookUpdate::parse(br#"{"update_type": "invoice_paid"}"#).is_err());
    }
}
