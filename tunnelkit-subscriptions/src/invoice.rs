//! Payment intents tracked until settlement.
//!
//! ```text
//! Pending ──paid──▶ Paid ──grant committed──▶ Granted (tombstone)
//!    │
//!    └──window closed──▶ Expired (tombstone)
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tunnelkit_lib::{AccountId, InvoiceId};

use crate::Amount;

/// Where an open invoice is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceState {
    /// Waiting for the customer to pay.
    Pending,
    /// Provider reported payment; the grant has not been committed yet.
    Paid,
}

/// Terminal outcome recorded when an invoice leaves the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceOutcome {
    Granted,
    Expired,
}

impl InvoiceOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceOutcome::Granted => "granted",
            InvoiceOutcome::Expired => "expired",
        }
    }
}

/// An invoice the engine is waiting on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingInvoice {
    pub invoice_id: InvoiceId,
    pub account: AccountId,
    pub asset: String,
    pub amount: Amount,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pay_url: Option<String>,
    pub state: InvoiceState,
}

impl PendingInvoice {
    /// A fresh pending invoice payable for `window`.
    pub fn new(
        invoice_id: InvoiceId,
        account: AccountId,
        asset: impl Into<String>,
        amount: Amount,
        window: Duration,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            invoice_id,
            account,
            asset: asset.into(),
            amount,
            created_at,
            expires_at: created_at + window,
            pay_url: None,
            state: InvoiceState::Pending,
        }
    }

    pub fn with_pay_url(mut self, url: impl Into<String>) -> Self {
        self.pay_url = Some(url.into());
        self
    }

    /// Backdate creation, keeping the window length. Used when reloading
    /// invoices the provider created earlier.
    pub fn created(mut self, at: DateTime<Utc>) -> Self {
        let window = self.expires_at - self.created_at;
        self.created_at = at;
        self.expires_at = at + window;
        self
    }

    pub fn is_window_open(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// A ledger row: open, or closed with an outcome.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LedgerRecord {
    pub invoice: PendingInvoice,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<InvoiceOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl LedgerRecord {
    pub fn open(invoice: PendingInvoice) -> Self {
        Self {
            invoice,
            outcome: None,
            closed_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.outcome.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_invoice_window() {
        let invoice = PendingInvoice::new(
            InvoiceId::from("9"),
            AccountId(1),
            "TON",
            Amount::from_str_checked("1").unwrap(),
            Duration::minutes(60),
        );
        assert_eq!(invoice.state, InvoiceState::Pending);
        assert_eq!(invoice.expires_at - invoice.created_at, Duration::minutes(60));
        assert!(invoice.is_window_open(invoice.created_at));
        assert!(!invoice.is_window_open(invoice.expires_at));
    }

    #[test]
    fn test_backdating_keeps_window() {
        let invoice = PendingInvoice::new(
            InvoiceId::from("9"),
            AccountId(1),
            "TON",
            Amount::zero(),
            Duration::minutes(60),
        );
        let earlier = invoice.created_at - Duration::minutes(45);
        let invoice = invoice.created(earlier);
        assert_eq!(invoice.expires_at, earlier + Duration::minutes(60));
    }

    #[test]
    fn test_record_json_shape() {
        let invoice = PendingInvoice::new(
            InvoiceId::from("9"),
            AccountId(1),
            "USDT",
            Amount::from_str_checked("1.5").unwrap(),
            Duration::minutes(60),
        )
        .with_pay_url("https://t.me/CryptoBot?start=IV9");
        let json = serde_json::to_value(LedgerRecord::open(invoice)).unwrap();
        assert_eq!(json["invoice"]["invoice_id"], "9");
        assert_eq!(json["invoice"]["amount"], "1.5");
        assert_eq!(json["invoice"]["state"], "pending");
        assert!(json.get("outcome").is_none());
    }
}
