//! In-memory payment provider.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use crate::health::HealthCheckResult;
use crate::payments::{CreatedInvoice, InvoiceInfo, InvoiceRequest, InvoiceStatus, PaymentProvider};
use crate::{InvoiceId, Result, TunnelkitError};

#[derive(Default)]
struct State {
    invoices: HashMap<InvoiceId, (InvoiceRequest, InvoiceStatus)>,
    next_id: u64,
    status_queries: u32,
    transient_failures: u32,
}

/// In-memory payment provider whose invoices are settled by the test.
#[derive(Default)]
pub struct MockPaymentProvider {
    state: Mutex<State>,
}

impl MockPaymentProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, id: &InvoiceId, status: InvoiceStatus) -> bool {
        match self.lock().invoices.get_mut(id) {
            Some(entry) => {
                entry.1 = status;
                true
            }
            None => false,
        }
    }

    /// Mark an invoice paid. Returns false for unknown ids.
    pub fn mark_paid(&self, id: &InvoiceId) -> bool {
        self.set_status(id, InvoiceStatus::Paid)
    }

    /// Mark an invoice expired. Returns false for unknown ids.
    pub fn mark_expired(&self, id: &InvoiceId) -> bool {
        self.set_status(id, InvoiceStatus::Expired)
    }

    /// Register an invoice the provider knows about without `create_invoice`.
    pub fn insert(&self, id: &InvoiceId, request: InvoiceRequest, status: InvoiceStatus) {
        self.lock().invoices.insert(id.clone(), (request, status));
    }

    /// The next N status queries fail with a transient error.
    pub fn fail_next_queries(&self, count: u32) {
        self.lock().transient_failures = count;
    }

    /// Number of `get_invoices` calls so far.
    pub fn status_queries(&self) -> u32 {
        self.lock().status_queries
    }

    /// Requests passed to `create_invoice`, oldest first.
    pub fn created(&self) -> Vec<(InvoiceId, InvoiceRequest)> {
        let state = self.lock();
        let mut created: Vec<_> = state
            .invoices
            .iter()
            .map(|(id, (request, _))| (id.clone(), request.clone()))
            .collect();
        created.sort_by_key(|(id, _)| id.as_str().parse::<u64>().unwrap_or(u64::MAX));
        created
    }

    /// Body of the `invoice_paid` push for an invoice.
    pub fn paid_webhook(id: &InvoiceId) -> Vec<u8> {
        serde_json::json!({
            "update_id": 1,
            "update_type": "invoice_paid",
            "payload": {
                "invoice_id": id.as_str(),
                "status": "paid",
                "asset": "TON",
                "amount": "1"
            }
        })
        .to_string()
        .into_bytes()
    }
}

#[async_trait]
impl PaymentProvider for MockPaymentProvider {
    async fn create_invoice(&self, request: &InvoiceRequest) -> Result<CreatedInvoice> {
        let mut state = self.lock();
        state.next_id += 1;
        let id = InvoiceId(state.next_id.to_string());
        state
            .invoices
            .insert(id.clone(), (request.clone(), InvoiceStatus::Active));
        Ok(CreatedInvoice {
            pay_url: format!("https://t.me/CryptoBot?start=IV{}", id),
            invoice_id: id,
            asset: request.asset.clone(),
            amount: request.amount.clone(),
            expires_at: Some(Utc::now() + Duration::seconds(request.expires_in_secs as i64)),
        })
    }

    async fn get_invoices(&self, ids: &[InvoiceId]) -> Result<Vec<InvoiceInfo>> {
        let mut state = self.lock();
        state.status_queries += 1;
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(TunnelkitError::Transport("injected provider failure".to_string()));
        }
        Ok(ids
            .iter()
            .filter_map(|id| {
                state.invoices.get(id).map(|(request, status)| InvoiceInfo {
                    invoice_id: id.clone(),
                    status: status.clone(),
                    asset: Some(request.asset.clone()),
                    amount: Some(request.amount.clone()),
                    payload: Some(request.payload.clone()),
                })
            })
            .collect())
    }

    async fn health(&self) -> HealthCheckResult {
        HealthCheckResult::healthy("cryptopay")
    }
}
