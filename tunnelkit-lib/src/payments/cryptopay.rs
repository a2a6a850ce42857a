//! Crypto Pay REST adapter.
//!
//! Every response is wrapped in `{"ok": bool, "result" | "error"}`. Errors
//! carry an HTTP-like `code` and a `name` such as `UNAUTHORIZED` or
//! `INVOICES_NOT_FOUND`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use super::config::CryptoPayConfig;
use super::{
    invoice_id_from_any, opt_string_from_any, CreatedInvoice, InvoiceInfo, InvoiceRequest,
    PaymentProvider,
};
use crate::health::HealthCheckResult;
use crate::retry::with_retry;
use crate::{InvoiceId, Result, TunnelkitError};

const SERVICE: &str = "cryptopay";

/// Client for the Crypto Pay API.
pub struct CryptoPayClient {
    config: CryptoPayConfig,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct Envelope<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Serialize)]
struct CreateInvoiceBody<'a> {
    asset: &'a str,
    amount: &'a str,
    description: &'a str,
    payload: &'a str,
    allow_comments: bool,
    allow_anonymous: bool,
    expires_in: u64,
}

#[derive(Deserialize)]
struct RawCreated {
    #[serde(deserialize_with = "invoice_id_from_any")]
    invoice_id: InvoiceId,
    #[serde(default)]
    bot_invoice_url: Option<String>,
    #[serde(default)]
    pay_url: Option<String>,
    #[serde(default)]
    asset: Option<String>,
    #[serde(default, deserialize_with = "opt_string_from_any")]
    amount: Option<String>,
    #[serde(default)]
    expiration_date: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct InvoiceList {
    #[serde(default)]
    items: Vec<InvoiceInfo>,
}

impl CryptoPayClient {
    /// Create a new Crypto Pay client.
    pub fn new(config: CryptoPayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TunnelkitError::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    /// Get the configuration.
    pub fn config(&self) -> &CryptoPayConfig {
        &self.config
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), method)
    }

    async fn call<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request
            .header("Crypto-Pay-API-Token", &self.config.api_token)
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| TunnelkitError::Transport(format!("Failed to read response: {}", e)))?;

        let envelope: Envelope<T> = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(_) if !(200..300).contains(&status) => {
                return Err(TunnelkitError::from_status(SERVICE, status, &text))
            }
            Err(e) => {
                return Err(TunnelkitError::Serialization(format!(
                    "Failed to parse Crypto Pay response: {}",
                    e
                )))
            }
        };

        match envelope {
            Envelope {
                ok: true,
                result: Some(result),
                ..
            } => Ok(result),
            Envelope { error, .. } => {
                let error = error.unwrap_or_default();
                let code = error.code.unwrap_or(if (200..300).contains(&status) {
                    400
                } else {
                    status
                });
                let name = error.name.unwrap_or_else(|| "UNKNOWN_ERROR".to_string());
                Err(TunnelkitError::from_status(SERVICE, code, &name))
            }
        }
    }

    /// Map reqwest errors to TunnelkitError.
    fn map_reqwest_error(&self, e: reqwest::Error) -> TunnelkitError {
        if e.is_timeout() {
            TunnelkitError::ConnectionTimeout {
                operation: "Crypto Pay request".to_string(),
                timeout_ms: self.config.timeout_secs * 1000,
            }
        } else if e.is_connect() {
            TunnelkitError::ConnectionFailed {
                target: self.config.base_url.clone(),
                reason: e.to_string(),
            }
        } else {
            TunnelkitError::Transport(format!("Crypto Pay request failed: {}", e))
        }
    }
}

#[async_trait]
impl PaymentProvider for CryptoPayClient {
    #[instrument(skip(self, request), fields(asset = %request.asset, amount = %request.amount))]
    async fn create_invoice(&self, request: &InvoiceRequest) -> Result<CreatedInvoice> {
        let body = CreateInvoiceBody {
            asset: &request.asset,
            amount: &request.amount,
            description: &request.description,
            payload: &request.payload,
            allow_comments: false,
            allow_anonymous: false,
            expires_in: request.expires_in_secs,
        };
        let raw: RawCreated = self
            .call(self.client.post(self.url("createInvoice")).json(&body))
            .await?;
        let pay_url = raw
            .bot_invoice_url
            .or(raw.pay_url)
            .ok_or_else(|| TunnelkitError::invalid_data("pay_url", "missing from createInvoice"))?;
        info!(invoice_id = %raw.invoice_id, "invoice created");
        Ok(CreatedInvoice {
            invoice_id: raw.invoice_id,
            pay_url,
            asset: raw.asset.unwrap_or_else(|| request.asset.clone()),
            amount: raw.amount.unwrap_or_else(|| request.amount.clone()),
            expires_at: raw.expiration_date,
        })
    }

    #[instrument(skip(self))]
    async fn get_invoices(&self, ids: &[InvoiceId]) -> Result<Vec<InvoiceInfo>> {
        let joined = ids
            .iter()
            .map(InvoiceId::as_str)
            .collect::<Vec<_>>()
            .join(",");
        let url = self.url("getInvoices");
        let (url, joined) = (url.as_str(), joined.as_str());
        let list: InvoiceList = with_retry(&self.config.retry, "getInvoices", move || async move {
            self.call(self.client.get(url).query(&[("invoice_ids", joined)]))
                .await
        })
        .await?;
        Ok(list.items)
    }

    async fn health(&self) -> HealthCheckResult {
        let started = Instant::now();
        let result: Result<serde_json::Value> = self.call(self.client.get(self.url("getMe"))).await;
        let latency = started.elapsed().as_millis() as u64;
        match result {
            Ok(details) => HealthCheckResult::healthy(SERVICE)
                .with_latency(latency)
                .with_details(details),
            Err(err) => HealthCheckResult::unhealthy(SERVICE, err.to_string()).with_latency(latency),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_error_shape() {
        let envelope: Envelope<serde_json::Value> = serde_json::from_str(
            r#"{"ok": false, "error": {"code": 401, "name": "UNAUTHORIZED"}}"#,
        )
        .unwrap();
        assert!(!envelope.ok);
        assert!(envelope.result.is_none());
        assert_eq!(envelope.error.unwrap().name.as_deref(), Some("UNAUTHORIZED"));
    }

    #[test]
    fn test_created_invoice_shape() {
        let raw: RawCreated = serde_json::from_str(
            r#"{"invoice_id": 77, "bot_invoice_url": "https://t.me/CryptoBot?start=IV77",
                "asset": "USDT", "amount": "1.5"}"#,
        )
        .unwrap();
        assert_eq!(raw.invoice_id.as_str(), "77");
        assert!(raw.pay_url.is_none());
        assert_eq!(raw.amount.as_deref(), Some("1.5"));
    }
}
