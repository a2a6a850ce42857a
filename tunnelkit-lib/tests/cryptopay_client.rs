//! Integration tests for the Crypto Pay client using wiremock.

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tunnelkit_lib::payments::{
    CryptoPayClient, CryptoPayConfig, InvoiceRequest, InvoiceStatus, PaymentProvider,
};
use tunnelkit_lib::retry::RetryPolicy;
use tunnelkit_lib::{InvoiceId, TunnelkitError, TunnelkitErrorCode};

fn client(server: &MockServer) -> CryptoPayClient {
    let config = CryptoPayConfig::new("123:token")
        .with_base_url(server.uri())
        .with_retry(RetryPolicy::new(1).with_initial_backoff(1).with_jitter(false));
    CryptoPayClient::new(config).unwrap()
}

fn request() -> InvoiceRequest {
    InvoiceRequest {
        asset: "USDT".to_string(),
        amount: "1.5".to_string(),
        description: "VPN access for 30 days".to_string(),
        payload: "42".to_string(),
        expires_in_secs: 3600,
    }
}

#[tokio::test]
async fn test_create_invoice() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/createInvoice"))
        .and(header("Crypto-Pay-API-Token", "123:token"))
        .and(body_partial_json(json!({
            "asset": "USDT",
            "amount": "1.5",
            "payload": "42",
            "allow_comments": false,
            "allow_anonymous": false,
            "expires_in": 3600
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": {
                "invoice_id": 501,
                "status": "active",
                "asset": "USDT",
                "amount": "1.5",
                "bot_invoice_url": "https://t.me/CryptoBot?start=IVabc",
                "created_at": "2025-01-01T00:00:00.000Z",
                "expiration_date": "2025-01-01T01:00:00.000Z"
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let created = client(&server).create_invoice(&request()).await.unwrap();
    assert_eq!(created.invoice_id, InvoiceId::from("501"));
    assert_eq!(created.pay_url, "https://t.me/CryptoBot?start=IVabc");
    assert!(created.expires_at.is_some());
}

#[tokio::test]
async fn test_create_invoice_api_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/createInvoice"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "ok": false,
            "error": {"code": 401, "name": "UNAUTHORIZED"}
        })))
        .mount(&server)
        .await;

    let err = client(&server).create_invoice(&request()).await.unwrap_err();
    assert_eq!(err.code(), TunnelkitErrorCode::Auth);
}

#[tokio::test]
async fn test_get_invoices_by_id() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/getInvoices"))
        .and(query_param("invoice_ids", "501,502"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": {"items": [
                {"invoice_id": 501, "status": "paid", "asset": "USDT", "amount": "1.5", "payload": "42"},
                {"invoice_id": 502, "status": "expired", "asset": "TON", "amount": "1"}
            ]}
        })))
        .mount(&server)
        .await;

    let infos = client(&server)
        .get_invoices(&[InvoiceId::from("501"), InvoiceId::from("502")])
        .await
        .unwrap();
    assert_eq!(infos.len(), 2);
    assert_eq!(infos[0].status, InvoiceStatus::Paid);
    assert_eq!(infos[0].payload.as_deref(), Some("42"));
    assert_eq!(infos[1].status, InvoiceStatus::Expired);
}

#[tokio::test]
async fn test_invoice_status_unknown_id() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/getInvoices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": {"items": []}
        })))
        .mount(&server)
        .await;

    let status = client(&server)
        .invoice_status(&InvoiceId::from("999"))
        .await
        .unwrap();
    assert!(status.is_none());
}

#[tokio::test]
async fn test_status_query_retries_server_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/getInvoices"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/getInvoices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": {"items": [{"invoice_id": "7", "status": "active"}]}
        })))
        .mount(&server)
        .await;

    let status = client(&server)
        .invoice_status(&InvoiceId::from("7"))
        .await
        .unwrap();
    assert_eq!(status, Some(InvoiceStatus::Active));
}

#[tokio::test]
async fn test_malformed_success_body() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/getInvoices"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;

    let err = client(&server)
        .get_invoices(&[InvoiceId::from("1")])
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelkitError::Serialization(_)));
}
