//! Restart behavior: durable stores reload and open invoices are resumed
//! from where their schedules stood.

mod common;

use chrono::{Duration, Utc};
use common::{harness, wait_for_outcome};
use tunnelkit_lib::payments::{InvoiceRequest, InvoiceStatus};
use tunnelkit_subscriptions::{
    AccountId, Amount, GrantSource, InvoiceId, InvoiceOutcome, InvoiceState, PendingInvoice,
    PromoCode, RetryOutcome, SettleOutcome, SettleTrigger, SubscriptionPatch,
};

fn request(account: AccountId) -> InvoiceRequest {
    InvoiceRequest {
        asset: "TON".into(),
        amount: "1".into(),
        description: "VPN access for 30 days".into(),
        payload: account.to_string(),
        expires_in_secs: 1,
    }
}

fn pending(id: &str, account: AccountId, age_ms: i64) -> PendingInvoice {
    PendingInvoice::new(
        InvoiceId::from(id),
        account,
        "TON",
        Amount::from_str_checked("1").unwrap(),
        Duration::milliseconds(400),
    )
    .created(Utc::now() - Duration::milliseconds(age_ms))
}

#[tokio::test]
async fn test_subscriptions_survive_restart() {
    let h = harness();
    let report = h.engine.grant(AccountId(1), 30, 0).await.unwrap();

    let engine = h.restart();
    let status = engine.entitlement_status(AccountId(1)).await.unwrap().unwrap();
    assert!(status.active);
    assert_eq!(status.expires_at, report.expires_at);
    assert_eq!(status.credential_uri, report.credential_uri);
}

#[tokio::test]
async fn test_pending_invoice_rearmed_and_paid_after_restart() {
    let h = harness();
    let handle = h.engine.open_invoice(AccountId(2), "TON").await.unwrap();

    let engine = h.restart();
    let report = engine.resume().await.unwrap();
    assert_eq!(report.rearmed, 1);
    assert!(engine.watchers().is_watching(&handle.invoice_id));

    h.payments.mark_paid(&handle.invoice_id);
    assert_eq!(
        wait_for_outcome(&engine, &handle.invoice_id).await,
        Some(InvoiceOutcome::Granted)
    );
    assert_eq!(h.panel.calls().create, 1);
}

#[tokio::test]
async fn test_window_elapsed_while_down_expires_at_once() {
    let h = harness();
    let account = AccountId(3);
    let invoice = pending("900", account, 1_000);
    h.payments.insert(&invoice.invoice_id, request(account), InvoiceStatus::Active);
    h.engine.invoices().record(invoice.clone()).await.unwrap();

    let engine = h.restart();
    engine.resume().await.unwrap();
    assert_eq!(
        wait_for_outcome(&engine, &invoice.invoice_id).await,
        Some(InvoiceOutcome::Expired)
    );
    // The final check before closing still asks the provider.
    assert!(h.payments.status_queries() >= 1);
}

#[tokio::test]
async fn test_payment_made_while_down_is_found_by_first_poll() {
    let h = harness();
    let account = AccountId(4);
    let invoice = pending("901", account, 100);
    h.payments.insert(&invoice.invoice_id, request(account), InvoiceStatus::Paid);
    h.engine.invoices().record(invoice.clone()).await.unwrap();

    let engine = h.restart();
    engine.resume().await.unwrap();
    assert_eq!(
        wait_for_outcome(&engine, &invoice.invoice_id).await,
        Some(InvoiceOutcome::Granted)
    );
    assert!(engine.subscriptions().get(account).await.unwrap().is_some());
}

#[tokio::test]
async fn test_queued_grant_stays_queued_across_restart() {
    let h = harness();
    let account = AccountId(5);
    h.panel.configure(|f| f.reject_create = true);
    let handle = h.engine.open_invoice(account, "TON").await.unwrap();
    let SettleOutcome::Queued { grant_id, .. } = h
        .engine
        .settle(&handle.invoice_id, SettleTrigger::Webhook)
        .await
        .unwrap()
    else {
        panic!("expected a queued grant");
    };

    h.panel.configure(|f| f.reject_create = false);
    let engine = h.restart();
    let report = engine.resume().await.unwrap();
    assert_eq!(report.queued, 1);
    assert_eq!(report.settled, 0);
    assert_eq!(h.panel.calls().create, 1);

    assert_eq!(engine.pending_grants(account).len(), 1);
    assert!(matches!(
        engine.retry_grant(&grant_id).await.unwrap(),
        RetryOutcome::Granted(_)
    ));
    assert_eq!(
        engine.invoices().outcome(&handle.invoice_id).await.unwrap(),
        Some(InvoiceOutcome::Granted)
    );
}

#[tokio::test]
async fn test_interrupted_grant_is_finished_on_resume() {
    let h = harness();
    let account = AccountId(6);
    let invoice = pending("902", account, 0);
    h.engine.invoices().record(invoice.clone()).await.unwrap();
    h.engine.invoices().mark_paid(&invoice.invoice_id).await.unwrap();
    assert_eq!(
        h.engine.invoices().get(&invoice.invoice_id).await.unwrap().unwrap().state,
        InvoiceState::Paid
    );

    let engine = h.restart();
    let report = engine.resume().await.unwrap();
    assert_eq!(report.settled, 1);
    let sub = engine.subscriptions().get(account).await.unwrap().unwrap();
    assert_eq!(sub.days_left(Utc::now()), 30);
}

#[tokio::test]
async fn test_committed_grant_is_not_repeated_after_restart() {
    let h = harness();
    let account = AccountId(7);
    h.engine.grant(account, 30, 0).await.unwrap();
    let handle = h.engine.open_invoice(account, "TON").await.unwrap();
    h.engine.shutdown();

    // The grant for the invoice lands, then the process stops before the
    // ledger entry is closed.
    h.engine.invoices().mark_paid(&handle.invoice_id).await.unwrap();
    let committed = h
        .engine
        .subscriptions()
        .upsert(
            SubscriptionPatch::new(account)
                .extend_to(Utc::now() + Duration::days(60))
                .applied_grant(Some(GrantSource::Invoice(handle.invoice_id.clone()).to_string())),
        )
        .await
        .unwrap();

    let engine = h.restart();
    let report = engine.resume().await.unwrap();
    assert_eq!(report.closed, 1);
    assert_eq!(report.settled, 0);
    assert_eq!(h.panel.calls().replace, 0);
    assert_eq!(
        engine.invoices().outcome(&handle.invoice_id).await.unwrap(),
        Some(InvoiceOutcome::Granted)
    );
    let sub = engine.subscriptions().get(account).await.unwrap().unwrap();
    assert_eq!(sub.expires_at, committed.expires_at);
}

#[tokio::test]
async fn test_interrupted_promo_grant_is_finished_on_resume() {
    let h = harness();
    let account = AccountId(8);
    h.engine
        .promos()
        .upsert_code(PromoCode::new("GIFT", 7, 1))
        .await
        .unwrap();

    // Activation used, then the process stops before the grant.
    let source = GrantSource::Promo("GIFT".into());
    let reserved = h.engine.retries().reserve(account, source, 7, 0).unwrap();
    h.engine.promos().redeem(account, "GIFT").await.unwrap();

    let engine = h.restart();
    let report = engine.resume().await.unwrap();
    assert_eq!(report.settled, 1);
    assert!(engine.retries().get(&reserved.grant_id).is_none());
    let sub = engine.subscriptions().get(account).await.unwrap().unwrap();
    assert_eq!(sub.promo_code.as_deref(), Some("GIFT"));
    assert_eq!(sub.days_left(Utc::now()), 7);
}

#[tokio::test]
async fn test_reservation_without_redemption_is_dropped_on_resume() {
    let h = harness();
    let account = AccountId(9);
    h.engine
        .promos()
        .upsert_code(PromoCode::new("GIFT", 7, 1))
        .await
        .unwrap();
    let reserved = h
        .engine
        .retries()
        .reserve(account, GrantSource::Promo("GIFT".into()), 7, 0)
        .unwrap();

    let engine = h.restart();
    let report = engine.resume().await.unwrap();
    assert_eq!(report.closed, 1);
    assert!(engine.retries().get(&reserved.grant_id).is_none());
    assert!(engine.subscriptions().get(account).await.unwrap().is_none());
    assert_eq!(h.panel.calls().create, 0);
}
