//! Shared harness for the engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tunnelkit_lib::retry::RetryPolicy;
use tunnelkit_lib::test_utils::{MockAuthority, MockPaymentProvider};
use tunnelkit_subscriptions::{
    EngineConfig, InvoiceId, InvoiceOutcome, ReconciliationEngine, RecordingNotifier,
};

pub struct Harness {
    pub dir: TempDir,
    pub engine: Arc<ReconciliationEngine>,
    pub panel: Arc<MockAuthority>,
    pub payments: Arc<MockPaymentProvider>,
    pub notices: Arc<RecordingNotifier>,
}

/// Config with millisecond timers and a fast URI backoff.
pub fn fast_config(dir: &TempDir) -> EngineConfig {
    EngineConfig::new(dir.path())
        .with_timers(
            Duration::from_millis(400),
            Duration::from_millis(20),
            Duration::from_millis(20),
        )
        .with_reminder_every(2)
        .with_uri_retry(RetryPolicy::new(2).with_initial_backoff(1).with_jitter(false))
}

pub fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let config = fast_config(&dir);
    harness_with(dir, config)
}

pub fn harness_with(dir: TempDir, config: EngineConfig) -> Harness {
    let panel = Arc::new(MockAuthority::new());
    let payments = Arc::new(MockPaymentProvider::new());
    let notices = Arc::new(RecordingNotifier::new());
    let engine =
        ReconciliationEngine::open(config, panel.clone(), payments.clone(), notices.clone()).unwrap();
    Harness {
        dir,
        engine,
        panel,
        payments,
        notices,
    }
}

impl Harness {
    /// A second engine over the same data directory and mocks, as after a
    /// process restart. The current engine's timers are stopped first.
    pub fn restart(&self) -> Arc<ReconciliationEngine> {
        self.engine.shutdown();
        ReconciliationEngine::open(
            fast_config(&self.dir),
            self.panel.clone(),
            self.payments.clone(),
            self.notices.clone(),
        )
        .unwrap()
    }
}

/// Wait up to two seconds for an invoice to be closed.
pub async fn wait_for_outcome(
    engine: &ReconciliationEngine,
    invoice_id: &InvoiceId,
) -> Option<InvoiceOutcome> {
    for _ in 0..200 {
        if let Some(outcome) = engine.invoices().outcome(invoice_id).await.unwrap() {
            return Some(outcome);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}
