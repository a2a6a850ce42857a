//! Per-invoice poll timers.
//!
//! Each open invoice gets one task that polls the provider until the invoice
//! is paid, expires, or its window closes. Timers are derived from the
//! invoice's `created_at`, so a task re-armed after a restart continues the
//! same schedule instead of starting a fresh window.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use tunnelkit_lib::payments::InvoiceStatus;
use tunnelkit_lib::InvoiceId;

use crate::engine::{ReconciliationEngine, SettleTrigger};
use crate::invoice::PendingInvoice;
use crate::notify::Notice;

/// Handles of running poll tasks, keyed by invoice.
#[derive(Default)]
pub struct InvoiceWatchers {
    handles: Mutex<HashMap<InvoiceId, JoinHandle<()>>>,
}

impl InvoiceWatchers {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<InvoiceId, JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start `task` for `invoice_id`, replacing any task already running.
    pub fn spawn<F>(&self, invoice_id: InvoiceId, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut handles = self.lock();
        let handle = tokio::spawn(task);
        if let Some(previous) = handles.insert(invoice_id, handle) {
            previous.abort();
        }
    }

    /// Abort the task for `invoice_id`.
    pub fn cancel(&self, invoice_id: &InvoiceId) -> bool {
        match self.lock().remove(invoice_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Forget the handle without aborting. A task calls this on itself
    /// before it settles or expires its invoice.
    pub(crate) fn detach(&self, invoice_id: &InvoiceId) -> bool {
        self.lock().remove(invoice_id).is_some()
    }

    pub fn is_watching(&self, invoice_id: &InvoiceId) -> bool {
        self.lock()
            .get(invoice_id)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Tasks still running.
    pub fn active(&self) -> usize {
        self.lock().values().filter(|h| !h.is_finished()).count()
    }

    pub fn cancel_all(&self) -> usize {
        let handles: Vec<_> = self.lock().drain().collect();
        let count = handles.len();
        for (_, handle) in handles {
            handle.abort();
        }
        count
    }
}

/// Where a schedule stands `elapsed` after the invoice was created.
/// Returns the polls counted as done and the wait before the next one.
fn schedule_position(elapsed: Duration, first_delay: Duration, interval: Duration) -> (u32, Duration) {
    if elapsed < first_delay {
        return (0, first_delay - elapsed);
    }
    let since_first = elapsed - first_delay;
    let interval_ms = interval.as_millis().max(1);
    let done = since_first.as_millis() / interval_ms;
    let polls = u32::try_from(done).unwrap_or(u32::MAX);
    (polls, Duration::ZERO)
}

/// Poll one invoice until it settles or its window closes.
pub(crate) async fn watch_invoice(engine: Arc<ReconciliationEngine>, invoice: PendingInvoice) {
    let id = invoice.invoice_id.clone();
    let config = engine.config();
    let interval = config.poll_interval().max(Duration::from_millis(1));
    let reminder_every = config.reminder_every;

    let now = Utc::now();
    let elapsed = (now - invoice.created_at).to_std().unwrap_or_default();
    let remaining = (invoice.expires_at - now).to_std().unwrap_or_default();
    let deadline = Instant::now() + remaining;
    let (mut polls, mut wait) = schedule_position(elapsed, config.first_poll_delay(), interval);
    debug!(invoice_id = %id, polls, wait_ms = wait.as_millis() as u64, "watching invoice");

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        tokio::time::sleep(wait.min(deadline - now)).await;
        if Instant::now() >= deadline {
            break;
        }
        polls += 1;
        wait = interval;

        match engine.payments().invoice_status(&id).await {
            Ok(Some(InvoiceStatus::Paid)) => {
                engine.watchers().detach(&id);
                match engine.settle(&id, SettleTrigger::Poll).await {
                    Ok(outcome) => debug!(invoice_id = %id, ?outcome, "poll settled invoice"),
                    Err(e) => error!(invoice_id = %id, error = %format!("{:#}", e), "poll settlement failed"),
                }
                return;
            }
            Ok(Some(InvoiceStatus::Expired)) => {
                info!(invoice_id = %id, "provider expired invoice");
                break;
            }
            Ok(_) => {}
            Err(e) => warn!(invoice_id = %id, error = %e, "invoice status poll failed"),
        }

        if reminder_every > 0 && polls % reminder_every == 0 {
            engine
                .notifier()
                .notify(Notice::PaymentReminder {
                    account: invoice.account,
                    invoice_id: id.clone(),
                    pay_url: invoice.pay_url.clone(),
                })
                .await;
        }
    }

    engine.watchers().detach(&id);
    if let Err(e) = engine.expire_invoice(&id).await {
        error!(invoice_id = %id, error = %format!("{:#}", e), "failed to close expired invoice");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_schedule_before_first_poll() {
        let (polls, wait) = schedule_position(
            Duration::from_secs(10),
            Duration::from_secs(30),
            Duration::from_secs(15),
        );
        assert_eq!(polls, 0);
        assert_eq!(wait, Duration::from_secs(20));
    }

    #[test]
    fn test_schedule_after_restart() {
        // 30s first delay, then every 15s: four full intervals passed since the first poll.
        let (polls, wait) = schedule_position(
            Duration::from_secs(100),
            Duration::from_secs(30),
            Duration::from_secs(15),
        );
        assert_eq!(polls, 4);
        assert_eq!(wait, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_cancel_aborts_task() {
        let watchers = InvoiceWatchers::new();
        let id = InvoiceId::from("1");
        watchers.spawn(id.clone(), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        assert!(watchers.is_watching(&id));
        assert_eq!(watchers.active(), 1);
        assert!(watchers.cancel(&id));
        assert!(!watchers.is_watching(&id));
        assert!(!watchers.cancel(&id));
    }

    #[tokio::test]
    async fn test_respawn_replaces_previous() {
        let watchers = InvoiceWatchers::new();
        let id = InvoiceId::from("1");
        let finished = Arc::new(AtomicU32::new(0));

        let first = finished.clone();
        watchers.spawn(id.clone(), async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            first.fetch_add(1, Ordering::SeqCst);
        });
        let second = finished.clone();
        watchers.spawn(id.clone(), async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            second.fetch_add(10, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 10);
        assert_eq!(watchers.cancel_all(), 1);
    }
}
