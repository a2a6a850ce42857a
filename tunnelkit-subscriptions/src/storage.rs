//! Durable stores for subscriptions and invoices.
//!
//! Both stores keep an in-memory map behind a mutex and journal every
//! mutation through [`JournaledMap`] before the map changes. A read-modify-
//! write happens entirely under that mutex, so concurrent upserts for one
//! account serialize.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};
use tunnelkit_lib::{AccountId, InvoiceId};

use crate::config::EngineConfig;
use crate::devices::FileDeviceRegistry;
use crate::invoice::{InvoiceOutcome, InvoiceState, LedgerRecord, PendingInvoice};
use crate::journal::JournaledMap;
use crate::promo::FilePromoLedger;
use crate::retry_queue::GrantRetryQueue;
use crate::subscription::{Subscription, SubscriptionPatch};
use crate::{Result, SubscriptionError};

/// Account → entitlement table.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get(&self, account: AccountId) -> Result<Option<Subscription>>;

    /// Merge `patch` into the stored record (or create one) and commit.
    async fn upsert(&self, patch: SubscriptionPatch) -> Result<Subscription>;

    /// All subscriptions, ordered by account.
    async fn list(&self) -> Result<Vec<Subscription>>;

    /// Subscriptions active at `now`.
    async fn count_active(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// Crash-safe record of payment intents.
#[async_trait]
pub trait InvoiceLedger: Send + Sync {
    /// Start tracking an invoice. Ids are never reused.
    async fn record(&self, invoice: PendingInvoice) -> Result<()>;

    /// An open invoice.
    async fn get(&self, invoice_id: &InvoiceId) -> Result<Option<PendingInvoice>>;

    /// All open invoices, oldest first.
    async fn list_pending(&self) -> Result<Vec<PendingInvoice>>;

    /// Move an open invoice to `Paid`. Returns false if it is not open.
    async fn mark_paid(&self, invoice_id: &InvoiceId) -> Result<bool>;

    /// Close an invoice with its outcome. Closing an already-closed invoice
    /// overwrites the outcome.
    async fn remove(&self, invoice_id: &InvoiceId, outcome: InvoiceOutcome) -> Result<()>;

    /// Outcome of a closed invoice.
    async fn outcome(&self, invoice_id: &InvoiceId) -> Result<Option<InvoiceOutcome>>;

    /// Reopen an `Expired` invoice as `Paid` (late settlement).
    async fn reopen_paid(&self, invoice_id: &InvoiceId) -> Result<Option<PendingInvoice>>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Journal-backed [`SubscriptionStore`].
pub struct FileSubscriptionStore {
    map: Mutex<JournaledMap<AccountId, Subscription>>,
}

impl FileSubscriptionStore {
    pub fn open(path: impl AsRef<Path>, compact_threshold: usize) -> Result<Self> {
        let map = JournaledMap::open(path.as_ref(), compact_threshold)?;
        info!(
            path = %path.as_ref().display(),
            subscriptions = map.len(),
            "subscription store opened"
        );
        Ok(Self {
            map: Mutex::new(map),
        })
    }
}

#[async_trait]
impl SubscriptionStore for FileSubscriptionStore {
    async fn get(&self, account: AccountId) -> Result<Option<Subscription>> {
        Ok(lock(&self.map).get(&account).cloned())
    }

    async fn upsert(&self, patch: SubscriptionPatch) -> Result<Subscription> {
        let mut map = lock(&self.map);
        let account = patch.account;
        let existing = map.get(&account).cloned();
        let committed = patch.apply(existing, Utc::now())?;
        map.insert(account, committed.clone())?;
        debug!(%account, expires_at = %committed.expires_at, "subscription committed");
        Ok(committed)
    }

    async fn list(&self) -> Result<Vec<Subscription>> {
        let mut subs: Vec<Subscription> = lock(&self.map).values().cloned().collect();
        subs.sort_by_key(|s| s.account);
        Ok(subs)
    }

    async fn count_active(&self, now: DateTime<Utc>) -> Result<usize> {
        Ok(lock(&self.map).values().filter(|s| s.is_active(now)).count())
    }
}

/// Journal-backed [`InvoiceLedger`].
///
/// Closed invoices stay as outcome tombstones for the idempotency check
/// until they are older than the retention window at compaction time.
pub struct FileInvoiceLedger {
    map: Mutex<JournaledMap<InvoiceId, LedgerRecord>>,
}

impl FileInvoiceLedger {
    pub fn open(
        path: impl AsRef<Path>,
        compact_threshold: usize,
        retention: Duration,
    ) -> Result<Self> {
        let map = JournaledMap::open(path.as_ref(), compact_threshold)?.with_retention(
            move |record: &LedgerRecord| match record.closed_at {
                Some(closed_at) => Utc::now() - closed_at < retention,
                None => true,
            },
        );
        info!(
            path = %path.as_ref().display(),
            records = map.len(),
            "invoice ledger opened"
        );
        Ok(Self {
            map: Mutex::new(map),
        })
    }

    /// Force a compaction (prunes expired tombstones).
    pub fn compact(&self) -> Result<()> {
        lock(&self.map).compact()
    }

    /// Open and closed records held.
    pub fn len(&self) -> usize {
        lock(&self.map).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl InvoiceLedger for FileInvoiceLedger {
    async fn record(&self, invoice: PendingInvoice) -> Result<()> {
        let mut map = lock(&self.map);
        if map.contains_key(&invoice.invoice_id) {
            return Err(SubscriptionError::InvalidArgument(format!(
                "invoice {} already recorded",
                invoice.invoice_id
            ))
            .into());
        }
        let id = invoice.invoice_id.clone();
        map.insert(id, LedgerRecord::open(invoice))
    }

    async fn get(&self, invoice_id: &InvoiceId) -> Result<Option<PendingInvoice>> {
        Ok(lock(&self.map)
            .get(invoice_id)
            .filter(|r| r.is_open())
            .map(|r| r.invoice.clone()))
    }

    async fn list_pending(&self) -> Result<Vec<PendingInvoice>> {
        let mut open: Vec<PendingInvoice> = lock(&self.map)
            .values()
            .filter(|r| r.is_open())
            .map(|r| r.invoice.clone())
            .collect();
        open.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(open)
    }

    async fn mark_paid(&self, invoice_id: &InvoiceId) -> Result<bool> {
        let mut map = lock(&self.map);
        let Some(record) = map.get(invoice_id).filter(|r| r.is_open()).cloned() else {
            return Ok(false);
        };
        if record.invoice.state == InvoiceState::Paid {
            return Ok(true);
        }
        let mut record = record;
        record.invoice.state = InvoiceState::Paid;
        map.insert(invoice_id.clone(), record)?;
        Ok(true)
    }

    async fn remove(&self, invoice_id: &InvoiceId, outcome: InvoiceOutcome) -> Result<()> {
        let mut map = lock(&self.map);
        let mut record = map.get(invoice_id).cloned().ok_or_else(|| {
            SubscriptionError::NotFound(format!("invoice {}", invoice_id))
        })?;
        record.outcome = Some(outcome);
        record.closed_at = Some(Utc::now());
        map.insert(invoice_id.clone(), record)?;
        debug!(%invoice_id, outcome = outcome.as_str(), "invoice closed");
        Ok(())
    }

    async fn outcome(&self, invoice_id: &InvoiceId) -> Result<Option<InvoiceOutcome>> {
        Ok(lock(&self.map).get(invoice_id).and_then(|r| r.outcome))
    }

    async fn reopen_paid(&self, invoice_id: &InvoiceId) -> Result<Option<PendingInvoice>> {
        let mut map = lock(&self.map);
        let Some(mut record) = map
            .get(invoice_id)
            .filter(|r| r.outcome == Some(InvoiceOutcome::Expired))
            .cloned()
        else {
            return Ok(None);
        };
        record.outcome = None;
        record.closed_at = None;
        record.invoice.state = InvoiceState::Paid;
        let invoice = record.invoice.clone();
        map.insert(invoice_id.clone(), record)?;
        Ok(Some(invoice))
    }
}

/// Every durable store the engine needs, opened from one data directory.
#[derive(Clone)]
pub struct Stores {
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub invoices: Arc<dyn InvoiceLedger>,
    pub devices: Arc<FileDeviceRegistry>,
    pub promos: Arc<FilePromoLedger>,
    pub retries: Arc<GrantRetryQueue>,
}

impl Stores {
    /// Open (or create) all journals under `config.data_dir`.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        let dir = &config.data_dir;
        std::fs::create_dir_all(dir)?;
        let threshold = config.compact_threshold;
        let retention = Duration::days(config.tombstone_retention_days);

        Ok(Self {
            subscriptions: Arc::new(FileSubscriptionStore::open(
                dir.join("subscriptions.jsonl"),
                threshold,
            )?),
            invoices: Arc::new(FileInvoiceLedger::open(
                dir.join("invoices.jsonl"),
                threshold,
                retention,
            )?),
            devices: Arc::new(FileDeviceRegistry::open(
                dir.join("devices.jsonl"),
                config.device_limit,
                threshold,
            )?),
            promos: Arc::new(FilePromoLedger::open(dir, threshold)?),
            retries: Arc::new(GrantRetryQueue::open(
                dir.join("grant_retries.jsonl"),
                config.max_grant_attempts,
                threshold,
            )?),
        })
    }
}
