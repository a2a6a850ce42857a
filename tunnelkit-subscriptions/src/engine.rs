//! Reconciliation engine: payments in, entitlements out.
//!
//! Every settlement trigger (webhook, poll, manual check, restart) funnels
//! into [`ReconciliationEngine::settle`], which re-checks the invoice's
//! outcome under the account lock before granting. A grant either creates a
//! panel user or runs the extension ladder, then commits the subscription,
//! and only then closes the invoice. A failed grant after a confirmed
//! payment becomes a [`GrantRetry`].

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};
use tunnelkit_lib::health::HealthCheckResult;
use tunnelkit_lib::payments::{InvoiceRequest, InvoiceStatus, PaymentProvider, WebhookUpdate};
use tunnelkit_lib::provisioning::{ExtendStrategy, ProvisioningClient};
use tunnelkit_lib::retry::with_retry;
use tunnelkit_lib::{AccountId, InvoiceId, TunnelkitError};

use crate::config::EngineConfig;
use crate::devices::{Device, DeviceRegistry};
use crate::invoice::{InvoiceOutcome, InvoiceState, PendingInvoice};
use crate::locks::AccountLocks;
use crate::notify::{Notice, Notifier};
use crate::promo::{normalize_code, PromoLedger};
use crate::retry_queue::{GrantRetry, GrantRetryQueue, GrantSource};
use crate::storage::{InvoiceLedger, Stores, SubscriptionStore};
use crate::subscription::{Subscription, SubscriptionPatch};
use crate::watcher::{self, InvoiceWatchers};
use crate::{Amount, Result, SubscriptionError};

/// Panel expiry may trail the expected value by this much before it is
/// reported as an inconsistency (the panel stores whole days).
const EXPIRY_TOLERANCE_HOURS: i64 = 24;

/// What observed the payment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettleTrigger {
    Webhook,
    Poll,
    Manual,
    Resume,
}

impl SettleTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettleTrigger::Webhook => "webhook",
            SettleTrigger::Poll => "poll",
            SettleTrigger::Manual => "manual",
            SettleTrigger::Resume => "resume",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrantKind {
    /// New panel user.
    Created,
    /// Panel user already existed; its URI was recovered.
    Recovered,
    /// Existing entitlement extended with this rung.
    Extended(ExtendStrategy),
    /// Panel user created again after a recreate deleted it; the remaining
    /// days were carried over and the credential changed.
    Restored,
}

impl GrantKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantKind::Created => "created",
            GrantKind::Recovered => "recovered",
            GrantKind::Extended(_) => "extended",
            GrantKind::Restored => "restored",
        }
    }
}

/// A committed grant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrantReport {
    pub account: AccountId,
    pub kind: GrantKind,
    pub expires_at: DateTime<Utc>,
    pub credential_uri: Option<String>,
    /// The URI the account had before no longer works.
    pub credential_rotated: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SettleOutcome {
    Granted(GrantReport),
    /// Nothing to do; the invoice was closed earlier.
    AlreadySettled(InvoiceOutcome),
    /// Grant failed; a retry record holds it.
    Queued { grant_id: String, attempts_left: u32 },
    UnknownInvoice,
}

/// Webhook acknowledgement. Always HTTP 200 so the provider never retries;
/// the variant only feeds logs and metrics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WebhookAck {
    Malformed,
    Ignored,
    Processed(SettleOutcome),
    /// Settlement errored before a retry record could be written; the
    /// invoice stays open and its poller will pick it up.
    Failed,
}

impl WebhookAck {
    pub fn http_status(&self) -> u16 {
        200
    }

    pub fn body(&self) -> &'static str {
        "OK"
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PaymentCheck {
    Settled(SettleOutcome),
    Pending,
    Expired,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryOutcome {
    Granted(GrantReport),
    Failed { attempts_left: u32 },
    Escalated,
    /// Someone else already applied or resolved the grant.
    AlreadyResolved,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PromoGrant {
    Granted(GrantReport),
    Queued { grant_id: String, attempts_left: u32 },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResumeReport {
    /// Pending invoices whose poll timers were re-armed.
    pub rearmed: usize,
    /// Paid invoices granted during resume.
    pub settled: usize,
    /// Paid invoices left with (or moved to) the retry queue.
    pub queued: usize,
    /// Paid invoices whose grant was already committed; closed without
    /// calling the panel.
    pub closed: usize,
    pub failed: usize,
}

/// Returned by [`ReconciliationEngine::open_invoice`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvoiceHandle {
    pub invoice_id: InvoiceId,
    pub pay_url: String,
    pub asset: String,
    pub amount: Amount,
    pub expires_at: DateTime<Utc>,
}

/// Read projection for the UI layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntitlementStatus {
    pub account: AccountId,
    pub active: bool,
    pub expires_at: DateTime<Utc>,
    pub days_left: i64,
    pub credential_uri: Option<String>,
    pub quota_gb: u64,
    pub device_count: usize,
    pub device_limit: usize,
    pub promo_code: Option<String>,
}

pub struct ReconciliationEngine {
    config: EngineConfig,
    panel: Arc<dyn ProvisioningClient>,
    payments: Arc<dyn PaymentProvider>,
    subscriptions: Arc<dyn SubscriptionStore>,
    invoices: Arc<dyn InvoiceLedger>,
    devices: Arc<dyn DeviceRegistry>,
    promos: Arc<dyn PromoLedger>,
    retries: Arc<GrantRetryQueue>,
    notifier: Arc<dyn Notifier>,
    locks: AccountLocks,
    watchers: InvoiceWatchers,
}

impl ReconciliationEngine {
    pub fn new(
        config: EngineConfig,
        panel: Arc<dyn ProvisioningClient>,
        payments: Arc<dyn PaymentProvider>,
        stores: Stores,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            panel,
            payments,
            subscriptions: stores.subscriptions,
            invoices: stores.invoices,
            devices: stores.devices,
            promos: stores.promos,
            retries: stores.retries,
            notifier,
            locks: AccountLocks::new(),
            watchers: InvoiceWatchers::new(),
        })
    }

    /// Open the stores under `config.data_dir` and build an engine.
    pub fn open(
        config: EngineConfig,
        panel: Arc<dyn ProvisioningClient>,
        payments: Arc<dyn PaymentProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Arc<Self>> {
        let stores = Stores::open(&config)?;
        Ok(Self::new(config, panel, payments, stores, notifier))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscriptions(&self) -> &Arc<dyn SubscriptionStore> {
        &self.subscriptions
    }

    pub fn invoices(&self) -> &Arc<dyn InvoiceLedger> {
        &self.invoices
    }

    pub fn device_registry(&self) -> &Arc<dyn DeviceRegistry> {
        &self.devices
    }

    pub fn promos(&self) -> &Arc<dyn PromoLedger> {
        &self.promos
    }

    pub fn retries(&self) -> &Arc<GrantRetryQueue> {
        &self.retries
    }

    pub fn watchers(&self) -> &InvoiceWatchers {
        &self.watchers
    }

    pub(crate) fn panel(&self) -> &Arc<dyn ProvisioningClient> {
        &self.panel
    }

    pub(crate) fn payments(&self) -> &Arc<dyn PaymentProvider> {
        &self.payments
    }

    pub(crate) fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub(crate) fn locks(&self) -> &AccountLocks {
        &self.locks
    }

    // =========================================================================
    // Invoices
    // =========================================================================

    /// Create an invoice for one grant period, record it and start polling.
    pub async fn open_invoice(self: &Arc<Self>, account: AccountId, asset: &str) -> Result<InvoiceHandle> {
        let asset = asset.trim().to_ascii_uppercase();
        let amount = self.config.prices.price(&asset).ok_or_else(|| {
            SubscriptionError::InvalidArgument(format!("unsupported asset {}", asset))
        })?;

        let request = InvoiceRequest {
            asset: asset.clone(),
            amount: amount.to_string(),
            description: self.config.invoice_description.clone(),
            payload: account.to_string(),
            expires_in_secs: self.config.invoice_window_secs(),
        };
        let created = self
            .payments
            .create_invoice(&request)
            .await
            .map_err(SubscriptionError::from)?;

        let window = Duration::milliseconds(self.config.invoice_window_ms as i64);
        let invoice = PendingInvoice::new(created.invoice_id.clone(), account, asset, amount, window)
            .with_pay_url(created.pay_url.clone());
        self.invoices.record(invoice.clone()).await?;
        info!(
            invoice_id = %invoice.invoice_id,
            %account,
            asset = %invoice.asset,
            amount = %amount,
            "invoice recorded"
        );

        let handle = InvoiceHandle {
            invoice_id: invoice.invoice_id.clone(),
            pay_url: created.pay_url,
            asset: invoice.asset.clone(),
            amount,
            expires_at: invoice.expires_at,
        };
        self.watch(invoice);
        Ok(handle)
    }

    fn watch(self: &Arc<Self>, invoice: PendingInvoice) {
        let id = invoice.invoice_id.clone();
        self.watchers
            .spawn(id, watcher::watch_invoice(self.clone(), invoice));
    }

    /// Provider push. Always acknowledged.
    pub async fn handle_webhook(&self, body: &[u8]) -> WebhookAck {
        let update = match WebhookUpdate::parse(body) {
            Ok(update) => update,
            Err(e) => {
                warn!(error = %e, "malformed webhook body");
                return WebhookAck::Malformed;
            }
        };
        let Some(invoice_id) = update.settled_invoice().cloned() else {
            debug!(
                update_type = %update.update_type,
                status = %update.payload.status,
                "webhook ignored"
            );
            return WebhookAck::Ignored;
        };

        match self.settle(&invoice_id, SettleTrigger::Webhook).await {
            Ok(outcome) => WebhookAck::Processed(outcome),
            Err(e) => {
                error!(%invoice_id, error = %format!("{:#}", e), "webhook settlement failed");
                WebhookAck::Failed
            }
        }
    }

    /// Settle a paid invoice. Safe to call any number of times from any
    /// trigger; at most one grant is applied per invoice.
    pub async fn settle(&self, invoice_id: &InvoiceId, trigger: SettleTrigger) -> Result<SettleOutcome> {
        let account = match self.invoices.get(invoice_id).await? {
            Some(invoice) => invoice.account,
            None => match self.invoices.outcome(invoice_id).await? {
                Some(InvoiceOutcome::Expired) if trigger != SettleTrigger::Resume => {
                    match self.invoices.reopen_paid(invoice_id).await? {
                        Some(invoice) => {
                            warn!(
                                %invoice_id,
                                account = %invoice.account,
                                trigger = trigger.as_str(),
                                "payment arrived after the window closed, granting anyway"
                            );
                            invoice.account
                        }
                        None => match self.invoices.get(invoice_id).await? {
                            Some(invoice) => invoice.account,
                            None => return self.closed_outcome(invoice_id).await,
                        },
                    }
                }
                Some(outcome) => {
                    debug!(%invoice_id, outcome = outcome.as_str(), trigger = trigger.as_str(), "invoice already settled");
                    return Ok(SettleOutcome::AlreadySettled(outcome));
                }
                None => {
                    warn!(%invoice_id, trigger = trigger.as_str(), "settlement for unknown invoice");
                    return Ok(SettleOutcome::UnknownInvoice);
                }
            },
        };

        let _guard = self.locks.lock(account).await;

        if let Some(outcome) = self.invoices.outcome(invoice_id).await? {
            debug!(%invoice_id, outcome = outcome.as_str(), "invoice settled concurrently");
            return Ok(SettleOutcome::AlreadySettled(outcome));
        }
        let Some(invoice) = self.invoices.get(invoice_id).await? else {
            return Ok(SettleOutcome::UnknownInvoice);
        };
        if trigger != SettleTrigger::Poll {
            self.watchers.cancel(invoice_id);
        }

        let source = GrantSource::Invoice(invoice_id.clone());
        let key = source.to_string();
        if self.already_applied(account, &key).await? {
            warn!(%invoice_id, %account, "grant for this invoice was already committed, closing it");
            self.invoices.remove(invoice_id, InvoiceOutcome::Granted).await?;
            if let Some(retry) = self.retries.find_by_source(account, &source) {
                self.retries.resolve(&retry.grant_id)?;
            }
            return Ok(SettleOutcome::AlreadySettled(InvoiceOutcome::Granted));
        }
        if invoice.state == InvoiceState::Paid {
            if let Some(retry) = self.retries.find_by_source(account, &source) {
                debug!(%invoice_id, grant_id = %retry.grant_id, "grant already queued for retry");
                return Ok(SettleOutcome::Queued {
                    attempts_left: retry.attempts_left(self.retries.max_attempts()),
                    grant_id: retry.grant_id,
                });
            }
        }

        self.invoices.mark_paid(invoice_id).await?;
        info!(%invoice_id, %account, trigger = trigger.as_str(), "invoice paid");

        let days = self.config.grant_days;
        let quota_gb = self.config.grant_quota_gb;
        match self.grant_locked(account, days, quota_gb, None, Some(key)).await {
            Ok(report) => {
                self.invoices.remove(invoice_id, InvoiceOutcome::Granted).await?;
                Ok(SettleOutcome::Granted(report))
            }
            Err(err) => {
                let retry = self.queue_failure(account, source, days, quota_gb, &err).await?;
                Ok(SettleOutcome::Queued {
                    attempts_left: retry.attempts_left(self.retries.max_attempts()),
                    grant_id: retry.grant_id,
                })
            }
        }
    }

    async fn closed_outcome(&self, invoice_id: &InvoiceId) -> Result<SettleOutcome> {
        Ok(match self.invoices.outcome(invoice_id).await? {
            Some(outcome) => SettleOutcome::AlreadySettled(outcome),
            None => SettleOutcome::UnknownInvoice,
        })
    }

    /// Manual "check payment": ask the provider now.
    pub async fn check_payment(&self, invoice_id: &InvoiceId) -> Result<PaymentCheck> {
        let status = self
            .payments
            .invoice_status(invoice_id)
            .await
            .map_err(SubscriptionError::from)?;
        match status {
            Some(InvoiceStatus::Paid) => Ok(PaymentCheck::Settled(
                self.settle(invoice_id, SettleTrigger::Manual).await?,
            )),
            Some(InvoiceStatus::Expired) => {
                self.watchers.cancel(invoice_id);
                self.close_expired(invoice_id).await?;
                Ok(PaymentCheck::Expired)
            }
            Some(_) => Ok(PaymentCheck::Pending),
            None => Ok(PaymentCheck::Unknown),
        }
    }

    /// Window elapsed: one last provider check, then close as expired.
    /// Returns true if the invoice was closed as expired.
    pub async fn expire_invoice(&self, invoice_id: &InvoiceId) -> Result<bool> {
        match self.payments.invoice_status(invoice_id).await {
            Ok(Some(InvoiceStatus::Paid)) => {
                self.settle(invoice_id, SettleTrigger::Poll).await?;
                return Ok(false);
            }
            Ok(_) => {}
            Err(e) => warn!(%invoice_id, error = %e, "final status check failed, expiring anyway"),
        }
        self.close_expired(invoice_id).await
    }

    async fn close_expired(&self, invoice_id: &InvoiceId) -> Result<bool> {
        let Some(invoice) = self.invoices.get(invoice_id).await? else {
            return Ok(false);
        };
        let _guard = self.locks.lock(invoice.account).await;
        match self.invoices.get(invoice_id).await? {
            Some(invoice) if invoice.state == InvoiceState::Pending => {
                self.invoices.remove(invoice_id, InvoiceOutcome::Expired).await?;
                info!(%invoice_id, account = %invoice.account, "payment window closed");
                self.notifier
                    .notify(Notice::PaymentWindowClosed {
                        account: invoice.account,
                        invoice_id: invoice_id.clone(),
                    })
                    .await;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Reload open invoices after a restart.
    ///
    /// Pending invoices get their poll timers back, measured from when they
    /// were created. Paid invoices with a retry record stay queued; paid
    /// invoices without one were interrupted mid-grant and are settled now.
    /// Reserved grants that never finished an attempt are retried.
    pub async fn resume(self: &Arc<Self>) -> Result<ResumeReport> {
        let mut report = ResumeReport::default();
        for invoice in self.invoices.list_pending().await? {
            let id = invoice.invoice_id.clone();
            let account = invoice.account;
            match invoice.state {
                InvoiceState::Pending => {
                    self.watch(invoice);
                    report.rearmed += 1;
                }
                InvoiceState::Paid => {
                    let source = GrantSource::Invoice(id.clone());
                    if self.retries.find_by_source(account, &source).is_some() {
                        report.queued += 1;
                        continue;
                    }
                    match self.settle(&id, SettleTrigger::Resume).await {
                        Ok(SettleOutcome::Granted(_)) => report.settled += 1,
                        Ok(SettleOutcome::Queued { .. }) => report.queued += 1,
                        Ok(SettleOutcome::AlreadySettled(InvoiceOutcome::Granted)) => report.closed += 1,
                        Ok(_) => {}
                        Err(e) => {
                            error!(invoice_id = %id, error = %format!("{:#}", e), "resume settlement failed");
                            report.failed += 1;
                        }
                    }
                }
            }
        }
        for record in self.retries.interrupted() {
            match self.retry_grant(&record.grant_id).await {
                Ok(RetryOutcome::Granted(_)) => report.settled += 1,
                Ok(RetryOutcome::Failed { .. }) | Ok(RetryOutcome::Escalated) => report.queued += 1,
                Ok(RetryOutcome::AlreadyResolved) => report.closed += 1,
                Err(e) => {
                    error!(grant_id = %record.grant_id, error = %format!("{:#}", e), "resume of reserved grant failed");
                    report.failed += 1;
                }
            }
        }
        info!(
            rearmed = report.rearmed,
            settled = report.settled,
            queued = report.queued,
            closed = report.closed,
            failed = report.failed,
            "invoice tracking resumed"
        );
        Ok(report)
    }

    /// Stop every poll timer. Open invoices stay in the ledger.
    pub fn shutdown(&self) -> usize {
        self.watchers.cancel_all()
    }

    // =========================================================================
    // Grants
    // =========================================================================

    /// Grant `days` to an account outside of any invoice (admin gift).
    pub async fn grant(&self, account: AccountId, days: u32, quota_gb: u64) -> Result<GrantReport> {
        let _guard = self.locks.lock(account).await;
        match self.grant_locked(account, days, quota_gb, None, None).await {
            Ok(report) => Ok(report),
            Err(err) => {
                self.queue_failure(account, GrantSource::Manual, days, quota_gb, &err)
                    .await?;
                Err(err)
            }
        }
    }

    /// User-facing retry of a queued grant.
    pub async fn retry_grant(&self, grant_id: &str) -> Result<RetryOutcome> {
        let record = self
            .retries
            .get(grant_id)
            .ok_or_else(|| SubscriptionError::NotFound(format!("grant retry {}", grant_id)))?;
        if record.is_escalated() {
            return Ok(RetryOutcome::Escalated);
        }

        let _guard = self.locks.lock(record.account).await;
        let Some(record) = self.retries.get(grant_id) else {
            return Ok(RetryOutcome::AlreadyResolved);
        };
        if record.is_escalated() {
            return Ok(RetryOutcome::Escalated);
        }
        if let GrantSource::Invoice(id) = &record.source {
            if self.invoices.outcome(id).await? == Some(InvoiceOutcome::Granted) {
                self.retries.resolve(grant_id)?;
                return Ok(RetryOutcome::AlreadyResolved);
            }
        }
        let key = grant_key(&record);
        if self.already_applied(record.account, &key).await? {
            info!(grant_id, account = %record.account, "grant was already committed");
            self.close_granted_source(&record.source).await?;
            self.retries.resolve(grant_id)?;
            return Ok(RetryOutcome::AlreadyResolved);
        }
        if let GrantSource::Promo(code) = &record.source {
            if !self.promos.has_redeemed(record.account, code).await? {
                warn!(grant_id, account = %record.account, code = %code, "reserved promo grant has no redemption, dropping it");
                self.retries.resolve(grant_id)?;
                return Ok(RetryOutcome::AlreadyResolved);
            }
        }

        info!(grant_id, account = %record.account, attempt = record.attempts + 1, "retrying grant");
        let promo = match &record.source {
            GrantSource::Promo(code) => Some(code.clone()),
            _ => None,
        };
        match self
            .grant_locked(record.account, record.days, record.quota_gb, promo, Some(key))
            .await
        {
            Ok(report) => {
                self.close_granted_source(&record.source).await?;
                self.retries.resolve(grant_id)?;
                info!(grant_id, account = %record.account, "queued grant applied");
                Ok(RetryOutcome::Granted(report))
            }
            Err(err) => {
                let record = self.retries.record_failure(grant_id, &err)?;
                self.notify_failure(&record).await;
                if record.is_escalated() {
                    Ok(RetryOutcome::Escalated)
                } else {
                    Ok(RetryOutcome::Failed {
                        attempts_left: record.attempts_left(self.retries.max_attempts()),
                    })
                }
            }
        }
    }

    /// Redeem a promo code and grant its terms.
    ///
    /// A retry record is reserved before the redemption is written, so a
    /// used activation always has a grant or a retry behind it.
    pub async fn redeem_promo(&self, account: AccountId, code: &str) -> Result<PromoGrant> {
        let code = normalize_code(code);
        let source = GrantSource::Promo(code.clone());
        let _guard = self.locks.lock(account).await;

        if self.retries.find_by_source(account, &source).is_some() {
            return Err(SubscriptionError::DuplicateRedemption { account, code }.into());
        }
        let Some(terms) = self.promos.get_code(&code).await? else {
            return Err(SubscriptionError::NotFound(format!("promo code {}", code)).into());
        };
        let reserved = self.retries.reserve(
            account,
            source.clone(),
            terms.grant_days,
            terms.grant_quota_gb,
        )?;

        let redeemed = self
            .promos
            .redeem(account, &code)
            .await
            .and_then(|outcome| outcome.into_result(account, &code));
        let (days, quota_gb) = match redeemed {
            Ok(granted) => granted,
            Err(err) => {
                self.retries.resolve(&reserved.grant_id)?;
                return Err(err);
            }
        };
        let grant_id = if (days, quota_gb) == (reserved.days, reserved.quota_gb) {
            reserved.grant_id
        } else {
            self.retries.reserve(account, source.clone(), days, quota_gb)?.grant_id
        };

        match self
            .grant_locked(account, days, quota_gb, Some(code), Some(source.to_string()))
            .await
        {
            Ok(report) => {
                self.retries.resolve(&grant_id)?;
                Ok(PromoGrant::Granted(report))
            }
            Err(err) => {
                let retry = self.retries.record_failure(&grant_id, &err)?;
                self.notify_failure(&retry).await;
                Ok(PromoGrant::Queued {
                    attempts_left: retry.attempts_left(self.retries.max_attempts()),
                    grant_id: retry.grant_id,
                })
            }
        }
    }

    async fn already_applied(&self, account: AccountId, key: &str) -> Result<bool> {
        Ok(self
            .subscriptions
            .get(account)
            .await?
            .is_some_and(|sub| sub.has_applied(key)))
    }

    /// Close the invoice behind a grant that has been committed.
    async fn close_granted_source(&self, source: &GrantSource) -> Result<()> {
        if let GrantSource::Invoice(id) = source {
            if self.invoices.get(id).await?.is_some() {
                self.invoices.remove(id, InvoiceOutcome::Granted).await?;
            }
        }
        Ok(())
    }

    async fn queue_failure(
        &self,
        account: AccountId,
        source: GrantSource,
        days: u32,
        quota_gb: u64,
        err: &anyhow::Error,
    ) -> Result<GrantRetry> {
        let record = self.retries.enqueue(account, source, days, quota_gb, err)?;
        self.notify_failure(&record).await;
        Ok(record)
    }

    async fn notify_failure(&self, record: &GrantRetry) {
        let notice = if record.is_escalated() {
            Notice::Escalated {
                account: record.account,
                grant_id: record.grant_id.clone(),
            }
        } else {
            Notice::GrantFailed {
                account: record.account,
                grant_id: record.grant_id.clone(),
                attempts_left: record.attempts_left(self.retries.max_attempts()),
            }
        };
        self.notifier.notify(notice).await;
    }

    /// Create, extend or restore. Caller holds the account lock.
    ///
    /// `grant_key` is committed in the same upsert as the grant, which is
    /// what makes a replayed settlement recognisable.
    async fn grant_locked(
        &self,
        account: AccountId,
        days: u32,
        quota_gb: u64,
        promo_code: Option<String>,
        grant_key: Option<String>,
    ) -> Result<GrantReport> {
        match self.subscriptions.get(account).await? {
            None => {
                self.create_entitlement(account, days, quota_gb, promo_code, grant_key)
                    .await
            }
            Some(existing) if existing.restore_pending => {
                self.restore_entitlement(existing, days, promo_code, grant_key)
                    .await
            }
            Some(existing) => {
                self.extend_entitlement(existing, days, promo_code, grant_key)
                    .await
            }
        }
    }

    /// Create the panel user, recovering from a conflict, and wait for its URI.
    async fn provision_user(
        &self,
        account: AccountId,
        username: &str,
        quota_gb: u64,
        days: u32,
    ) -> Result<(GrantKind, Option<String>)> {
        let (kind, uri) = match self.panel.create(username, quota_gb, days).await {
            Ok(provisioned) => (GrantKind::Created, provisioned.credential_uri),
            Err(TunnelkitError::AlreadyExists { .. }) => {
                info!(%account, username, "panel user already exists, recovering");
                let entitlement = self
                    .panel
                    .fetch(username)
                    .await
                    .map_err(SubscriptionError::from)?;
                if entitlement.is_none() {
                    warn!(%account, username, "panel reported a conflict but has no such user");
                }
                (GrantKind::Recovered, entitlement.and_then(|e| e.uri))
            }
            Err(e) => return Err(SubscriptionError::from(e).into()),
        };

        let ip_limit = u32::try_from(self.devices.limit()).unwrap_or(u32::MAX);
        if let Err(e) = self.panel.set_ip_limit(username, ip_limit).await {
            warn!(%account, username, error = %e, "could not apply ip limit");
        }

        let uri = match uri.filter(|u| !u.is_empty()) {
            Some(uri) => Some(uri),
            None => self.await_uri(username).await,
        };
        Ok((kind, uri))
    }

    async fn create_entitlement(
        &self,
        account: AccountId,
        days: u32,
        quota_gb: u64,
        promo_code: Option<String>,
        grant_key: Option<String>,
    ) -> Result<GrantReport> {
        let username = account.username(&self.config.username_prefix);
        let (kind, uri) = self.provision_user(account, &username, quota_gb, days).await?;

        let expires_at = Utc::now() + Duration::days(i64::from(days));
        let committed = self
            .subscriptions
            .upsert(
                SubscriptionPatch::new(account)
                    .username(username.clone())
                    .credential_uri(uri)
                    .extend_to(expires_at)
                    .quota_gb(quota_gb)
                    .active(true)
                    .promo_code(promo_code)
                    .applied_grant(grant_key),
            )
            .await?;

        info!(
            %account,
            username = %username,
            kind = kind.as_str(),
            expires_at = %committed.expires_at,
            has_uri = committed.credential_uri.is_some(),
            "entitlement granted"
        );
        self.notifier
            .notify(Notice::Granted {
                account,
                expires_at: committed.expires_at,
                credential_uri: committed.credential_uri.clone(),
            })
            .await;

        Ok(GrantReport {
            account,
            kind,
            expires_at: committed.expires_at,
            credential_uri: committed.credential_uri,
            credential_rotated: false,
        })
    }

    /// Create the panel user again after a recreate deleted it, carrying
    /// over the days the account still had.
    async fn restore_entitlement(
        &self,
        existing: Subscription,
        days: u32,
        promo_code: Option<String>,
        grant_key: Option<String>,
    ) -> Result<GrantReport> {
        let account = existing.account;
        let username = existing.username.clone();
        let now = Utc::now();
        let carried = u32::try_from(existing.days_left(now)).unwrap_or(0);
        warn!(
            %account,
            username = %username,
            carried_days = carried,
            days,
            "panel user missing after recreate, creating it again"
        );
        let (_, uri) = self
            .provision_user(account, &username, existing.quota_gb, carried.saturating_add(days))
            .await?;

        let expires_at = existing.expires_at.max(now) + Duration::days(i64::from(days));
        let committed = self
            .subscriptions
            .upsert(
                SubscriptionPatch::new(account)
                    .credential_uri(uri)
                    .extend_to(expires_at)
                    .active(true)
                    .promo_code(promo_code)
                    .applied_grant(grant_key)
                    .restore_pending(false),
            )
            .await?;
        let rotated = committed.credential_uri.is_some()
            && committed.credential_uri != existing.credential_uri;
        if committed.credential_uri.is_none() {
            error!(%account, username = %username, "panel user restored but the new uri is not available yet");
        }

        info!(
            %account,
            username = %username,
            expires_at = %committed.expires_at,
            rotated,
            "entitlement restored"
        );
        self.notify_extended(&committed, rotated).await;

        Ok(GrantReport {
            account,
            kind: GrantKind::Restored,
            expires_at: committed.expires_at,
            credential_uri: committed.credential_uri,
            credential_rotated: rotated,
        })
    }

    async fn extend_entitlement(
        &self,
        existing: Subscription,
        days: u32,
        promo_code: Option<String>,
        grant_key: Option<String>,
    ) -> Result<GrantReport> {
        let account = existing.account;
        let username = existing.username.clone();
        let outcome = match self.panel.extend(&username, days).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_recreate_incomplete() => {
                error!(%account, username = %username, error = %e, "recreate left no panel user");
                let flagged = self
                    .subscriptions
                    .upsert(SubscriptionPatch::new(account).restore_pending(true))
                    .await?;
                return self
                    .restore_entitlement(flagged, days, promo_code, grant_key)
                    .await;
            }
            Err(e) => return Err(SubscriptionError::from(e).into()),
        };

        let now = Utc::now();
        let authority = match self.panel.fetch(&username).await {
            Ok(Some(entitlement)) => Some(entitlement),
            Ok(None) => {
                warn!(%account, username = %username, "panel lost the user right after extending it");
                None
            }
            Err(e) => {
                warn!(%account, username = %username, error = %e, "could not re-read entitlement after extension");
                None
            }
        };

        // Added days count from now for a lapsed subscription.
        let expected = existing.expires_at.max(now) + Duration::days(i64::from(days));
        let new_expiry = match authority.as_ref().map(|e| e.expiry(now)) {
            Some(at) => {
                if at < expected - Duration::hours(EXPIRY_TOLERANCE_HOURS) {
                    let inconsistency = SubscriptionError::DataInconsistency(format!(
                        "panel expiry {} is behind expected {}",
                        at, expected
                    ));
                    warn!(%account, username = %username, error = %inconsistency, "keeping the later expiry");
                }
                at.max(expected)
            }
            None => expected,
        };

        let reported_uri = authority.as_ref().and_then(|e| e.uri.clone());
        let uri = if outcome.credential_lost {
            match reported_uri {
                Some(uri) => Some(uri),
                None => self.await_uri(&username).await,
            }
        } else {
            match reported_uri {
                Some(uri) if existing.credential_uri.as_deref() != Some(uri.as_str()) => Some(uri),
                Some(_) => None,
                None if existing.credential_uri.is_none() => self.panel.get_uri(&username).await.ok(),
                None => None,
            }
        };
        if outcome.credential_lost && uri.is_none() {
            error!(%account, username = %username, "credential was recreated but the new uri is not available yet");
        }
        let rotated = match (&existing.credential_uri, &uri) {
            (Some(old), Some(new)) => old != new,
            _ => false,
        };

        let mut patch = SubscriptionPatch::new(account)
            .credential_uri(uri)
            .extend_to(new_expiry)
            .active(true)
            .promo_code(promo_code)
            .applied_grant(grant_key);
        if let Some(entitlement) = &authority {
            patch = patch.quota_gb(entitlement.quota_gb());
        }
        let committed = self.subscriptions.upsert(patch).await?;

        info!(
            %account,
            username = %username,
            strategy = outcome.strategy.as_str(),
            expires_at = %committed.expires_at,
            rotated,
            "entitlement extended"
        );
        self.notify_extended(&committed, rotated).await;

        Ok(GrantReport {
            account,
            kind: GrantKind::Extended(outcome.strategy),
            expires_at: committed.expires_at,
            credential_uri: committed.credential_uri,
            credential_rotated: rotated,
        })
    }

    async fn notify_extended(&self, committed: &Subscription, rotated: bool) {
        self.notifier
            .notify(Notice::Extended {
                account: committed.account,
                expires_at: committed.expires_at,
                credential_uri: committed.credential_uri.clone(),
            })
            .await;
        if rotated {
            if let Some(uri) = &committed.credential_uri {
                self.notifier
                    .notify(Notice::CredentialRotated {
                        account: committed.account,
                        credential_uri: uri.clone(),
                    })
                    .await;
            }
        }
    }

    /// Poll `get_uri` with backoff while the panel materializes a credential.
    async fn await_uri(&self, username: &str) -> Option<String> {
        let result = with_retry(&self.config.uri_retry, "get_uri", || {
            let panel = self.panel.clone();
            let username = username.to_string();
            async move { panel.get_uri(&username).await }
        })
        .await;
        match result {
            Ok(uri) => Some(uri),
            Err(e) => {
                warn!(username, error = %e, "credential uri not available, drift sync will fill it in");
                None
            }
        }
    }

    // =========================================================================
    // Read projections
    // =========================================================================

    pub async fn entitlement_status(&self, account: AccountId) -> Result<Option<EntitlementStatus>> {
        let Some(sub) = self.subscriptions.get(account).await? else {
            return Ok(None);
        };
        let now = Utc::now();
        let device_count = self.devices.list(account).await?.len();
        Ok(Some(EntitlementStatus {
            account,
            active: sub.is_active(now),
            expires_at: sub.expires_at,
            days_left: sub.days_left(now),
            credential_uri: sub.credential_uri,
            quota_gb: sub.quota_gb,
            device_count,
            device_limit: self.devices.limit(),
            promo_code: sub.promo_code,
        }))
    }

    pub async fn devices(&self, account: AccountId) -> Result<Vec<Device>> {
        self.devices.list(account).await
    }

    pub async fn has_redeemed(&self, account: AccountId, code: &str) -> Result<bool> {
        self.promos.has_redeemed(account, code).await
    }

    /// Queued grants for an account, oldest first.
    pub fn pending_grants(&self, account: AccountId) -> Vec<GrantRetry> {
        self.retries.for_account(account)
    }

    /// Probe both external services.
    pub async fn health(&self) -> Vec<HealthCheckResult> {
        let (panel, payments) = tokio::join!(self.panel.health(), self.payments.health());
        vec![panel, payments]
    }
}

/// Key committed with a grant so a replay of the same source is detected.
fn grant_key(record: &GrantRetry) -> String {
    match record.source {
        GrantSource::Manual => format!("grant:{}", record.grant_id),
        _ => record.source.to_string(),
    }
}
