//! Periodic reconciliation of local subscriptions against the panel.
//!
//! The panel is authoritative for expiry, quota and credential URI. A
//! "not found" from the panel is ambiguous (the panel is flaky), so it is
//! logged and the local record is left alone.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tunnelkit_lib::AccountId;

use crate::engine::ReconciliationEngine;
use crate::notify::Notice;
use crate::subscription::SubscriptionPatch;
use crate::{Result, SubscriptionError};

/// Local expiry within this many seconds of the panel's counts as in sync.
const EXPIRY_TOLERANCE_SECS: i64 = 60;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub checked: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Panel had no such user; local record kept.
    pub missing: usize,
    pub failed: usize,
    /// Accounts whose credential URI changed on the panel.
    pub rotated: usize,
}

enum AccountSync {
    Updated { rotated: bool },
    Unchanged,
    Missing,
}

/// Background drift sync.
pub struct DriftSync {
    engine: Arc<ReconciliationEngine>,
    interval: Duration,
}

impl DriftSync {
    pub fn new(engine: Arc<ReconciliationEngine>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// Use the engine's configured sync interval.
    pub fn with_default_interval(engine: Arc<ReconciliationEngine>) -> Self {
        let interval = engine.config().sync_interval();
        Self::new(engine, interval)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run forever.
    pub async fn start(&self) -> Result<()> {
        loop {
            match self.run_once().await {
                Ok(report) => info!(
                    checked = report.checked,
                    updated = report.updated,
                    unchanged = report.unchanged,
                    missing = report.missing,
                    failed = report.failed,
                    rotated = report.rotated,
                    "drift sync finished"
                ),
                Err(e) => warn!(error = %format!("{:#}", e), "drift sync failed"),
            }

            sleep(self.interval).await;
        }
    }

    /// Run [`start`](Self::start) on the runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let _ = self.start().await;
        })
    }

    /// One pass over every known subscription.
    pub async fn run_once(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        for sub in self.engine.subscriptions().list().await? {
            report.checked += 1;
            match self.sync_account(sub.account).await {
                Ok(AccountSync::Updated { rotated }) => {
                    report.updated += 1;
                    if rotated {
                        report.rotated += 1;
                    }
                }
                Ok(AccountSync::Unchanged) => report.unchanged += 1,
                Ok(AccountSync::Missing) => report.missing += 1,
                Err(e) => {
                    warn!(account = %sub.account, error = %format!("{:#}", e), "drift check failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn sync_account(&self, account: AccountId) -> Result<AccountSync> {
        let engine = &self.engine;
        let _guard = engine.locks().lock(account).await;
        let Some(local) = engine.subscriptions().get(account).await? else {
            return Ok(AccountSync::Unchanged);
        };

        let fetched = engine
            .panel()
            .fetch(&local.username)
            .await
            .map_err(SubscriptionError::from)?;
        let Some(remote) = fetched else {
            warn!(%account, username = %local.username, "panel has no such user, keeping local record");
            return Ok(AccountSync::Missing);
        };

        let now = Utc::now();
        let remote_expiry = remote.expiry(now);
        let mut patch = SubscriptionPatch::new(account);
        let mut changed = false;

        if (remote_expiry - local.expires_at).num_seconds().abs() > EXPIRY_TOLERANCE_SECS {
            debug!(%account, local = %local.expires_at, remote = %remote_expiry, "expiry drift");
            patch = patch.authoritative_expiry(remote_expiry);
            changed = true;
        }
        if remote.quota_gb() != local.quota_gb {
            patch = patch.quota_gb(remote.quota_gb());
            changed = true;
        }
        let active = remote_expiry > now;
        if active != local.active {
            patch = patch.active(active);
            changed = true;
        }

        let remote_uri = match remote.uri.clone() {
            Some(uri) => Some(uri),
            None => match engine.panel().get_uri(&local.username).await {
                Ok(uri) => Some(uri),
                Err(e) => {
                    debug!(%account, error = %e, "uri lookup failed during sync");
                    None
                }
            },
        };
        let mut rotated = false;
        if let Some(uri) = remote_uri.filter(|u| !u.is_empty()) {
            if local.credential_uri.as_deref() != Some(uri.as_str()) {
                rotated = local.credential_uri.is_some();
                patch = patch.credential_uri(Some(uri));
                changed = true;
            }
        }

        if !changed {
            return Ok(AccountSync::Unchanged);
        }
        let committed = engine.subscriptions().upsert(patch).await?;
        info!(
            %account,
            expires_at = %committed.expires_at,
            quota_gb = committed.quota_gb,
            active = committed.active,
            rotated,
            "subscription synced with panel"
        );
        if rotated {
            if let Some(uri) = committed.credential_uri {
                engine
                    .notifier()
                    .notify(Notice::CredentialRotated {
                        account,
                        credential_uri: uri,
                    })
                    .await;
            }
        }
        Ok(AccountSync::Updated { rotated })
    }
}
