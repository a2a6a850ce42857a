//! Promo codes and one-time redemptions.
//!
//! Redemption runs three individually atomic steps:
//! 1. refuse if `(account, code)` already redeemed, and claim the pair so a
//!    concurrent redeem by the same account sees it as taken
//! 2. conditionally bump `used` while `used < max_activations`
//! 3. record the redemption
//!
//! Step 2 reads and writes the counter under one lock and one journal
//! append, so two accounts racing for the last activation cannot both win.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use tunnelkit_lib::AccountId;

use crate::journal::JournaledMap;
use crate::{Result, SubscriptionError};

/// Promo codes are matched trimmed and uppercased.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoCode {
    pub code: String,
    pub description: String,
    pub grant_days: u32,
    /// GB (0 = unlimited).
    pub grant_quota_gb: u64,
    pub max_activations: u32,
    pub used: u32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl PromoCode {
    pub fn new(code: &str, grant_days: u32, max_activations: u32) -> Self {
        Self {
            code: normalize_code(code),
            description: String::new(),
            grant_days,
            grant_quota_gb: 0,
            max_activations,
            used: 0,
            active: true,
            created_at: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_quota(mut self, quota_gb: u64) -> Self {
        self.grant_quota_gb = quota_gb;
        self
    }

    pub fn remaining(&self) -> u32 {
        self.max_activations.saturating_sub(self.used)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoRedemption {
    pub account: AccountId,
    pub code: String,
    pub redeemed_at: DateTime<Utc>,
}

/// Result of [`PromoLedger::redeem`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedeemOutcome {
    Granted { days: u32, quota_gb: u64 },
    NotFound,
    AlreadyRedeemed,
    LimitExhausted,
}

impl RedeemOutcome {
    /// Rejections as their [`SubscriptionError`]; `Granted` passes through.
    pub fn into_result(self, account: AccountId, code: &str) -> Result<(u32, u64)> {
        match self {
            RedeemOutcome::Granted { days, quota_gb } => Ok((days, quota_gb)),
            RedeemOutcome::NotFound => {
                Err(SubscriptionError::NotFound(format!("promo code {}", code)).into())
            }
            RedeemOutcome::AlreadyRedeemed => Err(SubscriptionError::DuplicateRedemption {
                account,
                code: code.to_string(),
            }
            .into()),
            RedeemOutcome::LimitExhausted => {
                Err(SubscriptionError::RedemptionLimitExhausted(code.to_string()).into())
            }
        }
    }
}

#[async_trait]
pub trait PromoLedger: Send + Sync {
    /// Create or replace a code (admin).
    async fn upsert_code(&self, code: PromoCode) -> Result<()>;

    async fn get_code(&self, code: &str) -> Result<Option<PromoCode>>;

    async fn redeem(&self, account: AccountId, code: &str) -> Result<RedeemOutcome>;

    async fn has_redeemed(&self, account: AccountId, code: &str) -> Result<bool>;
}

type RedemptionKey = (AccountId, String);

/// Journal-backed [`PromoLedger`].
pub struct FilePromoLedger {
    codes: Mutex<JournaledMap<String, PromoCode>>,
    redemptions: Mutex<JournaledMap<RedemptionKey, PromoRedemption>>,
    in_flight: Mutex<HashSet<RedemptionKey>>,
}

/// Releases an in-flight claim when redemption finishes either way.
struct Claim<'a> {
    in_flight: &'a Mutex<HashSet<RedemptionKey>>,
    key: RedemptionKey,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        relock(self.in_flight).remove(&self.key);
    }
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl FilePromoLedger {
    /// Open `promo_codes.jsonl` and `promo_redemptions.jsonl` under `dir`.
    pub fn open(dir: impl AsRef<Path>, compact_threshold: usize) -> Result<Self> {
        let dir = dir.as_ref();
        Ok(Self {
            codes: Mutex::new(JournaledMap::open(
                dir.join("promo_codes.jsonl"),
                compact_threshold,
            )?),
            redemptions: Mutex::new(JournaledMap::open(
                dir.join("promo_redemptions.jsonl"),
                compact_threshold,
            )?),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    fn claim(&self, key: RedemptionKey) -> Option<Claim<'_>> {
        let redemptions = relock(&self.redemptions);
        if redemptions.contains_key(&key) {
            return None;
        }
        let mut in_flight = relock(&self.in_flight);
        if !in_flight.insert(key.clone()) {
            return None;
        }
        Some(Claim {
            in_flight: &self.in_flight,
            key,
        })
    }

    fn reserve(&self, code: &str) -> Result<RedeemOutcome> {
        let mut codes = relock(&self.codes);
        let Some(mut promo) = codes.get(&code.to_string()).filter(|p| p.active).cloned() else {
            return Ok(RedeemOutcome::NotFound);
        };
        if promo.used >= promo.max_activations {
            return Ok(RedeemOutcome::LimitExhausted);
        }
        promo.used += 1;
        let outcome = RedeemOutcome::Granted {
            days: promo.grant_days,
            quota_gb: promo.grant_quota_gb,
        };
        codes.insert(code.to_string(), promo)?;
        Ok(outcome)
    }

    fn release(&self, code: &str) {
        let mut codes = relock(&self.codes);
        if let Some(mut promo) = codes.get(&code.to_string()).cloned() {
            promo.used = promo.used.saturating_sub(1);
            if let Err(e) = codes.insert(code.to_string(), promo) {
                error!(code, error = %e, "failed to release promo activation");
            }
        }
    }
}

#[async_trait]
impl PromoLedger for FilePromoLedger {
    async fn upsert_code(&self, code: PromoCode) -> Result<()> {
        if code.code.is_empty() {
            return Err(SubscriptionError::InvalidArgument("empty promo code".into()).into());
        }
        let mut code = code;
        code.code = normalize_code(&code.code);
        info!(code = %code.code, max = code.max_activations, days = code.grant_days, "promo code saved");
        relock(&self.codes).insert(code.code.clone(), code)
    }

    async fn get_code(&self, code: &str) -> Result<Option<PromoCode>> {
        Ok(relock(&self.codes).get(&normalize_code(code)).cloned())
    }

    async fn redeem(&self, account: AccountId, code: &str) -> Result<RedeemOutcome> {
        let code = normalize_code(code);
        let key = (account, code.clone());

        let Some(_claim) = self.claim(key.clone()) else {
            info!(%account, code = %code, "promo already redeemed");
            return Ok(RedeemOutcome::AlreadyRedeemed);
        };

        let outcome = self.reserve(&code)?;
        if !matches!(outcome, RedeemOutcome::Granted { .. }) {
            warn!(%account, code = %code, outcome = ?outcome, "promo redemption refused");
            return Ok(outcome);
        }

        let record = PromoRedemption {
            account,
            code: code.clone(),
            redeemed_at: Utc::now(),
        };
        if let Err(e) = relock(&self.redemptions).insert(key, record) {
            self.release(&code);
            return Err(e);
        }
        info!(%account, code = %code, "promo redeemed");
        Ok(outcome)
    }

    async fn has_redeemed(&self, account: AccountId, code: &str) -> Result<bool> {
        Ok(relock(&self.redemptions).contains_key(&(account, normalize_code(code))))
    }
}
