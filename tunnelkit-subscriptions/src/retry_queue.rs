//! Durable record of grants that failed after a confirmed payment.
//!
//! A failed grant is never dropped: it becomes a [`GrantRetry`] the user can
//! retry. After `max_attempts` failures the record is escalated for manual
//! handling and further automatic or user retries are refused.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use tunnelkit_lib::{AccountId, ErrorClass, InvoiceId};

use crate::journal::JournaledMap;
use crate::{Result, SubscriptionError};

/// What paid for the grant.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantSource {
    Invoice(InvoiceId),
    Promo(String),
    Manual,
}

impl std::fmt::Display for GrantSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GrantSource::Invoice(id) => write!(f, "invoice:{}", id),
            GrantSource::Promo(code) => write!(f, "promo:{}", code),
            GrantSource::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    /// Can be retried.
    Pending,
    /// Attempts exhausted; needs an operator.
    Escalated,
}

/// One failed grant attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantAttempt {
    pub error: String,
    pub transient: bool,
    pub attempted_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantRetry {
    pub grant_id: String,
    pub account: AccountId,
    pub source: GrantSource,
    pub days: u32,
    pub quota_gb: u64,
    pub attempts: u32,
    pub last_error: String,
    pub status: RetryStatus,
    pub history: Vec<GrantAttempt>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GrantRetry {
    pub fn attempts_left(&self, max_attempts: u32) -> u32 {
        max_attempts.saturating_sub(self.attempts)
    }

    pub fn is_escalated(&self) -> bool {
        self.status == RetryStatus::Escalated
    }

    fn push_failure(&mut self, err: &anyhow::Error, max_attempts: u32) {
        let now = Utc::now();
        self.attempts += 1;
        self.last_error = format!("{:#}", err);
        self.history.push(GrantAttempt {
            error: self.last_error.clone(),
            transient: SubscriptionError::classify(err) == ErrorClass::Transient,
            attempted_at: now,
        });
        self.updated_at = now;
        if self.attempts >= max_attempts {
            self.status = RetryStatus::Escalated;
        }
    }
}

/// Journal-backed queue of [`GrantRetry`] records.
pub struct GrantRetryQueue {
    map: Mutex<JournaledMap<String, GrantRetry>>,
    max_attempts: u32,
}

impl GrantRetryQueue {
    pub fn open(path: impl AsRef<Path>, max_attempts: u32, compact_threshold: usize) -> Result<Self> {
        Ok(Self {
            map: Mutex::new(JournaledMap::open(path.as_ref(), compact_threshold)?),
            max_attempts: max_attempts.max(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, JournaledMap<String, GrantRetry>> {
        self.map.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Record a first failure, or another failure for a source that already
    /// has a record.
    pub fn enqueue(
        &self,
        account: AccountId,
        source: GrantSource,
        days: u32,
        quota_gb: u64,
        err: &anyhow::Error,
    ) -> Result<GrantRetry> {
        let mut map = self.lock();
        let existing = if source == GrantSource::Manual {
            None
        } else {
            map.values()
                .find(|r| r.account == account && r.source == source)
                .cloned()
        };

        let now = Utc::now();
        let mut record = existing.unwrap_or_else(|| GrantRetry {
            grant_id: uuid::Uuid::new_v4().to_string(),
            account,
            source,
            days,
            quota_gb,
            attempts: 0,
            last_error: String::new(),
            status: RetryStatus::Pending,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        });
        record.push_failure(err, self.max_attempts);
        map.insert(record.grant_id.clone(), record.clone())?;
        self.log_failure(&record);
        Ok(record)
    }

    /// Write a record before the grant is attempted, so a crash mid-grant
    /// leaves something to retry. An existing record for the source keeps
    /// its attempts and takes the new terms.
    pub fn reserve(
        &self,
        account: AccountId,
        source: GrantSource,
        days: u32,
        quota_gb: u64,
    ) -> Result<GrantRetry> {
        let mut map = self.lock();
        let now = Utc::now();
        let record = match map
            .values()
            .find(|r| r.account == account && r.source == source)
            .cloned()
        {
            Some(mut existing) => {
                existing.days = days;
                existing.quota_gb = quota_gb;
                existing.updated_at = now;
                existing
            }
            None => GrantRetry {
                grant_id: uuid::Uuid::new_v4().to_string(),
                account,
                source,
                days,
                quota_gb,
                attempts: 0,
                last_error: String::new(),
                status: RetryStatus::Pending,
                history: Vec::new(),
                created_at: now,
                updated_at: now,
            },
        };
        map.insert(record.grant_id.clone(), record.clone())?;
        Ok(record)
    }

    /// Count another failed attempt against an existing record.
    pub fn record_failure(&self, grant_id: &str, err: &anyhow::Error) -> Result<GrantRetry> {
        let mut map = self.lock();
        let mut record = map
            .get(&grant_id.to_string())
            .cloned()
            .ok_or_else(|| SubscriptionError::NotFound(format!("grant retry {}", grant_id)))?;
        record.push_failure(err, self.max_attempts);
        map.insert(record.grant_id.clone(), record.clone())?;
        self.log_failure(&record);
        Ok(record)
    }

    fn log_failure(&self, record: &GrantRetry) {
        if record.is_escalated() {
            error!(
                grant_id = %record.grant_id,
                account = %record.account,
                source = %record.source,
                attempts = record.attempts,
                error = %record.last_error,
                "grant escalated for manual handling"
            );
        } else {
            warn!(
                grant_id = %record.grant_id,
                account = %record.account,
                source = %record.source,
                attempts = record.attempts,
                attempts_left = record.attempts_left(self.max_attempts),
                error = %record.last_error,
                "grant failed, retry queued"
            );
        }
    }

    /// Drop a record once its grant has been committed.
    pub fn resolve(&self, grant_id: &str) -> Result<Option<GrantRetry>> {
        self.lock().remove(&grant_id.to_string())
    }

    pub fn get(&self, grant_id: &str) -> Option<GrantRetry> {
        self.lock().get(&grant_id.to_string()).cloned()
    }

    pub fn find_by_source(&self, account: AccountId, source: &GrantSource) -> Option<GrantRetry> {
        self.lock()
            .values()
            .find(|r| r.account == account && &r.source == source)
            .cloned()
    }

    /// Reserved records that never saw an attempt finish.
    pub fn interrupted(&self) -> Vec<GrantRetry> {
        self.list()
            .into_iter()
            .filter(|r| r.attempts == 0 && !r.is_escalated())
            .collect()
    }

    /// All records, oldest first.
    pub fn list(&self) -> Vec<GrantRetry> {
        let mut records: Vec<GrantRetry> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    pub fn for_account(&self, account: AccountId) -> Vec<GrantRetry> {
        self.list()
            .into_iter()
            .filter(|r| r.account == account)
            .collect()
    }

    pub fn escalated(&self) -> Vec<GrantRetry> {
        self.list().into_iter().filter(|r| r.is_escalated()).collect()
    }
}
