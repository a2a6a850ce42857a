//! Provisioning authority adapter.
//!
//! The provisioning authority (the VPN panel) is the system of record for
//! credentials. This module defines the narrow capability surface the
//! reconciliation engine needs, the entitlement record it reads back, and
//! the ordered extension ladder:
//!
//! 1. `Replace`: full update of the user's day count.
//! 2. `Patch`: partial update of the same field.
//! 3. `Recreate`: delete and create again. This one issues a new credential
//!    URI and is reported as `credential_lost`.
//!
//! # Example
//!
//! ```rust,ignore
//! use tunnelkit_lib::provisioning::{BlitzClient, PanelConfig, ProvisioningClient};
//!
//! let panel = BlitzClient::new(PanelConfig::new("https://panel:8000", "token"))?;
//! let outcome = panel.extend("vpn_42", 30).await?;
//! if outcome.credential_lost {
//!     let uri = panel.get_uri("vpn_42").await?;
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::health::HealthCheckResult;
use crate::{Result, TunnelkitError};

pub mod blitz;
pub mod config;

pub use blitz::BlitzClient;
pub use config::PanelConfig;

/// Traffic limit the panel treats as "unlimited" (i32::MAX bytes).
pub const UNLIMITED_TRAFFIC_BYTES: u64 = 2_147_483_647;

/// Convert a quota in GB (0 = unlimited) to the panel's byte limit.
pub fn quota_bytes(quota_gb: u64) -> u64 {
    if quota_gb == 0 {
        UNLIMITED_TRAFFIC_BYTES
    } else {
        quota_gb.saturating_mul(1024 * 1024 * 1024)
    }
}

/// Convert a panel byte limit back to GB (0 = unlimited).
pub fn quota_gb(traffic_bytes: u64) -> u64 {
    if traffic_bytes == 0 || traffic_bytes == UNLIMITED_TRAFFIC_BYTES {
        0
    } else {
        traffic_bytes / (1024 * 1024 * 1024)
    }
}

/// Result of a successful create.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provisioned {
    /// Panel username.
    pub username: String,
    /// Credential URI, if the panel already materialized one.
    pub credential_uri: Option<String>,
}

/// The authority's view of one user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    /// Panel username.
    pub username: String,
    /// Total day count of the entitlement, counted from creation.
    pub expiration_days: i64,
    /// Traffic limit in bytes.
    pub traffic_limit: u64,
    /// Absolute expiry, when the panel reports one.
    pub expires_at: Option<DateTime<Utc>>,
    /// Account creation time, when the panel reports one.
    pub created_at: Option<DateTime<Utc>>,
    /// Credential URI, when fetched alongside the record.
    pub uri: Option<String>,
}

impl Entitlement {
    /// Authoritative expiry.
    ///
    /// `expires_at` wins; otherwise creation date plus day count; otherwise
    /// the day count is read as remaining from `now`.
    pub fn expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(expires_at) = self.expires_at {
            return expires_at;
        }
        let base = self.created_at.unwrap_or(now);
        base + Duration::days(self.expiration_days)
    }

    /// Whole days left, rounded up; 0 once expired.
    pub fn remaining_days(&self, now: DateTime<Utc>) -> i64 {
        days_left(self.expiry(now), now)
    }

    /// Quota in GB (0 = unlimited).
    pub fn quota_gb(&self) -> u64 {
        quota_gb(self.traffic_limit)
    }
}

/// Whole days between `now` and `expiry`, rounded up; 0 once expired.
pub fn days_left(expiry: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let secs = (expiry - now).num_seconds();
    if secs <= 0 {
        0
    } else {
        (secs + 86_399) / 86_400
    }
}

/// Wire shape of a panel user record.
///
/// The panel has shipped a few field names over time; aliases cover them.
#[derive(Debug, Deserialize)]
pub(crate) struct RawUser {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub expiration_days: i64,
    #[serde(default, alias = "max_download_bytes")]
    pub traffic_limit: u64,
    #[serde(default)]
    pub expires_at: Option<String>,
    #[serde(default, alias = "account_creation_date")]
    pub created_at: Option<String>,
}

impl RawUser {
    pub(crate) fn into_entitlement(self, username: &str) -> Entitlement {
        Entitlement {
            username: self.username.unwrap_or_else(|| username.to_string()),
            expiration_days: self.expiration_days,
            traffic_limit: self.traffic_limit,
            expires_at: self.expires_at.as_deref().and_then(parse_panel_time),
            created_at: self.created_at.as_deref().and_then(parse_panel_time),
            uri: None,
        }
    }
}

/// Parse an RFC 3339 timestamp (`Z` suffix accepted) or a bare date.
pub(crate) fn parse_panel_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// One rung of the extension ladder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtendStrategy {
    /// Full update of the day count.
    Replace,
    /// Partial update of the day count.
    Patch,
    /// Delete then create. Issues a new credential.
    Recreate,
}

impl ExtendStrategy {
    /// Whether success on this rung invalidates the old credential URI.
    pub fn loses_credential(&self) -> bool {
        matches!(self, Self::Recreate)
    }

    /// Lowercase name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Patch => "patch",
            Self::Recreate => "recreate",
        }
    }
}

/// Strategies tried by [`ProvisioningClient::extend`], in order.
pub const EXTEND_LADDER: [ExtendStrategy; 3] = [
    ExtendStrategy::Replace,
    ExtendStrategy::Patch,
    ExtendStrategy::Recreate,
];

/// Inputs shared by every rung of one extension.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtendPlan {
    /// Panel username.
    pub username: String,
    /// Day count the panel currently reports.
    pub current_days: i64,
    /// Day count to write for in-place updates.
    pub target_days: i64,
    /// Day count for a fresh user on the recreate rung (remaining + added).
    pub recreate_days: i64,
    /// Quota in GB to carry over on recreate.
    pub quota_gb: u64,
}

impl ExtendPlan {
    /// Build a plan from the authority's current record.
    ///
    /// The day count runs from creation, so a lapsed user first has the
    /// lapsed days folded in and the added days count from `now`.
    pub fn from_entitlement(current: &Entitlement, days: u32, now: DateTime<Utc>) -> Self {
        let lapsed = days_left(now, current.expiry(now));
        Self {
            username: current.username.clone(),
            current_days: current.expiration_days,
            target_days: current.expiration_days + lapsed + i64::from(days),
            recreate_days: current.remaining_days(now) + i64::from(days),
            quota_gb: current.quota_gb(),
        }
    }
}

/// Which rung succeeded and what it means for the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendOutcome {
    /// Strategy that succeeded.
    pub strategy: ExtendStrategy,
    /// Day count written to the panel.
    pub target_days: i64,
    /// The credential URI changed and the account must be told.
    pub credential_lost: bool,
}

/// Capability surface of the provisioning authority.
#[async_trait]
pub trait ProvisioningClient: Send + Sync {
    /// Create a user. Fails with [`TunnelkitError::AlreadyExists`] on conflict.
    async fn create(&self, username: &str, quota_gb: u64, days: u32) -> Result<Provisioned>;

    /// Fetch the authority's record; `None` when the user does not exist.
    async fn fetch(&self, username: &str) -> Result<Option<Entitlement>>;

    /// Delete a user.
    async fn delete(&self, username: &str) -> Result<()>;

    /// Credential URI. Fails with [`TunnelkitError::Unavailable`] until
    /// the panel has generated one.
    async fn get_uri(&self, username: &str) -> Result<String>;

    /// Limit concurrent client IPs for a user.
    async fn set_ip_limit(&self, username: &str, limit: u32) -> Result<()>;

    /// Probe the authority.
    async fn health(&self) -> HealthCheckResult;

    /// Run one rung of the ladder.
    ///
    /// `Ok(false)` means the authority declined this strategy and the next
    /// rung should be tried.
    async fn apply_extension(&self, strategy: ExtendStrategy, plan: &ExtendPlan) -> Result<bool>;

    /// Add `days` to a user's entitlement using [`EXTEND_LADDER`].
    async fn extend(&self, username: &str, days: u32) -> Result<ExtendOutcome> {
        let current = self
            .fetch(username)
            .await?
            .ok_or_else(|| TunnelkitError::not_found("panel user", username))?;
        let plan = ExtendPlan::from_entitlement(&current, days, Utc::now());
        info!(
            username,
            current_days = plan.current_days,
            target_days = plan.target_days,
            "extending entitlement"
        );

        let mut last_error = String::from("no strategy attempted");
        for strategy in EXTEND_LADDER {
            match self.apply_extension(strategy, &plan).await {
                Ok(true) => {
                    if strategy.loses_credential() {
                        error!(
                            username,
                            target_days = plan.recreate_days,
                            "entitlement recreated, previous credential uri is gone"
                        );
                    } else {
                        info!(username, strategy = strategy.as_str(), "extension applied");
                    }
                    return Ok(ExtendOutcome {
                        strategy,
                        target_days: if strategy.loses_credential() {
                            plan.recreate_days
                        } else {
                            plan.target_days
                        },
                        credential_lost: strategy.loses_credential(),
                    });
                }
                Ok(false) => {
                    warn!(username, strategy = strategy.as_str(), "extension strategy declined");
                    last_error = format!("{} declined", strategy.as_str());
                }
                Err(err) if err.is_recreate_incomplete() => {
                    error!(username, error = %err, "user deleted by recreate and not restored");
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        username,
                        strategy = strategy.as_str(),
                        error = %err,
                        "extension strategy failed"
                    );
                    last_error = err.to_string();
                }
            }
        }

        Err(TunnelkitError::ExtendExhausted {
            username: username.to_string(),
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(days: i64, created: Option<DateTime<Utc>>) -> Entitlement {
        Entitlement {
            username: "vpn_1".into(),
            expiration_days: days,
            traffic_limit: UNLIMITED_TRAFFIC_BYTES,
            expires_at: None,
            created_at: created,
            uri: None,
        }
    }

    #[test]
    fn test_quota_mapping() {
        assert_eq!(quota_bytes(0), 2_147_483_647);
        assert_eq!(quota_bytes(50), 50 * 1024 * 1024 * 1024);
        assert_eq!(quota_gb(quota_bytes(50)), 50);
        assert_eq!(quota_gb(UNLIMITED_TRAFFIC_BYTES), 0);
    }

    #[test]
    fn test_expiry_prefers_expires_at() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let created = Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap();
        let mut ent = record(30, Some(created));
        assert_eq!(ent.expiry(now), created + Duration::days(30));

        let explicit = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        ent.expires_at = Some(explicit);
        assert_eq!(ent.expiry(now), explicit);

        let floating = record(10, None);
        assert_eq!(floating.expiry(now), now + Duration::days(10));
    }

    #[test]
    fn test_days_left_rounds_up() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(days_left(now + Duration::hours(1), now), 1);
        assert_eq!(days_left(now + Duration::days(2), now), 2);
        assert_eq!(days_left(now + Duration::days(2) + Duration::seconds(1), now), 3);
        assert_eq!(days_left(now - Duration::days(1), now), 0);
    }

    #[test]
    fn test_plan_from_entitlement() {
        let now = Utc.with_ymd_and_hms(2025, 1, 11, 0, 0, 0).unwrap();
        let created = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let plan = ExtendPlan::from_entitlement(&record(30, Some(created)), 30, now);
        assert_eq!(plan.target_days, 60);
        assert_eq!(plan.recreate_days, 50);
        assert_eq!(plan.quota_gb, 0);
    }

    #[test]
    fn test_plan_for_lapsed_user_counts_from_now() {
        let now = Utc.with_ymd_and_hms(2025, 3, 12, 0, 0, 0).unwrap();
        let created = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let current = record(30, Some(created));
        assert_eq!(current.expiry(now), now - Duration::days(40));

        let plan = ExtendPlan::from_entitlement(&current, 30, now);
        assert_eq!(plan.target_days, 100);
        assert_eq!(plan.recreate_days, 30);
        assert_eq!(created + Duration::days(plan.target_days), now + Duration::days(30));
    }

    #[test]
    fn test_parse_panel_time_variants() {
        assert!(parse_panel_time("2025-02-01T10:00:00Z").is_some());
        assert!(parse_panel_time("2025-02-01T10:00:00.123456").is_some());
        assert_eq!(
            parse_panel_time("2025-02-01"),
            Some(Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap())
        );
        assert!(parse_panel_time("").is_none());
        assert!(parse_panel_time("soon").is_none());
    }

    #[test]
    fn test_raw_user_aliases() {
        let raw: RawUser = serde_json::from_str(
            r#"{"expiration_days": 30, "max_download_bytes": 2147483647,
                "account_creation_date": "2025-01-01"}"#,
        )
        .unwrap();
        let ent = raw.into_entitlement("vpn_9");
        assert_eq!(ent.username, "vpn_9");
        assert_eq!(ent.quota_gb(), 0);
        assert!(ent.created_at.is_some());
    }
}
