//! Subscription records and the patch rules that protect them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tunnelkit_lib::provisioning::days_left;
use tunnelkit_lib::AccountId;

use crate::{Result, SubscriptionError};

/// How many applied grant keys a subscription remembers.
pub const APPLIED_GRANTS_KEPT: usize = 32;

/// An account's current entitlement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub account: AccountId,
    /// Username on the provisioning panel.
    pub username: String,
    /// Connection URI issued by the panel. `None` until the panel has
    /// materialized one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_uri: Option<String>,
    pub expires_at: DateTime<Utc>,
    /// Traffic quota in GB (0 = unlimited).
    pub quota_gb: u64,
    pub active: bool,
    /// Promo code that created or first extended this subscription.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promo_code: Option<String>,
    /// Keys of the most recent grants committed to this record, oldest
    /// first. Written in the same upsert as the grant itself.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied_grants: Vec<String>,
    /// The panel user was deleted by a recreate that never finished; the
    /// next grant creates it again instead of extending.
    #[serde(default)]
    pub restore_pending: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Active flag set and expiry in the future.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at > now
    }

    /// Whole days left, rounded up; 0 once expired.
    pub fn days_left(&self, now: DateTime<Utc>) -> i64 {
        days_left(self.expires_at, now)
    }

    /// Whether the grant with this key has already been committed.
    pub fn has_applied(&self, key: &str) -> bool {
        self.applied_grants.iter().any(|k| k == key)
    }
}

/// How a patch moves the expiry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpiryWrite {
    /// Grant paths: the stored expiry becomes `max(stored, value)`.
    Extend(DateTime<Utc>),
    /// Drift sync: the panel's value wins, even if lower.
    Authoritative(DateTime<Utc>),
}

impl ExpiryWrite {
    fn value(&self) -> DateTime<Utc> {
        match self {
            ExpiryWrite::Extend(at) | ExpiryWrite::Authoritative(at) => *at,
        }
    }

    fn apply(&self, current: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            ExpiryWrite::Extend(at) => current.max(*at),
            ExpiryWrite::Authoritative(at) => *at,
        }
    }
}

/// Field-wise update. `None` leaves the stored value untouched.
#[derive(Clone, Debug)]
pub struct SubscriptionPatch {
    pub account: AccountId,
    pub username: Option<String>,
    pub credential_uri: Option<String>,
    pub expiry: Option<ExpiryWrite>,
    pub quota_gb: Option<u64>,
    pub active: Option<bool>,
    pub promo_code: Option<String>,
    pub applied_grant: Option<String>,
    pub restore_pending: Option<bool>,
}

impl SubscriptionPatch {
    pub fn new(account: AccountId) -> Self {
        Self {
            account,
            username: None,
            credential_uri: None,
            expiry: None,
            quota_gb: None,
            active: None,
            promo_code: None,
            applied_grant: None,
            restore_pending: None,
        }
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the URI when one is known; `None` preserves the stored one.
    pub fn credential_uri(mut self, uri: Option<String>) -> Self {
        self.credential_uri = uri.filter(|u| !u.is_empty());
        self
    }

    pub fn extend_to(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expiry = Some(ExpiryWrite::Extend(expires_at));
        self
    }

    pub fn authoritative_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expiry = Some(ExpiryWrite::Authoritative(expires_at));
        self
    }

    pub fn quota_gb(mut self, quota_gb: u64) -> Self {
        self.quota_gb = Some(quota_gb);
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    pub fn promo_code(mut self, code: Option<String>) -> Self {
        self.promo_code = code;
        self
    }

    /// Remember the key of the grant this patch commits.
    pub fn applied_grant(mut self, key: Option<String>) -> Self {
        self.applied_grant = key;
        self
    }

    pub fn restore_pending(mut self, pending: bool) -> Self {
        self.restore_pending = Some(pending);
        self
    }

    /// Merge into the stored record, or build a new one.
    ///
    /// A new record needs a username and an expiry. The promo code is
    /// write-once.
    pub fn apply(self, existing: Option<Subscription>, now: DateTime<Utc>) -> Result<Subscription> {
        match existing {
            Some(mut sub) => {
                if let Some(username) = self.username {
                    sub.username = username;
                }
                if let Some(uri) = self.credential_uri {
                    sub.credential_uri = Some(uri);
                }
                if let Some(expiry) = self.expiry {
                    sub.expires_at = expiry.apply(sub.expires_at);
                }
                if let Some(quota) = self.quota_gb {
                    sub.quota_gb = quota;
                }
                if let Some(active) = self.active {
                    sub.active = active;
                }
                if sub.promo_code.is_none() {
                    sub.promo_code = self.promo_code;
                }
                if let Some(key) = self.applied_grant {
                    remember(&mut sub.applied_grants, key);
                }
                if let Some(pending) = self.restore_pending {
                    sub.restore_pending = pending;
                }
                sub.updated_at = now;
                Ok(sub)
            }
            None => {
                let username = self.username.ok_or_else(|| {
                    SubscriptionError::InvalidArgument(format!(
                        "new subscription for {} needs a username",
                        self.account
                    ))
                })?;
                let expiry = self.expiry.ok_or_else(|| {
                    SubscriptionError::InvalidArgument(format!(
                        "new subscription for {} needs an expiry",
                        self.account
                    ))
                })?;
                Ok(Subscription {
                    account: self.account,
                    username,
                    credential_uri: self.credential_uri,
                    expires_at: expiry.value(),
                    quota_gb: self.quota_gb.unwrap_or(0),
                    active: self.active.unwrap_or(true),
                    promo_code: self.promo_code,
                    applied_grants: self.applied_grant.into_iter().collect(),
                    restore_pending: self.restore_pending.unwrap_or(false),
                    created_at: now,
                    updated_at: now,
                })
            }
        }
    }
}

fn remember(keys: &mut Vec<String>, key: String) {
    if keys.contains(&key) {
        return;
    }
    keys.push(key);
    if keys.len() > APPLIED_GRANTS_KEPT {
        let excess = keys.len() - APPLIED_GRANTS_KEPT;
        keys.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn base(now: DateTime<Utc>) -> Subscription {
        SubscriptionPatch::new(AccountId(7))
            .username("vpn_7")
            .credential_uri(Some("hy2://one".into()))
            .extend_to(now + Duration::days(10))
            .apply(None, now)
            .unwrap()
    }

    #[test]
    fn test_new_record_defaults() {
        let now = Utc::now();
        let sub = base(now);
        assert!(sub.active);
        assert_eq!(sub.quota_gb, 0);
        assert_eq!(sub.days_left(now), 10);
        assert!(sub.is_active(now));
    }

    #[test]
    fn test_new_record_requires_username_and_expiry() {
        let now = Utc::now();
        assert!(SubscriptionPatch::new(AccountId(1))
            .extend_to(now)
            .apply(None, now)
            .is_err());
        assert!(SubscriptionPatch::new(AccountId(1))
            .username("vpn_1")
            .apply(None, now)
            .is_err());
    }

    #[test]
    fn test_extend_never_lowers_expiry() {
        let now = Utc::now();
        let sub = base(now);
        let lowered = SubscriptionPatch::new(AccountId(7))
            .extend_to(now + Duration::days(2))
            .apply(Some(sub.clone()), now)
            .unwrap();
        assert_eq!(lowered.expires_at, sub.expires_at);
    }

    #[test]
    fn test_authoritative_may_lower_expiry() {
        let now = Utc::now();
        let sub = base(now);
        let lowered = SubscriptionPatch::new(AccountId(7))
            .authoritative_expiry(now + Duration::days(2))
            .apply(Some(sub), now)
            .unwrap();
        assert_eq!(lowered.days_left(now), 2);
    }

    #[test]
    fn test_uri_preserved_unless_provided() {
        let now = Utc::now();
        let sub = base(now);
        let kept = SubscriptionPatch::new(AccountId(7))
            .credential_uri(None)
            .extend_to(now + Duration::days(40))
            .apply(Some(sub.clone()), now)
            .unwrap();
        assert_eq!(kept.credential_uri.as_deref(), Some("hy2://one"));

        let blank = SubscriptionPatch::new(AccountId(7))
            .credential_uri(Some(String::new()))
            .apply(Some(sub.clone()), now)
            .unwrap();
        assert_eq!(blank.credential_uri.as_deref(), Some("hy2://one"));

        let rotated = SubscriptionPatch::new(AccountId(7))
            .credential_uri(Some("hy2://two".into()))
            .apply(Some(sub), now)
            .unwrap();
        assert_eq!(rotated.credential_uri.as_deref(), Some("hy2://two"));
    }

    #[test]
    fn test_promo_code_is_write_once() {
        let now = Utc::now();
        let first = SubscriptionPatch::new(AccountId(7))
            .promo_code(Some("WELCOME10".into()))
            .apply(Some(base(now)), now)
            .unwrap();
        let second = SubscriptionPatch::new(AccountId(7))
            .promo_code(Some("SPRING".into()))
            .apply(Some(first), now)
            .unwrap();
        assert_eq!(second.promo_code.as_deref(), Some("WELCOME10"));
    }

    #[test]
    fn test_applied_grant_keys_are_remembered_and_bounded() {
        let now = Utc::now();
        let mut sub = SubscriptionPatch::new(AccountId(7))
            .applied_grant(Some("invoice:1".into()))
            .apply(Some(base(now)), now)
            .unwrap();
        assert!(sub.has_applied("invoice:1"));
        assert!(!sub.has_applied("invoice:2"));

        sub = SubscriptionPatch::new(AccountId(7))
            .applied_grant(Some("invoice:1".into()))
            .apply(Some(sub), now)
            .unwrap();
        assert_eq!(sub.applied_grants.len(), 1);

        for i in 2..=(APPLIED_GRANTS_KEPT + 5) {
            sub = SubscriptionPatch::new(AccountId(7))
                .applied_grant(Some(format!("invoice:{}", i)))
                .apply(Some(sub), now)
                .unwrap();
        }
        assert_eq!(sub.applied_grants.len(), APPLIED_GRANTS_KEPT);
        assert!(!sub.has_applied("invoice:1"));
        assert!(sub.has_applied(&format!("invoice:{}", APPLIED_GRANTS_KEPT + 5)));
    }

    #[test]
    fn test_restore_flag_set_and_cleared() {
        let now = Utc::now();
        let flagged = SubscriptionPatch::new(AccountId(7))
            .restore_pending(true)
            .apply(Some(base(now)), now)
            .unwrap();
        assert!(flagged.restore_pending);
        let untouched = SubscriptionPatch::new(AccountId(7))
            .extend_to(now + Duration::days(40))
            .apply(Some(flagged), now)
            .unwrap();
        assert!(untouched.restore_pending);
        let cleared = SubscriptionPatch::new(AccountId(7))
            .restore_pending(false)
            .apply(Some(untouched), now)
            .unwrap();
        assert!(!cleared.restore_pending);
    }

    #[test]
    fn test_expired_subscription_is_inactive() {
        let now = Utc::now();
        let mut sub = base(now);
        sub.expires_at = now - Duration::hours(1);
        assert!(!sub.is_active(now));
        assert_eq!(sub.days_left(now), 0);
    }
}
