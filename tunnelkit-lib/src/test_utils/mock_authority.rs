//! In-memory provisioning authority.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::health::HealthCheckResult;
use crate::provisioning::{
    quota_bytes, Entitlement, ExtendPlan, ExtendStrategy, Provisioned, ProvisioningClient,
};
use crate::{Result, TunnelkitError};

/// Switchable failure modes.
#[derive(Clone, Debug, Default)]
pub struct FailureModes {
    /// Replace rung returns "declined".
    pub fail_replace: bool,
    /// Patch rung returns "declined".
    pub fail_patch: bool,
    /// Recreate rung returns "declined".
    pub fail_recreate: bool,
    /// Recreate rung deletes the user, then its create fails.
    pub break_recreate: bool,
    /// `create` is rejected with a permanent error.
    pub reject_create: bool,
    /// `fetch` reports every user as missing.
    pub hide_users: bool,
    /// The next N calls of any kind fail with a transient error.
    pub transient_failures: u32,
    /// Freshly created users need this many `get_uri` calls before a URI exists.
    pub uri_pending_polls: u32,
    /// Health probe reports unavailable.
    pub unhealthy: bool,
}

/// Per-operation call counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthorityCalls {
    pub create: u32,
    pub fetch: u32,
    pub delete: u32,
    pub get_uri: u32,
    pub ip_limit: u32,
    pub replace: u32,
    pub patch: u32,
    pub recreate: u32,
}

#[derive(Clone, Debug)]
struct MockUser {
    expiration_days: i64,
    traffic_limit: u64,
    created_at: DateTime<Utc>,
    uri: String,
    uri_pending: u32,
    ip_limit: Option<u32>,
}

#[derive(Default)]
struct State {
    users: HashMap<String, MockUser>,
    failures: FailureModes,
    calls: AuthorityCalls,
    generation: u64,
}

impl State {
    fn next_uri(&mut self, username: &str) -> String {
        self.generation += 1;
        format!("hy2://{}-g{}@mock.panel:443", username, self.generation)
    }

    fn take_transient(&mut self, operation: &str) -> Result<()> {
        if self.failures.transient_failures > 0 {
            self.failures.transient_failures -= 1;
            return Err(TunnelkitError::Upstream {
                service: "panel".to_string(),
                status: 503,
                body: format!("injected failure in {}", operation),
            });
        }
        Ok(())
    }

    fn insert(&mut self, username: &str, quota_gb: u64, days: i64, uri_pending: u32) -> String {
        let uri = self.next_uri(username);
        self.users.insert(
            username.to_string(),
            MockUser {
                expiration_days: days,
                traffic_limit: quota_bytes(quota_gb),
                created_at: Utc::now(),
                uri: uri.clone(),
                uri_pending,
                ip_limit: None,
            },
        );
        uri
    }
}

/// In-memory provisioning panel.
#[derive(Default)]
pub struct MockAuthority {
    state: Mutex<State>,
}

impl MockAuthority {
    /// Create an empty panel.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Change failure modes.
    pub fn configure(&self, f: impl FnOnce(&mut FailureModes)) {
        f(&mut self.lock().failures);
    }

    /// Call counters so far.
    pub fn calls(&self) -> AuthorityCalls {
        self.lock().calls.clone()
    }

    /// Add a user directly, created `age_days` ago. Returns its URI.
    pub fn seed_user(&self, username: &str, days: i64, quota_gb: u64, age_days: i64) -> String {
        let mut state = self.lock();
        let uri = state.insert(username, quota_gb, days, 0);
        if let Some(user) = state.users.get_mut(username) {
            user.created_at = Utc::now() - Duration::days(age_days);
        }
        uri
    }

    /// Authority record without going through the client surface.
    pub fn user(&self, username: &str) -> Option<Entitlement> {
        self.lock()
            .users
            .get(username)
            .map(|user| to_entitlement(username, user))
    }

    /// Current URI without going through the client surface.
    pub fn uri_of(&self, username: &str) -> Option<String> {
        self.lock().users.get(username).map(|user| user.uri.clone())
    }

    /// IP limit applied to a user.
    pub fn ip_limit_of(&self, username: &str) -> Option<u32> {
        self.lock().users.get(username).and_then(|user| user.ip_limit)
    }

    /// Overwrite a user's day count, simulating an out-of-band panel edit.
    pub fn set_days(&self, username: &str, days: i64) {
        if let Some(user) = self.lock().users.get_mut(username) {
            user.expiration_days = days;
        }
    }

    /// Issue a new URI for a user, simulating an admin-side rotation.
    pub fn rotate_uri(&self, username: &str) -> Option<String> {
        let mut state = self.lock();
        if !state.users.contains_key(username) {
            return None;
        }
        let uri = state.next_uri(username);
        if let Some(user) = state.users.get_mut(username) {
            user.uri = uri.clone();
        }
        Some(uri)
    }

    /// Number of users on the panel.
    pub fn user_count(&self) -> usize {
        self.lock().users.len()
    }
}

fn to_entitlement(username: &str, user: &MockUser) -> Entitlement {
    Entitlement {
        username: username.to_string(),
        expiration_days: user.expiration_days,
        traffic_limit: user.traffic_limit,
        expires_at: None,
        created_at: Some(user.created_at),
        uri: Some(user.uri.clone()),
    }
}

#[async_trait]
impl ProvisioningClient for MockAuthority {
    async fn create(&self, username: &str, quota_gb: u64, days: u32) -> Result<Provisioned> {
        let mut state = self.lock();
        state.calls.create += 1;
        state.take_transient("create")?;
        if state.failures.reject_create {
            return Err(TunnelkitError::Rejected {
                service: "panel".to_string(),
                status: 422,
                reason: "create rejected".to_string(),
            });
        }
        if state.users.contains_key(username) {
            return Err(TunnelkitError::AlreadyExists {
                username: username.to_string(),
            });
        }
        let pending = state.failures.uri_pending_polls;
        let uri = state.insert(username, quota_gb, i64::from(days), pending);
        Ok(Provisioned {
            username: username.to_string(),
            credential_uri: if pending == 0 { Some(uri) } else { None },
        })
    }

    async fn fetch(&self, username: &str) -> Result<Option<Entitlement>> {
        let mut state = self.lock();
        state.calls.fetch += 1;
        state.take_transient("fetch")?;
        if state.failures.hide_users {
            return Ok(None);
        }
        Ok(state
            .users
            .get(username)
            .map(|user| to_entitlement(username, user)))
    }

    async fn delete(&self, username: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.delete += 1;
        state.take_transient("delete")?;
        state
            .users
            .remove(username)
            .map(|_| ())
            .ok_or_else(|| TunnelkitError::not_found("panel user", username))
    }

    async fn get_uri(&self, username: &str) -> Result<String> {
        let mut state = self.lock();
        state.calls.get_uri += 1;
        state.take_transient("get_uri")?;
        let user = state
            .users
            .get_mut(username)
            .ok_or_else(|| TunnelkitError::not_found("panel user", username))?;
        if user.uri_pending > 0 {
            user.uri_pending -= 1;
            return Err(TunnelkitError::Unavailable {
                what: "credential uri".to_string(),
                identifier: username.to_string(),
            });
        }
        Ok(user.uri.clone())
    }

    async fn set_ip_limit(&self, username: &str, limit: u32) -> Result<()> {
        let mut state = self.lock();
        state.calls.ip_limit += 1;
        let user = state
            .users
            .get_mut(username)
            .ok_or_else(|| TunnelkitError::not_found("panel user", username))?;
        user.ip_limit = Some(limit);
        Ok(())
    }

    async fn health(&self) -> HealthCheckResult {
        if self.lock().failures.unhealthy {
            HealthCheckResult::unhealthy("panel", "injected outage")
        } else {
            HealthCheckResult::healthy("panel")
        }
    }

    async fn apply_extension(&self, strategy: ExtendStrategy, plan: &ExtendPlan) -> Result<bool> {
        let mut state = self.lock();
        match strategy {
            ExtendStrategy::Replace => state.calls.replace += 1,
            ExtendStrategy::Patch => state.calls.patch += 1,
            ExtendStrategy::Recreate => state.calls.recreate += 1,
        }
        state.take_transient(strategy.as_str())?;
        let declined = match strategy {
            ExtendStrategy::Replace => state.failures.fail_replace,
            ExtendStrategy::Patch => state.failures.fail_patch,
            ExtendStrategy::Recreate => state.failures.fail_recreate,
        };
        if declined {
            return Ok(false);
        }

        match strategy {
            ExtendStrategy::Replace | ExtendStrategy::Patch => {
                match state.users.get_mut(&plan.username) {
                    Some(user) => {
                        user.expiration_days = plan.target_days;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            ExtendStrategy::Recreate => {
                state.users.remove(&plan.username);
                if state.failures.break_recreate {
                    return Err(TunnelkitError::RecreateIncomplete {
                        username: plan.username.clone(),
                        reason: "injected create failure".to_string(),
                    });
                }
                state.insert(&plan.username, plan.quota_gb, plan.recreate_days, 0);
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioning::ExtendStrategy;

    #[tokio::test]
    async fn test_create_then_conflict() {
        let panel = MockAuthority::new();
        let created = panel.create("vpn_1", 0, 30).await.unwrap();
        assert!(created.credential_uri.is_some());
        let err = panel.create("vpn_1", 0, 30).await.unwrap_err();
        assert!(matches!(err, TunnelkitError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_extend_uses_replace_first() {
        let panel = MockAuthority::new();
        let uri = panel.seed_user("vpn_1", 30, 0, 10);
        let outcome = panel.extend("vpn_1", 30).await.unwrap();
        assert_eq!(outcome.strategy, ExtendStrategy::Replace);
        assert_eq!(outcome.target_days, 60);
        assert!(!outcome.credential_lost);
        assert_eq!(panel.uri_of("vpn_1"), Some(uri));
        assert_eq!(panel.calls().patch, 0);
    }

    #[tokio::test]
    async fn test_ladder_falls_through_to_patch() {
        let panel = MockAuthority::new();
        panel.seed_user("vpn_1", 30, 0, 0);
        panel.configure(|f| f.fail_replace = true);
        let outcome = panel.extend("vpn_1", 30).await.unwrap();
        assert_eq!(outcome.strategy, ExtendStrategy::Patch);
        assert_eq!(panel.user("vpn_1").unwrap().expiration_days, 60);
    }

    #[tokio::test]
    async fn test_recreate_loses_credential() {
        let panel = MockAuthority::new();
        let old_uri = panel.seed_user("vpn_1", 30, 0, 10);
        panel.configure(|f| {
            f.fail_replace = true;
            f.fail_patch = true;
        });
        let outcome = panel.extend("vpn_1", 30).await.unwrap();
        assert_eq!(outcome.strategy, ExtendStrategy::Recreate);
        assert!(outcome.credential_lost);
        assert_eq!(outcome.target_days, 50);
        assert_ne!(panel.uri_of("vpn_1"), Some(old_uri));
    }

    #[tokio::test]
    async fn test_exhausted_ladder() {
        let panel = MockAuthority::new();
        panel.seed_user("vpn_1", 30, 0, 0);
        panel.configure(|f| {
            f.fail_replace = true;
            f.fail_patch = true;
            f.fail_recreate = true;
        });
        let err = panel.extend("vpn_1", 30).await.unwrap_err();
        assert!(matches!(err, TunnelkitError::ExtendExhausted { .. }));
        assert_eq!(panel.user("vpn_1").unwrap().expiration_days, 30);
    }

    #[tokio::test]
    async fn test_extend_missing_user_is_not_found() {
        let panel = MockAuthority::new();
        let err = panel.extend("vpn_404", 30).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_pending_uri_materializes() {
        let panel = MockAuthority::new();
        panel.configure(|f| f.uri_pending_polls = 2);
        let created = panel.create("vpn_2", 0, 30).await.unwrap();
        assert!(created.credential_uri.is_none());
        assert!(panel.get_uri("vpn_2").await.is_err());
        assert!(panel.get_uri("vpn_2").await.is_err());
        assert!(panel.get_uri("vpn_2").await.is_ok());
    }
}
