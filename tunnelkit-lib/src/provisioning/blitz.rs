//! REST adapter for the Blitz Hysteria2 panel.
//!
//! Endpoints used:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | create | `POST /api/v1/users/` |
//! | fetch | `GET /api/v1/users/{u}` |
//! | uri | `GET /api/v1/users/{u}/uri` |
//! | replace / patch | `PUT` / `PATCH /api/v1/users/{u}` |
//! | delete | `DELETE /api/v1/users/{u}` |
//! | ip limit | `PATCH /api/v1/users/{u}/inactivelimit` |
//! | health | `GET /api/v1/server/status` |
//!
//! Reads are retried per the configured [`RetryPolicy`](crate::retry::RetryPolicy);
//! writes are sent once.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::config::PanelConfig;
use super::{
    quota_bytes, Entitlement, ExtendPlan, ExtendStrategy, Provisioned, ProvisioningClient,
    RawUser,
};
use crate::health::HealthCheckResult;
use crate::retry::with_retry;
use crate::{Result, TunnelkitError};

const SERVICE: &str = "panel";
const MAX_ERROR_BODY: usize = 512;

/// Client for the Blitz panel API.
pub struct BlitzClient {
    config: PanelConfig,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct CreateUserBody<'a> {
    username: &'a str,
    traffic_limit: u64,
    expiration_days: i64,
    unlimited: bool,
}

#[derive(Serialize)]
struct EditUserBody {
    expiration_days: i64,
}

#[derive(Serialize)]
struct IpLimitBody {
    limit: u32,
    enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
struct UriResponse {
    #[serde(default)]
    ipv4: Option<String>,
    #[serde(default)]
    ipv6: Option<String>,
    #[serde(default)]
    uri: Option<String>,
}

impl UriResponse {
    fn best(self) -> Option<String> {
        [self.ipv4, self.ipv6, self.uri]
            .into_iter()
            .flatten()
            .find(|candidate| !candidate.trim().is_empty())
    }
}

/// Status and body of a finished request.
struct Reply {
    status: u16,
    body: String,
}

impl Reply {
    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn into_error(self) -> TunnelkitError {
        TunnelkitError::from_status(SERVICE, self.status, truncate(&self.body))
    }
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

impl BlitzClient {
    /// Create a new panel client with the given configuration.
    pub fn new(config: PanelConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| TunnelkitError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    /// Get the configuration.
    pub fn config(&self) -> &PanelConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn user_path(username: &str) -> String {
        format!("api/v1/users/{}", username)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Reply> {
        let response = request
            .header("Authorization", &self.config.api_token)
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| TunnelkitError::Transport(format!("Failed to read panel response: {}", e)))?;
        Ok(Reply { status, body })
    }

    /// GET with retries on transport failures and 5xx.
    async fn get_with_retry(&self, path: &str, operation: &str) -> Result<Reply> {
        let url = self.url(path);
        let url = url.as_str();
        with_retry(&self.config.retry, operation, move || async move {
            let reply = self.send(self.client.get(url)).await?;
            if reply.status >= 500 || reply.status == 429 {
                return Err(reply.into_error());
            }
            Ok(reply)
        })
        .await
    }

    /// Map reqwest errors to TunnelkitError.
    fn map_reqwest_error(&self, e: reqwest::Error) -> TunnelkitError {
        if e.is_timeout() {
            TunnelkitError::ConnectionTimeout {
                operation: "panel request".to_string(),
                timeout_ms: self.config.timeout_secs * 1000,
            }
        } else if e.is_connect() {
            TunnelkitError::ConnectionFailed {
                target: self.config.base_url.clone(),
                reason: e.to_string(),
            }
        } else {
            TunnelkitError::Transport(format!("panel request failed: {}", e))
        }
    }

    async fn post_user(&self, username: &str, quota_gb: u64, days: i64) -> Result<Reply> {
        let body = CreateUserBody {
            username,
            traffic_limit: quota_bytes(quota_gb),
            expiration_days: days,
            unlimited: false,
        };
        self.send(self.client.post(self.url("api/v1/users/")).json(&body))
            .await
    }

    async fn edit_user(&self, strategy: ExtendStrategy, plan: &ExtendPlan) -> Result<bool> {
        let url = self.url(&Self::user_path(&plan.username));
        let body = EditUserBody {
            expiration_days: plan.target_days,
        };
        let request = match strategy {
            ExtendStrategy::Patch => self.client.patch(&url),
            _ => self.client.put(&url),
        };
        let reply = self.send(request.json(&body)).await?;
        debug!(
            username = %plan.username,
            strategy = strategy.as_str(),
            status = reply.status,
            body = truncate(&reply.body),
            "panel edit response"
        );
        Ok(reply.status == 200)
    }

    async fn recreate_user(&self, plan: &ExtendPlan) -> Result<bool> {
        match self.delete(&plan.username).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        let days = plan.recreate_days.max(1);
        let reply = match self.post_user(&plan.username, plan.quota_gb, days).await {
            Ok(reply) => reply,
            Err(err) => {
                return Err(TunnelkitError::RecreateIncomplete {
                    username: plan.username.clone(),
                    reason: err.to_string(),
                })
            }
        };
        if !reply.is_success() {
            warn!(
                username = %plan.username,
                status = reply.status,
                body = truncate(&reply.body),
                "panel refused recreate after delete"
            );
            return Err(TunnelkitError::RecreateIncomplete {
                username: plan.username.clone(),
                reason: format!("create returned {}", reply.status),
            });
        }
        self.apply_ip_limit(&plan.username).await;
        Ok(true)
    }

    async fn apply_ip_limit(&self, username: &str) {
        if let Err(err) = self.set_ip_limit(username, self.config.ip_limit).await {
            warn!(username, error = %err, "ip limit not applied");
        }
    }
}

#[async_trait]
impl ProvisioningClient for BlitzClient {
    #[instrument(skip(self))]
    async fn create(&self, username: &str, quota_gb: u64, days: u32) -> Result<Provisioned> {
        let reply = self.post_user(username, quota_gb, i64::from(days)).await?;
        match reply.status {
            200 | 201 => {}
            409 => {
                info!(username, "panel user already exists");
                return Err(TunnelkitError::AlreadyExists {
                    username: username.to_string(),
                });
            }
            _ => return Err(reply.into_error()),
        }
        info!(username, quota_gb, days, "panel user created");
        self.apply_ip_limit(username).await;

        let credential_uri = match self.get_uri(username).await {
            Ok(uri) => Some(uri),
            Err(err) => {
                debug!(username, error = %err, "uri not ready after create");
                None
            }
        };
        Ok(Provisioned {
            username: username.to_string(),
            credential_uri,
        })
    }

    #[instrument(skip(self))]
    async fn fetch(&self, username: &str) -> Result<Option<Entitlement>> {
        let reply = self
            .get_with_retry(&Self::user_path(username), "panel fetch")
            .await?;
        if reply.status == 404 {
            return Ok(None);
        }
        if !reply.is_success() {
            return Err(reply.into_error());
        }
        let raw: RawUser = serde_json::from_str(&reply.body).map_err(|e| {
            TunnelkitError::Serialization(format!("Failed to parse panel user: {}", e))
        })?;
        Ok(Some(raw.into_entitlement(username)))
    }

    #[instrument(skip(self))]
    async fn delete(&self, username: &str) -> Result<()> {
        let reply = self
            .send(self.client.delete(self.url(&Self::user_path(username))))
            .await?;
        match reply.status {
            200 | 204 => Ok(()),
            404 => Err(TunnelkitError::not_found("panel user", username)),
            _ => Err(reply.into_error()),
        }
    }

    #[instrument(skip(self))]
    async fn get_uri(&self, username: &str) -> Result<String> {
        let path = format!("{}/uri", Self::user_path(username));
        let reply = self.get_with_retry(&path, "panel uri").await?;
        if reply.status == 404 {
            return Err(TunnelkitError::not_found("panel user", username));
        }
        if !reply.is_success() {
            return Err(reply.into_error());
        }
        let parsed: UriResponse = serde_json::from_str(&reply.body).unwrap_or_default();
        parsed.best().ok_or_else(|| TunnelkitError::Unavailable {
            what: "credential uri".to_string(),
            identifier: username.to_string(),
        })
    }

    #[instrument(skip(self))]
    async fn set_ip_limit(&self, username: &str, limit: u32) -> Result<()> {
        let path = format!("{}/inactivelimit", Self::user_path(username));
        let body = IpLimitBody {
            limit,
            enabled: true,
        };
        let reply = self.send(self.client.patch(self.url(&path)).json(&body)).await?;
        if reply.is_success() {
            Ok(())
        } else {
            Err(reply.into_error())
        }
    }

    async fn health(&self) -> HealthCheckResult {
        let started = Instant::now();
        let reply = self
            .send(self.client.get(self.url("api/v1/server/status")))
            .await;
        let latency = started.elapsed().as_millis() as u64;
        match reply {
            Ok(reply) if reply.status == 200 => {
                let details = serde_json::from_str(&reply.body).unwrap_or_default();
                HealthCheckResult::healthy(SERVICE)
                    .with_latency(latency)
                    .with_details(details)
            }
            Ok(reply) => HealthCheckResult::degraded(SERVICE, format!("HTTP {}", reply.status))
                .with_latency(latency),
            Err(err) => HealthCheckResult::unhealthy(SERVICE, err.to_string()),
        }
    }

    #[instrument(skip(self, plan), fields(username = %plan.username))]
    async fn apply_extension(&self, strategy: ExtendStrategy, plan: &ExtendPlan) -> Result<bool> {
        match strategy {
            ExtendStrategy::Replace | ExtendStrategy::Patch => self.edit_user(strategy, plan).await,
            ExtendStrategy::Recreate => self.recreate_user(plan).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_preference_order() {
        let both = UriResponse {
            ipv4: Some("hy2://v4".into()),
            ipv6: Some("hy2://v6".into()),
            uri: None,
        };
        assert_eq!(both.best().as_deref(), Some("hy2://v4"));

        let v6_only = UriResponse {
            ipv4: Some("".into()),
            ipv6: Some("hy2://v6".into()),
            uri: Some("hy2://fallback".into()),
        };
        assert_eq!(v6_only.best().as_deref(), Some("hy2://v6"));

        assert_eq!(UriResponse::default().best(), None);
    }

    #[test]
    fn test_url_joining() {
        let client = BlitzClient::new(PanelConfig::new("https://panel:8000/", "t")).unwrap();
        assert_eq!(
            client.url(&BlitzClient::user_path("vpn_1")),
            "https://panel:8000/api/v1/users/vpn_1"
        );
    }

    #[test]
    fn test_truncate_long_body() {
        let long = "x".repeat(2000);
        assert_eq!(truncate(&long).len(), MAX_ERROR_BODY);
        assert_eq!(truncate("short"), "short");
    }
}
