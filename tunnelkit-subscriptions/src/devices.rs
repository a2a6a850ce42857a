//! Bounded per-account device sets.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tunnelkit_lib::AccountId;

use crate::journal::JournaledMap;
use crate::{Result, SubscriptionError};

/// A device fingerprint seen for an account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub ip: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Result of [`DeviceRegistry::register`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// New device took a free slot.
    Accepted,
    /// Known device; IP and last-seen refreshed.
    Updated,
    /// Every slot is taken by other devices.
    LimitExceeded(usize),
}

impl RegisterOutcome {
    /// `LimitExceeded` as a [`SubscriptionError::DeviceLimitExceeded`].
    pub fn into_result(self) -> Result<Self> {
        match self {
            RegisterOutcome::LimitExceeded(max) => {
                Err(SubscriptionError::DeviceLimitExceeded { max }.into())
            }
            other => Ok(other),
        }
    }
}

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn register(&self, account: AccountId, device_id: &str, ip: &str) -> Result<RegisterOutcome>;

    /// Devices for an account, oldest first.
    async fn list(&self, account: AccountId) -> Result<Vec<Device>>;

    /// Forget a device, freeing its slot. Returns false if it was unknown.
    async fn remove(&self, account: AccountId, device_id: &str) -> Result<bool>;

    /// Configured per-account limit.
    fn limit(&self) -> usize;
}

/// Journal-backed [`DeviceRegistry`].
pub struct FileDeviceRegistry {
    map: Mutex<JournaledMap<AccountId, Vec<Device>>>,
    limit: usize,
}

impl FileDeviceRegistry {
    pub fn open(path: impl AsRef<Path>, limit: usize, compact_threshold: usize) -> Result<Self> {
        let map = JournaledMap::open(path.as_ref(), compact_threshold)?;
        Ok(Self {
            map: Mutex::new(map),
            limit,
        })
    }

    fn lock(&self) -> MutexGuard<'_, JournaledMap<AccountId, Vec<Device>>> {
        self.map.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DeviceRegistry for FileDeviceRegistry {
    async fn register(&self, account: AccountId, device_id: &str, ip: &str) -> Result<RegisterOutcome> {
        if device_id.trim().is_empty() {
            return Err(SubscriptionError::InvalidArgument("empty device id".into()).into());
        }
        let now = Utc::now();
        let mut map = self.lock();
        let mut devices = map.get(&account).cloned().unwrap_or_default();
        let full = devices.len() >= self.limit;

        let outcome = match devices.iter_mut().find(|d| d.device_id == device_id) {
            Some(device) => {
                device.ip = ip.to_string();
                device.last_seen = now;
                RegisterOutcome::Updated
            }
            None if full => {
                warn!(%account, device_id, limit = self.limit, "device limit reached");
                return Ok(RegisterOutcome::LimitExceeded(self.limit));
            }
            None => {
                devices.push(Device {
                    device_id: device_id.to_string(),
                    ip: ip.to_string(),
                    first_seen: now,
                    last_seen: now,
                });
                info!(%account, device_id, count = devices.len(), "device registered");
                RegisterOutcome::Accepted
            }
        };

        map.insert(account, devices)?;
        Ok(outcome)
    }

    async fn list(&self, account: AccountId) -> Result<Vec<Device>> {
        Ok(self.lock().get(&account).cloned().unwrap_or_default())
    }

    async fn remove(&self, account: AccountId, device_id: &str) -> Result<bool> {
        let mut map = self.lock();
        let Some(mut devices) = map.get(&account).cloned() else {
            return Ok(false);
        };
        let before = devices.len();
        devices.retain(|d| d.device_id != device_id);
        if devices.len() == before {
            return Ok(false);
        }
        if devices.is_empty() {
            map.remove(&account)?;
        } else {
            map.insert(account, devices)?;
        }
        info!(%account, device_id, "device removed");
        Ok(true)
    }

    fn limit(&self) -> usize {
        self.limit
    }
}
