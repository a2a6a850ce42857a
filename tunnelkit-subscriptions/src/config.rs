//! Engine configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tunnelkit_lib::retry::RetryPolicy;

use crate::Amount;

/// Price of one grant period per payment asset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriceTable {
    prices: BTreeMap<String, Amount>,
}

impl Default for PriceTable {
    fn default() -> Self {
        let mut prices = BTreeMap::new();
        prices.insert("TON".to_string(), Amount::from_decimal(dec!(1)));
        prices.insert("USDT".to_string(), Amount::from_decimal(dec!(1.5)));
        prices.insert("USDC".to_string(), Amount::from_decimal(dec!(1.5)));
        prices.insert("BTC".to_string(), Amount::from_decimal(dec!(0.000015)));
        prices.insert("ETH".to_string(), Amount::from_decimal(dec!(0.0004)));
        Self { prices }
    }
}

impl PriceTable {
    /// Empty table.
    pub fn empty() -> Self {
        Self {
            prices: BTreeMap::new(),
        }
    }

    /// Price for an asset, matched case-insensitively.
    pub fn price(&self, asset: &str) -> Option<Amount> {
        self.prices.get(&asset.trim().to_ascii_uppercase()).copied()
    }

    /// Set or replace the price of an asset.
    pub fn with_price(mut self, asset: &str, amount: Amount) -> Self {
        self.prices.insert(asset.trim().to_ascii_uppercase(), amount);
        self
    }

    /// Accepted assets in alphabetical order.
    pub fn assets(&self) -> impl Iterator<Item = &str> {
        self.prices.keys().map(String::as_str)
    }
}

/// Reconciliation engine settings.
///
/// Timer fields are in milliseconds so tests can run the poll/expire
/// machinery at millisecond scale; the environment variables take seconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding the store journals.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Days granted per paid invoice.
    #[serde(default = "default_grant_days")]
    pub grant_days: u32,

    /// Quota granted per paid invoice in GB (0 = unlimited).
    #[serde(default)]
    pub grant_quota_gb: u64,

    /// Maximum distinct devices per account.
    #[serde(default = "default_device_limit")]
    pub device_limit: usize,

    /// How long an invoice stays payable.
    #[serde(default = "default_invoice_window_ms")]
    pub invoice_window_ms: u64,

    /// Delay between opening an invoice and its first status poll.
    #[serde(default = "default_first_poll_delay_ms")]
    pub first_poll_delay_ms: u64,

    /// Delay between subsequent status polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Send a payment reminder every N polls (0 disables reminders).
    #[serde(default = "default_reminder_every")]
    pub reminder_every: u32,

    /// Grant attempts before a retry record is escalated.
    #[serde(default = "default_max_grant_attempts")]
    pub max_grant_attempts: u32,

    /// Drift sync period.
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,

    /// Prefix of panel usernames (`vpn_` gives `vpn_42`).
    #[serde(default = "default_username_prefix")]
    pub username_prefix: String,

    /// Invoice description shown by the payment provider.
    #[serde(default = "default_invoice_description")]
    pub invoice_description: String,

    #[serde(default)]
    pub prices: PriceTable,

    /// Days an invoice outcome tombstone is kept after settlement.
    #[serde(default = "default_tombstone_retention_days")]
    pub tombstone_retention_days: i64,

    /// Superseded journal records tolerated before compaction.
    #[serde(default = "default_compact_threshold")]
    pub compact_threshold: usize,

    /// Backoff used while waiting for the panel to materialize a URI.
    #[serde(default = "default_uri_retry")]
    pub uri_retry: RetryPolicy,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_grant_days() -> u32 {
    30
}

fn default_device_limit() -> usize {
    3
}

fn default_invoice_window_ms() -> u64 {
    3_600_000
}

fn default_first_poll_delay_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    15_000
}

fn default_reminder_every() -> u32 {
    20
}

fn default_max_grant_attempts() -> u32 {
    3
}

fn default_sync_interval_ms() -> u64 {
    300_000
}

fn default_username_prefix() -> String {
    "vpn_".to_string()
}

fn default_invoice_description() -> String {
    "VPN access for 30 days".to_string()
}

fn default_tombstone_retention_days() -> i64 {
    7
}

fn default_compact_threshold() -> usize {
    1000
}

fn default_uri_retry() -> RetryPolicy {
    RetryPolicy::new(5).with_initial_backoff(500)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            grant_days: default_grant_days(),
            grant_quota_gb: 0,
            device_limit: default_device_limit(),
            invoice_window_ms: default_invoice_window_ms(),
            first_poll_delay_ms: default_first_poll_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            reminder_every: default_reminder_every(),
            max_grant_attempts: default_max_grant_attempts(),
            sync_interval_ms: default_sync_interval_ms(),
            username_prefix: default_username_prefix(),
            invoice_description: default_invoice_description(),
            prices: PriceTable::default(),
            tombstone_retention_days: default_tombstone_retention_days(),
            compact_threshold: default_compact_threshold(),
            uri_retry: default_uri_retry(),
        }
    }
}

impl EngineConfig {
    /// Defaults with journals under `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Defaults overridden by `TUNNELKIT_*` variables.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("TUNNELKIT_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(days) = env_number::<u32>("TUNNELKIT_GRANT_DAYS") {
            config.grant_days = days;
        }
        if let Some(limit) = env_number::<usize>("TUNNELKIT_DEVICE_LIMIT") {
            config.device_limit = limit;
        }
        if let Some(secs) = env_number::<u64>("TUNNELKIT_SYNC_INTERVAL_SECS") {
            config.sync_interval_ms = secs.saturating_mul(1000);
        }
        if let Some(secs) = env_number::<u64>("TUNNELKIT_INVOICE_WINDOW_SECS") {
            config.invoice_window_ms = secs.saturating_mul(1000);
        }
        config
    }

    pub fn with_grant(mut self, days: u32, quota_gb: u64) -> Self {
        self.grant_days = days;
        self.grant_quota_gb = quota_gb;
        self
    }

    pub fn with_device_limit(mut self, limit: usize) -> Self {
        self.device_limit = limit;
        self
    }

    /// Set the payable window, first poll delay and poll interval.
    pub fn with_timers(mut self, window: Duration, first_poll: Duration, interval: Duration) -> Self {
        self.invoice_window_ms = window.as_millis() as u64;
        self.first_poll_delay_ms = first_poll.as_millis() as u64;
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_reminder_every(mut self, polls: u32) -> Self {
        self.reminder_every = polls;
        self
    }

    pub fn with_max_grant_attempts(mut self, attempts: u32) -> Self {
        self.max_grant_attempts = attempts;
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_prices(mut self, prices: PriceTable) -> Self {
        self.prices = prices;
        self
    }

    pub fn with_compact_threshold(mut self, threshold: usize) -> Self {
        self.compact_threshold = threshold;
        self
    }

    pub fn with_uri_retry(mut self, retry: RetryPolicy) -> Self {
        self.uri_retry = retry;
        self
    }

    pub fn invoice_window(&self) -> Duration {
        Duration::from_millis(self.invoice_window_ms)
    }

    pub fn first_poll_delay(&self) -> Duration {
        Duration::from_millis(self.first_poll_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    /// Provider-side `expires_in`, rounded up to whole seconds.
    pub fn invoice_window_secs(&self) -> u64 {
        self.invoice_window_ms.div_ceil(1000).max(1)
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment variable");
            None
        }
    }
}
