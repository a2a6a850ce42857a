//! # Tunnelkit Subscriptions
//!
//! Durable state and reconciliation for time-boxed panel access sold
//! through a crypto payment provider.
//!
//! ## Consistency model
//! - Every store is backed by an append-only, checksummed journal; the
//!   in-memory view only changes after the journal line is on disk
//! - All grant work for one account runs under a per-account lock, and the
//!   invoice idempotency check happens under that same lock
//! - Expiry never moves backwards through a grant; only drift sync may
//!   write an authoritative (possibly lower) expiry
//! - A confirmed payment whose grant fails always leaves a retry record
//! - An authority "not found" never deletes a local subscription

pub mod amount;
pub mod config;
pub mod devices;
pub mod engine;
pub mod invoice;
pub mod journal;
pub mod locks;
pub mod notify;
pub mod promo;
pub mod retry_queue;
pub mod storage;
pub mod subscription;
pub mod sync;
pub mod watcher;

pub use amount::Amount;
pub use config::{EngineConfig, PriceTable};
pub use devices::{Device, DeviceRegistry, FileDeviceRegistry, RegisterOutcome};
pub use engine::{
    EntitlementStatus, GrantKind, GrantReport, InvoiceHandle, PaymentCheck, PromoGrant,
    ReconciliationEngine, ResumeReport, RetryOutcome, SettleOutcome, SettleTrigger, WebhookAck,
};
pub use invoice::{InvoiceOutcome, InvoiceState, PendingInvoice};
pub use notify::{Notice, Notifier, NoopNotifier, RecordingNotifier};
pub use promo::{FilePromoLedger, PromoCode, PromoLedger, PromoRedemption, RedeemOutcome};
pub use retry_queue::{GrantRetry, GrantRetryQueue, GrantSource, RetryStatus};
pub use storage::{FileInvoiceLedger, FileSubscriptionStore, InvoiceLedger, Stores, SubscriptionStore};
pub use subscription::{ExpiryWrite, Subscription, SubscriptionPatch};
pub use sync::{DriftSync, SyncReport};

pub use tunnelkit_lib::{AccountId, ErrorClass, InvoiceId};

pub type Result<T> = anyhow::Result<T>;

#[derive(thiserror::Error, Debug)]
pub enum SubscriptionError {
    #[error("transient provider error: {0}")]
    TransientProvider(String),
    #[error("provider rejected request: {0}")]
    PermanentProvider(String),
    #[error("local state disagrees with authority: {0}")]
    DataInconsistency(String),
    #[error("promo code {code} already redeemed by account {account}")]
    DuplicateRedemption { account: AccountId, code: String },
    #[error("promo code {0} has no activations left")]
    RedemptionLimitExhausted(String),
    #[error("device limit of {max} reached")]
    DeviceLimitExceeded { max: usize },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt journal {path} at line {line}: {reason}")]
    CorruptJournal {
        path: String,
        line: usize,
        reason: String,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl SubscriptionError {
    /// Class of a propagated error.
    ///
    /// Looks through the anyhow chain for either a [`SubscriptionError`] or
    /// a [`tunnelkit_lib::TunnelkitError`]; I/O failures count as transient
    /// and anything unrecognised as permanent.
    pub fn classify(err: &anyhow::Error) -> ErrorClass {
        for cause in err.chain() {
            if let Some(e) = cause.downcast_ref::<SubscriptionError>() {
                return e.class();
            }
            if let Some(e) = cause.downcast_ref::<tunnelkit_lib::TunnelkitError>() {
                return e.class();
            }
            if cause.downcast_ref::<std::io::Error>().is_some() {
                return ErrorClass::Transient;
            }
        }
        ErrorClass::Permanent
    }

    /// Class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            SubscriptionError::TransientProvider(_) | SubscriptionError::Storage(_) => {
                ErrorClass::Transient
            }
            _ => ErrorClass::Permanent,
        }
    }
}

impl From<tunnelkit_lib::TunnelkitError> for SubscriptionError {
    fn from(err: tunnelkit_lib::TunnelkitError) -> Self {
        match err.class() {
            ErrorClass::Transient => SubscriptionError::TransientProvider(err.to_string()),
            ErrorClass::Permanent => SubscriptionError::PermanentProvider(err.to_string()),
        }
    }
}

impl From<std::io::Error> for SubscriptionError {
    fn from(err: std::io::Error) -> Self {
        SubscriptionError::Storage(err.to_string())
    }
}
