//! Prelude module for convenient imports.
//!
//! ```rust,ignore
//! use tunnelkit_lib::prelude::*;
//! ```
//!
//! ## What's Included
//!
//! - Core types: `AccountId`, `InvoiceId`
//! - Error types: `TunnelkitError`, `TunnelkitErrorCode`, `ErrorClass`, `Result`
//! - Provisioning: `ProvisioningClient`, `BlitzClient`, `PanelConfig`, `Entitlement`
//! - Payments: `PaymentProvider`, `CryptoPayClient`, `CryptoPayConfig`, `WebhookUpdate`

// Core types
pub use crate::{AccountId, InvoiceId};

// Error handling
pub use crate::errors::{ErrorClass, TunnelkitError, TunnelkitErrorCode};
pub use crate::Result;

// Provisioning
pub use crate::provisioning::{
    BlitzClient, Entitlement, ExtendOutcome, ExtendStrategy, PanelConfig, Provisioned,
    ProvisioningClient,
};

// Payments
pub use crate::payments::{
    CreatedInvoice, CryptoPayClient, CryptoPayConfig, InvoiceInfo, InvoiceRequest, InvoiceStatus,
    PaymentProvider, WebhookUpdate,
};

// Health and retry
pub use crate::health::{HealthCheckResult, HealthStatus};
pub use crate::retry::{with_retry, RetryPolicy};
