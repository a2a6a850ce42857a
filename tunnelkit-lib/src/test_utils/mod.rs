//! Test utilities for Tunnelkit.
//!
//! In-memory stand-ins for the two external services:
//! - [`MockAuthority`]: a provisioning panel whose extension rungs,
//!   lookups and URI generation can be made to fail on demand
//! - [`MockPaymentProvider`]: a payment provider whose invoices are paid
//!   or expired by the test
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tunnelkit_lib::test_utils::{MockAuthority, MockPaymentProvider};
//!
//! let panel = MockAuthority::new();
//! panel.configure(|f| f.fail_replace = true);
//! let outcome = panel.extend("vpn_1", 30).await?;
//! assert_eq!(outcome.strategy, ExtendStrategy::Patch);
//! ```

mod mock_authority;
mod mock_payments;

pub use mock_authority::{AuthorityCalls, FailureModes, MockAuthority};
pub use mock_payments::MockPaymentProvider;
