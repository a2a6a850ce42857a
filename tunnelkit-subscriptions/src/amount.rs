//! Fixed-point invoice amounts.
//!
//! Crypto prices carry up to 18 decimals (ETH) and must round-trip through
//! the payment provider's string fields unchanged, so amounts are
//! `rust_decimal::Decimal` and serialize as strings. Never `f64`.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Invoice amount in units of its asset.
///
/// ```rust
/// use tunnelkit_subscriptions::Amount;
///
/// let price = Amount::from_str_checked("0.000015").unwrap();
/// assert_eq!(price.to_string(), "0.000015");
/// assert!(price.is_positive());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount {
    value: Decimal,
}

impl Amount {
    /// Wrap a decimal.
    pub const fn from_decimal(value: Decimal) -> Self {
        Self { value }
    }

    /// Parse a decimal string such as `"1.5"`.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a decimal number.
    pub fn from_str_checked(s: &str) -> Result<Self, String> {
        Decimal::from_str(s.trim())
            .map(|value| Self { value })
            .map_err(|e| format!("Invalid amount: {}", e))
    }

    /// Zero.
    pub fn zero() -> Self {
        Self {
            value: Decimal::ZERO,
        }
    }

    pub fn as_decimal(&self) -> Decimal {
        self.value
    }

    /// Strictly greater than zero.
    pub fn is_positive(&self) -> bool {
        self.value > Decimal::ZERO
    }

    /// Checked addition (returns None on overflow)
    pub fn checked_add(&self, other: &Self) -> Option<Self> {
        self.value
            .checked_add(other.value)
            .map(|value| Self { value })
    }

    /// Same value with trailing zeros removed (`"1.50"` becomes `"1.5"`).
    pub fn normalized(&self) -> Self {
        Self {
            value: self.value.normalize(),
        }
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl FromStr for Amount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_checked(s)
    }
}

impl From<Decimal> for Amount {
    fn from(value: Decimal) -> Self {
        Self { value }
    }
}
