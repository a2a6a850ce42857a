//! Error types for Tunnelkit client operations.
//!
//! This module provides structured error types for the provisioning panel
//! and payment provider adapters, so callers can decide between retrying,
//! surfacing a failure to the account holder, or recovering (for example a
//! create that hit an existing panel user).

use std::fmt;

/// Error codes for callers that need a stable numeric identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TunnelkitErrorCode {
    /// Transport/network layer error
    Transport = 2000,
    /// Connection failed
    ConnectionFailed = 2001,
    /// Connection timeout
    ConnectionTimeout = 2002,
    /// Upstream returned a server error
    Upstream = 2003,
    /// Authentication/authorization error
    Auth = 3000,
    /// Resource not found
    NotFound = 4000,
    /// Resource already exists
    AlreadyExists = 4001,
    /// Resource exists but is not ready yet
    Unavailable = 4002,
    /// Request rejected by upstream
    Rejected = 5000,
    /// Invalid request/data
    InvalidData = 5001,
    /// Serialization error
    Serialization = 5002,
    /// Every extension strategy failed
    ExtendExhausted = 6000,
    /// Recreate deleted the user but could not create it again
    RecreateIncomplete = 6001,
    /// Rate limited
    RateLimited = 8000,
    /// Internal/unexpected error
    Internal = 9999,
}

/// Whether an error is worth retrying automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network failures, timeouts, 5xx and rate limits.
    Transient,
    /// The upstream understood the request and refused it.
    Permanent,
}

/// Comprehensive error type for Tunnelkit client operations.
#[derive(Debug)]
pub enum TunnelkitError {
    /// Transport/network layer error.
    Transport(String),

    /// Connection failed.
    ConnectionFailed {
        /// Target endpoint or service
        target: String,
        /// Underlying error message
        reason: String,
    },

    /// Connection timeout.
    ConnectionTimeout {
        /// Operation that timed out
        operation: String,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Upstream answered with a 5xx status.
    Upstream {
        /// Service name ("panel", "cryptopay")
        service: String,
        /// HTTP status code
        status: u16,
        /// Response body (truncated by the caller if large)
        body: String,
    },

    /// Authentication or authorization failed.
    Auth(String),

    /// Resource not found (panel user, invoice).
    NotFound {
        /// Type of resource (e.g., "panel user", "invoice")
        resource_type: String,
        /// Resource identifier
        identifier: String,
    },

    /// The panel already has a user with this name.
    AlreadyExists {
        /// Panel username
        username: String,
    },

    /// The resource exists but has not materialized the requested value yet.
    Unavailable {
        /// What was requested (e.g., "credential uri")
        what: String,
        /// Resource identifier
        identifier: String,
    },

    /// Upstream rejected the request with a 4xx status.
    Rejected {
        /// Service name
        service: String,
        /// HTTP status code
        status: u16,
        /// Rejection reason
        reason: String,
    },

    /// Invalid data provided.
    InvalidData {
        /// Field or parameter name
        field: String,
        /// Reason for invalidity
        reason: String,
    },

    /// Serialization/deserialization error.
    Serialization(String),

    /// All strategies of the extension ladder failed.
    ExtendExhausted {
        /// Panel username
        username: String,
        /// Last error observed on the final rung
        last_error: String,
    },

    /// The recreate rung deleted the user and the following create failed.
    /// The panel no longer has the user.
    RecreateIncomplete {
        /// Panel username
        username: String,
        /// Why the create failed
        reason: String,
    },

    /// Rate limited, should retry after delay.
    RateLimited {
        /// Suggested retry delay in milliseconds
        retry_after_ms: u64,
    },

    /// Internal/unexpected error.
    Internal(String),
}

impl TunnelkitError {
    /// Get the numeric error code.
    pub fn code(&self) -> TunnelkitErrorCode {
        match self {
            Self::Transport(_) => TunnelkitErrorCode::Transport,
            Self::ConnectionFailed { .. } => TunnelkitErrorCode::ConnectionFailed,
            Self::ConnectionTimeout { .. } => TunnelkitErrorCode::ConnectionTimeout,
            Self::Upstream { .. } => TunnelkitErrorCode::Upstream,
            Self::Auth(_) => TunnelkitErrorCode::Auth,
            Self::NotFound { .. } => TunnelkitErrorCode::NotFound,
            Self::AlreadyExists { .. } => TunnelkitErrorCode::AlreadyExists,
            Self::Unavailable { .. } => TunnelkitErrorCode::Unavailable,
            Self::Rejected { .. } => TunnelkitErrorCode::Rejected,
            Self::InvalidData { .. } => TunnelkitErrorCode::InvalidData,
            Self::Serialization(_) => TunnelkitErrorCode::Serialization,
            Self::ExtendExhausted { .. } => TunnelkitErrorCode::ExtendExhausted,
            Self::RecreateIncomplete { .. } => TunnelkitErrorCode::RecreateIncomplete,
            Self::RateLimited { .. } => TunnelkitErrorCode::RateLimited,
            Self::Internal(_) => TunnelkitErrorCode::Internal,
        }
    }

    /// Returns true if this error is potentially recoverable by retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::ConnectionFailed { .. }
                | Self::ConnectionTimeout { .. }
                | Self::Upstream { .. }
                | Self::RateLimited { .. }
                | Self::Unavailable { .. }
        )
    }

    /// Classify the error for the reconciliation layer.
    pub fn class(&self) -> ErrorClass {
        if self.is_retryable() {
            ErrorClass::Transient
        } else {
            ErrorClass::Permanent
        }
    }

    /// Returns a suggested retry delay in milliseconds, if applicable.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            Self::ConnectionTimeout { .. } => Some(1000),
            Self::ConnectionFailed { .. } => Some(2000),
            Self::Transport(_) | Self::Upstream { .. } => Some(1000),
            Self::Unavailable { .. } => Some(500),
            _ => None,
        }
    }

    /// Returns true if the panel reported the user as missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if the user is gone from the panel after a recreate
    /// attempt and has to be created from scratch.
    pub fn is_recreate_incomplete(&self) -> bool {
        matches!(self, Self::RecreateIncomplete { .. })
    }

    /// Create a not found error.
    pub fn not_found(resource_type: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self::NotFound {
            resource_type: resource_type.into(),
            identifier: identifier.into(),
        }
    }

    /// Create an invalid data error.
    pub fn invalid_data(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidData {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Map a non-success HTTP status into the error taxonomy.
    pub fn from_status(service: &str, status: u16, body: &str) -> Self {
        match status {
            401 | 403 => Self::Auth(format!("{} refused credentials ({})", service, status)),
            404 => Self::NotFound {
                resource_type: format!("{} resource", service),
                identifier: body.to_string(),
            },
            429 => Self::RateLimited {
                retry_after_ms: 5000,
            },
            500..=599 => Self::Upstream {
                service: service.to_string(),
                status,
                body: body.to_string(),
            },
            400..=499 => Self::Rejected {
                service: service.to_string(),
                status,
                reason: body.to_string(),
            },
            _ => Self::Transport(format!(
                "{} request failed ({}): {}",
                service, status, body
            )),
        }
    }
}

impl fmt::Display for TunnelkitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "transport error: {}", msg),
            Self::ConnectionFailed { target, reason } => {
                write!(f, "connection to {} failed: {}", target, reason)
            }
            Self::ConnectionTimeout {
                operation,
                timeout_ms,
            } => {
                write!(f, "{} timed out after {}ms", operation, timeout_ms)
            }
            Self::Upstream {
                service,
                status,
                body,
            } => write!(f, "{} server error ({}): {}", service, status, body),
            Self::Auth(msg) => write!(f, "authentication error: {}", msg),
            Self::NotFound {
                resource_type,
                identifier,
            } => {
                write!(f, "{} not found: {}", resource_type, identifier)
            }
            Self::AlreadyExists { username } => {
                write!(f, "panel user {} already exists", username)
            }
            Self::Unavailable { what, identifier } => {
                write!(f, "{} for {} is not available yet", what, identifier)
            }
            Self::Rejected {
                service,
                status,
                reason,
            } => write!(f, "{} rejected request ({}): {}", service, status, reason),
            Self::InvalidData { field, reason } => {
                write!(f, "invalid {}: {}", field, reason)
            }
            Self::Serialization(msg) => write!(f, "serialization error: {}", msg),
            Self::ExtendExhausted {
                username,
                last_error,
            } => write!(
                f,
                "every extension strategy failed for {}: {}",
                username, last_error
            ),
            Self::RecreateIncomplete { username, reason } => write!(
                f,
                "panel user {} was deleted for recreate but not created again: {}",
                username, reason
            ),
            Self::RateLimited { retry_after_ms } => {
                write!(f, "rate limited, retry after {}ms", retry_after_ms)
            }
            Self::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for TunnelkitError {}

impl From<serde_json::Error> for TunnelkitError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = TunnelkitError::RateLimited {
            retry_after_ms: 1000,
        };
        assert_eq!(err.code(), TunnelkitErrorCode::RateLimited);
        assert!(err.is_retryable());
        assert_eq!(err.retry_after_ms(), Some(1000));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            TunnelkitError::from_status("panel", 503, "down").class(),
            ErrorClass::Transient
        );
        assert_eq!(
            TunnelkitError::from_status("panel", 422, "bad days").class(),
            ErrorClass::Permanent
        );
        assert!(TunnelkitError::from_status("panel", 404, "vpn_1").is_not_found());
        assert_eq!(
            TunnelkitError::from_status("panel", 401, "").code(),
            TunnelkitErrorCode::Auth
        );
    }

    #[test]
    fn test_unavailable_is_transient() {
        let err = TunnelkitError::Unavailable {
            what: "credential uri".to_string(),
            identifier: "vpn_7".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(err.to_string().contains("vpn_7"));
    }

    #[test]
    fn test_helper_constructors() {
        let err = TunnelkitError::not_found("panel user", "vpn_1");
        assert_eq!(err.code(), TunnelkitErrorCode::NotFound);

        let err = TunnelkitError::RecreateIncomplete {
            username: "vpn_1".to_string(),
            reason: "server error".to_string(),
        };
        assert!(err.is_recreate_incomplete());
        assert_eq!(err.class(), ErrorClass::Permanent);

        let err = TunnelkitError::invalid_data("days", "must be positive");
        assert_eq!(err.code(), TunnelkitErrorCode::InvalidData);
        assert_eq!(err.class(), ErrorClass::Permanent);
    }
}
