//! Error types raised by the financial state engine.
//!
//! Domain errors are returned to the caller untouched; storage failures abort
//! the enclosing session and surface as [`EstateError::Storage`].

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Errors produced by engine operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EstateError {
    /// Wallet debit denied
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Decimal, available: Decimal },

    /// Rewards payout denied
    #[error("Insufficient rewards: required {required}, available {available}")]
    InsufficientRewards { required: Decimal, available: Decimal },

    /// Share allocation against a closed or over-subscribed asset
    #[error("Shares not available for asset {asset_id}: requested {requested}, available {available}")]
    NotAvailable {
        asset_id: Uuid,
        requested: u32,
        available: u32,
    },

    /// Workflow state transition not permitted
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// The user already has a pending withdrawal request
    #[error("User {user_id} already has a pending withdrawal request")]
    ConcurrentRequest { user_id: Uuid },

    /// Referral code not found for the asset
    #[error("Unknown referral code {code} for asset {asset_id}")]
    UnknownCode { code: String, asset_id: Uuid },

    /// Rejected input: non-positive amounts, missing KYC fields, unknown enum values
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Referenced entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller is not allowed to perform the action
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Persistence failure; the enclosing session is aborted
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl EstateError {
    /// Create an invalid input error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::NotFound(message.into())
    }

    /// Create a storage error
    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::Storage(message.into())
    }

    /// Create an invalid transition error from two displayable states
    pub fn transition(from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Returns true for errors caused by the caller rather than the system
    pub fn is_domain(&self) -> bool {
        !matches!(self, Self::Storage(_) | Self::Configuration(_))
    }
}

impl From<config::ConfigError> for EstateError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Type alias for engine results
pub type EstateResult<T> = Result<T, EstateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EstateError::InsufficientFunds {
            required: Decimal::new(300, 0),
            available: Decimal::new(200, 0),
        };
        assert_eq!(
            err.to_string(),
            "Insufficient funds: required 300, available 200"
        );
    }

    #[test]
    fn test_domain_classification() {
        assert!(EstateError::invalid("amount must be positive").is_domain());
        assert!(!EstateError::storage("connection reset").is_domain());
    }
}
