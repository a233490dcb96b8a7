//! Error types for PinWallet

use crate::ledger::{WalletId, WalletStatus};
use crate::rate_guard::Bucket;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    InvalidPinFormat,
    IncorrectPin,
    WalletNotFound(WalletId),
    InvalidAmount(String),
    InsufficientFunds {
        wallet: WalletId,
        available: i64,
        requested: i64,
    },
    SelfTransferNotAllowed,
    RateLimitExceeded {
        bucket: Bucket,
        retry_after: Duration,
    },
    /// Transient; the whole operation may be retried.
    ConcurrencyConflict(String),
    StorageFailure(String),
    WalletInactive {
        wallet: WalletId,
        status: WalletStatus,
    },
}

impl WalletError {
    /// Only lock/version conflicts are safe to retry from the top.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WalletError::ConcurrencyConflict(_))
    }
}

impl fmt::Display for WalletError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WalletError::InvalidPinFormat => write!(f, "PIN must be exactly 4 digits"),
            WalletError::IncorrectPin => write!(f, "Incorrect PIN"),
            WalletError::WalletNotFound(id) => write!(f, "Wallet {} not found", id),
            WalletError::InvalidAmount(msg) => write!(f, "Invalid amount: {}", msg),
            WalletError::InsufficientFunds {
                wallet,
                available,
                requested,
            } => write!(
                f,
                "Insufficient funds in wallet {}: available {}, requested {}",
                wallet,
                crate::money::format_minor(*available),
                crate::money::format_minor(*requested)
            ),
            WalletError::SelfTransferNotAllowed => {
                write!(f, "Cannot transfer to the same wallet")
            }
            WalletError::RateLimitExceeded {
                bucket,
                retry_after,
            } => write!(
                f,
                "Rate limit exceeded for {}; retry after {}s",
                bucket,
                retry_after.as_secs().max(1)
            ),
            WalletError::ConcurrencyConflict(msg) => write!(f, "Concurrency conflict: {}", msg),
            WalletError::StorageFailure(msg) => write!(f, "Storage failure: {}", msg),
            WalletError::WalletInactive { wallet, status } => {
                write!(f, "Wallet {} is {}", wallet, status)
            }
        }
    }
}

impl std::error::Error for WalletError {}

impl From<rusqlite::Error> for WalletError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                WalletError::ConcurrencyConflict(err.to_string())
            }
            _ => WalletError::StorageFailure(err.to_string()),
        }
    }
}

impl From<std::io::Error> for WalletError {
    fn from(err: std::io::Error) -> Self {
        WalletError::StorageFailure(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, WalletError>;
