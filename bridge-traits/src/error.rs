//! Errors reported by host bridges.

use std::time::Duration;
use thiserror::Error;

/// Failure of a host capability.
///
/// Messages end up in user-visible auth errors, so they must never contain
/// tokens or stored secrets.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The capability exists but cannot be used right now (locked keychain,
    /// no network interface, missing platform service).
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

impl BridgeError {
    /// Whether trying again later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BridgeError::NotAvailable(_) | BridgeError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(BridgeError::Timeout(Duration::from_secs(5)).is_transient());
        assert!(BridgeError::NotAvailable("keychain locked".into()).is_transient());
        assert!(!BridgeError::OperationFailed("bad entry".into()).is_transient());
    }
}
