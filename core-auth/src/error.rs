use bridge_traits::error::BridgeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Input rejected locally; no request was made
    #[error("Invalid input: {0}")]
    Validation(String),

    /// The backend answered and refused the request
    #[error("{message}")]
    BackendRejected {
        status: Option<u16>,
        message: String,
    },

    /// The backend could not be reached or its reply could not be read
    #[error("Network error: {0}")]
    Network(String),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Secure storage unavailable: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn rejected(message: impl Into<String>) -> Self {
        AuthError::BackendRejected {
            status: None,
            message: message.into(),
        }
    }

    /// Maps a failure of the HTTP bridge.
    pub fn transport(err: BridgeError) -> Self {
        AuthError::Network(err.to_string())
    }

    /// Maps a failure of the secure storage bridge.
    pub fn storage(err: BridgeError) -> Self {
        AuthError::Storage(err.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::Validation(_) => ErrorKind::Validation,
            AuthError::BackendRejected { .. } => ErrorKind::BackendRejected,
            AuthError::Network(_) => ErrorKind::Network,
            AuthError::NotAuthenticated => ErrorKind::NotAuthenticated,
            AuthError::Storage(_) => ErrorKind::Storage,
            AuthError::Configuration(_) => ErrorKind::Configuration,
            AuthError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the user can reasonably try again.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            AuthError::Configuration(_) | AuthError::Internal(_) | AuthError::Storage(_)
        )
    }

    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<core_runtime::Error> for AuthError {
    fn from(err: core_runtime::Error) -> Self {
        AuthError::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;

/// Error category as exposed in state and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    BackendRejected,
    Network,
    NotAuthenticated,
    Storage,
    Configuration,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::BackendRejected => "backend_rejected",
            ErrorKind::Network => "network",
            ErrorKind::NotAuthenticated => "not_authenticated",
            ErrorKind::Storage => "storage",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The last failure, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}
