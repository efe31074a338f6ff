//! Common types and utilities shared between transdock-api and future clients

pub mod auth;
pub mod values;

use serde::{Deserialize, Serialize};

/// How a migration moves data from source to target
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferMethod {
    ZfsSend,
    Rsync,
}

impl Default for TransferMethod {
    fn default() -> Self {
        TransferMethod::ZfsSend
    }
}

impl std::fmt::Display for TransferMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZfsSend => write!(f, "zfs_send"),
            Self::Rsync => write!(f, "rsync"),
        }
    }
}

impl std::str::FromStr for TransferMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "zfs_send" => Ok(Self::ZfsSend),
            "rsync" => Ok(Self::Rsync),
            other => Err(Error::Validation {
                field: "transfer_method".to_string(),
                reason: format!("unknown transfer method: {}", other),
            }),
        }
    }
}

/// Error taxonomy shared by every service boundary.
///
/// Services never panic across a boundary; every fallible operation returns
/// `Result<T>` with one of these kinds. `code()` gives the stable string
/// used on the wire.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("operation failed: {0}")]
    Operation(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("remote error on {host}: {message}")]
    Remote {
        host: String,
        exit_code: Option<i32>,
        message: String,
    },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected error [{code}]: {message}")]
    Unexpected { code: String, message: String },
}

impl Error {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn unexpected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Unexpected {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Stable error code string for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::AlreadyExists(_) => "ALREADY_EXISTS",
            Error::Operation(_) => "OPERATION_FAILED",
            Error::Parse(_) => "PARSE_ERROR",
            Error::Remote { .. } => "REMOTE_ERROR",
            Error::Timeout(_) => "TIMEOUT",
            Error::Cancelled(_) => "CANCELLED",
            Error::Unavailable(_) => "UNAVAILABLE",
            Error::Unexpected { .. } => "UNEXPECTED_ERROR",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Operation(format!("I/O error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
