//! Error taxonomy shared by every layer of the store.
//!
//! Each [`Error`] maps to a stable, machine-readable [`ErrorCode`]. Callers that
//! expose errors over a wire should use [`Error::code`] and
//! [`ErrorCode::public_message`] rather than the `Display` output, which may
//! carry internal detail.

use serde::Serialize;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Message SQLite triggers raise when a row fails a tenant policy check.
pub(crate) const POLICY_VIOLATION_MESSAGE: &str = "tenant policy violation";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A read or write was attempted without a valid tenant context, or the
    /// store rejected a row whose tenant does not match the active context.
    #[error("isolation violation: {0}")]
    IsolationViolation(String),
    /// An envelope could not be opened. `Display` stays generic; the fault is
    /// only surfaced through [`Error::audit_detail`].
    #[error("access denied")]
    DecryptionFailure(DecryptFault),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    Validation(String),
    /// Transient store or pool failure. Safe for the caller to retry.
    #[error("storage unavailable: {0}")]
    Storage(String),
    #[error("misconfigured: {0}")]
    Config(String),
}

/// Why an envelope failed to open. Recorded in the audit trail, never returned
/// to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptFault {
    /// Shorter than a nonce plus a tag.
    Truncated,
    /// Tag verification failed: wrong key, or a ciphertext moved to another
    /// tenant, chunk or column, or tampered bytes.
    TagMismatch,
    /// Authenticated, but the text column is not UTF-8.
    NotUtf8,
    /// Authenticated, but the metadata column is not JSON.
    NotJson,
}

impl DecryptFault {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Truncated => "envelope truncated",
            Self::TagMismatch => "authentication tag mismatch",
            Self::NotUtf8 => "plaintext is not utf-8",
            Self::NotJson => "metadata plaintext is not json",
        }
    }
}

/// Stable error codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    IsolationViolation,
    DecryptionFailure,
    NotFound,
    ValidationFailed,
    StorageUnavailable,
    Misconfigured,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IsolationViolation => "isolation_violation",
            Self::DecryptionFailure => "decryption_failure",
            Self::NotFound => "not_found",
            Self::ValidationFailed => "validation_failed",
            Self::StorageUnavailable => "storage_unavailable",
            Self::Misconfigured => "misconfigured",
        }
    }

    /// Caller-facing message. Decryption and isolation failures collapse into
    /// the same generic text so responses do not reveal which layer refused.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::IsolationViolation | Self::DecryptionFailure => "access denied",
            Self::NotFound => "not found",
            Self::ValidationFailed => "invalid request",
            Self::StorageUnavailable => "storage temporarily unavailable",
            Self::Misconfigured => "service misconfigured",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::IsolationViolation(_) => ErrorCode::IsolationViolation,
            Self::DecryptionFailure(_) => ErrorCode::DecryptionFailure,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Validation(_) => ErrorCode::ValidationFailed,
            Self::Storage(_) => ErrorCode::StorageUnavailable,
            Self::Config(_) => ErrorCode::Misconfigured,
        }
    }

    /// Detail for the audit trail. Unlike `Display`, names the cause of a
    /// decryption failure. Never contains plaintext.
    pub fn audit_detail(&self) -> String {
        match self {
            Self::DecryptionFailure(fault) => format!("decryption failure: {}", fault.as_str()),
            other => other.to_string(),
        }
    }

    /// Only transient storage failures are worth retrying. Retrying a crypto or
    /// isolation failure with the same inputs can never succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, message) = &err {
            let message = message.clone().unwrap_or_default();
            if message.contains(POLICY_VIOLATION_MESSAGE) {
                return Self::IsolationViolation(message);
            }
            // Constraint failures are caused by the request, not the store.
            if failure.code == rusqlite::ErrorCode::ConstraintViolation {
                return Self::Validation(message);
            }
        }
        Self::Storage(err.to_string())
    }
}

impl From<r2d2::Error> for Error {
    fn from(err: r2d2::Error) -> Self {
        Self::Storage(format!("connection pool: {err}"))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Storage(format!("worker task failed: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("metadata is not valid JSON: {err}"))
    }
}

/// An error as returned from a vault operation: the underlying [`Error`] plus
/// the request id that correlates it with the audit trail and logs.
#[derive(Debug, thiserror::Error)]
#[error("{code} (request {request_id}): {}", .code.public_message())]
pub struct Rejection {
    pub request_id: String,
    pub code: ErrorCode,
    #[source]
    pub error: Error,
}

impl Rejection {
    pub fn new(request_id: impl Into<String>, error: Error) -> Self {
        Self {
            request_id: request_id.into(),
            code: error.code(),
            error,
        }
    }

    /// Wire-safe representation: code, generic message, request id.
    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code,
            message: self.code.public_message(),
            request_id: self.request_id.clone(),
            retryable: self.error.is_retryable(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: &'static str,
    pub request_id: String,
    pub retryable: bool,
}
