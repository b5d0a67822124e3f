use thiserror::Error;

use crate::models::Privilege;

pub type Result<T> = std::result::Result<T, WorkbenchError>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum WorkbenchError {
    #[error("invalid input: {0}")]
    InputInvalid(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("tamper detected")]
    TamperDetected,
    #[error("session expired")]
    SessionExpired,
    #[error("session not found")]
    SessionNotFound,
    #[error("permission denied: {role} lacks {privilege} on {resource}")]
    PermissionDenied {
        role: String,
        privilege: Privilege,
        resource: String,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("cache miss: {0}")]
    Miss(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transaction expired: {0}")]
    TransactionExpired(String),
    #[error("multiple statements are not allowed here")]
    MultiStatementForbidden,
    #[error("query failed: {message}")]
    QueryFailed { message: String, transient: bool },
    #[error("malformed password hash")]
    MalformedHash,
    #[error("operation cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl WorkbenchError {
    pub fn query_failed(message: impl Into<String>) -> Self {
        WorkbenchError::QueryFailed {
            message: message.into(),
            transient: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        WorkbenchError::QueryFailed {
            message: message.into(),
            transient: true,
        }
    }

    pub fn poisoned<T>(_: T) -> Self {
        WorkbenchError::Internal("lock poisoned".to_string())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, WorkbenchError::QueryFailed { transient: true, .. })
    }

    /// Stable identifier used by the boundary when rendering errors.
    pub fn code(&self) -> &'static str {
        match self {
            WorkbenchError::InputInvalid(_) => "input_invalid",
            WorkbenchError::AuthFailed(_) => "auth_failed",
            WorkbenchError::TamperDetected => "tamper_detected",
            WorkbenchError::SessionExpired => "session_expired",
            WorkbenchError::SessionNotFound => "session_not_found",
            WorkbenchError::PermissionDenied { .. } => "permission_denied",
            WorkbenchError::NotFound(_) => "not_found",
            WorkbenchError::Miss(_) => "cache_miss",
            WorkbenchError::Conflict(_) => "conflict",
            WorkbenchError::TransactionExpired(_) => "transaction_expired",
            WorkbenchError::MultiStatementForbidden => "multi_statement_forbidden",
            WorkbenchError::QueryFailed { .. } => "query_failed",
            WorkbenchError::MalformedHash => "malformed_hash",
            WorkbenchError::Cancelled => "cancelled",
            WorkbenchError::Internal(_) => "internal",
        }
    }
}

impl From<sqlx::Error> for WorkbenchError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => WorkbenchError::query_failed(db.message()),
            sqlx::Error::Io(e) => WorkbenchError::transient(e.to_string()),
            sqlx::Error::PoolTimedOut => WorkbenchError::transient("connection pool timed out"),
            sqlx::Error::PoolClosed => WorkbenchError::transient("connection pool closed"),
            sqlx::Error::WorkerCrashed => WorkbenchError::transient("connection worker crashed"),
            sqlx::Error::RowNotFound => WorkbenchError::NotFound("row".to_string()),
            other => WorkbenchError::query_failed(other.to_string()),
        }
    }
}
