//! Error type shared by the order, bill and checkout services
//!
//! Every variant maps to one HTTP status. Handlers return `CoreError` directly
//! and let `IntoResponse` build the JSON body.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::{DbErr, RuntimeErr};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Malformed or missing input, rejected before any write
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Bill code allocation failed after {attempts} attempts")]
    AllocationFailed { attempts: u32 },

    #[error("Database error: {0}")]
    Database(#[from] DbErr),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        CoreError::Conflict(msg.into())
    }

    /// Lock wait timeouts, deadlocks and serialization failures.
    ///
    /// The whole operation was rolled back and may be retried as-is.
    pub fn is_transient(&self) -> bool {
        match self {
            CoreError::Database(err) => match driver_code(err) {
                Some(code) => is_transient_code(&code),
                None => is_transient_message(&err.to_string()),
            },
            _ => false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::AllocationFailed { .. }) || self.is_transient()
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            CoreError::Validation(_) | CoreError::InvalidStatus(_) => StatusCode::BAD_REQUEST,
            CoreError::InvalidTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::PolicyViolation(_) => StatusCode::FORBIDDEN,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::AllocationFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Database(_) if self.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "VALIDATION_ERROR",
            CoreError::InvalidStatus(_) => "INVALID_STATUS",
            CoreError::InvalidTransition { .. } => "INVALID_TRANSITION",
            CoreError::PolicyViolation(_) => "POLICY_VIOLATION",
            CoreError::Conflict(_) => "CONFLICT",
            CoreError::NotFound { .. } => "NOT_FOUND",
            CoreError::AllocationFailed { .. } => "ALLOCATION_FAILED",
            CoreError::Database(_) if self.is_transient() => "TRANSIENT_STORE_ERROR",
            CoreError::Database(_) => "DATABASE_ERROR",
        }
    }
}

/// Postgres SQLSTATE 40P01 / 40001 / 55P03, SQLite BUSY / LOCKED
const TRANSIENT_CODES: &[&str] = &["40P01", "40001", "55P03", "5", "6"];

/// Error code reported by the database server, if the driver surfaced one
fn driver_code(err: &DbErr) -> Option<String> {
    match err {
        DbErr::Exec(RuntimeErr::SqlxError(e))
        | DbErr::Query(RuntimeErr::SqlxError(e))
        | DbErr::Conn(RuntimeErr::SqlxError(e)) => e
            .as_database_error()
            .and_then(|db| db.code())
            .map(|code| code.into_owned()),
        _ => None,
    }
}

fn is_transient_code(code: &str) -> bool {
    TRANSIENT_CODES.contains(&code)
}

/// Fallback for errors that carry no driver code
fn is_transient_message(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    msg.contains("deadlock")
        || msg.contains("lock timeout")
        || msg.contains("lock wait timeout")
        || msg.contains("could not serialize")
        || msg.contains("database is locked")
}

/// JSON body for every failed request
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_status: Option<String>,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "Request failed");
        } else {
            tracing::debug!(error = %self, code = self.code(), "Request rejected");
        }

        let (current_status, requested_status) = match &self {
            CoreError::InvalidTransition { from, to } => (Some(from.clone()), Some(to.clone())),
            _ => (None, None),
        };

        // Don't leak driver messages to clients
        let error = match &self {
            CoreError::Database(_) if !self.is_transient() => "Internal database error".to_string(),
            other => other.to_string(),
        };

        let body = ErrorResponse {
            error,
            code: self.code().to_string(),
            retryable: self.is_retryable(),
            current_status,
            requested_status,
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            CoreError::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            CoreError::conflict("nothing to checkout").status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            CoreError::not_found("order", 7).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            CoreError::PolicyViolation("no".into()).status_code(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_transient_detection() {
        let deadlock = CoreError::Database(DbErr::Custom("deadlock detected".into()));
        assert!(deadlock.is_transient());
        assert!(deadlock.is_retryable());
        assert_eq!(deadlock.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let other = CoreError::Database(DbErr::Custom("syntax error".into()));
        assert!(!other.is_transient());
        assert_eq!(other.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_transient_sqlstate_codes() {
        assert!(is_transient_code("40P01"));
        assert!(is_transient_code("40001"));
        assert!(is_transient_code("55P03"));
        // unique_violation is a hard failure
        assert!(!is_transient_code("23505"));
    }

    #[test]
    fn test_allocation_failure_is_retryable() {
        let err = CoreError::AllocationFailed { attempts: 40 };
        assert!(err.is_retryable());
        assert_eq!(err.code(), "ALLOCATION_FAILED");
    }

    #[test]
    fn test_not_found_message() {
        assert_eq!(CoreError::not_found("bill", 12).to_string(), "bill 12 not found");
    }
}
