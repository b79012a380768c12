use axum::{
    http::StatusCode,
    response::{IntoResponse, Json},
};
use ::error_types::{error_codes, error_types, ErrorResponse};
use thiserror::Error;

use crate::models::QuotaDecision;

/// Failure of a persistent-store operation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Request-level error taxonomy.
///
/// Quota denial is a normal outcome of admission control, not an
/// exceptional condition; it carries the full decision so the handler can
/// emit remaining/reset information.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid value for {field}: {message}")]
    Validation { field: &'static str, message: String },

    #[error("invalid caller credential")]
    Auth,

    #[error("rate limit exceeded")]
    QuotaExceeded(QuotaDecision),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("trending recompute already in progress")]
    RecomputeInFlight,
}

impl SearchError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        SearchError::Validation {
            field,
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for SearchError {
    fn from(err: sqlx::Error) -> Self {
        SearchError::Store(StoreError::Database(err))
    }
}

impl IntoResponse for SearchError {
    fn into_response(self) -> axum::response::Response {
        // Quota denials have their own wire shape per the rate-limit
        // contract; everything else uses the shared ErrorResponse.
        if let SearchError::QuotaExceeded(decision) = &self {
            let message = match decision.reason {
                Some(crate::models::QuotaDenialReason::Daily) => "Daily rate limit exceeded",
                _ => "Hourly rate limit exceeded",
            };
            let body = serde_json::json!({
                "allowed": false,
                "remaining": decision.remaining,
                "limit": decision.limit,
                "reset_at": decision.reset_at.to_rfc3339(),
                "message": message,
            });
            return (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        }

        let (status, error_type, code) = match &self {
            SearchError::Validation { field, .. } => {
                let code = if *field == "sort_by" {
                    error_codes::INVALID_SORT_KEY
                } else {
                    error_codes::INVALID_FILTER
                };
                (StatusCode::BAD_REQUEST, error_types::VALIDATION_ERROR, code)
            }
            SearchError::Auth => (
                StatusCode::UNAUTHORIZED,
                error_types::AUTHENTICATION_ERROR,
                error_codes::CALLER_ID_INVALID,
            ),
            SearchError::RecomputeInFlight => (
                StatusCode::CONFLICT,
                error_types::CONFLICT_ERROR,
                error_codes::RECOMPUTE_IN_PROGRESS,
            ),
            SearchError::Store(err) => {
                // Never leak store detail to the caller.
                tracing::error!("store failure on request path: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    error_types::SERVER_ERROR,
                    error_codes::DATABASE_ERROR,
                )
            }
            SearchError::QuotaExceeded(_) => unreachable!("handled above"),
        };

        let message = match &self {
            SearchError::Store(_) => "Internal Server Error".to_string(),
            other => other.to_string(),
        };

        let response = ErrorResponse::new(
            match status {
                StatusCode::BAD_REQUEST => "Bad Request",
                StatusCode::UNAUTHORIZED => "Unauthorized",
                StatusCode::CONFLICT => "Conflict",
                _ => "Internal Server Error",
            },
            &message,
            status.as_u16(),
            error_type,
            code,
        );

        (status, Json(response)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_message_names_field() {
        let err = SearchError::validation("sort_by", "unknown sort key 'hot'");
        assert!(err.to_string().contains("sort_by"));
    }

    #[test]
    fn test_store_error_wraps_sqlx() {
        let err: SearchError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, SearchError::Store(StoreError::Database(_))));
    }
}
