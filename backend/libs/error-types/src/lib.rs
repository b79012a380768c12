use serde::{Deserialize, Serialize};

/// Uniform API error response body used by all services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short error label.
    pub error: String,

    /// Human-readable message.
    pub message: String,

    /// HTTP status code.
    pub status: u16,

    /// Error category used by clients for routing (see [`error_types`]).
    pub error_type: String,

    /// Stable machine code used for client-side localization and tracking.
    pub code: String,

    /// Optional detail, only populated in development environments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,

    /// Request trace id for log correlation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    /// ISO 8601 timestamp.
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, status: u16, error_type: &str, code: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            status,
            error_type: error_type.to_string(),
            code: code.to_string(),
            details: None,
            trace_id: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_details(mut self, details: String) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_trace_id(mut self, trace_id: String) -> Self {
        self.trace_id = Some(trace_id);
        self
    }
}

/// Stable error codes, grouped by concern.
pub mod error_codes {
    // Caller identity
    pub const CALLER_ID_INVALID: &str = "CALLER_ID_INVALID";

    // Search
    pub const INVALID_SORT_KEY: &str = "INVALID_SORT_KEY";
    pub const INVALID_FILTER: &str = "INVALID_FILTER";
    pub const SOURCE_UNAVAILABLE: &str = "SOURCE_UNAVAILABLE";

    // Quota
    pub const RATE_LIMIT_ERROR: &str = "RATE_LIMIT_EXCEEDED";

    // Trending
    pub const RECOMPUTE_IN_PROGRESS: &str = "RECOMPUTE_IN_PROGRESS";

    // Database/System
    pub const DATABASE_ERROR: &str = "DATABASE_ERROR";
    pub const CACHE_ERROR: &str = "CACHE_ERROR";
    pub const INTERNAL_SERVER_ERROR: &str = "INTERNAL_SERVER_ERROR";
    pub const SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";
}

/// Standard error categories.
pub mod error_types {
    pub const VALIDATION_ERROR: &str = "validation_error";
    pub const AUTHENTICATION_ERROR: &str = "authentication_error";
    pub const NOT_FOUND_ERROR: &str = "not_found_error";
    pub const CONFLICT_ERROR: &str = "conflict_error";
    pub const RATE_LIMIT_ERROR: &str = "rate_limit_error";
    pub const SERVER_ERROR: &str = "server_error";
    pub const SERVICE_UNAVAILABLE_ERROR: &str = "service_unavailable_error";
}
