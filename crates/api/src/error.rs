//! API error types and HTTP response mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use promptmeter_billing::BillingError;

use crate::completion::CompletionError;

pub type ApiResult<T> = Result<T, ApiError>;

/// Errors surfaced by API handlers
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Admission denied by the quota check. A denial is an expected outcome,
    /// not a fault; it carries the remaining balance for the client.
    #[error("{message}")]
    QuotaDenied { message: String, remaining: i64 },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::Unauthorized(message) => (
                StatusCode::UNAUTHORIZED,
                json!({"error": message}),
            ),
            ApiError::QuotaDenied { message, remaining } => (
                StatusCode::FORBIDDEN,
                json!({"error": message, "remaining": remaining}),
            ),
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                json!({"error": message}),
            ),
            ApiError::NotFound(message) => (
                StatusCode::NOT_FOUND,
                json!({"error": message}),
            ),
            ApiError::Billing(BillingError::WebhookSignatureInvalid) => (
                StatusCode::BAD_REQUEST,
                json!({"error": "Invalid webhook signature"}),
            ),
            ApiError::Billing(BillingError::WebhookPayloadInvalid(details)) => (
                StatusCode::BAD_REQUEST,
                json!({"error": format!("Invalid webhook payload: {}", details)}),
            ),
            ApiError::Billing(BillingError::InvalidParameter(details)) => (
                StatusCode::BAD_REQUEST,
                json!({"error": details}),
            ),
            // Commit-time denial: a racing request drained the balance after
            // this one was admitted. Same shape as a gate denial.
            ApiError::Billing(BillingError::QuotaExceeded { remaining, required }) => (
                StatusCode::FORBIDDEN,
                json!({
                    "error": format!(
                        "Insufficient quota. Remaining: {}, Required: {}",
                        remaining, required
                    ),
                    "remaining": remaining,
                }),
            ),
            ApiError::Billing(err) => {
                tracing::error!(error = %err, "Billing operation failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"error": "Internal server error"}),
                )
            }
            ApiError::Completion(err @ CompletionError::Configuration(_)) => {
                tracing::error!(error = %err, "Completion provider misconfigured");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"error": "Completion provider not configured"}),
                )
            }
            ApiError::Completion(err) => {
                tracing::error!(error = %err, "Upstream completion failed");
                (
                    StatusCode::BAD_GATEWAY,
                    json!({"error": "Upstream completion provider error"}),
                )
            }
            ApiError::Database(err) => {
                tracing::error!(error = %err, "Database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"error": "Internal server error"}),
                )
            }
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"error": "Internal server error"}),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_denied_maps_to_forbidden() {
        let err = ApiError::QuotaDenied {
            message: "Insufficient quota. Remaining: 5, Required: 100".to_string(),
            remaining: 5,
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_commit_time_denial_maps_to_forbidden() {
        let err = ApiError::Billing(BillingError::QuotaExceeded {
            remaining: 400,
            required: 600,
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_signature_failure_maps_to_bad_request() {
        let err = ApiError::Billing(BillingError::WebhookSignatureInvalid);
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_database_error_is_opaque() {
        let err = ApiError::Database(sqlx::Error::PoolClosed);
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
