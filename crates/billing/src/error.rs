//! Billing error types
//!
//! One tagged enum so callers can match exhaustively and apply different
//! retry policies per kind. Admission denial is deliberately NOT an error;
//! it is a normal `QuotaCheckResult` value.

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Webhook signature did not verify. Rejected outright as a client
    /// error; the provider retries delivery on its own schedule.
    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    /// Webhook payload parsed as JSON but did not match the expected shape.
    #[error("Webhook payload invalid: {0}")]
    WebhookPayloadInvalid(String),

    /// Re-checked admission failed at commit time: another writer consumed
    /// the balance between the caller's gate and this commit. The charge is
    /// not applied.
    #[error("Insufficient quota. Remaining: {remaining}, Required: {required}")]
    QuotaExceeded { remaining: i64, required: i64 },

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    /// Conditional update lost to a concurrent writer more times than the
    /// retry budget allows.
    #[error("Concurrent update conflict on subscription {0}")]
    ConcurrencyConflict(uuid::Uuid),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}
