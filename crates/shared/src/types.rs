//! Common types used across Promptmeter

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Enums
// =============================================================================

/// Subscription tier for billing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Basic,
    Pro,
    Premium,
}

impl Default for SubscriptionTier {
    fn default() -> Self {
        Self::Basic
    }
}

impl SubscriptionTier {
    /// Completion-token quota granted per billing period
    pub fn monthly_tokens(&self) -> i64 {
        match self {
            Self::Basic => 10_000,
            Self::Pro => 50_000,
            Self::Premium => 200_000,
        }
    }
}

impl std::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Basic => write!(f, "basic"),
            Self::Pro => write!(f, "pro"),
            Self::Premium => write!(f, "premium"),
        }
    }
}

impl std::str::FromStr for SubscriptionTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "pro" => Ok(Self::Pro),
            "premium" => Ok(Self::Premium),
            _ => Err(format!("Invalid subscription tier: {}", s)),
        }
    }
}

/// Subscription status, mirroring the billing provider's lifecycle vocabulary.
/// Only `Active` admits completion requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Canceled,
    Unpaid,
    Trialing,
    Incomplete,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Unpaid => "unpaid",
            Self::Trialing => "trialing",
            Self::Incomplete => "incomplete",
        }
    }

    /// Parse a provider status string, mapping unknown values to `Incomplete`.
    /// The provider may introduce new statuses; none of them admit requests,
    /// so the conservative fallback is safe.
    pub fn from_provider(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "past_due" => Self::PastDue,
            "canceled" => Self::Canceled,
            "unpaid" => Self::Unpaid,
            "trialing" => Self::Trialing,
            _ => Self::Incomplete,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Database Models
// =============================================================================

/// Mirrored state of one billing-provider subscription.
///
/// `version` is an optimistic-concurrency counter: every store write bumps it,
/// and conditional updates compare against the value they read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider_subscription_id: String,
    pub tier: SubscriptionTier,
    pub quota: i64,
    pub used: i64,
    pub status: SubscriptionStatus,
    pub current_period_end: OffsetDateTime,
    pub version: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// Units still grantable this period. May go negative after an
    /// administrative quota decrease; callers must not assume it is >= 0.
    pub fn remaining(&self) -> i64 {
        self.quota - self.used
    }
}

/// Append-only audit log entry for one admitted completion request.
/// Never mutated after creation; quota truth lives on `Subscription.used`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UsageRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub request_ref: String,
    pub tokens_used: i64,
    pub created_at: OffsetDateTime,
}

/// User model (minimal: identity, billing-customer linkage, API access)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub provider_customer_id: Option<String>,
    #[serde(skip_serializing)]
    pub api_key_hash: String,
    pub is_admin: bool,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// API Types
// =============================================================================

/// Result of a quota admission check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaCheckResult {
    pub allowed: bool,
    pub remaining: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
