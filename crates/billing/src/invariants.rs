//! Billing Invariants Module
//!
//! Provides runnable consistency checks for the billing system.
//! These invariants can be run after any mutation or webhook replay to ensure
//! the system is in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write
//! 4. **Complete**: Covers all critical billing consistency requirements

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - system may be metering incorrectly
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    pub checked_at: OffsetDateTime,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

/// Row type for multiple active subscriptions violation
#[derive(Debug, sqlx::FromRow)]
struct MultipleSubsRow {
    user_id: Uuid,
    sub_count: i64,
}

/// Row type for usage over quota violation
#[derive(Debug, sqlx::FromRow)]
struct UsageOverQuotaRow {
    sub_id: Uuid,
    user_id: Uuid,
    tier: String,
    quota: i64,
    used: i64,
}

/// Row type for stale active period violation
#[derive(Debug, sqlx::FromRow)]
struct StaleActivePeriodRow {
    sub_id: Uuid,
    user_id: Uuid,
    current_period_end: OffsetDateTime,
}

/// Row type for unlinked customer violation
#[derive(Debug, sqlx::FromRow)]
struct UnlinkedCustomerRow {
    sub_id: Uuid,
    user_id: Uuid,
    email: String,
}

/// Row type for quota not matching plan configuration
#[derive(Debug, sqlx::FromRow)]
struct QuotaPlanMismatchRow {
    sub_id: Uuid,
    user_id: Uuid,
    tier: String,
    quota: i64,
}

/// Row type for stuck webhook events
#[derive(Debug, sqlx::FromRow)]
struct StuckEventRow {
    provider_event_id: String,
    event_type: String,
    processing_started_at: Option<OffsetDateTime>,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        // Run all checks
        violations.extend(self.check_single_active_subscription().await?);
        violations.extend(self.check_usage_within_quota().await?);
        violations.extend(self.check_active_period_not_stale().await?);
        violations.extend(self.check_subscriber_has_customer().await?);
        violations.extend(self.check_quota_matches_plan().await?);
        violations.extend(self.check_no_stuck_webhook_events().await?);

        let checks_run = 6;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: At most 1 active subscription per user
    ///
    /// Quota checks gate on one subscription; a user with several active
    /// rows is metered against only one of them and effectively gets free
    /// quota on the rest. Duplicates come from replayed checkouts and are
    /// repaired by the admin dedupe operation.
    async fn check_single_active_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleSubsRow> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) as sub_count
            FROM subscriptions
            WHERE status = 'active'
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_subscription".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has {} active subscriptions (expected 1)",
                    row.sub_count
                ),
                context: serde_json::json!({
                    "subscription_count": row.sub_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Usage does not exceed quota on active subscriptions
    ///
    /// Admission denies before usage can pass quota, so `used > quota` on
    /// an active row means a commit raced past admission or an admin
    /// lowered the quota below consumed usage.
    async fn check_usage_within_quota(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UsageOverQuotaRow> = sqlx::query_as(
            r#"
            SELECT
                s.id as sub_id,
                s.user_id,
                s.tier,
                s.quota,
                s.used
            FROM subscriptions s
            WHERE s.status = 'active'
              AND s.used > s.quota
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "usage_within_quota".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Active subscription has used {} of {} quota tokens",
                    row.used, row.quota
                ),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                    "tier": row.tier,
                    "quota": row.quota,
                    "used": row.used,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 3: Active subscriptions have a current billing period
    ///
    /// An active row whose period ended days ago means the renewal invoice
    /// never arrived (or its webhook was lost). The admission check already
    /// denies these, but the row should have been moved to past_due or
    /// renewed by now.
    async fn check_active_period_not_stale(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StaleActivePeriodRow> = sqlx::query_as(
            r#"
            SELECT
                s.id as sub_id,
                s.user_id,
                s.current_period_end
            FROM subscriptions s
            WHERE s.status = 'active'
              AND s.current_period_end < NOW() - INTERVAL '3 days'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "active_period_not_stale".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Active subscription period ended at {} and was never renewed",
                    row.current_period_end
                ),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                    "current_period_end": row.current_period_end,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: Subscribed users are linked to a provider customer
    ///
    /// A subscription row whose user has no customer id cannot have come
    /// through the normal checkout flow, and future provider events for
    /// that customer will not resolve to the user.
    async fn check_subscriber_has_customer(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnlinkedCustomerRow> = sqlx::query_as(
            r#"
            SELECT
                s.id as sub_id,
                s.user_id,
                u.email
            FROM subscriptions s
            JOIN users u ON u.id = s.user_id
            WHERE s.status = 'active'
              AND u.provider_customer_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "subscriber_has_customer".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User '{}' has an active subscription but no provider customer id",
                    row.email
                ),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                    "email": row.email,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: Quota matches the plan configured for the tier
    ///
    /// Informational: admin overrides legitimately diverge quota from the
    /// plan, but an unexplained divergence usually means a plan
    /// configuration change that never reconciled.
    async fn check_quota_matches_plan(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<QuotaPlanMismatchRow> = sqlx::query_as(
            r#"
            SELECT
                s.id as sub_id,
                s.user_id,
                s.tier,
                s.quota
            FROM subscriptions s
            WHERE s.status = 'active'
              AND NOT (
                  (s.tier = 'basic' AND s.quota >= 10000)
                  OR (s.tier = 'pro' AND s.quota >= 50000)
                  OR (s.tier = 'premium' AND s.quota >= 200000)
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "quota_matches_plan".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Subscription on tier '{}' has quota {} below the plan minimum",
                    row.tier, row.quota
                ),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                    "tier": row.tier,
                    "quota": row.quota,
                }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    /// Invariant 6: No webhook events stuck in processing
    ///
    /// An event claimed longer than an hour ago with no recorded result
    /// means a worker died mid-processing. The claim becomes re-claimable
    /// on redelivery, but the provider only retries for so long.
    async fn check_no_stuck_webhook_events(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckEventRow> = sqlx::query_as(
            r#"
            SELECT
                provider_event_id,
                event_type,
                processing_started_at
            FROM billing_webhook_events
            WHERE processing_result = 'processing'
              AND processing_started_at < NOW() - INTERVAL '1 hour'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stuck_webhook_events".to_string(),
                user_ids: vec![],
                description: format!(
                    "Webhook event '{}' ({}) has been processing since {:?}",
                    row.provider_event_id, row.event_type, row.processing_started_at
                ),
                context: serde_json::json!({
                    "provider_event_id": row.provider_event_id,
                    "event_type": row.event_type,
                    "processing_started_at": row.processing_started_at,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_active_subscription" => self.check_single_active_subscription().await,
            "usage_within_quota" => self.check_usage_within_quota().await,
            "active_period_not_stale" => self.check_active_period_not_stale().await,
            "subscriber_has_customer" => self.check_subscriber_has_customer().await,
            "quota_matches_plan" => self.check_quota_matches_plan().await,
            "no_stuck_webhook_events" => self.check_no_stuck_webhook_events().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_active_subscription",
            "usage_within_quota",
            "active_period_not_stale",
            "subscriber_has_customer",
            "quota_matches_plan",
            "no_stuck_webhook_events",
        ]
    }
}
