//! Usage metering
//!
//! Commits the actual cost of an admitted request to persisted state and
//! appends the audit record. The caller's gate admitted an estimate against
//! a snapshot; by commit time that snapshot may be stale, so the meter
//! re-runs admission against the state it is about to update and applies the
//! charge through the store's versioned conditional update. Admission and
//! update are pinned to the same row version: a check that passed on version
//! v only commits if the row is still at v, so two callers gated on the same
//! snapshot can never jointly push `used` past `quota` — the loser's retry
//! re-checks the fresh balance and is denied instead.

use promptmeter_shared::{Subscription, UsageRecord};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::quota::check_quota;
use crate::store::BillingStore;

/// Conflict retry budget for one commit. Conflicts are rare (two writers per
/// subscription), so exhausting this means something is hammering the row.
const MAX_COMMIT_ATTEMPTS: u32 = 5;

/// Pure form of a usage commit: a new subscription value with `used`
/// incremented. Additive and order-insensitive in net effect.
pub fn commit(subscription: &Subscription, actual_units: i64) -> Subscription {
    Subscription {
        used: subscription.used + actual_units,
        ..subscription.clone()
    }
}

/// Pure form of a period rollover: `used` zeroed, period end replaced, all
/// other fields unchanged. Used exclusively on provider-confirmed renewal
/// payment.
pub fn reset_for_new_period(
    subscription: &Subscription,
    new_period_end: OffsetDateTime,
) -> Subscription {
    Subscription {
        used: 0,
        current_period_end: new_period_end,
        ..subscription.clone()
    }
}

/// Usage meter service: persists commits and audit records.
#[derive(Clone)]
pub struct UsageMeter {
    store: BillingStore,
}

impl UsageMeter {
    pub fn new(store: BillingStore) -> Self {
        Self { store }
    }

    /// Commit the actual cost of an admitted request.
    ///
    /// `snapshot` is the subscription the caller gated on. Before every
    /// store attempt the actual cost is re-admitted via [`check_quota`]
    /// against the state being updated, and the store applies
    /// `used = used + actual_units` only if the row version is unchanged
    /// since that check. When a concurrent writer has moved the row on, we
    /// re-read, re-check, and retry; a loser whose re-checked balance no
    /// longer covers the charge gets [`BillingError::QuotaExceeded`] and
    /// nothing is applied.
    pub async fn commit_usage(
        &self,
        snapshot: &Subscription,
        actual_units: i64,
    ) -> BillingResult<Subscription> {
        if actual_units < 0 {
            return Err(BillingError::InvalidParameter(format!(
                "actual_units must be non-negative, got {}",
                actual_units
            )));
        }

        let now = OffsetDateTime::now_utc();
        let mut current = snapshot.clone();
        for attempt in 0..MAX_COMMIT_ATTEMPTS {
            let admission = check_quota(Some(&current), actual_units, now);
            if !admission.allowed {
                tracing::info!(
                    subscription_id = %snapshot.id,
                    remaining = admission.remaining,
                    required = actual_units,
                    "Usage commit denied on re-checked admission"
                );
                return Err(BillingError::QuotaExceeded {
                    remaining: admission.remaining,
                    required: actual_units,
                });
            }

            if let Some(updated) = self
                .store
                .commit_usage(current.id, current.version, actual_units)
                .await?
            {
                return Ok(updated);
            }

            let fresh = self
                .store
                .find_by_id(snapshot.id)
                .await?
                .ok_or_else(|| BillingError::SubscriptionNotFound(snapshot.id.to_string()))?;

            tracing::debug!(
                subscription_id = %snapshot.id,
                attempt = attempt + 1,
                stale_version = current.version,
                fresh_version = fresh.version,
                "Usage commit lost to concurrent writer, retrying"
            );
            current = fresh;
        }

        Err(BillingError::ConcurrencyConflict(snapshot.id))
    }

    /// Append the immutable audit record for one admitted request.
    pub async fn record_usage(
        &self,
        user_id: Uuid,
        request_ref: &str,
        tokens_used: i64,
    ) -> BillingResult<UsageRecord> {
        self.store
            .insert_usage_record(user_id, request_ref, tokens_used)
            .await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::store::SubscriptionUpsert;
    use promptmeter_shared::{SubscriptionStatus, SubscriptionTier};
    use time::Duration;

    fn sample_subscription() -> Subscription {
        let now = OffsetDateTime::now_utc();
        Subscription {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            provider_subscription_id: "psub_1".to_string(),
            tier: SubscriptionTier::Premium,
            quota: 1000,
            used: 200,
            status: SubscriptionStatus::Active,
            current_period_end: now + Duration::days(30),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_commit_is_additive() {
        let sub = sample_subscription();
        let updated = commit(&sub, 100);
        assert_eq!(updated.used, 300);
        assert_eq!(updated.quota, 1000);
        // order-insensitive net effect
        let a_then_b = commit(&commit(&sub, 100), 50);
        let b_then_a = commit(&commit(&sub, 50), 100);
        assert_eq!(a_then_b.used, 350);
        assert_eq!(b_then_a.used, 350);
    }

    #[test]
    fn test_reset_preserves_identity_fields() {
        let sub = sample_subscription();
        let new_end = OffsetDateTime::now_utc() + Duration::days(60);
        let reset = reset_for_new_period(&sub, new_end);
        assert_eq!(reset.used, 0);
        assert_eq!(reset.current_period_end, new_end);
        assert_eq!(reset.quota, sub.quota);
        assert_eq!(reset.tier, sub.tier);
        assert_eq!(reset.id, sub.id);
        assert_eq!(reset.user_id, sub.user_id);
    }

    #[tokio::test]
    async fn test_commit_usage_retries_after_conflicting_reset() {
        let store = BillingStore::new_in_memory();
        let user = store.create_user("u@example.com", "h", false).await.unwrap();
        let sub = store
            .upsert_subscription(SubscriptionUpsert {
                provider_subscription_id: "psub_1".to_string(),
                user_id: user.id,
                tier: SubscriptionTier::Pro,
                quota: 50_000,
                status: SubscriptionStatus::Active,
                current_period_end: OffsetDateTime::now_utc() + Duration::days(30),
            })
            .await
            .unwrap();
        let meter = UsageMeter::new(store.clone());

        // Reconciler resets between the caller's read and the commit
        store.reset_usage("psub_1", None).await.unwrap();

        let updated = meter.commit_usage(&sub, 42).await.unwrap();
        assert_eq!(updated.used, 42, "commit lands on the post-reset counter");
    }

    #[tokio::test]
    async fn test_commit_denied_when_concurrent_commit_drained_balance() {
        let store = BillingStore::new_in_memory();
        let user = store.create_user("u@example.com", "h", false).await.unwrap();
        let sub = store
            .upsert_subscription(SubscriptionUpsert {
                provider_subscription_id: "psub_1".to_string(),
                user_id: user.id,
                tier: SubscriptionTier::Basic,
                quota: 100,
                status: SubscriptionStatus::Active,
                current_period_end: OffsetDateTime::now_utc() + Duration::days(30),
            })
            .await
            .unwrap();
        let meter = UsageMeter::new(store.clone());

        // Two callers gated on the same snapshot; the first commit wins.
        let stale_snapshot = sub.clone();
        meter.commit_usage(&sub, 80).await.unwrap();

        let err = meter.commit_usage(&stale_snapshot, 80).await.unwrap_err();
        assert!(matches!(
            err,
            BillingError::QuotaExceeded {
                remaining: 20,
                required: 80
            }
        ));

        let fresh = store.find_by_id(sub.id).await.unwrap().unwrap();
        assert_eq!(fresh.used, 80, "the denied commit must not be applied");
    }

    #[tokio::test]
    async fn test_commit_usage_missing_subscription() {
        let store = BillingStore::new_in_memory();
        let meter = UsageMeter::new(store);
        let ghost = sample_subscription();
        let err = meter.commit_usage(&ghost, 1).await.unwrap_err();
        assert!(matches!(err, BillingError::SubscriptionNotFound(_)));
    }

    #[tokio::test]
    async fn test_negative_units_rejected() {
        let store = BillingStore::new_in_memory();
        let meter = UsageMeter::new(store);
        let sub = sample_subscription();
        let err = meter.commit_usage(&sub, -5).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidParameter(_)));
    }
}
