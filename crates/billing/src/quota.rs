//! Quota admission decisions
//!
//! Pure decision logic: given a subscription snapshot and a requested cost,
//! decide whether to admit the request. No side effects, no I/O. The caller
//! gates on a worst-case estimate here, executes the completion, then commits
//! the actual cost through [`crate::usage::UsageMeter`].

use promptmeter_shared::{QuotaCheckResult, Subscription, SubscriptionStatus};
use time::OffsetDateTime;

/// Check whether a subscription can afford `tokens_required` units.
///
/// Decision order (first matching rule wins):
/// 1. No subscription: deny.
/// 2. Status is not active: deny, message carries the literal status.
/// 3. Billing period already ended: deny, regardless of status.
/// 4. Remaining quota below the requested cost: deny, remaining reported
///    as-is (it can be negative after an admin quota decrease).
/// 5. Otherwise admit; `remaining` is the projected post-charge value. The
///    real charge is committed later with the actual cost, which may differ
///    from this estimate.
///
/// The boundary is inclusive: `tokens_required == remaining` admits with a
/// projected remaining of 0.
pub fn check_quota(
    subscription: Option<&Subscription>,
    tokens_required: i64,
    now: OffsetDateTime,
) -> QuotaCheckResult {
    let Some(subscription) = subscription else {
        return QuotaCheckResult {
            allowed: false,
            remaining: 0,
            message: Some("No active subscription found".to_string()),
        };
    };

    if subscription.status != SubscriptionStatus::Active {
        return QuotaCheckResult {
            allowed: false,
            remaining: 0,
            message: Some(format!("Subscription is {}", subscription.status)),
        };
    }

    if subscription.current_period_end < now {
        return QuotaCheckResult {
            allowed: false,
            remaining: 0,
            message: Some("Subscription period has ended".to_string()),
        };
    }

    let remaining = subscription.remaining();
    if remaining < tokens_required {
        return QuotaCheckResult {
            allowed: false,
            remaining,
            message: Some(format!(
                "Insufficient quota. Remaining: {}, Required: {}",
                remaining, tokens_required
            )),
        };
    }

    QuotaCheckResult {
        allowed: true,
        remaining: remaining - tokens_required,
        message: None,
    }
}
