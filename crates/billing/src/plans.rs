//! Plan configuration: mapping provider price identifiers to tiers and quotas

use promptmeter_shared::SubscriptionTier;

/// Subscription plan configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub tier: SubscriptionTier,
    pub price_id: &'static str,
    pub monthly_tokens: i64,
}

impl Plan {
    /// Basic tier: 10K completion tokens/month
    pub const fn basic() -> Self {
        Self {
            tier: SubscriptionTier::Basic,
            price_id: "price_basic",
            monthly_tokens: 10_000,
        }
    }

    /// Pro tier: 50K completion tokens/month
    pub const fn pro() -> Self {
        Self {
            tier: SubscriptionTier::Pro,
            price_id: "price_pro",
            monthly_tokens: 50_000,
        }
    }

    /// Premium tier: 200K completion tokens/month
    pub const fn premium() -> Self {
        Self {
            tier: SubscriptionTier::Premium,
            price_id: "price_premium",
            monthly_tokens: 200_000,
        }
    }

    pub const fn all() -> [Plan; 3] {
        [Plan::basic(), Plan::pro(), Plan::premium()]
    }
}

/// Resolve a provider price identifier to a plan.
///
/// Unknown price ids fall back to the Basic plan with a configuration
/// warning. Rejecting the event instead would make the provider redeliver
/// it forever, so an unmapped price must never fail the webhook.
pub fn plan_for_price(price_id: &str) -> Plan {
    match Plan::all().into_iter().find(|p| p.price_id == price_id) {
        Some(plan) => plan,
        None => {
            tracing::warn!(
                price_id = %price_id,
                "Unknown provider price id, falling back to basic plan; check plan configuration"
            );
            Plan::basic()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_price_ids() {
        assert_eq!(plan_for_price("price_basic").tier, SubscriptionTier::Basic);
        assert_eq!(plan_for_price("price_pro").tier, SubscriptionTier::Pro);
        assert_eq!(plan_for_price("price_pro").monthly_tokens, 50_000);
        assert_eq!(
            plan_for_price("price_premium").tier,
            SubscriptionTier::Premium
        );
    }

    #[test]
    fn test_unknown_price_falls_back_to_basic() {
        let plan = plan_for_price("price_enterprise_custom");
        assert_eq!(plan.tier, SubscriptionTier::Basic);
        assert_eq!(plan.monthly_tokens, 10_000);
    }

    #[test]
    fn test_plan_quotas_match_tier_quotas() {
        for plan in Plan::all() {
            assert_eq!(plan.monthly_tokens, plan.tier.monthly_tokens());
        }
    }
}
