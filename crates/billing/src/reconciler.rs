//! Subscription reconciliation
//!
//! Folds the billing provider's lifecycle event stream into the locally
//! mirrored subscription state. Delivery is at-least-once and not totally
//! ordered, so every effect here is defined to be safe to apply redundantly:
//! upserts are keyed by the external subscription id, cancellation and usage
//! reset are idempotent by construction, and replaying any event converges
//! to the same state as applying it once.
//!
//! Events referencing users or subscriptions we have no linkage for are
//! logged and acknowledged without being applied; failing the delivery would
//! only make the provider redeliver it forever.

use time::OffsetDateTime;
use uuid::Uuid;

use promptmeter_shared::SubscriptionStatus;

use crate::error::BillingResult;
use crate::plans::plan_for_price;
use crate::store::{BillingStore, SubscriptionUpsert};

/// A billing-provider lifecycle event, already verified and parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// First successful checkout: link the provider customer id to the user.
    CheckoutCompleted {
        user_id: Uuid,
        customer_id: String,
    },
    /// Subscription created or updated; the provider does not distinguish
    /// usefully between the two for our purposes, and neither do we.
    SubscriptionUpserted {
        provider_subscription_id: String,
        customer_id: String,
        price_id: String,
        status: SubscriptionStatus,
        current_period_end: OffsetDateTime,
    },
    SubscriptionDeleted {
        provider_subscription_id: String,
    },
    /// Renewal payment confirmed: the only event that zeroes usage.
    InvoicePaymentSucceeded {
        provider_subscription_id: String,
        period_end: Option<OffsetDateTime>,
    },
}

impl LifecycleEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CheckoutCompleted { .. } => "checkout_completed",
            Self::SubscriptionUpserted { .. } => "subscription_upserted",
            Self::SubscriptionDeleted { .. } => "subscription_deleted",
            Self::InvoicePaymentSucceeded { .. } => "invoice_payment_succeeded",
        }
    }
}

/// Applies lifecycle events to the subscription mirror.
#[derive(Clone)]
pub struct SubscriptionReconciler {
    store: BillingStore,
}

impl SubscriptionReconciler {
    pub fn new(store: BillingStore) -> Self {
        Self { store }
    }

    /// Apply one lifecycle event. Idempotent: applying the same event twice
    /// converges to the same state. Out-of-order "updated" events apply
    /// last-write-wins; the provider carries no usable sequence number.
    pub async fn apply(&self, event: LifecycleEvent) -> BillingResult<()> {
        match event {
            LifecycleEvent::CheckoutCompleted {
                user_id,
                customer_id,
            } => self.apply_checkout_completed(user_id, &customer_id).await,
            LifecycleEvent::SubscriptionUpserted {
                provider_subscription_id,
                customer_id,
                price_id,
                status,
                current_period_end,
            } => {
                self.apply_subscription_upserted(
                    &provider_subscription_id,
                    &customer_id,
                    &price_id,
                    status,
                    current_period_end,
                )
                .await
            }
            LifecycleEvent::SubscriptionDeleted {
                provider_subscription_id,
            } => {
                self.apply_subscription_deleted(&provider_subscription_id)
                    .await
            }
            LifecycleEvent::InvoicePaymentSucceeded {
                provider_subscription_id,
                period_end,
            } => {
                self.apply_invoice_payment_succeeded(&provider_subscription_id, period_end)
                    .await
            }
        }
    }

    async fn apply_checkout_completed(
        &self,
        user_id: Uuid,
        customer_id: &str,
    ) -> BillingResult<()> {
        let linked = self.store.link_customer(user_id, customer_id).await?;
        if linked {
            tracing::info!(
                user_id = %user_id,
                customer_id = %customer_id,
                "Linked billing customer to user"
            );
        } else {
            tracing::warn!(
                user_id = %user_id,
                customer_id = %customer_id,
                "Checkout completed for unknown user, acknowledging without applying"
            );
        }
        Ok(())
    }

    async fn apply_subscription_upserted(
        &self,
        provider_subscription_id: &str,
        customer_id: &str,
        price_id: &str,
        status: SubscriptionStatus,
        current_period_end: OffsetDateTime,
    ) -> BillingResult<()> {
        let Some(user) = self.store.find_user_by_customer(customer_id).await? else {
            tracing::warn!(
                customer_id = %customer_id,
                provider_subscription_id = %provider_subscription_id,
                "Subscription event for unlinked customer, acknowledging without applying"
            );
            return Ok(());
        };

        let plan = plan_for_price(price_id);
        let subscription = self
            .store
            .upsert_subscription(SubscriptionUpsert {
                provider_subscription_id: provider_subscription_id.to_string(),
                user_id: user.id,
                tier: plan.tier,
                quota: plan.monthly_tokens,
                status,
                current_period_end,
            })
            .await?;

        tracing::info!(
            subscription_id = %subscription.id,
            provider_subscription_id = %provider_subscription_id,
            tier = %subscription.tier,
            status = %subscription.status,
            "Subscription mirrored from provider event"
        );
        Ok(())
    }

    async fn apply_subscription_deleted(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<()> {
        match self.store.mark_canceled(provider_subscription_id).await? {
            Some(subscription) => {
                tracing::info!(
                    subscription_id = %subscription.id,
                    provider_subscription_id = %provider_subscription_id,
                    "Subscription canceled, row retained for audit"
                );
            }
            None => {
                tracing::warn!(
                    provider_subscription_id = %provider_subscription_id,
                    "Deletion event for unknown subscription, acknowledging without applying"
                );
            }
        }
        Ok(())
    }

    async fn apply_invoice_payment_succeeded(
        &self,
        provider_subscription_id: &str,
        period_end: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        match self
            .store
            .reset_usage(provider_subscription_id, period_end)
            .await?
        {
            Some(subscription) => {
                tracing::info!(
                    subscription_id = %subscription.id,
                    provider_subscription_id = %provider_subscription_id,
                    period_end = %subscription.current_period_end,
                    "Usage reset for new billing period"
                );
            }
            None => {
                tracing::warn!(
                    provider_subscription_id = %provider_subscription_id,
                    "Invoice payment for unknown subscription, acknowledging without applying"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use promptmeter_shared::SubscriptionTier;
    use time::Duration;

    async fn setup() -> (BillingStore, SubscriptionReconciler, Uuid) {
        let store = BillingStore::new_in_memory();
        let reconciler = SubscriptionReconciler::new(store.clone());
        let user = store.create_user("test@example.com", "hash", false).await.unwrap();
        store.link_customer(user.id, "cus_1").await.unwrap();
        (store, reconciler, user.id)
    }

    fn upsert_event(period_end: OffsetDateTime) -> LifecycleEvent {
        LifecycleEvent::SubscriptionUpserted {
            provider_subscription_id: "psub_1".to_string(),
            customer_id: "cus_1".to_string(),
            price_id: "price_pro".to_string(),
            status: SubscriptionStatus::Active,
            current_period_end: period_end,
        }
    }

    #[tokio::test]
    async fn test_upsert_creates_subscription_from_price() {
        let (store, reconciler, user_id) = setup().await;
        let end = OffsetDateTime::now_utc() + Duration::days(30);

        reconciler.apply(upsert_event(end)).await.unwrap();

        let sub = store.find_by_provider_id("psub_1").await.unwrap().unwrap();
        assert_eq!(sub.user_id, user_id);
        assert_eq!(sub.tier, SubscriptionTier::Pro);
        assert_eq!(sub.quota, 50_000);
        assert_eq!(sub.used, 0);
        assert_eq!(sub.current_period_end, end);
    }

    #[tokio::test]
    async fn test_upsert_replay_is_idempotent() {
        let (store, reconciler, _) = setup().await;
        let end = OffsetDateTime::now_utc() + Duration::days(30);

        reconciler.apply(upsert_event(end)).await.unwrap();
        let first = store.find_by_provider_id("psub_1").await.unwrap().unwrap();

        reconciler.apply(upsert_event(end)).await.unwrap();
        let second = store.find_by_provider_id("psub_1").await.unwrap().unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.used, second.used);
        assert_eq!(first.quota, second.quota);
        assert_eq!(first.status, second.status);
        assert_eq!(first.current_period_end, second.current_period_end);
    }

    #[tokio::test]
    async fn test_update_does_not_reset_used() {
        let (store, reconciler, _) = setup().await;
        let end = OffsetDateTime::now_utc() + Duration::days(30);
        reconciler.apply(upsert_event(end)).await.unwrap();

        let sub = store.find_by_provider_id("psub_1").await.unwrap().unwrap();
        store.commit_usage(sub.id, sub.version, 777).await.unwrap().unwrap();

        // Plain update arrives (e.g. plan change); usage must survive
        reconciler
            .apply(LifecycleEvent::SubscriptionUpserted {
                provider_subscription_id: "psub_1".to_string(),
                customer_id: "cus_1".to_string(),
                price_id: "price_premium".to_string(),
                status: SubscriptionStatus::Active,
                current_period_end: end,
            })
            .await
            .unwrap();

        let sub = store.find_by_provider_id("psub_1").await.unwrap().unwrap();
        assert_eq!(sub.used, 777);
        assert_eq!(sub.quota, 200_000);
    }

    #[tokio::test]
    async fn test_invoice_payment_resets_usage_and_wins_over_update() {
        let (store, reconciler, _) = setup().await;
        let end = OffsetDateTime::now_utc() + Duration::days(30);
        reconciler.apply(upsert_event(end)).await.unwrap();
        let sub = store.find_by_provider_id("psub_1").await.unwrap().unwrap();
        store.commit_usage(sub.id, sub.version, 500).await.unwrap().unwrap();

        // Update then renewal payment: reset wins for the usage field
        reconciler.apply(upsert_event(end)).await.unwrap();
        reconciler
            .apply(LifecycleEvent::InvoicePaymentSucceeded {
                provider_subscription_id: "psub_1".to_string(),
                period_end: Some(end + Duration::days(30)),
            })
            .await
            .unwrap();

        let sub = store.find_by_provider_id("psub_1").await.unwrap().unwrap();
        assert_eq!(sub.used, 0);
        assert_eq!(sub.current_period_end, end + Duration::days(30));
    }

    #[tokio::test]
    async fn test_delete_sets_canceled_and_replays_safely() {
        let (store, reconciler, _) = setup().await;
        reconciler
            .apply(upsert_event(OffsetDateTime::now_utc() + Duration::days(30)))
            .await
            .unwrap();

        let delete = LifecycleEvent::SubscriptionDeleted {
            provider_subscription_id: "psub_1".to_string(),
        };
        reconciler.apply(delete.clone()).await.unwrap();
        reconciler.apply(delete).await.unwrap();

        let sub = store.find_by_provider_id("psub_1").await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Canceled);
    }

    #[tokio::test]
    async fn test_events_for_unknown_records_are_acknowledged() {
        let (_, reconciler, _) = setup().await;

        // None of these may error: the provider would retry forever.
        reconciler
            .apply(LifecycleEvent::CheckoutCompleted {
                user_id: Uuid::new_v4(),
                customer_id: "cus_ghost".to_string(),
            })
            .await
            .unwrap();
        reconciler
            .apply(LifecycleEvent::SubscriptionUpserted {
                provider_subscription_id: "psub_ghost".to_string(),
                customer_id: "cus_ghost".to_string(),
                price_id: "price_pro".to_string(),
                status: SubscriptionStatus::Active,
                current_period_end: OffsetDateTime::now_utc(),
            })
            .await
            .unwrap();
        reconciler
            .apply(LifecycleEvent::InvoicePaymentSucceeded {
                provider_subscription_id: "psub_ghost".to_string(),
                period_end: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_price_falls_back_to_basic() {
        let (store, reconciler, _) = setup().await;
        reconciler
            .apply(LifecycleEvent::SubscriptionUpserted {
                provider_subscription_id: "psub_1".to_string(),
                customer_id: "cus_1".to_string(),
                price_id: "price_mystery".to_string(),
                status: SubscriptionStatus::Active,
                current_period_end: OffsetDateTime::now_utc() + Duration::days(30),
            })
            .await
            .unwrap();

        let sub = store.find_by_provider_id("psub_1").await.unwrap().unwrap();
        assert_eq!(sub.tier, SubscriptionTier::Basic);
        assert_eq!(sub.quota, 10_000);
    }
}
