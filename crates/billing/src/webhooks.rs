//! Billing-provider webhook handling
//!
//! Verifies signed webhook deliveries, parses them into [`LifecycleEvent`]s,
//! and dispatches them to the reconciler exactly once per provider event id.
//!
//! Signature scheme: the provider sends a header of the form
//! `t=<unix-seconds>,v1=<hex>` where `v1` is HMAC-SHA256 over
//! `"<t>.<payload>"` with the endpoint secret. Deliveries outside the
//! tolerance window are rejected.
//!
//! Payload field reads are deliberately tolerant: the provider varies some
//! field shapes across API versions (period end as number or string, invoice
//! subscription as id string or embedded object), so we normalize rather
//! than reject.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use time::OffsetDateTime;
use uuid::Uuid;

use promptmeter_shared::SubscriptionStatus;

use crate::error::{BillingError, BillingResult};
use crate::reconciler::{LifecycleEvent, SubscriptionReconciler};
use crate::store::BillingStore;

type HmacSha256 = Hmac<Sha256>;

/// Deliveries whose signed timestamp is further than this from now are
/// rejected as replays.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// A verified but not yet interpreted provider event.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created: i64,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

/// Verify the signature header against the raw payload.
///
/// `now` is injected so the tolerance window is testable.
pub fn verify_signature(
    payload: &str,
    signature_header: &str,
    secret: &str,
    now: OffsetDateTime,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<&str> = None;

    for part in signature_header.split(',') {
        match part.split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => v1_signature = Some(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
    let v1_signature = v1_signature.ok_or(BillingError::WebhookSignatureInvalid)?;

    if (now.unix_timestamp() - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now.unix_timestamp(),
            "Webhook timestamp outside tolerance window"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    // The endpoint secret may carry a "whsec_" prefix
    let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Normalize a period-end field that may arrive as a unix number or a
/// numeric string.
fn period_end_from_value(value: &serde_json::Value) -> Option<OffsetDateTime> {
    let seconds = match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }?;
    if seconds <= 0 {
        return None;
    }
    OffsetDateTime::from_unix_timestamp(seconds).ok()
}

/// Normalize a field that may be an id string or an embedded object with an
/// `id` field (`invoice.subscription`, `subscription.customer`).
fn id_from_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(map) => map.get("id")?.as_str().map(str::to_string),
        _ => None,
    }
}

/// Interpret a verified event as a lifecycle transition.
///
/// Returns `Ok(None)` for event types we do not handle and for known types
/// whose payload is missing required linkage; both are acknowledged so the
/// provider stops redelivering them.
pub fn parse_lifecycle_event(event: &WebhookEvent) -> Option<LifecycleEvent> {
    let object = &event.data.object;

    match event.event_type.as_str() {
        "checkout.session.completed" => {
            let user_id = object
                .pointer("/metadata/user_id")
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok());
            let customer_id = object.get("customer").and_then(id_from_value);
            match (user_id, customer_id) {
                (Some(user_id), Some(customer_id)) => Some(LifecycleEvent::CheckoutCompleted {
                    user_id,
                    customer_id,
                }),
                _ => {
                    tracing::warn!(
                        event_id = %event.id,
                        "Checkout session missing user_id metadata or customer, acknowledging"
                    );
                    None
                }
            }
        }

        "customer.subscription.created" | "customer.subscription.updated" => {
            let provider_subscription_id = object
                .get("id")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let customer_id = object.get("customer").and_then(id_from_value);
            let price_id = object
                .pointer("/items/data/0/price/id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let status = object
                .get("status")
                .and_then(|v| v.as_str())
                .map(SubscriptionStatus::from_provider)
                .unwrap_or(SubscriptionStatus::Incomplete);
            let current_period_end = object
                .get("current_period_end")
                .and_then(period_end_from_value);

            match (provider_subscription_id, customer_id, current_period_end) {
                (Some(provider_subscription_id), Some(customer_id), Some(current_period_end)) => {
                    Some(LifecycleEvent::SubscriptionUpserted {
                        provider_subscription_id,
                        customer_id,
                        price_id,
                        status,
                        current_period_end,
                    })
                }
                _ => {
                    tracing::warn!(
                        event_id = %event.id,
                        "Subscription event missing id, customer, or period end, acknowledging"
                    );
                    None
                }
            }
        }

        "customer.subscription.deleted" => object
            .get("id")
            .and_then(|v| v.as_str())
            .map(|id| LifecycleEvent::SubscriptionDeleted {
                provider_subscription_id: id.to_string(),
            }),

        "invoice.payment_succeeded" => {
            let provider_subscription_id = object.get("subscription").and_then(id_from_value);
            let period_end = object
                .pointer("/lines/data/0/period/end")
                .or_else(|| object.get("period_end"))
                .and_then(period_end_from_value);
            provider_subscription_id.map(|provider_subscription_id| {
                LifecycleEvent::InvoicePaymentSucceeded {
                    provider_subscription_id,
                    period_end,
                }
            })
        }

        other => {
            tracing::debug!(event_id = %event.id, event_type = %other, "Unhandled event type");
            None
        }
    }
}

/// Webhook handler: verification, idempotency claim, dispatch, journaling.
#[derive(Clone)]
pub struct WebhookHandler {
    store: BillingStore,
    reconciler: SubscriptionReconciler,
    webhook_secret: String,
}

impl WebhookHandler {
    pub fn new(
        store: BillingStore,
        reconciler: SubscriptionReconciler,
        webhook_secret: String,
    ) -> Self {
        Self {
            store,
            reconciler,
            webhook_secret,
        }
    }

    /// Verify and parse a raw delivery.
    pub fn verify_event(
        &self,
        payload: &str,
        signature_header: &str,
    ) -> BillingResult<WebhookEvent> {
        verify_signature(
            payload,
            signature_header,
            &self.webhook_secret,
            OffsetDateTime::now_utc(),
        )?;
        serde_json::from_str(payload).map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))
    }

    /// Handle a verified event.
    ///
    /// The journal claim makes this safe under concurrent delivery of the
    /// same event: one worker wins the claim, duplicates are acknowledged
    /// without effect. An event journaled as failed is re-claimable
    /// immediately, so the provider's redelivery retries it; a claim that
    /// crashed mid-processing becomes re-claimable after the stuck-processing
    /// timeout.
    pub async fn handle_event(&self, event: WebhookEvent) -> BillingResult<()> {
        let event_timestamp = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        let claimed = self
            .store
            .claim_event(&event.id, &event.event_type, event_timestamp)
            .await?;
        if !claimed {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Duplicate webhook event, already claimed or processed"
            );
            return Ok(());
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing webhook event"
        );

        let result = match parse_lifecycle_event(&event) {
            Some(lifecycle) => self.reconciler.apply(lifecycle).await,
            None => Ok(()),
        };

        let (success, error_message) = match &result {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };
        if let Err(journal_err) = self
            .store
            .complete_event(&event.id, success, error_message.as_deref())
            .await
        {
            tracing::error!(
                event_id = %event.id,
                error = %journal_err,
                "Failed to record webhook processing result"
            );
        }

        result
    }

    /// Verify then handle a raw delivery.
    pub async fn handle_delivery(
        &self,
        payload: &str,
        signature_header: &str,
    ) -> BillingResult<()> {
        let event = self.verify_event(payload, signature_header)?;
        self.handle_event(event).await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    /// Provider-side signing, mirrored for tests.
    pub(crate) fn sign(payload: &str, secret: &str, timestamp: i64) -> String {
        let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        )
    }

    #[test]
    fn test_valid_signature_accepted() {
        let now = OffsetDateTime::now_utc();
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign(payload, "whsec_testsecret", now.unix_timestamp());
        assert!(verify_signature(payload, &header, "whsec_testsecret", now).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let now = OffsetDateTime::now_utc();
        let header = sign(r#"{"id":"evt_1"}"#, "whsec_testsecret", now.unix_timestamp());
        let err =
            verify_signature(r#"{"id":"evt_2"}"#, &header, "whsec_testsecret", now).unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let now = OffsetDateTime::now_utc();
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign(payload, "whsec_a", now.unix_timestamp());
        assert!(verify_signature(payload, &header, "whsec_b", now).is_err());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let now = OffsetDateTime::now_utc();
        let payload = r#"{"id":"evt_1"}"#;
        let stale = now.unix_timestamp() - SIGNATURE_TOLERANCE_SECS - 1;
        let header = sign(payload, "whsec_testsecret", stale);
        assert!(verify_signature(payload, &header, "whsec_testsecret", now).is_err());
    }

    #[test]
    fn test_malformed_header_rejected() {
        let now = OffsetDateTime::now_utc();
        for header in ["", "t=123", "v1=abcd", "garbage"] {
            assert!(
                verify_signature("{}", header, "whsec_s", now).is_err(),
                "header {:?} should be rejected",
                header
            );
        }
    }

    fn event(event_type: &str, object: serde_json::Value) -> WebhookEvent {
        WebhookEvent {
            id: "evt_test".to_string(),
            event_type: event_type.to_string(),
            created: OffsetDateTime::now_utc().unix_timestamp(),
            data: WebhookEventData { object },
        }
    }

    #[test]
    fn test_parse_subscription_updated() {
        let period_end = OffsetDateTime::now_utc().unix_timestamp() + 86_400;
        let parsed = parse_lifecycle_event(&event(
            "customer.subscription.updated",
            json!({
                "id": "psub_1",
                "customer": "cus_1",
                "status": "active",
                "current_period_end": period_end,
                "items": {"data": [{"price": {"id": "price_pro"}}]}
            }),
        ))
        .unwrap();

        match parsed {
            LifecycleEvent::SubscriptionUpserted {
                provider_subscription_id,
                customer_id,
                price_id,
                status,
                current_period_end,
            } => {
                assert_eq!(provider_subscription_id, "psub_1");
                assert_eq!(customer_id, "cus_1");
                assert_eq!(price_id, "price_pro");
                assert_eq!(status, SubscriptionStatus::Active);
                assert_eq!(current_period_end.unix_timestamp(), period_end);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_period_end_as_string() {
        let period_end = OffsetDateTime::now_utc().unix_timestamp() + 86_400;
        let parsed = parse_lifecycle_event(&event(
            "customer.subscription.updated",
            json!({
                "id": "psub_1",
                "customer": {"id": "cus_1"},
                "status": "past_due",
                "current_period_end": period_end.to_string(),
                "items": {"data": [{"price": {"id": "price_basic"}}]}
            }),
        ))
        .unwrap();

        match parsed {
            LifecycleEvent::SubscriptionUpserted {
                status,
                current_period_end,
                ..
            } => {
                assert_eq!(status, SubscriptionStatus::PastDue);
                assert_eq!(current_period_end.unix_timestamp(), period_end);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_invoice_with_embedded_subscription_object() {
        let parsed = parse_lifecycle_event(&event(
            "invoice.payment_succeeded",
            json!({"subscription": {"id": "psub_1"}}),
        ))
        .unwrap();
        assert_eq!(
            parsed,
            LifecycleEvent::InvoicePaymentSucceeded {
                provider_subscription_id: "psub_1".to_string(),
                period_end: None,
            }
        );
    }

    #[test]
    fn test_parse_invoice_carries_line_period_end() {
        let end = OffsetDateTime::now_utc().unix_timestamp() + 2_592_000;
        let parsed = parse_lifecycle_event(&event(
            "invoice.payment_succeeded",
            json!({
                "subscription": "psub_1",
                "lines": {"data": [{"period": {"end": end}}]}
            }),
        ))
        .unwrap();
        match parsed {
            LifecycleEvent::InvoicePaymentSucceeded { period_end, .. } => {
                assert_eq!(period_end.unwrap().unix_timestamp(), end);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_invoice_without_subscription_is_acknowledged() {
        assert!(parse_lifecycle_event(&event("invoice.payment_succeeded", json!({}))).is_none());
    }

    #[test]
    fn test_parse_checkout_completed() {
        let user_id = Uuid::new_v4();
        let parsed = parse_lifecycle_event(&event(
            "checkout.session.completed",
            json!({"metadata": {"user_id": user_id.to_string()}, "customer": "cus_1"}),
        ))
        .unwrap();
        assert_eq!(
            parsed,
            LifecycleEvent::CheckoutCompleted {
                user_id,
                customer_id: "cus_1".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_checkout_missing_metadata_is_acknowledged() {
        assert!(parse_lifecycle_event(&event(
            "checkout.session.completed",
            json!({"customer": "cus_1"}),
        ))
        .is_none());
    }

    #[test]
    fn test_unhandled_event_type_is_acknowledged() {
        assert!(parse_lifecycle_event(&event("customer.created", json!({"id": "cus_1"}))).is_none());
    }

    #[test]
    fn test_unknown_status_maps_to_incomplete() {
        let period_end = OffsetDateTime::now_utc().unix_timestamp() + 86_400;
        let parsed = parse_lifecycle_event(&event(
            "customer.subscription.updated",
            json!({
                "id": "psub_1",
                "customer": "cus_1",
                "status": "paused",
                "current_period_end": period_end,
                "items": {"data": [{"price": {"id": "price_pro"}}]}
            }),
        ))
        .unwrap();
        match parsed {
            LifecycleEvent::SubscriptionUpserted { status, .. } => {
                assert_eq!(status, SubscriptionStatus::Incomplete);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
