//! Persistence for subscriptions, usage records, users, and the webhook
//! event journal.
//!
//! The store is the single coordination point between the two independent
//! writers of a subscription row: the metering path and the reconciler.
//! Every mutation is a single atomic statement, and `commit_usage` is a
//! versioned conditional update so a stale snapshot can never silently
//! overwrite a concurrent writer's work. Subscriptions are never cached
//! across requests; callers always read a fresh snapshot.
//!
//! Two backends: Postgres for production, in-memory for tests.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use uuid::Uuid;

use promptmeter_shared::{Subscription, SubscriptionStatus, SubscriptionTier, UsageRecord, User};

use crate::error::BillingResult;

/// How long a claimed webhook event may sit in `processing` before another
/// worker is allowed to re-claim it.
const EVENT_PROCESSING_TIMEOUT: Duration = Duration::minutes(30);

/// Fields applied when mirroring a provider subscription event.
#[derive(Debug, Clone)]
pub struct SubscriptionUpsert {
    pub provider_subscription_id: String,
    pub user_id: Uuid,
    pub tier: SubscriptionTier,
    pub quota: i64,
    pub status: SubscriptionStatus,
    pub current_period_end: OffsetDateTime,
}

#[derive(Debug)]
struct MemoryEvent {
    processing_result: String,
    processing_started_at: OffsetDateTime,
}

#[derive(Default)]
struct MemoryState {
    users: RwLock<HashMap<Uuid, User>>,
    subscriptions: RwLock<HashMap<Uuid, Subscription>>,
    usage_records: RwLock<Vec<UsageRecord>>,
    events: RwLock<HashMap<String, MemoryEvent>>,
}

#[derive(Clone)]
enum Backend {
    Postgres(PgPool),
    InMemory(Arc<MemoryState>),
}

/// Storage handle passed explicitly to each billing component.
#[derive(Clone)]
pub struct BillingStore {
    backend: Backend,
}

impl BillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            backend: Backend::Postgres(pool),
        }
    }

    /// In-memory backend for tests and local trials. Same semantics as the
    /// Postgres backend, including conditional updates.
    pub fn new_in_memory() -> Self {
        Self {
            backend: Backend::InMemory(Arc::new(MemoryState::default())),
        }
    }

    // =========================================================================
    // Subscription reads
    // =========================================================================

    /// The subscription a user's requests are admitted against: the active
    /// one with the latest period end. Multiple active rows are a business
    /// rule violation surfaced by the invariant checker.
    pub async fn find_active_for_user(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let sub = sqlx::query_as::<_, Subscription>(
                    r#"
                    SELECT * FROM subscriptions
                    WHERE user_id = $1 AND status = 'active'
                    ORDER BY current_period_end DESC
                    LIMIT 1
                    "#,
                )
                .bind(user_id)
                .fetch_optional(pool)
                .await?;
                Ok(sub)
            }
            Backend::InMemory(state) => {
                let subs = state.subscriptions.read().await;
                Ok(subs
                    .values()
                    .filter(|s| s.user_id == user_id && s.status == SubscriptionStatus::Active)
                    .max_by_key(|s| s.current_period_end)
                    .cloned())
            }
        }
    }

    /// All active subscriptions for a user, latest period first.
    pub async fn list_active_for_user(&self, user_id: Uuid) -> BillingResult<Vec<Subscription>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let subs = sqlx::query_as::<_, Subscription>(
                    r#"
                    SELECT * FROM subscriptions
                    WHERE user_id = $1 AND status = 'active'
                    ORDER BY current_period_end DESC
                    "#,
                )
                .bind(user_id)
                .fetch_all(pool)
                .await?;
                Ok(subs)
            }
            Backend::InMemory(state) => {
                let subs = state.subscriptions.read().await;
                let mut result: Vec<Subscription> = subs
                    .values()
                    .filter(|s| s.user_id == user_id && s.status == SubscriptionStatus::Active)
                    .cloned()
                    .collect();
                result.sort_by(|a, b| b.current_period_end.cmp(&a.current_period_end));
                Ok(result)
            }
        }
    }

    pub async fn find_by_id(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let sub =
                    sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE id = $1")
                        .bind(id)
                        .fetch_optional(pool)
                        .await?;
                Ok(sub)
            }
            Backend::InMemory(state) => Ok(state.subscriptions.read().await.get(&id).cloned()),
        }
    }

    pub async fn find_by_provider_id(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let sub = sqlx::query_as::<_, Subscription>(
                    "SELECT * FROM subscriptions WHERE provider_subscription_id = $1",
                )
                .bind(provider_subscription_id)
                .fetch_optional(pool)
                .await?;
                Ok(sub)
            }
            Backend::InMemory(state) => Ok(state
                .subscriptions
                .read()
                .await
                .values()
                .find(|s| s.provider_subscription_id == provider_subscription_id)
                .cloned()),
        }
    }

    // =========================================================================
    // Metering path
    // =========================================================================

    /// Versioned conditional update: add `tokens` to `used` only if the row
    /// still carries `expected_version`. Returns `None` when a concurrent
    /// writer got there first; the caller re-reads and retries.
    pub async fn commit_usage(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
        tokens: i64,
    ) -> BillingResult<Option<Subscription>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let sub = sqlx::query_as::<_, Subscription>(
                    r#"
                    UPDATE subscriptions
                    SET used = used + $3, version = version + 1, updated_at = NOW()
                    WHERE id = $1 AND version = $2
                    RETURNING *
                    "#,
                )
                .bind(subscription_id)
                .bind(expected_version)
                .bind(tokens)
                .fetch_optional(pool)
                .await?;
                Ok(sub)
            }
            Backend::InMemory(state) => {
                let mut subs = state.subscriptions.write().await;
                match subs.get_mut(&subscription_id) {
                    Some(sub) if sub.version == expected_version => {
                        sub.used += tokens;
                        sub.version += 1;
                        sub.updated_at = OffsetDateTime::now_utc();
                        Ok(Some(sub.clone()))
                    }
                    _ => Ok(None),
                }
            }
        }
    }

    pub async fn insert_usage_record(
        &self,
        user_id: Uuid,
        request_ref: &str,
        tokens_used: i64,
    ) -> BillingResult<UsageRecord> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let record = sqlx::query_as::<_, UsageRecord>(
                    r#"
                    INSERT INTO usage_records (user_id, request_ref, tokens_used)
                    VALUES ($1, $2, $3)
                    RETURNING *
                    "#,
                )
                .bind(user_id)
                .bind(request_ref)
                .bind(tokens_used)
                .fetch_one(pool)
                .await?;
                Ok(record)
            }
            Backend::InMemory(state) => {
                let record = UsageRecord {
                    id: Uuid::new_v4(),
                    user_id,
                    request_ref: request_ref.to_string(),
                    tokens_used,
                    created_at: OffsetDateTime::now_utc(),
                };
                state.usage_records.write().await.push(record.clone());
                Ok(record)
            }
        }
    }

    // =========================================================================
    // Reconciliation path
    // =========================================================================

    /// Upsert keyed by the external subscription id. Creates with `used = 0`;
    /// updates tier/quota/status/period-end in place WITHOUT touching `used`.
    /// Only `reset_usage` zeroes the counter.
    pub async fn upsert_subscription(
        &self,
        upsert: SubscriptionUpsert,
    ) -> BillingResult<Subscription> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let sub = sqlx::query_as::<_, Subscription>(
                    r#"
                    INSERT INTO subscriptions
                        (user_id, provider_subscription_id, tier, quota, used, status, current_period_end)
                    VALUES ($1, $2, $3, $4, 0, $5, $6)
                    ON CONFLICT (provider_subscription_id) DO UPDATE SET
                        tier = EXCLUDED.tier,
                        quota = EXCLUDED.quota,
                        status = EXCLUDED.status,
                        current_period_end = EXCLUDED.current_period_end,
                        version = subscriptions.version + 1,
                        updated_at = NOW()
                    RETURNING *
                    "#,
                )
                .bind(upsert.user_id)
                .bind(&upsert.provider_subscription_id)
                .bind(upsert.tier)
                .bind(upsert.quota)
                .bind(upsert.status)
                .bind(upsert.current_period_end)
                .fetch_one(pool)
                .await?;
                Ok(sub)
            }
            Backend::InMemory(state) => {
                let mut subs = state.subscriptions.write().await;
                let now = OffsetDateTime::now_utc();
                let existing = subs
                    .values_mut()
                    .find(|s| s.provider_subscription_id == upsert.provider_subscription_id);
                match existing {
                    Some(sub) => {
                        sub.tier = upsert.tier;
                        sub.quota = upsert.quota;
                        sub.status = upsert.status;
                        sub.current_period_end = upsert.current_period_end;
                        sub.version += 1;
                        sub.updated_at = now;
                        Ok(sub.clone())
                    }
                    None => {
                        let sub = Subscription {
                            id: Uuid::new_v4(),
                            user_id: upsert.user_id,
                            provider_subscription_id: upsert.provider_subscription_id,
                            tier: upsert.tier,
                            quota: upsert.quota,
                            used: 0,
                            status: upsert.status,
                            current_period_end: upsert.current_period_end,
                            version: 0,
                            created_at: now,
                            updated_at: now,
                        };
                        subs.insert(sub.id, sub.clone());
                        Ok(sub)
                    }
                }
            }
        }
    }

    /// Set status to canceled. The row is retained for audit; returns the
    /// updated row, or `None` when no subscription carries this provider id.
    pub async fn mark_canceled(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let sub = sqlx::query_as::<_, Subscription>(
                    r#"
                    UPDATE subscriptions
                    SET status = 'canceled', version = version + 1, updated_at = NOW()
                    WHERE provider_subscription_id = $1
                    RETURNING *
                    "#,
                )
                .bind(provider_subscription_id)
                .fetch_optional(pool)
                .await?;
                Ok(sub)
            }
            Backend::InMemory(state) => {
                let mut subs = state.subscriptions.write().await;
                let sub = subs
                    .values_mut()
                    .find(|s| s.provider_subscription_id == provider_subscription_id);
                Ok(sub.map(|s| {
                    s.status = SubscriptionStatus::Canceled;
                    s.version += 1;
                    s.updated_at = OffsetDateTime::now_utc();
                    s.clone()
                }))
            }
        }
    }

    /// Zero the usage counter for a new billing period. This is the ONLY
    /// operation that resets `used`; idempotent by construction.
    pub async fn reset_usage(
        &self,
        provider_subscription_id: &str,
        new_period_end: Option<OffsetDateTime>,
    ) -> BillingResult<Option<Subscription>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let sub = sqlx::query_as::<_, Subscription>(
                    r#"
                    UPDATE subscriptions
                    SET used = 0,
                        current_period_end = COALESCE($2, current_period_end),
                        version = version + 1,
                        updated_at = NOW()
                    WHERE provider_subscription_id = $1
                    RETURNING *
                    "#,
                )
                .bind(provider_subscription_id)
                .bind(new_period_end)
                .fetch_optional(pool)
                .await?;
                Ok(sub)
            }
            Backend::InMemory(state) => {
                let mut subs = state.subscriptions.write().await;
                let sub = subs
                    .values_mut()
                    .find(|s| s.provider_subscription_id == provider_subscription_id);
                Ok(sub.map(|s| {
                    s.used = 0;
                    if let Some(end) = new_period_end {
                        s.current_period_end = end;
                    }
                    s.version += 1;
                    s.updated_at = OffsetDateTime::now_utc();
                    s.clone()
                }))
            }
        }
    }

    // =========================================================================
    // Administrative overrides
    // =========================================================================

    pub async fn increase_quota(
        &self,
        subscription_id: Uuid,
        delta: i64,
    ) -> BillingResult<Option<Subscription>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let sub = sqlx::query_as::<_, Subscription>(
                    r#"
                    UPDATE subscriptions
                    SET quota = quota + $2, version = version + 1, updated_at = NOW()
                    WHERE id = $1
                    RETURNING *
                    "#,
                )
                .bind(subscription_id)
                .bind(delta)
                .fetch_optional(pool)
                .await?;
                Ok(sub)
            }
            Backend::InMemory(state) => {
                let mut subs = state.subscriptions.write().await;
                Ok(subs.get_mut(&subscription_id).map(|s| {
                    s.quota += delta;
                    s.version += 1;
                    s.updated_at = OffsetDateTime::now_utc();
                    s.clone()
                }))
            }
        }
    }

    pub async fn reset_used(&self, subscription_id: Uuid) -> BillingResult<Option<Subscription>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let sub = sqlx::query_as::<_, Subscription>(
                    r#"
                    UPDATE subscriptions
                    SET used = 0, version = version + 1, updated_at = NOW()
                    WHERE id = $1
                    RETURNING *
                    "#,
                )
                .bind(subscription_id)
                .fetch_optional(pool)
                .await?;
                Ok(sub)
            }
            Backend::InMemory(state) => {
                let mut subs = state.subscriptions.write().await;
                Ok(subs.get_mut(&subscription_id).map(|s| {
                    s.used = 0;
                    s.version += 1;
                    s.updated_at = OffsetDateTime::now_utc();
                    s.clone()
                }))
            }
        }
    }

    pub async fn extend_period(
        &self,
        subscription_id: Uuid,
        days: i64,
    ) -> BillingResult<Option<Subscription>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let sub = sqlx::query_as::<_, Subscription>(
                    r#"
                    UPDATE subscriptions
                    SET current_period_end = current_period_end + make_interval(days => $2::INT),
                        version = version + 1,
                        updated_at = NOW()
                    WHERE id = $1
                    RETURNING *
                    "#,
                )
                .bind(subscription_id)
                .bind(days)
                .fetch_optional(pool)
                .await?;
                Ok(sub)
            }
            Backend::InMemory(state) => {
                let mut subs = state.subscriptions.write().await;
                Ok(subs.get_mut(&subscription_id).map(|s| {
                    s.current_period_end += Duration::days(days);
                    s.version += 1;
                    s.updated_at = OffsetDateTime::now_utc();
                    s.clone()
                }))
            }
        }
    }

    /// Merge helper for admin dedupe: overwrite counters on the canonical row.
    pub async fn set_usage_and_quota(
        &self,
        subscription_id: Uuid,
        used: i64,
        quota: i64,
    ) -> BillingResult<Option<Subscription>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let sub = sqlx::query_as::<_, Subscription>(
                    r#"
                    UPDATE subscriptions
                    SET used = $2, quota = $3, version = version + 1, updated_at = NOW()
                    WHERE id = $1
                    RETURNING *
                    "#,
                )
                .bind(subscription_id)
                .bind(used)
                .bind(quota)
                .fetch_optional(pool)
                .await?;
                Ok(sub)
            }
            Backend::InMemory(state) => {
                let mut subs = state.subscriptions.write().await;
                Ok(subs.get_mut(&subscription_id).map(|s| {
                    s.used = used;
                    s.quota = quota;
                    s.version += 1;
                    s.updated_at = OffsetDateTime::now_utc();
                    s.clone()
                }))
            }
        }
    }

    /// Physical deletion, reserved for explicit admin deduplication.
    pub async fn delete_subscription(&self, subscription_id: Uuid) -> BillingResult<bool> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let result = sqlx::query("DELETE FROM subscriptions WHERE id = $1")
                    .bind(subscription_id)
                    .execute(pool)
                    .await?;
                Ok(result.rows_affected() > 0)
            }
            Backend::InMemory(state) => Ok(state
                .subscriptions
                .write()
                .await
                .remove(&subscription_id)
                .is_some()),
        }
    }

    // =========================================================================
    // Users
    // =========================================================================

    pub async fn create_user(
        &self,
        email: &str,
        api_key_hash: &str,
        is_admin: bool,
    ) -> BillingResult<User> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let user = sqlx::query_as::<_, User>(
                    r#"
                    INSERT INTO users (email, api_key_hash, is_admin)
                    VALUES ($1, $2, $3)
                    RETURNING *
                    "#,
                )
                .bind(email)
                .bind(api_key_hash)
                .bind(is_admin)
                .fetch_one(pool)
                .await?;
                Ok(user)
            }
            Backend::InMemory(state) => {
                let user = User {
                    id: Uuid::new_v4(),
                    email: email.to_string(),
                    provider_customer_id: None,
                    api_key_hash: api_key_hash.to_string(),
                    is_admin,
                    created_at: OffsetDateTime::now_utc(),
                };
                state.users.write().await.insert(user.id, user.clone());
                Ok(user)
            }
        }
    }

    pub async fn find_user(&self, user_id: Uuid) -> BillingResult<Option<User>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
                    .bind(user_id)
                    .fetch_optional(pool)
                    .await?;
                Ok(user)
            }
            Backend::InMemory(state) => Ok(state.users.read().await.get(&user_id).cloned()),
        }
    }

    pub async fn find_user_by_customer(&self, customer_id: &str) -> BillingResult<Option<User>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let user =
                    sqlx::query_as::<_, User>("SELECT * FROM users WHERE provider_customer_id = $1")
                        .bind(customer_id)
                        .fetch_optional(pool)
                        .await?;
                Ok(user)
            }
            Backend::InMemory(state) => Ok(state
                .users
                .read()
                .await
                .values()
                .find(|u| u.provider_customer_id.as_deref() == Some(customer_id))
                .cloned()),
        }
    }

    pub async fn find_user_by_api_key_hash(&self, hash: &str) -> BillingResult<Option<User>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE api_key_hash = $1")
                    .bind(hash)
                    .fetch_optional(pool)
                    .await?;
                Ok(user)
            }
            Backend::InMemory(state) => Ok(state
                .users
                .read()
                .await
                .values()
                .find(|u| u.api_key_hash == hash)
                .cloned()),
        }
    }

    /// Attach the billing-provider customer id to a user. Idempotent: writing
    /// the same id again is a no-op. Returns false when the user is unknown.
    pub async fn link_customer(&self, user_id: Uuid, customer_id: &str) -> BillingResult<bool> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let result = sqlx::query("UPDATE users SET provider_customer_id = $2 WHERE id = $1")
                    .bind(user_id)
                    .bind(customer_id)
                    .execute(pool)
                    .await?;
                Ok(result.rows_affected() > 0)
            }
            Backend::InMemory(state) => {
                let mut users = state.users.write().await;
                Ok(users
                    .get_mut(&user_id)
                    .map(|u| u.provider_customer_id = Some(customer_id.to_string()))
                    .is_some())
            }
        }
    }

    // =========================================================================
    // Webhook event journal
    // =========================================================================

    /// Atomically claim exclusive processing rights for a provider event.
    /// Returns false when the event is already claimed or succeeded. An
    /// event journaled as `error`, or stuck in `processing` past the
    /// timeout, can be re-claimed: the provider redelivers failed events,
    /// and a redelivery swallowed as a duplicate would lose them forever.
    pub async fn claim_event(
        &self,
        provider_event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<bool> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let claimed: Option<(Uuid,)> = sqlx::query_as(
                    r#"
                    INSERT INTO billing_webhook_events
                        (provider_event_id, event_type, event_timestamp, processing_result, processing_started_at)
                    VALUES ($1, $2, $3, 'processing', NOW())
                    ON CONFLICT (provider_event_id) DO UPDATE SET
                        processing_result = 'processing',
                        processing_started_at = NOW(),
                        error_message = NULL
                    WHERE billing_webhook_events.processing_result = 'error'
                       OR (billing_webhook_events.processing_result = 'processing'
                           AND billing_webhook_events.processing_started_at < NOW() - ($4 || ' minutes')::INTERVAL)
                    RETURNING id
                    "#,
                )
                .bind(provider_event_id)
                .bind(event_type)
                .bind(event_timestamp)
                .bind(EVENT_PROCESSING_TIMEOUT.whole_minutes())
                .fetch_optional(pool)
                .await?;
                Ok(claimed.is_some())
            }
            Backend::InMemory(state) => {
                let mut events = state.events.write().await;
                let now = OffsetDateTime::now_utc();
                match events.get_mut(provider_event_id) {
                    Some(event) => {
                        let stuck = event.processing_result == "processing"
                            && event.processing_started_at < now - EVENT_PROCESSING_TIMEOUT;
                        if event.processing_result == "error" || stuck {
                            event.processing_result = "processing".to_string();
                            event.processing_started_at = now;
                            Ok(true)
                        } else {
                            Ok(false)
                        }
                    }
                    None => {
                        events.insert(
                            provider_event_id.to_string(),
                            MemoryEvent {
                                processing_result: "processing".to_string(),
                                processing_started_at: now,
                            },
                        );
                        Ok(true)
                    }
                }
            }
        }
    }

    /// Record the processing outcome for a claimed event.
    pub async fn complete_event(
        &self,
        provider_event_id: &str,
        success: bool,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        let result = if success { "success" } else { "error" };
        match &self.backend {
            Backend::Postgres(pool) => {
                sqlx::query(
                    r#"
                    UPDATE billing_webhook_events
                    SET processing_result = $2, error_message = $3
                    WHERE provider_event_id = $1
                    "#,
                )
                .bind(provider_event_id)
                .bind(result)
                .bind(error_message)
                .execute(pool)
                .await?;
                Ok(())
            }
            Backend::InMemory(state) => {
                if let Some(event) = state.events.write().await.get_mut(provider_event_id) {
                    event.processing_result = result.to_string();
                }
                Ok(())
            }
        }
    }

    /// Usage records for a user, newest first (in-memory returns insertion
    /// order reversed). Audit/analysis only.
    pub async fn list_usage_records(&self, user_id: Uuid) -> BillingResult<Vec<UsageRecord>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let records = sqlx::query_as::<_, UsageRecord>(
                    "SELECT * FROM usage_records WHERE user_id = $1 ORDER BY created_at DESC",
                )
                .bind(user_id)
                .fetch_all(pool)
                .await?;
                Ok(records)
            }
            Backend::InMemory(state) => {
                let records = state.usage_records.read().await;
                Ok(records
                    .iter()
                    .filter(|r| r.user_id == user_id)
                    .rev()
                    .cloned()
                    .collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    async fn seeded_store() -> (BillingStore, User) {
        let store = BillingStore::new_in_memory();
        let user = store.create_user("test@example.com", "hash", false).await.unwrap();
        (store, user)
    }

    fn upsert_for(user: &User, provider_id: &str) -> SubscriptionUpsert {
        SubscriptionUpsert {
            provider_subscription_id: provider_id.to_string(),
            user_id: user.id,
            tier: SubscriptionTier::Pro,
            quota: 50_000,
            status: SubscriptionStatus::Active,
            current_period_end: OffsetDateTime::now_utc() + Duration::days(30),
        }
    }

    #[tokio::test]
    async fn test_upsert_creates_then_updates_preserving_used() {
        let (store, user) = seeded_store().await;

        let created = store.upsert_subscription(upsert_for(&user, "psub_1")).await.unwrap();
        assert_eq!(created.used, 0);

        store.commit_usage(created.id, created.version, 123).await.unwrap().unwrap();

        let mut update = upsert_for(&user, "psub_1");
        update.quota = 200_000;
        update.tier = SubscriptionTier::Premium;
        let updated = store.upsert_subscription(update).await.unwrap();

        assert_eq!(updated.id, created.id);
        assert_eq!(updated.quota, 200_000);
        assert_eq!(updated.used, 123, "plain update must not reset used");
    }

    #[tokio::test]
    async fn test_commit_usage_rejects_stale_version() {
        let (store, user) = seeded_store().await;
        let sub = store.upsert_subscription(upsert_for(&user, "psub_1")).await.unwrap();

        let first = store.commit_usage(sub.id, sub.version, 10).await.unwrap();
        assert!(first.is_some());

        // Same (now stale) version loses
        let second = store.commit_usage(sub.id, sub.version, 10).await.unwrap();
        assert!(second.is_none());

        let fresh = store.find_by_id(sub.id).await.unwrap().unwrap();
        assert_eq!(fresh.used, 10);
    }

    #[tokio::test]
    async fn test_reset_usage_is_the_only_zeroing_path() {
        let (store, user) = seeded_store().await;
        let sub = store.upsert_subscription(upsert_for(&user, "psub_1")).await.unwrap();
        store.commit_usage(sub.id, sub.version, 500).await.unwrap().unwrap();

        let new_end = OffsetDateTime::now_utc() + Duration::days(60);
        let reset = store.reset_usage("psub_1", Some(new_end)).await.unwrap().unwrap();
        assert_eq!(reset.used, 0);
        assert_eq!(reset.current_period_end, new_end);
        assert_eq!(reset.quota, sub.quota);
    }

    #[tokio::test]
    async fn test_mark_canceled_retains_row() {
        let (store, user) = seeded_store().await;
        let sub = store.upsert_subscription(upsert_for(&user, "psub_1")).await.unwrap();

        let canceled = store.mark_canceled("psub_1").await.unwrap().unwrap();
        assert_eq!(canceled.status, SubscriptionStatus::Canceled);
        assert!(store.find_by_id(sub.id).await.unwrap().is_some());

        // Unknown provider id is not an error
        assert!(store.mark_canceled("psub_missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_active_prefers_latest_period() {
        let (store, user) = seeded_store().await;
        let mut older = upsert_for(&user, "psub_old");
        older.current_period_end = OffsetDateTime::now_utc() + Duration::days(5);
        store.upsert_subscription(older).await.unwrap();
        let newer = store.upsert_subscription(upsert_for(&user, "psub_new")).await.unwrap();

        let active = store.find_active_for_user(user.id).await.unwrap().unwrap();
        assert_eq!(active.id, newer.id);
    }

    #[tokio::test]
    async fn test_claim_event_once() {
        let store = BillingStore::new_in_memory();
        let ts = OffsetDateTime::now_utc();
        assert!(store.claim_event("evt_1", "x", ts).await.unwrap());
        assert!(!store.claim_event("evt_1", "x", ts).await.unwrap());
        store.complete_event("evt_1", true, None).await.unwrap();
        assert!(!store.claim_event("evt_1", "x", ts).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_event_reclaimable_on_redelivery() {
        let store = BillingStore::new_in_memory();
        let ts = OffsetDateTime::now_utc();
        assert!(store.claim_event("evt_fail", "x", ts).await.unwrap());
        store
            .complete_event("evt_fail", false, Some("downstream unavailable"))
            .await
            .unwrap();

        // The provider redelivers failed events; the retry must get a fresh
        // claim instead of being treated as a duplicate.
        assert!(store.claim_event("evt_fail", "x", ts).await.unwrap());
        store.complete_event("evt_fail", true, None).await.unwrap();
        assert!(!store.claim_event("evt_fail", "x", ts).await.unwrap());
    }

    #[tokio::test]
    async fn test_link_customer_idempotent() {
        let (store, user) = seeded_store().await;
        assert!(store.link_customer(user.id, "cus_1").await.unwrap());
        assert!(store.link_customer(user.id, "cus_1").await.unwrap());
        let found = store.find_user_by_customer("cus_1").await.unwrap().unwrap();
        assert_eq!(found.id, user.id);
        assert!(!store.link_customer(Uuid::new_v4(), "cus_2").await.unwrap());
    }
}
