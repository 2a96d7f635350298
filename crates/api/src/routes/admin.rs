//! Admin endpoints
//!
//! All routes here require the shared admin token. These are operator
//! tools: user provisioning, manual subscription overrides, duplicate
//! repair, and consistency checks.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use promptmeter_billing::InvariantChecker;

use crate::auth::{hash_api_key, require_admin};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    /// The plaintext key is hashed here and never stored.
    pub api_key: String,
    #[serde(default)]
    pub is_admin: bool,
}

pub async fn create_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateUserRequest>,
) -> ApiResult<Json<Value>> {
    require_admin(&state, &headers)?;

    if request.email.trim().is_empty() || !request.email.contains('@') {
        return Err(ApiError::BadRequest("A valid email is required".to_string()));
    }
    if request.api_key.len() < 32 {
        return Err(ApiError::BadRequest(
            "API key must be at least 32 characters".to_string(),
        ));
    }

    let user = state
        .billing
        .store
        .create_user(
            request.email.trim(),
            &hash_api_key(&request.api_key),
            request.is_admin,
        )
        .await?;

    tracing::info!(user_id = %user.id, email = %user.email, "User created by admin");
    Ok(Json(json!({"user": user})))
}

/// Manual subscription adjustment
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OverrideAction {
    /// Add tokens to the quota ceiling
    IncreaseQuota { amount: i64 },
    /// Zero the usage counter without touching the period
    ResetUsage,
    /// Push the period end out by whole days
    ExtendPeriod { days: i64 },
}

#[derive(Debug, Deserialize)]
pub struct OverrideRequest {
    pub user_id: Uuid,
    #[serde(flatten)]
    pub action: OverrideAction,
}

pub async fn override_subscription(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<OverrideRequest>,
) -> ApiResult<Json<Value>> {
    require_admin(&state, &headers)?;

    let subscription = state
        .billing
        .store
        .find_active_for_user(request.user_id)
        .await?
        .ok_or_else(|| {
            ApiError::NotFound(format!(
                "No active subscription for user {}",
                request.user_id
            ))
        })?;

    let store = &state.billing.store;
    let updated = match &request.action {
        OverrideAction::IncreaseQuota { amount } => {
            if *amount <= 0 {
                return Err(ApiError::BadRequest(
                    "amount must be positive".to_string(),
                ));
            }
            store.increase_quota(subscription.id, *amount).await?
        }
        OverrideAction::ResetUsage => store.reset_used(subscription.id).await?,
        OverrideAction::ExtendPeriod { days } => {
            if *days <= 0 {
                return Err(ApiError::BadRequest("days must be positive".to_string()));
            }
            store.extend_period(subscription.id, *days).await?
        }
    };

    let updated = updated.ok_or_else(|| {
        ApiError::NotFound(format!("Subscription {} disappeared", subscription.id))
    })?;

    tracing::info!(
        user_id = %request.user_id,
        subscription_id = %updated.id,
        action = ?request.action,
        "Admin subscription override applied"
    );

    Ok(Json(json!({"subscription": updated})))
}

#[derive(Debug, Deserialize)]
pub struct DedupeRequest {
    pub user_id: Uuid,
}

/// Merge duplicate active subscriptions for one user.
///
/// Replayed checkouts can leave a user with several active rows. The row
/// with the latest period end is kept; usage and quota are merged with max
/// so no consumption or entitlement is lost, and the losers are deleted.
pub async fn dedupe_subscriptions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<DedupeRequest>,
) -> ApiResult<Json<Value>> {
    require_admin(&state, &headers)?;

    let store = &state.billing.store;
    let active = store.list_active_for_user(request.user_id).await?;
    if active.len() <= 1 {
        return Ok(Json(json!({
            "merged": false,
            "active_subscriptions": active.len(),
        })));
    }

    // list_active_for_user orders by period end descending
    let canonical = &active[0];
    let merged_used = active.iter().map(|s| s.used).max().unwrap_or(canonical.used);
    let merged_quota = active
        .iter()
        .map(|s| s.quota)
        .max()
        .unwrap_or(canonical.quota);

    store
        .set_usage_and_quota(canonical.id, merged_used, merged_quota)
        .await?;

    let mut deleted = Vec::new();
    for duplicate in &active[1..] {
        if store.delete_subscription(duplicate.id).await? {
            deleted.push(duplicate.id);
        }
    }

    tracing::warn!(
        user_id = %request.user_id,
        canonical_id = %canonical.id,
        deleted = deleted.len(),
        merged_used,
        merged_quota,
        "Deduplicated active subscriptions"
    );

    Ok(Json(json!({
        "merged": true,
        "canonical_id": canonical.id,
        "deleted_ids": deleted,
        "used": merged_used,
        "quota": merged_quota,
    })))
}

fn invariant_checker(state: &AppState) -> ApiResult<&InvariantChecker> {
    state.billing.invariants.as_ref().ok_or_else(|| {
        ApiError::Internal("Invariant checks require the database backend".to_string())
    })
}

pub async fn run_invariants(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    require_admin(&state, &headers)?;

    let summary = invariant_checker(&state)?.run_all_checks().await?;
    Ok(Json(json!({"summary": summary})))
}

pub async fn run_single_invariant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    require_admin(&state, &headers)?;

    if !InvariantChecker::available_checks().contains(&name.as_str()) {
        return Err(ApiError::NotFound(format!("Unknown invariant '{}'", name)));
    }

    let violations = invariant_checker(&state)?.run_check(&name).await?;
    let passed = violations.is_empty();
    Ok(Json(json!({
        "invariant": name,
        "violations": violations,
        "passed": passed,
    })))
}
