//! Metered completion endpoint
//!
//! The request path is gate, generate, commit:
//! 1. authenticate the API key and load the caller's active subscription
//! 2. admission-check a worst-case token estimate against remaining quota
//! 3. forward the prompt to the configured completion provider
//! 4. commit the actual token cost and append the audit record
//!
//! The gate uses a worst-case estimate because the real cost is only known
//! after the upstream responds; a caller-supplied `max_tokens` above the
//! configured default raises the estimate so the gate always covers the
//! largest completion the upstream may produce. The commit re-checks the
//! actual cost against the live row, so a racing request is denied rather
//! than pushed past quota. Commits after a failed upstream call never
//! happen, so a failed completion costs the caller nothing.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use time::OffsetDateTime;
use uuid::Uuid;

use promptmeter_billing::check_quota;

use crate::auth::authenticate;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const MAX_PROMPT_CHARS: usize = 4_000;

#[derive(Debug, Deserialize)]
pub struct AssistantRequest {
    pub prompt: String,
    /// Optional upstream completion cap; when above the configured default
    /// it also raises the admission estimate
    pub max_tokens: Option<i64>,
}

fn validate_prompt(raw: &str) -> Result<&str, ApiError> {
    let prompt = raw.trim();
    if prompt.is_empty() {
        return Err(ApiError::BadRequest("Prompt is required".to_string()));
    }
    if prompt.chars().count() > MAX_PROMPT_CHARS {
        return Err(ApiError::BadRequest(format!(
            "Prompt exceeds maximum length of {} characters",
            MAX_PROMPT_CHARS
        )));
    }
    Ok(prompt)
}

/// Worst-case token estimate the gate admits against. The caller's cap can
/// raise the estimate above the configured floor but never lower it, so a
/// large `max_tokens` cannot sneak past admission on the default estimate.
fn gate_estimate(requested: Option<i64>, configured: i64) -> Result<i64, ApiError> {
    match requested {
        Some(cap) if cap <= 0 => Err(ApiError::BadRequest(
            "max_tokens must be positive".to_string(),
        )),
        Some(cap) => Ok(cap.max(configured)),
        None => Ok(configured),
    }
}

pub async fn generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AssistantRequest>,
) -> ApiResult<Json<Value>> {
    let user = authenticate(&state, &headers).await?;

    let prompt = validate_prompt(&request.prompt)?;
    let estimate = gate_estimate(request.max_tokens, state.config.max_tokens_estimate)?;

    // Fresh snapshot for the gate; the commit below re-checks admission at
    // the row version it updates, so a stale read here can delay but never
    // corrupt the charge.
    let subscription = state.billing.store.find_active_for_user(user.id).await?;
    let admission = check_quota(
        subscription.as_ref(),
        estimate,
        OffsetDateTime::now_utc(),
    );

    if !admission.allowed {
        let message = admission
            .message
            .unwrap_or_else(|| "Request denied".to_string());
        tracing::info!(user_id = %user.id, message = %message, "Request denied by quota check");
        return Err(ApiError::QuotaDenied {
            message,
            remaining: admission.remaining,
        });
    }

    // Checked above: admission with no subscription is never allowed.
    let Some(subscription) = subscription else {
        return Err(ApiError::Internal(
            "Admission granted without a subscription".to_string(),
        ));
    };

    let completion = state
        .completion
        .generate(prompt, request.max_tokens)
        .await?;

    let updated = state
        .billing
        .usage
        .commit_usage(&subscription, completion.tokens_used)
        .await?;

    let request_ref = format!("req_{}", Uuid::new_v4().simple());
    state
        .billing
        .usage
        .record_usage(user.id, &request_ref, completion.tokens_used)
        .await?;

    tracing::info!(
        user_id = %user.id,
        request_ref = %request_ref,
        tokens_used = completion.tokens_used,
        remaining = updated.remaining(),
        "Completion metered"
    );

    Ok(Json(json!({
        "content": completion.content,
        "tokens_used": completion.tokens_used,
        "remaining": updated.remaining(),
        "request_ref": request_ref,
        "provider": completion.provider.as_str(),
        "model": completion.model,
    })))
}

/// Current quota position for the authenticated caller.
pub async fn usage(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let user = authenticate(&state, &headers).await?;

    let Some(subscription) = state.billing.store.find_active_for_user(user.id).await? else {
        return Ok(Json(json!({
            "subscription": Value::Null,
            "remaining": 0,
        })));
    };

    Ok(Json(json!({
        "subscription": {
            "tier": subscription.tier,
            "status": subscription.status,
            "quota": subscription.quota,
            "used": subscription.used,
            "current_period_end": subscription.current_period_end,
        },
        "remaining": subscription.remaining(),
    })))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_gate_estimate_uses_configured_floor() {
        assert_eq!(gate_estimate(None, 1_000).unwrap(), 1_000);
        // A small cap must not lower the worst-case estimate
        assert_eq!(gate_estimate(Some(50), 1_000).unwrap(), 1_000);
    }

    #[test]
    fn test_gate_estimate_tracks_larger_caller_cap() {
        assert_eq!(gate_estimate(Some(100_000), 1_000).unwrap(), 100_000);
    }

    #[test]
    fn test_gate_estimate_rejects_non_positive_cap() {
        assert!(matches!(
            gate_estimate(Some(0), 1_000),
            Err(ApiError::BadRequest(_))
        ));
        assert!(matches!(
            gate_estimate(Some(-5), 1_000),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[test]
    fn test_prompt_limit_counts_characters_not_bytes() {
        // Two bytes per character in UTF-8; the limit is on characters
        let at_limit = "é".repeat(MAX_PROMPT_CHARS);
        assert!(validate_prompt(&at_limit).is_ok());

        let over_limit = "é".repeat(MAX_PROMPT_CHARS + 1);
        assert!(matches!(
            validate_prompt(&over_limit),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[test]
    fn test_blank_prompt_rejected() {
        assert!(matches!(validate_prompt("   "), Err(ApiError::BadRequest(_))));
        assert_eq!(validate_prompt("  hi  ").unwrap(), "hi");
    }
}
