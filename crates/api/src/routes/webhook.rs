//! Billing provider webhook endpoint
//!
//! The body must be the raw bytes the provider signed; any re-serialization
//! would break signature verification, so the handler takes the body as a
//! string and never parses it before the signature check.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get("x-billing-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing x-billing-signature header".to_string()))?;

    state.billing.webhooks.handle_delivery(&body, signature).await?;

    Ok(Json(json!({"received": true})))
}
