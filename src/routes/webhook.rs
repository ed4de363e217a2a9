use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};

use crate::{error::ApiError, AppState};

/// POST /api/billing/webhook — the single entry point for provider events.
/// Signature verification is the one hard gate: anything that fails it is
/// rejected with 400. Verified events are applied by the reconciler;
/// processing errors return 500 so the provider redelivers.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::bad_request("Missing stripe-signature header"))?;

    let payload = std::str::from_utf8(&body)
        .map_err(|_| ApiError::bad_request("Invalid webhook payload"))?;

    let event =
        stripe::Webhook::construct_event(payload, signature, state.stripe.webhook_secret())
            .map_err(|e| {
                tracing::warn!(error = %e, "Webhook signature verification failed");
                ApiError::bad_request("Invalid webhook signature")
            })?;

    state.webhooks.handle_event(event).await?;

    Ok(Json(json!({ "received": true })))
}
