//! Billing routes: checkout, subscription lookup, and webhook ingress

use axum::{
    extract::{Extension, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use vitrine_billing::{BillingError, SubscriptionRecord};
use vitrine_shared::UserId;

use crate::{auth::AuthUser, error::ApiError, state::AppState};

/// Request to create a checkout session
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCheckoutRequest {
    pub plan_id: Uuid,
}

/// Response from creating a checkout session
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub checkout_url: String,
    pub session_id: String,
}

/// Subscription info response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    pub status: String,
    pub plan_id: Uuid,
    pub amount: String,
    pub currency: String,
    pub trial_ends_at: Option<String>,
    pub current_period_start: Option<String>,
    pub current_period_end: Option<String>,
    pub period_confirmed: bool,
    pub cancel_at_period_end: bool,
    pub cancelled_at: Option<String>,
}

impl From<SubscriptionRecord> for SubscriptionInfo {
    fn from(record: SubscriptionRecord) -> Self {
        Self {
            status: record.status.to_string(),
            plan_id: record.plan_id,
            amount: record.amount.to_string(),
            currency: record.currency,
            trial_ends_at: record.trial_ends_at.map(to_rfc3339),
            current_period_start: record.current_period_start.map(to_rfc3339),
            current_period_end: record.current_period_end.map(to_rfc3339),
            period_confirmed: record.period_confirmed,
            cancel_at_period_end: record.cancel_at_period_end,
            cancelled_at: record.cancelled_at.map(to_rfc3339),
        }
    }
}

fn to_rfc3339(ts: time::OffsetDateTime) -> String {
    ts.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| ts.to_string())
}

/// Create a hosted checkout session for a plan
pub async fn create_checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateCheckoutRequest>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    let outcome = state
        .billing
        .engine()
        .checkout(UserId(auth_user.user_id), req.plan_id)
        .await?;

    Ok(Json(CheckoutResponse {
        checkout_url: outcome.checkout_url,
        session_id: outcome.session_id,
    }))
}

/// Get the authenticated user's subscription
pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<SubscriptionInfo>, ApiError> {
    let record = state
        .billing
        .engine()
        .find_subscription(UserId(auth_user.user_id))
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(record.into()))
}

/// Handle payment gateway webhook deliveries.
///
/// Body is taken raw: signature verification runs over the exact bytes the
/// gateway sent, before any JSON parsing. Only a missing or invalid
/// signature (or an unparseable body) earns a 400; processing failures are
/// logged and acknowledged so the gateway does not retry events we have
/// already recorded.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<serde_json::Value>, ApiError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Webhook delivery missing signature header");
            ApiError::BadRequest("Missing signature header".to_string())
        })?;

    let disposition = state
        .billing
        .webhooks()
        .handle_delivery(&body, signature)
        .await
        .map_err(|e| match e {
            BillingError::SignatureInvalid => {
                tracing::warn!("Webhook signature verification failed");
                ApiError::BadRequest("Invalid webhook signature".to_string())
            }
            BillingError::UnsupportedEvent(msg) => {
                tracing::warn!(error = %msg, "Webhook payload could not be parsed");
                ApiError::BadRequest("Malformed webhook payload".to_string())
            }
            other => ApiError::from(other),
        })?;

    tracing::info!(disposition = disposition.as_str(), "Webhook delivery handled");

    Ok(Json(json!({ "received": true })))
}
