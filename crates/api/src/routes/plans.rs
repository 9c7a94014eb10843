//! Public plan catalog endpoint

use axum::{extract::State, Json};
use serde::Serialize;
use uuid::Uuid;

use vitrine_billing::Plan;

use crate::error::ApiResult;
use crate::state::AppState;

/// Plan as exposed to clients
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanResponse {
    pub id: Uuid,
    pub name: String,
    pub tier: String,
    pub billing_interval: String,
    /// Decimal string, e.g. "79.90"
    pub price: String,
    pub currency: String,
    pub trial_days: i32,
    pub features: serde_json::Value,
}

impl From<Plan> for PlanResponse {
    fn from(plan: Plan) -> Self {
        Self {
            id: plan.id,
            name: plan.name,
            tier: plan.tier.to_string(),
            billing_interval: plan.billing_interval.to_string(),
            price: plan.price.to_string(),
            currency: plan.currency,
            trial_days: plan.trial_days,
            features: plan.features,
        }
    }
}

/// List active plans
pub async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<Vec<PlanResponse>>> {
    let plans = state.billing.engine().plans().list_active().await?;
    Ok(Json(plans.into_iter().map(PlanResponse::from).collect()))
}
