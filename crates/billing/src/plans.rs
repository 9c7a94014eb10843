//! Plan catalog
//!
//! Read-only reference data: plan tiers, billing intervals, prices, and the
//! per-gateway price mappings used at checkout. Plans are seeded by migration
//! and deactivated rather than deleted when retired.

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use vitrine_shared::GatewayKind;

use crate::error::{BillingError, BillingResult};

/// Subscription plan tier, ordered by capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum PlanTier {
    Starter,
    Pro,
    Unlimited,
}

impl PlanTier {
    /// Ordering rank (higher = more capable)
    pub fn rank(&self) -> u8 {
        match self {
            Self::Starter => 0,
            Self::Pro => 1,
            Self::Unlimited => 2,
        }
    }

    /// Whether switching to `other` is an upgrade
    pub fn is_upgrade_to(&self, other: PlanTier) -> bool {
        other.rank() > self.rank()
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starter => write!(f, "STARTER"),
            Self::Pro => write!(f, "PRO"),
            Self::Unlimited => write!(f, "UNLIMITED"),
        }
    }
}

impl std::str::FromStr for PlanTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "STARTER" => Ok(Self::Starter),
            "PRO" => Ok(Self::Pro),
            "UNLIMITED" => Ok(Self::Unlimited),
            _ => Err(format!("Invalid plan tier: {}", s)),
        }
    }
}

/// Billing interval for a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum PlanInterval {
    Monthly,
    Yearly,
}

impl PlanInterval {
    /// Length of one billing period, used only for the provisional
    /// `current_period_end` estimate written at checkout time. The gateway's
    /// first confirming webhook replaces it with the authoritative value.
    pub fn provisional_period(&self) -> time::Duration {
        match self {
            Self::Monthly => time::Duration::days(30),
            Self::Yearly => time::Duration::days(365),
        }
    }
}

impl std::fmt::Display for PlanInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Monthly => write!(f, "MONTHLY"),
            Self::Yearly => write!(f, "YEARLY"),
        }
    }
}

/// Subscription plan (immutable reference entity)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub tier: PlanTier,
    pub billing_interval: PlanInterval,
    pub price: BigDecimal,
    pub currency: String,
    pub trial_days: i32,
    pub active: bool,
    pub features: serde_json::Value,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Read-only catalog queries
#[derive(Clone)]
pub struct PlanCatalog {
    pool: PgPool,
}

impl PlanCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Find a plan that is present AND active.
    /// Inactive plans are indistinguishable from missing ones to callers:
    /// neither may be checked out against.
    pub async fn find_active_plan(&self, plan_id: Uuid) -> BillingResult<Plan> {
        let plan: Option<Plan> = sqlx::query_as(
            r#"
            SELECT id, name, tier, billing_interval, price, currency,
                   trial_days, active, features, created_at, updated_at
            FROM plans
            WHERE id = $1 AND active = TRUE
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;

        plan.ok_or_else(|| BillingError::PlanNotFound(plan_id.to_string()))
    }

    /// Resolve the external price identifier for (plan, gateway).
    ///
    /// A missing mapping is a configuration problem, not a bad plan id, and
    /// is reported distinctly so operators can tell the two apart.
    pub async fn find_price_mapping(
        &self,
        plan_id: Uuid,
        gateway: GatewayKind,
    ) -> BillingResult<String> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT external_price_id
            FROM plan_gateway_prices
            WHERE plan_id = $1 AND gateway = $2
            "#,
        )
        .bind(plan_id)
        .bind(gateway)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(id,)| id).ok_or_else(|| {
            BillingError::PlanNotConfigured(plan_id.to_string(), gateway.to_string())
        })
    }

    /// List active plans for the public catalog endpoint
    pub async fn list_active(&self) -> BillingResult<Vec<Plan>> {
        let plans: Vec<Plan> = sqlx::query_as(
            r#"
            SELECT id, name, tier, billing_interval, price, currency,
                   trial_days, active, features, created_at, updated_at
            FROM plans
            WHERE active = TRUE
            ORDER BY tier, billing_interval
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(plans)
    }
}
