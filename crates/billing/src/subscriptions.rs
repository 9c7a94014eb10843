//! Subscription lifecycle engine
//!
//! Owns the subscriptions table and every transition applied to it: checkout
//! provisioning, webhook-driven confirmation, renewal, and termination. Each
//! user has at most one subscription row; checkout upserts it and webhook
//! handlers converge it toward the gateway's view.

use std::collections::HashMap;

use bigdecimal::BigDecimal;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use vitrine_shared::{GatewayKind, User, UserId};

use crate::customer::CustomerLinkService;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::gateway::{
    CheckoutCompletedData, GatewaySubscription, InvoicePaidData, PaymentGateway,
};
use crate::plans::{PlanCatalog, PlanInterval};

/// Lifecycle state of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, serde::Serialize, serde::Deserialize)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Free,
    Trialing,
    Active,
    PastDue,
    Cancelled,
    Incomplete,
    IncompleteExpired,
    Unpaid,
    Paused,
    /// Status vocabulary the gateway added after this code shipped. Rows are
    /// still updated so no data is lost; entitlement is denied.
    Unknown,
}

impl SubscriptionStatus {
    /// Map the gateway's status vocabulary onto ours. Unrecognized values
    /// become `Unknown` (logged at warn) instead of failing the webhook.
    pub fn from_gateway(raw: &str) -> Self {
        match raw {
            "trialing" => Self::Trialing,
            "active" => Self::Active,
            "past_due" => Self::PastDue,
            "canceled" => Self::Cancelled,
            "incomplete" => Self::Incomplete,
            "incomplete_expired" => Self::IncompleteExpired,
            "unpaid" => Self::Unpaid,
            "paused" => Self::Paused,
            other => {
                tracing::warn!(
                    gateway_status = %other,
                    "Unrecognized gateway subscription status - storing as UNKNOWN"
                );
                Self::Unknown
            }
        }
    }

    /// Whether this status entitles the user to paid features. Past-due
    /// subscriptions keep access while the gateway retries payment.
    pub fn has_access(&self) -> bool {
        matches!(self, Self::Trialing | Self::Active | Self::PastDue)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::IncompleteExpired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "FREE",
            Self::Trialing => "TRIALING",
            Self::Active => "ACTIVE",
            Self::PastDue => "PAST_DUE",
            Self::Cancelled => "CANCELLED",
            Self::Incomplete => "INCOMPLETE",
            Self::IncompleteExpired => "INCOMPLETE_EXPIRED",
            Self::Unpaid => "UNPAID",
            Self::Paused => "PAUSED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A subscription row
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub gateway: GatewayKind,
    pub gateway_customer_id: String,
    pub gateway_subscription_id: Option<String>,
    pub gateway_price_id: Option<String>,
    pub gateway_item_id: Option<String>,
    pub status: SubscriptionStatus,
    pub amount: BigDecimal,
    pub currency: String,
    pub trial_started_at: Option<OffsetDateTime>,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    /// False until the first gateway-confirmed write replaces the
    /// provisional schedule estimated at checkout time
    pub period_confirmed: bool,
    pub cancel_at_period_end: bool,
    pub cancelled_at: Option<OffsetDateTime>,
    pub ended_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Result of opening a checkout session
#[derive(Debug, Clone)]
pub struct CheckoutOutcome {
    pub checkout_url: String,
    pub session_id: String,
}

/// Provisional billing schedule computed at checkout time, before the
/// gateway has confirmed anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionalSchedule {
    pub trial_started_at: Option<OffsetDateTime>,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
}

/// Estimate the billing schedule from the plan alone. The trial runs
/// `trial_days` from now; the first paid period is estimated from the plan's
/// own interval and replaced by gateway values on the first webhook.
pub fn provisional_schedule(
    now: OffsetDateTime,
    trial_days: i32,
    interval: PlanInterval,
) -> ProvisionalSchedule {
    let (trial_started_at, trial_ends_at) = if trial_days > 0 {
        (Some(now), Some(now + Duration::days(i64::from(trial_days))))
    } else {
        (None, None)
    };
    let period_start = trial_ends_at.unwrap_or(now);
    ProvisionalSchedule {
        trial_started_at,
        trial_ends_at,
        period_start,
        period_end: period_start + interval.provisional_period(),
    }
}

/// Convert a gateway amount in minor units to a decimal major-unit amount.
/// 7990 cents becomes 79.90, exactly.
pub fn cents_to_decimal(cents: i64) -> BigDecimal {
    BigDecimal::new(cents.into(), 2)
}

/// Drives subscription state
#[derive(Clone)]
pub struct SubscriptionEngine<G> {
    pool: PgPool,
    gateway: G,
    plans: PlanCatalog,
    customers: CustomerLinkService<G>,
    events: BillingEventLogger,
}

impl<G: PaymentGateway + Clone> SubscriptionEngine<G> {
    pub fn new(pool: PgPool, gateway: G) -> Self {
        let plans = PlanCatalog::new(pool.clone());
        let customers = CustomerLinkService::new(pool.clone(), gateway.clone());
        let events = BillingEventLogger::new(pool.clone());
        Self {
            pool,
            gateway,
            plans,
            customers,
            events,
        }
    }

    pub fn plans(&self) -> &PlanCatalog {
        &self.plans
    }

    pub fn customers(&self) -> &CustomerLinkService<G> {
        &self.customers
    }

    /// Open a hosted checkout session for a plan and provision the user's
    /// subscription row.
    ///
    /// The row is written with a provisional schedule and
    /// `period_confirmed = FALSE`; the completion webhook replaces it with
    /// gateway-confirmed values. Re-running checkout before completing an
    /// earlier session simply re-targets the same row.
    pub async fn checkout(&self, user_id: UserId, plan_id: Uuid) -> BillingResult<CheckoutOutcome> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, name, created_at, updated_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::UserNotFound(user_id.0.to_string()))?;

        let plan = self.plans.find_active_plan(plan_id).await?;
        let price_id = self
            .plans
            .find_price_mapping(plan_id, self.gateway.kind())
            .await?;

        let customer_id = self
            .customers
            .ensure_customer(UserId(user.id), &user.email, &user.name)
            .await?;

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user.id.to_string());
        metadata.insert("plan_id".to_string(), plan.id.to_string());

        let trial_days = u32::try_from(plan.trial_days).unwrap_or(0);
        let session = self
            .gateway
            .create_checkout_session(&customer_id, &price_id, trial_days, metadata)
            .await?;

        let schedule = provisional_schedule(
            OffsetDateTime::now_utc(),
            plan.trial_days,
            plan.billing_interval,
        );
        let status = if plan.trial_days > 0 {
            SubscriptionStatus::Trialing
        } else {
            SubscriptionStatus::Incomplete
        };

        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                user_id, plan_id, gateway, gateway_customer_id, gateway_price_id,
                status, amount, currency, trial_started_at, trial_ends_at,
                current_period_start, current_period_end, period_confirmed
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, FALSE)
            ON CONFLICT (user_id) DO UPDATE SET
                plan_id = EXCLUDED.plan_id,
                gateway = EXCLUDED.gateway,
                gateway_customer_id = EXCLUDED.gateway_customer_id,
                gateway_price_id = EXCLUDED.gateway_price_id,
                status = EXCLUDED.status,
                amount = EXCLUDED.amount,
                currency = EXCLUDED.currency,
                trial_started_at = EXCLUDED.trial_started_at,
                trial_ends_at = EXCLUDED.trial_ends_at,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                period_confirmed = FALSE,
                cancel_at_period_end = FALSE,
                cancelled_at = NULL,
                ended_at = NULL,
                updated_at = NOW()
            "#,
        )
        .bind(user.id)
        .bind(plan.id)
        .bind(self.gateway.kind())
        .bind(&customer_id)
        .bind(&price_id)
        .bind(status)
        .bind(&plan.price)
        .bind(&plan.currency)
        .bind(schedule.trial_started_at)
        .bind(schedule.trial_ends_at)
        .bind(schedule.period_start)
        .bind(schedule.period_end)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            user_id = %user.id,
            plan_id = %plan.id,
            session_id = %session.session_id,
            trial_days = plan.trial_days,
            "Provisioned subscription and opened checkout session"
        );

        if let Err(e) = self
            .events
            .log_checkout_started(user.id, plan.id, &session.session_id)
            .await
        {
            tracing::warn!(user_id = %user.id, error = %e, "Failed to record checkout event");
        }

        Ok(CheckoutOutcome {
            checkout_url: session.url,
            session_id: session.session_id,
        })
    }

    /// Apply a completed checkout: attach the gateway subscription id to the
    /// user's row and confirm the schedule from the gateway's view.
    ///
    /// Metadata written at session creation identifies the user and plan;
    /// the event payload is only trusted for those ids, everything else
    /// comes from a fresh retrieval.
    pub async fn apply_checkout_completed(
        &self,
        data: &CheckoutCompletedData,
        gateway_event_id: &str,
    ) -> BillingResult<()> {
        let user_id = extract_metadata_uuid(&data.metadata, "user_id")?;
        let plan_id = extract_metadata_uuid(&data.metadata, "plan_id")?;

        let subscription_id = data.subscription_id.as_deref().ok_or_else(|| {
            BillingError::InvariantViolation(format!(
                "Checkout session {} completed without a subscription",
                data.session_id
            ))
        })?;

        let sub = self.gateway.retrieve_subscription(subscription_id).await?;
        let status = SubscriptionStatus::from_gateway(&sub.status);

        let customer_id = sub
            .customer_id
            .clone()
            .or_else(|| data.customer_id.clone())
            .ok_or_else(|| {
                BillingError::InvariantViolation(format!(
                    "Subscription {} has no customer", subscription_id
                ))
            })?;

        // The first invoice may be discounted, so the charged amount comes
        // from the expanded latest_invoice when present, the plan price
        // otherwise.
        let charged = sub.paid_amount_cents.map(cents_to_decimal);

        let result = sqlx::query(
            r#"
            INSERT INTO subscriptions (
                user_id, plan_id, gateway, gateway_customer_id,
                gateway_subscription_id, gateway_price_id, gateway_item_id,
                status, amount, currency, trial_started_at, trial_ends_at,
                current_period_start, current_period_end, period_confirmed
            )
            SELECT $1, $2, $3, $4, $5, $6, $7, $8, COALESCE($9, p.price),
                   p.currency, $10, $11, $12, $13, TRUE
            FROM plans p WHERE p.id = $2
            ON CONFLICT (user_id) DO UPDATE SET
                plan_id = EXCLUDED.plan_id,
                gateway_customer_id = EXCLUDED.gateway_customer_id,
                gateway_subscription_id = EXCLUDED.gateway_subscription_id,
                gateway_price_id = EXCLUDED.gateway_price_id,
                gateway_item_id = EXCLUDED.gateway_item_id,
                status = EXCLUDED.status,
                amount = EXCLUDED.amount,
                trial_started_at = EXCLUDED.trial_started_at,
                trial_ends_at = EXCLUDED.trial_ends_at,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                period_confirmed = TRUE,
                cancel_at_period_end = $14,
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(plan_id)
        .bind(self.gateway.kind())
        .bind(&customer_id)
        .bind(subscription_id)
        .bind(sub.price_id.as_deref())
        .bind(sub.item_id.as_deref())
        .bind(status)
        .bind(&charged)
        .bind(sub.trial_start)
        .bind(sub.trial_end)
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(sub.cancel_at_period_end)
        .execute(&self.pool)
        .await?;

        // INSERT .. SELECT inserts nothing when the plan row is gone
        if result.rows_affected() == 0 {
            return Err(BillingError::InvariantViolation(format!(
                "Checkout {} completed for unknown plan {}",
                data.session_id, plan_id
            )));
        }

        tracing::info!(
            user_id = %user_id,
            plan_id = %plan_id,
            gateway_subscription_id = %subscription_id,
            status = %status,
            "Confirmed subscription from completed checkout"
        );

        if let Err(e) = self
            .events
            .log_subscription_created(user_id, gateway_event_id, subscription_id, status.as_str())
            .await
        {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to record subscription event");
        }

        Ok(())
    }

    /// Apply a paid invoice: renewal or first charge. The subscription's
    /// status and period bounds come from a fresh retrieval; the paid amount
    /// comes from the invoice itself.
    pub async fn apply_invoice_paid(
        &self,
        data: &InvoicePaidData,
        gateway_event_id: &str,
    ) -> BillingResult<()> {
        let subscription_id = match data.subscription_id.as_deref() {
            Some(id) => id,
            None => {
                // One-off invoices carry no subscription; nothing to update
                tracing::info!(invoice_id = %data.invoice_id, "Invoice not tied to a subscription - skipping");
                return Ok(());
            }
        };

        let sub = self.gateway.retrieve_subscription(subscription_id).await?;
        let status = SubscriptionStatus::from_gateway(&sub.status);
        let amount = cents_to_decimal(data.amount_paid_cents);

        let user_id = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE subscriptions SET
                status = $2,
                amount = $3,
                current_period_start = $4,
                current_period_end = $5,
                period_confirmed = TRUE,
                cancel_at_period_end = $6,
                gateway_item_id = COALESCE($7, gateway_item_id),
                updated_at = NOW()
            WHERE gateway_subscription_id = $1
            RETURNING user_id
            "#,
        )
        .bind(subscription_id)
        .bind(status)
        .bind(&amount)
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(sub.cancel_at_period_end)
        .bind(sub.item_id.as_deref())
        .fetch_optional(&self.pool)
        .await?;

        let user_id = user_id.ok_or_else(|| {
            BillingError::InvariantViolation(format!(
                "Invoice {} paid for unknown subscription {}",
                data.invoice_id, subscription_id
            ))
        })?;

        tracing::info!(
            gateway_subscription_id = %subscription_id,
            invoice_id = %data.invoice_id,
            amount_cents = data.amount_paid_cents,
            status = %status,
            "Applied paid invoice"
        );

        if let Err(e) = self
            .events
            .log_invoice_paid(
                user_id,
                gateway_event_id,
                subscription_id,
                data.amount_paid_cents,
            )
            .await
        {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to record invoice event");
        }

        Ok(())
    }

    /// Apply a subscription state change reported by the gateway.
    ///
    /// For live subscriptions the event payload is only a trigger; the state
    /// written is a fresh retrieval. Deleted subscriptions cannot be
    /// retrieved meaningfully, so the payload's terminal snapshot is applied
    /// as-is.
    pub async fn apply_subscription_state(
        &self,
        snapshot: &GatewaySubscription,
        deleted: bool,
        gateway_event_id: &str,
    ) -> BillingResult<()> {
        let sub = if deleted {
            snapshot.clone()
        } else {
            self.gateway
                .retrieve_subscription(&snapshot.external_id)
                .await?
        };

        let status = if deleted {
            SubscriptionStatus::Cancelled
        } else {
            SubscriptionStatus::from_gateway(&sub.status)
        };

        // Deletion events are applied without a confirming fetch, so only
        // the terminal fields are trusted; the stored period stays as the
        // last confirmed write left it.
        let user_id = if deleted {
            sqlx::query_scalar::<_, Uuid>(
                r#"
                UPDATE subscriptions SET
                    status = $2,
                    cancel_at_period_end = $3,
                    cancelled_at = $4,
                    ended_at = $5,
                    updated_at = NOW()
                WHERE gateway_subscription_id = $1
                RETURNING user_id
                "#,
            )
            .bind(&snapshot.external_id)
            .bind(status)
            .bind(sub.cancel_at_period_end)
            .bind(sub.canceled_at)
            .bind(sub.ended_at)
            .fetch_optional(&self.pool)
            .await?
        } else {
            sqlx::query_scalar::<_, Uuid>(
                r#"
                UPDATE subscriptions SET
                    status = $2,
                    cancel_at_period_end = $3,
                    cancelled_at = $4,
                    ended_at = $5,
                    current_period_start = COALESCE($6, current_period_start),
                    current_period_end = COALESCE($7, current_period_end),
                    period_confirmed = TRUE,
                    updated_at = NOW()
                WHERE gateway_subscription_id = $1
                RETURNING user_id
                "#,
            )
            .bind(&snapshot.external_id)
            .bind(status)
            .bind(sub.cancel_at_period_end)
            .bind(sub.canceled_at)
            .bind(sub.ended_at)
            .bind(sub.current_period_start)
            .bind(sub.current_period_end)
            .fetch_optional(&self.pool)
            .await?
        };

        let user_id = user_id.ok_or_else(|| {
            BillingError::InvariantViolation(format!(
                "State change for unknown subscription {}",
                snapshot.external_id
            ))
        })?;

        tracing::info!(
            gateway_subscription_id = %snapshot.external_id,
            status = %status,
            deleted = deleted,
            "Applied subscription state change"
        );

        let event_type = if deleted {
            BillingEventType::SubscriptionCancelled
        } else {
            BillingEventType::SubscriptionUpdated
        };
        let builder = BillingEventBuilder::new(user_id, event_type)
            .data(serde_json::json!({
                "status": status.as_str(),
                "cancel_at_period_end": sub.cancel_at_period_end,
            }))
            .gateway_event(gateway_event_id)
            .gateway_subscription(&snapshot.external_id)
            .actor_type(ActorType::Gateway);
        if let Err(e) = self.events.log_event(builder).await {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to record subscription event");
        }

        Ok(())
    }

    /// The user's subscription row, if they have ever checked out
    pub async fn find_subscription(
        &self,
        user_id: UserId,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record = sqlx::query_as::<_, SubscriptionRecord>(
            r#"
            SELECT id, user_id, plan_id, gateway, gateway_customer_id,
                   gateway_subscription_id, gateway_price_id, gateway_item_id,
                   status, amount, currency, trial_started_at, trial_ends_at,
                   current_period_start, current_period_end, period_confirmed,
                   cancel_at_period_end, cancelled_at, ended_at, created_at,
                   updated_at
            FROM subscriptions
            WHERE user_id = $1
            "#,
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }
}

fn extract_metadata_uuid(metadata: &HashMap<String, String>, key: &str) -> BillingResult<Uuid> {
    metadata
        .get(key)
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or_else(|| {
            BillingError::InvariantViolation(format!(
                "Checkout metadata missing or invalid '{}'",
                key
            ))
        })
}
