//! Billing event log
//!
//! Append-only record of every billing operation, used to answer "why is
//! this user on this plan?" and to reconstruct a subscription's history when
//! gateway state and local state disagree.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Types of billing events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingEventType {
    CheckoutStarted,
    CheckoutCompleted,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionCancelled,
    TrialStarted,
    InvoicePaid,
    CustomerCreated,
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BillingEventType::CheckoutStarted => "CHECKOUT_STARTED",
            BillingEventType::CheckoutCompleted => "CHECKOUT_COMPLETED",
            BillingEventType::SubscriptionCreated => "SUBSCRIPTION_CREATED",
            BillingEventType::SubscriptionUpdated => "SUBSCRIPTION_UPDATED",
            BillingEventType::SubscriptionCancelled => "SUBSCRIPTION_CANCELLED",
            BillingEventType::TrialStarted => "TRIAL_STARTED",
            BillingEventType::InvoicePaid => "INVOICE_PAID",
            BillingEventType::CustomerCreated => "CUSTOMER_CREATED",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// End user through the API
    User,
    /// System automation
    System,
    /// Payment gateway webhook
    Gateway,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::System => write!(f, "system"),
            ActorType::Gateway => write!(f, "gateway"),
        }
    }
}

/// A billing event record
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BillingEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub gateway_event_id: Option<String>,
    pub gateway_subscription_id: Option<String>,
    pub actor_type: String,
    pub created_at: OffsetDateTime,
}

/// Builder for billing events
pub struct BillingEventBuilder {
    user_id: Uuid,
    event_type: BillingEventType,
    event_data: serde_json::Value,
    gateway_event_id: Option<String>,
    gateway_subscription_id: Option<String>,
    actor_type: ActorType,
}

impl BillingEventBuilder {
    pub fn new(user_id: Uuid, event_type: BillingEventType) -> Self {
        Self {
            user_id,
            event_type,
            event_data: serde_json::json!({}),
            gateway_event_id: None,
            gateway_subscription_id: None,
            actor_type: ActorType::System,
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    pub fn gateway_event(mut self, event_id: impl Into<String>) -> Self {
        self.gateway_event_id = Some(event_id.into());
        self
    }

    pub fn gateway_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.gateway_subscription_id = Some(subscription_id.into());
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }
}

/// Writes and queries the billing event log
#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<Uuid> {
        let event_id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO billing_events (
                user_id, event_type, event_data,
                gateway_event_id, gateway_subscription_id, actor_type
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(builder.user_id)
        .bind(builder.event_type.to_string())
        .bind(&builder.event_data)
        .bind(&builder.gateway_event_id)
        .bind(&builder.gateway_subscription_id)
        .bind(builder.actor_type.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(event_id.0)
    }

    /// Recent events for a user, newest first
    pub async fn events_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        let events: Vec<BillingEvent> = sqlx::query_as(
            r#"
            SELECT id, user_id, event_type, event_data,
                   gateway_event_id, gateway_subscription_id, actor_type, created_at
            FROM billing_events
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    /// Events tied to one gateway subscription, newest first
    pub async fn events_for_subscription(
        &self,
        gateway_subscription_id: &str,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        let events: Vec<BillingEvent> = sqlx::query_as(
            r#"
            SELECT id, user_id, event_type, event_data,
                   gateway_event_id, gateway_subscription_id, actor_type, created_at
            FROM billing_events
            WHERE gateway_subscription_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(gateway_subscription_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    /// Log a checkout session opened by a user
    pub async fn log_checkout_started(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        session_id: &str,
    ) -> BillingResult<Uuid> {
        let builder = BillingEventBuilder::new(user_id, BillingEventType::CheckoutStarted)
            .data(serde_json::json!({
                "plan_id": plan_id,
                "session_id": session_id,
            }))
            .actor_type(ActorType::User);

        self.log_event(builder).await
    }

    /// Log a subscription confirmed from a completed checkout
    pub async fn log_subscription_created(
        &self,
        user_id: Uuid,
        gateway_event_id: &str,
        gateway_subscription_id: &str,
        status: &str,
    ) -> BillingResult<Uuid> {
        let builder = BillingEventBuilder::new(user_id, BillingEventType::SubscriptionCreated)
            .data(serde_json::json!({ "status": status }))
            .gateway_event(gateway_event_id)
            .gateway_subscription(gateway_subscription_id)
            .actor_type(ActorType::Gateway);

        self.log_event(builder).await
    }

    /// Log a paid invoice applied to a subscription
    pub async fn log_invoice_paid(
        &self,
        user_id: Uuid,
        gateway_event_id: &str,
        gateway_subscription_id: &str,
        amount_paid_cents: i64,
    ) -> BillingResult<Uuid> {
        let builder = BillingEventBuilder::new(user_id, BillingEventType::InvoicePaid)
            .data(serde_json::json!({ "amount_paid_cents": amount_paid_cents }))
            .gateway_event(gateway_event_id)
            .gateway_subscription(gateway_subscription_id)
            .actor_type(ActorType::Gateway);

        self.log_event(builder).await
    }
}
