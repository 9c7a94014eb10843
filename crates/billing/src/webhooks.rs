//! Webhook ingress
//!
//! Receives gateway events, verifies signatures, deduplicates redeliveries,
//! and dispatches each event to the subscription engine. The gateway retries
//! unacknowledged deliveries for days, so every event is acknowledged once
//! the signature checks out; processing failures are logged and recorded but
//! never surfaced as delivery errors.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::gateway::{GatewayEvent, GatewayEventKind, PaymentGateway};
use crate::subscriptions::SubscriptionEngine;

/// How long a claimed event may sit unfinished before another delivery may
/// reclaim it, in minutes. Covers a worker dying mid-processing.
const STALE_CLAIM_MINUTES: i32 = 30;

/// What happened to a delivered event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookDisposition {
    /// Event processed (or was a recognized no-op)
    Processed,
    /// Same event id already handled or in flight; delivery acknowledged
    Duplicate,
    /// Processing failed after the signature was verified; delivery is still
    /// acknowledged and the failure recorded
    Failed,
}

/// Verifies, deduplicates, and dispatches gateway events
#[derive(Clone)]
pub struct WebhookHandler<G> {
    pool: PgPool,
    gateway: G,
    engine: SubscriptionEngine<G>,
}

impl<G: PaymentGateway + Clone> WebhookHandler<G> {
    pub fn new(pool: PgPool, gateway: G, engine: SubscriptionEngine<G>) -> Self {
        Self {
            pool,
            gateway,
            engine,
        }
    }

    /// Handle one raw delivery.
    ///
    /// Returns `SignatureInvalid` for payloads that fail verification (the
    /// only case callers should turn into a 4xx); every other path resolves
    /// to a disposition that the HTTP layer acknowledges with 200.
    pub async fn handle_delivery(
        &self,
        payload: &str,
        signature_header: &str,
    ) -> BillingResult<WebhookDisposition> {
        let event = self.gateway.verify_and_parse_event(payload, signature_header)?;

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Received webhook event"
        );

        if matches!(event.kind, GatewayEventKind::Unrecognized) {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Unhandled event type - acknowledging without action"
            );
            return Ok(WebhookDisposition::Processed);
        }

        let claim = match self.claim_event(&event, payload).await {
            Ok(claim) => claim,
            Err(e) => {
                // Dedup bookkeeping failed; process anyway rather than lose
                // the event. Handlers are idempotent by construction.
                tracing::error!(
                    event_id = %event.id,
                    error = %e,
                    "Failed to record webhook event - processing without dedup"
                );
                None
            }
        };

        match claim {
            Some(row_id) => self.process_claimed(&event, row_id).await,
            None => {
                tracing::info!(
                    event_id = %event.id,
                    "Duplicate webhook delivery - already processed or in flight"
                );
                Ok(WebhookDisposition::Duplicate)
            }
        }
    }

    /// Atomically claim an event id for processing.
    ///
    /// First delivery inserts the row and wins. A redelivery only reclaims
    /// the row when a previous claim went stale without recording a result.
    async fn claim_event(&self, event: &GatewayEvent, payload: &str) -> BillingResult<Option<Uuid>> {
        let raw: serde_json::Value =
            serde_json::from_str(payload).unwrap_or(serde_json::Value::Null);

        let row_id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO gateway_webhook_events
                (gateway_event_id, event_type, payload, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (gateway_event_id) DO UPDATE SET
                processing_started_at = NOW()
            WHERE gateway_webhook_events.processing_result = 'processing'
              AND gateway_webhook_events.processing_started_at < NOW() - ($4 * INTERVAL '1 minute')
            RETURNING id
            "#,
        )
        .bind(&event.id)
        .bind(&event.event_type)
        .bind(&raw)
        .bind(STALE_CLAIM_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row_id)
    }

    async fn process_claimed(
        &self,
        event: &GatewayEvent,
        row_id: Uuid,
    ) -> BillingResult<WebhookDisposition> {
        let outcome = self.dispatch(event).await;

        let (result, error_text) = match &outcome {
            Ok(()) => ("processed", None),
            Err(e) => ("failed", Some(e.to_string())),
        };

        self.record_result(row_id, result, error_text.as_deref())
            .await;

        match outcome {
            Ok(()) => Ok(WebhookDisposition::Processed),
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Webhook event processing failed"
                );
                Ok(WebhookDisposition::Failed)
            }
        }
    }

    async fn dispatch(&self, event: &GatewayEvent) -> BillingResult<()> {
        match &event.kind {
            GatewayEventKind::CheckoutCompleted(data) => {
                self.engine.apply_checkout_completed(data, &event.id).await
            }
            GatewayEventKind::InvoicePaid(data) => {
                self.engine.apply_invoice_paid(data, &event.id).await
            }
            GatewayEventKind::SubscriptionUpdated(snapshot) => {
                self.engine
                    .apply_subscription_state(snapshot, false, &event.id)
                    .await
            }
            GatewayEventKind::SubscriptionDeleted(snapshot) => {
                self.engine
                    .apply_subscription_state(snapshot, true, &event.id)
                    .await
            }
            GatewayEventKind::Unrecognized => Ok(()),
        }
    }

    /// Record the processing outcome, retrying once. A row stuck at
    /// 'processing' only blocks redelivery until the stale window lapses.
    async fn record_result(&self, row_id: Uuid, result: &str, error_text: Option<&str>) {
        for attempt in 0..2 {
            let written = sqlx::query(
                r#"
                UPDATE gateway_webhook_events SET
                    processing_result = $2,
                    processing_error = $3,
                    processed_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(row_id)
            .bind(result)
            .bind(error_text)
            .execute(&self.pool)
            .await;

            match written {
                Ok(_) => return,
                Err(e) if attempt == 0 => {
                    tracing::warn!(row_id = %row_id, error = %e, "Retrying webhook result write");
                }
                Err(e) => {
                    tracing::error!(
                        row_id = %row_id,
                        error = %e,
                        "Failed to record webhook processing result"
                    );
                }
            }
        }
    }
}

impl WebhookDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Duplicate => "duplicate",
            Self::Failed => "failed",
        }
    }
}
