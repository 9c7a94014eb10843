//! Webhook ingress: dedup, replay, and failure recording

use std::collections::HashMap;

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use vitrine_billing::{
    BillingError, GatewaySubscription, SubscriptionEngine, WebhookDisposition, WebhookHandler,
};

use crate::mock_gateway::{sign_payload, MockGateway};

async fn setup_pool() -> PgPool {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to test database");
    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

fn handler(pool: &PgPool, gateway: MockGateway) -> WebhookHandler<MockGateway> {
    let engine = SubscriptionEngine::new(pool.clone(), gateway.clone());
    WebhookHandler::new(pool.clone(), gateway, engine)
}

fn invoice_paid_payload(event_id: &str, subscription_id: &str) -> String {
    format!(
        r#"{{
            "id": "{event_id}",
            "type": "invoice.paid",
            "created": {created},
            "data": {{"object": {{
                "id": "in_{event_id}",
                "object": "invoice",
                "subscription": "{subscription_id}",
                "customer": "cus_wh",
                "amount_paid": 7990
            }}}}
        }}"#,
        created = OffsetDateTime::now_utc().unix_timestamp(),
    )
}

fn scripted_subscription(external_id: &str) -> GatewaySubscription {
    let now = OffsetDateTime::now_utc();
    GatewaySubscription {
        external_id: external_id.to_string(),
        customer_id: Some("cus_wh".to_string()),
        status: "active".to_string(),
        cancel_at_period_end: false,
        canceled_at: None,
        ended_at: None,
        current_period_start: Some(now),
        current_period_end: Some(now + Duration::days(30)),
        trial_start: None,
        trial_end: None,
        price_id: Some("price_pro_monthly".to_string()),
        item_id: Some("si_wh".to_string()),
        paid_amount_cents: Some(7990),
        metadata: HashMap::new(),
    }
}

/// Seed a user with a checked-out subscription attached to `external_id`
async fn seed_subscription(pool: &PgPool, external_id: &str) -> Uuid {
    let user_id = Uuid::new_v4();
    sqlx::query("INSERT INTO users (id, email, name) VALUES ($1, $2, 'Webhook User')")
        .bind(user_id)
        .bind(format!("wh-{}@example.com", user_id))
        .execute(pool)
        .await
        .expect("Failed to create user");

    sqlx::query(
        r#"
        INSERT INTO subscriptions (
            user_id, plan_id, gateway, gateway_customer_id,
            gateway_subscription_id, status, amount, currency
        )
        VALUES ($1, '0a7e17e4-16c1-4f0e-b02d-8d5bd4f0a3a3', 'stripe', 'cus_wh',
                $2, 'TRIALING', 79.90, 'USD')
        "#,
    )
    .bind(user_id)
    .bind(external_id)
    .execute(pool)
    .await
    .expect("Failed to seed subscription");
    user_id
}

#[tokio::test]
#[ignore] // Requires database
async fn test_replayed_event_processed_once() {
    let pool = setup_pool().await;
    let gateway = MockGateway::new();
    let handler = handler(&pool, gateway.clone());

    let external_id = format!("sub_wh_{}", Uuid::new_v4().simple());
    seed_subscription(&pool, &external_id).await;
    gateway.set_subscription(scripted_subscription(&external_id));

    let event_id = format!("evt_wh_{}", Uuid::new_v4().simple());
    let payload = invoice_paid_payload(&event_id, &external_id);
    let signature = sign_payload(&payload);

    let first = handler.handle_delivery(&payload, &signature).await.unwrap();
    assert_eq!(first, WebhookDisposition::Processed);

    let second = handler.handle_delivery(&payload, &signature).await.unwrap();
    assert_eq!(second, WebhookDisposition::Duplicate);

    let (result,): (String,) = sqlx::query_as(
        "SELECT processing_result FROM gateway_webhook_events WHERE gateway_event_id = $1",
    )
    .bind(&event_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(result, "processed");
}

#[tokio::test]
#[ignore] // Requires database
async fn test_tampered_payload_rejected_before_claim() {
    let pool = setup_pool().await;
    let gateway = MockGateway::new();
    let handler = handler(&pool, gateway);

    let event_id = format!("evt_wh_{}", Uuid::new_v4().simple());
    let payload = invoice_paid_payload(&event_id, "sub_whatever");
    let signature = sign_payload(&payload);
    let tampered = payload.replace("7990", "1");

    let err = handler.handle_delivery(&tampered, &signature).await.unwrap_err();
    assert!(matches!(err, BillingError::SignatureInvalid));

    // Nothing was recorded for the rejected delivery
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM gateway_webhook_events WHERE gateway_event_id = $1",
    )
    .bind(&event_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_unrecognized_event_acked_without_claim() {
    let pool = setup_pool().await;
    let gateway = MockGateway::new();
    let handler = handler(&pool, gateway);

    let event_id = format!("evt_wh_{}", Uuid::new_v4().simple());
    let payload = format!(
        r#"{{"id": "{event_id}", "type": "payment_method.attached", "created": {},
             "data": {{"object": {{"id": "pm_1"}}}}}}"#,
        OffsetDateTime::now_utc().unix_timestamp(),
    );
    let signature = sign_payload(&payload);

    let disposition = handler.handle_delivery(&payload, &signature).await.unwrap();
    assert_eq!(disposition, WebhookDisposition::Processed);

    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM gateway_webhook_events WHERE gateway_event_id = $1",
    )
    .bind(&event_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_processing_failure_recorded_and_acked() {
    let pool = setup_pool().await;
    let gateway = MockGateway::new();
    let handler = handler(&pool, gateway.clone());

    // Gateway knows the subscription but no local row exists
    let external_id = format!("sub_wh_{}", Uuid::new_v4().simple());
    gateway.set_subscription(scripted_subscription(&external_id));

    let event_id = format!("evt_wh_{}", Uuid::new_v4().simple());
    let payload = invoice_paid_payload(&event_id, &external_id);
    let signature = sign_payload(&payload);

    let disposition = handler.handle_delivery(&payload, &signature).await.unwrap();
    assert_eq!(disposition, WebhookDisposition::Failed);

    let (result, error): (String, Option<String>) = sqlx::query_as(
        "SELECT processing_result, processing_error FROM gateway_webhook_events WHERE gateway_event_id = $1",
    )
    .bind(&event_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(result, "failed");
    assert!(error.unwrap().contains("unknown subscription"));
}
