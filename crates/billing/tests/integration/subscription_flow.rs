//! Checkout and lifecycle transitions against a real database

use std::collections::HashMap;

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use vitrine_billing::{
    BillingError, CheckoutCompletedData, GatewaySubscription, InvoicePaidData, SubscriptionEngine,
    SubscriptionStatus,
};
use vitrine_shared::{User, UserId};

use crate::mock_gateway::MockGateway;

/// Pro Monthly from the seed catalog: 79.90 USD, 14-day trial
const PRO_MONTHLY_PLAN_ID: &str = "0a7e17e4-16c1-4f0e-b02d-8d5bd4f0a3a3";

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

async fn create_test_user(pool: &PgPool) -> User {
    let id = Uuid::new_v4();
    sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (id, email, name)
        VALUES ($1, $2, $3)
        RETURNING id, email, name, created_at, updated_at
        "#,
    )
    .bind(id)
    .bind(format!("test-{}@example.com", id))
    .bind("Test User")
    .fetch_one(pool)
    .await
    .expect("Failed to create test user")
}

fn pro_plan_id() -> Uuid {
    Uuid::parse_str(PRO_MONTHLY_PLAN_ID).unwrap()
}

fn active_subscription(external_id: &str, customer_id: &str) -> GatewaySubscription {
    let now = OffsetDateTime::now_utc();
    GatewaySubscription {
        external_id: external_id.to_string(),
        customer_id: Some(customer_id.to_string()),
        status: "active".to_string(),
        cancel_at_period_end: false,
        canceled_at: None,
        ended_at: None,
        current_period_start: Some(now),
        current_period_end: Some(now + Duration::days(30)),
        trial_start: None,
        trial_end: None,
        price_id: Some("price_pro_monthly".to_string()),
        item_id: Some("si_mock".to_string()),
        paid_amount_cents: Some(7990),
        metadata: HashMap::new(),
    }
}

async fn subscription_row(
    pool: &PgPool,
    user_id: Uuid,
) -> Option<(SubscriptionStatus, Option<String>, bool, String)> {
    sqlx::query_as(
        r#"
        SELECT status, gateway_subscription_id, period_confirmed, amount::TEXT
        FROM subscriptions
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .expect("Failed to query subscription")
}

#[tokio::test]
#[ignore] // Requires database
async fn test_checkout_provisions_trialing_row() {
    let pool = setup_pool().await;
    let gateway = MockGateway::new();
    let engine = SubscriptionEngine::new(pool.clone(), gateway);
    let user = create_test_user(&pool).await;

    let outcome = engine.checkout(UserId(user.id), pro_plan_id()).await.unwrap();
    assert!(outcome.checkout_url.starts_with("https://"));

    let (status, sub_id, confirmed, amount) =
        subscription_row(&pool, user.id).await.expect("row exists");
    assert_eq!(status, SubscriptionStatus::Trialing);
    assert_eq!(sub_id, None);
    assert!(!confirmed);
    assert_eq!(amount, "79.90");

    let (trial_started_at, trial_ends_at): (Option<OffsetDateTime>, Option<OffsetDateTime>) =
        sqlx::query_as(
            "SELECT trial_started_at, trial_ends_at FROM subscriptions WHERE user_id = $1",
        )
        .bind(user.id)
        .fetch_one(&pool)
        .await
        .unwrap();
    let trial_started_at = trial_started_at.expect("trial start recorded");
    let trial_ends_at = trial_ends_at.expect("trial end recorded");

    // The trial window is exactly the plan's trial_days
    assert_eq!(trial_ends_at - trial_started_at, Duration::days(14));
    let expected = OffsetDateTime::now_utc() + Duration::days(14);
    assert!((trial_ends_at - expected).abs() < Duration::minutes(5));
}

#[tokio::test]
#[ignore] // Requires database
async fn test_repeated_checkout_keeps_single_row() {
    let pool = setup_pool().await;
    let gateway = MockGateway::new();
    let engine = SubscriptionEngine::new(pool.clone(), gateway.clone());
    let user = create_test_user(&pool).await;

    engine.checkout(UserId(user.id), pro_plan_id()).await.unwrap();
    engine.checkout(UserId(user.id), pro_plan_id()).await.unwrap();

    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM subscriptions WHERE user_id = $1")
            .bind(user.id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(count, 1);

    // The customer link is reused, not recreated
    assert_eq!(gateway.customers_created(), 1);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_concurrent_checkout_single_row() {
    let pool = setup_pool().await;
    let gateway = MockGateway::new();
    let engine = SubscriptionEngine::new(pool.clone(), gateway);
    let user = create_test_user(&pool).await;

    let (a, b) = tokio::join!(
        engine.checkout(UserId(user.id), pro_plan_id()),
        engine.checkout(UserId(user.id), pro_plan_id())
    );
    a.unwrap();
    b.unwrap();

    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM subscriptions WHERE user_id = $1")
            .bind(user.id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(count, 1);

    let (links,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM customer_gateways WHERE user_id = $1")
            .bind(user.id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(links, 1);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_checkout_completed_confirms_subscription() {
    let pool = setup_pool().await;
    let gateway = MockGateway::new();
    let engine = SubscriptionEngine::new(pool.clone(), gateway.clone());
    let user = create_test_user(&pool).await;

    engine.checkout(UserId(user.id), pro_plan_id()).await.unwrap();

    let external_id = format!("sub_test_{}", Uuid::new_v4().simple());
    gateway.set_subscription(active_subscription(&external_id, "cus_test"));

    let mut metadata = HashMap::new();
    metadata.insert("user_id".to_string(), user.id.to_string());
    metadata.insert("plan_id".to_string(), PRO_MONTHLY_PLAN_ID.to_string());

    let data = CheckoutCompletedData {
        session_id: "cs_test".to_string(),
        subscription_id: Some(external_id.clone()),
        customer_id: Some("cus_test".to_string()),
        metadata,
    };
    engine
        .apply_checkout_completed(&data, "evt_checkout_1")
        .await
        .unwrap();

    let (status, sub_id, confirmed, _) =
        subscription_row(&pool, user.id).await.expect("row exists");
    assert_eq!(status, SubscriptionStatus::Active);
    assert_eq!(sub_id, Some(external_id));
    assert!(confirmed);

    let (item_id,): (Option<String>,) =
        sqlx::query_as("SELECT gateway_item_id FROM subscriptions WHERE user_id = $1")
            .bind(user.id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(item_id.as_deref(), Some("si_mock"));
}

#[tokio::test]
#[ignore] // Requires database
async fn test_checkout_completed_applies_charged_amount() {
    let pool = setup_pool().await;
    let gateway = MockGateway::new();
    let engine = SubscriptionEngine::new(pool.clone(), gateway.clone());
    let user = create_test_user(&pool).await;

    engine.checkout(UserId(user.id), pro_plan_id()).await.unwrap();

    let external_id = format!("sub_test_{}", Uuid::new_v4().simple());
    let mut metadata = HashMap::new();
    metadata.insert("user_id".to_string(), user.id.to_string());
    metadata.insert("plan_id".to_string(), PRO_MONTHLY_PLAN_ID.to_string());
    let data = CheckoutCompletedData {
        session_id: "cs_test".to_string(),
        subscription_id: Some(external_id.clone()),
        customer_id: Some("cus_test".to_string()),
        metadata,
    };

    // Without an expanded invoice the row falls back to the plan price
    let mut sub = active_subscription(&external_id, "cus_test");
    sub.paid_amount_cents = None;
    gateway.set_subscription(sub);
    engine
        .apply_checkout_completed(&data, "evt_amount_1")
        .await
        .unwrap();
    let (_, _, _, amount) = subscription_row(&pool, user.id).await.expect("row exists");
    assert_eq!(amount, "79.90");

    // A discounted first invoice overrides the plan price
    let mut sub = active_subscription(&external_id, "cus_test");
    sub.paid_amount_cents = Some(3995);
    gateway.set_subscription(sub);
    engine
        .apply_checkout_completed(&data, "evt_amount_2")
        .await
        .unwrap();
    let (_, _, _, amount) = subscription_row(&pool, user.id).await.expect("row exists");
    assert_eq!(amount, "39.95");
}

#[tokio::test]
#[ignore] // Requires database
async fn test_checkout_completed_for_missing_plan_is_invariant_violation() {
    let pool = setup_pool().await;
    let gateway = MockGateway::new();
    let engine = SubscriptionEngine::new(pool.clone(), gateway.clone());
    let user = create_test_user(&pool).await;

    let external_id = format!("sub_test_{}", Uuid::new_v4().simple());
    gateway.set_subscription(active_subscription(&external_id, "cus_test"));

    let mut metadata = HashMap::new();
    metadata.insert("user_id".to_string(), user.id.to_string());
    metadata.insert("plan_id".to_string(), Uuid::new_v4().to_string());
    let data = CheckoutCompletedData {
        session_id: "cs_orphan".to_string(),
        subscription_id: Some(external_id),
        customer_id: Some("cus_test".to_string()),
        metadata,
    };

    let err = engine
        .apply_checkout_completed(&data, "evt_orphan_plan")
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvariantViolation(_)));
    assert!(subscription_row(&pool, user.id).await.is_none());
}

#[tokio::test]
#[ignore] // Requires database
async fn test_checkout_for_unknown_user_is_not_found() {
    let pool = setup_pool().await;
    let gateway = MockGateway::new();
    let engine = SubscriptionEngine::new(pool.clone(), gateway);

    let err = engine
        .checkout(UserId(Uuid::new_v4()), pro_plan_id())
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::UserNotFound(_)));
}

#[tokio::test]
#[ignore] // Requires database
async fn test_invoice_paid_updates_amount_from_invoice() {
    let pool = setup_pool().await;
    let gateway = MockGateway::new();
    let engine = SubscriptionEngine::new(pool.clone(), gateway.clone());
    let user = create_test_user(&pool).await;

    engine.checkout(UserId(user.id), pro_plan_id()).await.unwrap();

    let external_id = format!("sub_test_{}", Uuid::new_v4().simple());
    gateway.set_subscription(active_subscription(&external_id, "cus_test"));

    let mut metadata = HashMap::new();
    metadata.insert("user_id".to_string(), user.id.to_string());
    metadata.insert("plan_id".to_string(), PRO_MONTHLY_PLAN_ID.to_string());
    engine
        .apply_checkout_completed(
            &CheckoutCompletedData {
                session_id: "cs_test".to_string(),
                subscription_id: Some(external_id.clone()),
                customer_id: Some("cus_test".to_string()),
                metadata,
            },
            "evt_checkout_2",
        )
        .await
        .unwrap();

    let invoice = InvoicePaidData {
        invoice_id: "in_test_1".to_string(),
        subscription_id: Some(external_id.clone()),
        customer_id: Some("cus_test".to_string()),
        amount_paid_cents: 7990,
        period_start: None,
        period_end: None,
    };
    engine.apply_invoice_paid(&invoice, "evt_invoice_1").await.unwrap();

    let (status, _, confirmed, amount) =
        subscription_row(&pool, user.id).await.expect("row exists");
    assert_eq!(status, SubscriptionStatus::Active);
    assert!(confirmed);
    assert_eq!(amount, "79.90");
}

#[tokio::test]
#[ignore] // Requires database
async fn test_invoice_for_unknown_subscription_is_invariant_violation() {
    let pool = setup_pool().await;
    let gateway = MockGateway::new();
    let engine = SubscriptionEngine::new(pool.clone(), gateway.clone());

    let external_id = "sub_never_seen".to_string();
    gateway.set_subscription(active_subscription(&external_id, "cus_ghost"));

    let invoice = InvoicePaidData {
        invoice_id: "in_ghost".to_string(),
        subscription_id: Some(external_id),
        customer_id: Some("cus_ghost".to_string()),
        amount_paid_cents: 7990,
        period_start: None,
        period_end: None,
    };
    let err = engine
        .apply_invoice_paid(&invoice, "evt_ghost")
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvariantViolation(_)));
}

#[tokio::test]
#[ignore] // Requires database
async fn test_deleted_event_sets_terminal_fields() {
    let pool = setup_pool().await;
    let gateway = MockGateway::new();
    let engine = SubscriptionEngine::new(pool.clone(), gateway.clone());
    let user = create_test_user(&pool).await;

    engine.checkout(UserId(user.id), pro_plan_id()).await.unwrap();

    let external_id = format!("sub_test_{}", Uuid::new_v4().simple());
    gateway.set_subscription(active_subscription(&external_id, "cus_test"));

    let mut metadata = HashMap::new();
    metadata.insert("user_id".to_string(), user.id.to_string());
    metadata.insert("plan_id".to_string(), PRO_MONTHLY_PLAN_ID.to_string());
    engine
        .apply_checkout_completed(
            &CheckoutCompletedData {
                session_id: "cs_test".to_string(),
                subscription_id: Some(external_id.clone()),
                customer_id: Some("cus_test".to_string()),
                metadata,
            },
            "evt_checkout_3",
        )
        .await
        .unwrap();

    let (confirmed_period_end,): (Option<OffsetDateTime>,) =
        sqlx::query_as("SELECT current_period_end FROM subscriptions WHERE user_id = $1")
            .bind(user.id)
            .fetch_one(&pool)
            .await
            .unwrap();

    // Deletion snapshots are applied without a confirming fetch; a stale
    // period in the payload must not overwrite the confirmed one
    let now = OffsetDateTime::now_utc();
    let mut snapshot = active_subscription(&external_id, "cus_test");
    snapshot.status = "canceled".to_string();
    snapshot.canceled_at = Some(now);
    snapshot.ended_at = Some(now);
    snapshot.current_period_start = Some(now + Duration::days(60));
    snapshot.current_period_end = Some(now + Duration::days(90));

    engine
        .apply_subscription_state(&snapshot, true, "evt_deleted_1")
        .await
        .unwrap();

    let (status, cancelled_at, ended_at, period_end): (
        SubscriptionStatus,
        Option<OffsetDateTime>,
        Option<OffsetDateTime>,
        Option<OffsetDateTime>,
    ) = sqlx::query_as(
        "SELECT status, cancelled_at, ended_at, current_period_end
         FROM subscriptions WHERE user_id = $1",
    )
    .bind(user.id)
    .fetch_one(&pool)
    .await
    .unwrap();

    assert_eq!(status, SubscriptionStatus::Cancelled);
    assert!(cancelled_at.is_some());
    assert!(ended_at.is_some());
    assert_eq!(period_end, confirmed_period_end);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_find_subscription_by_user() {
    let pool = setup_pool().await;
    let gateway = MockGateway::new();
    let engine = SubscriptionEngine::new(pool.clone(), gateway);
    let user = create_test_user(&pool).await;

    assert!(engine
        .find_subscription(UserId(user.id))
        .await
        .unwrap()
        .is_none());

    engine.checkout(UserId(user.id), pro_plan_id()).await.unwrap();

    let record = engine
        .find_subscription(UserId(user.id))
        .await
        .unwrap()
        .expect("subscription exists");
    assert_eq!(record.user_id, user.id);
    assert_eq!(record.status, SubscriptionStatus::Trialing);
}
