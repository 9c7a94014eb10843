//! Customer gateway link
//!
//! Maps internal users to gateway-side customer objects, one link per
//! (user, gateway). Links are created lazily on first checkout and reused
//! forever after.

use std::collections::HashMap;

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use vitrine_shared::{GatewayKind, UserId};

use crate::error::{BillingError, BillingResult};
use crate::gateway::PaymentGateway;

/// A persisted user-to-gateway-customer link
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CustomerLink {
    pub id: Uuid,
    pub user_id: Uuid,
    pub gateway: GatewayKind,
    pub external_customer_id: String,
    pub created_at: OffsetDateTime,
}

/// Resolves and creates customer links
#[derive(Clone)]
pub struct CustomerLinkService<G> {
    pool: PgPool,
    gateway: G,
}

impl<G: PaymentGateway> CustomerLinkService<G> {
    pub fn new(pool: PgPool, gateway: G) -> Self {
        Self { pool, gateway }
    }

    /// Look up the existing link for a user, if any
    pub async fn find_link(&self, user_id: UserId) -> BillingResult<Option<CustomerLink>> {
        let link = sqlx::query_as::<_, CustomerLink>(
            r#"
            SELECT id, user_id, gateway, external_customer_id, created_at
            FROM customer_gateways
            WHERE user_id = $1 AND gateway = $2
            "#,
        )
        .bind(user_id.0)
        .bind(self.gateway.kind())
        .fetch_optional(&self.pool)
        .await?;

        Ok(link)
    }

    /// Return the user's gateway customer id, creating the customer and link
    /// on first use.
    ///
    /// The gateway call happens outside any transaction: a network round trip
    /// must never hold a database transaction open. Two concurrent callers may
    /// both create a gateway customer; the unique (user_id, gateway) index
    /// makes the first insert win, and the loser's orphaned gateway customer
    /// is tolerated (it carries no payment method and accrues no charges).
    pub async fn ensure_customer(
        &self,
        user_id: UserId,
        email: &str,
        name: &str,
    ) -> BillingResult<String> {
        if let Some(link) = self.find_link(user_id).await? {
            return Ok(link.external_customer_id);
        }

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());

        let customer = self.gateway.create_customer(email, name, metadata).await?;

        let inserted = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO customer_gateways (user_id, gateway, external_customer_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, gateway) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(user_id.0)
        .bind(self.gateway.kind())
        .bind(&customer.external_id)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_some() {
            tracing::info!(
                user_id = %user_id,
                external_customer_id = %customer.external_id,
                "Linked user to gateway customer"
            );
            return Ok(customer.external_id);
        }

        // Lost the race: another request linked this user first. Use the
        // winning link; our freshly created gateway customer stays orphaned.
        let link = self.find_link(user_id).await?.ok_or_else(|| {
            BillingError::Internal(format!(
                "Customer link insert conflicted but no row exists for user {}",
                user_id
            ))
        })?;

        tracing::warn!(
            user_id = %user_id,
            winner = %link.external_customer_id,
            orphaned = %customer.external_id,
            "Concurrent customer creation - keeping first link, orphaning duplicate gateway customer"
        );

        Ok(link.external_customer_id)
    }

    /// Resolve a gateway customer id back to the owning user
    pub async fn find_user_by_customer(
        &self,
        external_customer_id: &str,
    ) -> BillingResult<Option<UserId>> {
        let user_id = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT user_id
            FROM customer_gateways
            WHERE external_customer_id = $1 AND gateway = $2
            "#,
        )
        .bind(external_customer_id)
        .bind(self.gateway.kind())
        .fetch_optional(&self.pool)
        .await?;

        Ok(user_id.map(UserId))
    }
}
