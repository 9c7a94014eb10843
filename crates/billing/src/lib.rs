//! Subscription billing for Vitrine
//!
//! Plan catalog, payment gateway adapter, customer links, the subscription
//! lifecycle engine, and webhook ingress. The HTTP layer talks to
//! [`BillingService`]; everything else is plumbing behind it.

pub mod client;
pub mod customer;
pub mod error;
pub mod events;
pub mod gateway;
pub mod plans;
pub mod subscriptions;
pub mod webhooks;

pub use client::{StripeClient, StripeConfig};
pub use customer::{CustomerLink, CustomerLinkService};
pub use error::{BillingError, BillingResult};
pub use events::{ActorType, BillingEvent, BillingEventBuilder, BillingEventLogger, BillingEventType};
pub use gateway::{
    CheckoutCompletedData, GatewayCheckoutSession, GatewayCustomer, GatewayEvent,
    GatewayEventKind, GatewaySubscription, InvoicePaidData, PaymentGateway, StripeGateway,
};
pub use plans::{Plan, PlanCatalog, PlanInterval, PlanTier};
pub use subscriptions::{
    CheckoutOutcome, SubscriptionEngine, SubscriptionRecord, SubscriptionStatus,
};
pub use webhooks::{WebhookDisposition, WebhookHandler};

use sqlx::PgPool;

/// Everything the HTTP layer needs, wired to one gateway implementation
#[derive(Clone)]
pub struct BillingService<G = StripeGateway> {
    engine: SubscriptionEngine<G>,
    webhooks: WebhookHandler<G>,
    events: BillingEventLogger,
}

impl<G: PaymentGateway + Clone> BillingService<G> {
    pub fn new(pool: PgPool, gateway: G) -> Self {
        let engine = SubscriptionEngine::new(pool.clone(), gateway.clone());
        let webhooks = WebhookHandler::new(pool.clone(), gateway, engine.clone());
        let events = BillingEventLogger::new(pool);
        Self {
            engine,
            webhooks,
            events,
        }
    }

    pub fn engine(&self) -> &SubscriptionEngine<G> {
        &self.engine
    }

    pub fn webhooks(&self) -> &WebhookHandler<G> {
        &self.webhooks
    }

    pub fn events(&self) -> &BillingEventLogger {
        &self.events
    }
}

impl BillingService<StripeGateway> {
    /// Construct from `STRIPE_SECRET_KEY`, `STRIPE_WEBHOOK_SECRET`, and
    /// `APP_BASE_URL`
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let client = StripeClient::from_env()?;
        Ok(Self::new(pool, StripeGateway::new(client)))
    }
}
