//! Payment gateway adapter
//!
//! A capability-abstracted client for the external payment provider. The
//! subscription engine and webhook ingress are written against the
//! [`PaymentGateway`] trait; [`StripeGateway`] is the only implementation
//! today, but callers never name it directly.

use std::collections::HashMap;
use std::future::Future;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use stripe::{
    CheckoutSession, CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCustomer, Customer, CustomerId, Subscription, SubscriptionId,
};
use time::OffsetDateTime;

use vitrine_shared::GatewayKind;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Replay window for webhook signatures, in seconds
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

// =============================================================================
// Gateway-neutral data types
// =============================================================================

/// Customer created at the gateway
#[derive(Debug, Clone)]
pub struct GatewayCustomer {
    pub external_id: String,
    pub email: String,
}

/// Hosted checkout session opened at the gateway
#[derive(Debug, Clone)]
pub struct GatewayCheckoutSession {
    pub session_id: String,
    pub url: String,
}

/// Current subscription state as reported by the gateway.
///
/// Used both for authoritative retrievals and for the subscription snapshot
/// carried inside webhook payloads; fields absent from a given source stay
/// `None`.
#[derive(Debug, Clone, Default)]
pub struct GatewaySubscription {
    pub external_id: String,
    pub customer_id: Option<String>,
    /// Raw gateway status vocabulary ("trialing", "active", "past_due", ...)
    pub status: String,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    pub ended_at: Option<OffsetDateTime>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub price_id: Option<String>,
    pub item_id: Option<String>,
    /// Amount paid on the latest invoice, in minor units
    pub paid_amount_cents: Option<i64>,
    pub metadata: HashMap<String, String>,
}

/// Checkout session data carried by a `checkout.session.completed` event
#[derive(Debug, Clone)]
pub struct CheckoutCompletedData {
    pub session_id: String,
    pub subscription_id: Option<String>,
    pub customer_id: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Invoice data carried by an `invoice.paid` event
#[derive(Debug, Clone)]
pub struct InvoicePaidData {
    pub invoice_id: String,
    pub subscription_id: Option<String>,
    pub customer_id: Option<String>,
    pub amount_paid_cents: i64,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
}

/// Verified, parsed webhook event
#[derive(Debug, Clone)]
pub struct GatewayEvent {
    pub id: String,
    pub event_type: String,
    pub created: OffsetDateTime,
    pub kind: GatewayEventKind,
}

#[derive(Debug, Clone)]
pub enum GatewayEventKind {
    CheckoutCompleted(CheckoutCompletedData),
    InvoicePaid(InvoicePaidData),
    SubscriptionUpdated(GatewaySubscription),
    SubscriptionDeleted(GatewaySubscription),
    /// Event types this system does not act on. Acknowledged as a no-op so
    /// the gateway stops redelivering them.
    Unrecognized,
}

// =============================================================================
// Trait
// =============================================================================

/// Capability surface required from a payment provider.
///
/// All network methods return Send futures so callers can stay generic while
/// running on a multithreaded runtime. Signature verification is CPU-only.
pub trait PaymentGateway: Send + Sync {
    fn kind(&self) -> GatewayKind;

    /// Create a gateway-side customer. Idempotency is the caller's
    /// responsibility (see the customer link service).
    fn create_customer(
        &self,
        email: &str,
        name: &str,
        metadata: HashMap<String, String>,
    ) -> impl Future<Output = BillingResult<GatewayCustomer>> + Send;

    /// Open a hosted checkout session. `metadata` round-trips unchanged
    /// through the completion webhook.
    fn create_checkout_session(
        &self,
        customer_id: &str,
        price_id: &str,
        trial_days: u32,
        metadata: HashMap<String, String>,
    ) -> impl Future<Output = BillingResult<GatewayCheckoutSession>> + Send;

    /// Fetch the gateway's current view of a subscription. This is the
    /// source of truth webhook handlers apply, not the event payload.
    fn retrieve_subscription(
        &self,
        external_id: &str,
    ) -> impl Future<Output = BillingResult<GatewaySubscription>> + Send;

    /// Verify the signature over the exact raw payload bytes and parse the
    /// event. Rejecting forged payloads here is the single most
    /// security-critical operation in the system.
    fn verify_and_parse_event(
        &self,
        payload: &str,
        signature_header: &str,
    ) -> BillingResult<GatewayEvent>;
}

// =============================================================================
// Stripe implementation
// =============================================================================

/// Stripe-backed [`PaymentGateway`]
#[derive(Clone)]
pub struct StripeGateway {
    client: StripeClient,
}

impl StripeGateway {
    pub fn new(client: StripeClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &StripeClient {
        &self.client
    }
}

impl PaymentGateway for StripeGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::Stripe
    }

    async fn create_customer(
        &self,
        email: &str,
        name: &str,
        metadata: HashMap<String, String>,
    ) -> BillingResult<GatewayCustomer> {
        let params = CreateCustomer {
            email: Some(email),
            name: Some(name),
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer = Customer::create(self.client.inner(), params).await?;

        tracing::info!(
            customer_id = %customer.id,
            email = %email,
            "Created Stripe customer"
        );

        Ok(GatewayCustomer {
            external_id: customer.id.to_string(),
            email: customer.email.unwrap_or_else(|| email.to_string()),
        })
    }

    async fn create_checkout_session(
        &self,
        customer_id: &str,
        price_id: &str,
        trial_days: u32,
        metadata: HashMap<String, String>,
    ) -> BillingResult<GatewayCheckoutSession> {
        let customer: CustomerId = customer_id
            .parse()
            .map_err(|_| BillingError::GatewayRejected(format!("Invalid customer id: {}", customer_id)))?;

        let success_url = self.client.config().success_url();
        let cancel_url = self.client.config().cancel_url();

        let mut params = CreateCheckoutSession::new();
        params.customer = Some(customer);
        params.mode = Some(CheckoutSessionMode::Subscription);
        params.success_url = Some(&success_url);
        params.cancel_url = Some(&cancel_url);
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(price_id.to_string()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(metadata.clone());
        if trial_days > 0 {
            params.subscription_data = Some(stripe::CreateCheckoutSessionSubscriptionData {
                trial_period_days: Some(trial_days),
                metadata: Some(metadata),
                ..Default::default()
            });
        } else {
            params.subscription_data = Some(stripe::CreateCheckoutSessionSubscriptionData {
                metadata: Some(metadata),
                ..Default::default()
            });
        }

        let session = CheckoutSession::create(self.client.inner(), params).await?;

        let url = session.url.ok_or_else(|| {
            BillingError::Internal("Checkout session created without a URL".to_string())
        })?;

        tracing::info!(
            session_id = %session.id,
            price_id = %price_id,
            "Created checkout session"
        );

        Ok(GatewayCheckoutSession {
            session_id: session.id.to_string(),
            url,
        })
    }

    async fn retrieve_subscription(&self, external_id: &str) -> BillingResult<GatewaySubscription> {
        let sub_id: SubscriptionId = external_id
            .parse()
            .map_err(|_| BillingError::SubscriptionNotFound(external_id.to_string()))?;

        let sub =
            Subscription::retrieve(self.client.inner(), &sub_id, &["latest_invoice"]).await?;

        let first_item = sub.items.data.first();
        let paid_amount_cents = match &sub.latest_invoice {
            Some(stripe::Expandable::Object(invoice)) => invoice.amount_paid,
            _ => None,
        };

        Ok(GatewaySubscription {
            external_id: sub.id.to_string(),
            customer_id: Some(expandable_customer_id(&sub.customer)),
            status: sub.status.to_string(),
            cancel_at_period_end: sub.cancel_at_period_end,
            canceled_at: sub.canceled_at.and_then(from_epoch),
            ended_at: sub.ended_at.and_then(from_epoch),
            current_period_start: from_epoch(sub.current_period_start),
            current_period_end: from_epoch(sub.current_period_end),
            trial_start: sub.trial_start.and_then(from_epoch),
            trial_end: sub.trial_end.and_then(from_epoch),
            price_id: first_item
                .and_then(|i| i.price.as_ref())
                .map(|p| p.id.to_string()),
            item_id: first_item.map(|i| i.id.to_string()),
            paid_amount_cents,
            metadata: sub.metadata,
        })
    }

    fn verify_and_parse_event(
        &self,
        payload: &str,
        signature_header: &str,
    ) -> BillingResult<GatewayEvent> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        verify_signature(
            payload,
            signature_header,
            &self.client.config().webhook_secret,
            now,
        )?;
        parse_event_payload(payload)
    }
}

fn expandable_customer_id(customer: &stripe::Expandable<stripe::Customer>) -> String {
    match customer {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(c) => c.id.to_string(),
    }
}

fn from_epoch(ts: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts).ok()
}

// =============================================================================
// Signature verification
// =============================================================================

/// Verify a Stripe-style signature header (`t=<epoch>,v1=<hex hmac>`) over
/// the exact raw payload bytes.
///
/// Verification is done by hand rather than through async-stripe's
/// `Webhook::construct_event`, which couples verification to strict API
/// version parsing of the payload.
pub fn verify_signature(
    payload: &str,
    signature_header: &str,
    webhook_secret: &str,
    now_epoch: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in signature_header.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0].trim() {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::error!("Missing timestamp in signature header");
        BillingError::SignatureInvalid
    })?;

    let v1_signature = v1_signature.ok_or_else(|| {
        tracing::error!("Missing v1 signature in signature header");
        BillingError::SignatureInvalid
    })?;

    if (now_epoch - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::error!(
            timestamp = timestamp,
            now = now_epoch,
            diff = (now_epoch - timestamp).abs(),
            "Webhook timestamp outside tolerance window"
        );
        return Err(BillingError::SignatureInvalid);
    }

    // The configured secret carries a "whsec_" prefix over the raw key
    let secret_key = webhook_secret
        .strip_prefix("whsec_")
        .unwrap_or(webhook_secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).map_err(|_| {
        tracing::error!("Invalid webhook secret key");
        BillingError::SignatureInvalid
    })?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::error!("Webhook signature mismatch - rejecting payload");
        return Err(BillingError::SignatureInvalid);
    }

    Ok(())
}

// =============================================================================
// Payload parsing
// =============================================================================

/// An id field that may arrive as a bare string or an expanded object
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum WireExpandable {
    Id(String),
    Object { id: String },
}

impl WireExpandable {
    fn id(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Object { id } => id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: WireEventData,
}

#[derive(Debug, Deserialize)]
struct WireEventData {
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WireCheckoutSession {
    id: String,
    subscription: Option<WireExpandable>,
    customer: Option<WireExpandable>,
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct WireInvoice {
    id: String,
    subscription: Option<WireExpandable>,
    customer: Option<WireExpandable>,
    #[serde(default)]
    amount_paid: Option<i64>,
    #[serde(default)]
    lines: Option<WireInvoiceLines>,
}

#[derive(Debug, Deserialize)]
struct WireInvoiceLines {
    #[serde(default)]
    data: Vec<WireInvoiceLine>,
}

#[derive(Debug, Deserialize)]
struct WireInvoiceLine {
    period: Option<WirePeriod>,
}

#[derive(Debug, Deserialize)]
struct WirePeriod {
    start: Option<i64>,
    end: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireSubscription {
    id: String,
    customer: Option<WireExpandable>,
    status: String,
    #[serde(default)]
    cancel_at_period_end: bool,
    canceled_at: Option<i64>,
    ended_at: Option<i64>,
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
    trial_start: Option<i64>,
    trial_end: Option<i64>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl From<WireSubscription> for GatewaySubscription {
    fn from(w: WireSubscription) -> Self {
        GatewaySubscription {
            external_id: w.id,
            customer_id: w.customer.map(|c| c.id().to_string()),
            status: w.status,
            cancel_at_period_end: w.cancel_at_period_end,
            canceled_at: w.canceled_at.and_then(from_epoch),
            ended_at: w.ended_at.and_then(from_epoch),
            current_period_start: w.current_period_start.and_then(from_epoch),
            current_period_end: w.current_period_end.and_then(from_epoch),
            trial_start: w.trial_start.and_then(from_epoch),
            trial_end: w.trial_end.and_then(from_epoch),
            price_id: None,
            item_id: None,
            paid_amount_cents: None,
            metadata: w.metadata,
        }
    }
}

/// Parse a verified raw payload into a gateway-neutral event.
///
/// Unknown event types parse to `Unrecognized` rather than failing: the
/// ingress must acknowledge them so the gateway stops retrying.
pub fn parse_event_payload(payload: &str) -> BillingResult<GatewayEvent> {
    let wire: WireEvent = serde_json::from_str(payload).map_err(|e| {
        tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
        BillingError::UnsupportedEvent(format!("Malformed event payload: {}", e))
    })?;

    let created = from_epoch(wire.created).unwrap_or_else(OffsetDateTime::now_utc);

    let kind = match wire.event_type.as_str() {
        "checkout.session.completed" => {
            let session: WireCheckoutSession = parse_object(&wire.event_type, wire.data.object)?;
            GatewayEventKind::CheckoutCompleted(CheckoutCompletedData {
                session_id: session.id,
                subscription_id: session.subscription.map(|s| s.id().to_string()),
                customer_id: session.customer.map(|c| c.id().to_string()),
                metadata: session.metadata.unwrap_or_default(),
            })
        }
        "invoice.paid" => {
            let invoice: WireInvoice = parse_object(&wire.event_type, wire.data.object)?;
            let line_period = invoice
                .lines
                .as_ref()
                .and_then(|l| l.data.first())
                .and_then(|line| line.period.as_ref());
            GatewayEventKind::InvoicePaid(InvoicePaidData {
                invoice_id: invoice.id,
                subscription_id: invoice.subscription.map(|s| s.id().to_string()),
                customer_id: invoice.customer.map(|c| c.id().to_string()),
                amount_paid_cents: invoice.amount_paid.unwrap_or(0),
                period_start: line_period.and_then(|p| p.start).and_then(from_epoch),
                period_end: line_period.and_then(|p| p.end).and_then(from_epoch),
            })
        }
        "customer.subscription.updated" => {
            let sub: WireSubscription = parse_object(&wire.event_type, wire.data.object)?;
            GatewayEventKind::SubscriptionUpdated(sub.into())
        }
        "customer.subscription.deleted" => {
            let sub: WireSubscription = parse_object(&wire.event_type, wire.data.object)?;
            GatewayEventKind::SubscriptionDeleted(sub.into())
        }
        _ => GatewayEventKind::Unrecognized,
    };

    Ok(GatewayEvent {
        id: wire.id,
        event_type: wire.event_type,
        created,
        kind,
    })
}

fn parse_object<T: serde::de::DeserializeOwned>(
    event_type: &str,
    object: serde_json::Value,
) -> BillingResult<T> {
    serde_json::from_value(object).map_err(|e| {
        BillingError::UnsupportedEvent(format!(
            "Unexpected object shape for {}: {}",
            event_type, e
        ))
    })
}
