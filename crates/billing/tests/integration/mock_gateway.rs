//! Mock payment gateway for integration tests

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use vitrine_billing::{
    gateway::{parse_event_payload, verify_signature},
    BillingResult, GatewayCheckoutSession, GatewayCustomer, GatewayEvent, GatewaySubscription,
    PaymentGateway,
};
use vitrine_shared::GatewayKind;

pub const TEST_WEBHOOK_SECRET: &str = "whsec_integration_test_secret";

/// In-memory gateway that returns scripted responses
#[derive(Clone)]
pub struct MockGateway {
    state: Arc<Mutex<MockState>>,
}

struct MockState {
    /// Scripted responses for retrieve_subscription, keyed by external id
    subscriptions: HashMap<String, GatewaySubscription>,
    customers_created: u32,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                subscriptions: HashMap::new(),
                customers_created: 0,
            })),
        }
    }

    /// Script what the gateway reports for a subscription id
    pub fn set_subscription(&self, sub: GatewaySubscription) {
        let mut state = self.state.lock().unwrap();
        state.subscriptions.insert(sub.external_id.clone(), sub);
    }

    pub fn customers_created(&self) -> u32 {
        self.state.lock().unwrap().customers_created
    }
}

impl PaymentGateway for MockGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::Stripe
    }

    async fn create_customer(
        &self,
        email: &str,
        _name: &str,
        _metadata: HashMap<String, String>,
    ) -> BillingResult<GatewayCustomer> {
        let mut state = self.state.lock().unwrap();
        state.customers_created += 1;
        Ok(GatewayCustomer {
            external_id: format!("cus_mock_{}", uuid::Uuid::new_v4().simple()),
            email: email.to_string(),
        })
    }

    async fn create_checkout_session(
        &self,
        _customer_id: &str,
        _price_id: &str,
        _trial_days: u32,
        _metadata: HashMap<String, String>,
    ) -> BillingResult<GatewayCheckoutSession> {
        let session_id = format!("cs_mock_{}", uuid::Uuid::new_v4().simple());
        Ok(GatewayCheckoutSession {
            url: format!("https://checkout.test/{}", session_id),
            session_id,
        })
    }

    async fn retrieve_subscription(&self, external_id: &str) -> BillingResult<GatewaySubscription> {
        let state = self.state.lock().unwrap();
        state
            .subscriptions
            .get(external_id)
            .cloned()
            .ok_or_else(|| {
                vitrine_billing::BillingError::SubscriptionNotFound(external_id.to_string())
            })
    }

    fn verify_and_parse_event(
        &self,
        payload: &str,
        signature_header: &str,
    ) -> BillingResult<GatewayEvent> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        verify_signature(payload, signature_header, TEST_WEBHOOK_SECRET, now)?;
        parse_event_payload(payload)
    }
}

/// Sign a payload the way the gateway would
pub fn sign_payload(payload: &str) -> String {
    use hmac::Mac;
    let key = TEST_WEBHOOK_SECRET
        .strip_prefix("whsec_")
        .unwrap_or(TEST_WEBHOOK_SECRET);
    let timestamp = time::OffsetDateTime::now_utc().unix_timestamp();
    let mut mac = hmac::Hmac::<sha2::Sha256>::new_from_slice(key.as_bytes()).unwrap();
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    )
}
