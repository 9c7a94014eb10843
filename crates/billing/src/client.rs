//! Stripe client configuration

use stripe::Client;

use crate::error::{BillingError, BillingResult};

/// Configuration for Stripe billing
///
/// Validated eagerly at construction: a process with a malformed secret key
/// or webhook secret must refuse to start rather than fail open on the first
/// webhook delivery.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Base URL for checkout success/cancel redirects
    pub app_base_url: String,
}

impl StripeConfig {
    /// Build a validated config
    pub fn new(
        secret_key: String,
        webhook_secret: String,
        app_base_url: String,
    ) -> BillingResult<Self> {
        if !secret_key.starts_with("sk_") && !secret_key.starts_with("rk_") {
            return Err(BillingError::Config(
                "STRIPE_SECRET_KEY must start with sk_ or rk_".to_string(),
            ));
        }
        if !webhook_secret.starts_with("whsec_") {
            return Err(BillingError::Config(
                "STRIPE_WEBHOOK_SECRET must start with whsec_".to_string(),
            ));
        }
        Ok(Self {
            secret_key,
            webhook_secret,
            app_base_url,
        })
    }

    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;
        let app_base_url = std::env::var("APP_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:3000".to_string());
        Self::new(secret_key, webhook_secret, app_base_url)
    }

    /// Checkout success redirect, with the session id templated in by Stripe
    pub fn success_url(&self) -> String {
        format!(
            "{}/payment/success?session_id={{CHECKOUT_SESSION_ID}}",
            self.app_base_url
        )
    }

    /// Checkout cancel redirect
    pub fn cancel_url(&self) -> String {
        format!("{}/payment/cancel", self.app_base_url)
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
