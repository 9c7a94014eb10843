//! Billing error types

use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Plan not found or inactive: {0}")]
    PlanNotFound(String),

    #[error("Plan {0} has no price mapping for gateway {1}")]
    PlanNotConfigured(String, String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Gateway rejected request: {0}")]
    GatewayRejected(String),

    #[error("Webhook signature verification failed")]
    SignatureInvalid,

    #[error("Webhook event type not supported: {0}")]
    UnsupportedEvent(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether a caller may retry the failed operation unchanged.
    /// Only transient gateway faults qualify; 4xx rejections and local
    /// errors will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::GatewayUnavailable(_))
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        match &err {
            // 4xx: the request itself is wrong (bad price id, bad customer id).
            // Retrying without changing it cannot succeed.
            stripe::StripeError::Stripe(req) if req.http_status < 500 => {
                BillingError::GatewayRejected(err.to_string())
            }
            // 5xx and transport failures are transient.
            _ => BillingError::GatewayUnavailable(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
