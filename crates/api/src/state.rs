//! Shared application state

use sqlx::PgPool;

use vitrine_billing::BillingService;

use crate::auth::JwtManager;
use crate::config::Config;

/// State shared by every request handler
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: BillingService,
    pub jwt: JwtManager,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, billing: BillingService) -> Self {
        let jwt = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);
        Self {
            pool,
            config,
            billing,
            jwt,
        }
    }
}
