//! Application state

use siteline_billing::BillingService;

use crate::{auth::JwtManager, config::Config};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub jwt_manager: JwtManager,
    pub billing: BillingService,
}

impl AppState {
    pub fn new(config: Config, billing: BillingService) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);
        Self {
            config,
            jwt_manager,
            billing,
        }
    }
}
