//! Application state

use std::sync::Arc;

use stacker_billing::BillingService;

use crate::{
    auth::UserTokenVerifier,
    config::{Config, ConfigError},
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub billing: Arc<BillingService>,
    pub config: Arc<Config>,
    pub user_tokens: Arc<UserTokenVerifier>,
}

impl AppState {
    pub fn new(billing: Arc<BillingService>, config: Config) -> Result<Self, ConfigError> {
        let user_tokens = UserTokenVerifier::new(&config.user_token_key, config.app_id.as_deref())?;
        Ok(Self {
            billing,
            config: Arc::new(config),
            user_tokens: Arc::new(user_tokens),
        })
    }
}
