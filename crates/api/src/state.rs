//! Application state

use sqlx::PgPool;
use std::sync::Arc;

use promptmeter_billing::BillingService;

use crate::completion::CompletionClient;
use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: Arc<BillingService>,
    pub completion: Arc<CompletionClient>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, completion: CompletionClient) -> Self {
        let billing = Arc::new(BillingService::new(
            pool.clone(),
            config.webhook_secret.clone(),
        ));
        tracing::info!("Billing service initialized");

        Self {
            pool,
            config,
            billing,
            completion: Arc::new(completion),
        }
    }
}
