//! Application state

use std::sync::Arc;

use inkwell_billing::BillingService;
use sqlx::PgPool;

use crate::{auth::JwtManager, config::Config};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub billing: Arc<BillingService>,
    pub config: Config,
    pub jwt_manager: JwtManager,
    /// Absent in dev mode; invariant checks need it
    pub pool: Option<PgPool>,
}

impl AppState {
    pub fn new(billing: BillingService, config: Config, pool: Option<PgPool>) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret);
        Self {
            billing: Arc::new(billing),
            config,
            jwt_manager,
            pool,
        }
    }
}
