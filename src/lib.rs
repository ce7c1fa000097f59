//! Bookkeeping backend: the recurring-transaction booking engine.
//!
//! Wires the SQLite storage layer to the domain services. Callers embed
//! `Backend` in whatever outer surface they run (HTTP, desktop, jobs) and
//! drive booking passes per request; there is no background scheduler.

pub mod domain;
pub mod storage;

use anyhow::{Context, Result};
use uuid::Uuid;

use domain::category_service::{new_cache, CategoryService};
use domain::recurring_service::RecurringService;
use storage::sqlite::DbConnection;

/// Configuration read from the environment at startup.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// User recorded as creator on transactions the engine books itself.
    pub system_user_id: Uuid,
}

impl BackendConfig {
    pub fn from_env() -> Result<Self> {
        let raw = std::env::var("SYSTEM_USER_UUID").context("SYSTEM_USER_UUID is not set")?;
        let system_user_id = Uuid::parse_str(&raw)
            .with_context(|| format!("SYSTEM_USER_UUID is not a valid uuid: {}", raw))?;
        Ok(Self { system_user_id })
    }
}

pub struct Backend {
    pub recurring_service: RecurringService,
    pub category_service: CategoryService,
    pub db: DbConnection,
}

impl Backend {
    pub async fn new(database_url: &str, config: BackendConfig) -> Result<Self> {
        let db = DbConnection::new(database_url).await?;
        let category_service = CategoryService::new(db.clone(), new_cache());
        let recurring_service = RecurringService::new(
            db.clone(),
            category_service.clone(),
            config.system_user_id,
        );
        Ok(Self {
            recurring_service,
            category_service,
            db,
        })
    }
}
