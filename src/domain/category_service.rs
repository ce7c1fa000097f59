//! Category name/id resolution with an explicit per-organization cache.
//!
//! The cache is injected, not global: whoever wires the services decides
//! its lifetime. Entries are whole-organization snapshots and are dropped
//! on any category write for that organization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::info;
use uuid::Uuid;

use crate::storage::sqlite::{CategoryRepository, DbConnection};

use super::error::{DomainError, DomainResult};

/// Name rendered for a category id the organization no longer knows.
pub const UNKNOWN_CATEGORY: &str = "[ERROR]";

/// Shared cache of category snapshots, keyed by organization.
pub type CategoryCache = Arc<Mutex<HashMap<Uuid, Arc<HashMap<i64, String>>>>>;

pub fn new_cache() -> CategoryCache {
    Arc::new(Mutex::new(HashMap::new()))
}

#[derive(Clone)]
pub struct CategoryService {
    repository: CategoryRepository,
    cache: CategoryCache,
}

impl CategoryService {
    pub fn new(db: DbConnection, cache: CategoryCache) -> Self {
        Self {
            repository: CategoryRepository::new(db),
            cache,
        }
    }

    pub async fn create_category(&self, organization_id: Uuid, name: &str) -> DomainResult<i64> {
        if name.trim().is_empty() {
            return Err(DomainError::Validation(
                "category name must not be empty".to_string(),
            ));
        }

        let id = self.repository.insert(organization_id, name).await?;
        self.invalidate(organization_id);
        info!(%organization_id, category = name, id, "created category");
        Ok(id)
    }

    /// Snapshot of the organization's categories, id to name.
    pub async fn lookup(&self, organization_id: Uuid) -> DomainResult<Arc<HashMap<i64, String>>> {
        // Lock scopes stay synchronous; the cache is never held across an
        // await point.
        if let Some(hit) = self.locked().get(&organization_id).cloned() {
            return Ok(hit);
        }

        let fresh = Arc::new(self.repository.list(organization_id).await?);
        self.locked().insert(organization_id, fresh.clone());
        Ok(fresh)
    }

    /// Name to id, derived from the same snapshot as `lookup`.
    pub async fn reverse_lookup(&self, organization_id: Uuid) -> DomainResult<HashMap<String, i64>> {
        let snapshot = self.lookup(organization_id).await?;
        Ok(snapshot
            .iter()
            .map(|(id, name)| (name.clone(), *id))
            .collect())
    }

    fn invalidate(&self, organization_id: Uuid) {
        self.locked().remove(&organization_id);
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<HashMap<i64, String>>>> {
        // A poisoned lock only means another thread panicked mid-access;
        // the map itself is still usable.
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
