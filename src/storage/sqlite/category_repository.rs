//! Category rows, scoped per organization.

use sqlx::Row;
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::error::DomainResult;

use super::DbConnection;

#[derive(Clone)]
pub struct CategoryRepository {
    db: DbConnection,
}

impl CategoryRepository {
    pub fn new(db: DbConnection) -> Self {
        Self { db }
    }

    pub async fn insert(&self, organization_id: Uuid, name: &str) -> DomainResult<i64> {
        let result = sqlx::query("INSERT INTO categories (organization_id, name) VALUES (?, ?)")
            .bind(organization_id.to_string())
            .bind(name)
            .execute(self.db.pool())
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn list(&self, organization_id: Uuid) -> DomainResult<HashMap<i64, String>> {
        let rows = sqlx::query("SELECT id, name FROM categories WHERE organization_id = ?")
            .bind(organization_id.to_string())
            .fetch_all(self.db.pool())
            .await?;

        let mut categories = HashMap::with_capacity(rows.len());
        for row in &rows {
            categories.insert(row.get::<i64, _>("id"), row.get::<String, _>("name"));
        }
        Ok(categories)
    }

    /// Check that a category id belongs to the organization. Runs inside
    /// the caller's transactional scope.
    pub async fn exists(
        conn: &mut sqlx::SqliteConnection,
        organization_id: Uuid,
        category_id: i64,
    ) -> DomainResult<bool> {
        let row = sqlx::query("SELECT 1 FROM categories WHERE id = ? AND organization_id = ?")
            .bind(category_id)
            .bind(organization_id.to_string())
            .fetch_optional(conn)
            .await?;
        Ok(row.is_some())
    }
}
