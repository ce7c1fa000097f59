//! Cached balance windows.
//!
//! The balance read path owns these rows; the engine only flags them for
//! recomputation. `invalidate_all` is the cascade-delete hook: idempotent,
//! organization-scoped, and it runs inside the caller's transactional scope.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::error::DomainResult;

use super::DbConnection;

#[derive(Clone)]
pub struct BalanceRepository {
    db: DbConnection,
}

impl BalanceRepository {
    pub fn new(db: DbConnection) -> Self {
        Self { db }
    }

    /// Seed a cached window. The read path normally writes these; the
    /// engine needs them only to exercise its dirty-marking contract.
    pub async fn insert_window(
        &self,
        organization_id: Uuid,
        effective_from: DateTime<Utc>,
        effective_to: DateTime<Utc>,
    ) -> DomainResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO balance_windows (organization_id, insert_timestamp, effective_from, effective_to)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(organization_id.to_string())
        .bind(Utc::now())
        .bind(effective_from)
        .bind(effective_to)
        .execute(self.db.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Force recomputation of every cached window of the organization.
    pub async fn invalidate_all(
        conn: &mut sqlx::SqliteConnection,
        organization_id: Uuid,
    ) -> DomainResult<u64> {
        let result = sqlx::query("UPDATE balance_windows SET dirty = 1 WHERE organization_id = ?")
            .bind(organization_id.to_string())
            .execute(conn)
            .await?;
        Ok(result.rows_affected())
    }
}
