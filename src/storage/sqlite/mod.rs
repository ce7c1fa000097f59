//! SQLite storage backend.
//!
//! `DbConnection` wraps a shared connection pool and owns schema setup.
//! Repositories are cheap handles cloned from it; operations that must
//! participate in a caller's transactional scope take a
//! `&mut sqlx::SqliteConnection` instead of going through the pool.

use anyhow::Result;
use sqlx::{migrate::MigrateDatabase, Sqlite, SqlitePool};
use std::sync::Arc;

mod balance_repository;
mod category_repository;
mod recurring_repository;
mod transaction_repository;

pub use balance_repository::BalanceRepository;
pub use category_repository::CategoryRepository;
pub use recurring_repository::{NewRecurringVersion, RecurringRepository, StoredRecurring};
pub use transaction_repository::{NewTransaction, TransactionRecord, TransactionRepository};

/// DbConnection manages database access for all repositories.
#[derive(Clone)]
pub struct DbConnection {
    pool: Arc<SqlitePool>,
}

impl DbConnection {
    /// Create a new database connection, creating the database and schema
    /// if they do not exist yet.
    pub async fn new(url: &str) -> Result<Self> {
        if !Sqlite::database_exists(url).await.unwrap_or(false) {
            Sqlite::create_database(url).await?
        }

        let pool = SqlitePool::connect(url).await?;

        Self::setup_schema(&pool).await?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Initialize a test database with a unique name
    #[cfg(test)]
    pub async fn init_test() -> Result<Self> {
        let test_id = uuid::Uuid::new_v4().to_string();
        let db_url = format!("file:memdb_{}?mode=memory&cache=shared", test_id);

        Self::new(&db_url).await
    }

    /// Set up the required database schema
    async fn setup_schema(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS categories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                organization_id TEXT NOT NULL,
                name TEXT NOT NULL,
                UNIQUE (organization_id, name)
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                row_id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL UNIQUE,
                lineage_id TEXT NOT NULL,
                organization_id TEXT NOT NULL,
                insert_timestamp TEXT NOT NULL,
                created_by TEXT NOT NULL,
                effective_timestamp TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                category_id INTEGER NOT NULL,
                value INTEGER NOT NULL,
                value19 INTEGER,
                value7 INTEGER,
                vat19 INTEGER,
                vat7 INTEGER,
                note TEXT
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transactions_org_effective
                ON transactions (organization_id, effective_timestamp);
            "#,
        )
        .execute(pool)
        .await?;

        // Head pointer per lineage: "current version" is a single lookup,
        // not a walk over self-referential version links.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transaction_heads (
                lineage_id TEXT PRIMARY KEY,
                transaction_uuid TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS recurring_transactions (
                row_id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL UNIQUE,
                lineage_id TEXT NOT NULL,
                organization_id TEXT NOT NULL,
                insert_timestamp TEXT NOT NULL,
                created_by TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                timezone TEXT NOT NULL,
                execution_policy INTEGER NOT NULL,
                execution_policy_data TEXT NOT NULL DEFAULT '{}',
                first_execution TEXT NOT NULL,
                next_execution TEXT NOT NULL,
                last_execution TEXT,
                category_id INTEGER NOT NULL,
                value INTEGER NOT NULL,
                value19 INTEGER,
                value7 INTEGER,
                vat19 INTEGER,
                vat7 INTEGER,
                note TEXT
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS recurring_heads (
                lineage_id TEXT PRIMARY KEY,
                recurring_uuid TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        // One row per materialized occurrence. The unique index is the hard
        // backstop for the "same instant never linked twice" invariant.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS recurring_booked (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recurring_lineage TEXT NOT NULL,
                transaction_uuid TEXT NOT NULL,
                effective_timestamp TEXT NOT NULL,
                insert_timestamp TEXT NOT NULL,
                UNIQUE (recurring_lineage, effective_timestamp)
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS balance_windows (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                organization_id TEXT NOT NULL,
                insert_timestamp TEXT NOT NULL,
                effective_from TEXT NOT NULL,
                effective_to TEXT NOT NULL,
                value INTEGER NOT NULL DEFAULT 0,
                dirty INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Get the underlying SQLite pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
