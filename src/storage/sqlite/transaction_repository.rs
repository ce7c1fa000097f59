//! Transaction write path (the materializer).
//!
//! Inserting a transaction also marks overlapping cached balance windows
//! dirty. The dirty update is best-effort: a miss or failure is logged and
//! never aborts the insert, while the insert itself participates fully in
//! the caller's transactional scope.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::warn;
use uuid::Uuid;

use crate::domain::error::{DomainError, DomainResult};
use crate::domain::models::money::OptionalAmount;

use super::{CategoryRepository, DbConnection};

/// Field set for a transaction about to be written. Identity and lineage
/// are assigned by the repository.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub effective_timestamp: DateTime<Utc>,
    pub category_id: i64,
    pub value: i64,
    pub value19: OptionalAmount,
    pub value7: OptionalAmount,
    pub vat19: OptionalAmount,
    pub vat7: OptionalAmount,
    pub note: Option<String>,
}

/// A transaction row as stored; category is still an id here.
#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub row_id: i64,
    pub uuid: Uuid,
    pub lineage_id: Uuid,
    pub created_by: Uuid,
    pub insert_timestamp: DateTime<Utc>,
    pub effective_timestamp: DateTime<Utc>,
    pub active: bool,
    pub category_id: i64,
    pub value: i64,
    pub value19: OptionalAmount,
    pub value7: OptionalAmount,
    pub vat19: OptionalAmount,
    pub vat7: OptionalAmount,
    pub note: Option<String>,
}

#[derive(Clone)]
pub struct TransactionRepository {
    db: DbConnection,
}

impl TransactionRepository {
    pub fn new(db: DbConnection) -> Self {
        Self { db }
    }

    /// Insert a new transaction with a fresh lineage, returning its uuid.
    ///
    /// Rejects zero-value transactions and categories the organization
    /// does not own. Splits persist as NULL if and only if absent.
    pub async fn insert(
        &self,
        conn: &mut sqlx::SqliteConnection,
        organization_id: Uuid,
        created_by: Uuid,
        transaction: &NewTransaction,
    ) -> DomainResult<Uuid> {
        if transaction.value == 0 {
            return Err(DomainError::Validation(
                "invalid amount for transaction: 0".to_string(),
            ));
        }
        if !CategoryRepository::exists(conn, organization_id, transaction.category_id).await? {
            return Err(DomainError::Validation(format!(
                "invalid category id: {}",
                transaction.category_id
            )));
        }

        let uuid = Uuid::new_v4();
        let lineage_id = Uuid::new_v4();
        self.insert_row(conn, organization_id, created_by, uuid, lineage_id, transaction)
            .await?;

        sqlx::query("INSERT INTO transaction_heads (lineage_id, transaction_uuid) VALUES (?, ?)")
            .bind(lineage_id.to_string())
            .bind(uuid.to_string())
            .execute(&mut *conn)
            .await?;

        self.mark_balances_dirty(conn, organization_id, transaction.effective_timestamp)
            .await;

        Ok(uuid)
    }

    /// Replace `previous` with a new version carrying `fields`: insert a
    /// row under the same lineage, deactivate the old row and repoint the
    /// lineage head. Returns the new version's uuid.
    pub async fn supersede(
        &self,
        conn: &mut sqlx::SqliteConnection,
        organization_id: Uuid,
        created_by: Uuid,
        previous: &TransactionRecord,
        fields: &NewTransaction,
    ) -> DomainResult<Uuid> {
        if fields.value == 0 {
            return Err(DomainError::Validation(
                "invalid amount for transaction: 0".to_string(),
            ));
        }

        let uuid = Uuid::new_v4();
        self.insert_row(conn, organization_id, created_by, uuid, previous.lineage_id, fields)
            .await?;

        let deactivated = sqlx::query(
            "UPDATE transactions SET active = 0 WHERE uuid = ? AND organization_id = ?",
        )
        .bind(previous.uuid.to_string())
        .bind(organization_id.to_string())
        .execute(&mut *conn)
        .await?;
        if deactivated.rows_affected() != 1 {
            return Err(DomainError::Conflict(format!(
                "could not deactivate superseded transaction {}",
                previous.uuid
            )));
        }

        let repointed = sqlx::query(
            "UPDATE transaction_heads SET transaction_uuid = ? WHERE lineage_id = ?",
        )
        .bind(uuid.to_string())
        .bind(previous.lineage_id.to_string())
        .execute(&mut *conn)
        .await?;
        if repointed.rows_affected() != 1 {
            return Err(DomainError::Conflict(format!(
                "missing head pointer for transaction lineage {}",
                previous.lineage_id
            )));
        }

        self.mark_balances_dirty(conn, organization_id, fields.effective_timestamp)
            .await;

        Ok(uuid)
    }

    async fn insert_row(
        &self,
        conn: &mut sqlx::SqliteConnection,
        organization_id: Uuid,
        created_by: Uuid,
        uuid: Uuid,
        lineage_id: Uuid,
        transaction: &NewTransaction,
    ) -> DomainResult<()> {
        sqlx::query(
            r#"
            INSERT INTO transactions (
                uuid, lineage_id, organization_id, insert_timestamp, created_by,
                effective_timestamp, active, category_id,
                value, value19, value7, vat19, vat7, note
            ) VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(uuid.to_string())
        .bind(lineage_id.to_string())
        .bind(organization_id.to_string())
        .bind(Utc::now())
        .bind(created_by.to_string())
        .bind(transaction.effective_timestamp)
        .bind(transaction.category_id)
        .bind(transaction.value)
        .bind(transaction.value19.get())
        .bind(transaction.value7.get())
        .bind(transaction.vat19.get())
        .bind(transaction.vat7.get())
        .bind(transaction.note.as_deref())
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Flag cached balance windows covering `effective` for recomputation.
    /// Best-effort: staleness is recoverable, so failures are logged and
    /// swallowed; double-booking is not, so the caller's insert stands.
    async fn mark_balances_dirty(
        &self,
        conn: &mut sqlx::SqliteConnection,
        organization_id: Uuid,
        effective: DateTime<Utc>,
    ) {
        let result = sqlx::query(
            r#"
            UPDATE balance_windows SET dirty = 1
            WHERE organization_id = ? AND dirty = 0
              AND effective_from <= ? AND effective_to > ?
            "#,
        )
        .bind(organization_id.to_string())
        .bind(effective)
        .bind(effective)
        .execute(conn)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => {
                warn!(%organization_id, %effective, "no cached balance window to mark dirty");
            }
            Ok(_) => {}
            Err(err) => {
                warn!(%organization_id, error = %err, "could not mark balances dirty");
            }
        }
    }

    pub async fn fetch_by_uuid(
        &self,
        organization_id: Uuid,
        uuid: Uuid,
    ) -> DomainResult<Option<TransactionRecord>> {
        let row = sqlx::query("SELECT * FROM transactions WHERE uuid = ? AND organization_id = ?")
            .bind(uuid.to_string())
            .bind(organization_id.to_string())
            .fetch_optional(self.db.pool())
            .await?;

        row.map(|r| row_to_record(&r)).transpose()
    }

    /// All booked occurrences of one definition lineage that are still in
    /// the future. The Booker and the Prebook Manager both consult this
    /// set before materializing anything.
    pub async fn fetch_future_linked(
        conn: &mut sqlx::SqliteConnection,
        organization_id: Uuid,
        recurring_lineage: Uuid,
        now: DateTime<Utc>,
    ) -> DomainResult<Vec<TransactionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT t.* FROM transactions t
            INNER JOIN recurring_booked b ON b.transaction_uuid = t.uuid
            WHERE b.recurring_lineage = ?
              AND t.organization_id = ?
              AND t.effective_timestamp > ?
            ORDER BY t.effective_timestamp ASC
            "#,
        )
        .bind(recurring_lineage.to_string())
        .bind(organization_id.to_string())
        .bind(now)
        .fetch_all(conn)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    /// Deactivate transactions booked from a definition lineage: all of
    /// them when cascading, only future-dated ones otherwise. Returns the
    /// number of rows deactivated.
    pub async fn deactivate_linked(
        conn: &mut sqlx::SqliteConnection,
        organization_id: Uuid,
        recurring_lineage: Uuid,
        cascade: bool,
        now: DateTime<Utc>,
    ) -> DomainResult<u64> {
        let mut sql = String::from(
            r#"
            UPDATE transactions SET active = 0
            WHERE organization_id = ?
              AND uuid IN (SELECT transaction_uuid FROM recurring_booked WHERE recurring_lineage = ?)
            "#,
        );
        if !cascade {
            sql.push_str(" AND effective_timestamp > ?");
        }

        let mut query = sqlx::query(&sql)
            .bind(organization_id.to_string())
            .bind(recurring_lineage.to_string());
        if !cascade {
            query = query.bind(now);
        }

        let result = query.execute(conn).await?;
        Ok(result.rows_affected())
    }
}

fn row_to_record(row: &SqliteRow) -> DomainResult<TransactionRecord> {
    Ok(TransactionRecord {
        row_id: row.get("row_id"),
        uuid: parse_uuid(row, "uuid")?,
        lineage_id: parse_uuid(row, "lineage_id")?,
        created_by: parse_uuid(row, "created_by")?,
        insert_timestamp: row.get("insert_timestamp"),
        effective_timestamp: row.get("effective_timestamp"),
        active: row.get::<i64, _>("active") != 0,
        category_id: row.get("category_id"),
        value: row.get("value"),
        value19: row.get::<Option<i64>, _>("value19").into(),
        value7: row.get::<Option<i64>, _>("value7").into(),
        vat19: row.get::<Option<i64>, _>("vat19").into(),
        vat7: row.get::<Option<i64>, _>("vat7").into(),
        note: row.get("note"),
    })
}

pub(super) fn parse_uuid(row: &SqliteRow, column: &str) -> DomainResult<Uuid> {
    let text: String = row.get(column);
    Uuid::parse_str(&text).map_err(|err| {
        DomainError::Conflict(format!("corrupt uuid in column {}: {}", column, err))
    })
}
