//! Recurring definition rows, lineage head pointers and booked links.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::domain::error::{DomainError, DomainResult};
use crate::domain::execution_policy::ExecutionPolicy;
use crate::domain::models::money::OptionalAmount;

use super::transaction_repository::parse_uuid;
use super::DbConnection;

/// A recurring definition row as stored; timezone is the raw IANA name and
/// the category is still an id.
#[derive(Debug, Clone)]
pub struct StoredRecurring {
    pub row_id: i64,
    pub uuid: Uuid,
    pub lineage_id: Uuid,
    pub active: bool,
    pub insert_timestamp: DateTime<Utc>,
    pub created_by: Uuid,
    pub timezone: String,
    pub execution_policy: ExecutionPolicy,
    pub execution_policy_data: serde_json::Value,
    pub first_execution: DateTime<Utc>,
    pub next_execution: DateTime<Utc>,
    pub last_execution: Option<DateTime<Utc>>,
    pub category_id: i64,
    pub value: i64,
    pub value19: OptionalAmount,
    pub value7: OptionalAmount,
    pub vat19: OptionalAmount,
    pub vat7: OptionalAmount,
    pub note: Option<String>,
}

/// Field set for a definition version about to be written.
#[derive(Debug, Clone)]
pub struct NewRecurringVersion {
    pub uuid: Uuid,
    pub lineage_id: Uuid,
    pub timezone: String,
    pub execution_policy: ExecutionPolicy,
    pub execution_policy_data: serde_json::Value,
    pub first_execution: DateTime<Utc>,
    pub next_execution: DateTime<Utc>,
    pub last_execution: Option<DateTime<Utc>>,
    pub category_id: i64,
    pub value: i64,
    pub value19: OptionalAmount,
    pub value7: OptionalAmount,
    pub vat19: OptionalAmount,
    pub vat7: OptionalAmount,
    pub note: Option<String>,
}

#[derive(Clone)]
pub struct RecurringRepository {
    db: DbConnection,
}

impl RecurringRepository {
    pub fn new(db: DbConnection) -> Self {
        Self { db }
    }

    pub async fn insert_version(
        &self,
        conn: &mut sqlx::SqliteConnection,
        organization_id: Uuid,
        created_by: Uuid,
        version: &NewRecurringVersion,
    ) -> DomainResult<i64> {
        let data = serde_json::to_string(&version.execution_policy_data)
            .map_err(|err| DomainError::Validation(format!("invalid policy data: {}", err)))?;

        let result = sqlx::query(
            r#"
            INSERT INTO recurring_transactions (
                uuid, lineage_id, organization_id, insert_timestamp, created_by, active,
                timezone, execution_policy, execution_policy_data,
                first_execution, next_execution, last_execution, category_id,
                value, value19, value7, vat19, vat7, note
            ) VALUES (?, ?, ?, ?, ?, 1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(version.uuid.to_string())
        .bind(version.lineage_id.to_string())
        .bind(organization_id.to_string())
        .bind(Utc::now())
        .bind(created_by.to_string())
        .bind(&version.timezone)
        .bind(version.execution_policy.repr())
        .bind(data)
        .bind(version.first_execution)
        .bind(version.next_execution)
        .bind(version.last_execution)
        .bind(version.category_id)
        .bind(version.value)
        .bind(version.value19.get())
        .bind(version.value7.get())
        .bind(version.vat19.get())
        .bind(version.vat7.get())
        .bind(version.note.as_deref())
        .execute(conn)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn insert_head(
        &self,
        conn: &mut sqlx::SqliteConnection,
        lineage_id: Uuid,
        recurring_uuid: Uuid,
    ) -> DomainResult<()> {
        sqlx::query("INSERT INTO recurring_heads (lineage_id, recurring_uuid) VALUES (?, ?)")
            .bind(lineage_id.to_string())
            .bind(recurring_uuid.to_string())
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Swap the lineage head to a new version. Exactly one row must move.
    pub async fn repoint_head(
        &self,
        conn: &mut sqlx::SqliteConnection,
        lineage_id: Uuid,
        recurring_uuid: Uuid,
    ) -> DomainResult<()> {
        let result = sqlx::query("UPDATE recurring_heads SET recurring_uuid = ? WHERE lineage_id = ?")
            .bind(recurring_uuid.to_string())
            .bind(lineage_id.to_string())
            .execute(conn)
            .await?;
        if result.rows_affected() != 1 {
            return Err(DomainError::Conflict(format!(
                "missing head pointer for recurring lineage {}",
                lineage_id
            )));
        }
        Ok(())
    }

    pub async fn head_of(&self, lineage_id: Uuid) -> DomainResult<Option<Uuid>> {
        let row = sqlx::query("SELECT recurring_uuid FROM recurring_heads WHERE lineage_id = ?")
            .bind(lineage_id.to_string())
            .fetch_optional(self.db.pool())
            .await?;
        row.map(|r| parse_uuid(&r, "recurring_uuid")).transpose()
    }

    pub async fn fetch(
        &self,
        organization_id: Uuid,
        uuid: Uuid,
    ) -> DomainResult<Option<StoredRecurring>> {
        let row =
            sqlx::query("SELECT * FROM recurring_transactions WHERE uuid = ? AND organization_id = ?")
                .bind(uuid.to_string())
                .bind(organization_id.to_string())
                .fetch_optional(self.db.pool())
                .await?;
        row.map(|r| row_to_stored(&r)).transpose()
    }

    /// Re-read a definition inside an open transactional scope. Booking
    /// passes work on this snapshot, not on rows read before the scope
    /// began, so two passes cannot both advance from a stale cursor.
    pub async fn fetch_in_scope(
        conn: &mut sqlx::SqliteConnection,
        organization_id: Uuid,
        uuid: Uuid,
    ) -> DomainResult<Option<StoredRecurring>> {
        let row =
            sqlx::query("SELECT * FROM recurring_transactions WHERE uuid = ? AND organization_id = ?")
                .bind(uuid.to_string())
                .bind(organization_id.to_string())
                .fetch_optional(conn)
                .await?;
        row.map(|r| row_to_stored(&r)).transpose()
    }

    /// All definitions of the organization, active versions first, newest
    /// first within each group.
    pub async fn list(&self, organization_id: Uuid) -> DomainResult<Vec<StoredRecurring>> {
        let rows = sqlx::query(
            "SELECT * FROM recurring_transactions WHERE organization_id = ? ORDER BY active DESC, row_id DESC",
        )
        .bind(organization_id.to_string())
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(row_to_stored).collect()
    }

    /// Active definitions only; the set a booking pass visits.
    pub async fn list_active(&self, organization_id: Uuid) -> DomainResult<Vec<StoredRecurring>> {
        let rows = sqlx::query(
            "SELECT * FROM recurring_transactions WHERE organization_id = ? AND active = 1 ORDER BY row_id ASC",
        )
        .bind(organization_id.to_string())
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(row_to_stored).collect()
    }

    /// Persist the advanced cursor, recording the catch-up point even when
    /// nothing was materialized.
    pub async fn update_cursor(
        &self,
        conn: &mut sqlx::SqliteConnection,
        organization_id: Uuid,
        uuid: Uuid,
        next_execution: DateTime<Utc>,
    ) -> DomainResult<()> {
        sqlx::query(
            "UPDATE recurring_transactions SET next_execution = ? WHERE uuid = ? AND organization_id = ?",
        )
        .bind(next_execution)
        .bind(uuid.to_string())
        .bind(organization_id.to_string())
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Deactivate one definition version. Returns the number of rows
    /// touched so callers can detect a vanished version.
    pub async fn set_inactive(
        &self,
        conn: &mut sqlx::SqliteConnection,
        organization_id: Uuid,
        uuid: Uuid,
    ) -> DomainResult<u64> {
        let result = sqlx::query(
            "UPDATE recurring_transactions SET active = 0 WHERE uuid = ? AND organization_id = ?",
        )
        .bind(uuid.to_string())
        .bind(organization_id.to_string())
        .execute(conn)
        .await?;
        Ok(result.rows_affected())
    }

    /// Record that an occurrence instant of this lineage was materialized.
    /// The unique index rejects a second link for the same instant.
    pub async fn insert_link(
        &self,
        conn: &mut sqlx::SqliteConnection,
        recurring_lineage: Uuid,
        transaction_uuid: Uuid,
        effective_timestamp: DateTime<Utc>,
    ) -> DomainResult<()> {
        sqlx::query(
            r#"
            INSERT INTO recurring_booked (recurring_lineage, transaction_uuid, effective_timestamp, insert_timestamp)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(recurring_lineage.to_string())
        .bind(transaction_uuid.to_string())
        .bind(effective_timestamp)
        .bind(Utc::now())
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Occurrence instants of this lineage that are already materialized
    /// and still in the future relative to `now`.
    pub async fn future_instants(
        conn: &mut sqlx::SqliteConnection,
        recurring_lineage: Uuid,
        now: DateTime<Utc>,
    ) -> DomainResult<Vec<DateTime<Utc>>> {
        let rows = sqlx::query(
            "SELECT effective_timestamp FROM recurring_booked WHERE recurring_lineage = ? AND effective_timestamp > ?",
        )
        .bind(recurring_lineage.to_string())
        .bind(now)
        .fetch_all(conn)
        .await?;
        Ok(rows
            .iter()
            .map(|row| row.get::<DateTime<Utc>, _>("effective_timestamp"))
            .collect())
    }

    /// Repoint a booked link after the linked transaction was superseded.
    pub async fn repoint_link(
        &self,
        conn: &mut sqlx::SqliteConnection,
        old_transaction_uuid: Uuid,
        new_transaction_uuid: Uuid,
    ) -> DomainResult<u64> {
        let result =
            sqlx::query("UPDATE recurring_booked SET transaction_uuid = ? WHERE transaction_uuid = ?")
                .bind(new_transaction_uuid.to_string())
                .bind(old_transaction_uuid.to_string())
                .execute(conn)
                .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_stored(row: &SqliteRow) -> DomainResult<StoredRecurring> {
    let policy_repr: i64 = row.get("execution_policy");
    let execution_policy = ExecutionPolicy::from_repr(policy_repr).ok_or_else(|| {
        DomainError::Conflict(format!("unknown execution policy {}", policy_repr))
    })?;

    let data_text: String = row.get("execution_policy_data");
    let execution_policy_data = serde_json::from_str(&data_text)
        .map_err(|err| DomainError::Conflict(format!("corrupt execution policy data: {}", err)))?;

    Ok(StoredRecurring {
        row_id: row.get("row_id"),
        uuid: parse_uuid(row, "uuid")?,
        lineage_id: parse_uuid(row, "lineage_id")?,
        active: row.get::<i64, _>("active") != 0,
        insert_timestamp: row.get("insert_timestamp"),
        created_by: parse_uuid(row, "created_by")?,
        timezone: row.get("timezone"),
        execution_policy,
        execution_policy_data,
        first_execution: row.get("first_execution"),
        next_execution: row.get("next_execution"),
        last_execution: row.get("last_execution"),
        category_id: row.get("category_id"),
        value: row.get("value"),
        value19: row.get::<Option<i64>, _>("value19").into(),
        value7: row.get::<Option<i64>, _>("value7").into(),
        vat19: row.get::<Option<i64>, _>("vat19").into(),
        vat7: row.get::<Option<i64>, _>("vat7").into(),
        note: row.get("note"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn version(category_id: i64) -> NewRecurringVersion {
        NewRecurringVersion {
            uuid: Uuid::new_v4(),
            lineage_id: Uuid::new_v4(),
            timezone: "Europe/Berlin".to_string(),
            execution_policy: ExecutionPolicy::StartOfMonth,
            execution_policy_data: serde_json::json!({}),
            first_execution: Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap(),
            next_execution: Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap(),
            last_execution: None,
            category_id,
            value: -95000,
            value19: OptionalAmount::ABSENT,
            value7: OptionalAmount::ABSENT,
            vat19: OptionalAmount::ABSENT,
            vat7: OptionalAmount::ABSENT,
            note: Some("rent".to_string()),
        }
    }

    async fn setup_test() -> (DbConnection, RecurringRepository, Uuid, i64) {
        let db = DbConnection::init_test().await.expect("test db");
        let repository = RecurringRepository::new(db.clone());
        let org = Uuid::new_v4();
        let category_id = super::super::CategoryRepository::new(db.clone())
            .insert(org, "rent")
            .await
            .expect("category");
        (db, repository, org, category_id)
    }

    #[tokio::test]
    async fn test_insert_and_fetch_round_trip() {
        let (db, repository, org, category_id) = setup_test().await;
        let new = version(category_id);

        let mut tx = db.pool().begin().await.expect("begin");
        repository
            .insert_version(&mut tx, org, Uuid::new_v4(), &new)
            .await
            .expect("insert");
        repository
            .insert_head(&mut tx, new.lineage_id, new.uuid)
            .await
            .expect("head");
        tx.commit().await.expect("commit");

        let stored = repository
            .fetch(org, new.uuid)
            .await
            .expect("fetch")
            .expect("present");
        assert_eq!(stored.uuid, new.uuid);
        assert_eq!(stored.lineage_id, new.lineage_id);
        assert!(stored.active);
        assert_eq!(stored.timezone, "Europe/Berlin");
        assert_eq!(stored.execution_policy, ExecutionPolicy::StartOfMonth);
        assert_eq!(stored.next_execution, new.next_execution);
        assert_eq!(stored.last_execution, None);
        assert!(stored.value19.is_absent());
        assert_eq!(stored.note.as_deref(), Some("rent"));

        let head = repository.head_of(new.lineage_id).await.expect("head");
        assert_eq!(head, Some(new.uuid));
    }

    #[tokio::test]
    async fn test_duplicate_instant_link_is_rejected() {
        let (db, repository, _, _) = setup_test().await;
        let lineage = Uuid::new_v4();
        let instant = Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap();

        let mut tx = db.pool().begin().await.expect("begin");
        repository
            .insert_link(&mut tx, lineage, Uuid::new_v4(), instant)
            .await
            .expect("first link");
        let duplicate = repository
            .insert_link(&mut tx, lineage, Uuid::new_v4(), instant)
            .await;
        assert!(duplicate.is_err());
    }

    #[tokio::test]
    async fn test_future_instants_filters_by_now() {
        let (db, repository, _, _) = setup_test().await;
        let lineage = Uuid::new_v4();
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap();
        let past = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let future = Utc.with_ymd_and_hms(2024, 4, 1, 9, 0, 0).unwrap();

        let mut tx = db.pool().begin().await.expect("begin");
        repository
            .insert_link(&mut tx, lineage, Uuid::new_v4(), past)
            .await
            .expect("link");
        repository
            .insert_link(&mut tx, lineage, Uuid::new_v4(), future)
            .await
            .expect("link");
        tx.commit().await.expect("commit");

        let mut conn = db.pool().acquire().await.expect("acquire");
        let instants = RecurringRepository::future_instants(&mut conn, lineage, now)
            .await
            .expect("instants");
        assert_eq!(instants, vec![future]);
    }

    #[tokio::test]
    async fn test_list_orders_active_first() {
        let (db, repository, org, category_id) = setup_test().await;
        let first = version(category_id);
        let second = version(category_id);

        let mut tx = db.pool().begin().await.expect("begin");
        repository
            .insert_version(&mut tx, org, Uuid::new_v4(), &first)
            .await
            .expect("insert");
        repository
            .insert_version(&mut tx, org, Uuid::new_v4(), &second)
            .await
            .expect("insert");
        repository
            .set_inactive(&mut tx, org, second.uuid)
            .await
            .expect("deactivate");
        tx.commit().await.expect("commit");

        let all = repository.list(org).await.expect("list");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].uuid, first.uuid);
        assert!(all[0].active);
        assert!(!all[1].active);

        let active = repository.list_active(org).await.expect("active");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].uuid, first.uuid);
    }
}
