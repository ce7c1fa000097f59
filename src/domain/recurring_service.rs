//! Recurring transaction engine: due booking, prebooking and versioning.
//!
//! Every mutation of one definition runs inside a single sqlx transaction.
//! The definition row is re-read inside that scope, so two concurrent
//! passes cannot both advance from a stale cursor; the unique
//! `(recurring_lineage, effective_timestamp)` index is the hard backstop
//! should they try anyway. A failed definition rolls back alone and never
//! aborts the rest of a booking pass.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::{error, info};
use uuid::Uuid;

use crate::storage::sqlite::{
    BalanceRepository, DbConnection, NewRecurringVersion, NewTransaction, RecurringRepository,
    StoredRecurring, TransactionRecord, TransactionRepository,
};

use super::category_service::{CategoryService, UNKNOWN_CATEGORY};
use super::commands::{
    CreateRecurringCommand, CreateRecurringResult, UpdateRecurringCommand, UpdateRecurringResult,
};
use super::error::{DomainError, DomainResult};
use super::models::money::OptionalAmount;
use super::models::recurring::{RecurringTransaction, MAX_NOTE_LENGTH};
use super::models::transaction::Transaction;

pub struct RecurringService {
    db: DbConnection,
    recurring_repository: RecurringRepository,
    transaction_repository: TransactionRepository,
    category_service: CategoryService,
    /// Creator recorded on transactions the engine materializes itself.
    system_user: Uuid,
}

impl RecurringService {
    pub fn new(db: DbConnection, category_service: CategoryService, system_user: Uuid) -> Self {
        Self {
            recurring_repository: RecurringRepository::new(db.clone()),
            transaction_repository: TransactionRepository::new(db.clone()),
            db,
            category_service,
            system_user,
        }
    }

    /// Create a definition and immediately run its booking pass, so overdue
    /// occurrences post and the preview window fills in the same request.
    pub async fn create_recurring(
        &self,
        organization_id: Uuid,
        created_by: Uuid,
        command: CreateRecurringCommand,
        preview_count: i64,
        now: DateTime<Utc>,
    ) -> DomainResult<CreateRecurringResult> {
        validate_payload(command.value, command.note.as_deref())?;
        parse_timezone(&command.timezone)?;
        let category_id = self
            .resolve_category(organization_id, &command.category)
            .await?;

        let uuid = Uuid::new_v4();
        let lineage_id = Uuid::new_v4();
        let version = NewRecurringVersion {
            uuid,
            lineage_id,
            timezone: command.timezone,
            execution_policy: command.execution_policy,
            execution_policy_data: command
                .execution_policy_data
                .unwrap_or_else(|| serde_json::json!({})),
            first_execution: command.first_execution,
            // The cursor starts at the anchor; the booking pass moves it.
            next_execution: command.first_execution,
            last_execution: command.last_execution,
            category_id,
            value: command.value,
            value19: command.value19,
            value7: command.value7,
            vat19: command.vat19,
            vat7: command.vat7,
            note: command.note,
        };

        let mut tx = self.db.pool().begin().await?;
        self.recurring_repository
            .insert_version(&mut tx, organization_id, created_by, &version)
            .await?;
        self.recurring_repository
            .insert_head(&mut tx, lineage_id, uuid)
            .await?;
        tx.commit().await?;

        let booked_transaction_ids = self
            .book_definition(organization_id, uuid, preview_count, now)
            .await?;

        info!(
            %organization_id,
            recurring = %uuid,
            booked = booked_transaction_ids.len(),
            "created recurring transaction"
        );

        let recurring = self.get_recurring(organization_id, uuid).await?;
        Ok(CreateRecurringResult {
            recurring,
            booked_transaction_ids,
        })
    }

    pub async fn get_recurring(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> DomainResult<RecurringTransaction> {
        let stored = self
            .recurring_repository
            .fetch(organization_id, id)
            .await?
            .ok_or(DomainError::NotFound("recurring transaction"))?;
        let categories = self.category_service.lookup(organization_id).await?;
        hydrate_recurring(stored, &categories)
    }

    /// All definition versions of the organization, active first.
    pub async fn list_recurring(
        &self,
        organization_id: Uuid,
    ) -> DomainResult<Vec<RecurringTransaction>> {
        let stored = self.recurring_repository.list(organization_id).await?;
        let categories = self.category_service.lookup(organization_id).await?;
        stored
            .into_iter()
            .map(|row| hydrate_recurring(row, &categories))
            .collect()
    }

    /// Booked occurrences of a definition that are still pending at `now`.
    pub async fn future_booked(
        &self,
        organization_id: Uuid,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> DomainResult<Vec<Transaction>> {
        let stored = self
            .recurring_repository
            .fetch(organization_id, id)
            .await?
            .ok_or(DomainError::NotFound("recurring transaction"))?;
        let categories = self.category_service.lookup(organization_id).await?;

        let mut conn = self.db.pool().acquire().await?;
        let records = TransactionRepository::fetch_future_linked(
            &mut conn,
            organization_id,
            stored.lineage_id,
            now,
        )
        .await?;
        Ok(records
            .into_iter()
            .map(|record| hydrate_transaction(record, &categories))
            .collect())
    }

    /// Catch up and top up every active definition of the organization.
    /// A failed definition is logged and skipped; the others still commit.
    pub async fn book_pending(
        &self,
        organization_id: Uuid,
        preview_count: i64,
        now: DateTime<Utc>,
    ) -> DomainResult<Vec<Uuid>> {
        let definitions = self.recurring_repository.list_active(organization_id).await?;
        let mut booked = Vec::new();
        for definition in definitions {
            match self
                .book_definition(organization_id, definition.uuid, preview_count, now)
                .await
            {
                Ok(ids) => booked.extend(ids),
                Err(err) => {
                    error!(
                        %organization_id,
                        recurring = %definition.uuid,
                        error = %err,
                        "booking pass failed for definition"
                    );
                }
            }
        }
        info!(%organization_id, booked = booked.len(), "booking pass finished");
        Ok(booked)
    }

    /// Standalone window top-up for one definition.
    pub async fn ensure_prebooked(
        &self,
        organization_id: Uuid,
        id: Uuid,
        preview_count: i64,
        now: DateTime<Utc>,
    ) -> DomainResult<Vec<Uuid>> {
        self.book_definition(organization_id, id, preview_count, now)
            .await
    }

    /// One full pass for one definition: due booking, then prebooking,
    /// sharing one cursor and one transactional scope.
    async fn book_definition(
        &self,
        organization_id: Uuid,
        id: Uuid,
        preview_count: i64,
        now: DateTime<Utc>,
    ) -> DomainResult<Vec<Uuid>> {
        let categories = self.category_service.lookup(organization_id).await?;

        let mut tx = self.db.pool().begin().await?;
        let stored = RecurringRepository::fetch_in_scope(&mut tx, organization_id, id)
            .await?
            .ok_or(DomainError::NotFound("recurring transaction"))?;
        if !stored.active {
            return Ok(Vec::new());
        }
        let mut recurring = hydrate_recurring(stored, &categories)?;

        // Instants already materialized ahead of time; both loops consult
        // and extend this set.
        let mut linked: HashSet<i64> =
            RecurringRepository::future_instants(&mut tx, recurring.lineage_id, now)
                .await?
                .into_iter()
                .map(|instant| instant.timestamp())
                .collect();
        let window = linked.len() as i64;

        let mut booked = self
            .book_due(&mut tx, organization_id, &mut recurring, &linked, now)
            .await?;
        self.recurring_repository
            .update_cursor(&mut tx, organization_id, id, recurring.next_execution)
            .await?;

        if recurring.active {
            let prebooked = self
                .prebook(
                    &mut tx,
                    organization_id,
                    &mut recurring,
                    &mut linked,
                    window,
                    preview_count,
                )
                .await?;
            booked.extend(prebooked);
            self.recurring_repository
                .update_cursor(&mut tx, organization_id, id, recurring.next_execution)
                .await?;
        }
        if !recurring.active {
            self.recurring_repository
                .set_inactive(&mut tx, organization_id, id)
                .await?;
        }

        tx.commit().await?;
        Ok(booked)
    }

    /// Materialize every occurrence that is due at `now`, skipping instants
    /// already booked ahead of time. The cursor advances on every
    /// iteration, skipped or not, so the loop always terminates.
    async fn book_due(
        &self,
        conn: &mut sqlx::SqliteConnection,
        organization_id: Uuid,
        recurring: &mut RecurringTransaction,
        linked: &HashSet<i64>,
        now: DateTime<Utc>,
    ) -> DomainResult<Vec<Uuid>> {
        let mut booked = Vec::new();
        while recurring.active && recurring.next_execution <= now {
            if !linked.contains(&recurring.next_execution.timestamp()) {
                let uuid = self.materialize(&mut *conn, organization_id, recurring).await?;
                booked.push(uuid);
            }
            recurring.advance_cursor();
            if recurring.cursor_past_bound() {
                recurring.active = false;
            }
        }
        Ok(booked)
    }

    /// Extend the preview window until `preview_count` future occurrences
    /// are materialized, or the last-execution bound cuts the series short.
    /// `window` is how many future-linked instants already exist.
    async fn prebook(
        &self,
        conn: &mut sqlx::SqliteConnection,
        organization_id: Uuid,
        recurring: &mut RecurringTransaction,
        linked: &mut HashSet<i64>,
        window: i64,
        preview_count: i64,
    ) -> DomainResult<Vec<Uuid>> {
        let mut booked = Vec::new();
        let mut window = window;
        while recurring.active && window < preview_count {
            let instant = recurring.next_execution.timestamp();
            if !linked.contains(&instant) {
                let uuid = self.materialize(&mut *conn, organization_id, recurring).await?;
                booked.push(uuid);
                linked.insert(instant);
                window += 1;
            }
            recurring.advance_cursor();
            if recurring.cursor_past_bound() {
                recurring.active = false;
            }
        }
        Ok(booked)
    }

    /// One occurrence becomes one transaction plus one booked link, at the
    /// definition's current cursor instant.
    async fn materialize(
        &self,
        conn: &mut sqlx::SqliteConnection,
        organization_id: Uuid,
        recurring: &RecurringTransaction,
    ) -> DomainResult<Uuid> {
        let transaction = NewTransaction {
            effective_timestamp: recurring.next_execution,
            category_id: recurring.category_id,
            value: recurring.value,
            value19: recurring.value19,
            value7: recurring.value7,
            vat19: recurring.vat19,
            vat7: recurring.vat7,
            note: recurring.note.clone(),
        };
        let uuid = self
            .transaction_repository
            .insert(&mut *conn, organization_id, self.system_user, &transaction)
            .await?;
        self.recurring_repository
            .insert_link(conn, recurring.lineage_id, uuid, recurring.next_execution)
            .await?;
        Ok(uuid)
    }

    /// Edit as new version: the old row is deactivated, a fresh row joins
    /// the same lineage, the head pointer moves, and every still-pending
    /// booked occurrence is rewritten with the edited fields. Booked links
    /// are keyed by lineage and follow the new version on their own.
    pub async fn update_recurring(
        &self,
        organization_id: Uuid,
        updated_by: Uuid,
        command: UpdateRecurringCommand,
        now: DateTime<Utc>,
    ) -> DomainResult<UpdateRecurringResult> {
        validate_payload(command.value, command.note.as_deref())?;
        parse_timezone(&command.timezone)?;
        let category_id = self
            .resolve_category(organization_id, &command.category)
            .await?;

        let mut tx = self.db.pool().begin().await?;
        let current = RecurringRepository::fetch_in_scope(&mut tx, organization_id, command.id)
            .await?
            .ok_or(DomainError::NotFound("recurring transaction"))?;
        if !current.active {
            return Err(DomainError::Conflict(format!(
                "recurring transaction {} is no longer the active version",
                command.id
            )));
        }

        let version = NewRecurringVersion {
            uuid: Uuid::new_v4(),
            lineage_id: current.lineage_id,
            timezone: command.timezone,
            execution_policy: command.execution_policy,
            execution_policy_data: command
                .execution_policy_data
                .unwrap_or_else(|| serde_json::json!({})),
            // Anchor and cursor carry over; occurrences already booked
            // stay booked and the series continues where it was.
            first_execution: current.first_execution,
            next_execution: current.next_execution,
            last_execution: command.last_execution,
            category_id,
            value: command.value,
            value19: command.value19,
            value7: command.value7,
            vat19: command.vat19,
            vat7: command.vat7,
            note: command.note.clone(),
        };
        self.recurring_repository
            .insert_version(&mut tx, organization_id, updated_by, &version)
            .await?;
        let deactivated = self
            .recurring_repository
            .set_inactive(&mut tx, organization_id, current.uuid)
            .await?;
        if deactivated != 1 {
            return Err(DomainError::Conflict(format!(
                "could not supersede recurring transaction {}",
                current.uuid
            )));
        }
        self.recurring_repository
            .repoint_head(&mut tx, current.lineage_id, version.uuid)
            .await?;

        let refreshed_transaction_ids = self
            .refresh_prebooked(&mut tx, organization_id, updated_by, &version, now)
            .await?;
        tx.commit().await?;

        info!(
            %organization_id,
            recurring = %version.uuid,
            superseded = %current.uuid,
            refreshed = refreshed_transaction_ids.len(),
            "updated recurring transaction"
        );

        let recurring = self.get_recurring(organization_id, version.uuid).await?;
        Ok(UpdateRecurringResult {
            recurring,
            refreshed_transaction_ids,
        })
    }

    /// Rewrite every still-pending booked occurrence with the new version's
    /// fields, keeping each occurrence at its original instant, and repoint
    /// the booked links to the rewritten transactions.
    async fn refresh_prebooked(
        &self,
        conn: &mut sqlx::SqliteConnection,
        organization_id: Uuid,
        updated_by: Uuid,
        version: &NewRecurringVersion,
        now: DateTime<Utc>,
    ) -> DomainResult<Vec<Uuid>> {
        let pending = TransactionRepository::fetch_future_linked(
            &mut *conn,
            organization_id,
            version.lineage_id,
            now,
        )
        .await?;

        let mut refreshed = Vec::with_capacity(pending.len());
        for previous in &pending {
            let fields = NewTransaction {
                effective_timestamp: previous.effective_timestamp,
                category_id: version.category_id,
                value: version.value,
                value19: version.value19,
                value7: version.value7,
                vat19: version.vat19,
                vat7: version.vat7,
                note: version.note.clone(),
            };
            let successor = self
                .transaction_repository
                .supersede(&mut *conn, organization_id, updated_by, previous, &fields)
                .await?;
            let repointed = self
                .recurring_repository
                .repoint_link(&mut *conn, previous.uuid, successor)
                .await?;
            if repointed == 0 {
                return Err(DomainError::Conflict(format!(
                    "missing booked link for transaction {}",
                    previous.uuid
                )));
            }
            refreshed.push(successor);
        }
        Ok(refreshed)
    }

    /// Repoint the booked link when a linked transaction was superseded
    /// outside this engine. Returns how many links moved; zero just means
    /// the transaction was not booked from a definition.
    pub async fn supersede_transaction_link(
        &self,
        old_transaction_id: Uuid,
        new_transaction_id: Uuid,
    ) -> DomainResult<u64> {
        let mut tx = self.db.pool().begin().await?;
        let moved = self
            .recurring_repository
            .repoint_link(&mut tx, old_transaction_id, new_transaction_id)
            .await?;
        tx.commit().await?;
        Ok(moved)
    }

    /// Soft-delete a definition. `cascade` also deactivates occurrences
    /// that already posted; otherwise only future ones go. Cached balances
    /// are invalidated whenever any transaction was touched.
    pub async fn delete_recurring(
        &self,
        organization_id: Uuid,
        id: Uuid,
        cascade: bool,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        let mut tx = self.db.pool().begin().await?;
        let stored = RecurringRepository::fetch_in_scope(&mut tx, organization_id, id)
            .await?
            .ok_or(DomainError::NotFound("recurring transaction"))?;

        let deactivated = TransactionRepository::deactivate_linked(
            &mut tx,
            organization_id,
            stored.lineage_id,
            cascade,
            now,
        )
        .await?;
        if deactivated > 0 {
            BalanceRepository::invalidate_all(&mut tx, organization_id).await?;
        }
        self.recurring_repository
            .set_inactive(&mut tx, organization_id, id)
            .await?;
        tx.commit().await?;

        info!(
            %organization_id,
            recurring = %id,
            cascade,
            transactions_deactivated = deactivated,
            "deleted recurring transaction"
        );
        Ok(())
    }

    async fn resolve_category(&self, organization_id: Uuid, name: &str) -> DomainResult<i64> {
        let by_name = self.category_service.reverse_lookup(organization_id).await?;
        by_name
            .get(name)
            .copied()
            .ok_or_else(|| DomainError::Validation(format!("unknown category: {}", name)))
    }
}

fn validate_payload(value: i64, note: Option<&str>) -> DomainResult<()> {
    if value == 0 {
        return Err(DomainError::Validation(
            "invalid amount for recurring transaction: 0".to_string(),
        ));
    }
    if let Some(note) = note {
        if note.chars().count() > MAX_NOTE_LENGTH {
            return Err(DomainError::Validation(format!(
                "note exceeds {} characters",
                MAX_NOTE_LENGTH
            )));
        }
    }
    Ok(())
}

fn parse_timezone(name: &str) -> DomainResult<Tz> {
    name.parse::<Tz>()
        .map_err(|_| DomainError::Validation(format!("unknown timezone: {}", name)))
}

fn hydrate_recurring(
    stored: StoredRecurring,
    categories: &HashMap<i64, String>,
) -> DomainResult<RecurringTransaction> {
    let timezone = stored.timezone.parse::<Tz>().map_err(|_| {
        DomainError::Conflict(format!("corrupt stored timezone: {}", stored.timezone))
    })?;
    let category = categories
        .get(&stored.category_id)
        .cloned()
        .unwrap_or_else(|| UNKNOWN_CATEGORY.to_string());

    Ok(RecurringTransaction {
        id: stored.uuid,
        lineage_id: stored.lineage_id,
        active: stored.active,
        insert_timestamp: stored.insert_timestamp,
        timezone,
        execution_policy: stored.execution_policy,
        execution_policy_data: stored.execution_policy_data,
        first_execution: stored.first_execution,
        next_execution: stored.next_execution,
        last_execution: stored.last_execution,
        category_id: stored.category_id,
        category,
        value: stored.value,
        value19: stored.value19,
        value7: stored.value7,
        vat19: stored.vat19,
        vat7: stored.vat7,
        note: stored.note,
    })
}

fn hydrate_transaction(record: TransactionRecord, categories: &HashMap<i64, String>) -> Transaction {
    let category = categories
        .get(&record.category_id)
        .cloned()
        .unwrap_or_else(|| UNKNOWN_CATEGORY.to_string());
    Transaction {
        id: record.uuid,
        lineage_id: record.lineage_id,
        insert_timestamp: record.insert_timestamp,
        effective_timestamp: record.effective_timestamp,
        active: record.active,
        category,
        value: record.value,
        value19: record.value19,
        value7: record.value7,
        vat19: record.vat19,
        vat7: record.vat7,
        note: record.note,
    }
}
