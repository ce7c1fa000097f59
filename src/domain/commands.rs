//! Command and result payloads for the recurring transaction operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::execution_policy::ExecutionPolicy;
use super::models::money::OptionalAmount;
use super::models::recurring::RecurringTransaction;

/// Payload for creating a recurring transaction definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRecurringCommand {
    /// IANA timezone name, e.g. "Europe/Berlin".
    pub timezone: String,
    pub execution_policy: ExecutionPolicy,
    /// Opaque policy parameters, defaulting to an empty object.
    pub execution_policy_data: Option<serde_json::Value>,
    pub first_execution: DateTime<Utc>,
    pub last_execution: Option<DateTime<Utc>>,
    /// Category name; must already exist for the organization.
    pub category: String,
    /// Amount in minor currency units, non-zero.
    pub value: i64,
    pub value19: OptionalAmount,
    pub value7: OptionalAmount,
    pub vat19: OptionalAmount,
    pub vat7: OptionalAmount,
    pub note: Option<String>,
}

/// Payload for editing a definition. The edit lands as a new version of the
/// same lineage; the occurrence cursor and first-execution anchor carry over
/// from the version being replaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRecurringCommand {
    pub id: Uuid,
    pub timezone: String,
    pub execution_policy: ExecutionPolicy,
    pub execution_policy_data: Option<serde_json::Value>,
    pub last_execution: Option<DateTime<Utc>>,
    pub category: String,
    pub value: i64,
    pub value19: OptionalAmount,
    pub value7: OptionalAmount,
    pub vat19: OptionalAmount,
    pub vat7: OptionalAmount,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRecurringResult {
    pub recurring: RecurringTransaction,
    /// Transactions materialized by the booking pass that follows creation.
    pub booked_transaction_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRecurringResult {
    /// The new head version of the lineage.
    pub recurring: RecurringTransaction,
    /// New versions of prebooked transactions rewritten with the edit.
    pub refreshed_transaction_ids: Vec<Uuid>,
}
