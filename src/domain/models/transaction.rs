//! Domain model for a booked transaction.
//!
//! The engine only materializes and deactivates transactions; reading,
//! pagination and balance aggregation live elsewhere. "Pending" is not a
//! stored state; it is derived from the effective timestamp at read time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::money::OptionalAmount;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    /// Shared by all versions of this logical transaction.
    pub lineage_id: Uuid,
    pub insert_timestamp: DateTime<Utc>,
    pub effective_timestamp: DateTime<Utc>,
    pub active: bool,
    pub category: String,
    /// Total amount in minor currency units; never zero.
    pub value: i64,
    pub value19: OptionalAmount,
    pub value7: OptionalAmount,
    pub vat19: OptionalAmount,
    pub vat7: OptionalAmount,
    pub note: Option<String>,
}

impl Transaction {
    /// A transaction is pending while its effective instant lies in the
    /// future. Prebooked occurrences are ordinary rows that read as
    /// pending until their date arrives.
    pub fn is_pending(&self, now: DateTime<Utc>) -> bool {
        self.effective_timestamp > now
    }
}
