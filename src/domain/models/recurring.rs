//! Domain model for a recurring transaction definition.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::execution_policy::{next_occurrence, ExecutionPolicy};

use super::money::OptionalAmount;

/// Maximum length of the free-text note, in characters.
pub const MAX_NOTE_LENGTH: usize = 128;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringTransaction {
    pub id: Uuid,
    /// Shared by all versions of this logical definition; booked links and
    /// the current-version head pointer are keyed by it.
    pub lineage_id: Uuid,
    pub active: bool,
    pub insert_timestamp: DateTime<Utc>,
    pub timezone: Tz,
    pub execution_policy: ExecutionPolicy,
    /// Opaque policy parameters; stored and returned verbatim, never
    /// interpreted by the engine.
    pub execution_policy_data: serde_json::Value,
    /// Immutable anchor; the first occurrence instant.
    pub first_execution: DateTime<Utc>,
    /// The cursor: earliest occurrence instant not yet materialized.
    pub next_execution: DateTime<Utc>,
    /// Optional bound; once the cursor passes it, the definition goes
    /// inactive for good.
    pub last_execution: Option<DateTime<Utc>>,
    pub category_id: i64,
    pub category: String,
    pub value: i64,
    pub value19: OptionalAmount,
    pub value7: OptionalAmount,
    pub vat19: OptionalAmount,
    pub vat7: OptionalAmount,
    pub note: Option<String>,
}

impl RecurringTransaction {
    /// Move the cursor to the next occurrence instant. The cursor only
    /// ever moves forward.
    pub fn advance_cursor(&mut self) {
        self.next_execution = next_occurrence(self.next_execution, self.execution_policy, self.timezone);
    }

    /// True once the cursor has passed the `last_execution` bound.
    pub fn cursor_past_bound(&self) -> bool {
        matches!(self.last_execution, Some(last) if self.next_execution > last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Europe::Berlin;

    fn definition(last_execution: Option<DateTime<Utc>>) -> RecurringTransaction {
        RecurringTransaction {
            id: Uuid::new_v4(),
            lineage_id: Uuid::new_v4(),
            active: true,
            insert_timestamp: Utc::now(),
            timezone: Berlin,
            execution_policy: ExecutionPolicy::StartOfMonth,
            execution_policy_data: serde_json::json!({}),
            first_execution: Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap(),
            next_execution: Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap(),
            last_execution,
            category_id: 1,
            category: "rent".to_string(),
            value: -95000,
            value19: OptionalAmount::ABSENT,
            value7: OptionalAmount::ABSENT,
            vat19: OptionalAmount::ABSENT,
            vat7: OptionalAmount::ABSENT,
            note: None,
        }
    }

    #[test]
    fn test_cursor_only_moves_forward() {
        let mut recurring = definition(None);
        let mut previous = recurring.next_execution;
        for _ in 0..24 {
            recurring.advance_cursor();
            assert!(recurring.next_execution > previous);
            previous = recurring.next_execution;
        }
    }

    #[test]
    fn test_cursor_past_bound() {
        let last = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let mut recurring = definition(Some(last));

        assert!(!recurring.cursor_past_bound());
        recurring.advance_cursor(); // 2024-02-01
        assert!(!recurring.cursor_past_bound());
        recurring.advance_cursor(); // 2024-03-01 == bound
        assert!(!recurring.cursor_past_bound());
        recurring.advance_cursor(); // 2024-04-01
        assert!(recurring.cursor_past_bound());
    }

    #[test]
    fn test_no_bound_never_expires() {
        let mut recurring = definition(None);
        for _ in 0..100 {
            recurring.advance_cursor();
        }
        assert!(!recurring.cursor_past_bound());
    }
}
