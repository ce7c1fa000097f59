//! Optional minor-unit monetary amounts.

use serde::{Deserialize, Serialize};

/// A monetary amount in minor currency units that may be absent.
///
/// "Absent" and "zero" are different states: a transaction without a VAT
/// split is not the same as one with a split of zero. Persistence is
/// canonical: SQL NULL if and only if the amount is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionalAmount(Option<i64>);

impl OptionalAmount {
    pub const ABSENT: OptionalAmount = OptionalAmount(None);

    pub fn new(minor_units: i64) -> Self {
        OptionalAmount(Some(minor_units))
    }

    pub fn is_absent(&self) -> bool {
        self.0.is_none()
    }

    /// The stored amount, or zero when absent. For arithmetic only, never
    /// to be fed back into persistence.
    pub fn or_zero(&self) -> i64 {
        self.0.unwrap_or(0)
    }

    pub fn get(&self) -> Option<i64> {
        self.0
    }
}

impl From<Option<i64>> for OptionalAmount {
    fn from(value: Option<i64>) -> Self {
        OptionalAmount(value)
    }
}
