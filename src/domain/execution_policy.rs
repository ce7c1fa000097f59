//! Occurrence-date arithmetic for recurring transactions.
//!
//! All arithmetic happens on the wall clock of the definition's IANA zone
//! and is converted back to UTC at the end, so month lengths and DST
//! transitions never shift the local time-of-day of an occurrence.

use chrono::{DateTime, Datelike, Days, Duration, LocalResult, Months, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// When within a month a recurring transaction executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionPolicy {
    StartOfMonth,
    EndOfMonth,
}

impl ExecutionPolicy {
    /// Stable integer representation used in storage.
    pub fn repr(self) -> i64 {
        match self {
            ExecutionPolicy::StartOfMonth => 0,
            ExecutionPolicy::EndOfMonth => 1,
        }
    }

    pub fn from_repr(value: i64) -> Option<Self> {
        match value {
            0 => Some(ExecutionPolicy::StartOfMonth),
            1 => Some(ExecutionPolicy::EndOfMonth),
            _ => None,
        }
    }
}

/// Compute the occurrence instant that follows `current`.
///
/// `StartOfMonth` adds one calendar month, keeping the wall-clock
/// time-of-day (the day is clamped to the target month's length).
/// `EndOfMonth` steps one day forward and snaps to the last instant
/// (23:59:59 local) of that day's month.
///
/// Pure and deterministic; the result is strictly later than `current`.
pub fn next_occurrence(current: DateTime<Utc>, policy: ExecutionPolicy, tz: Tz) -> DateTime<Utc> {
    let local = current.with_timezone(&tz).naive_local();

    let next = match policy {
        ExecutionPolicy::StartOfMonth => local
            .checked_add_months(Months::new(1))
            .expect("occurrence date within supported range"),
        ExecutionPolicy::EndOfMonth => {
            let day_after = local
                .date()
                .checked_add_days(Days::new(1))
                .expect("occurrence date within supported range");
            last_day_of_month(day_after)
                .and_hms_opt(23, 59, 59)
                .expect("23:59:59 is a valid wall-clock time")
        }
    };

    resolve_local(tz, next)
}

fn last_day_of_month(date: NaiveDate) -> NaiveDate {
    let first_of_next = if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    };
    first_of_next
        .expect("first of month is always valid")
        .pred_opt()
        .expect("date within supported range")
}

/// Map a local wall-clock time back to UTC. Ambiguous times (clocks rolled
/// back) resolve to the earlier offset; times inside a DST gap resolve to
/// the next valid instant.
fn resolve_local(tz: Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            // DST gaps are at most a few hours wide; probe forward in
            // half-hour steps until the wall clock exists again.
            let mut probe = naive;
            for _ in 0..48 {
                probe += Duration::minutes(30);
                match tz.from_local_datetime(&probe) {
                    LocalResult::Single(dt) => return dt.with_timezone(&Utc),
                    LocalResult::Ambiguous(earliest, _) => return earliest.with_timezone(&Utc),
                    LocalResult::None => continue,
                }
            }
            Utc.from_utc_datetime(&naive)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use chrono_tz::Europe::Berlin;
    use chrono_tz::Tz::UTC;

    fn berlin_utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Berlin
            .with_ymd_and_hms(y, mo, d, h, mi, s)
            .single()
            .expect("unambiguous local time")
            .with_timezone(&Utc)
    }

    #[test]
    fn test_start_of_month_keeps_day_and_time() {
        let current = berlin_utc(2024, 1, 15, 10, 0, 0);
        let next = next_occurrence(current, ExecutionPolicy::StartOfMonth, Berlin);
        assert_eq!(next, berlin_utc(2024, 2, 15, 10, 0, 0));
    }

    #[test]
    fn test_start_of_month_clamps_short_months() {
        let current = berlin_utc(2024, 1, 31, 9, 30, 0);
        let next = next_occurrence(current, ExecutionPolicy::StartOfMonth, Berlin);
        // 2024 is a leap year.
        assert_eq!(next, berlin_utc(2024, 2, 29, 9, 30, 0));
    }

    #[test]
    fn test_start_of_month_across_dst_keeps_wall_clock() {
        // Berlin switches to DST on 2024-03-31; the UTC offset changes from
        // +01:00 to +02:00 but the local execution time must stay 06:00.
        let current = berlin_utc(2024, 3, 15, 6, 0, 0);
        let next = next_occurrence(current, ExecutionPolicy::StartOfMonth, Berlin);
        let local = next.with_timezone(&Berlin);
        assert_eq!((local.month(), local.day()), (4, 15));
        assert_eq!((local.hour(), local.minute()), (6, 0));
        // The absolute gap is one hour short of 31 days because of the
        // skipped hour.
        assert_eq!(next - current, Duration::days(31) - Duration::hours(1));
    }

    #[test]
    fn test_end_of_month_snaps_to_last_instant() {
        let current = berlin_utc(2024, 1, 31, 10, 0, 0);
        let next = next_occurrence(current, ExecutionPolicy::EndOfMonth, Berlin);
        let local = next.with_timezone(&Berlin);
        assert_eq!(local.year(), 2024);
        assert_eq!(local.month(), 2);
        assert_eq!(local.day(), 29);
        assert_eq!((local.hour(), local.minute(), local.second()), (23, 59, 59));
    }

    #[test]
    fn test_end_of_month_from_mid_month() {
        let current = berlin_utc(2024, 4, 10, 12, 0, 0);
        let next = next_occurrence(current, ExecutionPolicy::EndOfMonth, Berlin);
        let local = next.with_timezone(&Berlin);
        assert_eq!((local.month(), local.day()), (4, 30));
        assert_eq!(local.hour(), 23);
    }

    #[test]
    fn test_end_of_month_chain_hits_every_month_end() {
        let mut current = berlin_utc(2024, 1, 31, 23, 59, 59);
        let expected = [(2, 29), (3, 31), (4, 30), (5, 31)];
        for (month, day) in expected {
            current = next_occurrence(current, ExecutionPolicy::EndOfMonth, Berlin);
            let local = current.with_timezone(&Berlin);
            assert_eq!((local.month(), local.day()), (month, day));
        }
    }

    #[test]
    fn test_deterministic() {
        let current = berlin_utc(2024, 6, 1, 8, 0, 0);
        let a = next_occurrence(current, ExecutionPolicy::StartOfMonth, Berlin);
        let b = next_occurrence(current, ExecutionPolicy::StartOfMonth, Berlin);
        assert_eq!(a, b);
    }

    #[test]
    fn test_utc_zone_behaves_like_fixed_offset() {
        let current = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let next = next_occurrence(current, ExecutionPolicy::StartOfMonth, UTC);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_repr_round_trip() {
        for policy in [ExecutionPolicy::StartOfMonth, ExecutionPolicy::EndOfMonth] {
            assert_eq!(ExecutionPolicy::from_repr(policy.repr()), Some(policy));
        }
        assert_eq!(ExecutionPolicy::from_repr(7), None);
    }
}
