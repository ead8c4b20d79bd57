//! Wall-clock epoch schedule
//!
//! Every node derives the same deadline from the clock alone: the first
//! multiple of the epoch length (counted from the Unix epoch) after now.
//! This only lines nodes up if their clocks agree, so hosts must run NTP.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Fixed-length epochs anchored at the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochSchedule {
    length: Duration,
}

impl EpochSchedule {
    pub fn new(length: Duration) -> Self {
        Self { length }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    pub fn length(&self) -> Duration {
        self.length
    }

    /// Next deadline strictly after `now`
    pub fn next_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        next_deadline(now, self.length)
    }
}

/// Smallest instant `> now` that is a whole multiple of `length` since the Unix epoch.
///
/// A `now` sitting exactly on a boundary gets the following one. Resolution is
/// one millisecond.
pub fn next_deadline(now: DateTime<Utc>, length: Duration) -> DateTime<Utc> {
    let length = length.as_millis() as i64;
    if length == 0 {
        return now;
    }
    let millis = now.timestamp_millis();
    let floor = millis - millis.rem_euclid(length);
    DateTime::<Utc>::from_timestamp_millis(floor + length).unwrap_or(now)
}

/// Time left until `deadline`, zero if it has passed
pub fn time_until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (deadline - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_deadline_on_boundary_moves_to_next() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 12, 5, 0).unwrap();
        let deadline = next_deadline(now, Duration::from_secs(300));
        assert_eq!(deadline, Utc.with_ymd_and_hms(2026, 10, 19, 12, 10, 0).unwrap());

        // Feeding a deadline back in always advances by one epoch
        let schedule = EpochSchedule::from_secs(300);
        let next = schedule.next_deadline(deadline);
        assert_eq!(next - deadline, chrono::Duration::seconds(300));
    }

    #[test]
    fn test_deadline_rounds_up_to_next_boundary() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 12, 5, 1).unwrap();
        let deadline = next_deadline(now, Duration::from_secs(300));
        assert_eq!(deadline, Utc.with_ymd_and_hms(2026, 10, 19, 12, 10, 0).unwrap());

        // Sub-millisecond past a boundary still moves to the next one
        let just_after = Utc.with_ymd_and_hms(2026, 10, 19, 12, 10, 0).unwrap()
            + chrono::Duration::nanoseconds(1);
        assert_eq!(
            next_deadline(just_after, Duration::from_secs(300)),
            Utc.with_ymd_and_hms(2026, 10, 19, 12, 15, 0).unwrap()
        );
    }

    #[test]
    fn test_deadline_is_deterministic() {
        let now = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap()
            + chrono::Duration::milliseconds(678);
        let schedule = EpochSchedule::from_secs(4 * 3600);
        let a = schedule.next_deadline(now);
        let b = next_deadline(now, Duration::from_secs(4 * 3600));
        assert_eq!(a, b);
        assert_eq!(a, Utc.with_ymd_and_hms(2026, 1, 2, 4, 0, 0).unwrap());
        assert_eq!(
            schedule.next_deadline(a + chrono::Duration::seconds(1)),
            Utc.with_ymd_and_hms(2026, 1, 2, 8, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_time_until_never_negative() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        assert_eq!(time_until(now - chrono::Duration::seconds(5), now), Duration::ZERO);
        assert_eq!(time_until(now + chrono::Duration::seconds(5), now), Duration::from_secs(5));
    }
}
