//! Clock capability injected into aggregate decisions.

use chrono::{DateTime, Duration, FixedOffset, Utc};
use std::sync::Mutex;

use crate::error::DomainError;
use crate::invariant::InvariantCode;

/// Tolerance for `occurred_at` stamps ahead of the local wall clock.
///
/// Devices stamp business time themselves; small skews are expected and
/// corrected at sync via the drift estimate. Anything beyond this bound is
/// rejected at decision time.
pub fn max_future_skew() -> Duration {
    Duration::minutes(5)
}

/// Source of the current instant.
///
/// Aggregates never read the system clock directly; the handler passes a
/// `Clock` into `decide` so tests can pin time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation used by production handlers.
#[derive(Debug, Default, Copy, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock pinned to an instant; can be advanced explicitly.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard = to;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Reject business timestamps further ahead of the wall clock than the
/// configured tolerance.
pub fn ensure_occurred_at_plausible(
    occurred_at: DateTime<FixedOffset>,
    clock: &dyn Clock,
) -> Result<(), DomainError> {
    let limit = clock.now() + max_future_skew();
    if occurred_at.with_timezone(&Utc) > limit {
        return Err(DomainError::invariant(
            InvariantCode::OccurredAtTooFarAhead,
            format!("occurred_at {occurred_at} is beyond the future tolerance"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed() -> FixedClock {
        FixedClock::at(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap())
    }

    #[test]
    fn accepts_past_and_near_future_stamps() {
        let clock = fixed();
        let just_before = clock.now() - Duration::hours(2);
        let slightly_ahead = clock.now() + Duration::minutes(4);
        assert!(ensure_occurred_at_plausible(just_before.fixed_offset(), &clock).is_ok());
        assert!(ensure_occurred_at_plausible(slightly_ahead.fixed_offset(), &clock).is_ok());
    }

    #[test]
    fn rejects_far_future_stamps() {
        let clock = fixed();
        let too_far = clock.now() + Duration::minutes(6);
        let err = ensure_occurred_at_plausible(too_far.fixed_offset(), &clock).unwrap_err();
        assert_eq!(
            err.invariant_code(),
            Some(InvariantCode::OccurredAtTooFarAhead)
        );
    }
}
