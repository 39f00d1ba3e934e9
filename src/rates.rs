//! Cadence and speed derivation from cumulative revolution counters.
//!
//! BLE cycling sensors report cumulative revolution counts paired with an
//! event timestamp in 1/1024 s ticks that wraps at 16 bits. Rates are derived
//! from two successive samples; each lineage (crank, wheel) keeps only the
//! previous sample.

/// Default wheel circumference in meters (700x25c road tire)
pub const DEFAULT_WHEEL_CIRCUMFERENCE_M: f64 = 2.105;

/// Event-time tick rate: BLE cycling event timestamps run at 1024 Hz
const TICKS_PER_SECOND: f64 = 1024.0;

/// Maximum plausible cadence in rpm; values above this are clamped
const MAX_CADENCE_RPM: f64 = 255.0;

/// One cumulative-revolution reading with its raw 16-bit event time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevolutionSample {
    /// Cumulative revolution count
    pub revolutions: u32,
    /// Event time in 1/1024 s ticks, wraps at 65536
    pub event_time_raw: u16,
}

/// Tick delta between two raw 16-bit event times, accounting for rollover
fn time_delta_ticks(cur: u16, prev: u16) -> u32 {
    let delta = i32::from(cur) - i32::from(prev);
    if delta < 0 {
        #[allow(clippy::cast_sign_loss)]
        {
            (delta + 65536) as u32
        }
    } else {
        #[allow(clippy::cast_sign_loss)]
        {
            delta as u32
        }
    }
}

/// Cadence in rpm from two successive crank samples.
///
/// Returns 0 when there is no previous sample, the time delta is zero, or the
/// revolution counter went backwards (treated as no progress, not an error).
/// The result is clamped to [0, 255] rpm.
#[must_use]
pub fn cadence_rpm(cur: RevolutionSample, prev: Option<RevolutionSample>) -> f64 {
    let Some(prev) = prev else { return 0.0 };

    let time_delta = time_delta_ticks(cur.event_time_raw, prev.event_time_raw);
    if time_delta == 0 {
        return 0.0;
    }

    if cur.revolutions < prev.revolutions {
        return 0.0;
    }
    let rev_delta = f64::from(cur.revolutions - prev.revolutions);

    let rpm = (rev_delta / f64::from(time_delta)) * TICKS_PER_SECOND * 60.0;
    rpm.clamp(0.0, MAX_CADENCE_RPM)
}

/// Speed in m/s from two successive wheel samples.
///
/// Same no-previous / zero-delta / backwards-counter rules as [`cadence_rpm`];
/// the result is floored at 0.
#[must_use]
pub fn speed_mps(
    cur: RevolutionSample,
    prev: Option<RevolutionSample>,
    wheel_circumference_m: f64,
) -> f64 {
    let Some(prev) = prev else { return 0.0 };

    let time_delta = time_delta_ticks(cur.event_time_raw, prev.event_time_raw);
    if time_delta == 0 {
        return 0.0;
    }

    if cur.revolutions < prev.revolutions {
        return 0.0;
    }
    let rev_delta = f64::from(cur.revolutions - prev.revolutions);

    let distance_m = rev_delta * wheel_circumference_m;
    let time_s = f64::from(time_delta) / TICKS_PER_SECOND;
    (distance_m / time_s).max(0.0)
}

/// Per-session rate state: the previous crank and wheel samples.
///
/// Owned by one device session; both lineages reset together on disconnect or
/// workout reset. Updates follow the "accept only values > 0" rule so a
/// duplicate-timestamp reading never overwrites a valid prior rate.
#[derive(Debug, Default)]
pub struct RateTracker {
    last_crank: Option<RevolutionSample>,
    last_wheel: Option<RevolutionSample>,
    wheel_circumference_m: f64,
}

impl RateTracker {
    /// Create a tracker with the default wheel circumference
    #[must_use]
    pub fn new() -> Self {
        Self::with_wheel_circumference(DEFAULT_WHEEL_CIRCUMFERENCE_M)
    }

    /// Create a tracker with a specific wheel circumference in meters
    #[must_use]
    pub const fn with_wheel_circumference(wheel_circumference_m: f64) -> Self {
        Self {
            last_crank: None,
            last_wheel: None,
            wheel_circumference_m,
        }
    }

    /// Feed a crank sample; returns the new cadence in rpm if it computed to
    /// a value > 0, `None` otherwise (the caller keeps its prior reading).
    pub fn update_crank(&mut self, revolutions: u32, event_time_raw: u16) -> Option<f64> {
        let cur = RevolutionSample {
            revolutions,
            event_time_raw,
        };
        let rpm = cadence_rpm(cur, self.last_crank);
        self.last_crank = Some(cur);
        (rpm > 0.0).then_some(rpm)
    }

    /// Feed a wheel sample; returns the new speed in m/s if it computed to a
    /// value > 0, `None` otherwise.
    pub fn update_wheel(&mut self, revolutions: u32, event_time_raw: u16) -> Option<f64> {
        let cur = RevolutionSample {
            revolutions,
            event_time_raw,
        };
        let speed = speed_mps(cur, self.last_wheel, self.wheel_circumference_m);
        self.last_wheel = Some(cur);
        (speed > 0.0).then_some(speed)
    }

    /// Forget both lineages, e.g. on disconnect
    pub fn reset(&mut self) {
        self.last_crank = None;
        self.last_wheel = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(revolutions: u32, event_time_raw: u16) -> RevolutionSample {
        RevolutionSample {
            revolutions,
            event_time_raw,
        }
    }

    #[test]
    fn test_no_previous_sample_returns_zero() {
        assert_eq!(cadence_rpm(sample(100, 1024), None), 0.0);
        assert_eq!(
            speed_mps(sample(100, 1024), None, DEFAULT_WHEEL_CIRCUMFERENCE_M),
            0.0
        );
    }

    #[test]
    fn test_cadence_steady_90rpm() {
        // 3 revs in 2048 ticks (2 s) = 90 rpm
        let prev = sample(100, 0);
        let cur = sample(103, 2048);
        let rpm = cadence_rpm(cur, Some(prev));
        assert!((rpm - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_cadence_rollover() {
        // prev time 65500, cur time 100: delta must be 136 ticks, not negative
        let rpm = cadence_rpm(sample(1100, 100), Some(sample(1000, 65500)));
        assert!(rpm > 0.0);
    }

    #[test]
    fn test_cadence_clamped_to_255() {
        // 10000 revs in 100 ticks would be ~6.1M rpm without the clamp
        let rpm = cadence_rpm(sample(10_000, 100), Some(sample(0, 0)));
        assert_eq!(rpm, 255.0);
    }

    #[test]
    fn test_zero_time_delta_returns_zero() {
        assert_eq!(cadence_rpm(sample(105, 512), Some(sample(100, 512))), 0.0);
    }

    #[test]
    fn test_backwards_counter_returns_zero() {
        assert_eq!(cadence_rpm(sample(90, 2048), Some(sample(100, 1024))), 0.0);
    }

    #[test]
    fn test_speed_one_rev_per_second() {
        // 1 rev in 1024 ticks (1 s) at 2.105 m circumference = 2.105 m/s
        let speed = speed_mps(
            sample(11, 1024),
            Some(sample(10, 0)),
            DEFAULT_WHEEL_CIRCUMFERENCE_M,
        );
        assert!((speed - 2.105).abs() < 1e-9);
    }

    #[test]
    fn test_speed_rollover() {
        let speed = speed_mps(
            sample(5010, 464),
            Some(sample(5000, 65000)),
            DEFAULT_WHEEL_CIRCUMFERENCE_M,
        );
        assert!(speed > 0.0);
    }

    #[test]
    fn test_tracker_rejects_zero_rates() {
        let mut tracker = RateTracker::new();
        // First sample never yields a rate
        assert_eq!(tracker.update_crank(100, 0), None);
        let rpm = tracker.update_crank(103, 2048).unwrap();
        assert!((rpm - 90.0).abs() < 1e-9);
        // Duplicate timestamp computes to 0: rejected, prior reading stands
        assert_eq!(tracker.update_crank(103, 2048), None);
    }

    #[test]
    fn test_tracker_reset_clears_both_lineages() {
        let mut tracker = RateTracker::new();
        tracker.update_crank(100, 0);
        tracker.update_wheel(500, 0);
        tracker.reset();
        assert_eq!(tracker.update_crank(103, 2048), None);
        assert_eq!(tracker.update_wheel(510, 2048), None);
    }
}
