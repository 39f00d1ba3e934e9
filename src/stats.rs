//! Derived workout statistics.
//!
//! Pure computations over the recorded data points and the workout's
//! interval tree: current-interval resolution, target power, user power
//! adjustments, and session aggregates. Everything here recomputes from
//! scratch on each call; interval counts are tens, not thousands, so there
//! is nothing worth caching against a clock that changes every tick.

use crate::session::DataPoint;
use crate::workout::{flatten_intervals, Interval, Workout};

/// Step size of one power-adjustment nudge, as a fraction of target
pub const ADJUSTMENT_STEP: f64 = 0.05;

/// Floor for the adjusted target in watts
pub const MIN_ADJUSTED_POWER_WATTS: f64 = 50.0;

/// Hard ceiling for the adjusted target in watts
pub const MAX_ADJUSTED_POWER_WATTS: f64 = 2000.0;

/// The interval the elapsed clock currently falls in
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedInterval {
    /// Index into the flattened interval sequence
    pub index: usize,
    /// Elapsed seconds at which this interval starts
    pub start_seconds: f64,
    /// The flattened leaf interval
    pub interval: Interval,
}

/// Resolves which flattened interval `elapsed_seconds` falls in.
///
/// Repeat blocks are expanded first, then the flat sequence is scanned with
/// half-open `[start, start + duration)` windows. Past the end of the
/// workout the last interval is returned with its own start time, so the
/// display keeps showing the final segment. `None` only for a workout with
/// no leaves.
#[must_use]
pub fn resolve_current_interval(elapsed_seconds: f64, workout: &Workout) -> Option<ResolvedInterval> {
    let flattened = flatten_intervals(&workout.intervals);
    let mut start = 0.0;
    for (index, interval) in flattened.iter().enumerate() {
        let end = start + f64::from(interval.duration);
        if elapsed_seconds < end {
            return Some(ResolvedInterval {
                index,
                start_seconds: start,
                interval: interval.clone(),
            });
        }
        start = end;
    }
    flattened.last().map(|interval| ResolvedInterval {
        index: flattened.len() - 1,
        start_seconds: start - f64::from(interval.duration),
        interval: interval.clone(),
    })
}

/// Target power in watts at `elapsed_seconds`, scaled by `ftp_watts`.
/// Ramp intervals interpolate by fractional progress. `None` for a workout
/// with no leaves.
#[must_use]
pub fn target_power_at(elapsed_seconds: f64, workout: &Workout, ftp_watts: f64) -> Option<f64> {
    let resolved = resolve_current_interval(elapsed_seconds, workout)?;
    let duration = f64::from(resolved.interval.duration);
    let progress = if duration > 0.0 {
        (elapsed_seconds - resolved.start_seconds) / duration
    } else {
        0.0
    };
    Some((resolved.interval.power_fraction_at(progress) * ftp_watts).round())
}

/// Seconds left in the current interval, floored at zero
#[must_use]
pub fn interval_remaining_seconds(elapsed_seconds: f64, workout: &Workout) -> Option<f64> {
    let resolved = resolve_current_interval(elapsed_seconds, workout)?;
    let end = resolved.start_seconds + f64::from(resolved.interval.duration);
    Some((end - elapsed_seconds).max(0.0))
}

/// User power-adjustment offsets layered on the workout's target.
///
/// The per-interval offset resets automatically when the resolved interval
/// changes; the global offset persists for the whole session.
#[derive(Debug, Default, Clone, Copy)]
pub struct PowerAdjustments {
    interval_offset: f64,
    global_offset: f64,
    last_index: Option<usize>,
}

impl PowerAdjustments {
    /// Creates zeroed adjustments
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Nudges the current-interval offset by `steps` (positive or negative)
    pub fn adjust_interval(&mut self, steps: i32) {
        self.interval_offset += f64::from(steps) * ADJUSTMENT_STEP;
    }

    /// Nudges the whole-session offset by `steps`
    pub fn adjust_global(&mut self, steps: i32) {
        self.global_offset += f64::from(steps) * ADJUSTMENT_STEP;
    }

    /// Tracks the resolved interval index, dropping the per-interval offset
    /// when the rider moves to a new interval
    pub fn observe_interval(&mut self, index: usize) {
        if self.last_index.is_some_and(|last| last != index) {
            self.interval_offset = 0.0;
        }
        self.last_index = Some(index);
    }

    /// Clears both offsets, used when the workout completes
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Current per-interval offset as a fraction
    #[must_use]
    pub const fn interval_offset(&self) -> f64 {
        self.interval_offset
    }

    /// Current whole-session offset as a fraction
    #[must_use]
    pub const fn global_offset(&self) -> f64 {
        self.global_offset
    }

    /// Applies both offsets to `base_watts` and clamps the result to the
    /// trainer-safe band `[50, min(ftp * 1.5, 2000)]`
    #[must_use]
    pub fn adjusted_power(&self, base_watts: f64, ftp_watts: f64) -> f64 {
        let raw = base_watts * (1.0 + self.interval_offset + self.global_offset);
        let ceiling = (ftp_watts * 1.5).min(MAX_ADJUSTED_POWER_WATTS);
        raw.clamp(MIN_ADJUSTED_POWER_WATTS, ceiling)
    }
}

/// Session-wide aggregates over the recorded data points
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionStats {
    /// Mean power over every point, including zeros
    pub avg_power: f64,
    /// Peak power
    pub max_power: u16,
    /// Mean heart rate over points with a reading, zero when none have one
    pub avg_heart_rate: f64,
    /// Peak heart rate
    pub max_heart_rate: u16,
    /// Mean cadence over points with a reading
    pub avg_cadence: f64,
    /// Estimated energy in kcal
    pub energy_kcal: f64,
}

fn mean_filtered(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let count = values.clone().count();
    if count == 0 {
        0.0
    } else {
        values.sum::<f64>() / count as f64
    }
}

/// Computes session aggregates.
///
/// Power averages over every point; heart rate and cadence average only
/// points with a nonzero reading, so seconds before a sensor connected do
/// not dilute the mean. Energy treats each point as one second of work:
/// `sum(power) J`, converted to kcal with the 0.239 factor.
#[must_use]
pub fn session_stats(points: &[DataPoint]) -> SessionStats {
    if points.is_empty() {
        return SessionStats::default();
    }
    let power_sum: f64 = points.iter().map(|p| f64::from(p.power)).sum();
    SessionStats {
        avg_power: power_sum / points.len() as f64,
        max_power: points.iter().map(|p| p.power).max().unwrap_or(0),
        avg_heart_rate: mean_filtered(
            points
                .iter()
                .filter(|p| p.heart_rate > 0)
                .map(|p| f64::from(p.heart_rate)),
        ),
        max_heart_rate: points.iter().map(|p| p.heart_rate).max().unwrap_or(0),
        avg_cadence: mean_filtered(points.iter().filter(|p| p.cadence > 0.0).map(|p| p.cadence)),
        energy_kcal: (power_sum / 1000.0 * 0.239).round(),
    }
}

/// Mean power over points inside the current interval's time window.
///
/// The window is inclusive at both ends, which double-counts the boundary
/// sample shared with the next interval; kept for continuity with how rides
/// have always been summarized.
#[must_use]
pub fn interval_avg_power(points: &[DataPoint], resolved: &ResolvedInterval) -> f64 {
    let end = resolved.start_seconds + f64::from(resolved.interval.duration);
    mean_filtered(
        points
            .iter()
            .filter(|p| p.timestamp_seconds >= resolved.start_seconds && p.timestamp_seconds <= end)
            .map(|p| f64::from(p.power)),
    )
}

/// Mean heart rate over points inside the current interval's window,
/// skipping points without a reading
#[must_use]
pub fn interval_avg_heart_rate(points: &[DataPoint], resolved: &ResolvedInterval) -> f64 {
    let end = resolved.start_seconds + f64::from(resolved.interval.duration);
    mean_filtered(
        points
            .iter()
            .filter(|p| {
                p.timestamp_seconds >= resolved.start_seconds
                    && p.timestamp_seconds <= end
                    && p.heart_rate > 0
            })
            .map(|p| f64::from(p.heart_rate)),
    )
}
