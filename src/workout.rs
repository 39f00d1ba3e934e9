//! Structured workout definitions.
//!
//! A workout is a named sequence of intervals; repeat blocks nest further
//! interval lists. Power targets are fractions of the rider's FTP so one
//! workout file scales to any rider. Definitions are immutable once a
//! session starts.

use serde::{Deserialize, Serialize};

/// A leaf workout segment with a concrete duration and power target.
///
/// Either `power` (constant target) or `power_start`/`power_end` (linear
/// ramp) is set; all powers are fractions of FTP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interval {
    /// Segment kind, e.g. "warmup", "work", "rest", "cooldown"
    #[serde(rename = "type")]
    pub kind: String,
    /// Duration in seconds
    pub duration: u32,
    /// Constant power target as a fraction of FTP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<f64>,
    /// Ramp start power as a fraction of FTP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_start: Option<f64>,
    /// Ramp end power as a fraction of FTP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_end: Option<f64>,
}

impl Interval {
    /// Power target as a fraction of FTP at `progress` in [0, 1] through the
    /// interval. Ramps interpolate linearly; constant intervals ignore
    /// `progress`. An interval with no power fields targets 0.
    #[must_use]
    pub fn power_fraction_at(&self, progress: f64) -> f64 {
        if let Some(power) = self.power {
            return power;
        }
        if let (Some(start), Some(end)) = (self.power_start, self.power_end) {
            return start + (end - start) * progress.clamp(0.0, 1.0);
        }
        0.0
    }
}

/// A node in the interval tree: either a leaf segment or a repeat block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntervalNode {
    /// A repeat container: its children run `repeat` times in sequence
    Repeat {
        /// Node kind tag, always "repeat"
        #[serde(rename = "type")]
        kind: String,
        /// Number of times the child list runs
        repeat: u32,
        /// Child nodes, expanded in order
        intervals: Vec<IntervalNode>,
    },
    /// A leaf interval
    Leaf(Interval),
}

/// A complete workout definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workout {
    /// Stable workout identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Total duration in seconds
    #[serde(rename = "duration")]
    pub duration_seconds: u32,
    /// Interval tree
    pub intervals: Vec<IntervalNode>,
}

/// Expand every repeat block into sequential copies of its children,
/// preserving order. Leaves are cloned; the result is a flat list.
#[must_use]
pub fn flatten_intervals(nodes: &[IntervalNode]) -> Vec<Interval> {
    let mut flattened = Vec::new();
    flatten_into(nodes, &mut flattened);
    flattened
}

fn flatten_into(nodes: &[IntervalNode], out: &mut Vec<Interval>) {
    for node in nodes {
        match node {
            IntervalNode::Repeat {
                repeat, intervals, ..
            } => {
                for _ in 0..(*repeat).max(1) {
                    flatten_into(intervals, out);
                }
            }
            IntervalNode::Leaf(interval) => out.push(interval.clone()),
        }
    }
}

/// Format a duration in seconds as M:SS
#[must_use]
pub fn format_duration(seconds: u32) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(kind: &str, duration: u32, power: f64) -> IntervalNode {
        IntervalNode::Leaf(Interval {
            kind: kind.to_string(),
            duration,
            power: Some(power),
            power_start: None,
            power_end: None,
        })
    }

    #[test]
    fn test_flatten_repeat_block() {
        let nodes = vec![
            leaf("warmup", 300, 0.5),
            IntervalNode::Repeat {
                kind: "repeat".to_string(),
                repeat: 3,
                intervals: vec![leaf("work", 60, 1.0), leaf("rest", 30, 0.5)],
            },
            leaf("cooldown", 300, 0.5),
        ];

        let flat = flatten_intervals(&nodes);
        assert_eq!(flat.len(), 8);
        assert_eq!(flat[0].kind, "warmup");
        assert_eq!(flat[1].kind, "work");
        assert_eq!(flat[2].kind, "rest");
        assert_eq!(flat[5].kind, "work");
        assert_eq!(flat[6].kind, "rest");
        assert_eq!(flat[7].kind, "cooldown");
    }

    #[test]
    fn test_nested_repeats() {
        let nodes = vec![IntervalNode::Repeat {
            kind: "repeat".to_string(),
            repeat: 2,
            intervals: vec![IntervalNode::Repeat {
                kind: "repeat".to_string(),
                repeat: 2,
                intervals: vec![leaf("work", 30, 1.2)],
            }],
        }];

        assert_eq!(flatten_intervals(&nodes).len(), 4);
    }

    #[test]
    fn test_ramp_interpolation() {
        let interval = Interval {
            kind: "warmup".to_string(),
            duration: 60,
            power: None,
            power_start: Some(0.5),
            power_end: Some(0.7),
        };
        assert!((interval.power_fraction_at(0.0) - 0.5).abs() < 1e-9);
        assert!((interval.power_fraction_at(0.5) - 0.6).abs() < 1e-9);
        assert!((interval.power_fraction_at(1.0) - 0.7).abs() < 1e-9);
        // Progress is clamped
        assert!((interval.power_fraction_at(2.0) - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_json_round_trip() {
        let workout = Workout {
            id: "sweet-spot-1".to_string(),
            name: "Sweet Spot Builder".to_string(),
            duration_seconds: 600,
            intervals: vec![
                IntervalNode::Leaf(Interval {
                    kind: "warmup".to_string(),
                    duration: 300,
                    power: None,
                    power_start: Some(0.5),
                    power_end: Some(0.7),
                }),
                IntervalNode::Repeat {
                    kind: "repeat".to_string(),
                    repeat: 2,
                    intervals: vec![leaf("work", 90, 0.88), leaf("rest", 60, 0.55)],
                },
            ],
        };

        let json = serde_json::to_string(&workout).unwrap();
        assert!(json.contains("\"powerStart\":0.5"));
        let back: Workout = serde_json::from_str(&json).unwrap();
        assert_eq!(back, workout);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0:00");
        assert_eq!(format_duration(65), "1:05");
        assert_eq!(format_duration(3600), "60:00");
    }
}
