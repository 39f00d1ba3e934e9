//! Cross-component event bus.
//!
//! Connection managers and device sessions publish lifecycle and metric
//! events here; the UI layer and the workout session subscribe. Publishing is
//! fire-and-forget and tolerates having no subscribers.

use std::fmt;
use tokio::sync::broadcast;

/// Default bus capacity; slow subscribers lag rather than block publishers
const BUS_CAPACITY: usize = 256;

/// Which logical device slot an event concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceSlot {
    /// Heart-rate monitor slot
    HeartRate,
    /// Smart trainer / power source slot
    Trainer,
}

impl DeviceSlot {
    /// Topic key for this slot, used in log lines and event routing
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::HeartRate => "heartRate",
            Self::Trainer => "trainer",
        }
    }
}

impl fmt::Display for DeviceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Connection lifecycle state for a device slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No device attached
    #[default]
    Disconnected,
    /// A user-initiated connect is in progress
    Connecting,
    /// Device connected and subscriptions are live
    Connected,
    /// A background reconnect attempt is in progress
    Reconnecting,
    /// Orderly teardown in progress
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

/// Kind of a normalized telemetry sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    /// Heart rate in bpm
    HeartRate,
    /// Power in watts
    Power,
    /// Cadence in rpm
    Cadence,
    /// Speed in m/s
    Speed,
}

/// A decoded, normalized sensor reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetrySample {
    /// What this sample measures
    pub kind: SampleKind,
    /// Measured value in the kind's unit
    pub value: f64,
    /// Wall-clock capture time in milliseconds since the Unix epoch
    pub timestamp_ms: i64,
}

impl TelemetrySample {
    /// Build a sample stamped with the current wall-clock time
    #[must_use]
    pub fn now(kind: SampleKind, value: f64) -> Self {
        Self {
            kind,
            value,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Events published on the bus
#[derive(Debug, Clone)]
pub enum Event {
    /// A slot's connection state changed
    Status {
        /// Slot the state change concerns
        slot: DeviceSlot,
        /// New state
        state: ConnectionState,
    },
    /// A slot finished connecting
    Connected {
        /// Slot that connected
        slot: DeviceSlot,
        /// Human-readable device name
        name: String,
    },
    /// A slot's device went away, expectedly or not
    Disconnected {
        /// Slot that disconnected
        slot: DeviceSlot,
        /// Device name, if one was known
        name: String,
    },
    /// A slot reported an error
    SlotError {
        /// Slot the error concerns
        slot: DeviceSlot,
        /// Error description
        message: String,
    },
    /// A normalized telemetry sample
    Sample(TelemetrySample),
}

/// Broadcast event bus shared by all components.
///
/// Cloning is cheap; all clones publish into and subscribe to the same
/// channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Publish an event. Never blocks; dropped silently with no subscribers.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events from this point on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(Event::Status {
            slot: DeviceSlot::Trainer,
            state: ConnectionState::Connecting,
        });

        match rx.recv().await.unwrap() {
            Event::Status { slot, state } => {
                assert_eq!(slot, DeviceSlot::Trainer);
                assert_eq!(state, ConnectionState::Connecting);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish(Event::Sample(TelemetrySample::now(SampleKind::Power, 200.0)));
    }

    #[test]
    fn test_slot_topic_names() {
        assert_eq!(DeviceSlot::HeartRate.name(), "heartRate");
        assert_eq!(DeviceSlot::Trainer.name(), "trainer");
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
    }
}
