//! Heart rate monitor session.
//!
//! Wraps a [`ConnectionManager`] configured for the Heart Rate service and
//! exposes the latest accepted reading as a watch channel.

use crate::codec::{self, HeartRateMeasurement};
use crate::connection::{ConnectMode, ConnectionConfig, ConnectionManager, ServiceConfig};
use crate::error::Result;
use crate::events::{ConnectionState, DeviceSlot, Event, EventBus, SampleKind, TelemetrySample};
use crate::transport::{DeviceFilter, Transport};
use crate::{HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Readings outside this band are treated as sensor noise
const MAX_PLAUSIBLE_BPM: u16 = 250;

/// Decides whether a decoded measurement is a usable reading.
///
/// Strict mode trusts the sensor-contact bits when the sensor reports them.
/// Permissive mode accepts any physiologically plausible value, which matches
/// straps that never set the contact-support bits.
fn accept_reading(measurement: &HeartRateMeasurement, permissive: bool) -> Option<u16> {
    if !permissive && measurement.contact_supported && !measurement.is_contact_detected {
        return None;
    }
    (measurement.heart_rate > 0 && measurement.heart_rate < MAX_PLAUSIBLE_BPM)
        .then_some(measurement.heart_rate)
}

/// Session facade for a heart rate monitor
pub struct HrmSession {
    manager: ConnectionManager,
    heart_rate: Arc<watch::Sender<u16>>,
    listener: JoinHandle<()>,
}

impl HrmSession {
    /// Creates a session over `transport`, publishing samples and lifecycle
    /// events to `bus`. `permissive` controls whether readings are accepted
    /// without a positive sensor-contact indication.
    pub fn new(transport: Arc<dyn Transport>, bus: EventBus, permissive: bool) -> Self {
        let heart_rate = Arc::new(watch::channel(0u16).0);

        let handler_rate = Arc::clone(&heart_rate);
        let handler_bus = bus.clone();
        let handler: Arc<dyn Fn(&[u8]) + Send + Sync> = Arc::new(move |data| {
            match codec::decode_heart_rate(data) {
                Ok(measurement) => {
                    if let Some(bpm) = accept_reading(&measurement, permissive) {
                        handler_rate.send_replace(bpm);
                        handler_bus.publish(Event::Sample(TelemetrySample::now(
                            SampleKind::HeartRate,
                            f64::from(bpm),
                        )));
                    }
                }
                Err(err) => debug!(error = %err, "dropped heart rate frame"),
            }
        });

        let manager = ConnectionManager::new(
            transport,
            bus.clone(),
            ConnectionConfig {
                slot: DeviceSlot::HeartRate,
                filter: DeviceFilter {
                    services: vec![HEART_RATE_SERVICE_UUID],
                },
                services: vec![ServiceConfig {
                    name: "heart_rate",
                    service: HEART_RATE_SERVICE_UUID,
                    characteristic: HEART_RATE_MEASUREMENT_UUID,
                    handler,
                }],
                auto_reconnect: true,
            },
        );

        // The live reading drops to zero whenever the strap goes away.
        let listener_rate = Arc::clone(&heart_rate);
        let mut events = bus.subscribe();
        let listener = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(Event::Disconnected {
                        slot: DeviceSlot::HeartRate,
                        ..
                    }) => {
                        listener_rate.send_replace(0);
                    }
                    Ok(_) => {}
                    // Sample bursts can outrun this listener; the skipped
                    // events carry nothing it needs.
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "heart rate listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Self {
            manager,
            heart_rate,
            listener,
        }
    }

    /// Discovers and connects to a heart rate monitor.
    ///
    /// # Errors
    ///
    /// Propagates discovery and GATT setup failures from the connection
    /// manager.
    pub async fn connect(&self) -> Result<()> {
        self.manager.connect(ConnectMode::RequestNew).await
    }

    /// Reconnects to the previously used monitor without a new prompt.
    ///
    /// # Errors
    ///
    /// Fails when no previous device is known or the reconnect fails.
    pub async fn reconnect(&self) -> Result<()> {
        self.manager.connect(ConnectMode::ReconnectKnown).await
    }

    /// Disconnects and suppresses the automatic reconnect for this teardown
    pub async fn disconnect(&self) {
        self.manager.disconnect().await;
        self.heart_rate.send_replace(0);
    }

    /// Latest accepted heart rate in bpm; zero when no strap is connected
    pub fn heart_rate(&self) -> watch::Receiver<u16> {
        self.heart_rate.subscribe()
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Watch channel following connection state changes
    pub fn status(&self) -> watch::Receiver<ConnectionState> {
        self.manager.status()
    }

    /// Name of the connected monitor, if any
    pub async fn device_name(&self) -> Option<String> {
        self.manager.device_name().await
    }
}

impl Drop for HrmSession {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VeloError;
    use crate::transport::{DeviceHandle, DeviceId};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Notify;

    struct IdleTransport;

    #[async_trait]
    impl Transport for IdleTransport {
        async fn request_device(
            &self,
            _filter: &DeviceFilter,
        ) -> Result<Arc<dyn DeviceHandle>> {
            Err(VeloError::DeviceNotFound)
        }

        async fn known_device(&self, _id: &DeviceId) -> Result<Arc<dyn DeviceHandle>> {
            Err(VeloError::DeviceNotFound)
        }

        async fn watch_for_advertisement(
            &self,
            _id: &DeviceId,
            _filter: &DeviceFilter,
            _abort: Arc<Notify>,
        ) -> Result<Arc<dyn DeviceHandle>> {
            Err(VeloError::DeviceNotFound)
        }
    }

    fn measurement(heart_rate: u16, supported: bool, detected: bool) -> HeartRateMeasurement {
        HeartRateMeasurement {
            heart_rate,
            contact_supported: supported,
            is_contact_detected: detected,
        }
    }

    #[test]
    fn permissive_mode_accepts_plausible_values() {
        assert_eq!(accept_reading(&measurement(140, false, false), true), Some(140));
        assert_eq!(accept_reading(&measurement(1, false, false), true), Some(1));
        assert_eq!(accept_reading(&measurement(249, false, false), true), Some(249));
    }

    #[test]
    fn permissive_mode_rejects_noise() {
        assert_eq!(accept_reading(&measurement(0, false, false), true), None);
        assert_eq!(accept_reading(&measurement(250, false, false), true), None);
    }

    #[test]
    fn strict_mode_requires_contact_when_supported() {
        assert_eq!(accept_reading(&measurement(140, true, false), false), None);
        assert_eq!(accept_reading(&measurement(140, true, true), false), Some(140));
        // A strap that never reports contact support still works in strict mode.
        assert_eq!(accept_reading(&measurement(140, false, false), false), Some(140));
    }

    #[tokio::test(start_paused = true)]
    async fn reading_is_zeroed_even_after_an_event_burst() {
        let bus = EventBus::new();
        let session = HrmSession::new(Arc::new(IdleTransport), bus.clone(), true);
        session.heart_rate.send_replace(142);

        // Well past the bus capacity, so the listener lags.
        for _ in 0..600 {
            bus.publish(Event::Sample(TelemetrySample::now(SampleKind::Power, 200.0)));
        }
        bus.publish(Event::Disconnected {
            slot: DeviceSlot::HeartRate,
            name: "Strap".into(),
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*session.heart_rate().borrow(), 0);
    }
}
