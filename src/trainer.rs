//! Smart trainer session.
//!
//! Composes the connection manager, codec, and rate tracker into a facade
//! exposing live power, cadence, and speed, plus FTMS control operations
//! when the trainer grants control.

use crate::codec::{
    self, ControlCommand, ControlOpcode, ControlResult, MAX_TARGET_POWER_WATTS,
};
use crate::connection::{ConnectMode, ConnectionConfig, ConnectionManager, ServiceConfig};
use crate::error::{Result, VeloError};
use crate::events::{ConnectionState, DeviceSlot, Event, EventBus, SampleKind, TelemetrySample};
use crate::rates::RateTracker;
use crate::transport::{DeviceFilter, Transport};
use crate::{
    CSC_MEASUREMENT_UUID, CSC_SERVICE_UUID, CYCLING_POWER_MEASUREMENT_UUID,
    CYCLING_POWER_SERVICE_UUID, FITNESS_MACHINE_SERVICE_UUID, FTMS_CONTROL_POINT_UUID,
};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Control mode the trainer is currently held in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrainerMode {
    /// Read-only: telemetry flows but no control has been taken
    #[default]
    Passive,
    /// Fixed target power regardless of cadence
    Erg,
    /// Simulated grade, wind, and rolling resistance
    Sim,
    /// Fixed resistance level
    Resistance,
}

/// Snapshot of the FTMS control handshake and targets
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlState {
    /// Whether the trainer exposes a usable Fitness Machine control point
    pub supported: bool,
    /// Whether the machine has granted control; gate for every control write
    pub has_control: bool,
    /// Active control mode
    pub mode: TrainerMode,
    /// Last requested target power in watts
    pub target_power: i32,
    /// Last requested resistance level in percent
    pub target_resistance: f64,
    /// Last requested simulation grade in percent
    pub target_grade: f64,
}

/// Live telemetry shared between the notification handlers and the session
struct Telemetry {
    power: watch::Sender<u16>,
    cadence: watch::Sender<f64>,
    speed: watch::Sender<f64>,
    tracker: Mutex<RateTracker>,
    bus: EventBus,
}

impl Telemetry {
    fn new(bus: EventBus) -> Self {
        Self {
            power: watch::channel(0).0,
            cadence: watch::channel(0.0).0,
            speed: watch::channel(0.0).0,
            tracker: Mutex::new(RateTracker::new()),
            bus,
        }
    }

    fn ingest_power(&self, data: &[u8]) {
        let measurement = match codec::decode_cycling_power(data) {
            Ok(measurement) => measurement,
            Err(err) => {
                debug!(error = %err, "dropped cycling power frame");
                return;
            }
        };
        self.power.send_replace(measurement.power_watts);
        self.bus.publish(Event::Sample(TelemetrySample::now(
            SampleKind::Power,
            f64::from(measurement.power_watts),
        )));
        if let (Some(revolutions), Some(event_time)) = (
            measurement.crank_revolutions,
            measurement.last_crank_event_time,
        ) {
            self.update_cadence(u32::from(revolutions), event_time);
        }
        if let (Some(revolutions), Some(event_time)) = (
            measurement.wheel_revolutions,
            measurement.last_wheel_event_time,
        ) {
            self.update_speed(revolutions, event_time);
        }
    }

    fn ingest_csc(&self, data: &[u8]) {
        let measurement = match codec::decode_csc_measurement(data) {
            Ok(measurement) => measurement,
            Err(err) => {
                debug!(error = %err, "dropped CSC frame");
                return;
            }
        };
        if let (Some(revolutions), Some(event_time)) = (
            measurement.crank_revolutions,
            measurement.last_crank_event_time,
        ) {
            self.update_cadence(u32::from(revolutions), event_time);
        }
        if let (Some(revolutions), Some(event_time)) = (
            measurement.wheel_revolutions,
            measurement.last_wheel_event_time,
        ) {
            self.update_speed(revolutions, event_time);
        }
    }

    fn update_cadence(&self, revolutions: u32, event_time: u16) {
        let rpm = self
            .tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .update_crank(revolutions, event_time);
        if let Some(rpm) = rpm {
            self.cadence.send_replace(rpm);
            self.bus
                .publish(Event::Sample(TelemetrySample::now(SampleKind::Cadence, rpm)));
        }
    }

    fn update_speed(&self, revolutions: u32, event_time: u16) {
        let mps = self
            .tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .update_wheel(revolutions, event_time);
        if let Some(mps) = mps {
            self.speed.send_replace(mps);
            self.bus
                .publish(Event::Sample(TelemetrySample::now(SampleKind::Speed, mps)));
        }
    }

    fn reset(&self) {
        self.tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
        self.power.send_replace(0);
        self.cadence.send_replace(0.0);
        self.speed.send_replace(0.0);
    }
}

/// Control-point state shared with the response handler
struct Control {
    state: Mutex<ControlState>,
}

impl Control {
    fn new() -> Self {
        Self {
            state: Mutex::new(ControlState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Control-point responses are the authoritative word on whether we hold
    /// control; the optimistic updates made on write are corrected here.
    fn ingest_response(&self, data: &[u8]) {
        let response = match codec::decode_control_response(data) {
            Ok(Some(response)) => response,
            Ok(None) => return,
            Err(err) => {
                debug!(error = %err, "dropped control point frame");
                return;
            }
        };
        let mut state = self.lock();
        state.supported = true;
        if response.request_opcode == Some(ControlOpcode::RequestControl) {
            state.has_control = response.result == ControlResult::Success;
            if state.has_control {
                info!("machine granted control");
            } else {
                warn!(result = ?response.result, "machine refused control");
            }
        } else if response.result != ControlResult::Success {
            warn!(
                opcode = response.raw_opcode,
                result = ?response.result,
                "control command rejected"
            );
            if response.result == ControlResult::ControlNotPermitted {
                state.has_control = false;
            }
        }
    }

    fn reset(&self) {
        *self.lock() = ControlState::default();
    }
}

/// Session facade for a smart trainer or power/cadence sensor
pub struct TrainerSession {
    manager: ConnectionManager,
    telemetry: Arc<Telemetry>,
    control: Arc<Control>,
    listener: JoinHandle<()>,
}

impl TrainerSession {
    /// Creates a session over `transport`, publishing samples and lifecycle
    /// events to `bus`
    pub fn new(transport: Arc<dyn Transport>, bus: EventBus) -> Self {
        let telemetry = Arc::new(Telemetry::new(bus.clone()));
        let control = Arc::new(Control::new());

        let power_telemetry = Arc::clone(&telemetry);
        let csc_telemetry = Arc::clone(&telemetry);
        let response_control = Arc::clone(&control);

        let manager = ConnectionManager::new(
            transport,
            bus.clone(),
            ConnectionConfig {
                slot: DeviceSlot::Trainer,
                filter: DeviceFilter {
                    services: vec![
                        FITNESS_MACHINE_SERVICE_UUID,
                        CYCLING_POWER_SERVICE_UUID,
                        CSC_SERVICE_UUID,
                    ],
                },
                services: vec![
                    ServiceConfig {
                        name: "cycling_power",
                        service: CYCLING_POWER_SERVICE_UUID,
                        characteristic: CYCLING_POWER_MEASUREMENT_UUID,
                        handler: Arc::new(move |data| power_telemetry.ingest_power(data)),
                    },
                    ServiceConfig {
                        name: "csc",
                        service: CSC_SERVICE_UUID,
                        characteristic: CSC_MEASUREMENT_UUID,
                        handler: Arc::new(move |data| csc_telemetry.ingest_csc(data)),
                    },
                    ServiceConfig {
                        name: "ftms_control",
                        service: FITNESS_MACHINE_SERVICE_UUID,
                        characteristic: FTMS_CONTROL_POINT_UUID,
                        handler: Arc::new(move |data| response_control.ingest_response(data)),
                    },
                ],
                auto_reconnect: true,
            },
        );

        let listener_manager = manager.clone();
        let listener_telemetry = Arc::clone(&telemetry);
        let listener_control = Arc::clone(&control);
        let mut events = bus.subscribe();
        let listener = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    // Control is requested automatically so the trainer is
                    // drivable as soon as it connects.
                    Ok(Event::Connected {
                        slot: DeviceSlot::Trainer,
                        ..
                    }) => {
                        request_control(&listener_manager, &listener_control).await;
                    }
                    Ok(Event::Disconnected {
                        slot: DeviceSlot::Trainer,
                        ..
                    }) => {
                        listener_telemetry.reset();
                        listener_control.reset();
                    }
                    Ok(_) => {}
                    // Sample bursts can outrun this listener; the skipped
                    // events carry nothing it needs.
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "trainer listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Self {
            manager,
            telemetry,
            control,
            listener,
        }
    }

    /// Discovers and connects to a trainer.
    ///
    /// # Errors
    ///
    /// Propagates discovery and GATT setup failures from the connection
    /// manager.
    pub async fn connect(&self) -> Result<()> {
        self.manager.connect(ConnectMode::RequestNew).await
    }

    /// Reconnects to the previously used trainer without a new prompt.
    ///
    /// # Errors
    ///
    /// Fails when no previous device is known or the reconnect fails.
    pub async fn reconnect(&self) -> Result<()> {
        self.manager.connect(ConnectMode::ReconnectKnown).await
    }

    /// Disconnects and resets telemetry and control state
    pub async fn disconnect(&self) {
        self.manager.disconnect().await;
        self.telemetry.reset();
        self.control.reset();
    }

    /// Asks the machine for control. Returns false when the control point
    /// is unavailable; the grant itself is confirmed asynchronously.
    pub async fn request_control(&self) -> bool {
        request_control(&self.manager, &self.control).await
    }

    /// Sets a fixed target power (ERG mode). Returns false without writing
    /// when control has not been granted.
    pub async fn set_target_power(&self, watts: i32) -> bool {
        if !self.control_ready() {
            return false;
        }
        let command = ControlCommand::SetTargetPower { watts };
        if self.write_command(command).await {
            let mut state = self.control.lock();
            state.mode = TrainerMode::Erg;
            state.target_power = watts.clamp(0, MAX_TARGET_POWER_WATTS);
            true
        } else {
            false
        }
    }

    /// Sets simulation parameters (SIM mode). Returns false without writing
    /// when control has not been granted.
    pub async fn set_simulation(&self, wind_mps: f64, grade_percent: f64, crr: f64, cw: f64) -> bool {
        if !self.control_ready() {
            return false;
        }
        let command = ControlCommand::SetSimulation {
            wind_mps,
            grade_percent,
            crr,
            cw,
        };
        if self.write_command(command).await {
            let mut state = self.control.lock();
            state.mode = TrainerMode::Sim;
            state.target_grade = grade_percent.clamp(-codec::MAX_GRADE_PERCENT, codec::MAX_GRADE_PERCENT);
            true
        } else {
            false
        }
    }

    /// Sets a fixed resistance level. Returns false without writing when
    /// control has not been granted.
    pub async fn set_resistance(&self, percent: f64) -> bool {
        if !self.control_ready() {
            return false;
        }
        let command = ControlCommand::SetResistance { percent };
        if self.write_command(command).await {
            let mut state = self.control.lock();
            state.mode = TrainerMode::Resistance;
            state.target_resistance = percent.clamp(0.0, 100.0);
            true
        } else {
            false
        }
    }

    /// Latest instantaneous power in watts
    pub fn power(&self) -> watch::Receiver<u16> {
        self.telemetry.power.subscribe()
    }

    /// Latest cadence in rpm
    pub fn cadence(&self) -> watch::Receiver<f64> {
        self.telemetry.cadence.subscribe()
    }

    /// Latest speed in m/s
    pub fn speed(&self) -> watch::Receiver<f64> {
        self.telemetry.speed.subscribe()
    }

    /// Snapshot of the control handshake and targets
    pub fn control_state(&self) -> ControlState {
        *self.control.lock()
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Watch channel following connection state changes
    pub fn status(&self) -> watch::Receiver<ConnectionState> {
        self.manager.status()
    }

    /// Name of the connected trainer, if any
    pub async fn device_name(&self) -> Option<String> {
        self.manager.device_name().await
    }

    fn control_ready(&self) -> bool {
        let state = self.control.lock();
        state.supported && state.has_control
    }

    async fn write_command(&self, command: ControlCommand) -> bool {
        let frame = command.encode();
        match self
            .manager
            .write(FITNESS_MACHINE_SERVICE_UUID, FTMS_CONTROL_POINT_UUID, &frame)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(command = ?command.opcode(), error = %err, "control write failed");
                false
            }
        }
    }
}

impl Drop for TrainerSession {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn request_control(manager: &ConnectionManager, control: &Control) -> bool {
    let frame = ControlCommand::RequestControl.encode();
    match manager
        .write(FITNESS_MACHINE_SERVICE_UUID, FTMS_CONTROL_POINT_UUID, &frame)
        .await
    {
        Ok(()) => {
            control.lock().supported = true;
            debug!("control requested");
            true
        }
        Err(err) => {
            if matches!(err, VeloError::GattSetup(_)) {
                // No control point on this device; it stays readable in
                // passive mode.
                let mut state = control.lock();
                state.supported = false;
                state.has_control = false;
                state.mode = TrainerMode::Passive;
            }
            debug!(error = %err, "control request failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{DeviceHandle, DeviceId, Notification};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{mpsc, Notify};
    use uuid::Uuid;

    struct MockDevice {
        writes: AtomicUsize,
    }

    #[async_trait]
    impl DeviceHandle for MockDevice {
        fn id(&self) -> DeviceId {
            DeviceId("mock-trainer".into())
        }

        fn name(&self) -> String {
            "Mock Trainer".into()
        }

        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn subscribe(
            &self,
            _service: Uuid,
            _characteristic: Uuid,
            _sender: mpsc::UnboundedSender<Notification>,
        ) -> Result<()> {
            Ok(())
        }

        async fn write(&self, _service: Uuid, _characteristic: Uuid, _payload: &[u8]) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_disconnect(&self, _sender: mpsc::UnboundedSender<()>) {}

        async fn unsubscribe_all(&self) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }

        async fn is_connected(&self) -> bool {
            true
        }
    }

    struct MockTransport {
        device: Arc<MockDevice>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn request_device(
            &self,
            _filter: &DeviceFilter,
        ) -> Result<Arc<dyn DeviceHandle>> {
            Ok(self.device.clone())
        }

        async fn known_device(&self, _id: &DeviceId) -> Result<Arc<dyn DeviceHandle>> {
            Ok(self.device.clone())
        }

        async fn watch_for_advertisement(
            &self,
            _id: &DeviceId,
            _filter: &DeviceFilter,
            _abort: Arc<Notify>,
        ) -> Result<Arc<dyn DeviceHandle>> {
            Ok(self.device.clone())
        }
    }

    fn telemetry() -> Telemetry {
        Telemetry::new(EventBus::new())
    }

    #[test]
    fn power_frame_updates_power_and_cadence() {
        let telemetry = telemetry();
        // Flags 0x0020 (crank data), power 200 W, 100 revs at tick 0
        telemetry.ingest_power(&[0x20, 0x00, 0xC8, 0x00, 0x64, 0x00, 0x00, 0x00]);
        assert_eq!(*telemetry.power.subscribe().borrow(), 200);
        assert_eq!(*telemetry.cadence.subscribe().borrow(), 0.0);

        // One second later: 101 revs at tick 1024 -> 60 rpm
        telemetry.ingest_power(&[0x20, 0x00, 0xC8, 0x00, 0x65, 0x00, 0x00, 0x04]);
        let cadence = *telemetry.cadence.subscribe().borrow();
        assert!((cadence - 60.0).abs() < 0.01, "cadence was {cadence}");
    }

    #[test]
    fn csc_frame_updates_speed() {
        let telemetry = telemetry();
        // Flags 0x02 (wheel data), 1000 revs at tick 0
        telemetry.ingest_csc(&[0x02, 0xE8, 0x03, 0x00, 0x00, 0x00, 0x00]);
        // 1002 revs one second later: 2 * 2.105 m/s
        telemetry.ingest_csc(&[0x02, 0xEA, 0x03, 0x00, 0x00, 0x00, 0x04]);
        let speed = *telemetry.speed.subscribe().borrow();
        assert!((speed - 4.21).abs() < 0.01, "speed was {speed}");
    }

    #[test]
    fn zero_rate_does_not_overwrite_last_reading() {
        let telemetry = telemetry();
        telemetry.ingest_csc(&[0x01, 0x64, 0x00, 0x00, 0x00]);
        telemetry.ingest_csc(&[0x01, 0x65, 0x00, 0x00, 0x04]);
        let before = *telemetry.cadence.subscribe().borrow();
        assert!(before > 0.0);

        // Same counter, same timestamp: no progress, reading stands.
        telemetry.ingest_csc(&[0x01, 0x65, 0x00, 0x00, 0x04]);
        assert_eq!(*telemetry.cadence.subscribe().borrow(), before);
    }

    #[test]
    fn malformed_frame_is_dropped() {
        let telemetry = telemetry();
        telemetry.ingest_power(&[0x20]);
        assert_eq!(*telemetry.power.subscribe().borrow(), 0);
    }

    #[test]
    fn reset_clears_live_values() {
        let telemetry = telemetry();
        telemetry.ingest_power(&[0x00, 0x00, 0xC8, 0x00]);
        assert_eq!(*telemetry.power.subscribe().borrow(), 200);
        telemetry.reset();
        assert_eq!(*telemetry.power.subscribe().borrow(), 0);
    }

    #[test]
    fn request_control_grant_flows_from_response() {
        let control = Control::new();
        assert!(!control.lock().has_control);

        // Response frame: marker, echoed RequestControl opcode, success.
        control.ingest_response(&[0x80, 0x00, 0x01]);
        let state = control.lock();
        assert!(state.supported);
        assert!(state.has_control);
    }

    #[test]
    fn control_refusal_clears_the_grant() {
        let control = Control::new();
        control.ingest_response(&[0x80, 0x00, 0x01]);
        assert!(control.lock().has_control);

        // A later command bounced with ControlNotPermitted revokes it.
        control.ingest_response(&[0x80, 0x05, 0x05]);
        assert!(!control.lock().has_control);
    }

    #[test]
    fn non_response_frames_are_ignored() {
        let control = Control::new();
        control.ingest_response(&[0x10, 0x00, 0x01]);
        assert!(!control.lock().supported);
    }

    #[tokio::test(start_paused = true)]
    async fn control_is_requested_again_after_an_event_burst() {
        let device = Arc::new(MockDevice {
            writes: AtomicUsize::new(0),
        });
        let bus = EventBus::new();
        let session = TrainerSession::new(
            Arc::new(MockTransport {
                device: device.clone(),
            }),
            bus.clone(),
        );

        session.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let after_connect = device.writes.load(Ordering::SeqCst);
        assert!(after_connect >= 1, "no control request on connect");

        // Well past the bus capacity, so the listener lags before the next
        // connected event arrives.
        for _ in 0..600 {
            bus.publish(Event::Sample(TelemetrySample::now(SampleKind::Power, 180.0)));
        }
        bus.publish(Event::Connected {
            slot: DeviceSlot::Trainer,
            name: "Mock Trainer".into(),
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(device.writes.load(Ordering::SeqCst) > after_connect);
    }
}
