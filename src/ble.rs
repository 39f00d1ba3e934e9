//! btleplug-backed implementation of the transport traits.
//!
//! [`BleTransport`] discovers peripherals through the first available
//! adapter; [`BlePeripheral`] wraps a connected peripheral and routes its
//! notification stream to per-characteristic subscribers.

use crate::error::{Result, VeloError};
use crate::transport::{DeviceFilter, DeviceHandle, DeviceId, Notification, Transport};
use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
        PeripheralProperties, ScanFilter, WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::StreamExt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a discovery scan runs before the results are examined
pub const SCAN_TIMEOUT_MS: u64 = 5000;

/// Upper bound on establishing the transport-level connection
pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Interval between scan rounds while waiting for a lost device to advertise
const WATCH_POLL_INTERVAL_MS: u64 = 2000;

/// Production [`Transport`] over the platform Bluetooth stack
pub struct BleTransport {
    manager: Manager,
}

impl BleTransport {
    /// Initializes the Bluetooth stack.
    ///
    /// # Errors
    ///
    /// Returns [`VeloError::Ble`] if the Bluetooth adapter cannot be
    /// initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        Ok(Self { manager })
    }

    async fn adapter(&self) -> Result<Adapter> {
        let adapters = self.manager.adapters().await?;
        adapters.into_iter().next().ok_or(VeloError::DeviceNotFound)
    }

    async fn scan_round(&self, central: &Adapter, filter: &DeviceFilter) -> Result<Vec<Peripheral>> {
        central
            .start_scan(ScanFilter {
                services: filter.services.clone(),
            })
            .await?;
        tokio::time::sleep(Duration::from_millis(SCAN_TIMEOUT_MS)).await;
        central.stop_scan().await?;

        let mut matches = Vec::new();
        for peripheral in central.peripherals().await? {
            if let Ok(Some(properties)) = peripheral.properties().await {
                if advertises_any(&properties, &filter.services) {
                    matches.push(peripheral);
                }
            }
        }
        Ok(matches)
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn request_device(&self, filter: &DeviceFilter) -> Result<Arc<dyn DeviceHandle>> {
        let central = self.adapter().await?;
        info!(services = ?filter.services, "scanning for devices");

        let peripheral = self
            .scan_round(&central, filter)
            .await?
            .into_iter()
            .next()
            .ok_or(VeloError::DeviceNotFound)?;
        let handle = BlePeripheral::new(central, peripheral).await;
        info!(device = %handle.name, "device found");
        Ok(Arc::new(handle))
    }

    async fn known_device(&self, id: &DeviceId) -> Result<Arc<dyn DeviceHandle>> {
        let central = self.adapter().await?;
        for peripheral in central.peripherals().await? {
            if peripheral.id().to_string() == id.0 {
                return Ok(Arc::new(BlePeripheral::new(central, peripheral).await));
            }
        }
        Err(VeloError::DeviceNotFound)
    }

    async fn watch_for_advertisement(
        &self,
        id: &DeviceId,
        filter: &DeviceFilter,
        abort: Arc<Notify>,
    ) -> Result<Arc<dyn DeviceHandle>> {
        let central = self.adapter().await?;
        debug!(device = %id, "watching for advertisement");
        loop {
            let round = async {
                let peripherals = self.scan_round(&central, filter).await?;
                for peripheral in peripherals {
                    if peripheral.id().to_string() == id.0 {
                        return Ok(Some(peripheral));
                    }
                }
                tokio::time::sleep(Duration::from_millis(WATCH_POLL_INTERVAL_MS)).await;
                Ok::<_, VeloError>(None)
            };
            tokio::select! {
                found = round => {
                    if let Some(peripheral) = found? {
                        info!(device = %id, "device advertising again");
                        return Ok(Arc::new(BlePeripheral::new(central, peripheral).await));
                    }
                }
                () = abort.notified() => {
                    debug!(device = %id, "advertisement watch aborted");
                    return Err(VeloError::UserCancelled);
                }
            }
        }
    }
}

/// Whether the advertisement carries any of the wanted services. An empty
/// filter matches everything.
fn advertises_any(properties: &PeripheralProperties, services: &[Uuid]) -> bool {
    services.is_empty() || properties.services.iter().any(|s| services.contains(s))
}

struct Route {
    characteristic: Uuid,
    sender: mpsc::UnboundedSender<Notification>,
}

/// A peripheral the connection manager can drive
pub struct BlePeripheral {
    central: Adapter,
    peripheral: Peripheral,
    name: String,
    routes: Arc<StdMutex<Vec<Route>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl BlePeripheral {
    async fn new(central: Adapter, peripheral: Peripheral) -> Self {
        let name = match peripheral.properties().await {
            Ok(Some(properties)) => properties
                .local_name
                .unwrap_or_else(|| "Unknown Device".to_string()),
            _ => "Unknown Device".to_string(),
        };
        Self {
            central,
            peripheral,
            name,
            routes: Arc::new(StdMutex::new(Vec::new())),
            pump: Mutex::new(None),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    fn find_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<Characteristic> {
        let services = self.peripheral.services();
        let service = services
            .iter()
            .find(|s| s.uuid == service)
            .ok_or_else(|| VeloError::GattSetup(format!("service {service} not found")))?;
        service
            .characteristics
            .iter()
            .find(|c| c.uuid == characteristic)
            .cloned()
            .ok_or_else(|| {
                VeloError::GattSetup(format!("characteristic {characteristic} not found"))
            })
    }

    /// Starts the single notification pump on first use. btleplug exposes
    /// one stream per peripheral, so subscribers are fanned out by
    /// characteristic UUID.
    async fn ensure_pump(&self) -> Result<()> {
        let mut pump = self.pump.lock().await;
        if pump.is_some() {
            return Ok(());
        }
        let mut stream = self.peripheral.notifications().await?;
        let routes = Arc::clone(&self.routes);
        *pump = Some(tokio::spawn(async move {
            while let Some(data) = stream.next().await {
                let senders: Vec<_> = routes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .filter(|route| route.characteristic == data.uuid)
                    .map(|route| route.sender.clone())
                    .collect();
                for sender in senders {
                    let _ = sender.send((data.uuid, data.value.clone()));
                }
            }
        }));
        Ok(())
    }
}

#[async_trait]
impl DeviceHandle for BlePeripheral {
    fn id(&self) -> DeviceId {
        DeviceId(self.peripheral.id().to_string())
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    async fn connect(&self) -> Result<()> {
        timeout(
            Duration::from_millis(CONNECT_TIMEOUT_MS),
            self.peripheral.connect(),
        )
        .await
        .map_err(|_| VeloError::Timeout {
            timeout_ms: CONNECT_TIMEOUT_MS,
        })?
        .map_err(|e| VeloError::ConnectionFailed(e.to_string()))?;

        self.peripheral.discover_services().await?;
        debug!(device = %self.name, "services discovered");
        Ok(())
    }

    async fn subscribe(
        &self,
        service: Uuid,
        characteristic: Uuid,
        sender: mpsc::UnboundedSender<Notification>,
    ) -> Result<()> {
        let target = self.find_characteristic(service, characteristic)?;
        self.peripheral.subscribe(&target).await?;
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Route {
                characteristic,
                sender,
            });
        self.ensure_pump().await
    }

    async fn write(&self, service: Uuid, characteristic: Uuid, payload: &[u8]) -> Result<()> {
        let target = self.find_characteristic(service, characteristic)?;
        let write_type = if target.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        debug!(characteristic = %characteristic, payload = ?payload, "writing");
        self.peripheral.write(&target, payload, write_type).await?;
        Ok(())
    }

    fn on_disconnect(&self, sender: mpsc::UnboundedSender<()>) {
        let central = self.central.clone();
        let target = self.peripheral.id();
        let task = tokio::spawn(async move {
            let mut events = match central.events().await {
                Ok(events) => events,
                Err(err) => {
                    warn!(error = %err, "adapter event stream unavailable");
                    return;
                }
            };
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == target {
                        let _ = sender.send(());
                        return;
                    }
                }
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    async fn unsubscribe_all(&self) -> Result<()> {
        let subscribed: Vec<Uuid> = {
            let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
            let uuids = routes.iter().map(|route| route.characteristic).collect();
            routes.clear();
            uuids
        };
        for uuid in subscribed {
            for service in self.peripheral.services() {
                if let Some(target) = service.characteristics.iter().find(|c| c.uuid == uuid) {
                    if let Err(err) = self.peripheral.unsubscribe(target).await {
                        warn!(characteristic = %uuid, error = %err, "unsubscribe failed");
                    }
                }
            }
        }
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        self.peripheral.disconnect().await?;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_matches_any_advertisement() {
        let properties = PeripheralProperties::default();
        assert!(advertises_any(&properties, &[]));
    }

    #[test]
    fn filter_requires_an_advertised_service() {
        let wanted = Uuid::from_u128(0x0000_180d_0000_1000_8000_0080_5f9b_34fb);
        let other = Uuid::from_u128(0x0000_1816_0000_1000_8000_0080_5f9b_34fb);

        let mut properties = PeripheralProperties::default();
        assert!(!advertises_any(&properties, &[wanted]));

        properties.services.push(other);
        assert!(!advertises_any(&properties, &[wanted]));

        properties.services.push(wanted);
        assert!(advertises_any(&properties, &[wanted]));
    }
}
