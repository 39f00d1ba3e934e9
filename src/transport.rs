//! Transport abstraction over the platform BLE stack.
//!
//! The connection manager is written against these traits rather than
//! btleplug directly, so device discovery, GATT setup, and notification
//! delivery can be substituted in tests. [`crate::ble::BleTransport`] is the
//! production implementation.

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

/// Opaque platform identity of a device, stable across reconnects
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(pub String);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Service-UUID filter used for discovery; a device advertising any of the
/// listed services matches
#[derive(Debug, Clone)]
pub struct DeviceFilter {
    /// Acceptable GATT service UUIDs
    pub services: Vec<Uuid>,
}

/// A raw characteristic notification: the characteristic UUID and its value
pub type Notification = (Uuid, Vec<u8>);

/// A discovered device the manager can connect to and talk GATT with
#[async_trait]
pub trait DeviceHandle: Send + Sync {
    /// Platform identity, used for reconnect-by-id
    fn id(&self) -> DeviceId;

    /// Human-readable device name
    fn name(&self) -> String;

    /// Open the transport-level connection
    async fn connect(&self) -> Result<()>;

    /// Resolve `service`/`characteristic`, enable notifications, and route
    /// value changes into `sender`
    async fn subscribe(
        &self,
        service: Uuid,
        characteristic: Uuid,
        sender: mpsc::UnboundedSender<Notification>,
    ) -> Result<()>;

    /// Write `payload` to the given characteristic
    async fn write(&self, service: Uuid, characteristic: Uuid, payload: &[u8]) -> Result<()>;

    /// Register a hook fired once on unexpected connection loss
    fn on_disconnect(&self, sender: mpsc::UnboundedSender<()>);

    /// Stop all notifications and drop value-change routing
    async fn unsubscribe_all(&self) -> Result<()>;

    /// Close the transport-level connection
    async fn disconnect(&self) -> Result<()>;

    /// Whether the transport-level connection is currently open
    async fn is_connected(&self) -> bool;
}

/// Platform BLE operations the connection manager needs
#[async_trait]
pub trait Transport: Send + Sync {
    /// Discover and select the first device matching `filter`, prompting the
    /// platform's device selection where one exists
    async fn request_device(&self, filter: &DeviceFilter) -> Result<Arc<dyn DeviceHandle>>;

    /// Resolve a previously-authorized device by identity without a new
    /// selection prompt
    async fn known_device(&self, id: &DeviceId) -> Result<Arc<dyn DeviceHandle>>;

    /// Wait for an advertisement from a known device. Returns when the
    /// device is seen; aborts early when `abort` is notified. The caller
    /// bounds the overall wait with a timeout.
    async fn watch_for_advertisement(
        &self,
        id: &DeviceId,
        filter: &DeviceFilter,
        abort: Arc<Notify>,
    ) -> Result<Arc<dyn DeviceHandle>>;
}
