//! Connection lifecycle management for a single device slot.
//!
//! [`ConnectionManager`] owns the full connect, GATT-setup, disconnect, and
//! auto-reconnect state machine for one logical device (heart rate monitor or
//! trainer). Device sessions configure it with the services they care about
//! and a parse handler per characteristic; the manager does the rest.

use crate::error::{Result, VeloError};
use crate::events::{ConnectionState, DeviceSlot, Event, EventBus};
use crate::transport::{DeviceFilter, DeviceHandle, DeviceId, Notification, Transport};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Delay before the first reconnect attempt after an unexpected disconnect
pub const RECONNECT_DELAY_MS: u64 = 1000;

/// Upper bound on waiting for an advertisement from a lost device
pub const ADVERTISEMENT_WATCH_TIMEOUT_MS: u64 = 60_000;

/// How a connection should be established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    /// Discover devices and pick a new one, prompting where the platform
    /// supports it
    RequestNew,
    /// Reconnect to the last device by its identity, without a prompt
    ReconnectKnown,
    /// Wait for the last device to advertise again, then connect
    WatchAdvertisement,
}

/// One GATT characteristic subscription plus the handler that parses its
/// notifications
pub struct ServiceConfig {
    /// Label used in logs when setup for this entry fails
    pub name: &'static str,
    /// Containing GATT service
    pub service: uuid::Uuid,
    /// Characteristic to subscribe to
    pub characteristic: uuid::Uuid,
    /// Called with the raw value of every notification
    pub handler: Arc<dyn Fn(&[u8]) + Send + Sync>,
}

impl std::fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("name", &self.name)
            .field("service", &self.service)
            .field("characteristic", &self.characteristic)
            .finish_non_exhaustive()
    }
}

/// Static configuration for one managed device slot
pub struct ConnectionConfig {
    /// Which logical slot this manager fills
    pub slot: DeviceSlot,
    /// Discovery filter for new-device requests and advertisement watches
    pub filter: DeviceFilter,
    /// Characteristic subscriptions to establish after connecting
    pub services: Vec<ServiceConfig>,
    /// Whether unexpected disconnects trigger automatic reconnection
    pub auto_reconnect: bool,
}

struct Inner {
    slot: DeviceSlot,
    transport: Arc<dyn Transport>,
    bus: EventBus,
    filter: DeviceFilter,
    services: Vec<ServiceConfig>,
    auto_reconnect: AtomicBool,
    status_tx: watch::Sender<ConnectionState>,
    device: Mutex<Option<Arc<dyn DeviceHandle>>>,
    device_name: Mutex<Option<String>>,
    last_device_id: Mutex<Option<DeviceId>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    pump_tasks: Mutex<Vec<JoinHandle<()>>>,
    watch_abort: Arc<Notify>,
    last_error: Mutex<Option<String>>,
    reconnect_delay: Duration,
    watch_timeout: Duration,
}

/// Manages the connection lifecycle for one device slot.
///
/// Cloning is cheap; clones share the same underlying state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Creates a manager for `config` over the given transport, publishing
    /// lifecycle events to `bus`
    pub fn new(transport: Arc<dyn Transport>, bus: EventBus, config: ConnectionConfig) -> Self {
        let (status_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                slot: config.slot,
                transport,
                bus,
                filter: config.filter,
                services: config.services,
                auto_reconnect: AtomicBool::new(config.auto_reconnect),
                status_tx,
                device: Mutex::new(None),
                device_name: Mutex::new(None),
                last_device_id: Mutex::new(None),
                reconnect_task: Mutex::new(None),
                pump_tasks: Mutex::new(Vec::new()),
                watch_abort: Arc::new(Notify::new()),
                last_error: Mutex::new(None),
                reconnect_delay: Duration::from_millis(RECONNECT_DELAY_MS),
                watch_timeout: Duration::from_millis(ADVERTISEMENT_WATCH_TIMEOUT_MS),
            }),
        }
    }

    /// Connects according to `mode`.
    ///
    /// While the attempt runs the status is `connecting` (or `reconnecting`
    /// for advertisement watches). On success the status becomes `connected`
    /// and a [`Event::Connected`] is published. On failure the status returns
    /// to `disconnected`, the error is published, and a reconnect is
    /// scheduled when the failure is retryable.
    ///
    /// # Errors
    ///
    /// Returns [`VeloError::ConnectInProgress`] when an attempt is already
    /// running, and the underlying discovery or GATT error otherwise.
    pub async fn connect(&self, mode: ConnectMode) -> Result<()> {
        // An in-flight attempt (explicit or from the retry task) is left
        // alone; cancelling it here would strand its state transitions.
        if matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Reconnecting
        ) {
            return Err(VeloError::ConnectInProgress);
        }
        Inner::cancel_reconnect(&self.inner).await;
        match Inner::connect(Arc::clone(&self.inner), mode).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if err.is_retryable()
                    && self.inner.auto_reconnect.load(Ordering::SeqCst)
                    && self.inner.last_device_id.lock().await.is_some()
                {
                    Inner::schedule_reconnect(Arc::clone(&self.inner)).await;
                }
                Err(err)
            }
        }
    }

    /// Disconnects deliberately.
    ///
    /// Any pending reconnect is cancelled and auto-reconnect is suppressed
    /// for the duration of the teardown so the deliberate disconnect is not
    /// undone, then restored to its prior setting.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let previous = inner.auto_reconnect.swap(false, Ordering::SeqCst);
        Inner::cancel_reconnect(inner).await;

        inner.set_state(ConnectionState::Disconnecting);
        let name = inner.device_name.lock().await.clone();
        let device = inner.device.lock().await.take();
        if let Some(device) = device {
            if let Err(err) = device.unsubscribe_all().await {
                warn!(slot = %inner.slot, error = %err, "failed to stop notifications");
            }
            if let Err(err) = device.disconnect().await {
                warn!(slot = %inner.slot, error = %err, "failed to close connection");
            }
        }
        inner.abort_pumps().await;
        *inner.device_name.lock().await = None;
        inner.set_state(ConnectionState::Disconnected);
        if let Some(name) = name {
            inner.bus.publish(Event::Disconnected {
                slot: inner.slot,
                name,
            });
        }
        inner.auto_reconnect.store(previous, Ordering::SeqCst);
        info!(slot = %inner.slot, "disconnected");
    }

    /// Cancels any scheduled reconnect and aborts an in-progress
    /// advertisement watch, without changing the auto-reconnect setting
    pub async fn cancel_reconnect(&self) {
        Inner::cancel_reconnect(&self.inner).await;
    }

    /// Enables or disables automatic reconnection after unexpected
    /// disconnects
    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.inner.auto_reconnect.store(enabled, Ordering::SeqCst);
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.inner.status_tx.borrow()
    }

    /// Watch channel following every connection state change
    pub fn status(&self) -> watch::Receiver<ConnectionState> {
        self.inner.status_tx.subscribe()
    }

    /// Name of the connected device, if any
    pub async fn device_name(&self) -> Option<String> {
        self.inner.device_name.lock().await.clone()
    }

    /// Message of the most recent connection error, if any
    pub async fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().await.clone()
    }

    /// Writes `payload` to a characteristic on the connected device.
    ///
    /// # Errors
    ///
    /// Returns [`VeloError::Disconnected`] when no device is connected, and
    /// the transport error when the write fails.
    pub async fn write(
        &self,
        service: uuid::Uuid,
        characteristic: uuid::Uuid,
        payload: &[u8],
    ) -> Result<()> {
        let device = self
            .inner
            .device
            .lock()
            .await
            .clone()
            .ok_or(VeloError::Disconnected)?;
        device.write(service, characteristic, payload).await
    }
}

impl Inner {
    // Boxed because the connect future is reachable from tasks it spawns
    // itself (disconnect recovery schedules the retry task, which calls
    // back in here); the type erasure keeps the future finite.
    fn connect(
        inner: Arc<Self>,
        mode: ConnectMode,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        Box::pin(async move {
            {
                let state = *inner.status_tx.borrow();
                if matches!(
                    state,
                    ConnectionState::Connecting | ConnectionState::Reconnecting
                ) {
                    return Err(VeloError::ConnectInProgress);
                }
            }
            inner.teardown_quiet().await;

            let attempt_state = match mode {
                ConnectMode::WatchAdvertisement => ConnectionState::Reconnecting,
                _ => ConnectionState::Connecting,
            };
            inner.set_state(attempt_state);
            debug!(slot = %inner.slot, ?mode, "connecting");

            match Self::establish(&inner, mode).await {
                Ok(()) => {
                    let name = inner
                        .device_name
                        .lock()
                        .await
                        .clone()
                        .unwrap_or_default();
                    *inner.last_error.lock().await = None;
                    inner.set_state(ConnectionState::Connected);
                    inner.bus.publish(Event::Connected {
                        slot: inner.slot,
                        name: name.clone(),
                    });
                    info!(slot = %inner.slot, device = %name, "connected");
                    Ok(())
                }
                Err(err) => {
                    inner.teardown_quiet().await;
                    *inner.last_error.lock().await = Some(err.to_string());
                    inner.set_state(ConnectionState::Disconnected);
                    inner.bus.publish(Event::SlotError {
                        slot: inner.slot,
                        message: err.to_string(),
                    });
                    warn!(slot = %inner.slot, error = %err, "connection failed");
                    Err(err)
                }
            }
        })
    }

    /// Device acquisition plus GATT setup; state transitions stay in
    /// [`Inner::connect`]
    async fn establish(inner: &Arc<Self>, mode: ConnectMode) -> Result<()> {
        let device = match mode {
            ConnectMode::RequestNew => inner.transport.request_device(&inner.filter).await?,
            ConnectMode::ReconnectKnown => {
                let id = inner
                    .last_device_id
                    .lock()
                    .await
                    .clone()
                    .ok_or(VeloError::DeviceNotFound)?;
                inner.transport.known_device(&id).await?
            }
            ConnectMode::WatchAdvertisement => {
                let id = inner
                    .last_device_id
                    .lock()
                    .await
                    .clone()
                    .ok_or(VeloError::DeviceNotFound)?;
                let watch = inner.transport.watch_for_advertisement(
                    &id,
                    &inner.filter,
                    Arc::clone(&inner.watch_abort),
                );
                tokio::time::timeout(inner.watch_timeout, watch)
                    .await
                    .map_err(|_| VeloError::Timeout {
                        timeout_ms: inner.watch_timeout.as_millis() as u64,
                    })??
            }
        };

        device.connect().await?;

        let (disc_tx, mut disc_rx) = mpsc::unbounded_channel();
        device.on_disconnect(disc_tx);
        let hook = Arc::clone(inner);
        let disconnect_pump = tokio::spawn(async move {
            if disc_rx.recv().await.is_some() {
                // Recovery runs detached; this pump is itself torn down as
                // part of it.
                tokio::spawn(Self::handle_unexpected_disconnect(hook));
            }
        });

        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<Notification>();
        let mut subscribed = 0usize;
        for entry in &inner.services {
            match device
                .subscribe(entry.service, entry.characteristic, notify_tx.clone())
                .await
            {
                Ok(()) => {
                    subscribed += 1;
                    debug!(slot = %inner.slot, service = entry.name, "notifications enabled");
                }
                // Many devices expose only a subset of the optional
                // services; a missing one is not a connection failure.
                Err(err) => {
                    warn!(slot = %inner.slot, service = entry.name, error = %err,
                        "service setup failed, continuing without it");
                }
            }
        }
        if subscribed == 0 && !inner.services.is_empty() {
            return Err(VeloError::GattSetup(
                "no usable services on device".into(),
            ));
        }

        let dispatch = Arc::clone(inner);
        let notification_pump = tokio::spawn(async move {
            while let Some((characteristic, value)) = notify_rx.recv().await {
                for entry in &dispatch.services {
                    if entry.characteristic == characteristic {
                        (entry.handler)(&value);
                    }
                }
            }
        });

        {
            let mut pumps = inner.pump_tasks.lock().await;
            pumps.push(disconnect_pump);
            pumps.push(notification_pump);
        }
        *inner.device_name.lock().await = Some(device.name());
        *inner.last_device_id.lock().await = Some(device.id());
        *inner.device.lock().await = Some(device);
        Ok(())
    }

    async fn handle_unexpected_disconnect(inner: Arc<Self>) {
        let name = inner.device_name.lock().await.take();
        inner.device.lock().await.take();
        inner.abort_pumps().await;
        inner.set_state(ConnectionState::Disconnected);
        if let Some(name) = name {
            warn!(slot = %inner.slot, device = %name, "connection lost");
            inner.bus.publish(Event::Disconnected {
                slot: inner.slot,
                name,
            });
        }
        if inner.auto_reconnect.load(Ordering::SeqCst) {
            Self::schedule_reconnect(inner).await;
        }
    }

    /// Spawns the retry task: wait, reconnect by identity, fall back to an
    /// advertisement watch, and keep cycling while the failures stay
    /// retryable. One task at a time.
    async fn schedule_reconnect(inner: Arc<Self>) {
        let mut slot = inner.reconnect_task.lock().await;
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let task_inner = Arc::clone(&inner);
        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(task_inner.reconnect_delay).await;
                if !task_inner.auto_reconnect.load(Ordering::SeqCst) {
                    return;
                }
                info!(slot = %task_inner.slot, "attempting reconnect");
                match Self::connect(Arc::clone(&task_inner), ConnectMode::ReconnectKnown).await {
                    Ok(()) => return,
                    Err(err) => {
                        debug!(slot = %task_inner.slot, error = %err, "direct reconnect failed");
                        if !err.is_retryable() {
                            return;
                        }
                    }
                }
                match Self::connect(Arc::clone(&task_inner), ConnectMode::WatchAdvertisement).await
                {
                    Ok(()) => return,
                    Err(err) => {
                        debug!(slot = %task_inner.slot, error = %err, "advertisement watch failed");
                        if !err.is_retryable() {
                            return;
                        }
                    }
                }
            }
        }));
    }

    async fn cancel_reconnect(inner: &Arc<Self>) {
        inner.watch_abort.notify_waiters();
        if let Some(task) = inner.reconnect_task.lock().await.take() {
            if !task.is_finished() {
                task.abort();
                // Killing the task mid-attempt strands the attempt's state;
                // put the slot back to rest.
                let state = *inner.status_tx.borrow();
                if matches!(
                    state,
                    ConnectionState::Connecting | ConnectionState::Reconnecting
                ) {
                    inner.teardown_quiet().await;
                    inner.set_state(ConnectionState::Disconnected);
                }
            }
        }
    }

    /// Drops the current device and pumps without publishing any state
    /// change; used before a fresh attempt and on failed attempts
    async fn teardown_quiet(&self) {
        let device = self.device.lock().await.take();
        if let Some(device) = device {
            let _ = device.unsubscribe_all().await;
            let _ = device.disconnect().await;
        }
        self.abort_pumps().await;
        *self.device_name.lock().await = None;
    }

    async fn abort_pumps(&self) {
        for task in self.pump_tasks.lock().await.drain(..) {
            task.abort();
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.status_tx.send_replace(state);
        self.bus.publish(Event::Status {
            slot: self.slot,
            state,
        });
    }
}
