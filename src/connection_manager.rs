//! Connection manager: the application-facing façade.
//!
//! Owns the scanner and one connection actor per peripheral address, and
//! routes every event coming out of the adapter gateway to whichever of
//! them it belongs to.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::advertising::{AdvertisementRecord, ScanFilter};
use crate::ble::connection::{ConnectionEvent, ConnectionState};
use crate::ble::gateway::{AdapterGateway, GatewayEvent, GatewayEventReceiver};
use crate::ble::peripheral::PeripheralAddress;
use crate::ble::platform::BtleplugGateway;
use crate::ble::scanner::{AdvertisementStream, ScanHandle, ScanState, Scanner};
use crate::config::ManagerConfig;
use crate::connection::{self, ActorContext, ConnectionHandle, NotificationStream, Registry};
use crate::error::{Error, Result};

/// Handle for unregistering a callback.
///
/// The callback is unregistered when this handle is dropped.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

impl std::fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandle").field("id", &self.id).finish()
    }
}

/// Central manager for scanning and for connections to many peripherals.
///
/// Construct one per adapter and pass it to whatever needs BLE access.
/// Instances are fully independent of each other.
pub struct ConnectionManager {
    gateway: Arc<dyn AdapterGateway>,
    scanner: Arc<Scanner>,
    /// Live connection records by address.
    registry: Arc<Registry>,
    config: ManagerConfig,
    events_tx: broadcast::Sender<ConnectionEvent>,
    /// Connection record id counter.
    next_id: AtomicU64,
    /// Callback ID counter.
    callback_counter: AtomicU64,
    /// Gateway event routing task.
    router: JoinHandle<()>,
    is_running: AtomicBool,
}

/// Outcome of looking up the record for a connect request.
enum Lookup {
    Existing(ConnectionHandle),
    Closing(ConnectionHandle),
    Created(ConnectionHandle),
}

impl ConnectionManager {
    /// Create a manager over `gateway`.
    ///
    /// `events` must be the receiving half of the channel the gateway
    /// publishes its events on. Must be called from within a tokio runtime.
    pub fn new(
        gateway: Arc<dyn AdapterGateway>,
        events: GatewayEventReceiver,
        config: ManagerConfig,
    ) -> Self {
        let scanner = Arc::new(Scanner::new(gateway.clone()));
        let registry: Arc<Registry> = Arc::new(RwLock::new(HashMap::new()));
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));

        let router = tokio::spawn(route_events(events, scanner.clone(), registry.clone()));

        Self {
            gateway,
            scanner,
            registry,
            config,
            events_tx,
            next_id: AtomicU64::new(1),
            callback_counter: AtomicU64::new(0),
            router,
            is_running: AtomicBool::new(true),
        }
    }

    /// Create a manager over the host's first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns `BluetoothUnavailable` if no adapter is present.
    pub async fn with_default_adapter(config: ManagerConfig) -> Result<Self> {
        let (gateway, events) = BtleplugGateway::new().await?;
        Ok(Self::new(Arc::new(gateway), events, config))
    }

    /// The manager's configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Connect to a peripheral and wait until it is ready for GATT traffic.
    ///
    /// If a connection to `address` is already connecting or ready, its
    /// handle is returned and no new link is opened. If one is shutting down,
    /// this waits for it to close and then starts a fresh connection.
    ///
    /// # Errors
    ///
    /// Returns `ConnectError`, `DiscoveryError` or `Timeout` if the
    /// connection could not be established, `Cancelled` if it was
    /// disconnected before becoming ready.
    pub async fn connect(&self, address: impl Into<PeripheralAddress>) -> Result<ConnectionHandle> {
        self.ensure_running()?;
        let address = address.into();

        let handle = loop {
            match self.lookup_or_create(&address) {
                Lookup::Existing(handle) => {
                    debug!("Joining existing connection to {}", address);
                    break handle;
                }
                Lookup::Created(handle) => break handle,
                Lookup::Closing(handle) => {
                    debug!("Waiting for {} to finish disconnecting", address);
                    handle.closed().await;
                }
            }
        };

        handle.wait_ready().await?;
        Ok(handle)
    }

    fn lookup_or_create(&self, address: &PeripheralAddress) -> Lookup {
        let mut registry = self.registry.write();

        if let Some(existing) = registry.get(address) {
            match existing.state() {
                ConnectionState::Disconnecting => return Lookup::Closing(existing.clone()),
                state if !state.is_terminal() => return Lookup::Existing(existing.clone()),
                _ => {}
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        info!("Connecting to {}", address);

        let handle = connection::spawn(address.clone(), id, self.actor_context());
        registry.insert(address.clone(), handle.clone());
        Lookup::Created(handle)
    }

    fn actor_context(&self) -> ActorContext {
        ActorContext {
            gateway: self.gateway.clone(),
            scanner: self.scanner.clone(),
            config: self.config.clone(),
            events: self.events_tx.clone(),
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Disconnect from a peripheral and wait for the link to close.
    ///
    /// Every queued and in-flight request on the connection fails with
    /// `Cancelled`. Disconnecting an unknown address is a no-op.
    pub async fn disconnect(&self, address: impl Into<PeripheralAddress>) -> Result<()> {
        let address = address.into();
        let Some(handle) = self.handle(&address) else {
            debug!("No connection to {}, ignoring disconnect", address);
            return Ok(());
        };

        handle.request_disconnect();
        handle.closed().await;
        Ok(())
    }

    /// The live connection to `address`, if any.
    pub fn handle(&self, address: &PeripheralAddress) -> Option<ConnectionHandle> {
        self.registry.read().get(address).cloned()
    }

    /// Read a characteristic.
    pub async fn read(&self, handle: &ConnectionHandle, characteristic: Uuid) -> Result<Vec<u8>> {
        handle.read(characteristic).await
    }

    /// Write a characteristic.
    pub async fn write(
        &self,
        handle: &ConnectionHandle,
        characteristic: Uuid,
        value: impl Into<Vec<u8>>,
    ) -> Result<()> {
        handle.write(characteristic, value).await
    }

    /// Subscribe to a characteristic's notifications.
    pub async fn subscribe(
        &self,
        handle: &ConnectionHandle,
        characteristic: Uuid,
    ) -> Result<NotificationStream> {
        handle.subscribe(characteristic).await
    }

    /// Unsubscribe from a characteristic's notifications.
    pub async fn unsubscribe(&self, handle: &ConnectionHandle, characteristic: Uuid) -> Result<()> {
        handle.unsubscribe(characteristic).await
    }

    /// Start scanning. Without a filter every peripheral is reported, using
    /// the configured duplicate policy.
    pub async fn start_scan(&self, filter: Option<ScanFilter>) -> Result<ScanHandle> {
        self.ensure_running()?;
        let filter = filter.unwrap_or_else(|| {
            ScanFilter::default().with_duplicates(self.config.scan_duplicates)
        });
        self.scanner.start(filter).await
    }

    /// Stop a scan session.
    pub async fn stop_scan(&self, handle: ScanHandle) -> Result<()> {
        self.scanner.stop(handle).await
    }

    /// State of a scan session, if it is the current one.
    pub fn scan_state(&self, handle: ScanHandle) -> Option<ScanState> {
        self.scanner.state(handle)
    }

    /// Stream a scan session's advertisements.
    pub fn advertisements(&self, handle: ScanHandle) -> Result<AdvertisementStream> {
        self.scanner.subscribe(handle)
    }

    /// Latest advertisement of every peripheral seen by the current scan.
    pub fn discovered(&self) -> Vec<AdvertisementRecord> {
        self.scanner.discovered()
    }

    /// The strongest peripheral seen by the current scan.
    pub fn nearest(&self) -> Option<AdvertisementRecord> {
        self.scanner.nearest()
    }

    /// Check if scanning is active.
    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    /// Subscribe to connection state changes of every peripheral.
    pub fn subscribe_connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events_tx.subscribe()
    }

    /// Register a callback for connection state changes.
    pub fn on_connection_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(ConnectionEvent) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.events_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Connection event callback lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Get the number of live connections.
    pub fn connection_count(&self) -> usize {
        self.registry.read().len()
    }

    /// Addresses with a live connection.
    pub fn addresses(&self) -> Vec<PeripheralAddress> {
        let mut addresses: Vec<_> = self.registry.read().keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Clean shutdown of all connections and scanning.
    ///
    /// Afterwards `connect` and `start_scan` fail with `ManagerShutdown`.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Shutting down connection manager");

        self.scanner.stop_active().await;

        let handles: Vec<_> = self.registry.read().values().cloned().collect();
        for handle in &handles {
            handle.request_disconnect();
        }
        for handle in handles {
            let status = handle.closed().await;
            debug!("{} closed ({:?})", handle.address(), status.failure);
        }

        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::ManagerShutdown)
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.router.abort();
    }
}

/// Route gateway events to the scanner or the owning connection.
async fn route_events(
    mut events: GatewayEventReceiver,
    scanner: Arc<Scanner>,
    registry: Arc<Registry>,
) {
    while let Some(event) = events.recv().await {
        match event {
            GatewayEvent::Advertisement(record) => scanner.handle_advertisement(record),
            GatewayEvent::ScanFailed { code } => scanner.handle_failure(code),
            event => {
                let Some(address) = event.address() else {
                    continue;
                };
                let handle = registry.read().get(address).cloned();
                match handle {
                    Some(handle) => handle.post(event),
                    None => trace!("No connection for {}, dropping event", address),
                }
            }
        }
    }

    debug!("Gateway event channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::gateway::{event_channel, MockAdapterGateway};

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let mut gateway = MockAdapterGateway::new();
        gateway.expect_scan_stop().returning(|| Ok(()));
        let (_tx, rx) = event_channel();
        let manager = ConnectionManager::new(Arc::new(gateway), rx, ManagerConfig::default());

        manager.shutdown().await.unwrap();
        assert_eq!(
            manager.connect("AA:BB:CC:DD:EE:FF").await,
            Err(Error::ManagerShutdown)
        );
        assert_eq!(manager.start_scan(None).await, Err(Error::ManagerShutdown));
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_unknown_address_is_noop() {
        let gateway = MockAdapterGateway::new();
        let (_tx, rx) = event_channel();
        let manager = ConnectionManager::new(Arc::new(gateway), rx, ManagerConfig::default());

        assert!(manager.disconnect("AA:BB:CC:DD:EE:FF").await.is_ok());
        assert!(manager.handle(&"AA:BB:CC:DD:EE:FF".into()).is_none());
    }

    #[tokio::test]
    async fn test_callback_handle_unregisters() {
        let gateway = MockAdapterGateway::new();
        let (_tx, rx) = event_channel();
        let manager = ConnectionManager::new(Arc::new(gateway), rx, ManagerConfig::default());

        let callback = manager.on_connection_event(|_| {});
        let second = manager.on_connection_event(|_| {});
        assert_ne!(callback.id(), second.id());
        callback.unregister();
    }
}
