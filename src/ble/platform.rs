//! Adapter gateway backed by the host Bluetooth stack through btleplug.
//!
//! btleplug exposes awaitable operations, while the core expects operations
//! that only initiate work and report completion as events. Each call here
//! therefore spawns a task that performs the btleplug operation and posts the
//! outcome on the gateway event channel.

use async_trait::async_trait;
use btleplug::api::{
    CentralEvent, CharPropFlags, Characteristic, Central, Manager as _, Peripheral as _,
    PeripheralProperties, WriteType as BtleWriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::advertising::{
    push_ad_structure, AdvertisementRecord, ScanFilter, AD_TYPE_COMPLETE_128BIT_UUIDS,
    AD_TYPE_COMPLETE_16BIT_UUIDS, AD_TYPE_COMPLETE_LOCAL_NAME, AD_TYPE_MANUFACTURER_DATA,
};
use crate::ble::characteristics::{
    CharacteristicProperties, ServiceDescriptor, ServiceTable, WriteType,
};
use crate::ble::gateway::{
    event_channel, AdapterGateway, GatewayError, GatewayEvent, GatewayEventReceiver,
    GatewayEventSender, GatewayResult, RequestKind,
};
use crate::ble::peripheral::{LinkHandle, PeripheralAddress};
use crate::ble::uuids::short_uuid;
use crate::error::{Error, Result};

/// Platform code: the operation was not permitted.
pub const CODE_PERMISSION_DENIED: i32 = 1;
/// Platform code: the peripheral is unknown to the adapter.
pub const CODE_DEVICE_NOT_FOUND: i32 = 2;
/// Platform code: the peripheral is not connected.
pub const CODE_NOT_CONNECTED: i32 = 3;
/// Platform code: the characteristic does not exist on the link.
pub const CODE_NO_SUCH_CHARACTERISTIC: i32 = 4;
/// Platform code: the operation is not supported by the host stack.
pub const CODE_NOT_SUPPORTED: i32 = 5;
/// Platform code: the host stack timed out.
pub const CODE_TIMED_OUT: i32 = 6;
/// Platform code: the link handle is unknown or already closed.
pub const CODE_UNKNOWN_LINK: i32 = 7;
/// Platform code: any other host stack failure.
pub const CODE_OTHER: i32 = 255;

/// Map a btleplug error to its platform code.
pub fn error_code(error: &btleplug::Error) -> i32 {
    match error {
        btleplug::Error::PermissionDenied => CODE_PERMISSION_DENIED,
        btleplug::Error::DeviceNotFound => CODE_DEVICE_NOT_FOUND,
        btleplug::Error::NotConnected => CODE_NOT_CONNECTED,
        btleplug::Error::NoSuchCharacteristic => CODE_NO_SUCH_CHARACTERISTIC,
        btleplug::Error::NotSupported(_) => CODE_NOT_SUPPORTED,
        btleplug::Error::TimedOut(_) => CODE_TIMED_OUT,
        _ => CODE_OTHER,
    }
}

fn gateway_error(error: btleplug::Error) -> GatewayError {
    GatewayError::new(error_code(&error), error.to_string())
}

fn unknown_link(link: &LinkHandle) -> GatewayError {
    GatewayError::new(CODE_UNKNOWN_LINK, format!("unknown link {}", link))
}

/// One open GATT link.
struct Link {
    peripheral: Peripheral,
    /// Characteristics found by the last discovery.
    characteristics: HashMap<Uuid, Characteristic>,
    /// Notification forwarding task.
    notifications: Option<JoinHandle<()>>,
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(task) = self.notifications.take() {
            task.abort();
        }
    }
}

type Links = RwLock<HashMap<u64, (LinkHandle, Link)>>;

/// What a finished connect attempt means for its link.
#[derive(Debug, PartialEq, Eq)]
enum ConnectOutcome {
    /// Report the link up.
    Established,
    /// Report the link down with this code.
    Failed(i32),
    /// Connected, but nobody owns the link any more.
    Orphaned,
    /// Failed after the link was closed; nothing to report.
    Discarded,
}

fn connect_outcome(result: &btleplug::Result<()>, still_open: bool) -> ConnectOutcome {
    match (result, still_open) {
        (Ok(()), true) => ConnectOutcome::Established,
        (Ok(()), false) => ConnectOutcome::Orphaned,
        (Err(e), true) => ConnectOutcome::Failed(error_code(e)),
        (Err(_), false) => ConnectOutcome::Discarded,
    }
}

/// [`AdapterGateway`] over a btleplug adapter.
pub struct BtleplugGateway {
    /// The BLE adapter.
    adapter: Adapter,
    /// Gateway event channel.
    events: GatewayEventSender,
    /// Peripherals seen by the adapter, by address.
    peripherals: Arc<RwLock<HashMap<PeripheralAddress, Peripheral>>>,
    /// Open links by id.
    links: Arc<Links>,
    /// Link id counter.
    next_link: AtomicU64,
    /// Whether advertisements are forwarded.
    is_scanning: Arc<AtomicBool>,
    /// Adapter event processing task.
    central_task: JoinHandle<()>,
}

impl BtleplugGateway {
    /// Create a gateway over the host's first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns `BluetoothUnavailable` if there is no usable adapter.
    pub async fn new() -> Result<(Self, GatewayEventReceiver)> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager
            .adapters()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Self::with_adapter(adapter).await
    }

    /// Create a gateway over a specific adapter.
    ///
    /// # Errors
    ///
    /// Returns `BluetoothUnavailable` if the adapter's event stream cannot be
    /// opened.
    pub async fn with_adapter(adapter: Adapter) -> Result<(Self, GatewayEventReceiver)> {
        let (events, rx) = event_channel();
        let central_events = adapter.events().await.map_err(|e| {
            error!("Failed to get adapter events: {}", e);
            Error::BluetoothUnavailable
        })?;

        let peripherals = Arc::new(RwLock::new(HashMap::new()));
        let links: Arc<Links> = Arc::new(RwLock::new(HashMap::new()));
        let is_scanning = Arc::new(AtomicBool::new(false));

        let central_task = tokio::spawn(process_central_events(
            central_events,
            adapter.clone(),
            events.clone(),
            peripherals.clone(),
            links.clone(),
            is_scanning.clone(),
        ));

        let gateway = Self {
            adapter,
            events,
            peripherals,
            links,
            next_link: AtomicU64::new(1),
            is_scanning,
            central_task,
        };
        Ok((gateway, rx))
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn find_peripheral(&self, address: &PeripheralAddress) -> GatewayResult<Peripheral> {
        if let Some(peripheral) = self.peripherals.read().get(address).cloned() {
            return Ok(peripheral);
        }

        // Not seen during a scan; the adapter may still know it from earlier.
        for peripheral in self.adapter.peripherals().await.map_err(gateway_error)? {
            let properties = peripheral.properties().await.ok().flatten();
            if peripheral_address(&peripheral, properties.as_ref()) == *address {
                self.peripherals
                    .write()
                    .insert(address.clone(), peripheral.clone());
                return Ok(peripheral);
            }
        }

        Err(GatewayError::new(
            CODE_DEVICE_NOT_FOUND,
            format!("peripheral {} not found", address),
        ))
    }

    fn link_characteristic(
        &self,
        link: &LinkHandle,
        uuid: &Uuid,
    ) -> GatewayResult<(Peripheral, Characteristic)> {
        let links = self.links.read();
        let (_, entry) = links.get(&link.id).ok_or_else(|| unknown_link(link))?;
        let characteristic = entry.characteristics.get(uuid).cloned().ok_or_else(|| {
            GatewayError::new(
                CODE_NO_SUCH_CHARACTERISTIC,
                format!("characteristic {} not found", uuid),
            )
        })?;
        Ok((entry.peripheral.clone(), characteristic))
    }

    fn link_peripheral(&self, link: &LinkHandle) -> GatewayResult<Peripheral> {
        self.links
            .read()
            .get(&link.id)
            .map(|(_, entry)| entry.peripheral.clone())
            .ok_or_else(|| unknown_link(link))
    }

    /// Spawn a characteristic operation that reports a `CharacteristicResult`.
    fn spawn_characteristic_op<F>(&self, link: &LinkHandle, uuid: Uuid, kind: RequestKind, op: F)
    where
        F: std::future::Future<Output = btleplug::Result<Vec<u8>>> + Send + 'static,
    {
        let events = self.events.clone();
        let link = link.clone();

        tokio::spawn(async move {
            let result = op.await.map_err(|e| {
                debug!("{} of {} on {} failed: {}", kind, uuid, link, e);
                error_code(&e)
            });
            let _ = events.send(GatewayEvent::CharacteristicResult {
                link,
                characteristic: uuid,
                kind,
                result,
            });
        });
    }
}

impl Drop for BtleplugGateway {
    fn drop(&mut self) {
        self.is_scanning.store(false, Ordering::SeqCst);
        self.central_task.abort();
    }
}

#[async_trait]
impl AdapterGateway for BtleplugGateway {
    async fn scan_start(&self, filter: &ScanFilter) -> GatewayResult<()> {
        // Only the service filter is offloaded; the scan session applies the rest.
        let platform_filter = btleplug::api::ScanFilter {
            services: filter.services.iter().copied().collect(),
        };

        self.adapter
            .start_scan(platform_filter)
            .await
            .map_err(gateway_error)?;
        self.is_scanning.store(true, Ordering::SeqCst);

        debug!("Host scan started");
        Ok(())
    }

    async fn scan_stop(&self) -> GatewayResult<()> {
        self.is_scanning.store(false, Ordering::SeqCst);
        self.adapter.stop_scan().await.map_err(gateway_error)?;

        debug!("Host scan stopped");
        Ok(())
    }

    async fn gatt_open(&self, address: &PeripheralAddress) -> GatewayResult<LinkHandle> {
        let peripheral = self.find_peripheral(address).await?;
        let link = LinkHandle::new(
            self.next_link.fetch_add(1, Ordering::SeqCst),
            address.clone(),
        );

        self.links.write().insert(
            link.id,
            (
                link.clone(),
                Link {
                    peripheral: peripheral.clone(),
                    characteristics: HashMap::new(),
                    notifications: None,
                },
            ),
        );

        let events = self.events.clone();
        let links = self.links.clone();
        let opened = link.clone();
        tokio::spawn(async move {
            let result = match peripheral.is_connected().await {
                Ok(true) => {
                    debug!("{} already connected at BLE level", opened.address);
                    Ok(())
                }
                _ => peripheral.connect().await,
            };

            // The link may have been closed while the connect was pending.
            let still_open = links.read().contains_key(&opened.id);
            let (connected, code) = match connect_outcome(&result, still_open) {
                ConnectOutcome::Established => (true, 0),
                ConnectOutcome::Failed(code) => {
                    warn!("Connection to {} failed (code {})", opened.address, code);
                    (false, code)
                }
                ConnectOutcome::Orphaned => {
                    debug!("Link {} closed during connect, disconnecting", opened);
                    if let Err(e) = peripheral.disconnect().await {
                        warn!("Failed to disconnect {}: {}", opened.address, e);
                    }
                    return;
                }
                ConnectOutcome::Discarded => return,
            };
            let _ = events.send(GatewayEvent::ConnectionStateChanged {
                link: opened,
                connected,
                code,
            });
        });

        Ok(link)
    }

    async fn gatt_close(&self, link: &LinkHandle) -> GatewayResult<()> {
        let Some((_, entry)) = self.links.write().remove(&link.id) else {
            return Ok(());
        };

        let peripheral = entry.peripheral.clone();
        drop(entry);

        if peripheral.is_connected().await.unwrap_or(false) {
            peripheral.disconnect().await.map_err(gateway_error)?;
        }

        debug!("Closed link {}", link);
        Ok(())
    }

    async fn discover_services(&self, link: &LinkHandle) -> GatewayResult<()> {
        let peripheral = self.link_peripheral(link)?;
        let events = self.events.clone();
        let links = self.links.clone();
        let link = link.clone();

        tokio::spawn(async move {
            if let Err(e) = peripheral.discover_services().await {
                warn!("Service discovery on {} failed: {}", link, e);
                let _ = events.send(GatewayEvent::ServicesDiscovered {
                    link,
                    result: Err(error_code(&e)),
                });
                return;
            }

            let mut table = ServiceTable::new();
            let mut characteristics = HashMap::new();
            for service in peripheral.services() {
                let mut descriptor = ServiceDescriptor::new(service.uuid);
                for characteristic in service.characteristics {
                    trace!(
                        "Found characteristic: {} in service {}",
                        characteristic.uuid,
                        service.uuid
                    );
                    descriptor = descriptor.with_characteristic(
                        characteristic.uuid,
                        convert_properties(characteristic.properties),
                    );
                    characteristics.insert(characteristic.uuid, characteristic);
                }
                table.insert(descriptor);
            }

            let notifications = spawn_notification_forwarder(
                peripheral.clone(),
                link.clone(),
                events.clone(),
            );

            match links.write().get_mut(&link.id) {
                Some((_, entry)) => {
                    entry.characteristics = characteristics;
                    entry.notifications = Some(notifications);
                }
                None => {
                    // Closed while discovering.
                    notifications.abort();
                    return;
                }
            }

            let _ = events.send(GatewayEvent::ServicesDiscovered {
                link,
                result: Ok(table),
            });
        });

        Ok(())
    }

    async fn gatt_read(&self, link: &LinkHandle, characteristic: Uuid) -> GatewayResult<()> {
        let (peripheral, target) = self.link_characteristic(link, &characteristic)?;

        self.spawn_characteristic_op(link, characteristic, RequestKind::Read, async move {
            let value = peripheral.read(&target).await?;
            trace!("Read {} bytes from characteristic {}", value.len(), target.uuid);
            Ok(value)
        });
        Ok(())
    }

    async fn gatt_write(
        &self,
        link: &LinkHandle,
        characteristic: Uuid,
        value: Vec<u8>,
        write_type: WriteType,
    ) -> GatewayResult<()> {
        let (peripheral, target) = self.link_characteristic(link, &characteristic)?;
        let write_type = match write_type {
            WriteType::WithResponse => BtleWriteType::WithResponse,
            WriteType::WithoutResponse => BtleWriteType::WithoutResponse,
        };

        self.spawn_characteristic_op(link, characteristic, RequestKind::Write, async move {
            peripheral.write(&target, &value, write_type).await?;
            trace!("Wrote {} bytes to characteristic {}", value.len(), target.uuid);
            Ok(Vec::new())
        });
        Ok(())
    }

    async fn gatt_set_notify(
        &self,
        link: &LinkHandle,
        characteristic: Uuid,
        enabled: bool,
    ) -> GatewayResult<()> {
        let (peripheral, target) = self.link_characteristic(link, &characteristic)?;

        if enabled {
            self.spawn_characteristic_op(link, characteristic, RequestKind::Subscribe, async move {
                peripheral.subscribe(&target).await?;
                Ok(Vec::new())
            });
        } else {
            self.spawn_characteristic_op(
                link,
                characteristic,
                RequestKind::Unsubscribe,
                async move {
                    peripheral.unsubscribe(&target).await?;
                    Ok(Vec::new())
                },
            );
        }
        Ok(())
    }
}

/// Forward a peripheral's notifications as `CharacteristicChanged` events.
fn spawn_notification_forwarder(
    peripheral: Peripheral,
    link: LinkHandle,
    events: GatewayEventSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut notifications = match peripheral.notifications().await {
            Ok(n) => n,
            Err(e) => {
                error!("Failed to get notifications stream for {}: {}", link, e);
                return;
            }
        };

        while let Some(notification) = notifications.next().await {
            trace!(
                "Notification received from {}: {} bytes",
                notification.uuid,
                notification.value.len()
            );
            let event = GatewayEvent::CharacteristicChanged {
                link: link.clone(),
                characteristic: notification.uuid,
                value: notification.value,
            };
            if events.send(event).is_err() {
                break;
            }
        }

        debug!("Notification stream for {} ended", link);
    })
}

/// Process adapter events: advertisements while scanning, and link loss.
async fn process_central_events(
    mut central_events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    adapter: Adapter,
    events: GatewayEventSender,
    peripherals: Arc<RwLock<HashMap<PeripheralAddress, Peripheral>>>,
    links: Arc<Links>,
    is_scanning: Arc<AtomicBool>,
) {
    while let Some(event) = central_events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ManufacturerDataAdvertisement { id, .. }
            | CentralEvent::ServiceDataAdvertisement { id, .. }
            | CentralEvent::ServicesAdvertisement { id, .. } => {
                trace!("Device advertised: {:?}", id);
                if !is_scanning.load(Ordering::SeqCst) {
                    continue;
                }
                if let Some(record) = advertisement(&adapter, &id, &peripherals).await {
                    if events.send(GatewayEvent::Advertisement(record)).is_err() {
                        break;
                    }
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                debug!("Device disconnected: {:?}", id);
                let lost: Vec<LinkHandle> = links
                    .write()
                    .values_mut()
                    .filter(|(_, entry)| entry.peripheral.id() == id)
                    .map(|(handle, entry)| {
                        entry.characteristics.clear();
                        handle.clone()
                    })
                    .collect();

                for link in lost {
                    let _ = events.send(GatewayEvent::ConnectionStateChanged {
                        link,
                        connected: false,
                        code: CODE_NOT_CONNECTED,
                    });
                }
            }
            CentralEvent::DeviceConnected(id) => {
                debug!("Device connected: {:?}", id);
            }
            _ => {}
        }
    }

    debug!("Adapter event stream ended");
}

/// Build an advertisement record from a peripheral's latest properties.
async fn advertisement(
    adapter: &Adapter,
    id: &PeripheralId,
    peripherals: &RwLock<HashMap<PeripheralAddress, Peripheral>>,
) -> Option<AdvertisementRecord> {
    let peripheral = match adapter.peripheral(id).await {
        Ok(p) => p,
        Err(e) => {
            trace!("Failed to get peripheral: {}", e);
            return None;
        }
    };

    let properties = match peripheral.properties().await {
        Ok(Some(p)) => p,
        _ => return None,
    };

    let address = peripheral_address(&peripheral, Some(&properties));
    peripherals.write().insert(address.clone(), peripheral);

    let mut record = AdvertisementRecord::new(address, properties.rssi.unwrap_or(i16::MIN))
        .with_payload(encode_payload(&properties));
    if let Some(name) = &properties.local_name {
        record = record.with_name(name.clone());
    }
    for uuid in &properties.services {
        record = record.with_service(*uuid);
    }

    Some(record)
}

/// Stable address for a peripheral.
///
/// Hosts that hide the hardware address (macOS) report all zeroes; the
/// platform peripheral id stands in for it there.
fn peripheral_address(
    peripheral: &Peripheral,
    properties: Option<&PeripheralProperties>,
) -> PeripheralAddress {
    let address = properties
        .map(|p| p.address)
        .unwrap_or_else(|| peripheral.address());

    if address.into_inner() == [0u8; 6] {
        PeripheralAddress::new(peripheral.id().to_string())
    } else {
        PeripheralAddress::new(address.to_string())
    }
}

/// Rebuild the advertising payload from the fields the host stack parsed.
fn encode_payload(properties: &PeripheralProperties) -> Vec<u8> {
    let mut payload = Vec::new();

    if let Some(name) = &properties.local_name {
        push_ad_structure(&mut payload, AD_TYPE_COMPLETE_LOCAL_NAME, name.as_bytes());
    }

    let mut short = Vec::new();
    let mut long = Vec::new();
    for uuid in &properties.services {
        match short_uuid(uuid) {
            Some(value) => short.extend_from_slice(&value.to_le_bytes()),
            None => long.extend_from_slice(&uuid.as_u128().to_le_bytes()),
        }
    }
    if !short.is_empty() {
        push_ad_structure(&mut payload, AD_TYPE_COMPLETE_16BIT_UUIDS, &short);
    }
    if !long.is_empty() {
        push_ad_structure(&mut payload, AD_TYPE_COMPLETE_128BIT_UUIDS, &long);
    }

    let mut companies: Vec<_> = properties.manufacturer_data.iter().collect();
    companies.sort_by_key(|(company, _)| **company);
    for (company, data) in companies {
        let mut value = company.to_le_bytes().to_vec();
        value.extend_from_slice(data);
        push_ad_structure(&mut payload, AD_TYPE_MANUFACTURER_DATA, &value);
    }

    payload
}

fn convert_properties(flags: CharPropFlags) -> CharacteristicProperties {
    let mut properties = CharacteristicProperties::empty();
    for (flag, property) in [
        (CharPropFlags::READ, CharacteristicProperties::READ),
        (CharPropFlags::WRITE, CharacteristicProperties::WRITE),
        (
            CharPropFlags::WRITE_WITHOUT_RESPONSE,
            CharacteristicProperties::WRITE_NO_RESPONSE,
        ),
        (CharPropFlags::NOTIFY, CharacteristicProperties::NOTIFY),
        (CharPropFlags::INDICATE, CharacteristicProperties::INDICATE),
    ] {
        if flags.contains(flag) {
            properties |= property;
        }
    }
    properties
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::HEART_RATE_SERVICE_UUID;

    #[test]
    fn test_convert_properties() {
        let properties = convert_properties(CharPropFlags::READ | CharPropFlags::NOTIFY);
        assert!(properties.can_read());
        assert!(properties.can_subscribe());
        assert!(!properties.can_write());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(error_code(&btleplug::Error::NotConnected), CODE_NOT_CONNECTED);
        assert_eq!(
            error_code(&btleplug::Error::RuntimeError("boom".to_string())),
            CODE_OTHER
        );
    }

    #[test]
    fn test_connect_outcome_after_close() {
        assert_eq!(connect_outcome(&Ok(()), true), ConnectOutcome::Established);
        assert_eq!(
            connect_outcome(&Err(btleplug::Error::DeviceNotFound), true),
            ConnectOutcome::Failed(CODE_DEVICE_NOT_FOUND)
        );

        // A connect that lands after gatt_close must be torn down, not reported.
        assert_eq!(connect_outcome(&Ok(()), false), ConnectOutcome::Orphaned);
        assert_eq!(
            connect_outcome(&Err(btleplug::Error::NotConnected), false),
            ConnectOutcome::Discarded
        );
    }

    #[test]
    fn test_encode_payload() {
        let mut properties = PeripheralProperties::default();
        properties.local_name = Some("HRM".to_string());
        properties.services = vec![HEART_RATE_SERVICE_UUID];
        properties.manufacturer_data.insert(0x004c, vec![0x02, 0x15]);

        let payload = encode_payload(&properties);
        let record = AdvertisementRecord::new("AA:BB:CC:DD:EE:FF".into(), -60)
            .with_payload(payload);

        assert_eq!(record.payload_local_name().as_deref(), Some("HRM"));
        assert_eq!(
            record.manufacturer_data().get(&0x004c),
            Some(&vec![0x02, 0x15])
        );
        let types: Vec<u8> = record
            .ad_structures()
            .map(|s| s.unwrap().ad_type)
            .collect();
        assert_eq!(
            types,
            vec![
                AD_TYPE_COMPLETE_LOCAL_NAME,
                AD_TYPE_COMPLETE_16BIT_UUIDS,
                AD_TYPE_MANUFACTURER_DATA
            ]
        );
    }
}
