//! Shared fixtures: a scripted adapter gateway that records every call.

#![allow(dead_code)]

use async_trait::async_trait;
use ble_central::{
    event_channel, uuid_from_u16, AdapterGateway, CharacteristicProperties, ConnectionManager,
    GatewayError, GatewayEvent, GatewayEventSender, GatewayResult, LinkHandle, ManagerConfig,
    PeripheralAddress, RequestKind, ScanFilter, ServiceDescriptor, ServiceTable, WriteType,
    BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID,
    HEART_RATE_SERVICE_UUID,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

/// Heart Rate Control Point: write-only.
pub const CONTROL_POINT_UUID: Uuid = uuid_from_u16(0x2a39);

/// One recorded gateway call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ScanStart,
    ScanStop,
    Open(PeripheralAddress),
    Close(u64),
    Discover(u64),
    Read(Uuid),
    Write(Uuid, Vec<u8>, WriteType),
    SetNotify(Uuid, bool),
}

impl Call {
    /// Whether this is a GATT characteristic operation.
    pub fn is_gatt(&self) -> bool {
        matches!(self, Self::Read(_) | Self::Write(..) | Self::SetNotify(..))
    }
}

struct Script {
    /// Report links as established as soon as they are opened.
    auto_connect: bool,
    /// Fail link establishment with this code.
    connect_failure: Option<i32>,
    /// Refuse `gatt_open` outright with this code.
    open_refusal: Option<i32>,
    /// Fail service discovery with this code.
    discovery_failure: Option<i32>,
    /// Table reported by discovery.
    services: ServiceTable,
    /// Complete characteristic operations immediately.
    auto_respond: bool,
}

/// Gateway fake that records calls and emits scripted events.
pub struct FakeGateway {
    events: GatewayEventSender,
    script: Mutex<Script>,
    calls: Mutex<Vec<Call>>,
    links: Mutex<Vec<LinkHandle>>,
    open_links: Mutex<HashSet<u64>>,
    max_open_links: Mutex<usize>,
}

/// The peripheral every test talks to: heart rate, battery and a
/// write-only control point.
pub fn heart_rate_table() -> ServiceTable {
    ServiceTable::new()
        .with_service(
            ServiceDescriptor::new(HEART_RATE_SERVICE_UUID)
                .with_characteristic(HEART_RATE_MEASUREMENT_UUID, CharacteristicProperties::NOTIFY)
                .with_characteristic(CONTROL_POINT_UUID, CharacteristicProperties::WRITE),
        )
        .with_service(ServiceDescriptor::new(BATTERY_SERVICE_UUID).with_characteristic(
            BATTERY_LEVEL_UUID,
            CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
        ))
}

impl FakeGateway {
    fn new(events: GatewayEventSender) -> Self {
        Self {
            events,
            script: Mutex::new(Script {
                auto_connect: true,
                connect_failure: None,
                open_refusal: None,
                discovery_failure: None,
                services: heart_rate_table(),
                auto_respond: false,
            }),
            calls: Mutex::new(Vec::new()),
            links: Mutex::new(Vec::new()),
            open_links: Mutex::new(HashSet::new()),
            max_open_links: Mutex::new(0),
        }
    }

    pub fn set_auto_connect(&self, enabled: bool) {
        self.script.lock().auto_connect = enabled;
    }

    pub fn set_connect_failure(&self, code: Option<i32>) {
        self.script.lock().connect_failure = code;
    }

    pub fn set_open_refusal(&self, code: Option<i32>) {
        self.script.lock().open_refusal = code;
    }

    pub fn set_discovery_failure(&self, code: Option<i32>) {
        self.script.lock().discovery_failure = code;
    }

    pub fn set_auto_respond(&self, enabled: bool) {
        self.script.lock().auto_respond = enabled;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn gatt_calls(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_gatt).collect()
    }

    pub fn open_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Open(_)))
            .count()
    }

    pub fn close_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Close(_)))
            .count()
    }

    /// Most links open at the same time so far.
    pub fn max_open_links(&self) -> usize {
        *self.max_open_links.lock()
    }

    pub fn open_links(&self) -> usize {
        self.open_links.lock().len()
    }

    pub fn last_link(&self) -> Option<LinkHandle> {
        self.links.lock().last().cloned()
    }

    pub fn emit(&self, event: GatewayEvent) {
        let _ = self.events.send(event);
    }

    /// Report the last opened link as established.
    pub fn link_up(&self) {
        if let Some(link) = self.last_link() {
            self.emit(GatewayEvent::ConnectionStateChanged {
                link,
                connected: true,
                code: 0,
            });
        }
    }

    /// Report the last opened link as lost.
    pub fn link_lost(&self, code: i32) {
        if let Some(link) = self.last_link() {
            self.emit(GatewayEvent::ConnectionStateChanged {
                link,
                connected: false,
                code,
            });
        }
    }

    /// Complete the in-flight operation on the last opened link.
    pub fn complete(
        &self,
        kind: RequestKind,
        characteristic: Uuid,
        result: Result<Vec<u8>, i32>,
    ) {
        if let Some(link) = self.last_link() {
            self.emit(GatewayEvent::CharacteristicResult {
                link,
                characteristic,
                kind,
                result,
            });
        }
    }

    /// Push a notification on the last opened link.
    pub fn notify(&self, characteristic: Uuid, value: Vec<u8>) {
        if let Some(link) = self.last_link() {
            self.emit(GatewayEvent::CharacteristicChanged {
                link,
                characteristic,
                value,
            });
        }
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn respond(&self, link: &LinkHandle, characteristic: Uuid, kind: RequestKind) {
        if self.script.lock().auto_respond {
            let value = match kind {
                RequestKind::Read => vec![0x64],
                _ => Vec::new(),
            };
            self.emit(GatewayEvent::CharacteristicResult {
                link: link.clone(),
                characteristic,
                kind,
                result: Ok(value),
            });
        }
    }
}

#[async_trait]
impl AdapterGateway for FakeGateway {
    async fn scan_start(&self, _filter: &ScanFilter) -> GatewayResult<()> {
        self.record(Call::ScanStart);
        Ok(())
    }

    async fn scan_stop(&self) -> GatewayResult<()> {
        self.record(Call::ScanStop);
        Ok(())
    }

    async fn gatt_open(&self, address: &PeripheralAddress) -> GatewayResult<LinkHandle> {
        self.record(Call::Open(address.clone()));

        let (auto_connect, connect_failure, open_refusal) = {
            let script = self.script.lock();
            (script.auto_connect, script.connect_failure, script.open_refusal)
        };
        if let Some(code) = open_refusal {
            return Err(GatewayError::new(code, "open refused"));
        }

        let link = {
            let mut links = self.links.lock();
            let link = LinkHandle::new(links.len() as u64 + 1, address.clone());
            links.push(link.clone());
            link
        };

        {
            let mut open = self.open_links.lock();
            open.insert(link.id);
            let mut max = self.max_open_links.lock();
            *max = (*max).max(open.len());
        }

        if let Some(code) = connect_failure {
            self.emit(GatewayEvent::ConnectionStateChanged {
                link: link.clone(),
                connected: false,
                code,
            });
        } else if auto_connect {
            self.emit(GatewayEvent::ConnectionStateChanged {
                link: link.clone(),
                connected: true,
                code: 0,
            });
        }

        Ok(link)
    }

    async fn gatt_close(&self, link: &LinkHandle) -> GatewayResult<()> {
        self.record(Call::Close(link.id));
        self.open_links.lock().remove(&link.id);
        Ok(())
    }

    async fn discover_services(&self, link: &LinkHandle) -> GatewayResult<()> {
        self.record(Call::Discover(link.id));
        let result = {
            let script = self.script.lock();
            match script.discovery_failure {
                Some(code) => Err(code),
                None => Ok(script.services.clone()),
            }
        };
        self.emit(GatewayEvent::ServicesDiscovered {
            link: link.clone(),
            result,
        });
        Ok(())
    }

    async fn gatt_read(&self, link: &LinkHandle, characteristic: Uuid) -> GatewayResult<()> {
        self.record(Call::Read(characteristic));
        self.respond(link, characteristic, RequestKind::Read);
        Ok(())
    }

    async fn gatt_write(
        &self,
        link: &LinkHandle,
        characteristic: Uuid,
        value: Vec<u8>,
        write_type: WriteType,
    ) -> GatewayResult<()> {
        self.record(Call::Write(characteristic, value, write_type));
        self.respond(link, characteristic, RequestKind::Write);
        Ok(())
    }

    async fn gatt_set_notify(
        &self,
        link: &LinkHandle,
        characteristic: Uuid,
        enabled: bool,
    ) -> GatewayResult<()> {
        self.record(Call::SetNotify(characteristic, enabled));
        let kind = if enabled {
            RequestKind::Subscribe
        } else {
            RequestKind::Unsubscribe
        };
        self.respond(link, characteristic, kind);
        Ok(())
    }
}

/// Build a manager over a fresh fake gateway.
pub fn manager(config: ManagerConfig) -> (ConnectionManager, Arc<FakeGateway>) {
    let (tx, rx) = event_channel();
    let gateway = Arc::new(FakeGateway::new(tx));
    let manager = ConnectionManager::new(gateway.clone(), rx, config);
    (manager, gateway)
}

/// Yield until `condition` holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(60), async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition never became true");
}

/// Let routed events reach their connection.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// Route library logs to the test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn,ble_central=debug")
        .with_test_writer()
        .try_init();
}
