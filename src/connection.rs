//! Per-peripheral connection actor and the handle applications hold.
//!
//! Each connection record is owned by one tokio task. Commands from
//! [`ConnectionHandle`]s and gateway events routed by the manager arrive on
//! the same mailbox, so state transitions and queue dispatch for one
//! peripheral are strictly serialized while different peripherals proceed
//! independently.

use futures::Stream;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::characteristics::{
    CharacteristicDescriptor, CharacteristicProperties, ServiceDescriptor, ServiceTable, WriteType,
};
use crate::ble::connection::{
    Action, ConnectionEvent, ConnectionState, Input, ReconnectPolicy, StateMachine,
};
use crate::ble::gateway::{AdapterGateway, GatewayEvent, RequestKind};
use crate::ble::peripheral::{LinkHandle, PeripheralAddress};
use crate::ble::queue::{GattQueue, GattRequest, NotificationSender};
use crate::ble::scanner::Scanner;
use crate::config::ManagerConfig;
use crate::error::{Error, Result};

/// Address → live connection map shared by the manager and its actors.
pub(crate) type Registry = RwLock<HashMap<PeripheralAddress, ConnectionHandle>>;

/// Snapshot of a connection's state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    /// Current state.
    pub state: ConnectionState,
    /// Why the connection ended, once `Disconnected`.
    pub failure: Option<Error>,
}

/// Stream of values pushed by one subscribed characteristic.
///
/// Values arrive in the order the peripheral sent them. The stream ends when
/// the characteristic is unsubscribed or the link goes down.
#[derive(Debug)]
pub struct NotificationStream {
    characteristic: Uuid,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl NotificationStream {
    /// The subscribed characteristic.
    pub fn characteristic(&self) -> Uuid {
        self.characteristic
    }

    /// Receive the next value.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

impl Stream for NotificationStream {
    type Item = Vec<u8>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Mailbox message of a connection actor.
#[derive(Debug)]
pub(crate) enum Message {
    /// Queue a GATT request.
    Submit(GattRequest),
    /// Close the connection.
    Disconnect,
    /// Snapshot the service table.
    Services(oneshot::Sender<Result<ServiceTable>>),
    /// An event from the gateway for this peripheral.
    Gateway(GatewayEvent),
}

/// Handle to one peripheral's connection.
///
/// Cheap to clone; every clone talks to the same connection record. Two
/// handles compare equal when they refer to the same record.
#[derive(Clone)]
pub struct ConnectionHandle {
    address: PeripheralAddress,
    id: u64,
    mailbox: mpsc::UnboundedSender<Message>,
    status: watch::Receiver<ConnectionStatus>,
    request_timeout: Duration,
}

impl ConnectionHandle {
    /// The peripheral.
    pub fn address(&self) -> &PeripheralAddress {
        &self.address
    }

    /// Record id, unique within the manager.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// Current state and failure reason.
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Check if GATT operations are accepted.
    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Watch state changes.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Wait until the connection is `Ready`.
    ///
    /// # Errors
    ///
    /// Returns the reason the connection ended if it reaches `Disconnected`
    /// first (`ConnectError`, `DiscoveryError`, `Timeout`, `Cancelled`, ...).
    pub async fn wait_ready(&self) -> Result<()> {
        let status = self
            .wait_for(|s| s.state.is_ready() || s.state.is_terminal())
            .await;

        if status.state.is_ready() {
            Ok(())
        } else {
            Err(status.failure.unwrap_or(Error::Cancelled))
        }
    }

    /// Wait until the connection reaches `Disconnected`.
    pub async fn closed(&self) -> ConnectionStatus {
        self.wait_for(|s| s.state.is_terminal()).await
    }

    async fn wait_for(&self, predicate: impl FnMut(&ConnectionStatus) -> bool) -> ConnectionStatus {
        let mut rx = self.status.clone();
        let result = rx.wait_for(predicate).await.map(|s| s.clone());
        // The actor publishes its final status before dropping the sender.
        result.unwrap_or_else(|_| rx.borrow().clone())
    }

    /// Read a characteristic.
    pub async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        self.read_with_timeout(characteristic, self.request_timeout)
            .await
    }

    /// Read a characteristic with a specific deadline.
    pub async fn read_with_timeout(&self, characteristic: Uuid, timeout: Duration) -> Result<Vec<u8>> {
        let (request, rx) = self.request(RequestKind::Read, characteristic, timeout)?;
        self.submit(request, rx).await
    }

    /// Write a characteristic, acknowledged if the characteristic supports it.
    pub async fn write(&self, characteristic: Uuid, value: impl Into<Vec<u8>>) -> Result<()> {
        self.write_with_type(characteristic, value.into(), None)
            .await
    }

    /// Write a characteristic as an unacknowledged write command.
    pub async fn write_without_response(
        &self,
        characteristic: Uuid,
        value: impl Into<Vec<u8>>,
    ) -> Result<()> {
        self.write_with_type(characteristic, value.into(), Some(WriteType::WithoutResponse))
            .await
    }

    async fn write_with_type(
        &self,
        characteristic: Uuid,
        value: Vec<u8>,
        write_type: Option<WriteType>,
    ) -> Result<()> {
        let (request, rx) = self.request(RequestKind::Write, characteristic, self.request_timeout)?;
        self.submit(request.with_payload(value, write_type), rx)
            .await
            .map(|_| ())
    }

    /// Enable notifications (or indications) and stream the pushed values.
    pub async fn subscribe(&self, characteristic: Uuid) -> Result<NotificationStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (request, result_rx) =
            self.request(RequestKind::Subscribe, characteristic, self.request_timeout)?;
        self.submit(request.with_listener(tx), result_rx).await?;

        Ok(NotificationStream { characteristic, rx })
    }

    /// Disable notifications. Every stream for the characteristic ends.
    pub async fn unsubscribe(&self, characteristic: Uuid) -> Result<()> {
        let (request, rx) =
            self.request(RequestKind::Unsubscribe, characteristic, self.request_timeout)?;
        self.submit(request, rx).await.map(|_| ())
    }

    /// The discovered service table.
    pub async fn services(&self) -> Result<ServiceTable> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(Message::Services(tx))
            .map_err(|_| Error::NotReady)?;
        rx.await.unwrap_or(Err(Error::NotReady))
    }

    /// Look up a discovered service.
    pub async fn service(&self, uuid: Uuid) -> Result<ServiceDescriptor> {
        self.services().await?.service(&uuid).cloned()
    }

    /// Look up a discovered characteristic, including its cached value.
    pub async fn characteristic(&self, uuid: Uuid) -> Result<CharacteristicDescriptor> {
        self.services().await?.characteristic(&uuid).cloned()
    }

    /// Ask the actor to disconnect without waiting.
    pub(crate) fn request_disconnect(&self) {
        let _ = self.mailbox.send(Message::Disconnect);
    }

    /// Post a gateway event to the actor.
    pub(crate) fn post(&self, event: GatewayEvent) {
        if self.mailbox.send(Message::Gateway(event)).is_err() {
            trace!("Dropping event for finished connection {}", self.address);
        }
    }

    fn request(
        &self,
        kind: RequestKind,
        characteristic: Uuid,
        timeout: Duration,
    ) -> Result<(GattRequest, crate::ble::queue::ResultReceiver)> {
        if !self.is_ready() {
            debug!("{} of {} rejected: {} not ready", kind, characteristic, self.address);
            return Err(Error::NotReady);
        }
        Ok(GattRequest::new(kind, characteristic, Instant::now() + timeout))
    }

    async fn submit(
        &self,
        request: GattRequest,
        rx: crate::ble::queue::ResultReceiver,
    ) -> Result<Vec<u8>> {
        self.mailbox
            .send(Message::Submit(request))
            .map_err(|_| Error::NotReady)?;
        rx.await.unwrap_or(Err(Error::NotReady))
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.address == other.address
    }
}

impl Eq for ConnectionHandle {}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("address", &self.address)
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Shared collaborators handed to every connection actor.
#[derive(Clone)]
pub(crate) struct ActorContext {
    pub gateway: Arc<dyn AdapterGateway>,
    pub scanner: Arc<Scanner>,
    pub config: ManagerConfig,
    pub events: broadcast::Sender<ConnectionEvent>,
    pub registry: Weak<Registry>,
}

/// Create a connection record for `address` and start its actor.
///
/// The actor immediately feeds `Connect` into its state machine.
pub(crate) fn spawn(address: PeripheralAddress, id: u64, ctx: ActorContext) -> ConnectionHandle {
    let (mailbox, inbox) = mpsc::unbounded_channel();
    let (status_tx, status) = watch::channel(ConnectionStatus::default());

    let handle = ConnectionHandle {
        address: address.clone(),
        id,
        mailbox,
        status,
        request_timeout: ctx.config.request_timeout,
    };

    let actor = ConnectionActor {
        address,
        id,
        machine: StateMachine::new(ReconnectPolicy::from(&ctx.config)),
        link: None,
        services: ServiceTable::new(),
        queue: GattQueue::new(),
        subscriptions: HashMap::new(),
        inbox,
        status_tx,
        connect_deadline: None,
        reconnect_at: None,
        ctx,
    };
    tokio::spawn(actor.run());

    handle
}

struct ConnectionActor {
    address: PeripheralAddress,
    id: u64,
    machine: StateMachine,
    /// The current GATT link; exclusively owned by this actor.
    link: Option<LinkHandle>,
    services: ServiceTable,
    queue: GattQueue,
    subscriptions: HashMap<Uuid, Vec<NotificationSender>>,
    inbox: mpsc::UnboundedReceiver<Message>,
    status_tx: watch::Sender<ConnectionStatus>,
    connect_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
    ctx: ActorContext,
}

impl ConnectionActor {
    async fn run(mut self) {
        debug!("Connection actor for {} started", self.address);
        self.apply(Input::Connect).await;

        while !self.machine.state().is_terminal() {
            let timer = self.next_timer();
            let sleep = async {
                match timer {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                message = self.inbox.recv() => match message {
                    Some(message) => self.handle_message(message).await,
                    None => {
                        debug!("All handles to {} dropped, disconnecting", self.address);
                        self.apply(Input::Disconnect).await;
                    }
                },
                _ = sleep => self.handle_timers().await,
            }
        }

        self.finish();
    }

    async fn handle_message(&mut self, message: Message) {
        match message {
            Message::Submit(request) => self.admit(request).await,
            Message::Disconnect => {
                info!("Disconnecting from {}", self.address);
                self.apply(Input::Disconnect).await;
            }
            Message::Services(reply) => {
                let result = if self.machine.state().is_ready() {
                    Ok(self.services.clone())
                } else {
                    Err(Error::NotReady)
                };
                let _ = reply.send(result);
            }
            Message::Gateway(event) => self.handle_event(event).await,
        }
    }

    /// Validate a request against the state and the service table, then queue it.
    async fn admit(&mut self, mut request: GattRequest) {
        match self.check(&request) {
            Ok(write_type) => {
                if request.kind == RequestKind::Write {
                    request.write_type = write_type;
                }
                self.queue.enqueue(request);
                self.pump().await;
            }
            Err(e) => {
                debug!(
                    "{} of {} on {} rejected: {}",
                    request.kind, request.characteristic, self.address, e
                );
                request.resolve(Err(e));
            }
        }
    }

    fn check(&self, request: &GattRequest) -> Result<Option<WriteType>> {
        if !self.machine.state().is_ready() {
            return Err(Error::NotReady);
        }

        let characteristic = self.services.characteristic(&request.characteristic)?;
        let properties = characteristic.properties;
        let unsupported = |what: &str| Error::NotSupported {
            operation: format!("{} of {}", what, request.characteristic),
        };

        match request.kind {
            RequestKind::Read if !properties.can_read() => Err(unsupported("read")),
            RequestKind::Read => Ok(None),
            RequestKind::Write => match request.write_type {
                Some(WriteType::WithoutResponse)
                    if !properties.contains(CharacteristicProperties::WRITE_NO_RESPONSE) =>
                {
                    Err(unsupported("write without response"))
                }
                Some(WriteType::WithResponse)
                    if !properties.contains(CharacteristicProperties::WRITE) =>
                {
                    Err(unsupported("write"))
                }
                Some(write_type) => Ok(Some(write_type)),
                None => characteristic
                    .preferred_write_type()
                    .map(Some)
                    .ok_or_else(|| unsupported("write")),
            },
            RequestKind::Subscribe | RequestKind::Unsubscribe if !properties.can_subscribe() => {
                Err(unsupported("notifications"))
            }
            RequestKind::Subscribe | RequestKind::Unsubscribe => Ok(None),
        }
    }

    /// Dispatch queued requests while the link is idle.
    async fn pump(&mut self) {
        while self.machine.state().is_ready() {
            let Some(link) = self.link.clone() else {
                break;
            };
            let Some(dispatch) = self.queue.dispatch_next(Instant::now()) else {
                break;
            };

            trace!(
                "Dispatching {} of {} on {}",
                dispatch.kind,
                dispatch.characteristic,
                link
            );

            let gateway = &self.ctx.gateway;
            let result = match dispatch.kind {
                RequestKind::Read => gateway.gatt_read(&link, dispatch.characteristic).await,
                RequestKind::Write => {
                    gateway
                        .gatt_write(
                            &link,
                            dispatch.characteristic,
                            dispatch.payload.unwrap_or_default(),
                            dispatch.write_type,
                        )
                        .await
                }
                RequestKind::Subscribe => {
                    gateway
                        .gatt_set_notify(&link, dispatch.characteristic, true)
                        .await
                }
                RequestKind::Unsubscribe => {
                    gateway
                        .gatt_set_notify(&link, dispatch.characteristic, false)
                        .await
                }
            };

            match result {
                Ok(()) => break,
                Err(e) => {
                    warn!("Gateway refused {} on {}: {}", dispatch.kind, link, e);
                    self.queue.fail_in_flight(Error::GattError { code: e.code });
                }
            }
        }
    }

    async fn handle_event(&mut self, event: GatewayEvent) {
        let link = match &event {
            GatewayEvent::ConnectionStateChanged { link, .. }
            | GatewayEvent::ServicesDiscovered { link, .. }
            | GatewayEvent::CharacteristicResult { link, .. }
            | GatewayEvent::CharacteristicChanged { link, .. } => link,
            GatewayEvent::Advertisement(_) | GatewayEvent::ScanFailed { .. } => return,
        };

        if self.link.as_ref() != Some(link) {
            trace!("Ignoring event for stale link {}", link);
            return;
        }

        match event {
            GatewayEvent::ConnectionStateChanged {
                connected: true, ..
            } => {
                info!("Link to {} established", self.address);
                self.apply(Input::LinkEstablished).await;
            }
            GatewayEvent::ConnectionStateChanged {
                connected: false,
                code,
                ..
            } => {
                if self.machine.state().is_ready() {
                    warn!("Link to {} lost (code {})", self.address, code);
                }
                self.apply(Input::LinkDown { code }).await;
            }
            GatewayEvent::ServicesDiscovered { result, .. } => match result {
                Ok(table) => {
                    if self.machine.state() == ConnectionState::DiscoveringServices {
                        debug!(
                            "Discovered {} services ({} characteristics) on {}",
                            table.len(),
                            table.characteristic_count(),
                            self.address
                        );
                        self.services = table;
                    }
                    self.apply(Input::ServicesFound).await;
                }
                Err(code) => {
                    warn!("Service discovery on {} failed (code {})", self.address, code);
                    self.apply(Input::DiscoveryFailed { code }).await;
                }
            },
            GatewayEvent::CharacteristicResult {
                characteristic,
                kind,
                result,
                ..
            } => self.complete(kind, characteristic, result).await,
            GatewayEvent::CharacteristicChanged {
                characteristic,
                value,
                ..
            } => self.notify(characteristic, value),
            GatewayEvent::Advertisement(_) | GatewayEvent::ScanFailed { .. } => {}
        }
    }

    async fn complete(
        &mut self,
        kind: RequestKind,
        characteristic: Uuid,
        result: std::result::Result<Vec<u8>, i32>,
    ) {
        let Some(mut request) = self.queue.complete(kind, &characteristic) else {
            debug!(
                "Unmatched {} completion for {} on {}",
                kind, characteristic, self.address
            );
            return;
        };

        match result {
            Ok(value) => {
                match kind {
                    RequestKind::Read => {
                        self.services.update_value(&characteristic, &value);
                    }
                    RequestKind::Subscribe => {
                        if let Some(listener) = request.take_listener() {
                            self.subscriptions
                                .entry(characteristic)
                                .or_default()
                                .push(listener);
                        }
                        debug!("Subscribed to {} on {}", characteristic, self.address);
                    }
                    RequestKind::Unsubscribe => {
                        self.subscriptions.remove(&characteristic);
                        debug!("Unsubscribed from {} on {}", characteristic, self.address);
                    }
                    RequestKind::Write => {}
                }
                request.resolve(Ok(value));
            }
            Err(code) => {
                debug!(
                    "{} of {} on {} failed (code {})",
                    kind, characteristic, self.address, code
                );
                request.resolve(Err(Error::GattError { code }));
            }
        }

        self.pump().await;
    }

    fn notify(&mut self, characteristic: Uuid, value: Vec<u8>) {
        trace!(
            "Notification from {} on {}: {} bytes",
            characteristic,
            self.address,
            value.len()
        );
        self.services.update_value(&characteristic, &value);

        if let Some(listeners) = self.subscriptions.get_mut(&characteristic) {
            listeners.retain(|tx| tx.send(value.clone()).is_ok());
        }
    }

    async fn handle_timers(&mut self) {
        let now = Instant::now();

        if self.reconnect_at.map(|at| at <= now).unwrap_or(false) {
            self.reconnect_at = None;
            info!(
                "Reconnecting to {} (attempt {})",
                self.address,
                self.machine.attempt()
            );
            self.apply(Input::ReconnectDue).await;
        }

        if self.connect_deadline.map(|at| at <= now).unwrap_or(false) {
            self.connect_deadline = None;
            warn!("Connect to {} timed out", self.address);
            self.apply(Input::ConnectTimeout).await;
        }

        if self.queue.expire(now) > 0 {
            self.pump().await;
        }
    }

    fn next_timer(&self) -> Option<Instant> {
        [
            self.reconnect_at,
            self.connect_deadline,
            self.queue.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Feed an input to the state machine and carry out the resulting actions,
    /// including any inputs those actions produce.
    async fn apply(&mut self, input: Input) {
        let mut inputs = VecDeque::from([input]);

        while let Some(input) = inputs.pop_front() {
            let before = self.machine.state();
            for action in self.machine.handle(input) {
                if let Some(follow_up) = self.perform(action).await {
                    inputs.push_back(follow_up);
                }
            }

            let state = self.machine.state();
            if !matches!(
                state,
                ConnectionState::Connecting | ConnectionState::DiscoveringServices
            ) {
                self.connect_deadline = None;
            }
            if state != ConnectionState::Reconnecting {
                self.reconnect_at = None;
            }

            if state != before {
                self.publish();
            }
        }
    }

    async fn perform(&mut self, action: Action) -> Option<Input> {
        match action {
            Action::StopScan => {
                if self.ctx.scanner.stop_active().await {
                    debug!("Stopped scan before connecting to {}", self.address);
                }
                None
            }
            Action::OpenLink => match self.ctx.gateway.gatt_open(&self.address).await {
                Ok(link) => {
                    debug!("Opening link {}", link);
                    self.link = Some(link);
                    None
                }
                Err(e) => {
                    warn!("Failed to open link to {}: {}", self.address, e);
                    Some(Input::LinkDown { code: e.code })
                }
            },
            Action::ArmConnectTimer => {
                self.connect_deadline = Some(Instant::now() + self.ctx.config.connect_timeout);
                None
            }
            Action::DiscoverServices => {
                let link = self.link.clone()?;
                match self.ctx.gateway.discover_services(&link).await {
                    Ok(()) => None,
                    Err(e) => Some(Input::DiscoveryFailed { code: e.code }),
                }
            }
            Action::CloseLink => {
                if let Some(link) = self.link.take() {
                    debug!("Closing link {}", link);
                    if let Err(e) = self.ctx.gateway.gatt_close(&link).await {
                        warn!("Failed to close link {}: {}", link, e);
                    }
                }
                Some(Input::Closed)
            }
            Action::FailPending(error) => {
                let failed = self.queue.fail_all(error.clone());
                if failed > 0 {
                    debug!(
                        "Failed {} pending requests on {} with {}",
                        failed, self.address, error
                    );
                }
                None
            }
            Action::DropSubscriptions => {
                self.subscriptions.clear();
                None
            }
            Action::ScheduleReconnect { attempt, delay } => {
                info!(
                    "Scheduling reconnect to {} (attempt {}) in {:?}",
                    self.address, attempt, delay
                );
                self.reconnect_at = Some(Instant::now() + delay);
                None
            }
        }
    }

    fn publish(&self) {
        let state = self.machine.state();
        info!("{} is now {}", self.address, state);

        self.status_tx.send_replace(ConnectionStatus {
            state,
            failure: self.machine.failure().cloned(),
        });
        let _ = self.ctx.events.send(ConnectionEvent {
            address: self.address.clone(),
            state,
        });
    }

    fn finish(mut self) {
        let failure = self.machine.failure().cloned().unwrap_or(Error::Cancelled);
        self.queue.fail_all(failure);
        self.subscriptions.clear();

        // Anything still in the mailbox arrived after the connection ended.
        self.inbox.close();
        while let Ok(message) = self.inbox.try_recv() {
            match message {
                Message::Submit(request) => request.resolve(Err(Error::NotReady)),
                Message::Services(reply) => {
                    let _ = reply.send(Err(Error::NotReady));
                }
                Message::Disconnect | Message::Gateway(_) => {}
            }
        }

        if let Some(registry) = self.ctx.registry.upgrade() {
            let mut registry = registry.write();
            if registry.get(&self.address).map(|h| h.id) == Some(self.id) {
                registry.remove(&self.address);
            }
        }

        debug!("Connection actor for {} finished", self.address);
    }
}
