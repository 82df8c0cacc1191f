//! Scan sessions.
//!
//! The radio runs at most one scan at a time. A [`ScanSession`] tracks the
//! advertisements observed during one scan, applies its [`ScanFilter`] and
//! duplicate policy, and fans matching records out to subscribers.

use futures::Stream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::ble::advertising::{AdvertisementRecord, DuplicatePolicy, ScanFilter};
use crate::ble::gateway::AdapterGateway;
use crate::ble::peripheral::PeripheralAddress;
use crate::error::{Error, Result};

/// Identifies one scan session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanHandle(u64);

impl ScanHandle {
    /// The session id.
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Lifecycle of a scan session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanState {
    /// Reporting advertisements.
    Active,
    /// Stopped by the application (or superseded by a connect).
    Stopped,
    /// Aborted by the radio. Terminal.
    Failed {
        /// Platform error code.
        code: i32,
    },
}

/// Stream of advertisements from one scan session.
///
/// Ends when the session stops. If the radio aborts the scan, the stream
/// yields one `Err(ScanFailed)` and then ends.
#[derive(Debug)]
pub struct AdvertisementStream {
    rx: mpsc::UnboundedReceiver<Result<AdvertisementRecord>>,
}

impl AdvertisementStream {
    /// Receive the next advertisement.
    pub async fn recv(&mut self) -> Option<Result<AdvertisementRecord>> {
        self.rx.recv().await
    }
}

impl Stream for AdvertisementStream {
    type Item = Result<AdvertisementRecord>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// One scan session.
#[derive(Debug)]
pub struct ScanSession {
    handle: ScanHandle,
    filter: ScanFilter,
    state: ScanState,
    seen: HashMap<PeripheralAddress, AdvertisementRecord>,
    /// Addresses in the order they were first seen.
    order: Vec<PeripheralAddress>,
    subscribers: Vec<mpsc::UnboundedSender<Result<AdvertisementRecord>>>,
}

impl ScanSession {
    /// Create an active session.
    pub fn new(handle: ScanHandle, filter: ScanFilter) -> Self {
        Self {
            handle,
            filter,
            state: ScanState::Active,
            seen: HashMap::new(),
            order: Vec::new(),
            subscribers: Vec::new(),
        }
    }

    /// The session handle.
    pub fn handle(&self) -> ScanHandle {
        self.handle
    }

    /// The session filter.
    pub fn filter(&self) -> &ScanFilter {
        &self.filter
    }

    /// Current state.
    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Check if the session is reporting.
    pub fn is_active(&self) -> bool {
        self.state == ScanState::Active
    }

    /// Subscribe to this session's advertisements.
    ///
    /// A subscriber joining an active session first receives the latest
    /// record of every peripheral already seen, in first-seen order.
    /// Subscribing to a session that already ended returns a stream that
    /// ends immediately (after the failure, for a failed session).
    pub fn subscribe(&mut self) -> AdvertisementStream {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.state {
            ScanState::Active => {
                for record in self.order.iter().filter_map(|a| self.seen.get(a)) {
                    let _ = tx.send(Ok(record.clone()));
                }
                self.subscribers.push(tx);
            }
            ScanState::Failed { code } => {
                let _ = tx.send(Err(Error::ScanFailed { code }));
            }
            ScanState::Stopped => {}
        }
        AdvertisementStream { rx }
    }

    /// Process an advertisement. Returns true if it was reported.
    pub fn on_advertisement(&mut self, record: AdvertisementRecord) -> bool {
        if !self.is_active() || !self.filter.matches(&record) {
            return false;
        }

        let first_seen = self
            .seen
            .insert(record.address.clone(), record.clone())
            .is_none();

        if !first_seen && self.filter.duplicates == DuplicatePolicy::FirstSeen {
            trace!("Suppressing duplicate advertisement from {}", record.address);
            return false;
        }

        if first_seen {
            self.order.push(record.address.clone());
            debug!(
                "Discovered {} ({:?}, {} dBm)",
                record.address, record.name, record.rssi
            );
        }

        self.subscribers
            .retain(|tx| tx.send(Ok(record.clone())).is_ok());
        true
    }

    /// Stop reporting; every subscriber stream ends.
    pub fn stop(&mut self) {
        if self.is_active() {
            self.state = ScanState::Stopped;
            self.subscribers.clear();
        }
    }

    /// Enter the terminal failed state, surfacing the code to subscribers.
    pub fn fail(&mut self, code: i32) {
        if !self.is_active() {
            return;
        }
        self.state = ScanState::Failed { code };
        for tx in self.subscribers.drain(..) {
            let _ = tx.send(Err(Error::ScanFailed { code }));
        }
    }

    /// Latest record of every peripheral seen in this session, in
    /// first-seen order.
    pub fn discovered(&self) -> Vec<AdvertisementRecord> {
        self.order
            .iter()
            .filter_map(|a| self.seen.get(a))
            .cloned()
            .collect()
    }

    /// The peripheral with the strongest latest signal.
    pub fn nearest(&self) -> Option<AdvertisementRecord> {
        self.seen.values().max_by_key(|r| r.rssi).cloned()
    }
}

/// Owner of the radio's (single) scan session.
pub struct Scanner {
    gateway: Arc<dyn AdapterGateway>,
    session: Mutex<Option<ScanSession>>,
    next_id: AtomicU64,
}

impl Scanner {
    /// Create a scanner over a gateway.
    pub fn new(gateway: Arc<dyn AdapterGateway>) -> Self {
        Self {
            gateway,
            session: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start scanning with `filter`.
    ///
    /// If a session with an equal filter is already active its handle is
    /// returned and the radio is left alone. A session with a different
    /// filter is stopped first.
    ///
    /// # Errors
    ///
    /// Returns `ScanFailed` with the platform code if the radio refuses.
    pub async fn start(&self, filter: ScanFilter) -> Result<ScanHandle> {
        let (handle, previous) = {
            let mut session = self.session.lock();
            if let Some(existing) = session.as_ref() {
                if existing.is_active() && existing.filter == filter {
                    debug!("Already scanning with this filter, ignoring start request");
                    return Ok(existing.handle);
                }
            }

            let handle = ScanHandle(self.next_id.fetch_add(1, Ordering::SeqCst));
            let previous = session.replace(ScanSession::new(handle, filter.clone()));
            (handle, previous)
        };

        if let Some(mut previous) = previous {
            if previous.is_active() {
                info!("Replacing scan session {}", previous.handle.id());
                previous.stop();
                if let Err(e) = self.gateway.scan_stop().await {
                    warn!("Failed to stop previous scan: {}", e);
                }
            }
        }

        info!("Starting BLE scan (session {})", handle.id());

        if let Err(e) = self.gateway.scan_start(&filter).await {
            warn!("Scan start failed: {}", e);
            if let Some(session) = self.session.lock().as_mut() {
                if session.handle == handle {
                    session.fail(e.code);
                }
            }
            return Err(Error::ScanFailed { code: e.code });
        }

        Ok(handle)
    }

    /// Stop a scan session. Stopping an ended or unknown session is a no-op.
    pub async fn stop(&self, handle: ScanHandle) -> Result<()> {
        let stopped = {
            let mut session = self.session.lock();
            match session.as_mut() {
                Some(s) if s.handle == handle && s.is_active() => {
                    s.stop();
                    true
                }
                _ => false,
            }
        };

        if !stopped {
            debug!("Scan session {} not active, ignoring stop request", handle.id());
            return Ok(());
        }

        info!("Stopping BLE scan (session {})", handle.id());
        if let Err(e) = self.gateway.scan_stop().await {
            warn!("Failed to stop scan: {}", e);
        }

        Ok(())
    }

    /// Stop whatever scan is active. Returns true if one was stopped.
    pub async fn stop_active(&self) -> bool {
        let active = self
            .session
            .lock()
            .as_ref()
            .filter(|s| s.is_active())
            .map(|s| s.handle);

        match active {
            Some(handle) => {
                let _ = self.stop(handle).await;
                true
            }
            None => false,
        }
    }

    /// Subscribe to a session's advertisements.
    pub fn subscribe(&self, handle: ScanHandle) -> Result<AdvertisementStream> {
        let mut session = self.session.lock();
        match session.as_mut() {
            Some(s) if s.handle == handle => Ok(s.subscribe()),
            _ => Err(Error::InvalidParameter {
                name: "scan_handle".to_string(),
                value: handle.id().to_string(),
            }),
        }
    }

    /// State of a session, if it is the current one.
    pub fn state(&self, handle: ScanHandle) -> Option<ScanState> {
        self.session
            .lock()
            .as_ref()
            .filter(|s| s.handle == handle)
            .map(|s| s.state)
    }

    /// Check if a scan is active.
    pub fn is_scanning(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.is_active())
            .unwrap_or(false)
    }

    /// Peripherals seen by the current session.
    pub fn discovered(&self) -> Vec<AdvertisementRecord> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.discovered())
            .unwrap_or_default()
    }

    /// The strongest peripheral seen by the current session.
    pub fn nearest(&self) -> Option<AdvertisementRecord> {
        self.session.lock().as_ref().and_then(|s| s.nearest())
    }

    /// Route an advertisement from the gateway.
    pub fn handle_advertisement(&self, record: AdvertisementRecord) {
        if let Some(session) = self.session.lock().as_mut() {
            session.on_advertisement(record);
        }
    }

    /// Route an asynchronous scan failure from the gateway.
    pub fn handle_failure(&self, code: i32) {
        if let Some(session) = self.session.lock().as_mut() {
            warn!("Scan session {} failed with code {}", session.handle.id(), code);
            session.fail(code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::gateway::{GatewayError, MockAdapterGateway};
    use crate::ble::uuids::HEART_RATE_SERVICE_UUID;
    use futures::StreamExt;

    fn advert(address: &str, rssi: i16) -> AdvertisementRecord {
        AdvertisementRecord::new(address.into(), rssi).with_service(HEART_RATE_SERVICE_UUID)
    }

    #[test]
    fn test_first_seen_dedup() {
        let mut session = ScanSession::new(ScanHandle(1), ScanFilter::default());
        let mut stream = session.subscribe();

        assert!(session.on_advertisement(advert("AA:BB:CC:DD:EE:01", -60)));
        assert!(!session.on_advertisement(advert("AA:BB:CC:DD:EE:01", -50)));
        assert!(session.on_advertisement(advert("AA:BB:CC:DD:EE:02", -70)));

        assert_eq!(stream.rx.try_recv().unwrap().unwrap().rssi, -60);
        assert_eq!(stream.rx.try_recv().unwrap().unwrap().rssi, -70);
        assert!(stream.rx.try_recv().is_err());

        // The snapshot still tracks the latest advertisement.
        assert_eq!(session.nearest().unwrap().rssi, -50);
    }

    #[test]
    fn test_late_subscriber_gets_seen_peripherals() {
        let mut session = ScanSession::new(ScanHandle(1), ScanFilter::default());
        session.on_advertisement(advert("AA:BB:CC:DD:EE:02", -70));
        session.on_advertisement(advert("AA:BB:CC:DD:EE:01", -60));
        session.on_advertisement(advert("AA:BB:CC:DD:EE:02", -55));

        let mut stream = session.subscribe();
        let replayed: Vec<(String, i16)> = std::iter::from_fn(|| stream.rx.try_recv().ok())
            .map(|r| r.unwrap())
            .map(|r| (r.address.as_str().to_string(), r.rssi))
            .collect();
        assert_eq!(
            replayed,
            vec![
                ("AA:BB:CC:DD:EE:02".to_string(), -55),
                ("AA:BB:CC:DD:EE:01".to_string(), -60),
            ]
        );

        // Already reported, so still suppressed afterwards.
        assert!(!session.on_advertisement(advert("AA:BB:CC:DD:EE:01", -58)));
        assert!(stream.rx.try_recv().is_err());
    }

    #[test]
    fn test_raw_mode_reports_every_advertisement() {
        let filter = ScanFilter::default().with_duplicates(DuplicatePolicy::Every);
        let mut session = ScanSession::new(ScanHandle(1), filter);
        let mut stream = session.subscribe();

        for rssi in [-60, -61, -62] {
            assert!(session.on_advertisement(advert("AA:BB:CC:DD:EE:01", rssi)));
        }
        let rssis: Vec<i16> = std::iter::from_fn(|| stream.rx.try_recv().ok())
            .map(|r| r.unwrap().rssi)
            .collect();
        assert_eq!(rssis, vec![-60, -61, -62]);
    }

    #[test]
    fn test_filter_applied() {
        let filter = ScanFilter::default().with_min_rssi(-65);
        let mut session = ScanSession::new(ScanHandle(1), filter);
        assert!(!session.on_advertisement(advert("AA:BB:CC:DD:EE:01", -80)));
        assert!(session.discovered().is_empty());
    }

    #[test]
    fn test_failure_surfaces_code_and_ends() {
        let mut session = ScanSession::new(ScanHandle(1), ScanFilter::default());
        let mut stream = session.subscribe();
        session.fail(2);

        assert_eq!(session.state(), ScanState::Failed { code: 2 });
        assert_eq!(
            stream.rx.try_recv().unwrap(),
            Err(Error::ScanFailed { code: 2 })
        );
        assert!(!session.on_advertisement(advert("AA:BB:CC:DD:EE:01", -60)));

        // Failed is terminal.
        session.stop();
        assert_eq!(session.state(), ScanState::Failed { code: 2 });
    }

    #[tokio::test]
    async fn test_stop_ends_stream() {
        let mut session = ScanSession::new(ScanHandle(1), ScanFilter::default());
        let mut stream = session.subscribe();
        session.on_advertisement(advert("AA:BB:CC:DD:EE:01", -60));
        session.stop();

        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_start_idempotent_for_same_filter() {
        let mut gateway = MockAdapterGateway::new();
        gateway.expect_scan_start().times(1).returning(|_| Ok(()));
        let scanner = Scanner::new(Arc::new(gateway));

        let first = scanner.start(ScanFilter::default()).await.unwrap();
        let second = scanner.start(ScanFilter::default()).await.unwrap();
        assert_eq!(first, second);
        assert!(scanner.is_scanning());
    }

    #[tokio::test]
    async fn test_start_with_new_filter_replaces_session() {
        let mut gateway = MockAdapterGateway::new();
        gateway.expect_scan_start().times(2).returning(|_| Ok(()));
        gateway.expect_scan_stop().times(1).returning(|| Ok(()));
        let scanner = Scanner::new(Arc::new(gateway));

        let first = scanner.start(ScanFilter::default()).await.unwrap();
        let second = scanner
            .start(ScanFilter::default().with_min_rssi(-70))
            .await
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(scanner.state(first), None);
        assert_eq!(scanner.state(second), Some(ScanState::Active));
    }

    #[tokio::test]
    async fn test_start_failure_preserves_code() {
        let mut gateway = MockAdapterGateway::new();
        gateway
            .expect_scan_start()
            .returning(|_| Err(GatewayError::new(2, "SCAN_FAILED_APPLICATION_REGISTRATION_FAILED")));
        let scanner = Scanner::new(Arc::new(gateway));

        assert_eq!(
            scanner.start(ScanFilter::default()).await,
            Err(Error::ScanFailed { code: 2 })
        );
        assert!(!scanner.is_scanning());
    }

    #[tokio::test]
    async fn test_stop_unknown_handle_is_noop() {
        let gateway = MockAdapterGateway::new();
        let scanner = Scanner::new(Arc::new(gateway));
        assert!(scanner.stop(ScanHandle(42)).await.is_ok());
        assert!(!scanner.stop_active().await);
    }
}
