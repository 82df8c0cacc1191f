mod common;

use ble_central::{
    AdvertisementRecord, DuplicatePolicy, Error, GatewayEvent, ManagerConfig, ScanFilter,
    ScanState, HEART_RATE_SERVICE_UUID,
};
use common::{manager, settle, Call, ADDRESS};
use futures::{FutureExt, StreamExt};
use pretty_assertions::assert_eq;

fn advert(address: &str, rssi: i16) -> GatewayEvent {
    GatewayEvent::Advertisement(
        AdvertisementRecord::new(address.into(), rssi)
            .with_name("HRM")
            .with_service(HEART_RATE_SERVICE_UUID),
    )
}

#[tokio::test]
async fn test_scan_reports_first_seen_and_stops_on_connect() {
    let (manager, gateway) = manager(ManagerConfig::default());

    let scan = manager.start_scan(None).await.unwrap();
    assert_eq!(manager.start_scan(None).await.unwrap(), scan);
    assert!(manager.is_scanning());

    let mut adverts = manager.advertisements(scan).unwrap();
    gateway.emit(advert(ADDRESS, -70));
    gateway.emit(advert(ADDRESS, -40));
    gateway.emit(advert("AA:BB:CC:DD:EE:01", -60));

    let first = adverts.next().await.unwrap().unwrap();
    let second = adverts.next().await.unwrap().unwrap();
    assert_eq!(first.address.as_str(), ADDRESS);
    assert_eq!(first.rssi, -70);
    assert_eq!(second.address.as_str(), "AA:BB:CC:DD:EE:01");

    // The snapshot keeps the latest record per peripheral.
    assert_eq!(manager.discovered().len(), 2);
    assert_eq!(manager.nearest().unwrap().rssi, -40);

    // Connecting takes the radio away from the scan.
    manager.connect(ADDRESS).await.unwrap();
    assert!(!manager.is_scanning());
    assert!(adverts.next().await.is_none());
    assert_eq!(
        gateway.calls()[..3],
        [Call::ScanStart, Call::ScanStop, Call::Open(ADDRESS.into())]
    );
}

#[tokio::test]
async fn test_advertisements_before_subscribing_are_not_lost() {
    let (manager, gateway) = manager(ManagerConfig::default());

    let scan = manager.start_scan(None).await.unwrap();
    gateway.emit(advert(ADDRESS, -70));
    settle().await;
    assert_eq!(manager.discovered().len(), 1);

    let mut adverts = manager.advertisements(scan).unwrap();
    let first = adverts.recv().await.unwrap().unwrap();
    assert_eq!(first.address.as_str(), ADDRESS);
    assert_eq!(first.rssi, -70);

    // Later duplicates stay suppressed.
    gateway.emit(advert(ADDRESS, -65));
    settle().await;
    assert!(adverts.recv().now_or_never().is_none());
}

#[tokio::test]
async fn test_raw_mode_reports_every_advertisement() {
    let config = ManagerConfig::default().with_scan_duplicates(DuplicatePolicy::Every);
    let (manager, gateway) = manager(config);

    let scan = manager.start_scan(None).await.unwrap();
    let mut adverts = manager.advertisements(scan).unwrap();
    for rssi in [-70, -69, -68] {
        gateway.emit(advert(ADDRESS, rssi));
    }

    let mut rssis = Vec::new();
    for _ in 0..3 {
        rssis.push(adverts.recv().await.unwrap().unwrap().rssi);
    }
    assert_eq!(rssis, vec![-70, -69, -68]);
}

#[tokio::test]
async fn test_filtered_scan() {
    let (manager, gateway) = manager(ManagerConfig::default());
    let filter = ScanFilter::default()
        .with_name_prefix("HR")
        .with_min_rssi(-65);

    let scan = manager.start_scan(Some(filter)).await.unwrap();
    let mut adverts = manager.advertisements(scan).unwrap();
    gateway.emit(advert("AA:BB:CC:DD:EE:01", -80));
    gateway.emit(advert("AA:BB:CC:DD:EE:02", -50));

    let record = adverts.recv().await.unwrap().unwrap();
    assert_eq!(record.address.as_str(), "AA:BB:CC:DD:EE:02");
    assert_eq!(manager.discovered().len(), 1);
}

#[tokio::test]
async fn test_scan_failure_is_terminal() {
    let (manager, gateway) = manager(ManagerConfig::default());

    let scan = manager.start_scan(None).await.unwrap();
    let mut adverts = manager.advertisements(scan).unwrap();
    gateway.emit(GatewayEvent::ScanFailed { code: 2 });

    assert_eq!(adverts.recv().await, Some(Err(Error::ScanFailed { code: 2 })));
    assert_eq!(adverts.recv().await, None);
    settle().await;
    assert!(!manager.is_scanning());
    assert_eq!(manager.scan_state(scan), Some(ScanState::Failed { code: 2 }));

    // A late subscriber still sees the failure.
    let mut late = manager.advertisements(scan).unwrap();
    assert_eq!(late.recv().await, Some(Err(Error::ScanFailed { code: 2 })));

    // Stopping a failed session is a no-op.
    manager.stop_scan(scan).await.unwrap();
    assert_eq!(
        gateway.calls().iter().filter(|c| **c == Call::ScanStop).count(),
        0
    );
}
