//! Heart rate monitor example
//!
//! Demonstrates a full connection lifecycle:
//! - Scanning for a peripheral advertising the Heart Rate service
//! - Connecting and discovering services
//! - Reading the battery level
//! - Streaming Heart Rate Measurement notifications
//! - Automatic reconnection after link loss
//!
//! Run with: cargo run --example heart_rate_monitor
//!
//! To connect to a specific peripheral:
//!   cargo run --example heart_rate_monitor -- --address AA:BB:CC:DD:EE:FF

use ble_central::{
    ConnectionManager, Error, ManagerConfig, PeripheralAddress, Result, ScanFilter,
    BATTERY_LEVEL_UUID, HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID,
};
use std::time::Duration;

/// Decode a Heart Rate Measurement value into beats per minute.
fn parse_heart_rate(value: &[u8]) -> Option<u16> {
    let flags = *value.first()?;
    if flags & 0x01 == 0 {
        value.get(1).map(|&bpm| bpm as u16)
    } else {
        Some(u16::from_le_bytes([*value.get(1)?, *value.get(2)?]))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("warn,ble_central=debug")
        .init();

    println!("Heart Rate Monitor");
    println!("==================\n");

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let target = args
        .iter()
        .position(|arg| arg == "--address")
        .and_then(|i| args.get(i + 1))
        .map(PeripheralAddress::new);

    let config = ManagerConfig::default()
        .with_auto_reconnect(true)
        .with_reconnect_params(5, Duration::from_secs(1));
    let manager = ConnectionManager::with_default_adapter(config).await?;

    let _events = manager.on_connection_event(|event| {
        println!("[{}] {}", event.address, event.state);
    });

    let address = match target {
        Some(address) => address,
        None => {
            println!("Looking for a heart rate sensor...\n");
            let filter = ScanFilter::default().with_service(HEART_RATE_SERVICE_UUID);
            let scan = manager.start_scan(Some(filter)).await?;
            tokio::time::sleep(Duration::from_secs(5)).await;
            manager.stop_scan(scan).await?;

            match manager.nearest() {
                Some(record) => {
                    println!(
                        "Found {} ({}, {} dBm)\n",
                        record.name.as_deref().unwrap_or("(unnamed)"),
                        record.address,
                        record.rssi
                    );
                    record.address
                }
                None => {
                    println!("No heart rate sensor found.");
                    return Ok(());
                }
            }
        }
    };

    let connection = manager.connect(address.clone()).await?;

    match connection.read(BATTERY_LEVEL_UUID).await {
        Ok(level) => println!("Battery: {}%", level.first().copied().unwrap_or(0)),
        Err(Error::UnknownCharacteristic { .. }) => println!("Battery: not reported"),
        Err(e) => println!("Battery: {}", e),
    }

    let mut measurements = connection.subscribe(HEART_RATE_MEASUREMENT_UUID).await?;
    println!("Streaming heart rate, press Ctrl+C to stop\n");

    loop {
        tokio::select! {
            value = measurements.recv() => match value {
                Some(value) => match parse_heart_rate(&value) {
                    Some(bpm) => println!("{} bpm", bpm),
                    None => println!("Malformed measurement: {:02X?}", value),
                },
                None => {
                    // Subscriptions end with the link; resubscribe once reconnected.
                    println!("Measurement stream ended, waiting for reconnection...");
                    let _ = connection
                        .watch_status()
                        .wait_for(|status| !status.state.is_ready())
                        .await;
                    if connection.wait_ready().await.is_err() {
                        println!("Connection closed: {:?}", connection.status().failure);
                        break;
                    }
                    measurements = connection.subscribe(HEART_RATE_MEASUREMENT_UUID).await?;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    manager.disconnect(address).await?;
    manager.shutdown().await?;
    Ok(())
}
