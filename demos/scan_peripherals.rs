//! Basic example: Scan for nearby BLE peripherals
//!
//! Run with: cargo run --example scan_peripherals
//!
//! To only report peripherals advertising a name prefix:
//!   cargo run --example scan_peripherals -- --name Polar

use ble_central::{
    short_uuid, ConnectionManager, DuplicatePolicy, ManagerConfig, Result, ScanFilter,
};
use futures::StreamExt;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ble_central=info".parse().unwrap()),
        )
        .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let name_prefix = args
        .iter()
        .position(|arg| arg == "--name")
        .and_then(|i| args.get(i + 1))
        .cloned();

    let manager = ConnectionManager::with_default_adapter(ManagerConfig::default()).await?;

    let mut filter = ScanFilter::default().with_duplicates(DuplicatePolicy::FirstSeen);
    if let Some(prefix) = name_prefix {
        println!("Only reporting peripherals named {}*", prefix);
        filter = filter.with_name_prefix(prefix);
    }

    println!("Scanning for 10 seconds...\n");
    let scan = manager.start_scan(Some(filter)).await?;
    let mut adverts = manager.advertisements(scan)?;

    let deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            advert = adverts.next() => match advert {
                Some(Ok(record)) => {
                    println!(
                        "{}  {:>4} dBm  {}",
                        record.address,
                        record.rssi,
                        record.name.as_deref().unwrap_or("(unnamed)")
                    );
                    for uuid in &record.service_uuids {
                        match short_uuid(uuid) {
                            Some(short) => println!("    service 0x{:04X}", short),
                            None => println!("    service {}", uuid),
                        }
                    }
                    for (company, data) in record.manufacturer_data() {
                        println!("    manufacturer 0x{:04X}: {:02X?}", company, data);
                    }
                }
                Some(Err(e)) => {
                    eprintln!("Scan failed: {}", e);
                    break;
                }
                None => break,
            },
            _ = &mut deadline => break,
        }
    }

    manager.stop_scan(scan).await?;

    println!("\nDiscovered {} peripherals", manager.discovered().len());
    if let Some(nearest) = manager.nearest() {
        println!("Nearest: {} ({} dBm)", nearest.address, nearest.rssi);
    }

    manager.shutdown().await?;
    Ok(())
}
