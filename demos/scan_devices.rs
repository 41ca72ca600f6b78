//! Basic example: Discover nearby hands
//!
//! Run with: cargo run --example scan_devices

use hand_link_ble::{HandController, LinkConfig, LinkEvent, Result};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hand_link_ble=debug".parse().unwrap()),
        )
        .init();

    println!("Scanning for prosthetic hands...");
    println!("Make sure the hand is powered on!\n");

    let config = LinkConfig::default().with_scan_timeout(Duration::from_secs(10));
    let hand = HandController::new(config).await?;

    // Register callback for discovered devices
    let _handle = hand.on_device_found(|identity| {
        println!("Discovered: {}", identity);
    });

    let mut events = hand.subscribe();
    hand.start_scan().await?;

    while hand.is_scanning() {
        match events.recv().await {
            Ok(LinkEvent::Error(kind, message)) => {
                println!("\nScan ended: {} ({})", message, kind);
                break;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    }

    println!("\nDevices by signal strength:");
    for device in hand.discovered_devices() {
        match device.rssi {
            Some(rssi) => println!("  {} at {} dBm", device.identity, rssi),
            None => println!("  {}", device.identity),
        }
    }

    hand.shutdown().await?;

    Ok(())
}
