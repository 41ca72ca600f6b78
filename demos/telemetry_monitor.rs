//! Real-time EMG telemetry monitoring example
//!
//! Run with: cargo run --example telemetry_monitor [address]
//!
//! Without an address the first hand discovered is used.

use hand_link_ble::{DeviceIdentity, HandController, LinkConfig, LinkEvent, Result};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (minimal)
    tracing_subscriber::fmt().with_env_filter("warn").init();

    println!("Telemetry Monitor");
    println!("=================\n");

    let hand = HandController::new(LinkConfig::default()).await?;
    let mut events = hand.subscribe();

    match std::env::args().nth(1) {
        Some(address) => hand.connect(DeviceIdentity::new(address, None))?,
        None => {
            println!("Looking for a hand...\n");
            hand.start_scan().await?;
        }
    }

    let mut samples = 0u64;
    let mut window = Instant::now();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\n\nExiting...");
                break;
            }
            event = events.recv() => match event {
                Ok(LinkEvent::DeviceDiscovered(identity)) if hand.current_device().is_none() => {
                    hand.stop_scan().await?;
                    println!("Connecting to {}...", identity);
                    hand.connect(identity)?;
                }
                Ok(LinkEvent::StateChanged(state)) => println!("Link: {}", state),
                Ok(LinkEvent::TelemetryReceived(sample)) => {
                    samples += 1;
                    let (a, b) = sample.amplitudes();
                    print!("\r#{:<8} ch1 {:>6.0}  ch2 {:>6.0}", sample.sequence, a, b);
                    if window.elapsed() >= Duration::from_secs(5) {
                        let rate = samples as f64 / window.elapsed().as_secs_f64();
                        println!("\n  {:.1} samples/s", rate);
                        samples = 0;
                        window = Instant::now();
                    }
                }
                Ok(LinkEvent::Error(kind, message)) => {
                    println!("\nError ({}): {}", kind, message);
                    break;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => {
                    println!("\n  (skipped {} events)", n);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    hand.shutdown().await?;

    Ok(())
}
