//! Connect to a hand and run through the basic commands
//!
//! Run with: cargo run --example hand_control

use hand_link_ble::{
    CalibrationPhase, Error, HandController, LinkConfig, LinkEvent, LinkState, Result,
};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hand_link_ble=info".parse().unwrap()),
        )
        .init();

    let hand = HandController::new(LinkConfig::default()).await?;
    let mut events = hand.subscribe();

    println!("Looking for a hand...");
    hand.start_scan().await?;

    // Take the first device found
    let identity = loop {
        match events.recv().await {
            Ok(LinkEvent::DeviceDiscovered(identity)) => break identity,
            Ok(LinkEvent::Error(_, message)) => {
                println!("{}", message);
                return Ok(());
            }
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return Err(Error::WorkerStopped),
        }
    };

    hand.stop_scan().await?;
    println!("Connecting to {}...", identity);
    hand.connect(identity)?;

    loop {
        match events.recv().await {
            Ok(LinkEvent::StateChanged(LinkState::Connected)) => break,
            Ok(LinkEvent::Error(kind, message)) => {
                println!("Connection failed ({}): {}", kind, message);
                return Ok(());
            }
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return Err(Error::WorkerStopped),
        }
    }

    println!("Connected!\n");

    println!("Calibrating...");
    hand.send_calibration(CalibrationPhase::Start)?.await?;
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        hand.send_calibration(CalibrationPhase::Step)?.await?;
    }
    hand.send_calibration(CalibrationPhase::Complete)?.await?;

    println!("Sensor gain 1 -> 50");
    hand.send_sensor_config(1, 50)?.await?;

    // Sweep each finger closed and open again
    for motor in 1..=5u8 {
        println!("Motor {}: close", motor);
        hand.send_motor_command(motor, 180)?.await?;
        tokio::time::sleep(Duration::from_millis(500)).await;

        println!("Motor {}: open", motor);
        hand.send_motor_command(motor, 0)?.await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    println!("\nEmergency stop");
    hand.send_emergency_stop()?.await?;

    hand.shutdown().await?;

    Ok(())
}
