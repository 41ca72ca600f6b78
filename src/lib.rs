// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # hand-link-ble
//!
//! Device-link core for a Bluetooth prosthetic hand controller.
//!
//! The crate discovers the hand over BLE, keeps a single link to it, encodes
//! motor, sensor, calibration and emergency-stop commands, and decodes the
//! two-channel telemetry the hand streams back.
//!
//! ## Features
//!
//! - **Discovery**: Time-bounded, deduplicated scans with an explicit
//!   "no devices found" outcome
//! - **Link State Machine**: `Idle -> Connecting -> Connected -> Idle`, with
//!   every transport fault surfaced as an event and a return to `Idle`
//! - **Two transports**: BLE GATT notify/write, and streaming sockets such as
//!   RFCOMM serial ports
//! - **Commands**: `M<id>:<angle>`, `S<id>:<value>`, `C:<phase>` and `STOP`
//! - **Telemetry**: Big-endian two-channel samples, reassembled across
//!   stream reads
//! - **Events**: One listener per category, plus a broadcast subscription
//!
//! Nothing is retried automatically. Reconnecting or re-sending is left to
//! the application.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hand_link_ble::{HandController, LinkConfig, LinkEvent, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let hand = HandController::new(LinkConfig::default()).await?;
//!     let mut events = hand.subscribe();
//!
//!     hand.start_scan().await?;
//!
//!     // Connect to the first hand found
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             LinkEvent::DeviceDiscovered(identity) => {
//!                 hand.stop_scan().await?;
//!                 hand.connect(identity)?;
//!             }
//!             LinkEvent::StateChanged(state) if state.is_connected() => {
//!                 // Close the index finger halfway
//!                 hand.send_motor_command(2, 90)?.await?;
//!             }
//!             LinkEvent::TelemetryReceived(sample) => {
//!                 println!("EMG: {} / {}", sample.channel_1, sample.channel_2);
//!             }
//!             LinkEvent::Error(kind, message) => {
//!                 eprintln!("{}: {}", kind, message);
//!                 break;
//!             }
//!             _ => {}
//!         }
//!     }
//!
//!     hand.shutdown().await
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group. The RFCOMM
//! transport expects the serial port to be bound first (`rfcomm bind`).
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! Radio permission is never requested by this crate. Record the outcome of
//! the platform prompt with [`HandController::set_permission`].
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod config;
pub mod controller;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod link;
pub mod protocol;
pub mod scanner;
pub mod transport;

// Re-exports for convenience
pub use config::LinkConfig;
pub use controller::HandController;
pub use device::DeviceIdentity;
pub use dispatcher::{CallbackHandle, EventDispatcher, LinkEvent};
pub use error::{Error, ErrorKind, Result};
pub use link::{LinkManager, LinkState, PendingWrite};
pub use protocol::{
    decode, encode, encode_telemetry_bytes, CalibrationPhase, CommandFrame, TelemetrySample,
};
pub use scanner::{Discovery, PermissionStatus, Scanner};
pub use transport::{GattTransport, RfcommConnector, StreamTransport, Transport, TransportLink};
