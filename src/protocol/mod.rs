//! Wire protocol for the hand.
//!
//! Outbound commands are ASCII tokens; inbound telemetry is fixed-width
//! big-endian binary.

pub mod command;
pub mod telemetry;

pub use command::{encode, CalibrationPhase, CommandFrame, EMERGENCY_STOP_TOKEN, MAX_MOTOR_ANGLE};
pub use telemetry::{
    decode, encode_telemetry_bytes, Framing, TelemetryDecoder, TelemetrySample,
    TELEMETRY_FRAME_SIZE,
};
