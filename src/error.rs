//! Error types for the hand-link-ble crate.

use thiserror::Error;

/// Coarse classification of every [`Error`].
///
/// Application code usually only needs to branch on the kind: whether the
/// operation was refused because of the link state, whether the radio failed,
/// or whether discovery came up empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorKind {
    /// The operation is not valid in the current link state.
    InvalidState,
    /// The transport refused the operation because no link is open.
    NotConnected,
    /// An I/O, socket or GATT failure.
    TransportFault,
    /// Platform radio permission is missing.
    PermissionDenied,
    /// A scan ran to its timeout without finding a device.
    NoDevicesFound,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidState => write!(f, "InvalidState"),
            Self::NotConnected => write!(f, "NotConnected"),
            Self::TransportFault => write!(f, "TransportFault"),
            Self::PermissionDenied => write!(f, "PermissionDenied"),
            Self::NoDevicesFound => write!(f, "NoDevicesFound"),
        }
    }
}

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// I/O error from a streaming socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// The operation is not valid in the current link state.
    #[error("Invalid state: {operation} not allowed while {state}")]
    InvalidState {
        /// The operation that was attempted.
        operation: &'static str,
        /// The link state at the time of the attempt.
        state: String,
    },

    /// Operation requires an open link but none is open.
    #[error("Device not connected")]
    NotConnected,

    /// The device could not be found by the transport.
    #[error("Device not found: {address}")]
    DeviceNotFound {
        /// The address that was searched for.
        address: String,
    },

    /// Failed to establish a connection to the device.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The link to the device dropped.
    #[error("Connection lost")]
    ConnectionLost,

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// Radio permission has been denied by the platform.
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    /// A scan ended without discovering any device.
    #[error("No devices found within {timeout_ms} ms")]
    NoDevicesFound {
        /// The scan window in milliseconds.
        timeout_ms: u128,
    },

    /// A command write failed and the link was dropped.
    #[error("Write failed: {source}")]
    WriteFailed {
        /// The transport error behind the failure.
        #[source]
        source: Box<Error>,
    },

    /// The background link worker has shut down.
    #[error("Link worker stopped")]
    WorkerStopped,
}

impl Error {
    /// Classify this error into one of the [`ErrorKind`]s.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::NotConnected => ErrorKind::NotConnected,
            Self::PermissionDenied => ErrorKind::PermissionDenied,
            Self::Bluetooth(btleplug::Error::PermissionDenied) => ErrorKind::PermissionDenied,
            Self::Bluetooth(btleplug::Error::NotConnected) => ErrorKind::NotConnected,
            Self::NoDevicesFound { .. } => ErrorKind::NoDevicesFound,
            Self::Bluetooth(_)
            | Self::Io(_)
            | Self::BluetoothUnavailable
            | Self::DeviceNotFound { .. }
            | Self::ConnectionFailed { .. }
            | Self::ConnectionLost
            | Self::CharacteristicNotFound { .. }
            | Self::WriteFailed { .. }
            | Self::WorkerStopped => ErrorKind::TransportFault,
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
