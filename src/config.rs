//! Link configuration.

use std::time::Duration;
use uuid::Uuid;

use crate::transport::uuids::{HAND_DATA_CHARACTERISTIC_UUID, HAND_SERVICE_UUID};

/// Tunables shared by the scanner, the transports and the link manager.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LinkConfig {
    /// How long a scan runs before it is declared exhausted.
    pub scan_timeout: Duration,
    /// GATT service carrying the hand's data characteristic.
    pub service_uuid: Uuid,
    /// Characteristic that notifies telemetry.
    pub telemetry_characteristic: Uuid,
    /// Characteristic that accepts command writes.
    pub command_characteristic: Uuid,
    /// Whether GATT command writes request a response.
    pub write_with_response: bool,
    /// Capacity of the broadcast channel returned by `subscribe()`.
    pub event_capacity: usize,
    /// Size of each read on a streaming socket.
    pub stream_read_size: usize,
}

impl LinkConfig {
    /// Default scan window.
    pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

    /// Set the scan window.
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Set the GATT service and characteristic identifiers.
    pub fn with_gatt_ids(mut self, service: Uuid, telemetry: Uuid, command: Uuid) -> Self {
        self.service_uuid = service;
        self.telemetry_characteristic = telemetry;
        self.command_characteristic = command;
        self
    }

    /// Request acknowledged GATT writes.
    pub fn with_write_response(mut self, with_response: bool) -> Self {
        self.write_with_response = with_response;
        self
    }

    /// Set the event broadcast capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Set the per-read chunk size for streaming sockets.
    pub fn with_stream_read_size(mut self, size: usize) -> Self {
        self.stream_read_size = size.max(1);
        self
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            scan_timeout: Self::DEFAULT_SCAN_TIMEOUT,
            service_uuid: HAND_SERVICE_UUID,
            telemetry_characteristic: HAND_DATA_CHARACTERISTIC_UUID,
            command_characteristic: HAND_DATA_CHARACTERISTIC_UUID,
            write_with_response: false,
            event_capacity: 256,
            stream_read_size: 256,
        }
    }
}
