//! Transport adapters.
//!
//! A [`Transport`] opens links to a device; a [`TransportLink`] moves bytes
//! over one open link. Two variants exist:
//! - [`gatt::GattTransport`]: BLE GATT, commands written to a characteristic
//!   and telemetry received as notifications.
//! - [`stream::StreamTransport`]: a bidirectional byte stream such as an
//!   RFCOMM socket.
//!
//! Both guarantee that `write` after `close` fails with
//! [`Error::NotConnected`](crate::Error::NotConnected), and that the stream
//! returned by `read_stream` ends when the link drops.

pub mod gatt;
pub mod stream;
pub mod uuids;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::device::DeviceIdentity;
use crate::error::Result;
use crate::protocol::Framing;

pub use gatt::GattTransport;
pub use stream::{RfcommConnector, StreamConnector, StreamTransport};

/// Inbound byte chunks from an open link.
pub type ByteStream = BoxStream<'static, Vec<u8>>;

/// Opens links to devices.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// How inbound chunks from this transport map onto telemetry frames.
    fn framing(&self) -> Framing;

    /// Open a link to the device.
    ///
    /// Returns once the link is ready to carry telemetry, so for GATT the
    /// telemetry subscription is already in place.
    async fn open(&self, identity: &DeviceIdentity) -> Result<Box<dyn TransportLink>>;
}

/// One open link.
#[async_trait]
pub trait TransportLink: Send + Sync {
    /// Write one frame.
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Take the inbound stream. Can be taken once per link.
    fn read_stream(&mut self) -> Result<ByteStream>;

    /// Release the link. Calling it more than once is harmless.
    async fn close(&self) -> Result<()>;

    /// Whether the link has neither been closed nor dropped.
    fn is_open(&self) -> bool;
}
