//! Streaming socket transport.
//!
//! Classic Bluetooth builds of the firmware expose a Serial Port Profile
//! socket instead of a GATT service. The transport is generic over how the
//! socket is obtained: [`RfcommConnector`] opens RFCOMM character devices
//! already bound by the platform (`rfcomm bind`), and tests plug in
//! in-memory pipes.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::LinkConfig;
use crate::device::DeviceIdentity;
use crate::error::{Error, Result};
use crate::protocol::Framing;
use crate::transport::uuids::SERIAL_PORT_PROFILE_UUID;
use crate::transport::{ByteStream, Transport, TransportLink};

/// A bidirectional byte stream.
pub trait Socket: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Socket for T {}

/// A boxed socket.
pub type BoxedSocket = Box<dyn Socket>;

/// Produces a connected socket for a device.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Connect to the device's serial service.
    async fn connect(&self, identity: &DeviceIdentity) -> Result<BoxedSocket>;
}

/// Opens RFCOMM character devices.
///
/// An address is resolved through the binding table first; an address that
/// is itself an absolute path is opened directly.
#[derive(Debug, Default)]
pub struct RfcommConnector {
    bindings: RwLock<HashMap<String, PathBuf>>,
}

impl RfcommConnector {
    /// Create a connector with no bindings.
    pub fn new() -> Self {
        Self::default()
    }

    /// The serial service the bound ports carry.
    pub fn service_uuid(&self) -> Uuid {
        SERIAL_PORT_PROFILE_UUID
    }

    /// Map a device address to its bound character device.
    pub fn bind(&self, address: impl Into<String>, device: impl Into<PathBuf>) {
        self.bindings.write().insert(address.into(), device.into());
    }

    /// Resolve the device path for an identity.
    pub fn resolve(&self, identity: &DeviceIdentity) -> Result<PathBuf> {
        if let Some(path) = self.bindings.read().get(identity.address()) {
            return Ok(path.clone());
        }

        let path = PathBuf::from(identity.address());
        if path.is_absolute() {
            return Ok(path);
        }

        Err(Error::DeviceNotFound {
            address: identity.address().to_string(),
        })
    }
}

#[async_trait]
impl StreamConnector for RfcommConnector {
    async fn connect(&self, identity: &DeviceIdentity) -> Result<BoxedSocket> {
        let path = self.resolve(identity)?;
        debug!(
            "Opening RFCOMM device {} for service {}",
            path.display(),
            self.service_uuid()
        );

        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .await?;

        Ok(Box::new(file))
    }
}

/// Streaming socket transport.
pub struct StreamTransport<C> {
    connector: C,
    read_size: usize,
}

impl<C: StreamConnector> StreamTransport<C> {
    /// Create a transport reading `read_size` bytes at a time.
    pub fn new(connector: C, read_size: usize) -> Self {
        Self {
            connector,
            read_size: read_size.max(1),
        }
    }

    /// Create a transport using the configured read size.
    pub fn from_config(connector: C, config: &LinkConfig) -> Self {
        Self::new(connector, config.stream_read_size)
    }

    /// Bytes requested per read.
    pub fn read_size(&self) -> usize {
        self.read_size
    }

    /// Get the connector.
    pub fn connector(&self) -> &C {
        &self.connector
    }
}

#[async_trait]
impl<C: StreamConnector> Transport for StreamTransport<C> {
    fn framing(&self) -> Framing {
        Framing::Stream
    }

    async fn open(&self, identity: &DeviceIdentity) -> Result<Box<dyn TransportLink>> {
        info!("Opening stream link to {}", identity);

        let socket = self.connector.connect(identity).await?;
        let (reader, writer) = tokio::io::split(socket);

        Ok(Box::new(StreamLink {
            reader: parking_lot::Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            open: Arc::new(AtomicBool::new(true)),
            closed: Arc::new(Notify::new()),
            read_size: self.read_size,
        }))
    }
}

/// An open streaming link.
pub struct StreamLink {
    reader: parking_lot::Mutex<Option<ReadHalf<BoxedSocket>>>,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedSocket>>>,
    open: Arc<AtomicBool>,
    closed: Arc<Notify>,
    read_size: usize,
}

struct ReadState {
    reader: ReadHalf<BoxedSocket>,
    buf: Vec<u8>,
    open: Arc<AtomicBool>,
    closed: Arc<Notify>,
}

#[async_trait]
impl TransportLink for StreamLink {
    async fn write(&self, data: &[u8]) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::NotConnected)?;

        writer.write_all(data).await?;
        writer.flush().await?;

        trace!("Wrote {} bytes to stream", data.len());

        Ok(())
    }

    fn read_stream(&mut self) -> Result<ByteStream> {
        let reader = self.reader.lock().take().ok_or(Error::NotConnected)?;

        let state = ReadState {
            reader,
            buf: vec![0u8; self.read_size],
            open: self.open.clone(),
            closed: self.closed.clone(),
        };

        let stream = stream::unfold(state, |mut state| async move {
            let result = tokio::select! {
                _ = state.closed.notified() => return None,
                result = state.reader.read(&mut state.buf) => result,
            };

            match result {
                Ok(0) => {
                    debug!("Stream reached end of file");
                    state.open.store(false, Ordering::SeqCst);
                    None
                }
                Ok(n) => {
                    let chunk = state.buf[..n].to_vec();
                    Some((chunk, state))
                }
                Err(e) => {
                    warn!("Stream read failed: {}", e);
                    state.open.store(false, Ordering::SeqCst);
                    None
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.closed.notify_one();

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Stream shutdown on close failed: {}", e);
            }
        }

        info!("Stream link closed");

        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
