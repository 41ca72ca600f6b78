//! BLE GATT transport.
//!
//! Commands are written to the hand's data characteristic and telemetry
//! arrives as notifications on the same characteristic.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::LinkConfig;
use crate::device::DeviceIdentity;
use crate::error::{Error, Result};
use crate::protocol::Framing;
use crate::transport::{ByteStream, Transport, TransportLink};

type EventStream = std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>;
type NotificationStream =
    std::pin::Pin<Box<dyn futures::Stream<Item = btleplug::api::ValueNotification> + Send>>;

/// Connection-oriented notify/write transport over btleplug.
pub struct GattTransport {
    /// The BLE adapter to connect through.
    adapter: Adapter,
    /// Service and characteristic identifiers, write mode.
    config: LinkConfig,
}

impl GattTransport {
    /// Create a transport on the first available Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new(config: LinkConfig) -> Result<Self> {
        let adapter = first_adapter().await?;
        Ok(Self::with_adapter(adapter, config))
    }

    /// Create a transport on a specific adapter.
    pub fn with_adapter(adapter: Adapter, config: LinkConfig) -> Self {
        Self { adapter, config }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Find the peripheral matching an identity among those the adapter knows.
    async fn find_peripheral(&self, identity: &DeviceIdentity) -> Result<Peripheral> {
        let peripherals = self.adapter.peripherals().await?;

        peripherals
            .into_iter()
            .find(|p| {
                p.id().to_string() == identity.address()
                    || p.address().to_string() == identity.address()
            })
            .ok_or_else(|| Error::DeviceNotFound {
                address: identity.address().to_string(),
            })
    }

    fn find_characteristic(
        peripheral: &Peripheral,
        service: Uuid,
        uuid: Uuid,
    ) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid && c.service_uuid == service)
            .ok_or_else(|| {
                debug!("Characteristic {} not found in service {}", uuid, service);
                for c in peripheral.characteristics() {
                    debug!("  Available characteristic: {} ({})", c.uuid, c.service_uuid);
                }
                Error::CharacteristicNotFound {
                    uuid: uuid.to_string(),
                }
            })
    }

    /// Connect, discover, subscribe. The caller disconnects on error.
    async fn establish(&self, peripheral: &Peripheral) -> Result<GattLink> {
        peripheral.connect().await?;
        peripheral.discover_services().await?;

        let telemetry = Self::find_characteristic(
            peripheral,
            self.config.service_uuid,
            self.config.telemetry_characteristic,
        )?;
        let command = Self::find_characteristic(
            peripheral,
            self.config.service_uuid,
            self.config.command_characteristic,
        )?;

        // Grab both streams before subscribing so no early notification is lost.
        let events = self.adapter.events().await?;
        let notifications = peripheral.notifications().await?;

        peripheral.subscribe(&telemetry).await?;
        debug!("Subscribed to telemetry characteristic {}", telemetry.uuid);

        let write_type = if self.config.write_with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        Ok(GattLink {
            peripheral: peripheral.clone(),
            command,
            telemetry,
            write_type,
            open: Arc::new(AtomicBool::new(true)),
            closed: Arc::new(Notify::new()),
            streams: Mutex::new(Some((notifications, events))),
        })
    }
}

#[async_trait]
impl Transport for GattTransport {
    fn framing(&self) -> Framing {
        Framing::Datagram
    }

    async fn open(&self, identity: &DeviceIdentity) -> Result<Box<dyn TransportLink>> {
        info!("Opening GATT link to {}", identity);

        let peripheral = self.find_peripheral(identity).await?;
        let guard = DisconnectGuard {
            peripheral: Some(peripheral.clone()),
        };

        match self.establish(&peripheral).await {
            Ok(link) => {
                guard.defuse();
                info!("GATT link to {} ready", identity);
                Ok(Box::new(link))
            }
            Err(e) => {
                guard.defuse();
                warn!("GATT link to {} failed: {}", identity, e);
                if let Err(e) = peripheral.disconnect().await {
                    debug!("Disconnect after failed open: {}", e);
                }
                Err(e)
            }
        }
    }
}

/// Disconnects a peripheral whose open was abandoned part way through.
struct DisconnectGuard {
    peripheral: Option<Peripheral>,
}

impl DisconnectGuard {
    fn defuse(mut self) {
        self.peripheral = None;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let Some(peripheral) = self.peripheral.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        debug!("Releasing half-open peripheral {:?}", peripheral.id());
        runtime.spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                debug!("Disconnect after abandoned open: {}", e);
            }
        });
    }
}

/// An open GATT link.
pub struct GattLink {
    peripheral: Peripheral,
    command: Characteristic,
    telemetry: Characteristic,
    write_type: WriteType,
    open: Arc<AtomicBool>,
    closed: Arc<Notify>,
    streams: Mutex<Option<(NotificationStream, EventStream)>>,
}

#[async_trait]
impl TransportLink for GattLink {
    async fn write(&self, data: &[u8]) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }

        self.peripheral
            .write(&self.command, data, self.write_type)
            .await
            .map_err(Error::Bluetooth)?;

        trace!("Wrote {} bytes to characteristic {}", data.len(), self.command.uuid);

        Ok(())
    }

    fn read_stream(&mut self) -> Result<ByteStream> {
        let (notifications, mut events) = self.streams.lock().take().ok_or(Error::NotConnected)?;

        let peripheral_id = self.peripheral.id();
        let telemetry_uuid = self.telemetry.uuid;
        let open = self.open.clone();
        let closed = self.closed.clone();

        // Resolves when the peripheral disconnects or the link is closed.
        let dropped = async move {
            loop {
                tokio::select! {
                    _ = closed.notified() => break,
                    event = events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => {
                            debug!("Peripheral {:?} disconnected", id);
                            open.store(false, Ordering::SeqCst);
                            break;
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        };

        let stream = notifications
            .filter(move |n| futures::future::ready(n.uuid == telemetry_uuid))
            .map(|n| n.value)
            .take_until(dropped)
            .boxed();

        Ok(stream)
    }

    async fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.closed.notify_one();

        if let Err(e) = self.peripheral.unsubscribe(&self.telemetry).await {
            debug!("Unsubscribe on close failed: {}", e);
        }

        self.peripheral.disconnect().await?;
        info!("GATT link closed");

        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Get the first Bluetooth adapter on this system.
pub(crate) async fn first_adapter() -> Result<Adapter> {
    let manager = Manager::new()
        .await
        .map_err(|_e| Error::BluetoothUnavailable)?;

    let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

    let adapter = adapters
        .into_iter()
        .next()
        .ok_or(Error::BluetoothUnavailable)?;

    info!(
        "Using Bluetooth adapter: {:?}",
        adapter.adapter_info().await.ok()
    );

    Ok(adapter)
}
