//! Controller for discovering and driving a prosthetic hand.
//!
//! [`HandController`] bundles one scanner, one link manager and one event
//! dispatcher. The application owns the controller and hands references to
//! whichever part of it needs the link; there is no process-wide instance.

use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::device::DeviceIdentity;
use crate::dispatcher::{CallbackHandle, EventDispatcher, LinkEvent};
use crate::error::{ErrorKind, Result};
use crate::link::{LinkManager, LinkState, PendingWrite};
use crate::protocol::{CalibrationPhase, CommandFrame, TelemetrySample};
use crate::scanner::{BleDiscovery, DiscoverySource, Discovery, PermissionStatus, Scanner};
use crate::transport::gatt::{first_adapter, GattTransport};
use crate::transport::Transport;

/// Central controller for one hand.
pub struct HandController {
    config: LinkConfig,
    scanner: Arc<Scanner>,
    link: LinkManager,
    dispatcher: Arc<EventDispatcher>,
    /// Task forwarding the open scan window into discovery events.
    scan_task: RwLock<Option<JoinHandle<()>>>,
}

impl HandController {
    /// Create a controller on the first Bluetooth adapter, using GATT for
    /// both discovery and the link.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new(config: LinkConfig) -> Result<Self> {
        let adapter = first_adapter().await?;

        let transport = Arc::new(GattTransport::with_adapter(adapter.clone(), config.clone()));
        let source = Arc::new(BleDiscovery::new(adapter));

        Ok(Self::with_parts(config, transport, source))
    }

    /// Create a controller from explicit parts.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn with_parts(
        config: LinkConfig,
        transport: Arc<dyn Transport>,
        source: Arc<dyn DiscoverySource>,
    ) -> Self {
        let dispatcher = Arc::new(EventDispatcher::new(config.event_capacity));

        Self {
            scanner: Arc::new(Scanner::new(source)),
            link: LinkManager::new(transport, dispatcher.clone()),
            dispatcher,
            config,
            scan_task: RwLock::new(None),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Get the scanner.
    pub fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    /// Get the link manager.
    pub fn link(&self) -> &LinkManager {
        &self.link
    }

    /// Record the platform radio permission.
    pub fn set_permission(&self, permission: PermissionStatus) {
        self.scanner.set_permission(permission);
    }

    /// Start a scan window of the configured timeout.
    ///
    /// Each new device is raised as [`LinkEvent::DeviceDiscovered`]. A
    /// window that closes empty raises an `Error` event of kind
    /// [`ErrorKind::NoDevicesFound`].
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::PermissionDenied`] if radio permission is
    /// denied, or [`crate::Error::InvalidState`] if already scanning.
    pub async fn start_scan(&self) -> Result<()> {
        let mut scan = self.scanner.start_scan(self.config.scan_timeout).await?;

        let dispatcher = self.dispatcher.clone();
        let handle = tokio::spawn(async move {
            while let Some(item) = scan.next().await {
                match item {
                    Ok(identity) => dispatcher.dispatch(LinkEvent::DeviceDiscovered(identity)),
                    Err(e) => {
                        info!("Scan ended: {}", e);
                        dispatcher.dispatch(LinkEvent::Error(e.kind(), e.to_string()));
                    }
                }
            }
            debug!("Scan forwarding task ended");
        });

        if let Some(previous) = self.scan_task.write().replace(handle) {
            previous.abort();
        }

        Ok(())
    }

    /// End the scan window early.
    pub async fn stop_scan(&self) -> Result<()> {
        self.scanner.stop_scan().await
    }

    /// Check if a scan window is open.
    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    /// Devices found in the current or most recent scan window, strongest
    /// signal first.
    pub fn discovered_devices(&self) -> Vec<Discovery> {
        let mut devices = self.scanner.discovered_devices();
        devices.sort_by(|a, b| {
            b.rssi
                .unwrap_or(i16::MIN)
                .cmp(&a.rssi.unwrap_or(i16::MIN))
        });
        devices
    }

    /// Start connecting to a device. See [`LinkManager::connect`].
    pub fn connect(&self, identity: DeviceIdentity) -> Result<()> {
        self.link.connect(identity)
    }

    /// Queue a command. See [`LinkManager::send`].
    pub fn send(&self, frame: CommandFrame) -> Result<PendingWrite> {
        self.link.send(frame)
    }

    /// Move a motor (1-based) to an angle in degrees, 0 to 180.
    pub fn send_motor_command(&self, motor_id: u8, angle_degrees: u16) -> Result<PendingWrite> {
        self.send(CommandFrame::motor(motor_id, angle_degrees))
    }

    /// Set a sensor parameter.
    pub fn send_sensor_config(&self, sensor_id: u8, value: i32) -> Result<PendingWrite> {
        self.send(CommandFrame::sensor(sensor_id, value))
    }

    /// Advance the calibration routine.
    pub fn send_calibration(&self, phase: CalibrationPhase) -> Result<PendingWrite> {
        self.send(CommandFrame::calibration(phase))
    }

    /// Stop all motors.
    ///
    /// The device does not acknowledge the stop, so the application should
    /// reset its own view of the hand as well.
    pub fn send_emergency_stop(&self) -> Result<PendingWrite> {
        warn!("Emergency stop requested");
        self.send(CommandFrame::EmergencyStop)
    }

    /// Close the link. See [`LinkManager::close`].
    pub async fn close(&self) {
        self.link.close().await;
    }

    /// The last published link state.
    pub fn current_state(&self) -> LinkState {
        self.link.current_state()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// The device the link is open to or opening.
    pub fn current_device(&self) -> Option<DeviceIdentity> {
        self.link.current_device()
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.dispatcher.subscribe()
    }

    /// Register the state-change callback, replacing any previous one.
    pub fn on_state_changed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(LinkState) + Send + Sync + 'static,
    {
        self.dispatcher.on_state_changed(callback)
    }

    /// Register the telemetry callback, replacing any previous one.
    pub fn on_telemetry<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(TelemetrySample) + Send + Sync + 'static,
    {
        self.dispatcher.on_telemetry(callback)
    }

    /// Register the device-found callback, replacing any previous one.
    pub fn on_device_found<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(DeviceIdentity) + Send + Sync + 'static,
    {
        self.dispatcher.on_device_found(callback)
    }

    /// Register the error callback, replacing any previous one.
    pub fn on_error<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(ErrorKind, String) + Send + Sync + 'static,
    {
        self.dispatcher.on_error(callback)
    }

    /// Stop scanning, close the link and drop all listeners.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down hand controller");

        let stopped = self.stop_scan().await;

        if let Some(task) = self.scan_task.write().take() {
            task.abort();
        }

        self.link.close().await;
        self.dispatcher.clear_listeners();

        stopped
    }
}

impl Drop for HandController {
    fn drop(&mut self) {
        if let Some(task) = self.scan_task.write().take() {
            task.abort();
        }
    }
}
