//! Device discovery.
//!
//! A [`DiscoverySource`] produces raw advertisements; the [`Scanner`] turns
//! them into a time-bounded, deduplicated sequence of device identities.
//! A scan window that ends without a single discovery yields a final
//! [`Error::NoDevicesFound`] item instead of simply ending.

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Peripheral as _, ScanFilter};
use btleplug::platform::Adapter;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Sleep;
use tracing::{debug, info, trace, warn};

use crate::device::DeviceIdentity;
use crate::error::{Error, Result};

/// Platform radio permission, as determined by the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PermissionStatus {
    /// Scanning and connecting are allowed.
    #[default]
    Granted,
    /// The user or platform denied radio access.
    Denied,
}

/// One advertisement seen by a discovery source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Who advertised.
    pub identity: DeviceIdentity,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

/// A device reported during the current scan window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    /// The device.
    pub identity: DeviceIdentity,
    /// Signal strength of the most recent advertisement, in dBm.
    pub rssi: Option<i16>,
}

/// Stream of discovered identities, ending with
/// [`Error::NoDevicesFound`] if the window closed empty.
pub type ScanStream = BoxStream<'static, Result<DeviceIdentity>>;

/// Produces raw advertisements.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Start listening. The stream may repeat devices.
    async fn start(&self) -> Result<BoxStream<'static, Advertisement>>;

    /// Stop listening.
    async fn stop(&self) -> Result<()>;
}

/// BLE discovery through btleplug.
pub struct BleDiscovery {
    /// The BLE adapter to use for scanning.
    adapter: Adapter,
}

impl BleDiscovery {
    /// Create a discovery source on the given adapter.
    pub fn new(adapter: Adapter) -> Self {
        Self { adapter }
    }

    /// Resolve an adapter event to an advertisement.
    async fn advertisement(adapter: &Adapter, event: CentralEvent) -> Option<Advertisement> {
        let id = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
            _ => return None,
        };

        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return None;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return None,
        };

        Some(Advertisement {
            identity: DeviceIdentity::new(id.to_string(), properties.local_name),
            rssi: properties.rssi,
        })
    }
}

#[async_trait]
impl DiscoverySource for BleDiscovery {
    async fn start(&self) -> Result<BoxStream<'static, Advertisement>> {
        let events = self.adapter.events().await?;

        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| match e {
                btleplug::Error::PermissionDenied => Error::PermissionDenied,
                other => Error::Bluetooth(other),
            })?;

        let adapter = self.adapter.clone();
        let stream = events
            .filter_map(move |event| {
                let adapter = adapter.clone();
                async move { Self::advertisement(&adapter, event).await }
            })
            .boxed();

        Ok(stream)
    }

    async fn stop(&self) -> Result<()> {
        self.adapter.stop_scan().await.map_err(Error::Bluetooth)
    }
}

/// Stop signal of the open scan window, if any.
type ActiveWindow = Arc<RwLock<Option<Arc<Notify>>>>;

/// Time-bounded, deduplicating scanner.
pub struct Scanner {
    source: Arc<dyn DiscoverySource>,
    permission: RwLock<PermissionStatus>,
    active: ActiveWindow,
    /// Devices reported in the active (or last) scan window.
    discovered: Arc<RwLock<HashMap<String, Discovery>>>,
}

impl Scanner {
    /// Create a scanner over a discovery source.
    pub fn new(source: Arc<dyn DiscoverySource>) -> Self {
        Self {
            source,
            permission: RwLock::new(PermissionStatus::Granted),
            active: Arc::new(RwLock::new(None)),
            discovered: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Record the platform permission state. Scanning is refused while denied.
    pub fn set_permission(&self, permission: PermissionStatus) {
        *self.permission.write() = permission;
    }

    /// The recorded permission state.
    pub fn permission(&self) -> PermissionStatus {
        *self.permission.read()
    }

    /// Check if a scan window is open.
    pub fn is_scanning(&self) -> bool {
        self.active.read().is_some()
    }

    /// Devices reported in the current or most recent scan window.
    pub fn discovered_devices(&self) -> Vec<Discovery> {
        self.discovered.read().values().cloned().collect()
    }

    /// Open a scan window of `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PermissionDenied`] if radio permission is denied, or
    /// [`Error::InvalidState`] if a scan is already running.
    pub async fn start_scan(&self, timeout: Duration) -> Result<ScanStream> {
        if self.permission() == PermissionStatus::Denied {
            warn!("Scan refused: radio permission denied");
            return Err(Error::PermissionDenied);
        }

        let stop = Arc::new(Notify::new());
        {
            let mut active = self.active.write();
            if active.is_some() {
                return Err(Error::InvalidState {
                    operation: "start_scan",
                    state: "Scanning".to_string(),
                });
            }
            *active = Some(stop.clone());
        }

        info!("Starting scan for {:?}", timeout);

        let advertisements = match self.source.start().await {
            Ok(s) => s,
            Err(e) => {
                release(&self.active, &stop);
                return Err(e);
            }
        };

        self.discovered.write().clear();

        let window = ScanWindow {
            advertisements,
            deadline: Box::pin(tokio::time::sleep(timeout)),
            stop,
            timeout,
            seen: HashSet::new(),
            discovered: self.discovered.clone(),
            source: self.source.clone(),
            active: self.active.clone(),
            finished: false,
        };

        Ok(stream::unfold(window, ScanWindow::next).boxed())
    }

    /// End the active scan window early.
    ///
    /// The scan stream ends without a [`Error::NoDevicesFound`] item.
    pub async fn stop_scan(&self) -> Result<()> {
        let stop = self.active.write().take();

        let Some(stop) = stop else {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        };

        info!("Stopping scan");
        stop.notify_one();
        self.source.stop().await
    }
}

/// Close the window owning `stop` if it is still the open one.
fn release(active: &ActiveWindow, stop: &Arc<Notify>) -> bool {
    let mut current = active.write();
    match current.as_ref() {
        Some(open) if Arc::ptr_eq(open, stop) => {
            *current = None;
            true
        }
        _ => false,
    }
}

/// State of one open scan window.
struct ScanWindow {
    advertisements: BoxStream<'static, Advertisement>,
    deadline: Pin<Box<Sleep>>,
    stop: Arc<Notify>,
    timeout: Duration,
    seen: HashSet<DeviceIdentity>,
    discovered: Arc<RwLock<HashMap<String, Discovery>>>,
    source: Arc<dyn DiscoverySource>,
    active: ActiveWindow,
    finished: bool,
}

impl ScanWindow {
    async fn next(mut self) -> Option<(Result<DeviceIdentity>, Self)> {
        if self.finished {
            return None;
        }

        loop {
            tokio::select! {
                _ = &mut self.deadline => {
                    debug!("Scan window elapsed with {} devices", self.seen.len());
                    return self.exhausted().await;
                }
                _ = self.stop.notified() => {
                    debug!("Scan stopped early");
                    self.finished = true;
                    return None;
                }
                advertisement = self.advertisements.next() => match advertisement {
                    Some(ad) => {
                        if let Some(identity) = self.record(ad) {
                            return Some((Ok(identity), self));
                        }
                    }
                    None => {
                        debug!("Discovery source ended");
                        return self.exhausted().await;
                    }
                }
            }
        }
    }

    /// Remember an advertisement; returns the identity the first time it is seen.
    fn record(&mut self, ad: Advertisement) -> Option<DeviceIdentity> {
        let key = ad.identity.address().to_string();

        if let Some(known) = self.discovered.write().get_mut(&key) {
            known.rssi = ad.rssi.or(known.rssi);
        }

        if !self.seen.insert(ad.identity.clone()) {
            trace!("Already reported {}", ad.identity);
            return None;
        }

        info!("Discovered {} (RSSI {:?})", ad.identity, ad.rssi);

        self.discovered.write().insert(
            key,
            Discovery {
                identity: ad.identity.clone(),
                rssi: ad.rssi,
            },
        );

        Some(ad.identity)
    }

    async fn exhausted(mut self) -> Option<(Result<DeviceIdentity>, Self)> {
        self.finished = true;

        if release(&self.active, &self.stop) {
            if let Err(e) = self.source.stop().await {
                warn!("Failed to stop discovery source: {}", e);
            }
        }

        if self.seen.is_empty() {
            let err = Error::NoDevicesFound {
                timeout_ms: self.timeout.as_millis(),
            };
            return Some((Err(err), self));
        }

        None
    }
}

impl Drop for ScanWindow {
    fn drop(&mut self) {
        if self.finished || !release(&self.active, &self.stop) {
            return;
        }

        debug!("Scan stream dropped while open, stopping discovery");

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to stop discovery source on");
            return;
        };

        let source = self.source.clone();
        runtime.spawn(async move {
            if let Err(e) = source.stop().await {
                warn!("Failed to stop discovery source: {}", e);
            }
        });
    }
}
