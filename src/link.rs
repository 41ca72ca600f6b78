//! Link state machine.
//!
//! [`LinkManager`] owns the connection lifecycle for one device at a time:
//!
//! ```text
//! Idle --connect()--> Connecting --link up--> Connected
//!   ^                     |                       |
//!   +------ close() / open failure / write fault / link drop
//! ```
//!
//! Every transport operation runs on a single background worker fed by a
//! queue, so writes, opens and closes never overlap. State changes go through
//! one mutex-guarded mutator and are published as [`LinkEvent::StateChanged`]
//! in the order they happen. A generation counter, bumped on every `connect`
//! and `close`, lets the worker recognise work that a later `close` has made
//! obsolete. An open still in flight when `close` is called is abandoned.
//!
//! Nothing is retried automatically.

use futures::stream::StreamExt;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::device::DeviceIdentity;
use crate::dispatcher::{EventDispatcher, LinkEvent};
use crate::error::{Error, ErrorKind, Result};
use crate::protocol::{CommandFrame, TelemetryDecoder};
use crate::transport::{ByteStream, Transport, TransportLink};

/// Lifecycle state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LinkState {
    /// No link and no attempt in progress.
    #[default]
    Idle,
    /// A link is being opened.
    Connecting,
    /// The link is open and telemetry is flowing.
    Connected,
    /// Transport resources are being released.
    ///
    /// Never published: `close()` releases resources before returning and
    /// the next published state is `Idle`.
    Closing,
}

impl LinkState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Closing)
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Closing => write!(f, "Closing"),
        }
    }
}

/// Outcome of a queued command write.
///
/// Resolves once the worker has written the frame or failed to. Dropping it
/// does not cancel the write.
#[derive(Debug)]
pub struct PendingWrite {
    rx: oneshot::Receiver<Result<()>>,
}

impl Future for PendingWrite {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|_| Err(Error::WorkerStopped)))
    }
}

struct Status {
    state: LinkState,
    generation: u64,
    device: Option<DeviceIdentity>,
}

struct Shared {
    status: Mutex<Status>,
    /// Mirrors `Status::generation` for workers waiting on a cancel.
    generations: watch::Sender<u64>,
    dispatcher: Arc<EventDispatcher>,
}

impl Shared {
    /// Supersede all queued and in-flight work. Callers hold the status lock.
    fn bump_generation(&self, status: &mut Status) -> u64 {
        status.generation += 1;
        self.generations.send_replace(status.generation);
        status.generation
    }

    /// The one place the link state changes. Callers hold the status lock.
    fn set_state(&self, status: &mut Status, new_state: LinkState) {
        let old_state = status.state;
        status.state = new_state;

        if new_state == LinkState::Idle {
            status.device = None;
        }

        if old_state != new_state {
            debug!("Link state changed: {} -> {}", old_state, new_state);
            self.dispatcher
                .dispatch(LinkEvent::StateChanged(new_state));
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.status.lock().generation == generation
    }

    /// Drop to Idle and raise an error, unless a later connect/close already
    /// superseded `generation`.
    fn fail(&self, generation: u64, kind: ErrorKind, message: String) {
        let mut status = self.status.lock();

        if status.generation != generation || status.state == LinkState::Idle {
            debug!("Ignoring superseded failure: {}", message);
            return;
        }

        warn!("Link failure ({}): {}", kind, message);
        self.set_state(&mut status, LinkState::Idle);
        self.dispatcher.dispatch(LinkEvent::Error(kind, message));
    }
}

enum Job {
    Open {
        generation: u64,
        identity: DeviceIdentity,
    },
    Write {
        generation: u64,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    LinkDropped {
        generation: u64,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Manages the link to one device.
///
/// Must be created inside a Tokio runtime.
pub struct LinkManager {
    shared: Arc<Shared>,
    jobs: mpsc::UnboundedSender<Job>,
}

impl LinkManager {
    /// Create a link manager over a transport, reporting to `dispatcher`.
    pub fn new(transport: Arc<dyn Transport>, dispatcher: Arc<EventDispatcher>) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        let (generations, generations_rx) = watch::channel(0);

        let shared = Arc::new(Shared {
            status: Mutex::new(Status {
                state: LinkState::Idle,
                generation: 0,
                device: None,
            }),
            generations,
            dispatcher,
        });

        let worker = Worker {
            shared: shared.clone(),
            transport,
            jobs: jobs.clone(),
            generations: generations_rx,
            active: None,
        };
        tokio::spawn(worker.run(rx));

        Self { shared, jobs }
    }

    /// Start connecting to a device.
    ///
    /// Returns as soon as the attempt is queued; the outcome arrives as a
    /// `StateChanged(Connected)` event, or as `StateChanged(Idle)` followed
    /// by an `Error` event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the link is `Idle`.
    pub fn connect(&self, identity: DeviceIdentity) -> Result<()> {
        let mut status = self.shared.status.lock();

        if status.state != LinkState::Idle {
            return Err(Error::InvalidState {
                operation: "connect",
                state: status.state.to_string(),
            });
        }

        if self.jobs.is_closed() {
            return Err(Error::WorkerStopped);
        }

        info!("Connecting to {}", identity);

        let generation = self.shared.bump_generation(&mut status);
        self.shared.set_state(&mut status, LinkState::Connecting);
        status.device = Some(identity.clone());

        let _ = self.jobs.send(Job::Open {
            generation,
            identity,
        });

        Ok(())
    }

    /// Queue a command for the device.
    ///
    /// The returned [`PendingWrite`] resolves to the write outcome. A failed
    /// write also drops the link to `Idle` and raises an `Error` event. The
    /// command is never retried.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] unless the link is `Connected`; the
    /// transport is not touched in that case.
    pub fn send(&self, frame: CommandFrame) -> Result<PendingWrite> {
        let status = self.shared.status.lock();

        if status.state != LinkState::Connected {
            return Err(Error::NotConnected);
        }

        debug!("Queueing command {}", frame);

        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(Job::Write {
                generation: status.generation,
                data: frame.encode(),
                reply,
            })
            .map_err(|_| Error::WorkerStopped)?;

        Ok(PendingWrite { rx })
    }

    /// Close the link.
    ///
    /// Safe to call in any state and more than once. The state is `Idle` as
    /// soon as this is called. A connect still in progress is abandoned; the
    /// returned future completes once transport resources have been released.
    pub async fn close(&self) {
        let released = {
            let mut status = self.shared.status.lock();
            self.shared.bump_generation(&mut status);
            self.shared.set_state(&mut status, LinkState::Idle);

            let (reply, rx) = oneshot::channel();
            if self.jobs.send(Job::Close { reply }).is_err() {
                debug!("Link worker already stopped");
                None
            } else {
                Some(rx)
            }
        };

        if let Some(rx) = released {
            let _ = rx.await;
        }
    }

    /// The last published link state.
    pub fn current_state(&self) -> LinkState {
        self.shared.status.lock().state
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.current_state().is_connected()
    }

    /// The device the link is open to or opening.
    pub fn current_device(&self) -> Option<DeviceIdentity> {
        self.shared.status.lock().device.clone()
    }

    /// Get the event dispatcher.
    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.shared.dispatcher
    }

    /// Subscribe to all link events.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.shared.dispatcher.subscribe()
    }
}

impl Drop for LinkManager {
    fn drop(&mut self) {
        let _ = self.jobs.send(Job::Shutdown);
    }
}

struct ActiveLink {
    generation: u64,
    link: Box<dyn TransportLink>,
    reader: JoinHandle<()>,
}

/// Background owner of the transport and the open link.
struct Worker {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    jobs: mpsc::UnboundedSender<Job>,
    generations: watch::Receiver<u64>,
    active: Option<ActiveLink>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Job>) {
        debug!("Link worker started");

        while let Some(job) = rx.recv().await {
            match job {
                Job::Open {
                    generation,
                    identity,
                } => self.open(generation, identity).await,
                Job::Write {
                    generation,
                    data,
                    reply,
                } => {
                    let result = self.write(generation, &data).await;
                    let _ = reply.send(result);
                }
                Job::LinkDropped { generation } => self.link_dropped(generation).await,
                Job::Close { reply } => {
                    self.release().await;
                    let _ = reply.send(());
                }
                Job::Shutdown => {
                    self.release().await;
                    break;
                }
            }
        }

        debug!("Link worker stopped");
    }

    async fn open(&mut self, generation: u64, identity: DeviceIdentity) {
        if !self.shared.is_current(generation) {
            debug!("Skipping superseded connect to {}", identity);
            return;
        }

        self.release().await;

        let opened = tokio::select! {
            result = self.transport.open(&identity) => Some(result),
            _ = superseded(self.generations.clone(), generation) => None,
        };

        let mut link = match opened {
            Some(Ok(link)) => link,
            Some(Err(e)) => {
                error!("Failed to open link to {}: {}", identity, e);
                self.shared.fail(
                    generation,
                    boundary_kind(&e),
                    format!("Connection to {} failed: {}", identity, e),
                );
                return;
            }
            None => {
                info!("Connect to {} abandoned by close", identity);
                return;
            }
        };

        let stream = match link.read_stream() {
            Ok(stream) => stream,
            Err(e) => {
                close_quietly(link.as_ref()).await;
                self.shared.fail(
                    generation,
                    ErrorKind::TransportFault,
                    format!("No telemetry stream from {}: {}", identity, e),
                );
                return;
            }
        };

        let admitted = {
            let mut status = self.shared.status.lock();
            if status.generation == generation && status.state == LinkState::Connecting {
                self.shared.set_state(&mut status, LinkState::Connected);
                true
            } else {
                false
            }
        };

        if !admitted {
            info!("Link to {} opened after close, releasing it", identity);
            close_quietly(link.as_ref()).await;
            return;
        }

        info!("Connected to {}", identity);

        let reader = self.spawn_reader(generation, stream);
        self.active = Some(ActiveLink {
            generation,
            link,
            reader,
        });
    }

    async fn write(&mut self, generation: u64, data: &[u8]) -> Result<()> {
        let active = match &self.active {
            Some(active) if active.generation == generation => active,
            _ => return Err(Error::NotConnected),
        };

        if !self.shared.is_current(generation) {
            return Err(Error::NotConnected);
        }

        let result = active.link.write(data).await;

        match result {
            Ok(()) => {
                trace!("Wrote {:?}", String::from_utf8_lossy(data));
                Ok(())
            }
            Err(e) => {
                error!("Command write failed: {}", e);
                self.release().await;

                let e = Error::WriteFailed {
                    source: Box::new(e),
                };
                self.shared
                    .fail(generation, ErrorKind::TransportFault, e.to_string());
                Err(e)
            }
        }
    }

    async fn link_dropped(&mut self, generation: u64) {
        match &self.active {
            Some(active) if active.generation == generation => {}
            _ => return,
        }

        self.release().await;
        self.shared.fail(
            generation,
            ErrorKind::TransportFault,
            Error::ConnectionLost.to_string(),
        );
    }

    /// Close the open link, if any.
    async fn release(&mut self) {
        if let Some(active) = self.active.take() {
            active.reader.abort();
            close_quietly(active.link.as_ref()).await;
            debug!("Released link (generation {})", active.generation);
        }
    }

    fn spawn_reader(&self, generation: u64, mut stream: ByteStream) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let jobs = self.jobs.clone();
        let mut decoder = TelemetryDecoder::new(self.transport.framing());

        tokio::spawn(async move {
            while let Some(chunk) = stream.next().await {
                if !shared.is_current(generation) {
                    break;
                }
                for sample in decoder.push(&chunk) {
                    shared
                        .dispatcher
                        .dispatch(LinkEvent::TelemetryReceived(sample));
                }
            }

            debug!("Telemetry stream ended (generation {})", generation);
            let _ = jobs.send(Job::LinkDropped { generation });
        })
    }
}

/// Resolves once `generation` is no longer the current one.
async fn superseded(mut generations: watch::Receiver<u64>, generation: u64) {
    loop {
        if *generations.borrow_and_update() != generation {
            return;
        }
        if generations.changed().await.is_err() {
            return;
        }
    }
}

/// Error kind reported for a failed open. Anything but a missing radio
/// permission is a transport fault.
fn boundary_kind(e: &Error) -> ErrorKind {
    match e.kind() {
        ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
        _ => ErrorKind::TransportFault,
    }
}

async fn close_quietly(link: &dyn TransportLink) {
    if let Err(e) = link.close().await {
        warn!("Error closing link: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_telemetry_bytes, CalibrationPhase, Framing, TelemetrySample};
    use crate::transport::MockTransport;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// In-memory device the fake transport talks to.
    #[derive(Default)]
    struct FakeDevice {
        writes: Mutex<Vec<Vec<u8>>>,
        fail_writes: AtomicBool,
        fail_open: AtomicBool,
        /// Radio reports "not connected" on open and write.
        refuse: AtomicBool,
        open_delay: Mutex<Duration>,
        opens: AtomicUsize,
        closes: AtomicUsize,
        inbound: Mutex<Option<futures::channel::mpsc::UnboundedSender<Vec<u8>>>>,
    }

    impl FakeDevice {
        fn push(&self, bytes: &[u8]) {
            if let Some(tx) = self.inbound.lock().as_ref() {
                let _ = tx.unbounded_send(bytes.to_vec());
            }
        }

        fn drop_link(&self) {
            self.inbound.lock().take();
        }

        fn writes(&self) -> Vec<Vec<u8>> {
            self.writes.lock().clone()
        }
    }

    struct FakeTransport {
        device: Arc<FakeDevice>,
        framing: Framing,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn framing(&self) -> Framing {
            self.framing
        }

        async fn open(&self, _identity: &DeviceIdentity) -> Result<Box<dyn TransportLink>> {
            let delay = *self.device.open_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            self.device.opens.fetch_add(1, Ordering::SeqCst);

            if self.device.fail_open.load(Ordering::SeqCst) {
                return Err(Error::ConnectionFailed {
                    reason: "out of range".to_string(),
                });
            }
            if self.device.refuse.load(Ordering::SeqCst) {
                return Err(Error::Bluetooth(btleplug::Error::NotConnected));
            }

            let (tx, rx) = futures::channel::mpsc::unbounded();
            *self.device.inbound.lock() = Some(tx);

            Ok(Box::new(FakeLink {
                device: self.device.clone(),
                inbound: Mutex::new(Some(rx.boxed())),
                open: AtomicBool::new(true),
            }))
        }
    }

    struct FakeLink {
        device: Arc<FakeDevice>,
        inbound: Mutex<Option<ByteStream>>,
        open: AtomicBool,
    }

    #[async_trait]
    impl TransportLink for FakeLink {
        async fn write(&self, data: &[u8]) -> Result<()> {
            if !self.open.load(Ordering::SeqCst) {
                return Err(Error::NotConnected);
            }
            self.device.writes.lock().push(data.to_vec());
            if self.device.refuse.load(Ordering::SeqCst) {
                return Err(Error::Bluetooth(btleplug::Error::NotConnected));
            }
            if self.device.fail_writes.load(Ordering::SeqCst) {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "radio fault",
                )));
            }
            Ok(())
        }

        fn read_stream(&mut self) -> Result<ByteStream> {
            self.inbound.lock().take().ok_or(Error::NotConnected)
        }

        async fn close(&self) -> Result<()> {
            if self.open.swap(false, Ordering::SeqCst) {
                self.device.closes.fetch_add(1, Ordering::SeqCst);
                self.device.drop_link();
            }
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    fn hand() -> DeviceIdentity {
        DeviceIdentity::new("24:6F:28:AA:BB:CC", Some("ESP32 Hand".to_string()))
    }

    fn setup(framing: Framing) -> (LinkManager, Arc<FakeDevice>, broadcast::Receiver<LinkEvent>) {
        let device = Arc::new(FakeDevice::default());
        let dispatcher = Arc::new(EventDispatcher::new(64));
        let events = dispatcher.subscribe();
        let transport = Arc::new(FakeTransport {
            device: device.clone(),
            framing,
        });
        (LinkManager::new(transport, dispatcher), device, events)
    }

    async fn next_event(events: &mut broadcast::Receiver<LinkEvent>) -> LinkEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn remaining_events(events: &mut broadcast::Receiver<LinkEvent>) -> Vec<LinkEvent> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut rest = Vec::new();
        while let Ok(event) = events.try_recv() {
            rest.push(event);
        }
        rest
    }

    async fn connect(link: &LinkManager, events: &mut broadcast::Receiver<LinkEvent>) {
        link.connect(hand()).unwrap();
        assert_eq!(
            next_event(events).await,
            LinkEvent::StateChanged(LinkState::Connecting)
        );
        assert_eq!(
            next_event(events).await,
            LinkEvent::StateChanged(LinkState::Connected)
        );
    }

    #[test]
    fn test_link_state() {
        assert!(LinkState::Connected.is_connected());
        assert!(!LinkState::Connecting.is_connected());
        assert!(LinkState::Connecting.is_transitioning());
        assert!(!LinkState::Idle.is_transitioning());
        assert_eq!(LinkState::default(), LinkState::Idle);
        assert_eq!(format!("{}", LinkState::Connected), "Connected");
    }

    #[tokio::test]
    async fn test_send_while_idle_never_touches_transport() {
        let mut transport = MockTransport::new();
        transport.expect_open().never();

        let link = LinkManager::new(Arc::new(transport), Arc::new(EventDispatcher::new(8)));

        let err = link.send(CommandFrame::motor(1, 90)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);

        let err = link.send(CommandFrame::EmergencyStop).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);

        link.close().await;
        assert_eq!(link.current_state(), LinkState::Idle);
    }

    #[tokio::test]
    async fn test_connect_reaches_connected() {
        let (link, device, mut events) = setup(Framing::Datagram);

        connect(&link, &mut events).await;

        assert!(link.is_connected());
        assert_eq!(link.current_device(), Some(hand()));
        assert_eq!(device.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_when_not_idle_is_invalid_state() {
        let (link, device, mut events) = setup(Framing::Datagram);
        connect(&link, &mut events).await;

        let err = link.connect(hand()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(device.opens.load(Ordering::SeqCst), 1);
        assert_eq!(link.current_state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn test_motor_move_then_write_fault() {
        let (link, device, mut events) = setup(Framing::Datagram);
        connect(&link, &mut events).await;

        device.fail_writes.store(true, Ordering::SeqCst);
        let err = link
            .send(CommandFrame::motor(1, 90))
            .unwrap()
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::TransportFault);
        assert_eq!(device.writes(), vec![b"M1:90".to_vec()]);
        assert_eq!(
            next_event(&mut events).await,
            LinkEvent::StateChanged(LinkState::Idle)
        );
        assert!(matches!(
            next_event(&mut events).await,
            LinkEvent::Error(ErrorKind::TransportFault, _)
        ));
        assert_eq!(link.current_state(), LinkState::Idle);
        assert_eq!(link.current_device(), None);

        let errors = remaining_events(&mut events)
            .await
            .into_iter()
            .filter(|e| matches!(e, LinkEvent::Error(..)))
            .count();
        assert_eq!(errors, 0);
        assert_eq!(device.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_emergency_stop_is_literal_regardless_of_history() {
        let (link, device, mut events) = setup(Framing::Datagram);
        connect(&link, &mut events).await;

        for frame in [
            CommandFrame::motor(2, 180),
            CommandFrame::sensor(1, 42),
            CommandFrame::calibration(CalibrationPhase::Start),
            CommandFrame::EmergencyStop,
        ] {
            link.send(frame).unwrap().await.unwrap();
        }

        assert_eq!(
            device.writes(),
            vec![
                b"M2:180".to_vec(),
                b"S1:42".to_vec(),
                b"C:START".to_vec(),
                b"STOP".to_vec(),
            ]
        );
    }

    #[tokio::test]
    async fn test_link_drop_returns_to_idle() {
        let (link, device, mut events) = setup(Framing::Datagram);
        connect(&link, &mut events).await;

        device.drop_link();

        assert_eq!(
            next_event(&mut events).await,
            LinkEvent::StateChanged(LinkState::Idle)
        );
        assert_eq!(
            next_event(&mut events).await,
            LinkEvent::Error(ErrorKind::TransportFault, "Connection lost".to_string())
        );

        let err = link.send(CommandFrame::EmergencyStop).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_telemetry_forwarded_in_order() {
        let (link, device, mut events) = setup(Framing::Stream);
        connect(&link, &mut events).await;

        let mut wire = encode_telemetry_bytes(120, 340).to_vec();
        wire.extend_from_slice(&encode_telemetry_bytes(121, 341));
        device.push(&wire[..5]);
        device.push(&wire[5..]);

        let expected = [
            TelemetrySample {
                sequence: 0,
                channel_1: 120,
                channel_2: 340,
            },
            TelemetrySample {
                sequence: 1,
                channel_1: 121,
                channel_2: 341,
            },
        ];
        for sample in expected {
            assert_eq!(
                next_event(&mut events).await,
                LinkEvent::TelemetryReceived(sample)
            );
        }
    }

    #[tokio::test]
    async fn test_short_notifications_are_ignored() {
        let (link, device, mut events) = setup(Framing::Datagram);
        connect(&link, &mut events).await;

        device.push(&[0x01, 0x02, 0x03]);
        device.push(&encode_telemetry_bytes(7, 9));

        assert_eq!(
            next_event(&mut events).await,
            LinkEvent::TelemetryReceived(TelemetrySample::new(7, 9))
        );
        assert!(link.is_connected());
    }

    #[tokio::test]
    async fn test_open_failure_returns_to_idle_with_error() {
        let (link, device, mut events) = setup(Framing::Datagram);
        device.fail_open.store(true, Ordering::SeqCst);

        link.connect(hand()).unwrap();

        assert_eq!(
            next_event(&mut events).await,
            LinkEvent::StateChanged(LinkState::Connecting)
        );
        assert_eq!(
            next_event(&mut events).await,
            LinkEvent::StateChanged(LinkState::Idle)
        );
        match next_event(&mut events).await {
            LinkEvent::Error(kind, message) => {
                assert_eq!(kind, ErrorKind::TransportFault);
                assert!(message.contains("out of range"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        device.fail_open.store(false, Ordering::SeqCst);
        connect(&link, &mut events).await;
    }

    #[tokio::test]
    async fn test_close_abandons_slow_connect() {
        let (link, device, mut events) = setup(Framing::Datagram);
        *device.open_delay.lock() = Duration::from_secs(30);

        link.connect(hand()).unwrap();
        // Let the worker begin the slow open.
        tokio::time::sleep(Duration::from_millis(10)).await;

        tokio::time::timeout(Duration::from_secs(1), link.close())
            .await
            .expect("close waited for the open to finish");

        assert_eq!(link.current_state(), LinkState::Idle);
        assert_eq!(device.opens.load(Ordering::SeqCst), 0);
        assert_eq!(device.closes.load(Ordering::SeqCst), 0);

        assert_eq!(
            next_event(&mut events).await,
            LinkEvent::StateChanged(LinkState::Connecting)
        );
        assert_eq!(
            next_event(&mut events).await,
            LinkEvent::StateChanged(LinkState::Idle)
        );
        assert_eq!(remaining_events(&mut events).await, Vec::new());

        *device.open_delay.lock() = Duration::ZERO;
        connect(&link, &mut events).await;
        assert_eq!(device.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_radio_refusals_surface_as_transport_faults() {
        let (link, device, mut events) = setup(Framing::Datagram);
        device.refuse.store(true, Ordering::SeqCst);

        link.connect(hand()).unwrap();
        assert_eq!(
            next_event(&mut events).await,
            LinkEvent::StateChanged(LinkState::Connecting)
        );
        assert_eq!(
            next_event(&mut events).await,
            LinkEvent::StateChanged(LinkState::Idle)
        );
        assert!(matches!(
            next_event(&mut events).await,
            LinkEvent::Error(ErrorKind::TransportFault, _)
        ));

        device.refuse.store(false, Ordering::SeqCst);
        connect(&link, &mut events).await;
        device.refuse.store(true, Ordering::SeqCst);

        let err = link
            .send(CommandFrame::EmergencyStop)
            .unwrap()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportFault);
        assert!(matches!(err, Error::WriteFailed { .. }));

        assert_eq!(
            next_event(&mut events).await,
            LinkEvent::StateChanged(LinkState::Idle)
        );
        assert!(matches!(
            next_event(&mut events).await,
            LinkEvent::Error(ErrorKind::TransportFault, _)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (link, device, mut events) = setup(Framing::Datagram);

        link.close().await;
        link.close().await;
        assert_eq!(link.current_state(), LinkState::Idle);
        assert_eq!(remaining_events(&mut events).await, Vec::new());

        connect(&link, &mut events).await;
        link.close().await;
        link.close().await;

        assert_eq!(device.closes.load(Ordering::SeqCst), 1);
        assert_eq!(
            next_event(&mut events).await,
            LinkEvent::StateChanged(LinkState::Idle)
        );
        assert_eq!(remaining_events(&mut events).await, Vec::new());
    }

    #[tokio::test]
    async fn test_state_is_never_mid_transition() {
        let (link, device, _events) = setup(Framing::Datagram);
        let link = Arc::new(link);

        let observer = {
            let link = link.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    let state = link.current_state();
                    assert!(matches!(
                        state,
                        LinkState::Idle | LinkState::Connecting | LinkState::Connected
                    ));
                    tokio::task::yield_now().await;
                }
            })
        };

        for i in 0..20 {
            link.connect(hand()).unwrap();
            if i % 2 == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            link.close().await;
            assert_eq!(link.current_state(), LinkState::Idle);
        }

        observer.await.unwrap();
        assert_eq!(
            device.opens.load(Ordering::SeqCst),
            device.closes.load(Ordering::SeqCst)
        );
    }
}
