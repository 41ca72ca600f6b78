//! Event delivery to the application.
//!
//! Each event category (state, telemetry, discovery, error) has its own
//! bounded FIFO queue and delivery task, so high-rate telemetry never waits
//! behind state events and vice versa. Ordering is guaranteed within a
//! category only. When a listener falls so far behind that its queue is
//! full, new events for that category are dropped with a warning. A
//! panicking listener is logged and does not stop delivery.
//!
//! One listener per category is active at a time; registering a new one
//! replaces the previous registration. Events raised while no listener is
//! registered are dropped. Every event is additionally published on a
//! broadcast channel for applications that prefer to pull events on their
//! own executor.

use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, trace, warn};

use crate::device::DeviceIdentity;
use crate::error::ErrorKind;
use crate::link::LinkState;
use crate::protocol::TelemetrySample;

/// Everything the link core reports to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link state changed.
    StateChanged(LinkState),
    /// A telemetry sample arrived.
    TelemetryReceived(TelemetrySample),
    /// A scan found a new device.
    DeviceDiscovered(DeviceIdentity),
    /// Something failed. The message is for humans and is not localized.
    Error(ErrorKind, String),
}

/// Callback handle for unregistering callbacks.
///
/// Dropping the handle unregisters the callback, unless another callback
/// has replaced it in the meantime. Call [`CallbackHandle::detach`] to keep
/// the callback registered for the dispatcher's lifetime.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle.
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Keep the callback registered after this handle is dropped.
    pub fn detach(mut self) {
        self.unregister_fn = None;
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

type Listener<T> = Arc<dyn Fn(T) + Send + Sync>;
type Slot<T> = Arc<RwLock<Option<(u64, Listener<T>)>>>;

/// One event category: a queue, a delivery task and the listener slot.
struct Category<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
    slot: Slot<T>,
}

impl<T: Send + 'static> Category<T> {
    fn new(name: &'static str, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<T>(capacity.max(1));
        let slot: Slot<T> = Arc::new(RwLock::new(None));

        let delivery_slot = slot.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let listener = delivery_slot.read().as_ref().map(|(_, l)| l.clone());
                let Some(listener) = listener else {
                    trace!("No {} listener, dropping event", name);
                    continue;
                };
                if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                    error!("{} listener panicked", name);
                }
            }
            trace!("{} delivery task ended", name);
        });

        Self { name, tx, slot }
    }

    fn push(&self, event: T) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("{} listener is falling behind, dropping event", self.name)
            }
            Err(TrySendError::Closed(_)) => trace!("{} delivery task gone", self.name),
        }
    }

    fn register(&self, id: u64, listener: Listener<T>) -> CallbackHandle {
        *self.slot.write() = Some((id, listener));

        let slot = self.slot.clone();
        CallbackHandle::new(id, move || {
            let mut slot = slot.write();
            if matches!(slot.as_ref(), Some((current, _)) if *current == id) {
                *slot = None;
            }
        })
    }

    fn clear(&self) {
        *self.slot.write() = None;
    }
}

/// Routes [`LinkEvent`]s to the registered listeners.
///
/// Must be created inside a Tokio runtime.
pub struct EventDispatcher {
    state: Category<LinkState>,
    telemetry: Category<TelemetrySample>,
    discovery: Category<DeviceIdentity>,
    error: Category<(ErrorKind, String)>,
    /// Channel for all events.
    event_tx: broadcast::Sender<LinkEvent>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
}

impl EventDispatcher {
    /// Create a dispatcher whose broadcast channel and per-category queues
    /// each hold `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));

        Self {
            state: Category::new("state", capacity),
            telemetry: Category::new("telemetry", capacity),
            discovery: Category::new("discovery", capacity),
            error: Category::new("error", capacity),
            event_tx,
            callback_counter: AtomicU64::new(0),
        }
    }

    /// Queue an event for delivery. Never blocks.
    pub fn dispatch(&self, event: LinkEvent) {
        let _ = self.event_tx.send(event.clone());

        match event {
            LinkEvent::StateChanged(state) => self.state.push(state),
            LinkEvent::TelemetryReceived(sample) => self.telemetry.push(sample),
            LinkEvent::DeviceDiscovered(identity) => self.discovery.push(identity),
            LinkEvent::Error(kind, message) => self.error.push((kind, message)),
        }
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.event_tx.subscribe()
    }

    /// Register the state-change callback.
    pub fn on_state_changed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(LinkState) + Send + Sync + 'static,
    {
        self.state.register(self.next_id(), Arc::new(callback))
    }

    /// Register the telemetry callback.
    pub fn on_telemetry<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(TelemetrySample) + Send + Sync + 'static,
    {
        self.telemetry.register(self.next_id(), Arc::new(callback))
    }

    /// Register the device-discovered callback.
    pub fn on_device_found<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(DeviceIdentity) + Send + Sync + 'static,
    {
        self.discovery.register(self.next_id(), Arc::new(callback))
    }

    /// Register the error callback.
    pub fn on_error<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(ErrorKind, String) + Send + Sync + 'static,
    {
        self.error.register(
            self.next_id(),
            Arc::new(move |(kind, message): (ErrorKind, String)| {
                callback(kind, message)
            }),
        )
    }

    /// Drop every registered callback.
    pub fn clear_listeners(&self) {
        self.state.clear();
        self.telemetry.clear();
        self.discovery.clear();
        self.error.clear();
    }

    fn next_id(&self) -> u64 {
        self.callback_counter.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_fifo_within_category() {
        let dispatcher = EventDispatcher::new(64);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let _handle = dispatcher.on_telemetry(move |sample| sink.lock().push(sample.channel_1));

        for i in 0..50 {
            dispatcher.dispatch(LinkEvent::TelemetryReceived(TelemetrySample::new(i, 0)));
        }
        settle().await;

        assert_eq!(*seen.lock(), (0..50).collect::<Vec<u16>>());
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let dispatcher = EventDispatcher::new(16);
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));

        let sink = first.clone();
        let first_handle = dispatcher.on_state_changed(move |s| sink.lock().push(s));
        let sink = second.clone();
        let _second_handle = dispatcher.on_state_changed(move |s| sink.lock().push(s));

        // The replaced handle must not unregister its successor.
        drop(first_handle);

        dispatcher.dispatch(LinkEvent::StateChanged(LinkState::Connecting));
        settle().await;

        assert!(first.lock().is_empty());
        assert_eq!(*second.lock(), vec![LinkState::Connecting]);
    }

    #[tokio::test]
    async fn test_dropped_handle_unregisters() {
        let dispatcher = EventDispatcher::new(16);
        let seen = Arc::new(Mutex::new(0usize));

        let sink = seen.clone();
        let handle = dispatcher.on_device_found(move |_| *sink.lock() += 1);
        handle.unregister();

        dispatcher.dispatch(LinkEvent::DeviceDiscovered(DeviceIdentity::new("AA", None)));
        settle().await;

        assert_eq!(*seen.lock(), 0);
    }

    #[tokio::test]
    async fn test_detached_handle_stays_registered() {
        let dispatcher = EventDispatcher::new(16);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        dispatcher
            .on_error(move |kind, message| sink.lock().push((kind, message)))
            .detach();

        dispatcher.dispatch(LinkEvent::Error(
            ErrorKind::TransportFault,
            "write failed".to_string(),
        ));
        settle().await;

        assert_eq!(
            *seen.lock(),
            vec![(ErrorKind::TransportFault, "write failed".to_string())]
        );
    }

    #[tokio::test]
    async fn test_broadcast_sees_every_event_in_order() {
        let dispatcher = EventDispatcher::new(16);
        let mut rx = dispatcher.subscribe();

        dispatcher.dispatch(LinkEvent::StateChanged(LinkState::Connecting));
        dispatcher.dispatch(LinkEvent::TelemetryReceived(TelemetrySample::new(1, 2)));
        dispatcher.dispatch(LinkEvent::StateChanged(LinkState::Connected));

        assert_eq!(
            rx.recv().await.unwrap(),
            LinkEvent::StateChanged(LinkState::Connecting)
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            LinkEvent::TelemetryReceived(TelemetrySample::new(1, 2))
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            LinkEvent::StateChanged(LinkState::Connected)
        );
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_stop_delivery() {
        let dispatcher = EventDispatcher::new(16);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let _first = dispatcher.on_state_changed(|_| panic!("listener bug"));
        dispatcher.dispatch(LinkEvent::StateChanged(LinkState::Connecting));
        settle().await;

        let sink = seen.clone();
        let _second = dispatcher.on_state_changed(move |s| sink.lock().push(s));
        dispatcher.dispatch(LinkEvent::StateChanged(LinkState::Idle));
        settle().await;

        assert_eq!(*seen.lock(), vec![LinkState::Idle]);
    }

    #[tokio::test]
    async fn test_full_queue_drops_newest_events() {
        let dispatcher = EventDispatcher::new(8);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let _handle = dispatcher.on_telemetry(move |sample| sink.lock().push(sample.channel_1));

        // The delivery task cannot run until this test yields.
        for i in 0..20 {
            dispatcher.dispatch(LinkEvent::TelemetryReceived(TelemetrySample::new(i, 0)));
        }
        settle().await;

        assert_eq!(*seen.lock(), (0..8).collect::<Vec<u16>>());

        dispatcher.dispatch(LinkEvent::TelemetryReceived(TelemetrySample::new(99, 0)));
        settle().await;
        assert_eq!(seen.lock().last(), Some(&99));
    }

    #[tokio::test]
    async fn test_clear_listeners() {
        let dispatcher = EventDispatcher::default();
        let seen = Arc::new(Mutex::new(0usize));

        let sink = seen.clone();
        dispatcher.on_state_changed(move |_| *sink.lock() += 1).detach();
        dispatcher.clear_listeners();

        dispatcher.dispatch(LinkEvent::StateChanged(LinkState::Idle));
        settle().await;

        assert_eq!(*seen.lock(), 0);
    }
}
