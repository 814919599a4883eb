//! Per-device poll coordinator.
//!
//! Owns the two polling loops (main, pressure), the rate tracker and one cache
//! entry per channel. Consumers read the cache through [`Coordinator::latest`]
//! or a cloned [`CacheHandle`] and never touch the network; push-style
//! consumers can [`subscribe`](Coordinator::subscribe) to cycle events.
//!
//! Lifecycle
//! - `start()` runs one main and one pressure cycle on the caller's thread.
//!   Either failing is fatal to setup and nothing is cached.
//! - Afterwards each channel runs on its own thread. A failed cycle keeps the
//!   previous snapshot and marks the channel stale until the next success.
//! - `stop()` interrupts both loops and joins them; nothing is written to the
//!   cache once it returns.

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

use crate::client::{Transport, TrioClient};
use crate::config::Config;
use crate::models::device::{Channel, DeviceInfo, Snapshot};
use crate::services::assemble::CycleError;
use crate::services::rate::RateTracker;
use crate::services::realtime;
use crate::shutdown::Shutdown;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("device at {host} unreachable during {channel} bootstrap: {source}")]
    DeviceUnreachable {
        host: String,
        channel: Channel,
        #[source]
        source: CycleError,
    },
    #[error("coordinator already started")]
    AlreadyStarted,
    #[error("coordinator has been stopped")]
    Stopped,
    #[error("failed to spawn {channel} poll thread: {message}")]
    Spawn { channel: Channel, message: String },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Uninitialized,
    Bootstrapping,
    Ready,
    ReadyWithStaleError,
    /// Bootstrap failed; `start()` may be retried.
    Unavailable,
}

/// Read-only copy of a channel's cache entry.
#[derive(Debug, Clone)]
pub struct Latest {
    pub snapshot: Arc<Snapshot>,
    /// Time of the last successful fetch.
    pub fetched_at: DateTime<Utc>,
    pub is_stale: bool,
    pub last_error: Option<CycleError>,
}

#[derive(Debug, Clone)]
pub enum Event {
    Published { channel: Channel, snapshot: Arc<Snapshot> },
    Failed { channel: Channel, error: CycleError },
}

/// Events queued per subscriber before further events are dropped.
pub const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug, Clone)]
struct CacheEntry {
    state: ChannelState,
    snapshot: Option<Arc<Snapshot>>,
    last_error: Option<CycleError>,
}

impl Default for CacheEntry {
    fn default() -> Self {
        CacheEntry {
            state: ChannelState::Uninitialized,
            snapshot: None,
            last_error: None,
        }
    }
}

/// State shared between the coordinator, its loops and cache handles.
/// Each entry has a single writer (its loop) and is replaced under the write
/// lock, so readers see either the previous or the next entry.
#[derive(Debug)]
pub(crate) struct Shared {
    main: RwLock<CacheEntry>,
    pressure: RwLock<CacheEntry>,
    subscribers: Mutex<Vec<SyncSender<Event>>>,
    shutdown: Shutdown,
}

impl Shared {
    pub(crate) fn new(shutdown: Shutdown) -> Self {
        Shared {
            main: RwLock::new(CacheEntry::default()),
            pressure: RwLock::new(CacheEntry::default()),
            subscribers: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    fn entry(&self, channel: Channel) -> &RwLock<CacheEntry> {
        match channel {
            Channel::Main => &self.main,
            Channel::Pressure => &self.pressure,
        }
    }

    pub(crate) fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Replace the channel's snapshot. Returns `false` (and drops the
    /// snapshot) once shutdown has begun.
    pub(crate) fn publish(&self, channel: Channel, snapshot: Snapshot) -> bool {
        let snapshot = Arc::new(snapshot);
        {
            let mut entry = self.entry(channel).write();
            if self.shutdown.is_triggered() {
                return false;
            }
            *entry = CacheEntry {
                state: ChannelState::Ready,
                snapshot: Some(Arc::clone(&snapshot)),
                last_error: None,
            };
        }
        self.notify(Event::Published { channel, snapshot });
        true
    }

    /// Keep the cached snapshot, remember `error` and flag the channel stale.
    pub(crate) fn record_failure(&self, channel: Channel, error: CycleError) -> bool {
        {
            let mut entry = self.entry(channel).write();
            if self.shutdown.is_triggered() {
                return false;
            }
            entry.state = ChannelState::ReadyWithStaleError;
            entry.last_error = Some(error.clone());
        }
        self.notify(Event::Failed { channel, error });
        true
    }

    fn set_state(&self, channel: Channel, state: ChannelState) {
        self.entry(channel).write().state = state;
    }

    fn state(&self, channel: Channel) -> ChannelState {
        self.entry(channel).read().state
    }

    fn latest(&self, channel: Channel) -> Option<Latest> {
        let entry = self.entry(channel).read();
        let snapshot = entry.snapshot.clone()?;
        Some(Latest {
            fetched_at: snapshot.captured_at,
            snapshot,
            is_stale: entry.state == ChannelState::ReadyWithStaleError,
            last_error: entry.last_error.clone(),
        })
    }

    pub(crate) fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = mpsc::sync_channel(SUBSCRIBER_BUFFER);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Best-effort delivery: a full queue loses the event, a dropped
    /// receiver is pruned.
    fn notify(&self, event: Event) {
        self.subscribers.lock().retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Poll: subscriber queue full; event dropped");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

/// Cloneable read side of a coordinator's cache.
#[derive(Debug, Clone)]
pub struct CacheHandle {
    shared: Arc<Shared>,
}

impl CacheHandle {
    pub fn latest(&self, channel: Channel) -> Option<Latest> {
        self.shared.latest(channel)
    }

    pub fn state(&self, channel: Channel) -> ChannelState {
        self.shared.state(channel)
    }

    pub fn subscribe(&self) -> Receiver<Event> {
        self.shared.subscribe()
    }
}

pub struct Coordinator<T: Transport + 'static> {
    host: String,
    port: u16,
    main_interval: Duration,
    pressure_interval: Duration,
    transport: Arc<T>,
    shared: Arc<Shared>,
    /// Moved into the main loop once bootstrap succeeds.
    tracker: Option<RateTracker>,
    workers: Vec<JoinHandle<()>>,
}

impl Coordinator<TrioClient> {
    /// Coordinator polling the device described by `cfg` over HTTP.
    pub fn new(cfg: &Config) -> Self {
        let shutdown = Shutdown::new();
        let client = TrioClient::new(cfg, shutdown.clone());
        Self::with_transport(cfg, client, shutdown)
    }
}

impl<T: Transport + 'static> Coordinator<T> {
    /// `shutdown` should be the signal `transport` watches, so that `stop()`
    /// also cuts its retry backoff short.
    pub fn with_transport(cfg: &Config, transport: T, shutdown: Shutdown) -> Self {
        Coordinator {
            host: cfg.host.clone(),
            port: cfg.port,
            main_interval: cfg.main_interval,
            pressure_interval: cfg.pressure_interval,
            transport: Arc::new(transport),
            shared: Arc::new(Shared::new(shutdown)),
            tracker: Some(RateTracker::new()),
            workers: Vec::new(),
        }
    }

    /// Fetch both channels once, publish them, then start the loops.
    pub fn start(&mut self) -> Result<(), CoordinatorError> {
        if self.shared.shutdown().is_triggered() {
            return Err(CoordinatorError::Stopped);
        }
        let Some(mut tracker) = self.tracker.take() else {
            return Err(CoordinatorError::AlreadyStarted);
        };

        info!("Poll: bootstrapping device {}:{}", self.host, self.port);
        for channel in Channel::ALL {
            self.shared.set_state(channel, ChannelState::Bootstrapping);
        }

        let shutdown = self.shared.shutdown().clone();
        let main = match realtime::main_cycle(&*self.transport, &mut tracker, &shutdown) {
            Ok(snapshot) => snapshot,
            Err(e) => return Err(self.bootstrap_failed(Channel::Main, e, tracker)),
        };
        let pressure = match realtime::pressure_cycle(&*self.transport, &shutdown) {
            Ok(snapshot) => snapshot,
            Err(e) => return Err(self.bootstrap_failed(Channel::Pressure, e, tracker)),
        };

        if !self.shared.publish(Channel::Main, main) || !self.shared.publish(Channel::Pressure, pressure) {
            return Err(CoordinatorError::Stopped);
        }

        self.spawn_main(tracker)?;
        self.spawn_pressure()?;

        info!(
            "Poll: device {}:{} ready (main every {}s, pressure every {}s)",
            self.host,
            self.port,
            self.main_interval.as_secs_f32(),
            self.pressure_interval.as_secs_f32()
        );
        Ok(())
    }

    fn bootstrap_failed(&mut self, channel: Channel, source: CycleError, tracker: RateTracker) -> CoordinatorError {
        self.tracker = Some(tracker);
        for ch in Channel::ALL {
            self.shared.set_state(ch, ChannelState::Unavailable);
        }
        if source == CycleError::Cancelled {
            return CoordinatorError::Stopped;
        }
        error!(
            "Poll: initial {} refresh failed for {}:{}: {}",
            channel, self.host, self.port, source
        );
        CoordinatorError::DeviceUnreachable {
            host: self.host.clone(),
            channel,
            source,
        }
    }

    fn spawn_main(&mut self, mut tracker: RateTracker) -> Result<(), CoordinatorError> {
        let transport = Arc::clone(&self.transport);
        let shared = Arc::clone(&self.shared);
        let interval = self.main_interval;
        self.spawn(Channel::Main, move || {
            realtime::run_loop(Channel::Main, interval, &shared, |shutdown| {
                realtime::main_cycle(&*transport, &mut tracker, shutdown)
            })
        })
    }

    fn spawn_pressure(&mut self) -> Result<(), CoordinatorError> {
        let transport = Arc::clone(&self.transport);
        let shared = Arc::clone(&self.shared);
        let interval = self.pressure_interval;
        self.spawn(Channel::Pressure, move || {
            realtime::run_loop(Channel::Pressure, interval, &shared, |shutdown| {
                realtime::pressure_cycle(&*transport, shutdown)
            })
        })
    }

    fn spawn<F>(&mut self, channel: Channel, body: F) -> Result<(), CoordinatorError>
    where
        F: FnOnce() + Send + 'static,
    {
        match thread::Builder::new().name(format!("poll-{channel}")).spawn(body) {
            Ok(handle) => {
                self.workers.push(handle);
                Ok(())
            }
            Err(e) => {
                self.stop();
                Err(CoordinatorError::Spawn {
                    channel,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Stop both loops and wait for them. Idempotent.
    ///
    /// Waits and retry backoff end at once, but a request already on the wire
    /// is not aborted: this can block for up to the configured request
    /// timeout per running loop.
    pub fn stop(&mut self) {
        self.shared.shutdown().trigger();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("Poll: worker thread panicked");
            }
        }
    }

    pub fn latest(&self, channel: Channel) -> Option<Latest> {
        self.shared.latest(channel)
    }

    pub fn state(&self, channel: Channel) -> ChannelState {
        self.shared.state(channel)
    }

    pub fn subscribe(&self) -> Receiver<Event> {
        self.shared.subscribe()
    }

    pub fn handle(&self) -> CacheHandle {
        CacheHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn device_info(&self) -> DeviceInfo {
        let main = self.latest(Channel::Main);
        DeviceInfo::new(&self.host, self.port, main.as_ref().map(|l| l.snapshot.as_ref()))
    }
}

/// Dropping a running coordinator stops it, with the same bound as
/// [`Coordinator::stop`].
impl<T: Transport + 'static> Drop for Coordinator<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{BATCH_PATH, TransportError};
    use crate::models::device::{FieldKey, Fields, Value};
    use crate::testing::{FakeTransport, batch_fixture};
    use serde_json::json;

    fn test_config(main_ms: u64, pressure_ms: u64) -> Config {
        let mut cfg = Config::new("192.168.1.81");
        cfg.main_interval = Duration::from_millis(main_ms);
        cfg.pressure_interval = Duration::from_millis(pressure_ms);
        cfg
    }

    fn healthy_device() -> Arc<FakeTransport> {
        Arc::new(
            FakeTransport::new()
                .with(BATCH_PATH, Ok(batch_fixture()))
                .with("get/bar", Ok(json!({"getBAR": "3120"}))),
        )
    }

    fn coordinator(device: &Arc<FakeTransport>, main_ms: u64, pressure_ms: u64) -> Coordinator<Arc<FakeTransport>> {
        Coordinator::with_transport(&test_config(main_ms, pressure_ms), Arc::clone(device), Shutdown::new())
    }

    fn wait_for(events: &Receiver<Event>, mut pred: impl FnMut(&Event) -> bool) -> Event {
        loop {
            let event = events.recv_timeout(Duration::from_secs(5)).expect("event before timeout");
            if pred(&event) {
                return event;
            }
        }
    }

    fn snapshot_with(key: FieldKey, value: f64) -> Snapshot {
        let mut fields = Fields::new();
        fields.insert(key, Value::Number(value));
        Snapshot::new(Utc::now(), fields)
    }

    #[test]
    fn nothing_is_cached_before_start() {
        let device = healthy_device();
        let coordinator = coordinator(&device, 60_000, 60_000);
        assert!(coordinator.latest(Channel::Main).is_none());
        assert_eq!(coordinator.state(Channel::Main), ChannelState::Uninitialized);
        assert!(device.calls().is_empty());
    }

    #[test]
    fn start_publishes_both_channels() {
        let device = healthy_device();
        let mut coordinator = coordinator(&device, 60_000, 60_000);
        coordinator.start().unwrap();

        let main = coordinator.latest(Channel::Main).unwrap();
        assert!(!main.is_stale);
        assert!(main.last_error.is_none());
        assert_eq!(main.snapshot.number(FieldKey::Volume), Some(123456.0));
        assert_eq!(main.snapshot.number(FieldKey::VolumePerHour), Some(0.0));
        assert_eq!(main.fetched_at, main.snapshot.captured_at);

        let pressure = coordinator.latest(Channel::Pressure).unwrap();
        assert_eq!(pressure.snapshot.number(FieldKey::Pressure), Some(3.12));
        assert_eq!(pressure.snapshot.len(), 1);

        assert_eq!(coordinator.state(Channel::Main), ChannelState::Ready);
        assert_eq!(coordinator.state(Channel::Pressure), ChannelState::Ready);

        let info = coordinator.device_info();
        assert_eq!(info.identifier, "210012345");
        assert_eq!(info.configuration_url, "http://192.168.1.81:5333");

        coordinator.stop();
    }

    #[test]
    fn start_twice_is_rejected() {
        let device = healthy_device();
        let mut coordinator = coordinator(&device, 60_000, 60_000);
        coordinator.start().unwrap();
        assert!(matches!(coordinator.start(), Err(CoordinatorError::AlreadyStarted)));
    }

    #[test]
    fn bootstrap_failure_is_fatal_and_caches_nothing() {
        let device = healthy_device();
        device.set_offline(true);
        let mut coordinator = coordinator(&device, 60_000, 60_000);

        match coordinator.start() {
            Err(CoordinatorError::DeviceUnreachable { host, channel, .. }) => {
                assert_eq!(host, "192.168.1.81");
                assert_eq!(channel, Channel::Main);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(coordinator.latest(Channel::Main).is_none());
        assert!(coordinator.latest(Channel::Pressure).is_none());
        assert_eq!(coordinator.state(Channel::Main), ChannelState::Unavailable);

        // the host may retry setup once the device is back
        device.set_offline(false);
        coordinator.start().unwrap();
        assert!(coordinator.latest(Channel::Main).is_some());
    }

    #[test]
    fn pressure_bootstrap_failure_also_leaves_main_uncached() {
        let device = healthy_device();
        device.set("get/bar", Err(TransportError::Timeout { url: "get/bar".into() }));
        let mut coordinator = coordinator(&device, 60_000, 60_000);

        let err = coordinator.start().unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::DeviceUnreachable {
                channel: Channel::Pressure,
                ..
            }
        ));
        assert!(coordinator.latest(Channel::Main).is_none());
    }

    #[test]
    fn failed_cycle_keeps_previous_snapshot_and_flags_stale() {
        let device = healthy_device();
        let mut coordinator = coordinator(&device, 100, 60_000);
        let events = coordinator.subscribe();
        coordinator.start().unwrap();
        let first = coordinator.latest(Channel::Main).unwrap();
        device.set_offline(true);

        wait_for(&events, |e| matches!(e, Event::Failed { channel: Channel::Main, .. }));

        let stale = coordinator.latest(Channel::Main).unwrap();
        assert!(Arc::ptr_eq(&stale.snapshot, &first.snapshot));
        assert_eq!(stale.fetched_at, first.fetched_at);
        assert!(stale.is_stale);
        assert!(stale.last_error.is_some());
        assert_eq!(coordinator.state(Channel::Main), ChannelState::ReadyWithStaleError);
        // the pressure channel is untouched by main failures
        assert!(!coordinator.latest(Channel::Pressure).unwrap().is_stale);

        device.set_offline(false);
        wait_for(&events, |e| matches!(e, Event::Published { channel: Channel::Main, .. }));

        let fresh = coordinator.latest(Channel::Main).unwrap();
        assert!(!fresh.is_stale);
        assert!(fresh.last_error.is_none());
        assert_eq!(coordinator.state(Channel::Main), ChannelState::Ready);
    }

    #[test]
    fn stop_halts_loops_and_freezes_cache() {
        let device = healthy_device();
        let mut coordinator = coordinator(&device, 5, 5);
        let handle = coordinator.handle();
        coordinator.start().unwrap();
        std::thread::sleep(Duration::from_millis(30));

        coordinator.stop();
        let frozen = handle.latest(Channel::Main).unwrap();
        let calls = device.calls().len();
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(device.calls().len(), calls);
        assert!(Arc::ptr_eq(&handle.latest(Channel::Main).unwrap().snapshot, &frozen.snapshot));
        assert!(matches!(coordinator.start(), Err(CoordinatorError::Stopped)));
    }

    #[test]
    fn publish_is_refused_after_shutdown() {
        let shared = Shared::new(Shutdown::new());
        assert!(shared.publish(Channel::Pressure, snapshot_with(FieldKey::Pressure, 3.1)));
        shared.shutdown().trigger();
        assert!(!shared.publish(Channel::Pressure, snapshot_with(FieldKey::Pressure, 9.9)));
        assert!(!shared.record_failure(Channel::Pressure, CycleError::Cancelled));

        let latest = shared.latest(Channel::Pressure).unwrap();
        assert_eq!(latest.snapshot.number(FieldKey::Pressure), Some(3.1));
        assert!(!latest.is_stale);
    }

    #[test]
    fn stale_flag_clears_on_next_success() {
        let shared = Shared::new(Shutdown::new());
        shared.publish(Channel::Main, snapshot_with(FieldKey::Volume, 1.0));
        shared.record_failure(
            Channel::Main,
            CycleError::NoLiveData {
                last_error: None,
            },
        );
        let stale = shared.latest(Channel::Main).unwrap();
        assert!(stale.is_stale);
        assert_eq!(stale.snapshot.number(FieldKey::Volume), Some(1.0));

        shared.publish(Channel::Main, snapshot_with(FieldKey::Volume, 2.0));
        let fresh = shared.latest(Channel::Main).unwrap();
        assert!(!fresh.is_stale);
        assert!(fresh.last_error.is_none());
        assert_eq!(fresh.snapshot.number(FieldKey::Volume), Some(2.0));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let shared = Shared::new(Shutdown::new());
        let kept = shared.subscribe();
        drop(shared.subscribe());

        shared.publish(Channel::Pressure, snapshot_with(FieldKey::Pressure, 3.0));
        assert_eq!(shared.subscribers.lock().len(), 1);
        assert!(matches!(
            kept.try_recv().unwrap(),
            Event::Published {
                channel: Channel::Pressure,
                ..
            }
        ));
    }

    #[test]
    fn undrained_subscriber_queue_is_bounded() {
        let shared = Shared::new(Shutdown::new());
        let lagging = shared.subscribe();

        for i in 0..SUBSCRIBER_BUFFER + 10 {
            assert!(shared.publish(Channel::Main, snapshot_with(FieldKey::Volume, i as f64)));
        }

        assert_eq!(shared.subscribers.lock().len(), 1);
        assert_eq!(lagging.try_iter().count(), SUBSCRIBER_BUFFER);
        // the cache itself always holds the newest snapshot
        let latest = shared.latest(Channel::Main).unwrap();
        assert_eq!(latest.snapshot.number(FieldKey::Volume), Some((SUBSCRIBER_BUFFER + 9) as f64));

        // drained receivers resume receiving
        shared.publish(Channel::Main, snapshot_with(FieldKey::Volume, 0.5));
        assert!(matches!(lagging.try_recv(), Ok(Event::Published { .. })));
    }
}
