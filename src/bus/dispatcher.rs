//! Event bus dispatcher.
//!
//! This module owns subscriptions and delivers published events to them.
//! Delivery is synchronous on the publishing thread. Stream subscribers are fed
//! through bounded channels with non-blocking `try_send`, so a slow reader
//! loses events instead of stalling the publisher.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use crossbeam_channel::{bounded, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ProbeError, ProbeResult};
use crate::pattern::ChannelPattern;
use crate::poller::Poller;
use crate::time::{Clock, MonotonicClock, Timestamp};
use crate::value::Value;

use super::event::{Delivery, Event, SubscriptionId};
use super::stream::EventStream;

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Per-stream buffer capacity before events are dropped for that reader.
    pub stream_capacity: usize,
    /// Cadence of heartbeat ticks once `start_heartbeat` is called.
    #[serde(with = "crate::config::duration_ms")]
    pub heartbeat_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            stream_capacity: 1024,
            heartbeat_interval: Duration::from_millis(100),
        }
    }
}

/// Something running off the lifecycle thread that the bus must stop before it
/// closes.
pub trait BackgroundTask: Send + Sync {
    /// Stable id used to release the task from the bus.
    fn id(&self) -> Uuid;
    /// Human-readable name for logs.
    fn name(&self) -> &str;
    /// Stops the task and waits for it. Must be idempotent.
    fn stop(&self);
}

/// Callback signature for push-style subscribers.
pub type Callback = Arc<dyn Fn(Delivery) + Send + Sync>;

enum Sink {
    Callback(Callback),
    Stream(Sender<Arc<Event>>),
}

struct Subscriber {
    id: SubscriptionId,
    pattern: ChannelPattern,
    sink: Sink,
    completed: AtomicBool,
}

#[derive(Default)]
struct ChannelState {
    order: Mutex<()>,
    published: AtomicU64,
}

const OPEN: u8 = 0;
const DRAINING: u8 = 1;
const DRAINED: u8 = 2;
const CLOSED: u8 = 3;

static NEXT_BUS_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // Channels this thread is currently notifying, with publishes that arrived
    // re-entrantly from inside those notifications.
    static DELIVERING: RefCell<HashMap<(u64, String), VecDeque<Arc<Event>>>> = RefCell::new(HashMap::new());
}

struct DeliveringGuard {
    key: (u64, String),
}

impl Drop for DeliveringGuard {
    fn drop(&mut self) {
        DELIVERING.with(|d| {
            d.borrow_mut().remove(&self.key);
        });
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct BusInner {
    id: u64,
    cfg: BusConfig,
    clock: Arc<dyn Clock>,
    state: AtomicU8,
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
    channels: Mutex<HashMap<String, Arc<ChannelState>>>,
    dropped_events: AtomicU64,
    background: Mutex<Vec<Arc<dyn BackgroundTask>>>,
}

impl BusInner {
    pub(crate) fn remove_subscriber(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    fn snapshot(&self, filter: impl Fn(&Subscriber) -> bool) -> Vec<Arc<Subscriber>> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| filter(s))
            .cloned()
            .collect()
    }

    fn channel(&self, name: &str) -> Arc<ChannelState> {
        let mut channels = lock(&self.channels);
        if let Some(ch) = channels.get(name) {
            return Arc::clone(ch);
        }
        let ch = Arc::new(ChannelState::default());
        channels.insert(name.to_string(), Arc::clone(&ch));
        ch
    }
}

/// In-process publish/subscribe bus keyed by event name.
///
/// Cloning is cheap: clones share the same subscriptions.
///
/// # Delivery guarantees
///
/// - Subscribers of one channel are notified in subscription order.
/// - Publishes to the same channel from different threads never interleave
///   their notifications (per-channel ordering lock).
/// - A publish made from inside a notification of the same channel is queued
///   and delivered once the current notification completes.
/// - After [`EventBus::teardown`], `publish` and `subscribe` return
///   [`ProbeError::ChannelClosed`] and have no other effect.
///
/// Callbacks on two threads that each publish into the other's channel can
/// deadlock on the ordering locks. Keep publish cycles on one thread.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state.load(Ordering::Acquire))
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl EventBus {
    /// Creates a bus stamped by a fresh monotonic clock.
    #[must_use]
    pub fn new(cfg: BusConfig) -> Self {
        Self::with_clock(cfg, Arc::new(MonotonicClock::new()))
    }

    /// Creates a bus stamped by `clock`.
    #[must_use]
    pub fn with_clock(cfg: BusConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                id: NEXT_BUS_ID.fetch_add(1, Ordering::Relaxed),
                cfg,
                clock,
                state: AtomicU8::new(OPEN),
                subscribers: RwLock::new(Vec::new()),
                channels: Mutex::new(HashMap::new()),
                dropped_events: AtomicU64::new(0),
                background: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<BusInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<BusInner>) -> Self {
        Self { inner }
    }

    /// Current time on the bus clock.
    #[must_use]
    pub fn now(&self) -> Timestamp {
        self.inner.clock.now()
    }

    /// The clock stamping this bus.
    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.inner.clock)
    }

    /// Bus configuration.
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.inner.cfg
    }

    /// Returns true once the bus has been torn down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == CLOSED
    }

    /// Returns true once every callback subscription has been completed.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) >= DRAINED
    }

    /// Publishes `value` on channel `name`, stamped with the bus clock.
    ///
    /// # Errors
    ///
    /// Returns `ProbeError::ChannelClosed` if the bus was torn down. Nothing is
    /// delivered in that case.
    pub fn publish(&self, name: impl Into<String>, value: impl Into<Value>) -> ProbeResult<()> {
        if self.is_closed() {
            return Err(ProbeError::ChannelClosed);
        }
        let event = Arc::new(Event::new(name, value.into(), self.now()));
        self.dispatch(event);
        Ok(())
    }

    /// Publishes a pre-built event, keeping its timestamp.
    ///
    /// # Errors
    ///
    /// Returns `ProbeError::ChannelClosed` if the bus was torn down.
    pub fn publish_event(&self, event: Event) -> ProbeResult<()> {
        if self.is_closed() {
            return Err(ProbeError::ChannelClosed);
        }
        self.dispatch(Arc::new(event));
        Ok(())
    }

    fn dispatch(&self, event: Arc<Event>) {
        let key = (self.inner.id, event.name.clone());

        let reentrant = DELIVERING.with(|d| {
            let mut d = d.borrow_mut();
            if let Some(queue) = d.get_mut(&key) {
                queue.push_back(Arc::clone(&event));
                true
            } else {
                d.insert(key.clone(), VecDeque::new());
                false
            }
        });
        if reentrant {
            return;
        }
        let guard = DeliveringGuard { key };

        let channel = self.inner.channel(&event.name);
        let _order = lock(&channel.order);

        let mut next = Some(event);
        while let Some(ev) = next {
            channel.published.fetch_add(1, Ordering::Relaxed);
            self.notify(&ev);
            next = DELIVERING.with(|d| d.borrow_mut().get_mut(&guard.key).and_then(VecDeque::pop_front));
        }
    }

    fn notify(&self, ev: &Arc<Event>) {
        let targets = self.inner.snapshot(|s| s.pattern.matches(&ev.name));
        for sub in targets {
            match &sub.sink {
                Sink::Callback(f) => {
                    if !sub.completed.load(Ordering::Acquire) {
                        f(Delivery::Event(Arc::clone(ev)));
                    }
                }
                Sink::Stream(tx) => match tx.try_send(Arc::clone(ev)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        self.inner.dropped_events.fetch_add(1, Ordering::Relaxed);
                        debug!(channel = %ev.name, subscription = %sub.id, "stream full, event dropped");
                    }
                    Err(TrySendError::Disconnected(_)) => {}
                },
            }
        }
    }

    /// Subscribe with a live stream.
    ///
    /// # Errors
    ///
    /// Returns `ProbeError::ChannelClosed` if the bus was torn down.
    pub fn subscribe(&self, pattern: impl Into<ChannelPattern>) -> ProbeResult<EventStream> {
        if self.is_closed() {
            return Err(ProbeError::ChannelClosed);
        }
        let id = SubscriptionId::new();
        let (tx, rx) = bounded::<Arc<Event>>(self.inner.cfg.stream_capacity.max(1));
        let pattern = pattern.into();
        debug!(subscription = %id, %pattern, "stream subscribed");
        self.push_subscriber(Subscriber {
            id,
            pattern,
            sink: Sink::Stream(tx),
            completed: AtomicBool::new(false),
        });
        Ok(EventStream::new(id, rx, self.downgrade()))
    }

    /// Subscribe with a callback invoked on the publishing thread.
    ///
    /// A callback registered after the bus was drained is immediately handed
    /// `Delivery::Closed`.
    ///
    /// # Errors
    ///
    /// Returns `ProbeError::ChannelClosed` if the bus was torn down.
    pub fn subscribe_with(
        &self,
        pattern: impl Into<ChannelPattern>,
        callback: impl Fn(Delivery) + Send + Sync + 'static,
    ) -> ProbeResult<SubscriptionId> {
        if self.is_closed() {
            return Err(ProbeError::ChannelClosed);
        }
        let id = SubscriptionId::new();
        let callback: Callback = Arc::new(callback);
        let already_drained = self.is_drained();
        self.push_subscriber(Subscriber {
            id,
            pattern: pattern.into(),
            sink: Sink::Callback(Arc::clone(&callback)),
            completed: AtomicBool::new(already_drained),
        });
        if already_drained {
            callback(Delivery::Closed);
        }
        Ok(id)
    }

    fn push_subscriber(&self, sub: Subscriber) {
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(sub));
    }

    /// Removes a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.remove_subscriber(id)
    }

    /// Number of live subscriptions of either kind.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if an open subscription matches channel `name`.
    ///
    /// Probe sites use this to stay silent until somebody listens.
    #[must_use]
    pub fn has_subscribers(&self, name: &str) -> bool {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|s| !s.completed.load(Ordering::Acquire) && s.pattern.matches(name))
    }

    /// Number of events ever published on `name`.
    #[must_use]
    pub fn channel_count(&self, name: &str) -> u64 {
        lock(&self.inner.channels)
            .get(name)
            .map_or(0, |ch| ch.published.load(Ordering::Relaxed))
    }

    /// Events dropped because a stream's buffer was full.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped_events.load(Ordering::Relaxed)
    }

    /// Delivers a heartbeat tick at the current clock time to every open
    /// callback subscription.
    pub fn heartbeat(&self) {
        if self.is_drained() {
            return;
        }
        let now = self.now();
        for sub in self.inner.snapshot(|s| matches!(s.sink, Sink::Callback(_))) {
            if let Sink::Callback(f) = &sub.sink {
                if !sub.completed.load(Ordering::Acquire) {
                    f(Delivery::Tick(now));
                }
            }
        }
    }

    /// Starts a background thread delivering heartbeats at
    /// `BusConfig::heartbeat_interval`. It is stopped by `teardown`.
    ///
    /// # Errors
    ///
    /// Returns `ProbeError::ChannelClosed` if the bus was torn down.
    pub fn start_heartbeat(&self) -> ProbeResult<()> {
        let weak = self.downgrade();
        let poller = Poller::start("runprobe-heartbeat", self.inner.cfg.heartbeat_interval, move || {
            match weak.upgrade() {
                Some(inner) => {
                    EventBus::from_inner(inner).heartbeat();
                    Ok(())
                }
                None => Err("bus dropped"),
            }
        })?;
        self.adopt(poller.task());
        // The bus owns the heartbeat through `adopt`; the guard must not stop it.
        poller.detach();
        Ok(())
    }

    /// Registers a background task to be stopped at teardown.
    ///
    /// If the bus is already closed the task is stopped immediately.
    pub fn adopt(&self, task: Arc<dyn BackgroundTask>) {
        if self.is_closed() {
            task.stop();
            return;
        }
        debug!(task = task.name(), "background task adopted");
        lock(&self.inner.background).push(task);
    }

    /// Forgets a background task its owner already stopped.
    pub fn release(&self, id: Uuid) {
        lock(&self.inner.background).retain(|t| t.id() != id);
    }

    /// Stops and joins every adopted background task.
    pub fn stop_background(&self) {
        let tasks = std::mem::take(&mut *lock(&self.inner.background));
        for task in tasks {
            debug!(task = task.name(), "stopping background task");
            task.stop();
        }
    }

    /// Completes every callback subscription, in subscription order.
    ///
    /// Reducers waiting for the end of their stream (`last`, `is_empty`)
    /// resolve here. Events they publish while draining still reach the
    /// subscriptions that have not been completed yet, and every stream.
    /// Publishing remains possible afterwards; only teardown closes the bus.
    pub fn drain(&self) {
        if self
            .inner
            .state
            .compare_exchange(OPEN, DRAINING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        loop {
            let pending = self.inner.snapshot(|s| {
                matches!(s.sink, Sink::Callback(_)) && !s.completed.load(Ordering::Acquire)
            });
            if pending.is_empty() {
                break;
            }
            for sub in pending {
                if sub.completed.swap(true, Ordering::AcqRel) {
                    continue;
                }
                if let Sink::Callback(f) = &sub.sink {
                    f(Delivery::Closed);
                }
            }
        }

        self.inner.state.store(DRAINED, Ordering::Release);
        debug!(bus = self.inner.id, "bus drained");
    }

    /// Tears the bus down: stops background tasks, drains callback
    /// subscriptions, then ends every stream. Idempotent.
    pub fn teardown(&self) {
        if self.is_closed() {
            return;
        }
        self.stop_background();
        self.drain();
        if self.inner.state.swap(CLOSED, Ordering::AcqRel) == CLOSED {
            return;
        }
        let subs = std::mem::take(&mut *self.inner.subscribers.write().unwrap_or_else(PoisonError::into_inner));
        let dropped = self.dropped_events();
        if dropped > 0 {
            warn!(dropped, "slow stream readers lost events");
        }
        info!(bus = self.inner.id, subscriptions = subs.len(), "event bus torn down");
        drop(subs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::thread;

    use crate::time::ManualClock;

    fn recorder(bus: &EventBus, pattern: &str) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe_with(pattern, move |d| {
            if let Delivery::Event(ev) = d {
                sink.lock().unwrap().push(format!("{}={}", ev.name, ev.value));
            }
        })
        .unwrap();
        seen
    }

    #[test]
    fn publish_reaches_matching_subscribers_only() {
        let bus = EventBus::default();
        let loss = recorder(&bus, "loss");
        let all = recorder(&bus, "*");

        bus.publish("loss", 1.5).unwrap();
        bus.publish("train_rate", 3.0).unwrap();

        assert_eq!(*loss.lock().unwrap(), vec!["loss=1.5"]);
        assert_eq!(*all.lock().unwrap(), vec!["loss=1.5", "train_rate=3"]);
    }

    #[test]
    fn subscribers_are_notified_in_subscription_order() {
        let bus = EventBus::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        for idx in 0..4 {
            let order = Arc::clone(&order);
            bus.subscribe_with("x", move |d| {
                if matches!(d, Delivery::Event(_)) {
                    order.lock().unwrap().push(idx);
                }
            })
            .unwrap();
        }
        bus.publish("x", 1i64).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn reentrant_publish_on_same_channel_is_queued_in_order() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let republisher = bus.clone();
        bus.subscribe_with("n", move |d| {
            if let Delivery::Event(ev) = d {
                let n = ev.value.as_int().unwrap();
                if n < 3 {
                    republisher.publish("n", n + 1).unwrap();
                }
            }
        })
        .unwrap();
        let sink = Arc::clone(&seen);
        bus.subscribe_with("n", move |d| {
            if let Delivery::Event(ev) = d {
                sink.lock().unwrap().push(ev.value.as_int().unwrap());
            }
        })
        .unwrap();

        bus.publish("n", 0i64).unwrap();
        // Every subscriber sees 0 before anybody sees 1.
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(bus.channel_count("n"), 4);
    }

    #[test]
    fn stream_sees_only_events_after_subscription() {
        let bus = EventBus::default();
        bus.publish("loss", 9.0).unwrap();
        let stream = bus.subscribe("loss").unwrap();
        bus.publish("loss", 1.0).unwrap();
        let ev = stream.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(ev.value, Value::Float(1.0));
        assert!(stream.try_recv().unwrap().is_none());
    }

    #[test]
    fn teardown_ends_streams_and_rejects_publishes() {
        let bus = EventBus::default();
        let stream = bus.subscribe("*").unwrap();
        bus.publish("a", 1i64).unwrap();
        bus.teardown();

        let collected: Vec<_> = stream.map(|e| e.name.clone()).collect();
        assert_eq!(collected, vec!["a"]);
        assert!(bus.publish("a", 2i64).unwrap_err().is_channel_closed());
        assert!(bus.subscribe("a").unwrap_err().is_channel_closed());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn full_stream_drops_instead_of_blocking() {
        let bus = EventBus::new(BusConfig {
            stream_capacity: 2,
            ..BusConfig::default()
        });
        let stream = bus.subscribe("x").unwrap();
        for i in 0..5i64 {
            bus.publish("x", i).unwrap();
        }
        assert_eq!(bus.dropped_events(), 3);
        assert_eq!(stream.drain_buffered().len(), 2);
    }

    #[test]
    fn dropping_stream_unsubscribes() {
        let bus = EventBus::default();
        let stream = bus.subscribe("x").unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        drop(stream);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn drain_completes_in_order_and_forwards_late_results() {
        let bus = EventBus::default();
        let publisher = bus.clone();
        bus.subscribe_with("loss", move |d| {
            if matches!(d, Delivery::Closed) {
                publisher.publish("verify.done", true).unwrap();
            }
        })
        .unwrap();
        let late = recorder(&bus, "verify.*");

        bus.drain();
        assert_eq!(*late.lock().unwrap(), vec!["verify.done=true"]);
        assert!(bus.is_drained());
        assert!(!bus.is_closed());
    }

    #[test]
    fn callback_after_drain_is_closed_immediately() {
        let bus = EventBus::default();
        bus.drain();
        let closed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&closed);
        bus.subscribe_with("x", move |d| {
            if matches!(d, Delivery::Closed) {
                flag.store(true, Ordering::SeqCst);
            }
        })
        .unwrap();
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn heartbeat_carries_clock_time() {
        let clock = Arc::new(ManualClock::new());
        let bus = EventBus::with_clock(BusConfig::default(), clock.clone());
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&ticks);
        bus.subscribe_with("x", move |d| {
            if let Delivery::Tick(t) = d {
                sink.lock().unwrap().push(t);
            }
        })
        .unwrap();
        clock.set(Timestamp::from_millis(250));
        bus.heartbeat();
        assert_eq!(*ticks.lock().unwrap(), vec![Timestamp::from_millis(250)]);
    }

    #[test]
    fn concurrent_publishers_keep_per_thread_order() {
        let bus = EventBus::default();
        let stream = bus.subscribe("c").unwrap();

        let handles: Vec<_> = (0..4i64)
            .map(|t| {
                let bus = bus.clone();
                thread::spawn(move || {
                    for i in 0..100i64 {
                        bus.publish("c", t * 1000 + i).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut last = [-1i64; 4];
        for ev in stream.drain_buffered() {
            let v = ev.value.as_int().unwrap();
            let (t, i) = ((v / 1000) as usize, v % 1000);
            assert!(i > last[t]);
            last[t] = i;
        }
        assert_eq!(last, [99; 4]);
    }
}
