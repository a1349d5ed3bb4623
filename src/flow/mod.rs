//! Stream combinators over bus channels.
//!
//! A [`Flow`] is a lazily attached, push-based pipeline. Building one allocates
//! nothing on the bus; only a terminal (`subscribe`, `publish_as`,
//! `accumulate`) registers the subscription. Every element carries the
//! timestamp of the event it came from, so time-based operators are driven by
//! event time plus the bus heartbeat, never by wall-clock sleeps.
//!
//! ```
//! use runprobe::bus::EventBus;
//! use runprobe::flow::Flow;
//!
//! let bus = EventBus::default();
//! let doubled = Flow::values(&bus, "x")
//!     .filter_map(|v| v.as_float())
//!     .map(|x| x * 2.0)
//!     .accumulate()
//!     .unwrap();
//! bus.publish("x", 2.0).unwrap();
//! bus.publish("x", "not a number").unwrap();
//! assert_eq!(doubled.snapshot(), vec![4.0]);
//! ```
//!
//! Operator state is behind a mutex so events may arrive from several producer
//! threads; downstream delivery always happens after that lock is released.

mod reduce;
mod span;
mod window;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::bus::{Delivery, Event, EventBus};
use crate::error::ProbeResult;
use crate::pattern::ChannelPattern;
use crate::time::Timestamp;
use crate::value::Value;

pub use span::SpanSample;

/// A value with the time it was observed.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub struct Sample<T> {
    pub at: Timestamp,
    pub value: T,
}

/// What flows between operators.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal<T> {
    /// A new element.
    Next(Sample<T>),
    /// The clock reached this time with no element.
    Tick(Timestamp),
    /// The upstream ended; nothing else follows.
    Complete,
}

impl<T> Signal<T> {
    fn map_value<U>(self, f: impl FnOnce(T) -> U) -> Signal<U> {
        match self {
            Self::Next(Sample { at, value }) => Signal::Next(Sample { at, value: f(value) }),
            Self::Tick(t) => Signal::Tick(t),
            Self::Complete => Signal::Complete,
        }
    }
}

/// Downstream half of an operator.
pub type Sink<T> = Arc<dyn Fn(Signal<T>) + Send + Sync>;

type Attach<T> = Box<dyn FnOnce(Sink<T>) -> ProbeResult<()> + Send>;

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A lazily attached pipeline producing `T`s.
pub struct Flow<T> {
    bus: EventBus,
    attach: Attach<T>,
}

impl<T> fmt::Debug for Flow<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow").field("bus", &self.bus).finish_non_exhaustive()
    }
}

impl Flow<Arc<Event>> {
    /// Events of the channels matching `pattern`.
    pub fn events(bus: &EventBus, pattern: impl Into<ChannelPattern>) -> Self {
        let pattern = pattern.into();
        let source = bus.clone();
        Self {
            bus: bus.clone(),
            attach: Box::new(move |down: Sink<Arc<Event>>| {
                source
                    .subscribe_with(pattern, move |delivery| match delivery {
                        Delivery::Event(ev) => down(Signal::Next(Sample {
                            at: ev.timestamp,
                            value: ev,
                        })),
                        Delivery::Tick(t) => down(Signal::Tick(t)),
                        Delivery::Closed => down(Signal::Complete),
                    })
                    .map(|_| ())
            }),
        }
    }
}

impl Flow<Value> {
    /// Values of the channels matching `pattern`.
    pub fn values(bus: &EventBus, pattern: impl Into<ChannelPattern>) -> Self {
        Flow::events(bus, pattern).map(|ev| ev.value.clone())
    }

    /// Adds field `name`, computed from the whole value, to a record.
    ///
    /// Records keep their existing fields; any other value is wrapped as the
    /// `value` field of a new record.
    #[must_use]
    pub fn keyed_map(self, name: impl Into<String>, f: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        let name = name.into();
        self.map(move |v| {
            let projected = f(&v);
            let mut fields = match v {
                Value::Record(fields) => fields,
                other => {
                    let mut fields = BTreeMap::new();
                    fields.insert("value".to_string(), other);
                    fields
                }
            };
            fields.insert(name.clone(), projected);
            Value::Record(fields)
        })
    }
}

impl<T: Send + 'static> Flow<T> {
    /// The bus this flow will attach to.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Builds a new stage: `make` receives the downstream sink and returns the
    /// sink this flow should feed.
    pub(crate) fn pipe<U: Send + 'static>(
        self,
        make: impl FnOnce(Sink<U>) -> Sink<T> + Send + 'static,
    ) -> Flow<U> {
        let Flow { bus, attach } = self;
        Flow {
            bus,
            attach: Box::new(move |down| attach(make(down))),
        }
    }

    /// Transforms every element.
    #[must_use]
    pub fn map<U: Send + 'static>(self, f: impl Fn(T) -> U + Send + Sync + 'static) -> Flow<U> {
        self.pipe(move |down: Sink<U>| -> Sink<T> { Arc::new(move |sig: Signal<T>| down(sig.map_value(&f))) })
    }

    /// Keeps the elements for which `pred` holds.
    #[must_use]
    pub fn filter(self, pred: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.pipe(move |down: Sink<T>| -> Sink<T> {
            Arc::new(move |sig: Signal<T>| match sig {
                Signal::Next(s) if !pred(&s.value) => {}
                other => down(other),
            })
        })
    }

    /// Transforms elements, dropping those mapped to `None`.
    #[must_use]
    pub fn filter_map<U: Send + 'static>(self, f: impl Fn(T) -> Option<U> + Send + Sync + 'static) -> Flow<U> {
        self.pipe(move |down: Sink<U>| -> Sink<T> {
            Arc::new(move |sig: Signal<T>| match sig {
                Signal::Next(Sample { at, value }) => {
                    if let Some(value) = f(value) {
                        down(Signal::Next(Sample { at, value }));
                    }
                }
                Signal::Tick(t) => down(Signal::Tick(t)),
                Signal::Complete => down(Signal::Complete),
            })
        })
    }

    /// Pairs every element with its timestamp.
    #[must_use]
    pub fn timestamped(self) -> Flow<(Timestamp, T)> {
        self.pipe(move |down: Sink<(Timestamp, T)>| -> Sink<T> {
            Arc::new(move |sig: Signal<T>| match sig {
                Signal::Next(Sample { at, value }) => down(Signal::Next(Sample { at, value: (at, value) })),
                Signal::Tick(t) => down(Signal::Tick(t)),
                Signal::Complete => down(Signal::Complete),
            })
        })
    }

    /// Drops the first `n` elements.
    #[must_use]
    pub fn skip(self, n: u64) -> Self {
        self.pipe(move |down: Sink<T>| -> Sink<T> {
            let seen = AtomicU64::new(0);
            Arc::new(move |sig: Signal<T>| match sig {
                Signal::Next(s) => {
                    if seen.fetch_add(1, Ordering::AcqRel) >= n {
                        down(Signal::Next(s));
                    }
                }
                other => down(other),
            })
        })
    }

    /// Transforms elements together with their 0-based ordinal in this flow.
    #[must_use]
    pub fn map_indexed<U: Send + 'static>(self, f: impl Fn(T, u64) -> U + Send + Sync + 'static) -> Flow<U> {
        self.pipe(move |down: Sink<U>| -> Sink<T> {
            let index = AtomicU64::new(0);
            Arc::new(move |sig: Signal<T>| {
                let sig = match sig {
                    Signal::Next(s) => {
                        let idx = index.fetch_add(1, Ordering::AcqRel);
                        Signal::Next(Sample {
                            at: s.at,
                            value: f(s.value, idx),
                        })
                    }
                    Signal::Tick(t) => Signal::Tick(t),
                    Signal::Complete => Signal::Complete,
                };
                down(sig);
            })
        })
    }

    /// Interleaves this flow with `other`; completes once both have.
    #[must_use]
    pub fn merge(self, other: Flow<T>) -> Self {
        let Flow { bus, attach } = self;
        let other_attach = other.attach;
        Flow {
            bus,
            attach: Box::new(move |down: Sink<T>| {
                let completed = Arc::new(AtomicU8::new(0));
                let wrap = |down: Sink<T>, completed: Arc<AtomicU8>| -> Sink<T> {
                    Arc::new(move |sig: Signal<T>| match sig {
                        Signal::Complete => {
                            if completed.fetch_add(1, Ordering::AcqRel) == 1 {
                                down(Signal::Complete);
                            }
                        }
                        other => down(other),
                    })
                };
                attach(wrap(Arc::clone(&down), Arc::clone(&completed)))?;
                other_attach(wrap(down, completed))
            }),
        }
    }

    /// Attaches the flow, calling `f` for every element.
    ///
    /// # Errors
    ///
    /// Returns `ProbeError::ChannelClosed` if the bus was torn down.
    pub fn subscribe(self, f: impl Fn(Sample<T>) + Send + Sync + 'static) -> ProbeResult<()> {
        (self.attach)(Arc::new(move |sig| {
            if let Signal::Next(s) = sig {
                f(s);
            }
        }))
    }

    /// Attaches the flow, calling `f` for every signal including ticks and
    /// completion.
    ///
    /// # Errors
    ///
    /// Returns `ProbeError::ChannelClosed` if the bus was torn down.
    pub fn subscribe_signals(self, f: impl Fn(Signal<T>) + Send + Sync + 'static) -> ProbeResult<()> {
        (self.attach)(Arc::new(f))
    }

    /// Attaches the flow, collecting every element.
    ///
    /// # Errors
    ///
    /// Returns `ProbeError::ChannelClosed` if the bus was torn down.
    pub fn accumulate(self) -> ProbeResult<Accumulated<T>>
    where
        T: Clone,
    {
        let acc = Accumulated {
            items: Arc::new(Mutex::new(Vec::new())),
            complete: Arc::new(AtomicBool::new(false)),
        };
        let items = Arc::clone(&acc.items);
        let complete = Arc::clone(&acc.complete);
        (self.attach)(Arc::new(move |sig| match sig {
            Signal::Next(s) => lock(&items).push(s.value),
            Signal::Tick(_) => {}
            Signal::Complete => complete.store(true, Ordering::Release),
        }))?;
        Ok(acc)
    }
}

impl<T: Into<Value> + Send + 'static> Flow<T> {
    /// Attaches the flow, publishing every element on channel `name`.
    ///
    /// Publishing after teardown is silently dropped.
    ///
    /// # Errors
    ///
    /// Returns `ProbeError::ChannelClosed` if the bus was torn down.
    pub fn publish_as(self, name: impl Into<String>) -> ProbeResult<()> {
        let name = name.into();
        let bus = self.bus.clone();
        self.subscribe(move |s| {
            let _ = bus.publish(name.clone(), s.value);
        })
    }
}

/// Elements collected by [`Flow::accumulate`].
#[derive(Debug)]
pub struct Accumulated<T> {
    items: Arc<Mutex<Vec<T>>>,
    complete: Arc<AtomicBool>,
}

impl<T> Clone for Accumulated<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
            complete: Arc::clone(&self.complete),
        }
    }
}

impl<T: Clone> Accumulated<T> {
    /// Copy of everything collected so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<T> {
        lock(&self.items).clone()
    }

    /// Number of elements collected so far.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true once the upstream completed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }
}
