//! Windowed operators: pairing, averaging, time buffering and throttling.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{lock, Flow, Sample, Signal, Sink};
use crate::time::Timestamp;

impl<T: Clone + Send + 'static> Flow<T> {
    /// Emits `(previous, current)` for each adjacent pair of elements.
    ///
    /// The first element produces nothing. Each output is stamped with the
    /// time of its second element.
    #[must_use]
    pub fn pairwise(self) -> Flow<(T, T)> {
        self.pipe(move |down: Sink<(T, T)>| -> Sink<T> {
            let prev: Mutex<Option<T>> = Mutex::new(None);
            Arc::new(move |sig: Signal<T>| match sig {
                Signal::Next(Sample { at, value }) => {
                    let before = lock(&prev).replace(value.clone());
                    if let Some(before) = before {
                        down(Signal::Next(Sample {
                            at,
                            value: (before, value),
                        }));
                    }
                }
                Signal::Tick(t) => down(Signal::Tick(t)),
                Signal::Complete => down(Signal::Complete),
            })
        })
    }
}

struct TimeBuffer<T> {
    items: Vec<T>,
    last_flush: Timestamp,
    done: bool,
}

impl<T: Send + 'static> Flow<T> {
    /// Collects elements and emits them as a list every time `window` has
    /// elapsed since the previous flush.
    ///
    /// Flushes are triggered by element timestamps and by heartbeat ticks, so
    /// an idle flow still emits (empty) lists on schedule. The window starts
    /// when the flow is attached. Anything left at completion is emitted once
    /// more if non-empty.
    #[must_use]
    pub fn buffer_by_time(self, window: Duration) -> Flow<Vec<T>> {
        let clock = self.bus.clock();
        self.pipe(move |down: Sink<Vec<T>>| -> Sink<T> {
            let state = Mutex::new(TimeBuffer {
                items: Vec::new(),
                last_flush: clock.now(),
                done: false,
            });
            Arc::new(move |sig: Signal<T>| {
                let mut out = Vec::with_capacity(2);
                {
                    let mut st = lock(&state);
                    if st.done {
                        return;
                    }
                    let due = |st: &TimeBuffer<T>, now: Timestamp| now.saturating_since(st.last_flush) >= window;
                    match sig {
                        Signal::Next(Sample { at, value }) => {
                            if due(&*st, at) {
                                let items = std::mem::take(&mut st.items);
                                st.last_flush = at;
                                out.push(Signal::Next(Sample { at, value: items }));
                            }
                            st.items.push(value);
                        }
                        Signal::Tick(t) => {
                            if due(&*st, t) {
                                let items = std::mem::take(&mut st.items);
                                st.last_flush = t;
                                out.push(Signal::Next(Sample { at: t, value: items }));
                            }
                            out.push(Signal::Tick(t));
                        }
                        Signal::Complete => {
                            st.done = true;
                            if !st.items.is_empty() {
                                let items = std::mem::take(&mut st.items);
                                out.push(Signal::Next(Sample {
                                    at: clock.now(),
                                    value: items,
                                }));
                            }
                            out.push(Signal::Complete);
                        }
                    }
                }
                for sig in out {
                    down(sig);
                }
            })
        })
    }

    /// Lets at most one element through per `interval`.
    ///
    /// The first element passes; later ones pass only once `interval` has
    /// elapsed since the last one that did. Everything in between is dropped.
    #[must_use]
    pub fn throttle(self, interval: Duration) -> Self {
        self.pipe(move |down: Sink<T>| -> Sink<T> {
            let last_emit: Mutex<Option<Timestamp>> = Mutex::new(None);
            Arc::new(move |sig: Signal<T>| match sig {
                Signal::Next(s) => {
                    let pass = {
                        let mut last = lock(&last_emit);
                        let pass = last.map_or(true, |prev| s.at.saturating_since(prev) >= interval);
                        if pass {
                            *last = Some(s.at);
                        }
                        pass
                    };
                    if pass {
                        down(Signal::Next(s));
                    }
                }
                other => down(other),
            })
        })
    }
}

impl Flow<f64> {
    /// Running mean of the last `n` elements (fewer while fewer exist).
    ///
    /// `n == 0` is treated as 1.
    #[must_use]
    pub fn scanning_average(self, n: usize) -> Self {
        let n = n.max(1);
        self.pipe(move |down: Sink<f64>| -> Sink<f64> {
            let window: Mutex<VecDeque<f64>> = Mutex::new(VecDeque::with_capacity(n));
            Arc::new(move |sig: Signal<f64>| match sig {
                Signal::Next(Sample { at, value }) => {
                    let mean = {
                        let mut w = lock(&window);
                        if w.len() == n {
                            w.pop_front();
                        }
                        w.push_back(value);
                        #[allow(clippy::cast_precision_loss)]
                        let len = w.len() as f64;
                        w.iter().sum::<f64>() / len
                    };
                    down(Signal::Next(Sample { at, value: mean }));
                }
                other => down(other),
            })
        })
    }
}
