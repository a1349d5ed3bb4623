//! Reducers: operators that resolve to a single element.
//!
//! `first`-style reducers resolve on their first element and ignore the rest of
//! their upstream. `last` and `is_empty` on an open-ended channel resolve when
//! the bus is drained.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::{lock, Flow, Sample, Signal, Sink};

impl<T: Send + 'static> Flow<T> {
    /// The first element, then completion.
    #[must_use]
    pub fn first(self) -> Self {
        self.pipe(move |down: Sink<T>| -> Sink<T> {
            let done = AtomicBool::new(false);
            Arc::new(move |sig: Signal<T>| match sig {
                Signal::Next(s) => {
                    if !done.swap(true, Ordering::AcqRel) {
                        down(Signal::Next(s));
                        down(Signal::Complete);
                    }
                }
                Signal::Tick(t) => {
                    if !done.load(Ordering::Acquire) {
                        down(Signal::Tick(t));
                    }
                }
                Signal::Complete => {
                    if !done.swap(true, Ordering::AcqRel) {
                        down(Signal::Complete);
                    }
                }
            })
        })
    }

    /// The first element, or `default` if the upstream completes empty.
    #[must_use]
    pub fn first_or_default(self, default: T) -> Self {
        let clock = self.bus.clock();
        self.pipe(move |down: Sink<T>| -> Sink<T> {
            let default = Mutex::new(Some(default));
            Arc::new(move |sig: Signal<T>| {
                let fallback = match sig {
                    Signal::Next(s) => {
                        if lock(&default).take().is_some() {
                            down(Signal::Next(s));
                            down(Signal::Complete);
                        }
                        return;
                    }
                    Signal::Tick(t) => {
                        if lock(&default).is_some() {
                            down(Signal::Tick(t));
                        }
                        return;
                    }
                    Signal::Complete => lock(&default).take(),
                };
                if let Some(value) = fallback {
                    down(Signal::Next(Sample { at: clock.now(), value }));
                    down(Signal::Complete);
                }
            })
        })
    }

    /// The last element, emitted when the upstream completes.
    #[must_use]
    pub fn last(self) -> Self {
        self.pipe(move |down: Sink<T>| -> Sink<T> {
            let latest: Mutex<Option<Sample<T>>> = Mutex::new(None);
            let done = AtomicBool::new(false);
            Arc::new(move |sig: Signal<T>| match sig {
                Signal::Next(s) => {
                    if !done.load(Ordering::Acquire) {
                        *lock(&latest) = Some(s);
                    }
                }
                Signal::Tick(t) => down(Signal::Tick(t)),
                Signal::Complete => {
                    if done.swap(true, Ordering::AcqRel) {
                        return;
                    }
                    let last = lock(&latest).take();
                    if let Some(s) = last {
                        down(Signal::Next(s));
                    }
                    down(Signal::Complete);
                }
            })
        })
    }

    /// `false` as soon as one element arrives, `true` if the upstream
    /// completes without any.
    #[must_use]
    pub fn is_empty(self) -> Flow<bool> {
        let clock = self.bus.clock();
        self.pipe(move |down: Sink<bool>| -> Sink<T> {
            let resolved = AtomicBool::new(false);
            Arc::new(move |sig: Signal<T>| match sig {
                Signal::Next(s) => {
                    if !resolved.swap(true, Ordering::AcqRel) {
                        down(Signal::Next(Sample { at: s.at, value: false }));
                        down(Signal::Complete);
                    }
                }
                Signal::Tick(t) => {
                    if !resolved.load(Ordering::Acquire) {
                        down(Signal::Tick(t));
                    }
                }
                Signal::Complete => {
                    if !resolved.swap(true, Ordering::AcqRel) {
                        down(Signal::Next(Sample {
                            at: clock.now(),
                            value: true,
                        }));
                        down(Signal::Complete);
                    }
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::bus::EventBus;
    use crate::flow::Flow;
    use crate::value::Value;

    fn floats(bus: &EventBus) -> Flow<f64> {
        Flow::values(bus, "?loss").filter_map(|v| v.as_float())
    }

    #[test]
    fn first_resolves_immediately() {
        let bus = EventBus::default();
        let acc = floats(&bus).first().accumulate().unwrap();
        bus.publish("loss", 2.0).unwrap();
        assert!(acc.is_complete());
        bus.publish("loss", 1.0).unwrap();
        assert_eq!(acc.snapshot(), vec![2.0]);
    }

    #[test]
    fn last_waits_for_drain() {
        let bus = EventBus::default();
        let acc = floats(&bus).last().accumulate().unwrap();
        for v in [2.0, 1.5, 0.8] {
            bus.publish("loss", v).unwrap();
        }
        assert!(acc.is_empty());
        bus.drain();
        assert_eq!(acc.snapshot(), vec![0.8]);
    }

    #[test]
    fn last_of_nothing_is_nothing() {
        let bus = EventBus::default();
        let acc = floats(&bus).last().accumulate().unwrap();
        bus.drain();
        assert!(acc.is_empty());
        assert!(acc.is_complete());
    }

    #[test]
    fn first_or_default_falls_back_on_completion() {
        let bus = EventBus::default();
        let seen = Flow::values(&bus, "?use_cuda").first_or_default(Value::Bool(false)).accumulate().unwrap();
        bus.drain();
        assert_eq!(seen.snapshot(), vec![Value::Bool(false)]);

        let bus = EventBus::default();
        let seen = Flow::values(&bus, "?use_cuda").first_or_default(Value::Bool(false)).accumulate().unwrap();
        bus.publish("use_cuda", true).unwrap();
        bus.drain();
        assert_eq!(seen.snapshot(), vec![Value::Bool(true)]);
    }

    #[test]
    fn is_empty_resolves_early_or_at_drain() {
        let bus = EventBus::default();
        let seen = Flow::values(&bus, "train_rate").is_empty().accumulate().unwrap();
        let unseen = Flow::values(&bus, "compute_rate").is_empty().accumulate().unwrap();
        bus.publish("train_rate", 1.0).unwrap();
        assert_eq!(seen.snapshot(), vec![false]);
        assert!(unseen.is_empty());
        bus.drain();
        assert_eq!(seen.snapshot(), vec![false]);
        assert_eq!(unseen.snapshot(), vec![true]);
    }
}
