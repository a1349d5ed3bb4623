//! Host-side probes.
//!
//! The host marks interesting regions of its own code with probe sites:
//!
//! ```
//! use runprobe::bus::EventBus;
//! use runprobe::probe;
//! use runprobe::Value;
//!
//! let bus = EventBus::default();
//! let mut span = probe::span(&bus, "compute_start");
//! // ... forward and backward pass ...
//! span.give("batch", Value::Batch { len: 32 });
//! span.finish();
//! ```
//!
//! A site is armed while some subscription listens on its reserved channel
//! (`$probe.<site>`). Unarmed sites publish nothing, so an instrument that is
//! gated off leaves the host's hot path untouched.
//!
//! Data loaders are described to the instruments with a [`LoaderDescriptor`];
//! wrapping the host iterator in [`ProbedIter`] announces the loader and times
//! each batch it yields.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::bus::EventBus;
use crate::error::ProbeTargetError;
use crate::time::Timestamp;
use crate::value::Value;

/// Channel on which host programs announce their data loaders.
pub const LOADER_CHANNEL: &str = "loader";

/// Probe site timed by generator-style loaders.
pub const LOADER_YIELD_SITE: &str = "loader.yield";

/// Probe site timed by iterator-protocol loaders.
pub const LOADER_NEXT_SITE: &str = "loader.next";

/// Probe site wrapping the host's compute step.
pub const COMPUTE_SITE: &str = "compute_start";

static NEXT_SPAN_ID: AtomicU64 = AtomicU64::new(1);

/// Reserved channel carrying the spans of `site`.
#[must_use]
pub fn channel(site: &str) -> String {
    format!("$probe.{site}")
}

/// Which side of a span an event marks.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanEdge {
    Enter,
    Exit,
}

/// One edge of a timed region.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub site: String,
    /// Pairs an exit with its enter.
    pub id: u64,
    pub edge: SpanEdge,
    /// Values the host handed over inside the span; `Null` on enter.
    pub payload: Box<Value>,
}

/// An open probe span. Publishes its exit edge when finished or dropped.
#[must_use = "a span measures until it is finished or dropped"]
pub struct SpanGuard {
    armed: Option<(EventBus, String)>,
    site: String,
    id: u64,
    fields: BTreeMap<String, Value>,
}

impl fmt::Debug for SpanGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanGuard")
            .field("site", &self.site)
            .field("id", &self.id)
            .field("armed", &self.armed.is_some())
            .finish()
    }
}

impl SpanGuard {
    /// Returns true if this span will publish.
    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Hands a value to the instruments listening on this site.
    pub fn give(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        if self.armed.is_some() {
            self.fields.insert(key.into(), value.into());
        }
    }

    /// Closes the span now.
    pub fn finish(self) {}

    fn publish(&self, bus: &EventBus, channel: &str, edge: SpanEdge, payload: Value) {
        let record = SpanRecord {
            site: self.site.clone(),
            id: self.id,
            edge,
            payload: Box::new(payload),
        };
        if bus.publish(channel, Value::Span(record)).is_err() {
            trace!(site = %self.site, "probe after teardown ignored");
        }
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if let Some((bus, channel)) = self.armed.take() {
            let payload = Value::Record(std::mem::take(&mut self.fields));
            self.publish(&bus, &channel, SpanEdge::Exit, payload);
        }
    }
}

/// Opens a span at `site`. Inert unless the site is armed.
pub fn span(bus: &EventBus, site: &str) -> SpanGuard {
    let channel = channel(site);
    let mut guard = SpanGuard {
        armed: None,
        site: site.to_string(),
        id: NEXT_SPAN_ID.fetch_add(1, Ordering::Relaxed),
        fields: BTreeMap::new(),
    };
    if bus.has_subscribers(&channel) {
        guard.publish(bus, &channel, SpanEdge::Enter, Value::Null);
        guard.armed = Some((bus.clone(), channel));
    }
    guard
}

/// Returns true if some instrument listens on `site`.
#[must_use]
pub fn is_armed(bus: &EventBus, site: &str) -> bool {
    bus.has_subscribers(&channel(site))
}

/// How a host loader produces its batches.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoaderKind {
    /// Lazily yields batches from a suspended body.
    Generator,
    /// Exposes an explicit `next()` step.
    IteratorProtocol,
    /// Anything else, e.g. a pre-materialised collection.
    Opaque,
}

/// A data loader as announced by the host.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderDescriptor {
    pub name: String,
    pub kind: LoaderKind,
}

/// What a loader instrument can do with a loader.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderCapability {
    GeneratorLoader,
    IteratorProtocolLoader,
    Unsupported,
}

impl LoaderCapability {
    /// Probe site to arm for this loader, if any.
    #[must_use]
    pub const fn probe_site(self) -> Option<&'static str> {
        match self {
            Self::GeneratorLoader => Some(LOADER_YIELD_SITE),
            Self::IteratorProtocolLoader => Some(LOADER_NEXT_SITE),
            Self::Unsupported => None,
        }
    }
}

#[allow(missing_docs)]
impl LoaderDescriptor {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: LoaderKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    #[must_use]
    pub fn generator(name: impl Into<String>) -> Self {
        Self::new(name, LoaderKind::Generator)
    }

    #[must_use]
    pub fn iterator(name: impl Into<String>) -> Self {
        Self::new(name, LoaderKind::IteratorProtocol)
    }

    /// Decides how the loader can be probed.
    #[must_use]
    pub const fn classify(&self) -> LoaderCapability {
        match self.kind {
            LoaderKind::Generator => LoaderCapability::GeneratorLoader,
            LoaderKind::IteratorProtocol => LoaderCapability::IteratorProtocolLoader,
            LoaderKind::Opaque => LoaderCapability::Unsupported,
        }
    }

    /// Probe site to arm for this loader.
    ///
    /// # Errors
    ///
    /// Returns `ProbeTargetError::UnsupportedProbeTarget` for opaque loaders.
    pub fn probe_site(&self) -> Result<&'static str, ProbeTargetError> {
        self.classify()
            .probe_site()
            .ok_or_else(|| ProbeTargetError::UnsupportedProbeTarget {
                target: format!("loader '{}'", self.name),
                kind: format!("{:?}", self.kind),
            })
    }
}

/// Wraps a host iterator, timing each item it yields while the loader's
/// probe site is armed.
///
/// Construction announces the loader on the `loader` channel.
pub struct ProbedIter<I: Iterator, F> {
    inner: I,
    bus: EventBus,
    site: Option<&'static str>,
    describe: F,
}

impl<I: Iterator, F> fmt::Debug for ProbedIter<I, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbedIter").field("site", &self.site).finish_non_exhaustive()
    }
}

impl<I, F> ProbedIter<I, F>
where
    I: Iterator,
    F: Fn(&I::Item) -> Value,
{
    /// Wraps `inner`. `describe` turns each item into the batch value handed
    /// to the span (typically `Value::Batch { len }`).
    pub fn new(bus: &EventBus, descriptor: LoaderDescriptor, inner: I, describe: F) -> Self {
        let site = descriptor.classify().probe_site();
        if bus.publish(LOADER_CHANNEL, Value::Loader(descriptor)).is_err() {
            trace!("loader announced after teardown");
        }
        Self {
            inner,
            bus: bus.clone(),
            site,
            describe,
        }
    }
}

impl<I, F> Iterator for ProbedIter<I, F>
where
    I: Iterator,
    F: Fn(&I::Item) -> Value,
{
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        let Some(site) = self.site else {
            return self.inner.next();
        };
        let mut guard = span(&self.bus, site);
        let item = self.inner.next();
        match &item {
            Some(item) => guard.give("batch", (self.describe)(item)),
            // Exhaustion is not a batch; drop the span without a payload.
            None => guard.fields.clear(),
        }
        item
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Timestamps of span enters awaiting their exit.
pub(crate) struct OpenSpans {
    open: BTreeMap<u64, Timestamp>,
}

impl OpenSpans {
    const MAX_OPEN: usize = 1024;

    pub(crate) const fn new() -> Self {
        Self { open: BTreeMap::new() }
    }

    pub(crate) fn enter(&mut self, id: u64, at: Timestamp) {
        if self.open.len() >= Self::MAX_OPEN {
            // Enters without exits; forget the oldest.
            self.open.pop_first();
        }
        self.open.insert(id, at);
    }

    pub(crate) fn exit(&mut self, id: u64) -> Option<Timestamp> {
        self.open.remove(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Delivery;
    use std::sync::{Arc, Mutex};

    fn spans_on(bus: &EventBus, site: &str) -> Arc<Mutex<Vec<SpanRecord>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe_with(channel(site).as_str(), move |d| {
            if let Delivery::Event(ev) = d {
                if let Some(span) = ev.value.as_span() {
                    sink.lock().unwrap().push(span.clone());
                }
            }
        })
        .unwrap();
        seen
    }

    #[test]
    fn test_unarmed_span_publishes_nothing() {
        let bus = EventBus::default();
        let all = bus.subscribe("*").unwrap();
        let mut s = span(&bus, COMPUTE_SITE);
        assert!(!s.is_armed());
        s.give("batch", Value::Batch { len: 4 });
        drop(s);
        assert_eq!(bus.channel_count(&channel(COMPUTE_SITE)), 0);
        assert!(all.try_recv().unwrap().is_none());
    }

    #[test]
    fn test_armed_span_publishes_enter_and_exit_with_payload() {
        let bus = EventBus::default();
        let seen = spans_on(&bus, COMPUTE_SITE);
        let mut s = span(&bus, COMPUTE_SITE);
        s.give("batch", Value::Batch { len: 4 });
        s.finish();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].edge, SpanEdge::Enter);
        assert_eq!(seen[1].edge, SpanEdge::Exit);
        assert_eq!(seen[0].id, seen[1].id);
        assert_eq!(seen[1].payload.get("batch"), Some(&Value::Batch { len: 4 }));
    }

    #[test]
    fn test_reserved_probe_channels_skip_catch_all() {
        let bus = EventBus::default();
        let _catch_all = bus.subscribe("*").unwrap();
        assert!(!is_armed(&bus, LOADER_NEXT_SITE));
        let _probe = bus.subscribe("$probe.*").unwrap();
        assert!(is_armed(&bus, LOADER_NEXT_SITE));
    }

    #[test]
    fn test_loader_classification() {
        assert_eq!(LoaderDescriptor::generator("a").classify(), LoaderCapability::GeneratorLoader);
        assert_eq!(LoaderDescriptor::iterator("b").probe_site().unwrap(), LOADER_NEXT_SITE);
        let opaque = LoaderDescriptor::new("c", LoaderKind::Opaque);
        assert_eq!(opaque.classify(), LoaderCapability::Unsupported);
        let err = opaque.probe_site().unwrap_err();
        assert!(err.to_string().contains("loader 'c'"));
    }

    #[test]
    fn test_probed_iter_announces_and_times_batches() {
        let bus = EventBus::default();
        let announced = bus.subscribe(LOADER_CHANNEL).unwrap();
        let seen = spans_on(&bus, LOADER_YIELD_SITE);

        let batches = vec![vec![0u8; 8], vec![0u8; 8]];
        let iter = ProbedIter::new(&bus, LoaderDescriptor::generator("train"), batches.into_iter(), |b| {
            Value::Batch { len: b.len() }
        });
        assert_eq!(iter.count(), 2);

        let ev = announced.try_recv().unwrap().unwrap();
        assert_eq!(ev.value.as_loader().map(|l| l.name.as_str()), Some("train"));

        let seen = seen.lock().unwrap();
        let exits: Vec<_> = seen.iter().filter(|s| s.edge == SpanEdge::Exit).collect();
        // Two batches plus the exhausting call.
        assert_eq!(exits.len(), 3);
        assert_eq!(exits[0].payload.get("batch"), Some(&Value::Batch { len: 8 }));
        assert_eq!(exits[2].payload.get("batch"), None);
    }

    #[test]
    fn test_open_spans_are_bounded() {
        let mut open = OpenSpans::new();
        for id in 0..(OpenSpans::MAX_OPEN as u64 + 10) {
            open.enter(id, Timestamp::ZERO);
        }
        assert_eq!(open.exit(0), None);
        assert_eq!(open.exit(OpenSpans::MAX_OPEN as u64 + 9), Some(Timestamp::ZERO));
    }
}
