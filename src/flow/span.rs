use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{lock, Flow, Sample, Signal, Sink};
use crate::bus::EventBus;
use crate::pattern::ChannelPattern;
use crate::probe::{self, OpenSpans, SpanEdge};
use crate::value::Value;

/// A completed probe span.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub struct SpanSample {
    pub site: String,
    pub elapsed: Duration,
    /// Record of everything the host handed over inside the span.
    pub payload: Value,
}

impl SpanSample {
    /// Items per second for the batch carried in the payload, if any.
    ///
    /// Nothing is produced for an empty payload or a zero-length span.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn batch_rate(&self) -> Option<f64> {
        let len = self.payload.get("batch")?.batch_len()?;
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        Some(len as f64 / secs)
    }
}

impl Flow<SpanSample> {
    /// Completed spans of probe `site`. Attaching arms the site.
    pub fn probe(bus: &EventBus, site: &str) -> Self {
        Flow::values(bus, ChannelPattern::exact(probe::channel(site))).spans()
    }
}

impl Flow<Value> {
    /// Pairs span enter and exit edges into completed spans.
    ///
    /// Non-span values and exits without a matching enter are dropped. The
    /// elapsed time is measured between the two events' timestamps.
    #[must_use]
    pub fn spans(self) -> Flow<SpanSample> {
        self.pipe(move |down: Sink<SpanSample>| -> Sink<Value> {
            let open = Mutex::new(OpenSpans::new());
            Arc::new(move |sig: Signal<Value>| match sig {
                Signal::Next(Sample { at, value }) => {
                    let Value::Span(record) = value else {
                        return;
                    };
                    match record.edge {
                        SpanEdge::Enter => lock(&open).enter(record.id, at),
                        SpanEdge::Exit => {
                            let entered = lock(&open).exit(record.id);
                            if let Some(entered) = entered {
                                down(Signal::Next(Sample {
                                    at,
                                    value: SpanSample {
                                        site: record.site,
                                        elapsed: at.saturating_since(entered),
                                        payload: *record.payload,
                                    },
                                }));
                            }
                        }
                    }
                }
                Signal::Tick(t) => down(Signal::Tick(t)),
                Signal::Complete => down(Signal::Complete),
            })
        })
    }
}
