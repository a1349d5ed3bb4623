//! One-shot numeric profiling of the host's compute step.
//!
//! The first compute span after `LoadScript` is measured by the configured
//! profiler; its report is published on `profiler_stats`. Profilers hook
//! process-global state, so only one measurement ever happens per process.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::{info, warn};

use crate::bus::{Delivery, EventBus, SubscriptionId};
use crate::collaborators::{ProfileReport, Profiler};
use crate::config::ProfilerKind;
use crate::error::ProbeResult;
use crate::flow::{lock, Accumulated, Flow};
use crate::lifecycle::{Activation, Instrument, InstrumentContext, Phase, Step};
use crate::pattern::ChannelPattern;
use crate::probe::{self, SpanEdge};
use crate::value::Value;

/// Channel carrying profiler reports.
pub const PROFILER_STATS: &str = "profiler_stats";

static PROFILER_CLAIMED: AtomicBool = AtomicBool::new(false);

fn int(n: u64) -> Value {
    Value::Int(i64::try_from(n).unwrap_or(i64::MAX))
}

/// Flattens a report into the record published on `profiler_stats`.
#[must_use]
pub fn report_record(kind: ProfilerKind, report: &ProfileReport) -> Value {
    let mut fields = BTreeMap::new();
    fields.insert("kind".to_string(), Value::from(kind.as_str()));
    fields.insert("total_flops".to_string(), int(report.total_flops()));
    match report {
        ProfileReport::Totals { macs, params, .. } => {
            fields.insert("macs".to_string(), int(*macs));
            fields.insert("params".to_string(), int(*params));
        }
        ProfileReport::Events(ops) => {
            fields.insert("ops".to_string(), int(ops.len() as u64));
        }
    }
    Value::Record(fields)
}

struct Measurement {
    kind: ProfilerKind,
    profiler: Box<dyn Profiler>,
    /// Span being measured, once started.
    span: Option<u64>,
    done: bool,
}

impl Measurement {
    /// Feeds one compute span edge. Returns true once the measurement is over.
    fn on_edge(&mut self, bus: &EventBus, id: u64, edge: SpanEdge) -> bool {
        if self.done {
            return true;
        }
        match (edge, self.span) {
            (SpanEdge::Enter, None) => {
                if PROFILER_CLAIMED.swap(true, Ordering::AcqRel) {
                    info!("profiler already used in this process");
                    self.done = true;
                    return true;
                }
                match self.profiler.start() {
                    Ok(()) => self.span = Some(id),
                    Err(err) => {
                        warn!(error = %err, "profiler failed to start");
                        self.done = true;
                    }
                }
            }
            (SpanEdge::Exit, Some(open)) if open == id => {
                self.done = true;
                match self.profiler.stop() {
                    Ok(report) => {
                        let _ = bus.publish(PROFILER_STATS, report_record(self.kind, &report));
                    }
                    Err(err) => warn!(error = %err, "profiler failed while measuring"),
                }
            }
            _ => {}
        }
        self.done
    }
}

/// The `profile` instrument. Active whenever the `profile` option names a
/// profiler.
#[derive(Debug, Default)]
pub struct Profile {
    stats: Option<Accumulated<Value>>,
}

impl Profile {
    #[allow(missing_docs)]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Instrument for Profile {
    fn name(&self) -> &str {
        "profile"
    }

    fn activation(&self) -> Activation {
        Activation::Parametrized
    }

    fn start(&mut self, ctx: &mut InstrumentContext<'_>) -> ProbeResult<Step> {
        if ctx.options().profiler()?.is_none() {
            return Ok(Step::Finished);
        }
        Ok(Step::wait(Phase::LoadScript))
    }

    fn resume(&mut self, phase: Phase, ctx: &mut InstrumentContext<'_>) -> ProbeResult<Step> {
        if phase != Phase::LoadScript {
            if let Some(stats) = self.stats.take() {
                let reports = stats.snapshot();
                let flops: i64 = reports
                    .iter()
                    .filter_map(|r| r.get("total_flops").and_then(Value::as_int))
                    .sum();
                info!(reports = reports.len(), flops, "profiling finished");
            }
            return Ok(Step::Finished);
        }

        let Some(kind) = ctx.options().profiler()? else {
            return Ok(Step::Finished);
        };
        let Some(profiler) = ctx.collaborators().profilers.as_ref().and_then(|f| f.create(kind)) else {
            warn!(profiler = kind.as_str(), "no back end for profiler");
            return Ok(Step::Finished);
        };

        let bus = ctx.bus().clone();
        self.stats = Some(Flow::values(&bus, format!("?{PROFILER_STATS}")).accumulate()?);

        let measurement = Mutex::new(Measurement {
            kind,
            profiler,
            span: None,
            done: false,
        });
        let own_id: Arc<OnceLock<SubscriptionId>> = Arc::default();
        let unsubscribe = Arc::clone(&own_id);
        let publisher = bus.clone();
        let id = bus.subscribe_with(ChannelPattern::exact(probe::channel(probe::COMPUTE_SITE)), move |d| {
            let Delivery::Event(ev) = d else {
                return;
            };
            let Some(span) = ev.value.as_span() else {
                return;
            };
            if lock(&measurement).on_edge(&publisher, span.id, span.edge) {
                // Disarms the compute site once nobody else listens.
                if let Some(id) = unsubscribe.get() {
                    publisher.unsubscribe(*id);
                }
            }
        })?;
        let _ = own_id.set(id);
        Ok(Step::wait(Phase::RunScript))
    }
}
