//! Throughput instruments.
//!
//! `train_rate` is computed from the spacing of `batch` events. The other two
//! time probe spans in the host: the loader's batch production
//! (`loading_rate`) and the compute step (`compute_rate`).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::config::RuntimeConfig;
use crate::error::ProbeResult;
use crate::flow::Flow;
use crate::lifecycle::{Instrument, InstrumentContext, Phase, Step};
use crate::probe::{self, LoaderDescriptor};
use crate::time::Timestamp;
use crate::value::Value;

/// Units of every published rate.
pub const RATE_UNITS: &str = "items/s";

/// Items per second over a window of consecutive batch pairs.
///
/// Each pair is `((t1, size1), (t2, size2))`. The elapsed time is the sum of
/// `t2 - t1` plus `extra` (time spent waiting on the device); the item count
/// is the sum of the first sizes. Returns `None` when either is zero.
///
/// ```
/// use runprobe::instruments::compute_train_rate;
/// use runprobe::time::Timestamp;
/// use std::time::Duration;
///
/// let t = Timestamp::from_secs_f64;
/// let pairs = [((t(0.0), 32), (t(0.5), 32)), ((t(0.5), 32), (t(1.0), 32))];
/// assert_eq!(compute_train_rate(&pairs, Duration::ZERO), Some(64.0));
/// assert_eq!(compute_train_rate(&[], Duration::ZERO), None);
/// ```
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn compute_train_rate(pairs: &[((Timestamp, usize), (Timestamp, usize))], extra: Duration) -> Option<f64> {
    let elapsed: Duration = pairs
        .iter()
        .map(|((t1, _), (t2, _))| t2.saturating_since(*t1))
        .sum::<Duration>()
        + extra;
    let items: usize = pairs.iter().map(|((_, n), _)| n).sum();
    if items == 0 || elapsed.is_zero() {
        return None;
    }
    Some(items as f64 / elapsed.as_secs_f64())
}

/// Publishes the smoothed batch rate of probe `site` on channel `name`.
fn publish_span_rate(bus: &EventBus, site: &str, name: &str, runtime: &RuntimeConfig) -> ProbeResult<()> {
    Flow::probe(bus, site)
        .filter_map(|span| span.batch_rate())
        .scanning_average(runtime.smoothing_window)
        .throttle(runtime.rate_throttle)
        .map(|rate| Value::quantity(rate, RATE_UNITS))
        .publish_as(name)
}

/// The `train_rate` instrument.
#[derive(Debug, Default)]
pub struct TrainRate;

impl TrainRate {
    #[allow(missing_docs)]
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Instrument for TrainRate {
    fn name(&self) -> &str {
        "train_rate"
    }

    fn start(&mut self, _ctx: &mut InstrumentContext<'_>) -> ProbeResult<Step> {
        Ok(Step::wait(Phase::LoadScript))
    }

    fn resume(&mut self, _phase: Phase, ctx: &mut InstrumentContext<'_>) -> ProbeResult<Step> {
        let bus = ctx.bus().clone();

        // The host announces `use_cuda` when device work runs asynchronously.
        let use_sync = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&use_sync);
        Flow::values(&bus, "?use_cuda")
            .first_or_default(Value::Bool(false))
            .subscribe(move |s| flag.store(s.value.as_bool().unwrap_or(false), Ordering::Release))?;

        let sync = ctx.collaborators().sync.clone();
        let publisher = bus.clone();
        Flow::values(&bus, "batch")
            .filter_map(|v| v.batch_len())
            .timestamped()
            .pairwise()
            .buffer_by_time(ctx.runtime().rate_window)
            .subscribe(move |window| {
                if window.value.is_empty() {
                    return;
                }
                let mut extra = Duration::ZERO;
                if let (true, Some(sync)) = (use_sync.load(Ordering::Acquire), &sync) {
                    let started = Instant::now();
                    sync.synchronize();
                    extra = started.elapsed();
                }
                if let Some(rate) = compute_train_rate(&window.value, extra) {
                    let _ = publisher.publish("train_rate", Value::quantity(rate, RATE_UNITS));
                }
            })?;
        Ok(Step::Finished)
    }
}

/// The `loading_rate` instrument.
///
/// Arms the loader probe site matching each announced loader's shape.
#[derive(Debug, Default)]
pub struct LoadingRate;

impl LoadingRate {
    #[allow(missing_docs)]
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Instrument for LoadingRate {
    fn name(&self) -> &str {
        "loading_rate"
    }

    fn start(&mut self, _ctx: &mut InstrumentContext<'_>) -> ProbeResult<Step> {
        Ok(Step::wait(Phase::LoadScript))
    }

    fn resume(&mut self, _phase: Phase, ctx: &mut InstrumentContext<'_>) -> ProbeResult<Step> {
        let bus = ctx.bus().clone();
        let runtime = ctx.runtime().clone();
        let armed: Mutex<HashSet<&'static str>> = Mutex::new(HashSet::new());
        Flow::values(&bus, probe::LOADER_CHANNEL)
            .filter_map(|v| v.as_loader().cloned())
            .subscribe(move |s| {
                let loader: LoaderDescriptor = s.value;
                let site = match loader.probe_site() {
                    Ok(site) => site,
                    Err(err) => {
                        warn!(error = %err, "loader left uninstrumented");
                        return;
                    }
                };
                if !armed.lock().unwrap_or_else(PoisonError::into_inner).insert(site) {
                    return;
                }
                debug!(loader = %loader.name, site, "loader probe armed");
                if let Err(err) = publish_span_rate(&bus, site, "loading_rate", &runtime) {
                    debug!(error = %err, "loader announced after teardown");
                }
            })?;
        Ok(Step::Finished)
    }
}

/// The `compute_rate` instrument.
#[derive(Debug, Default)]
pub struct ComputeRate;

impl ComputeRate {
    #[allow(missing_docs)]
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Instrument for ComputeRate {
    fn name(&self) -> &str {
        "compute_rate"
    }

    fn start(&mut self, _ctx: &mut InstrumentContext<'_>) -> ProbeResult<Step> {
        Ok(Step::wait(Phase::LoadScript))
    }

    fn resume(&mut self, _phase: Phase, ctx: &mut InstrumentContext<'_>) -> ProbeResult<Step> {
        publish_span_rate(ctx.bus(), probe::COMPUTE_SITE, "compute_rate", ctx.runtime())?;
        Ok(Step::Finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::testing::TestBus;

    fn t(secs: f64) -> Timestamp {
        Timestamp::from_secs_f64(secs)
    }

    #[test]
    fn train_rate_sums_items_over_elapsed() {
        let pairs = [((t(0.0), 10), (t(0.25), 10)), ((t(0.25), 30), (t(1.0), 10))];
        assert_eq!(compute_train_rate(&pairs, Duration::ZERO), Some(40.0));
    }

    #[test]
    fn sync_cost_counts_as_elapsed_time() {
        let pairs = [((t(0.0), 10), (t(0.5), 10))];
        assert_eq!(compute_train_rate(&pairs, Duration::from_millis(500)), Some(10.0));
    }

    #[test]
    fn zero_elapsed_or_zero_items_publishes_nothing() {
        assert_eq!(compute_train_rate(&[((t(1.0), 10), (t(1.0), 10))], Duration::ZERO), None);
        assert_eq!(compute_train_rate(&[((t(0.0), 0), (t(1.0), 10))], Duration::ZERO), None);
    }

    #[test]
    fn span_rate_is_averaged_and_throttled() {
        let tb = TestBus::new();
        publish_span_rate(&tb.bus, probe::COMPUTE_SITE, "compute_rate", &RuntimeConfig::default()).unwrap();
        let rates = Flow::values(&tb.bus, "compute_rate").accumulate().unwrap();

        // Spans of 0.1s over 10 items: 100 items/s, then 50 items/s.
        for (start, len) in [(0.0, 10usize), (0.5, 5), (1.5, 5)] {
            tb.clock.set(t(start));
            let mut span = probe::span(&tb.bus, probe::COMPUTE_SITE);
            span.give("batch", Value::Batch { len });
            tb.clock.set(t(start + 0.1));
            span.finish();
        }

        let published: Vec<f64> = rates.snapshot().iter().filter_map(Value::as_float).collect();
        // 0.5s is inside the throttle window; 1.5s sees the mean of the last three.
        assert_eq!(published.len(), 2);
        assert!((published[0] - 100.0).abs() < 1e-9);
        assert!((published[1] - 200.0 / 3.0).abs() < 1e-9);
    }
}
