//! End-of-run checks over the loss and the rate channels.
//!
//! Every check publishes exactly one boolean under `verify.<check>`, all of
//! them when the bus drains at `Finalize`. A dependency that is missing, or
//! that failed before `RunScript`, makes every check fail.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::error::ProbeResult;
use crate::flow::{lock, Flow, Signal};
use crate::lifecycle::{Instrument, InstrumentContext, Phase, Step};

const LOSS: &str = "?loss";

/// Instruments whose output is checked.
const RATES: [&str; 3] = ["train_rate", "loading_rate", "compute_rate"];

const DEPENDENCIES: [&str; 4] = ["dash", "train_rate", "loading_rate", "compute_rate"];

/// Names of every check, in publication order.
const CHECKS: [&str; 5] = [
    "verify.loss_decreases",
    "verify.loss_below_threshold",
    "verify.has_train_rate",
    "verify.has_loading_rate",
    "verify.has_compute_rate",
];

/// Runs after every dependency has had its `RunScript` step.
const DEPENDENCY_CHECK_PRIORITY: i32 = 1000;

/// Results gathered so far, published together once the loss channel
/// completes.
#[derive(Default)]
struct Verdicts {
    failed: AtomicBool,
    results: Mutex<BTreeMap<&'static str, bool>>,
}

impl Verdicts {
    fn fail(&self) {
        self.failed.store(true, Ordering::Release);
    }

    /// Records the first result of `flow` as the outcome of check `name`.
    fn record(self: &Arc<Self>, flow: Flow<bool>, name: &'static str) -> ProbeResult<()> {
        let verdicts = Arc::clone(self);
        flow.subscribe(move |s| {
            lock(&verdicts.results).entry(name).or_insert(s.value);
        })
    }

    /// Publishes every check when the loss channel completes. Subscribed
    /// last, so every recorded flow has resolved by then.
    fn report(self: &Arc<Self>, bus: &EventBus) -> ProbeResult<()> {
        let verdicts = Arc::clone(self);
        let publisher = bus.clone();
        losses(bus).subscribe_signals(move |sig| {
            if !matches!(sig, Signal::Complete) {
                return;
            }
            let failed = verdicts.failed.load(Ordering::Acquire);
            let results = lock(&verdicts.results).clone();
            for name in CHECKS {
                let passed = !failed && results.get(name).copied().unwrap_or(false);
                debug!(check = name, passed, "verification result");
                let _ = publisher.publish(name, passed);
            }
        })
    }
}

fn losses(bus: &EventBus) -> Flow<f64> {
    Flow::values(bus, LOSS).filter_map(|v| v.as_float())
}

/// The `verify` instrument.
#[derive(Default)]
pub struct Verify {
    verdicts: Arc<Verdicts>,
}

impl Verify {
    #[allow(missing_docs)]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn build(&self, ctx: &mut InstrumentContext<'_>) -> ProbeResult<Step> {
        let mut missing = Vec::new();
        for dep in DEPENDENCIES {
            if let Err(err) = ctx.require(dep) {
                warn!(error = %err, "verification dependency unavailable");
                missing.push(dep);
            }
        }
        let bus = ctx.bus();
        if !missing.is_empty() {
            warn!(?missing, "every check will fail");
            self.verdicts.fail();
            self.verdicts.report(bus)?;
            return Ok(Step::Finished);
        }

        losses(bus).first().publish_as("initial_loss")?;

        let first = losses(bus).first();
        let last = losses(bus).last();
        self.verdicts.record(
            first.merge(last).pairwise().map(|(initial, last)| last < initial),
            "verify.loss_decreases",
        )?;

        let threshold = ctx.options().loss_threshold;
        self.verdicts.record(
            losses(bus).last().map(move |last| last < threshold),
            "verify.loss_below_threshold",
        )?;

        for (rate, check) in RATES.into_iter().zip(CHECKS.into_iter().skip(2)) {
            self.verdicts
                .record(Flow::values(bus, format!("?{rate}")).is_empty().map(|empty| !empty), check)?;
        }
        self.verdicts.report(bus)?;
        Ok(Step::wait_with_priority(Phase::RunScript, DEPENDENCY_CHECK_PRIORITY))
    }
}

impl std::fmt::Debug for Verify {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verify")
            .field("failed", &self.verdicts.failed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Instrument for Verify {
    fn name(&self) -> &str {
        "verify"
    }

    fn start(&mut self, _ctx: &mut InstrumentContext<'_>) -> ProbeResult<Step> {
        Ok(Step::wait(Phase::ParseArgs))
    }

    fn resume(&mut self, phase: Phase, ctx: &mut InstrumentContext<'_>) -> ProbeResult<Step> {
        if phase == Phase::ParseArgs {
            return self.build(ctx);
        }
        let stopped: Vec<&str> = DEPENDENCIES.into_iter().filter(|dep| !ctx.is_active(dep)).collect();
        if !stopped.is_empty() {
            warn!(?stopped, "verification dependency failed; every check will fail");
            self.verdicts.fail();
        }
        Ok(Step::Finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::Collaborators;
    use crate::config::ProbeConfig;
    use crate::error::ProbeError;
    use crate::lifecycle::{InstrumentState, Overseer};
    use crate::value::Value;

    type Results = Arc<Mutex<BTreeMap<String, Value>>>;

    /// Stand-in for a dependency that does nothing.
    struct Idle(&'static str);

    impl Instrument for Idle {
        fn name(&self) -> &str {
            self.0
        }

        fn start(&mut self, _ctx: &mut InstrumentContext<'_>) -> ProbeResult<Step> {
            Ok(Step::Finished)
        }

        fn resume(&mut self, _phase: Phase, _ctx: &mut InstrumentContext<'_>) -> ProbeResult<Step> {
            Ok(Step::Finished)
        }
    }

    /// Stand-in for a dependency that cannot start.
    struct Broken(&'static str);

    impl Instrument for Broken {
        fn name(&self) -> &str {
            self.0
        }

        fn start(&mut self, _ctx: &mut InstrumentContext<'_>) -> ProbeResult<Step> {
            Err(ProbeError::ChannelClosed)
        }

        fn resume(&mut self, _phase: Phase, _ctx: &mut InstrumentContext<'_>) -> ProbeResult<Step> {
            Ok(Step::Finished)
        }
    }

    fn run(losses: &[f64], rates: &[&str], deps: &[&'static str]) -> BTreeMap<String, Value> {
        run_with(losses, rates, deps, &[])
    }

    fn run_with(
        losses: &[f64],
        rates: &[&str],
        deps: &[&'static str],
        broken: &[&'static str],
    ) -> BTreeMap<String, Value> {
        let mut cfg = ProbeConfig::default();
        cfg.instruments.verify = true;
        cfg.runtime.heartbeat = false;
        let mut o = Overseer::new(EventBus::default(), cfg, Collaborators::default()).unwrap();
        o.register(Verify::new()).unwrap();
        for &dep in deps {
            o.register(Idle(dep)).unwrap();
        }
        for &dep in broken {
            o.register(Broken(dep)).unwrap();
        }
        o.advance().unwrap();
        for &dep in broken {
            assert!(matches!(o.state(dep), Some(InstrumentState::Inert(_))), "{dep}");
        }

        // Subscribed after the checks so it is still open while they publish.
        let results: Results = Arc::default();
        let sink = Arc::clone(&results);
        o.bus()
            .subscribe_with("*", move |d| {
                if let crate::bus::Delivery::Event(ev) = d {
                    sink.lock().unwrap().insert(ev.name.clone(), ev.value.clone());
                }
            })
            .unwrap();
        for loss in losses {
            o.bus().publish("loss", *loss).unwrap();
        }
        for rate in rates {
            o.bus().publish(*rate, Value::quantity(1.0, "items/s")).unwrap();
        }
        o.run_to_end().unwrap();
        let out = results.lock().unwrap().clone();
        out
    }

    #[test]
    fn decreasing_loss_below_threshold_passes() {
        let r = run(&[2.0, 1.5, 0.8], &["train_rate"], &DEPENDENCIES);
        assert_eq!(r["initial_loss"], Value::Float(2.0));
        assert_eq!(r["verify.loss_decreases"], Value::Bool(true));
        assert_eq!(r["verify.loss_below_threshold"], Value::Bool(true));
        assert_eq!(r["verify.has_train_rate"], Value::Bool(true));
        assert_eq!(r["verify.has_loading_rate"], Value::Bool(false));
    }

    #[test]
    fn flat_loss_does_not_decrease() {
        let r = run(&[1.0, 1.0], &[], &DEPENDENCIES);
        assert_eq!(r["verify.loss_decreases"], Value::Bool(false));
        assert_eq!(r["verify.loss_below_threshold"], Value::Bool(false));
    }

    #[test]
    fn no_loss_fails_the_loss_checks() {
        let r = run(&[], &[], &DEPENDENCIES);
        assert!(!r.contains_key("initial_loss"));
        assert_eq!(r["verify.loss_decreases"], Value::Bool(false));
        assert_eq!(r["verify.loss_below_threshold"], Value::Bool(false));
    }

    #[test]
    fn missing_dependency_fails_closed() {
        let r = run(&[2.0, 0.5], &["train_rate"], &["dash", "train_rate"]);
        for check in CHECKS {
            assert_eq!(r[check], Value::Bool(false), "{check}");
        }
        assert!(!r.contains_key("initial_loss"));
    }

    #[test]
    fn failed_dependency_fails_closed() {
        let r = run_with(&[2.0, 0.5], &["train_rate"], &["dash", "train_rate", "loading_rate"], &["compute_rate"]);
        for check in CHECKS {
            assert_eq!(r[check], Value::Bool(false), "{check}");
        }
    }

    #[test]
    fn every_dependency_failing_fails_closed() {
        let r = run_with(&[2.0, 0.5], &["train_rate"], &[], &DEPENDENCIES);
        for check in CHECKS {
            assert_eq!(r[check], Value::Bool(false), "{check}");
        }
    }

    #[test]
    fn name_is_verify() {
        assert_eq!(Verify::new().name(), "verify");
    }
}
