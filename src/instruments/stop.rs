use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::error::ProbeResult;
use crate::flow::Flow;
use crate::lifecycle::{Activation, Instrument, InstrumentContext, Phase, Step};
use crate::value::Value;

/// Stops the host after `stop` observations of `train_rate`.
///
/// Publishes a `progress` bar for every observation. The stop request fires
/// exactly once even if more rates arrive while the host winds down.
#[derive(Debug, Default)]
pub struct Stop;

impl Stop {
    #[allow(missing_docs)]
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Instrument for Stop {
    fn name(&self) -> &str {
        "stop"
    }

    fn activation(&self) -> Activation {
        Activation::Parametrized
    }

    fn start(&mut self, _ctx: &mut InstrumentContext<'_>) -> ProbeResult<Step> {
        Ok(Step::wait_with_priority(Phase::LoadScript, -100))
    }

    fn resume(&mut self, _phase: Phase, ctx: &mut InstrumentContext<'_>) -> ProbeResult<Step> {
        let total = ctx.options().stop;
        if total == 0 {
            return Ok(Step::Finished);
        }
        let bus = ctx.bus();

        Flow::values(bus, "train_rate")
            .map_indexed(move |_, idx| Value::Progress {
                progress: idx + 1,
                total,
                descr: "train".to_string(),
            })
            .publish_as("progress")?;

        let controller = Arc::clone(&ctx.collaborators().stop);
        let fired = AtomicBool::new(false);
        Flow::values(bus, "train_rate").skip(total - 1).subscribe(move |_| {
            if !fired.swap(true, Ordering::AcqRel) {
                info!(after = total, "stop requested");
                controller.request_stop();
            }
        })?;
        Ok(Step::Finished)
    }
}
