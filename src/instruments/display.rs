use tracing::debug;

use crate::bus::Delivery;
use crate::error::ProbeResult;
use crate::lifecycle::{Instrument, InstrumentContext, Phase, Step};

/// Writes every non-reserved event to the display writer, one per line.
///
/// Subscribes late in `ParseArgs` so it still sees the verification results
/// published while the bus drains.
#[derive(Debug, Default)]
pub struct Display;

impl Display {
    #[allow(missing_docs)]
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Instrument for Display {
    fn name(&self) -> &str {
        "display"
    }

    fn start(&mut self, _ctx: &mut InstrumentContext<'_>) -> ProbeResult<Step> {
        Ok(Step::wait_with_priority(Phase::ParseArgs, 100))
    }

    fn resume(&mut self, _phase: Phase, ctx: &mut InstrumentContext<'_>) -> ProbeResult<Step> {
        let out = ctx.collaborators().display.clone();
        ctx.bus().subscribe_with("*", move |delivery| {
            if let Delivery::Event(ev) = delivery {
                let mut out = out.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                if writeln!(out, "{ev}").is_err() {
                    debug!(channel = %ev.name, "display write failed");
                }
            }
        })?;
        Ok(Step::Finished)
    }
}
