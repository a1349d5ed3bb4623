use tracing::{info, warn};

use crate::bus::EventBus;
use crate::collaborators::GpuTelemetry;
use crate::error::{AcquisitionError, ProbeResult};
use crate::lifecycle::{Instrument, InstrumentContext, Phase, Step};
use crate::poller::Poller;
use crate::value::Value;

/// Name of the channel carrying GPU readings.
pub const GPU_CHANNEL: &str = "gpudata";

fn poll_once(gpu: &dyn GpuTelemetry, bus: &EventBus) -> Result<(), AcquisitionError> {
    let readings = gpu.poll()?;
    // A publish racing teardown is not a failed poll.
    let _ = bus.publish(GPU_CHANNEL, Value::Gpu(readings));
    Ok(())
}

/// Polls GPU telemetry on a background thread while the host script runs.
///
/// A failing poll is skipped; polling resumes at the next interval.
#[derive(Debug, Default)]
pub struct GpuMonitor {
    poller: Option<Poller>,
}

impl GpuMonitor {
    #[allow(missing_docs)]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Instrument for GpuMonitor {
    fn name(&self) -> &str {
        "gpu"
    }

    fn start(&mut self, _ctx: &mut InstrumentContext<'_>) -> ProbeResult<Step> {
        Ok(Step::wait(Phase::LoadScript))
    }

    fn resume(&mut self, phase: Phase, ctx: &mut InstrumentContext<'_>) -> ProbeResult<Step> {
        if phase == Phase::LoadScript {
            let Some(gpu) = ctx.collaborators().gpu.clone() else {
                warn!("gpu monitor enabled without telemetry");
                return Ok(Step::Finished);
            };
            let bus = ctx.bus().clone();
            let interval = ctx.runtime().gpu_poll_interval;
            let poller = Poller::start("runprobe-gpu", interval, move || poll_once(gpu.as_ref(), &bus))?;
            // Teardown stops it too if the run is abandoned before RunScript.
            ctx.bus().adopt(poller.task());
            self.poller = Some(poller);
            return Ok(Step::wait(Phase::RunScript));
        }

        if let Some(poller) = self.poller.take() {
            poller.stop();
            ctx.bus().release(poller.id());
            let stats = poller.stats();
            info!(polls = stats.polls, failures = stats.failures, "gpu monitor stopped");
        }
        Ok(Step::Finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{Collaborators, GpuReading};
    use crate::config::ProbeConfig;
    use crate::flow::Flow;
    use crate::lifecycle::Overseer;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    struct Flaky {
        calls: AtomicU32,
        failures: u32,
    }

    impl GpuTelemetry for Flaky {
        fn poll(&self) -> Result<Vec<GpuReading>, AcquisitionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(AcquisitionError::unavailable("driver busy"));
            }
            Ok(vec![GpuReading {
                index: 0,
                name: "test".into(),
                load: 0.5,
                memory_used: 1,
                memory_total: 2,
                temperature: None,
            }])
        }
    }

    #[test]
    fn failed_polls_are_skipped_until_one_succeeds() {
        let mut cfg = ProbeConfig::default();
        cfg.instruments.gpu = true;
        cfg.runtime.heartbeat = false;
        cfg.runtime.gpu_poll_interval = Duration::from_millis(2);
        let collaborators = Collaborators::default().with_gpu(Flaky {
            calls: AtomicU32::new(0),
            failures: 5,
        });
        let mut o = Overseer::new(EventBus::default(), cfg, collaborators).unwrap();
        o.register(GpuMonitor::new()).unwrap();
        let readings = Flow::values(o.bus(), GPU_CHANNEL).accumulate().unwrap();

        while o.current_phase() != Some(Phase::LoadScript) {
            o.advance().unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while readings.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!readings.is_empty());

        o.advance().unwrap();
        assert_eq!(o.current_phase(), Some(Phase::RunScript));
        let after_stop = readings.len();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(readings.len(), after_stop);
    }

    #[test]
    fn missing_telemetry_leaves_it_finished() {
        let mut cfg = ProbeConfig::default();
        cfg.instruments.gpu = true;
        cfg.runtime.heartbeat = false;
        let mut o = Overseer::new(EventBus::default(), cfg, Collaborators::default()).unwrap();
        o.register(GpuMonitor::new()).unwrap();
        o.run_to_end().unwrap();
        assert_eq!(o.bus().channel_count(GPU_CHANNEL), 0);
    }
}
