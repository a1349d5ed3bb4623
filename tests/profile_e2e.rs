//! Profiling is once per process, so everything lives in a single test.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use runprobe::collaborators::{Collaborators, ProfileReport, Profiler, ProfilerFactory, ProfiledOp};
use runprobe::instruments::register_builtins;
use runprobe::probe::{self, COMPUTE_SITE};
use runprobe::{AcquisitionError, EventBus, InstrumentState, Overseer, Phase, ProbeConfig, ProfilerKind, Value};

#[derive(Default)]
struct Counts {
    created: AtomicUsize,
    started: AtomicUsize,
    stopped: AtomicUsize,
}

struct FakeProfiler(Arc<Counts>);

impl Profiler for FakeProfiler {
    fn start(&mut self) -> Result<(), AcquisitionError> {
        self.0.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<ProfileReport, AcquisitionError> {
        self.0.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(ProfileReport::Events(vec![
            ProfiledOp {
                name: "linear".into(),
                flops: 4096,
            },
            ProfiledOp {
                name: "relu".into(),
                flops: 64,
            },
        ]))
    }
}

struct FakeFactory(Arc<Counts>);

impl ProfilerFactory for FakeFactory {
    fn create(&self, kind: ProfilerKind) -> Option<Box<dyn Profiler>> {
        assert_eq!(kind, ProfilerKind::Torch);
        self.0.created.fetch_add(1, Ordering::SeqCst);
        Some(Box::new(FakeProfiler(Arc::clone(&self.0))))
    }
}

fn run(counts: &Arc<Counts>) -> Vec<Value> {
    let bus = EventBus::default();
    let stats = bus.subscribe("profiler_stats").unwrap();
    let mut cfg = ProbeConfig::default();
    cfg.runtime.heartbeat = false;
    cfg.instruments.profile = "torch".to_string();
    let collaborators = Collaborators::default().with_profilers(FakeFactory(Arc::clone(counts)));
    let mut o = Overseer::new(bus.clone(), cfg, collaborators).unwrap();
    register_builtins(&mut o).unwrap();
    while o.advance().unwrap() != Phase::LoadScript {}

    for _ in 0..3 {
        let mut span = probe::span(&bus, COMPUTE_SITE);
        span.give("batch", Value::Batch { len: 4 });
        span.finish();
    }
    o.run_to_end().unwrap();
    assert_eq!(o.state("profile"), Some(&InstrumentState::Finished));
    stats.drain_buffered().iter().map(|ev| ev.value.clone()).collect()
}

#[test]
fn profiles_one_compute_step_once_per_process() {
    let counts = Arc::new(Counts::default());

    let first = run(&counts);
    assert_eq!(counts.started.load(Ordering::SeqCst), 1);
    assert_eq!(counts.stopped.load(Ordering::SeqCst), 1);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].get("kind"), Some(&Value::from("torch")));
    assert_eq!(first[0].get("total_flops"), Some(&Value::Int(4160)));
    assert_eq!(first[0].get("ops"), Some(&Value::Int(2)));

    // A second run in the same process builds a profiler but never starts it.
    let second = run(&counts);
    assert_eq!(counts.created.load(Ordering::SeqCst), 2);
    assert_eq!(counts.started.load(Ordering::SeqCst), 1);
    assert!(second.is_empty());
}
