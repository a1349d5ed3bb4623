use std::sync::Arc;
use std::time::Duration;

use runprobe::collaborators::Collaborators;
use runprobe::instruments::register_builtins;
use runprobe::probe::{self, LoaderDescriptor, LoaderKind, ProbedIter, COMPUTE_SITE, LOADER_NEXT_SITE};
use runprobe::time::{ManualClock, Timestamp};
use runprobe::{BusConfig, EventBus, EventStream, Overseer, Phase, ProbeConfig, Value};

struct Harness {
    clock: Arc<ManualClock>,
    bus: EventBus,
    overseer: Overseer,
    rates: EventStream,
}

fn harness(channel: &str, configure: impl FnOnce(&mut ProbeConfig)) -> Harness {
    let clock = Arc::new(ManualClock::new());
    let bus = EventBus::with_clock(BusConfig::default(), clock.clone());
    let rates = bus.subscribe(channel).unwrap();
    let mut cfg = ProbeConfig::default();
    cfg.runtime.heartbeat = false;
    configure(&mut cfg);
    let mut overseer = Overseer::new(bus.clone(), cfg, Collaborators::default()).unwrap();
    register_builtins(&mut overseer).unwrap();
    while overseer.advance().unwrap() != Phase::LoadScript {}
    Harness {
        clock,
        bus,
        overseer,
        rates,
    }
}

fn floats(stream: &EventStream) -> Vec<f64> {
    stream.drain_buffered().iter().filter_map(|ev| ev.value.as_float()).collect()
}

#[test]
fn loading_rate_times_each_batch_of_an_iterator_loader() {
    let mut h = harness("loading_rate", |cfg| cfg.instruments.loading_rate = true);
    assert!(!probe::is_armed(&h.bus, LOADER_NEXT_SITE));

    // Producing each batch of 10 takes 50ms: 200 items/s.
    let clock = Arc::clone(&h.clock);
    let batches = (0..30).map(move |_| {
        clock.advance(Duration::from_millis(50));
        10usize
    });
    let loader = ProbedIter::new(&h.bus, LoaderDescriptor::iterator("train"), batches, |len| Value::Batch {
        len: *len,
    });
    assert!(probe::is_armed(&h.bus, LOADER_NEXT_SITE));
    assert_eq!(loader.count(), 30);

    h.overseer.run_to_end().unwrap();
    let rates = floats(&h.rates);
    // Throttled to one per second over 1.5s of loading.
    assert_eq!(rates.len(), 2);
    for rate in rates {
        assert!((rate - 200.0).abs() < 1e-6, "got {rate}");
    }
}

#[test]
fn opaque_loaders_are_left_alone() {
    let mut h = harness("loading_rate", |cfg| cfg.instruments.loading_rate = true);
    let loader = ProbedIter::new(
        &h.bus,
        LoaderDescriptor::new("materialised", LoaderKind::Opaque),
        vec![1, 2, 3].into_iter(),
        |_| Value::Batch { len: 1 },
    );
    assert_eq!(loader.sum::<i32>(), 6);
    h.overseer.run_to_end().unwrap();
    assert!(floats(&h.rates).is_empty());
}

#[test]
fn compute_rate_is_smoothed_over_recent_steps() {
    let mut h = harness("compute_rate", |cfg| {
        cfg.instruments.compute_rate = true;
        cfg.runtime.rate_throttle = Duration::from_millis(1);
        cfg.runtime.smoothing_window = 2;
    });

    // 100 items/s then 50 items/s.
    for (start, millis) in [(0, 100), (1000, 200)] {
        h.clock.set(Timestamp::from_millis(start));
        let mut span = probe::span(&h.bus, COMPUTE_SITE);
        assert!(span.is_armed());
        h.clock.advance(Duration::from_millis(millis));
        span.give("batch", Value::Batch { len: 10 });
        span.finish();
    }

    h.overseer.run_to_end().unwrap();
    let rates = floats(&h.rates);
    assert_eq!(rates.len(), 2);
    assert!((rates[0] - 100.0).abs() < 1e-6);
    assert!((rates[1] - 75.0).abs() < 1e-6);
}

#[test]
fn unobserved_compute_site_publishes_nothing() {
    let mut h = harness("*", |_| {});
    let span = probe::span(&h.bus, COMPUTE_SITE);
    assert!(!span.is_armed());
    span.finish();
    h.overseer.run_to_end().unwrap();
    assert!(h.rates.drain_buffered().is_empty());
    assert_eq!(h.bus.channel_count(&probe::channel(COMPUTE_SITE)), 0);
}
