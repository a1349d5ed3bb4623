use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use runprobe::probe::{self, COMPUTE_SITE};
use runprobe::{Delivery, EventBus, Flow, Value};

fn bench_publish_no_subscribers(c: &mut Criterion) {
    let bus = EventBus::default();
    let mut group = c.benchmark_group("bus");
    group.throughput(Throughput::Elements(1));
    group.bench_function("publish_unobserved", |b| {
        b.iter(|| bus.publish(black_box("loss"), black_box(0.5)).unwrap());
    });
    group.finish();
}

fn bench_publish_fanout(c: &mut Criterion) {
    let bus = EventBus::default();
    // A realistic mix: a catch-all display and a few exact subscribers.
    bus.subscribe_with("*", |d| {
        black_box(d);
    })
    .unwrap();
    for _ in 0..4 {
        bus.subscribe_with("loss", |d| {
            if let Delivery::Event(ev) = d {
                black_box(ev.value.as_float());
            }
        })
        .unwrap();
    }

    let mut group = c.benchmark_group("bus");
    group.throughput(Throughput::Elements(1));
    group.bench_function("publish_fanout_5", |b| {
        b.iter(|| bus.publish(black_box("loss"), black_box(0.5)).unwrap());
    });
    group.finish();
}

fn bench_rate_pipeline(c: &mut Criterion) {
    let bus = EventBus::default();
    Flow::probe(&bus, COMPUTE_SITE)
        .filter_map(|s| s.batch_rate())
        .scanning_average(5)
        .map(|r| Value::quantity(r, "items/s"))
        .publish_as("compute_rate")
        .unwrap();

    let mut group = c.benchmark_group("flow");
    group.throughput(Throughput::Elements(1));
    group.bench_function("compute_span_to_rate", |b| {
        b.iter(|| {
            let mut span = probe::span(&bus, COMPUTE_SITE);
            span.give("batch", Value::Batch { len: 32 });
            span.finish();
        });
    });
    group.finish();
}

fn bench_unarmed_probe(c: &mut Criterion) {
    let bus = EventBus::default();
    c.bench_function("probe/unarmed_span", |b| {
        b.iter(|| {
            let mut span = probe::span(&bus, black_box(COMPUTE_SITE));
            span.give("batch", Value::Batch { len: 32 });
            span.finish();
        });
    });
}

criterion_group!(
    bus,
    bench_publish_no_subscribers,
    bench_publish_fanout,
    bench_rate_pipeline,
    bench_unarmed_probe
);
criterion_main!(bus);
