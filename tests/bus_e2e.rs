use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use runprobe::bus::global;
use runprobe::{BusConfig, Delivery, EventBus, Flow, ProbeError, Value};

#[test]
fn concurrent_publishers_keep_per_channel_order() {
    let bus = EventBus::default();
    let seen: Arc<Mutex<Vec<(String, i64)>>> = Arc::default();
    let sink = Arc::clone(&seen);
    bus.subscribe_with("*", move |d| {
        if let Delivery::Event(ev) = d {
            if let Some(n) = ev.value.as_int() {
                sink.lock().unwrap().push((ev.name.clone(), n));
            }
        }
    })
    .unwrap();

    let handles: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|channel| {
            let bus = bus.clone();
            thread::spawn(move || {
                for n in 0..500i64 {
                    bus.publish(channel, n).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1500);
    for channel in ["a", "b", "c"] {
        let order: Vec<i64> = seen.iter().filter(|(c, _)| c == channel).map(|(_, n)| *n).collect();
        assert_eq!(order, (0..500).collect::<Vec<_>>(), "channel {channel}");
    }
}

#[test]
fn notifications_for_one_channel_never_overlap() {
    let bus = EventBus::default();
    let busy = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let delivered = Arc::new(AtomicUsize::new(0));
    let (b, o, d) = (Arc::clone(&busy), Arc::clone(&overlaps), Arc::clone(&delivered));
    bus.subscribe_with("loss", move |delivery| {
        if let Delivery::Event(_) = delivery {
            if b.swap(true, Ordering::SeqCst) {
                o.fetch_add(1, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(1));
            b.store(false, Ordering::SeqCst);
            d.fetch_add(1, Ordering::SeqCst);
        }
    })
    .unwrap();

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let bus = bus.clone();
            thread::spawn(move || {
                for n in 0..50 {
                    bus.publish("loss", f64::from(n)).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(delivered.load(Ordering::SeqCst), 100);
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
}

#[test]
fn stream_reader_on_another_thread_sees_everything_until_teardown() {
    let bus = EventBus::default();
    let stream = bus.subscribe("loss").unwrap();
    let reader = thread::spawn(move || stream.filter_map(|ev| ev.value.as_float()).collect::<Vec<_>>());

    for n in 0..100 {
        bus.publish("loss", f64::from(n)).unwrap();
    }
    bus.teardown();

    let values = reader.join().unwrap();
    assert_eq!(values.len(), 100);
    assert_eq!(values[99], 99.0);
}

#[test]
fn drain_resolves_reducers_and_teardown_closes() {
    let bus = EventBus::default();
    let last = Flow::values(&bus, "?loss").last().accumulate().unwrap();
    let never = Flow::values(&bus, "?accuracy").is_empty().accumulate().unwrap();
    bus.publish("loss", 3.0).unwrap();
    bus.publish("loss", 1.0).unwrap();
    assert!(last.is_empty());

    bus.drain();
    assert_eq!(last.snapshot(), vec![Value::Float(1.0)]);
    assert_eq!(never.snapshot(), vec![true]);
    assert!(last.is_complete());

    bus.teardown();
    assert!(matches!(bus.publish("loss", 0.5), Err(ProbeError::ChannelClosed)));
    assert!(matches!(bus.subscribe("loss"), Err(ProbeError::ChannelClosed)));
}

#[test]
fn process_wide_bus_is_explicit() {
    assert!(global::get().is_none());
    let bus = global::init(BusConfig::default());
    let seen = Flow::values(&bus, "step").accumulate().unwrap();
    global::get().unwrap().publish("step", 1i64).unwrap();
    assert_eq!(seen.snapshot(), vec![Value::Int(1)]);

    global::teardown();
    assert!(global::get().is_none());
    assert!(bus.is_closed());
}
