//! Bus contract scenarios on the in-process virtual transport
//!
//! These run everywhere; the same scenarios against real SocketCAN live in
//! `socketcan_test.rs`.

use parking_lot::Mutex;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;
use voltage_canbus::{registry, Bus, BusConfig, BusRegistry, CanBusError, Frame, ReceptionState};

type Captured = Arc<Mutex<Vec<Frame>>>;

fn capture(bus: &dyn Bus) -> Captured {
    let seen: Captured = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.subscribe(Box::new(move |frame: Frame| sink.lock().push(frame)));
    seen
}

async fn wait_for(seen: &Captured, count: usize, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if seen.lock().len() >= count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    seen.lock().len() >= count
}

#[tokio::test]
async fn basic_exchange() {
    let registry = BusRegistry::with_defaults();
    let sender = registry.create("virtual", "it-basic").unwrap();
    let receiver = registry.create("virtual", "it-basic").unwrap();
    sender.connect().await.unwrap();
    receiver.connect().await.unwrap();
    let seen = capture(receiver.as_ref());

    let frame = Frame::new(0x100, &[0, 1, 2, 3, 4, 5, 6, 7]).unwrap();
    sender.send(&frame).await.unwrap();

    assert!(wait_for(&seen, 1, Duration::from_millis(200)).await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(*seen.lock(), vec![frame]);

    sender.disconnect().await.unwrap();
    receiver.disconnect().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn burst_of_500_in_order() {
    let registry = BusRegistry::with_defaults();
    let sender = registry.create("virtual", "it-burst").unwrap();
    let receiver = registry.create("virtual", "it-burst").unwrap();
    let seen = capture(receiver.as_ref());
    receiver.connect().await.unwrap();
    sender.connect().await.unwrap();

    for i in 0..500u32 {
        let data = [(i % 256) as u8, (i / 256) as u8];
        sender.send(&Frame::new(0x200, &data).unwrap()).await.unwrap();
    }

    assert!(wait_for(&seen, 500, Duration::from_secs(5)).await);
    let seen = seen.lock();
    assert_eq!(seen.len(), 500);
    for (i, frame) in seen.iter().enumerate() {
        let n = usize::from(frame.data()[0]) + 256 * usize::from(frame.data()[1]);
        assert_eq!(n, i, "frame {i} out of order");
    }
    assert_eq!(receiver.stats().frames_dropped, 0);
}

#[tokio::test]
async fn own_reception_toggle() {
    let registry = BusRegistry::with_defaults();

    let quiet = registry.create("virtual", "it-own-off").unwrap();
    let seen = capture(quiet.as_ref());
    quiet.connect().await.unwrap();
    quiet.send(&Frame::new(0x10, &[1]).unwrap()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(seen.lock().is_empty());

    let config = BusConfig {
        receive_own_messages: true,
        ..Default::default()
    };
    let echo = registry.create_with("virtual", "it-own-on", &config).unwrap();
    let seen = capture(echo.as_ref());
    echo.connect().await.unwrap();
    echo.send(&Frame::new(0x10, &[1]).unwrap()).await.unwrap();
    assert!(wait_for(&seen, 1, Duration::from_millis(200)).await);
}

#[tokio::test]
async fn connect_twice_never_duplicates() {
    let registry = BusRegistry::with_defaults();
    let sender = registry.create("virtual", "it-twice").unwrap();
    let receiver = registry.create("virtual", "it-twice").unwrap();
    let seen = capture(receiver.as_ref());
    sender.connect().await.unwrap();
    receiver.connect().await.unwrap();
    receiver.connect().await.unwrap();

    for i in 0..10u8 {
        sender.send(&Frame::new(0x300, &[i]).unwrap()).await.unwrap();
    }
    assert!(wait_for(&seen, 10, Duration::from_millis(500)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(seen.lock().len(), 10);
}

#[tokio::test]
async fn disconnect_is_idempotent_and_bounded() {
    let registry = BusRegistry::with_defaults();
    let bus = registry.create("virtual", "it-disconnect").unwrap();
    bus.disconnect().await.unwrap();

    let state = bus.reception_state();
    bus.connect().await.unwrap();
    let started = std::time::Instant::now();
    bus.disconnect().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(200));
    bus.disconnect().await.unwrap();
    assert_eq!(*state.borrow(), ReceptionState::Stopped);

    // Reconnect after disconnect starts a fresh task
    bus.connect().await.unwrap();
    assert!(state.borrow().is_running());
    bus.disconnect().await.unwrap();
}

#[tokio::test]
async fn noop_listener_deregisters() {
    let registry = BusRegistry::with_defaults();
    let sender = registry.create("virtual", "it-noop").unwrap();
    let receiver = registry.create("virtual", "it-noop").unwrap();
    let seen = capture(receiver.as_ref());
    sender.connect().await.unwrap();
    receiver.connect().await.unwrap();

    sender.send(&Frame::new(0x1, &[]).unwrap()).await.unwrap();
    assert!(wait_for(&seen, 1, Duration::from_millis(200)).await);

    receiver.subscribe(Box::new(voltage_canbus::NoopListener));
    sender.send(&Frame::new(0x2, &[]).unwrap()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(seen.lock().len(), 1);
    assert_eq!(receiver.stats().frames_received, 2);
}

#[test]
fn unknown_transport_name() {
    let registry = BusRegistry::with_defaults();
    let err = registry.create("doesnotexist", "chan").unwrap_err();
    assert!(matches!(err, CanBusError::UnknownTransport(_)));
    assert!(err.is_config());
}

#[test]
#[serial]
#[traced_test]
fn global_registry_registration() {
    voltage_canbus::register_default_transports();
    // Registration is repeatable
    voltage_canbus::register_default_transports();

    assert!(registry::global().names().contains(&"virtual".to_string()));
    assert!(logs_contain("Registered CAN transports"));

    let bus = registry::create("virtual", "it-global").unwrap();
    assert_eq!(bus.transport_type(), "virtual");
    assert!(registry::create("doesnotexist", "chan").is_err());
}

#[tokio::test]
#[serial]
async fn global_registry_custom_transport() {
    registry::register("it-custom", |channel: &str, config: &BusConfig| {
        Ok(Box::new(voltage_canbus::transport::VirtualBus::new(channel, config)?) as Box<dyn Bus>)
    });
    let bus = registry::create("it-custom", "it-custom-chan").unwrap();
    assert_eq!(bus.channel(), "it-custom-chan");
}

#[tokio::test]
async fn stats_snapshot_serializes() {
    let registry = BusRegistry::with_defaults();
    let bus = registry.create("virtual", "it-stats").unwrap();
    bus.connect().await.unwrap();
    bus.send(&Frame::new(0x5, &[9]).unwrap()).await.unwrap();

    let json = serde_json::to_value(bus.stats()).unwrap();
    assert_eq!(json["frames_sent"], 1);
    assert_eq!(json["frames_dropped"], 0);

    let state = serde_json::to_string(&*bus.reception_state().borrow()).unwrap();
    assert_eq!(state, "\"Running\"");
    bus.disconnect().await.unwrap();
}
