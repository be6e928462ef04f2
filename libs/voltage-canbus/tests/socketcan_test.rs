//! SocketCAN transport scenarios on `vcan0`
//!
//! Set up the interface before running with `--ignored`:
//!
//! ```text
//! sudo modprobe vcan
//! sudo ip link add dev vcan0 type vcan
//! sudo ip link set up vcan0
//! ```
//!
//! The ring transport additionally needs `CAP_NET_RAW`. Tests share the
//! interface and run one at a time.

#![cfg(all(target_os = "linux", feature = "socketcan"))]

use parking_lot::Mutex;
use serial_test::serial;
use std::sync::Arc;
use std::time::{Duration, Instant};
use voltage_canbus::{Bus, BusConfig, BusRegistry, CanBusError, Frame, ReceptionState};

const CHANNEL: &str = "vcan0";

const SOCKET_TRANSPORTS: [&str; 4] = [
    "socketcan-blocking",
    "socketcan",
    "socketcan-batch",
    "socketcan-ring",
];

type Captured = Arc<Mutex<Vec<Frame>>>;

fn capture(bus: &dyn Bus) -> Captured {
    let seen: Captured = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.subscribe(Box::new(move |frame: Frame| sink.lock().push(frame)));
    seen
}

async fn wait_for(seen: &Captured, count: usize, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if seen.lock().len() >= count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    seen.lock().len() >= count
}

/// Receiver of the given transport plus a plain cancellable sender
async fn pair(registry: &BusRegistry, transport: &str) -> (Box<dyn Bus>, Box<dyn Bus>, Captured) {
    let receiver = registry.create(transport, CHANNEL).unwrap();
    let seen = capture(receiver.as_ref());
    receiver.connect().await.unwrap();
    let sender = registry.create("socketcan", CHANNEL).unwrap();
    sender.connect().await.unwrap();
    (sender, receiver, seen)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires vcan0"]
#[serial]
async fn basic_exchange_all_transports() {
    let registry = BusRegistry::with_defaults();
    for transport in SOCKET_TRANSPORTS {
        let (sender, receiver, seen) = pair(&registry, transport).await;

        let frame = Frame::new(0x100, &[0, 1, 2, 3, 4, 5, 6, 7]).unwrap();
        sender.send(&frame).await.unwrap();

        assert!(
            wait_for(&seen, 1, Duration::from_millis(200)).await,
            "{transport}: no frame within 200 ms"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock(), vec![frame], "{transport}");

        receiver.disconnect().await.unwrap();
        sender.disconnect().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires vcan0"]
#[serial]
async fn burst_of_500_in_order_all_transports() {
    let registry = BusRegistry::with_defaults();
    for transport in SOCKET_TRANSPORTS {
        let (sender, receiver, seen) = pair(&registry, transport).await;

        for i in 0..500u32 {
            let frame = Frame::new(0x200, &[(i % 256) as u8, (i / 256) as u8]).unwrap();
            sender.send(&frame).await.unwrap();
            // Keep below the vcan0 transmit queue length
            if i % 50 == 49 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }

        assert!(
            wait_for(&seen, 500, Duration::from_secs(5)).await,
            "{transport}: got {} of 500",
            seen.lock().len()
        );
        for (i, frame) in seen.lock().iter().enumerate() {
            let n = usize::from(frame.data()[0]) + 256 * usize::from(frame.data()[1]);
            assert_eq!(n, i, "{transport}: frame {i} out of order");
        }

        receiver.disconnect().await.unwrap();
        sender.disconnect().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires vcan0"]
#[serial]
async fn own_reception_toggle() {
    let registry = BusRegistry::with_defaults();
    for transport in SOCKET_TRANSPORTS {
        for receive_own_messages in [false, true] {
            let config = BusConfig {
                receive_own_messages,
                ..Default::default()
            };
            let bus = registry.create_with(transport, CHANNEL, &config).unwrap();
            let seen = capture(bus.as_ref());
            bus.connect().await.unwrap();

            bus.send(&Frame::new(0x321, &[0xAA]).unwrap()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;

            let expected = usize::from(receive_own_messages);
            assert_eq!(
                seen.lock().len(),
                expected,
                "{transport} receive_own_messages={receive_own_messages}"
            );
            bus.disconnect().await.unwrap();
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires vcan0"]
#[serial]
async fn cancellation_bound_and_idempotent_disconnect() {
    let registry = BusRegistry::with_defaults();
    let config = BusConfig::default();
    for transport in SOCKET_TRANSPORTS {
        let bus = registry.create_with(transport, CHANNEL, &config).unwrap();
        bus.disconnect().await.unwrap();

        let state = bus.reception_state();
        bus.connect().await.unwrap();
        bus.connect().await.unwrap();
        assert!(state.borrow().is_running());

        let started = Instant::now();
        bus.disconnect().await.unwrap();
        let bound = 2 * Duration::from_millis(config.read_timeout_ms.max(config.ring.poll_interval_ms));
        assert!(
            started.elapsed() <= bound,
            "{transport}: disconnect took {:?}",
            started.elapsed()
        );
        assert_eq!(*state.borrow(), ReceptionState::Stopped);

        bus.disconnect().await.unwrap();
        assert!(matches!(
            bus.send(&Frame::new(0x1, &[]).unwrap()).await,
            Err(CanBusError::NotConnected)
        ));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires vcan0"]
#[serial]
async fn reconnect_after_disconnect() {
    let registry = BusRegistry::with_defaults();
    for transport in SOCKET_TRANSPORTS {
        let (sender, receiver, seen) = pair(&registry, transport).await;
        receiver.disconnect().await.unwrap();
        receiver.connect().await.unwrap();

        sender.send(&Frame::new(0x42, &[1]).unwrap()).await.unwrap();
        assert!(
            wait_for(&seen, 1, Duration::from_millis(200)).await,
            "{transport}: nothing received after reconnect"
        );
        receiver.disconnect().await.unwrap();
        sender.disconnect().await.unwrap();
    }
}
