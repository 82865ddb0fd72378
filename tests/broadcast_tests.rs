use std::sync::Arc;
use std::thread;
use std::time::Duration;

use actix_rt::time::{sleep, timeout};
use gpiosvc::backend::MockGpioBackend;
use gpiosvc::broadcast::{Broadcaster, Delivery, Subscriber, SubscriberState};
use gpiosvc::dispatcher::{Status, dispatch};
use gpiosvc::error::ErrorKind;
use gpiosvc::gpio::{ChangeEvent, Direction, PinManager};
use tokio_stream::StreamExt;

fn setup() -> (Arc<PinManager<MockGpioBackend>>, MockGpioBackend, Arc<Broadcaster>) {
    setup_with_ring(16)
}

fn setup_with_ring(
    capacity: usize,
) -> (Arc<PinManager<MockGpioBackend>>, MockGpioBackend, Arc<Broadcaster>) {
    let backend = MockGpioBackend::with_lines([17, 18, 27]);
    let manager = Arc::new(PinManager::new(Arc::new(backend.clone())));
    let broadcaster = Arc::new(Broadcaster::new(capacity));
    manager.register_observer(broadcaster.clone());
    (manager, backend, broadcaster)
}

/// Drains everything queued, returning (events seen, events reported lost).
fn drain_deliveries(subscriber: &mut Subscriber) -> (Vec<ChangeEvent>, u64) {
    let mut events = Vec::new();
    let mut lagged = 0;
    while let Some(delivery) = subscriber.try_recv() {
        match delivery {
            Delivery::Event(event) => events.push(event),
            Delivery::Lagged(n) => lagged += n,
        }
    }
    (events, lagged)
}

async fn next_event(subscriber: &mut Subscriber) -> ChangeEvent {
    match timeout(Duration::from_secs(1), subscriber.recv()).await {
        Ok(Some(Delivery::Event(event))) => event,
        other => panic!("expected an event, got {other:?}"),
    }
}

fn event(line_id: u32, value: bool) -> ChangeEvent {
    ChangeEvent {
        line_id,
        value,
        timestamp_ms: 0,
    }
}

#[actix_rt::test]
async fn every_subscriber_gets_exactly_one_notification() {
    let (manager, _backend, broadcaster) = setup();
    manager.configure(18, Direction::Output).unwrap();

    let mut subscribers: Vec<Subscriber> = (0..3).map(|_| broadcaster.subscribe()).collect();
    manager.write(18, true).unwrap();

    for subscriber in subscribers.iter_mut() {
        let event = next_event(subscriber).await;
        assert_eq!(event.line_id, 18);
        assert!(event.value);
    }

    let mut late = broadcaster.subscribe();
    sleep(Duration::from_millis(20)).await;

    for subscriber in subscribers.iter_mut() {
        assert_eq!(subscriber.try_recv(), None);
    }
    assert_eq!(late.try_recv(), None);
}

#[actix_rt::test]
async fn events_arrive_in_publish_order() {
    let (manager, _backend, broadcaster) = setup();
    manager.configure(17, Direction::Output).unwrap();
    let mut subscriber = broadcaster.subscribe();

    for value in [true, false, true, true] {
        manager.write(17, value).unwrap();
    }

    let mut received = Vec::new();
    for _ in 0..4 {
        received.push(next_event(&mut subscriber).await.value);
    }
    assert_eq!(received, vec![true, false, true, true]);
}

#[test]
fn slow_subscriber_loses_oldest_events() {
    let broadcaster = Broadcaster::new(2);
    let mut slow = broadcaster.subscribe();

    for line_id in 1..=5 {
        broadcaster.fan_out(&event(line_id, true));
    }

    assert_eq!(slow.try_recv(), Some(Delivery::Lagged(3)));
    assert_eq!(slow.try_recv(), Some(Delivery::Event(event(4, true))));
    assert_eq!(slow.try_recv(), Some(Delivery::Event(event(5, true))));
    assert_eq!(slow.try_recv(), None);
}

#[test]
fn write_burst_is_fully_accounted_for_a_slow_subscriber() {
    let (manager, _backend, broadcaster) = setup_with_ring(8);
    manager.configure(18, Direction::Output).unwrap();
    let mut slow = broadcaster.subscribe();

    for n in 0..40 {
        manager.write(18, n % 2 == 0).unwrap();
    }

    let (events, lagged) = drain_deliveries(&mut slow);
    assert_eq!(events.len() as u64 + lagged, 40);
    assert_eq!(events.len(), 8);
    // the survivors are the newest writes, still in commit order
    let values: Vec<bool> = events.iter().map(|e| e.value).collect();
    let expected: Vec<bool> = (32..40).map(|n| n % 2 == 0).collect();
    assert_eq!(values, expected);
}

#[test]
fn write_burst_within_ring_loses_nothing() {
    let (manager, _backend, broadcaster) = setup_with_ring(64);
    manager.configure(17, Direction::Output).unwrap();
    manager.configure(18, Direction::Output).unwrap();
    let mut subscriber = broadcaster.subscribe();

    let writers: Vec<_> = [17, 18]
        .into_iter()
        .map(|line_id| {
            let manager = manager.clone();
            thread::spawn(move || {
                for n in 0..20 {
                    manager.write(line_id, n % 2 == 0).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let (events, lagged) = drain_deliveries(&mut subscriber);
    assert_eq!(lagged, 0);
    assert_eq!(events.len(), 40);
    for line_id in [17, 18] {
        let values: Vec<bool> = events
            .iter()
            .filter(|e| e.line_id == line_id)
            .map(|e| e.value)
            .collect();
        let expected: Vec<bool> = (0..20).map(|n| n % 2 == 0).collect();
        assert_eq!(values, expected, "line {line_id}");
    }
}

#[test]
fn slow_subscriber_does_not_hold_back_others() {
    let broadcaster = Broadcaster::new(2);
    let _slow = broadcaster.subscribe();
    let mut fast = broadcaster.subscribe();

    for line_id in 1..=10 {
        assert_eq!(broadcaster.fan_out(&event(line_id, false)), 2);
        assert_eq!(fast.try_recv(), Some(Delivery::Event(event(line_id, false))));
    }
}

#[test]
fn unsubscribe_during_broadcast_is_safe() {
    let broadcaster = Arc::new(Broadcaster::new(8));
    let mut subscriber = broadcaster.subscribe();
    let id = subscriber.id();

    let publisher = {
        let broadcaster = broadcaster.clone();
        thread::spawn(move || {
            for n in 0..1000 {
                broadcaster.fan_out(&event(n, n % 2 == 0));
            }
        })
    };
    thread::sleep(Duration::from_millis(1));
    assert!(broadcaster.unsubscribe(id));
    publisher.join().unwrap();

    assert_eq!(subscriber.state(), SubscriberState::Closed);
    assert_eq!(subscriber.try_recv(), None);
    assert_eq!(broadcaster.subscriber_count(), 0);
    assert_eq!(broadcaster.fan_out(&event(1, true)), 0);
}

#[test]
fn dropped_subscriber_is_removed_on_next_fan_out() {
    let broadcaster = Broadcaster::new(4);
    let subscriber = broadcaster.subscribe();
    let _kept = broadcaster.subscribe();
    drop(subscriber);

    assert_eq!(broadcaster.fan_out(&event(18, true)), 1);
    assert_eq!(broadcaster.subscriber_count(), 1);
}

#[actix_rt::test]
async fn stream_ends_when_unsubscribed() {
    let broadcaster = Broadcaster::new(4);
    let subscriber = broadcaster.subscribe();
    let id = subscriber.id();
    let stream = subscriber.into_stream();
    tokio::pin!(stream);

    broadcaster.fan_out(&event(18, true));
    assert_eq!(stream.next().await, Some(Delivery::Event(event(18, true))));

    broadcaster.unsubscribe(id);
    let end = timeout(Duration::from_secs(1), stream.next()).await;
    assert_eq!(end, Ok(None));
}

#[actix_rt::test]
async fn dispatcher_write_acknowledges_and_notifies() {
    let (manager, backend, broadcaster) = setup();
    manager.configure(18, Direction::Output).unwrap();
    let mut subscriber = broadcaster.subscribe();

    let reply = dispatch(&manager, r#"{"action":"write","line_id":18,"value":true}"#);
    assert_eq!(reply.status, Status::Success);
    assert_eq!(reply.action, Some("write"));
    assert_eq!(reply.value, Some(true));
    assert!(backend.level(18));

    let event = next_event(&mut subscriber).await;
    assert_eq!((event.line_id, event.value), (18, true));
}

#[test]
fn dispatcher_reports_failure_kinds() {
    let backend = MockGpioBackend::with_lines([18, 27]);
    let manager = PinManager::new(Arc::new(backend.clone()));
    manager.configure(27, Direction::Input).unwrap();
    backend.set_level(27, true);

    let reply = dispatch(&manager, r#"{"action":"read","line_id":18}"#);
    assert_eq!(reply.status, Status::Error);
    assert_eq!(reply.kind, Some(ErrorKind::LineNotConfigured));

    let reply = dispatch(&manager, r#"{"action":"write","pin":27,"value":true}"#);
    assert_eq!(reply.kind, Some(ErrorKind::WrongDirection));
    assert_eq!(reply.line_id, Some(27));

    let reply = dispatch(&manager, r#"{"action":"read","line_id":27}"#);
    assert_eq!(reply.status, Status::Success);
    assert_eq!(reply.value, Some(true));
}

#[test]
fn dispatcher_rejects_malformed_payloads() {
    let manager = PinManager::new(Arc::new(MockGpioBackend::default()));

    for payload in [
        "not json",
        r#"{"action":"toggle","line_id":1}"#,
        r#"{"action":"read"}"#,
        r#"{"action":"write","line_id":"x","value":true}"#,
    ] {
        let reply = dispatch(&manager, payload);
        assert_eq!(reply.status, Status::Error, "payload {payload}");
        assert_eq!(reply.kind, Some(ErrorKind::InvalidFormat));
    }
}
