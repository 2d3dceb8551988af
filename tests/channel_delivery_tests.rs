use filament::{Channel, Fiber, ThreadFiber};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn started_fiber() -> Arc<ThreadFiber> {
    let fiber = Arc::new(ThreadFiber::new());
    fiber.start();
    fiber
}

fn wait_until(limit: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::yield_now();
    }
    check()
}

#[test]
fn test_direct_delivery_preserves_publish_order() {
    let channel = Channel::new();
    let fiber = started_fiber();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    let _sub = channel.subscribe(fiber.clone(), move |msg: u32| {
        sink.lock().push(msg);
    });

    for i in 0..100 {
        channel.publish(i);
    }

    assert!(wait_until(Duration::from_secs(2), || seen.lock().len() == 100));
    assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    fiber.stop();
    fiber.join();
}

#[test]
fn test_batch_window_collects_in_order() {
    let channel = Channel::new();
    let fiber = started_fiber();
    let deliveries: Arc<Mutex<Vec<Vec<&str>>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&deliveries);
    let _sub = channel.subscribe_batch(fiber.clone(), Duration::from_millis(100), move |batch| {
        sink.lock().push(batch);
    });

    let started = Instant::now();
    channel.publish("a");
    thread::sleep(Duration::from_millis(50));
    channel.publish("b");

    assert!(wait_until(Duration::from_secs(2), || !deliveries
        .lock()
        .is_empty()));
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(90),
        "flush arrived too early: {:?}",
        elapsed
    );
    assert_eq!(*deliveries.lock(), vec![vec!["a", "b"]]);

    // An empty window produces nothing.
    thread::sleep(Duration::from_millis(200));
    assert_eq!(deliveries.lock().len(), 1);
    fiber.stop();
    fiber.join();
}

#[test]
fn test_batch_windows_reset_between_flushes() {
    let channel = Channel::new();
    let fiber = started_fiber();
    let deliveries: Arc<Mutex<Vec<Vec<u32>>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&deliveries);
    let _sub = channel.subscribe_batch(fiber.clone(), Duration::from_millis(30), move |batch| {
        sink.lock().push(batch);
    });

    channel.publish(1);
    channel.publish(2);
    assert!(wait_until(Duration::from_secs(1), || deliveries.lock().len() == 1));

    channel.publish(3);
    assert!(wait_until(Duration::from_secs(1), || deliveries.lock().len() == 2));
    assert_eq!(*deliveries.lock(), vec![vec![1, 2], vec![3]]);
    fiber.stop();
    fiber.join();
}

#[test]
fn test_keyed_batch_overwrites_same_key() {
    let channel = Channel::new();
    let fiber = started_fiber();
    let deliveries: Arc<Mutex<Vec<HashMap<&str, (&str, u32)>>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&deliveries);
    let _sub = channel.subscribe_keyed_batch(
        fiber.clone(),
        Duration::from_millis(50),
        |message: &(&str, u32)| message.0,
        move |batch| {
            sink.lock().push(batch);
        },
    );

    channel.publish(("x", 1));
    thread::sleep(Duration::from_millis(10));
    channel.publish(("x", 2));

    assert!(wait_until(Duration::from_secs(2), || !deliveries
        .lock()
        .is_empty()));
    let deliveries = deliveries.lock();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].len(), 1);
    assert_eq!(deliveries[0]["x"], ("x", 2));
    fiber.stop();
    fiber.join();
}

#[test]
fn test_conflating_subscriber_sees_only_newest() {
    let channel = Channel::new();
    let fiber = started_fiber();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    let _sub = channel.subscribe_last(fiber.clone(), Duration::from_millis(40), move |msg: u32| {
        sink.lock().push(msg);
    });

    channel.publish(1);
    channel.publish(2);
    channel.publish(3);

    assert!(wait_until(Duration::from_secs(2), || !seen.lock().is_empty()));
    assert_eq!(*seen.lock(), vec![3]);
    fiber.stop();
    fiber.join();
}

#[test]
fn test_unsubscribe_during_traffic_is_clean() {
    let channel = Channel::new();
    let fiber = started_fiber();
    let seen = Arc::new(Mutex::new(0usize));

    let sink = Arc::clone(&seen);
    let sub = channel.subscribe(fiber.clone(), move |_msg: u32| {
        *sink.lock() += 1;
    });

    channel.publish(1);
    sub.dispose();
    channel.publish(2);

    thread::sleep(Duration::from_millis(100));
    assert!(*seen.lock() <= 1);
    assert_eq!(channel.subscriber_count(), 0);
    fiber.stop();
    fiber.join();
}

#[test]
fn test_handler_can_republish_to_its_own_channel() {
    let channel: Channel<u32> = Channel::new();
    let fiber = started_fiber();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let loopback = channel.clone();
    let sink = Arc::clone(&seen);
    let _sub = channel.subscribe(fiber.clone(), move |msg: u32| {
        sink.lock().push(msg);
        if msg == 0 {
            loopback.publish(msg + 1);
        }
    });

    channel.publish(0);
    assert!(wait_until(Duration::from_secs(2), || seen.lock().len() == 2));
    assert_eq!(*seen.lock(), vec![0, 1]);
    fiber.stop();
    fiber.join();
}

#[test]
fn test_two_fibers_receive_the_same_publish() {
    let channel = Channel::new();
    let first = started_fiber();
    let second = started_fiber();
    let first_seen = Arc::new(Mutex::new(Vec::new()));
    let second_seen = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&first_seen);
    let _a = channel.subscribe(first.clone(), move |msg: u32| {
        sink.lock().push(msg);
    });
    let sink = Arc::clone(&second_seen);
    let _b = channel.subscribe(second.clone(), move |msg: u32| {
        sink.lock().push(msg);
    });

    assert_eq!(channel.publish(9), 2);
    assert!(wait_until(Duration::from_secs(2), || {
        first_seen.lock().len() == 1 && second_seen.lock().len() == 1
    }));
    first.stop();
    first.join();
    second.stop();
    second.join();
}
