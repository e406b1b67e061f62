//! Push delivery: listeners run on the event loop one at a time, delivery
//! stops on unsubscribe or cancellation, and failures follow the
//! subscription's error policy.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use common::{MockBroker, recording_runtime};
use futures::FutureExt;
use futures::future::BoxFuture;
use stomp_session::{
    BoxError, ConnError, DeliveryState, ErrorValue, EventLoop, ListenerErrorPolicy, Message,
    Metric, Rearm, Runtime, SessionError, Stomp, SubscribeOptions, Subscription,
};

type Seen = Arc<Mutex<Vec<String>>>;
type Handle = Arc<OnceLock<Subscription>>;

trait TestListener:
    Fn(Message) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync + 'static
{
}

impl<F> TestListener for F where
    F: Fn(Message) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync + 'static
{
}

async fn run_loop(event_loop: &mut EventLoop) -> Result<(), SessionError> {
    tokio::time::timeout(Duration::from_secs(5), event_loop.run())
        .await
        .expect("event loop did not go idle")
}

/// Record each body; unsubscribe once `stop_after` messages have been seen.
fn recording_listener(
    seen: &Seen,
    handle: &Handle,
    stop_after: usize,
) -> impl TestListener {
    let seen = seen.clone();
    let handle = handle.clone();
    move |msg: Message| {
        let seen = seen.clone();
        let handle = handle.clone();
        async move {
            let n = {
                let mut seen = seen.lock().unwrap();
                seen.push(msg.as_string().into_owned());
                seen.len()
            };
            if n >= stop_after {
                if let Some(sub) = handle.get() {
                    sub.unsubscribe().await?;
                }
            }
            Ok::<(), BoxError>(())
        }
        .boxed()
    }
}

fn collect_errors(errors: &Arc<Mutex<Vec<ErrorValue>>>) -> SubscribeOptions {
    let errors = errors.clone();
    SubscribeOptions::new().error_listener(move |err| {
        let errors = errors.clone();
        async move {
            errors.lock().unwrap().push(err);
            Ok::<(), BoxError>(())
        }
    })
}

async fn send_all(client: &stomp_session::Client, destination: &str, bodies: &[&str]) {
    for body in bodies {
        client.send(destination, "text/plain", *body, None).await.unwrap();
    }
}

// =============================================================================
// ordering and exclusivity
// =============================================================================

#[tokio::test]
async fn listener_sees_messages_in_order() {
    let broker = MockBroker::start().await;
    let (runtime, mut event_loop, sink) = recording_runtime();
    let client = Stomp::new(runtime).connect(&broker.options()).await.unwrap();
    send_all(&client, "/queue/push", &["m0", "m1", "m2", "m3", "m4"]).await;

    let seen: Seen = Arc::default();
    let handle: Handle = Arc::default();
    let sub = client
        .subscribe(
            "/queue/push",
            SubscribeOptions::new().listener(recording_listener(&seen, &handle, 5)),
        )
        .await
        .unwrap();
    let _ = handle.set(sub.clone());

    run_loop(&mut event_loop).await.unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["m0", "m1", "m2", "m3", "m4"]);
    assert_eq!(sink.count_for(Metric::ReadCount, "/queue/push"), 5);
    assert_eq!(sink.count(Metric::ReadTiming), 5);
    assert_eq!(sub.state(), DeliveryState::Terminated);
    assert!(!sub.is_active());
    broker.wait_for("UNSUBSCRIBE", 1).await;
}

#[tokio::test]
async fn listener_calls_never_overlap() {
    let broker = MockBroker::start().await;
    let (runtime, mut event_loop, _sink) = recording_runtime();
    let client = Stomp::new(runtime).connect(&broker.options()).await.unwrap();
    send_all(&client, "/queue/slow", &["a", "b", "c", "d"]).await;

    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));
    let handle: Handle = Arc::default();

    let (f, m, c, h) = (in_flight.clone(), max_seen.clone(), calls.clone(), handle.clone());
    let sub = client
        .subscribe(
            "/queue/slow",
            SubscribeOptions::new().listener(move |_msg| {
                let (f, m, c, h) = (f.clone(), m.clone(), c.clone(), h.clone());
                async move {
                    let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                    m.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    f.fetch_sub(1, Ordering::SeqCst);
                    if c.fetch_add(1, Ordering::SeqCst) + 1 == 4 {
                        if let Some(sub) = h.get() {
                            sub.unsubscribe().await?;
                        }
                    }
                    Ok::<(), BoxError>(())
                }
            }),
        )
        .await
        .unwrap();
    let _ = handle.set(sub);

    run_loop(&mut event_loop).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn read_is_refused_when_listener_attached() {
    let broker = MockBroker::start().await;
    let (runtime, _event_loop, _sink) = recording_runtime();
    let client = Stomp::new(runtime).connect(&broker.options()).await.unwrap();
    let sub = client
        .subscribe(
            "/queue/l",
            SubscribeOptions::new().listener(|_msg| async { Ok::<(), BoxError>(()) }),
        )
        .await
        .unwrap();
    assert!(matches!(sub.read().await, Err(SessionError::ListenerAttached)));
    assert_eq!(sub.state(), DeliveryState::Waiting);
}

// =============================================================================
// stopping delivery
// =============================================================================

#[tokio::test]
async fn unsubscribe_drops_buffered_messages() {
    let broker = MockBroker::start().await;
    let (runtime, mut event_loop, sink) = recording_runtime();
    let client = Stomp::new(runtime).connect(&broker.options()).await.unwrap();
    send_all(&client, "/queue/once", &["first", "second", "third"]).await;

    let seen: Seen = Arc::default();
    let handle: Handle = Arc::default();
    let sub = client
        .subscribe(
            "/queue/once",
            SubscribeOptions::new().listener(recording_listener(&seen, &handle, 1)),
        )
        .await
        .unwrap();
    let _ = handle.set(sub.clone());

    run_loop(&mut event_loop).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*seen.lock().unwrap(), vec!["first"]);
    assert_eq!(sink.count(Metric::ReadCount), 1);
    assert!(!sub.continue_delivery());
}

#[tokio::test]
async fn listener_disconnect_is_prompt_with_a_backlog() {
    let broker = MockBroker::start().await;
    let (runtime, mut event_loop, _sink) = recording_runtime();
    let mut opts = broker.options();
    opts.read_channel_capacity = 4;
    opts.receipt_timeout = Some(Duration::from_secs(3));
    let client = Stomp::new(runtime).connect(&opts).await.unwrap();
    let bodies: Vec<String> = (0..30).map(|i| format!("m{}", i)).collect();
    let bodies: Vec<&str> = bodies.iter().map(String::as_str).collect();
    send_all(&client, "/queue/backlog", &bodies).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let outcome: Arc<Mutex<Option<(Duration, bool)>>> = Arc::default();
    let (c, o, session) = (calls.clone(), outcome.clone(), client.clone());
    let _sub = client
        .subscribe(
            "/queue/backlog",
            SubscribeOptions::new().listener(move |_msg| {
                let (c, o, session) = (c.clone(), o.clone(), session.clone());
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        // Let the backlog fill the subscription channel.
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        let started = std::time::Instant::now();
                        let result = session.disconnect().await;
                        *o.lock().unwrap() = Some((started.elapsed(), result.is_ok()));
                    }
                    Ok::<(), BoxError>(())
                }
            }),
        )
        .await
        .unwrap();

    run_loop(&mut event_loop).await.unwrap();
    let (elapsed, ok) = outcome.lock().unwrap().take().expect("listener ran");
    assert!(ok, "disconnect failed");
    assert!(elapsed < Duration::from_secs(1), "disconnect took {:?}", elapsed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!client.is_connected());
    broker.wait_for("DISCONNECT", 1).await;
}

#[tokio::test]
async fn disconnect_releases_waiting_subscription() {
    let broker = MockBroker::start().await;
    let (runtime, mut event_loop, sink) = recording_runtime();
    let client = Stomp::new(runtime).connect(&broker.options()).await.unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let sub = client
        .subscribe(
            "/queue/idle",
            SubscribeOptions::new().listener(move |_msg| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), BoxError>(()) }
            }),
        )
        .await
        .unwrap();
    assert_eq!(sub.state(), DeliveryState::Waiting);

    let running = tokio::spawn(async move { run_loop(&mut event_loop).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.disconnect().await.unwrap();

    running.await.unwrap().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(sink.count(Metric::ReadTiming), 0);
    assert_eq!(sub.state(), DeliveryState::Terminated);
}

#[tokio::test]
async fn host_shutdown_releases_waiting_subscription() {
    let broker = MockBroker::start().await;
    let (runtime, mut event_loop, _sink) = recording_runtime();
    let stomp = Stomp::new(runtime.clone());
    let client = stomp.connect(&broker.options()).await.unwrap();
    let sub = client
        .subscribe(
            "/queue/idle",
            SubscribeOptions::new().listener(|_msg| async { Ok::<(), BoxError>(()) }),
        )
        .await
        .unwrap();

    runtime.shutdown();
    run_loop(&mut event_loop).await.unwrap();
    assert_eq!(sub.state(), DeliveryState::Terminated);
    assert!(!sub.continue_delivery());
}

#[tokio::test]
async fn inactive_runtime_skips_listener() {
    let broker = MockBroker::start().await;
    let (runtime, mut event_loop) = Runtime::new();
    let client = Stomp::new(runtime).connect(&broker.options()).await.unwrap();
    send_all(&client, "/queue/quiet", &["ignored"]).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let sub = client
        .subscribe(
            "/queue/quiet",
            SubscribeOptions::new().listener(move |_msg| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), BoxError>(()) }
            }),
        )
        .await
        .unwrap();

    run_loop(&mut event_loop).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(sub.state(), DeliveryState::Terminated);
}

// =============================================================================
// re-arming
// =============================================================================

#[tokio::test]
async fn manual_rearm_delivers_one_message_per_continue() {
    let broker = MockBroker::start().await;
    let (runtime, mut event_loop, _sink) = recording_runtime();
    let client = Stomp::new(runtime).connect(&broker.options()).await.unwrap();
    send_all(&client, "/queue/manual", &["one", "two", "three"]).await;

    let seen: Seen = Arc::default();
    let handle: Handle = Arc::default();
    let sub = client
        .subscribe(
            "/queue/manual",
            SubscribeOptions::new()
                .rearm(Rearm::Manual)
                .listener(recording_listener(&seen, &handle, usize::MAX)),
        )
        .await
        .unwrap();

    run_loop(&mut event_loop).await.unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["one"]);
    assert_eq!(sub.state(), DeliveryState::Idle);

    assert!(sub.continue_delivery());
    run_loop(&mut event_loop).await.unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["one", "two"]);

    assert!(sub.continue_delivery());
    run_loop(&mut event_loop).await.unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["one", "two", "three"]);
}

#[tokio::test]
async fn continue_during_dispatch_rearms_once() {
    let broker = MockBroker::start().await;
    let (runtime, mut event_loop, _sink) = recording_runtime();
    let client = Stomp::new(runtime).connect(&broker.options()).await.unwrap();
    send_all(&client, "/queue/self", &["x", "y"]).await;

    let seen: Seen = Arc::default();
    let handle: Handle = Arc::default();
    let (s, h) = (seen.clone(), handle.clone());
    let sub = client
        .subscribe(
            "/queue/self",
            SubscribeOptions::new().rearm(Rearm::Manual).listener(move |msg| {
                let (s, h) = (s.clone(), h.clone());
                async move {
                    s.lock().unwrap().push(msg.as_string().into_owned());
                    // Asking twice while dispatching still arms a single wait.
                    if let Some(sub) = h.get() {
                        sub.continue_delivery();
                        sub.continue_delivery();
                    }
                    Ok::<(), BoxError>(())
                }
            }),
        )
        .await
        .unwrap();
    let _ = handle.set(sub.clone());

    // Each dispatch re-arms the next; after "y" the wait is left pending.
    let running = tokio::spawn(async move { run_loop(&mut event_loop).await });
    for _ in 0..100 {
        if seen.lock().unwrap().len() == 2 && sub.state() == DeliveryState::Waiting {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(*seen.lock().unwrap(), vec!["x", "y"]);
    assert_eq!(sub.state(), DeliveryState::Waiting);

    sub.unsubscribe().await.unwrap();
    running.await.unwrap().unwrap();
    assert_eq!(sub.state(), DeliveryState::Terminated);
}

// =============================================================================
// delivery errors
// =============================================================================

#[tokio::test]
async fn broker_error_goes_to_error_listener() {
    let broker = MockBroker::start().await;
    let (runtime, mut event_loop, sink) = recording_runtime();
    let client = Stomp::new(runtime).connect(&broker.options()).await.unwrap();

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sub = client
        .subscribe(
            "/queue/doomed",
            collect_errors(&errors).listener(|_msg| async { Ok::<(), BoxError>(()) }),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    broker.fail_all("broker restarting");

    run_loop(&mut event_loop).await.unwrap();
    {
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].error.contains("broker restarting"), "{:?}", errors[0]);
    }
    assert_eq!(sink.count(Metric::ReadErrorCount), 1);
    assert_eq!(sub.state(), DeliveryState::Idle);

    // Resuming finds the channel closed and reports completion.
    assert!(sub.continue_delivery());
    run_loop(&mut event_loop).await.unwrap();
    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[1].error, "subscription completed");
    assert_eq!(sub.state(), DeliveryState::Terminated);
}

#[tokio::test]
async fn broker_error_without_error_listener_is_fatal() {
    let broker = MockBroker::start().await;
    let (runtime, mut event_loop, _sink) = recording_runtime();
    let client = Stomp::new(runtime).connect(&broker.options()).await.unwrap();
    let _sub = client
        .subscribe(
            "/queue/doomed",
            SubscribeOptions::new().listener(|_msg| async { Ok::<(), BoxError>(()) }),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    broker.fail_all("shutting down");

    match run_loop(&mut event_loop).await {
        Err(SessionError::Transport(ConnError::Server(e))) => {
            assert_eq!(e.message, "shutting down");
        }
        Err(other) => panic!("expected server error, got: {:?}", other),
        Ok(_) => panic!("expected the event loop to fail"),
    }
}

/// Fails on the body `bad`; unsubscribes on call number `stop_after`.
fn failing_on(bad: &'static str, handle: &Handle, stop_after: usize) -> impl TestListener {
    let handle = handle.clone();
    let count = Arc::new(AtomicUsize::new(0));
    move |msg: Message| {
        let handle = handle.clone();
        let count = count.clone();
        async move {
            let n = count.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= stop_after {
                if let Some(sub) = handle.get() {
                    sub.unsubscribe().await?;
                }
            }
            if msg.as_string() == bad {
                return Err::<(), BoxError>(format!("cannot handle {}", bad).into());
            }
            Ok(())
        }
        .boxed()
    }
}

#[tokio::test]
async fn listener_failure_continues_by_default() {
    let broker = MockBroker::start().await;
    let (runtime, mut event_loop, sink) = recording_runtime();
    let client = Stomp::new(runtime).connect(&broker.options()).await.unwrap();
    send_all(&client, "/queue/mixed", &["ok-1", "bad", "ok-2"]).await;

    let errors = Arc::new(Mutex::new(Vec::new()));
    let handle: Handle = Arc::default();
    let opts = collect_errors(&errors).listener(failing_on("bad", &handle, 3));
    let sub = client.subscribe("/queue/mixed", opts).await.unwrap();
    let _ = handle.set(sub);

    run_loop(&mut event_loop).await.unwrap();
    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error, "listener error: cannot handle bad");
    assert_eq!(sink.count(Metric::ReadCount), 2);
    assert_eq!(sink.count(Metric::ReadErrorCount), 1);
    assert_eq!(sink.count(Metric::ReadTiming), 3);
}

#[tokio::test]
async fn listener_failure_can_terminate_subscription() {
    let broker = MockBroker::start().await;
    let (runtime, mut event_loop, sink) = recording_runtime();
    let client = Stomp::new(runtime).connect(&broker.options()).await.unwrap();
    send_all(&client, "/queue/strict", &["bad", "never"]).await;

    let errors = Arc::new(Mutex::new(Vec::new()));
    let handle: Handle = Arc::default();
    let opts = collect_errors(&errors)
        .listener(failing_on("bad", &handle, usize::MAX))
        .on_listener_error(ListenerErrorPolicy::Terminate);
    let sub = client.subscribe("/queue/strict", opts).await.unwrap();

    run_loop(&mut event_loop).await.unwrap();
    assert_eq!(errors.lock().unwrap().len(), 1);
    assert_eq!(sink.count(Metric::ReadErrorCount), 1);
    assert_eq!(sink.count(Metric::ReadCount), 0);
    assert_eq!(sub.state(), DeliveryState::Terminated);
    assert!(!sub.is_active());
    broker.wait_for("UNSUBSCRIBE", 1).await;
}

#[tokio::test]
async fn abort_on_failure_cancels_session() {
    let broker = MockBroker::start().await;
    let (runtime, mut event_loop, _sink) = recording_runtime();
    let client = Stomp::new(runtime).connect(&broker.options()).await.unwrap();
    send_all(&client, "/queue/abort", &["bad"]).await;

    let errors = Arc::new(Mutex::new(Vec::new()));
    let handle: Handle = Arc::default();
    let opts = collect_errors(&errors)
        .listener(failing_on("bad", &handle, usize::MAX))
        .abort_on_failure(true);
    let sub = client.subscribe("/queue/abort", opts).await.unwrap();

    match run_loop(&mut event_loop).await {
        Err(SessionError::Listener(e)) => assert_eq!(e.to_string(), "cannot handle bad"),
        Err(other) => panic!("expected listener error, got: {:?}", other),
        Ok(_) => panic!("expected abort to be fatal"),
    }
    assert!(errors.lock().unwrap().is_empty());
    assert_eq!(sub.state(), DeliveryState::Terminated);
    assert!(!sub.continue_delivery());

    assert!(!client.is_connected());
    assert!(matches!(
        client.send("/queue/abort", "", "after", None).await,
        Err(SessionError::NotConnected)
    ));
    broker.wait_for("DISCONNECT", 1).await;
    client.disconnect().await.unwrap();
}
