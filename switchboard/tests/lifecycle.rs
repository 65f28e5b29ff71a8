mod support;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use switchboard::{handler_fn, Context, Error, Event, Handler, ReplySink, Service};

/// A handler that records how often its shutdown hook ran.
struct TrackedHandler {
    invocations: Arc<AtomicUsize>,
    shutdowns: Arc<AtomicUsize>,
}

#[async_trait]
impl Handler for TrackedHandler {
    async fn handle(&self, _ctx: Context, _event: Event, sink: ReplySink) {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        sink.done();
    }

    async fn shutdown(&self, _ctx: Context) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn start_is_guarded_and_stop_is_idempotent() {
    support::init_tracing();
    let service = Service::new();
    service.register("x", handler_fn(|_ctx, _event, sink| async move { sink.done() }));

    assert!(!service.is_started());
    service.start().unwrap();
    assert!(service.is_started());
    assert_eq!(service.start().unwrap_err(), Error::AlreadyStarted);

    service.stop(&Context::new()).await.unwrap();
    assert!(!service.is_started());
    // Stopping a stopped service is a no-op.
    service.stop(&Context::new()).await.unwrap();

    // And the cycle can begin again.
    service.start().unwrap();
    service.stop(&Context::new()).await.unwrap();
}

#[tokio::test]
async fn reload_requires_a_running_service() {
    support::init_tracing();
    let service = Service::new();
    assert_eq!(service.reload().unwrap_err(), Error::NotStarted);
    service.start().unwrap();
    service.reload().unwrap();
    service.stop(&Context::new()).await.unwrap();
    assert_eq!(service.reload().unwrap_err(), Error::NotStarted);
}

#[tokio::test]
async fn stop_drains_in_flight_work_and_runs_hooks() {
    support::init_tracing();
    let service = Service::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    let shutdowns = Arc::new(AtomicUsize::new(0));
    service.register(
        "tracked",
        TrackedHandler {
            invocations: invocations.clone(),
            shutdowns: shutdowns.clone(),
        },
    );
    let slow_done = Arc::new(AtomicUsize::new(0));
    {
        let slow_done = slow_done.clone();
        service.register(
            "slow",
            handler_fn(move |_ctx, _event, sink| {
                let slow_done = slow_done.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    slow_done.fetch_add(1, Ordering::SeqCst);
                    sink.done();
                }
            }),
        );
    }
    service.start().unwrap();

    for _ in 0..4 {
        service.push(&Context::new(), "slow.job", ()).await.unwrap();
    }
    service.push(&Context::new(), "tracked.one", ()).await.unwrap();

    service.stop(&Context::new()).await.unwrap();

    // Stop blocked until the slow handlers finished, then ran the hooks.
    assert_eq!(slow_done.load(Ordering::SeqCst), 4);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);

    // The stopped service refuses new work.
    assert_eq!(
        service.push(&Context::new(), "slow.job", ()).await.unwrap_err(),
        Error::NotStarted
    );
}

#[tokio::test]
async fn stop_aborts_queues_before_draining() {
    support::init_tracing();
    let service = Service::new();
    let processed = Arc::new(AtomicUsize::new(0));
    {
        let processed = processed.clone();
        service.register(
            "q",
            handler_fn(move |_ctx, _event, sink| {
                let processed = processed.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    processed.fetch_add(1, Ordering::SeqCst);
                    sink.done();
                }
            }),
        );
    }
    service.start().unwrap();

    let queue = service.queue_create("q").unwrap();
    for _ in 0..10 {
        service
            .push_with(
                &Context::new(),
                "q.job",
                (),
                switchboard::EmitOptions::default().queue(&queue),
            )
            .await
            .unwrap();
    }

    service.stop(&Context::new()).await.unwrap();

    // Buffered items were discarded, not drained, and stop joined every
    // bus-owned task before returning.
    assert!(processed.load(Ordering::SeqCst) < 10);
    assert_eq!(service.stats().live_queues, 0);
    assert_eq!(service.stats().tasks, 0);
}

#[tokio::test]
async fn reset_wipes_every_registry() {
    support::init_tracing();
    let service = Service::new();
    service.register("x", handler_fn(|_ctx, _event, sink| async move { sink.done() }));
    service.listen("*", switchboard::listener_fn(|_event| async move {}));
    service.start().unwrap();
    service.queue_create("x").unwrap();
    let (tx, _rx) = tokio::sync::mpsc::channel(1);
    service.subscribe("*", tx);

    let stats = service.stats();
    assert!(stats.started);
    assert_eq!(stats.handlers, 1);
    assert_eq!(stats.live_queues, 1);
    assert_eq!(stats.listeners, 1);
    assert_eq!(stats.subscribers, 1);

    service.reset();
    let stats = service.stats();
    assert_eq!(
        stats,
        switchboard::Stats {
            started: false,
            handlers: 0,
            live_queues: 0,
            listeners: 0,
            subscribers: 0,
            tasks: 0,
        }
    );
}

#[tokio::test]
async fn handlers_can_reenter_the_service_during_stop() {
    support::init_tracing();
    // A handler that pushes back into the bus while stop is draining must
    // not deadlock; it observes NotStarted instead.
    let service = Arc::new(Service::new());
    let reentry = Arc::new(AtomicUsize::new(0));
    {
        let service = service.clone();
        let reentry = reentry.clone();
        service.clone().register(
            "loopy",
            handler_fn(move |_ctx, _event, sink| {
                let service = service.clone();
                let reentry = reentry.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    if service.push(&Context::new(), "loopy.again", ()).await
                        == Err(Error::NotStarted)
                    {
                        reentry.fetch_add(1, Ordering::SeqCst);
                    }
                    sink.done();
                }
            }),
        );
    }
    service.start().unwrap();
    service.push(&Context::new(), "loopy.first", ()).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), service.stop(&Context::new()))
        .await
        .expect("stop must not deadlock on re-entrant handlers")
        .unwrap();
    assert_eq!(reentry.load(Ordering::SeqCst), 1);
}
