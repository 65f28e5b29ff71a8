// Stress suites, ignored by default. Run with:
//
//     cargo test --release --test throughput -- --ignored

mod support;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use switchboard::{handler_fn, Context, EmitOptions, HandlerOptions, Service};

#[tokio::test(flavor = "multi_thread")]
#[ignore]
async fn hundred_thousand_events_over_hundred_queues() {
    support::init_tracing();
    const QUEUES: usize = 100;
    const EVENTS_PER_QUEUE: usize = 1_000;

    let service = Service::new();
    let processed = Arc::new(AtomicUsize::new(0));
    {
        let processed = processed.clone();
        service.register_with(
            "load",
            handler_fn(move |_ctx, _event, sink| {
                let processed = processed.clone();
                async move {
                    processed.fetch_add(1, Ordering::SeqCst);
                    sink.done();
                }
            }),
            HandlerOptions::default().max_workers(256),
        );
    }
    service.start().unwrap();

    let started = Instant::now();
    let mut queues = Vec::with_capacity(QUEUES);
    for _ in 0..QUEUES {
        queues.push(service.queue_create("load").unwrap());
    }
    for queue in &queues {
        for i in 0..EVENTS_PER_QUEUE {
            service
                .push_with(
                    &Context::new(),
                    "load.tick",
                    i as i64,
                    EmitOptions::default().queue(queue),
                )
                .await
                .unwrap();
        }
    }
    for queue in &queues {
        service.queue_release(queue).unwrap();
    }

    assert!(
        support::eventually(Duration::from_secs(60), || {
            processed.load(Ordering::SeqCst) == QUEUES * EVENTS_PER_QUEUE
        })
        .await,
        "drained {} of {}",
        processed.load(Ordering::SeqCst),
        QUEUES * EVENTS_PER_QUEUE
    );
    eprintln!(
        "drained {} events in {:?}",
        QUEUES * EVENTS_PER_QUEUE,
        started.elapsed()
    );

    // Everything drained and unwound.
    assert_eq!(service.stats().live_queues, 0);
    service.stop(&Context::new()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore]
async fn direct_dispatch_throughput() {
    support::init_tracing();
    const EVENTS: usize = 100_000;

    let service = Service::new();
    let processed = Arc::new(AtomicUsize::new(0));
    {
        let processed = processed.clone();
        service.register(
            "fast",
            handler_fn(move |_ctx, _event, sink| {
                let processed = processed.clone();
                async move {
                    processed.fetch_add(1, Ordering::SeqCst);
                    sink.done();
                }
            }),
        );
    }
    service.start().unwrap();

    let started = Instant::now();
    for i in 0..EVENTS {
        service
            .push(&Context::new(), "fast.tick", i as i64)
            .await
            .unwrap();
    }
    service.stop(&Context::new()).await.unwrap();
    assert_eq!(processed.load(Ordering::SeqCst), EVENTS);
    eprintln!("pushed and drained {EVENTS} events in {:?}", started.elapsed());
}
