//! Wires up a handler, a listener, and a streaming subscriber, then sends
//! a few events through each delivery discipline.

use std::time::Duration;

use futures::StreamExt;
use switchboard::{handler_fn, listener_fn, Context, EmitOptions, ObserveOptions};

#[tokio::main]
async fn main() -> Result<(), switchboard::Error> {
    tracing_subscriber::fmt::init();

    switchboard::register(
        "job",
        handler_fn(|_ctx, event, sink| async move {
            match event.event_type() {
                "job.status" => sink.ok("running"),
                _ => {
                    let step = *event.extract::<i64>().expect("i64 payload");
                    println!("worker: processing step {step}");
                    sink.done();
                }
            }
        }),
    );

    switchboard::listen(
        "job.*",
        listener_fn(|event| async move {
            println!("audit: {} ({})", event.event_type(), event.id());
        }),
    );

    switchboard::start()?;

    // A streaming subscriber, as a server-sent-events endpoint would use.
    let subscription = switchboard::subscribe_channel("job.*", ObserveOptions::default());
    let subscription_id = subscription.id().to_string();
    let watcher = tokio::spawn(async move {
        let mut stream = subscription.into_stream();
        while let Some(event) = stream.next().await {
            println!("stream: {}", event.event_type());
        }
        println!("stream: closed");
    });

    let ctx = Context::new().with_session_id("demo");

    // Serial work through a queue: steps run strictly in order.
    let queue = switchboard::queue_create("job")?;
    for step in 0..5i64 {
        switchboard::push_with(&ctx, "job.step", step, EmitOptions::default().queue(&queue))
            .await?;
    }
    switchboard::queue_release(&queue)?;

    // A synchronous status check rides the reserved worker tier.
    let (_, status) = switchboard::call(&ctx, "job.status", ()).await?;
    println!("status: {}", status.unwrap().extract::<&str>()?);

    tokio::time::sleep(Duration::from_millis(100)).await;
    switchboard::unsubscribe(&subscription_id);
    watcher.await.expect("watcher task");

    switchboard::stop(&ctx).await
}
