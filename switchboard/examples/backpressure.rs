//! Shows the back-pressure policies: a full queue rejects its producer,
//! while a slow subscriber only ever loses its own events.

use std::time::Duration;

use switchboard::{handler_fn, Context, EmitOptions, Error, HandlerOptions};

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    switchboard::register_with(
        "ingest",
        handler_fn(|_ctx, _event, sink| async move {
            // Deliberately slow, so the queue backs up.
            tokio::time::sleep(Duration::from_millis(50)).await;
            sink.done();
        }),
        HandlerOptions::default().queue_size(4),
    );
    switchboard::start()?;

    let ctx = Context::new();
    let queue = switchboard::queue_create("ingest")?;

    // A subscriber that never reads: its channel fills, the bus drops
    // further events for it, and nothing below ever blocks.
    let (tx, _rx) = tokio::sync::mpsc::channel(1);
    switchboard::subscribe("ingest.*", tx);

    let mut accepted = 0;
    let mut rejected = 0;
    for i in 0..32i64 {
        match switchboard::push_with(&ctx, "ingest.sample", i, EmitOptions::default().queue(&queue))
            .await
        {
            Ok(_) => accepted += 1,
            Err(err) if matches!(err.cause(), Error::QueueFull(_)) => rejected += 1,
            Err(other) => return Err(other),
        }
    }
    println!("accepted {accepted}, rejected {rejected} (bounded queue, capacity 4)");

    switchboard::queue_abort(&queue)?;
    switchboard::stop(&ctx).await
}
