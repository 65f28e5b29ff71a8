#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex, Once},
    time::Duration,
};

use switchboard::{handler_fn, Handler};

/// Installs a fmt subscriber once per test binary, honoring `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A handler that appends every `i64` payload it sees to a shared log, in
/// invocation order.
pub fn recording_handler(log: Arc<Mutex<Vec<i64>>>) -> impl Handler {
    handler_fn(move |_ctx, event, sink| {
        let log = log.clone();
        async move {
            let value = *event.extract::<i64>().expect("i64 payload");
            log.lock().unwrap().push(value);
            sink.done();
        }
    })
}

/// Polls `condition` until it holds or the deadline passes.
pub async fn eventually(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
