use std::future::Future;

use async_trait::async_trait;

use crate::{Context, Event, ReplySink};

/// The capability a subsystem registers to process events for a prefix.
///
/// `handle` is invoked once per dispatched event, on a worker task from the
/// prefix's pool. For a `call` the handler writes its reply to `sink`; for a
/// `push` the sink silently discards whatever is written, so handlers do not
/// need to distinguish the two. `shutdown` runs once during service stop,
/// after all in-flight invocations have drained.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Processes one event.
    async fn handle(&self, ctx: Context, event: Event, sink: ReplySink);

    /// Releases resources held by the handler. The default does nothing.
    async fn shutdown(&self, ctx: Context) {
        let _ = ctx;
    }
}

/// Returns a [`Handler`] implemented by the given async closure.
///
/// The closure receives the dispatch context, the event, and the reply sink:
///
/// ```
/// let echo = switchboard::handler_fn(|_ctx, event, sink| async move {
///     if let Ok(text) = event.extract::<&str>() {
///         sink.ok(format!("echo:{text}"));
///     }
/// });
/// # let _ = echo;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Context, Event, ReplySink) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    HandlerFn(f)
}

/// A [`Handler`] wrapping an async closure. See [`handler_fn`].
pub struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Context, Event, ReplySink) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, ctx: Context, event: Event, sink: ReplySink) {
        (self.0)(ctx, event, sink).await;
    }
}
