use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};

use crate::{matcher, sync::RwLock, Context, Event, ObserveOptions};

/// A statically registered passive observer.
///
/// Listeners are registered before the service starts and receive every
/// matching event on a dedicated consumer task, decoupled from the emitter
/// by a bounded buffer. They are never part of the producer's critical
/// path: when a listener's buffer is full, events are dropped for that
/// listener only.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Observes one event.
    async fn on_event(&self, event: Event);

    /// Releases resources held by the listener. Runs once during service
    /// stop, after the listener's buffer has drained. The default does
    /// nothing.
    async fn shutdown(&self, ctx: Context) {
        let _ = ctx;
    }
}

/// Returns a [`Listener`] implemented by the given async closure.
pub fn listener_fn<F, Fut>(f: F) -> ListenerFn<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    ListenerFn(f)
}

/// A [`Listener`] wrapping an async closure. See [`listener_fn`].
pub struct ListenerFn<F>(F);

#[async_trait]
impl<F, Fut> Listener for ListenerFn<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_event(&self, event: Event) {
        (self.0)(event).await;
    }
}

/// Holds the static listener set and fans events out to their buffers.
#[derive(Default)]
pub(crate) struct ListenerManager {
    entries: RwLock<Vec<Entry>>,
    // Consumer tasks currently alive.
    consumers: Arc<AtomicUsize>,
}

struct Entry {
    pattern: String,
    opts: ObserveOptions,
    listener: Arc<dyn Listener>,
    // Present while the manager is started.
    feed: Option<Feed>,
}

struct Feed {
    tx: mpsc::Sender<Event>,
    consumer: JoinHandle<()>,
}

impl ListenerManager {
    pub(crate) fn register(
        &self,
        pattern: &str,
        listener: Arc<dyn Listener>,
        opts: ObserveOptions,
    ) {
        self.entries.write().push(Entry {
            pattern: pattern.to_string(),
            opts,
            listener,
            feed: None,
        });
    }

    /// Opens a buffer and spawns a consumer task for every registered
    /// listener that does not have one yet.
    pub(crate) fn start(&self) {
        let mut entries = self.entries.write();
        for entry in entries.iter_mut().filter(|e| e.feed.is_none()) {
            let (tx, rx) = mpsc::channel(entry.opts.effective_buffer_size());
            let consumers = self.consumers.clone();
            consumers.fetch_add(1, Ordering::AcqRel);
            let consumer = tokio::spawn({
                let listener = entry.listener.clone();
                async move {
                    consume(listener, rx).await;
                    consumers.fetch_sub(1, Ordering::AcqRel);
                }
            });
            entry.feed = Some(Feed { tx, consumer });
        }
    }

    /// Offers `event` to every matching listener without blocking. A full
    /// buffer drops the event for that listener only.
    pub(crate) fn notify(&self, event: &Event) {
        let entries = self.entries.read();
        for entry in entries.iter() {
            let Some(feed) = entry.feed.as_ref() else {
                continue;
            };
            if !matcher::matches(&entry.pattern, event.event_type()) || !entry.opts.accepts(event) {
                continue;
            }
            match feed.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        pattern = %entry.pattern,
                        event = %event.id(),
                        event_type = %event.event_type(),
                        "listener buffer full; dropping event"
                    );
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Closes every listener buffer, waits for the consumers to drain, and
    /// runs each listener's shutdown hook.
    pub(crate) async fn stop(&self, ctx: &Context) {
        let stopped: Vec<(Arc<dyn Listener>, Feed)> = {
            let mut entries = self.entries.write();
            entries
                .iter_mut()
                .filter_map(|entry| Some((entry.listener.clone(), entry.feed.take()?)))
                .collect()
        };
        // Close every buffer first so all consumers drain concurrently,
        // then join them and run the shutdown hooks.
        let mut draining = Vec::with_capacity(stopped.len());
        for (listener, Feed { tx, consumer }) in stopped {
            drop(tx);
            draining.push((listener, consumer));
        }
        for (listener, consumer) in draining {
            let _ = consumer.await;
            listener.shutdown(ctx.clone()).await;
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.entries.read().len()
    }

    pub(crate) fn task_count(&self) -> usize {
        self.consumers.load(Ordering::Acquire)
    }
}

/// Per-listener consumer: one misbehaving invocation cannot stop the task
/// or drop future events.
async fn consume(listener: Arc<dyn Listener>, mut rx: mpsc::Receiver<Event>) {
    while let Some(event) = rx.recv().await {
        let id = event.id().to_string();
        let invocation = AssertUnwindSafe(listener.on_event(event));
        if invocation.catch_unwind().await.is_err() {
            tracing::error!(event = %id, "recovered listener panic");
        }
    }
}
