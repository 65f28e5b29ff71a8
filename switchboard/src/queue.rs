use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use futures::future::join_all;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};

use crate::{pool::WorkerPool, sync::Mutex, Context, Error, Event, ReplySink};

/// One accepted emission waiting in a queue.
pub(crate) struct QueuedItem {
    pub(crate) ctx: Context,
    pub(crate) event: Event,
    pub(crate) sink: ReplySink,
}

/// A named FIFO lane bound to one worker pool.
///
/// Lifecycle: open, then either released (no new enqueues, pending items
/// drain) or aborted (no new enqueues, pending items discarded), then
/// finished once the consumer exits. Both closing flags are sticky.
pub(crate) struct Queue {
    id: Arc<str>,
    // Present while the queue is open. Checking and sending happen under
    // this lock so a concurrent release cannot slip between them.
    sender: Mutex<Option<mpsc::Sender<QueuedItem>>>,
    aborted: AtomicBool,
}

impl Queue {
    fn new(id: &str, capacity: usize) -> (Arc<Self>, mpsc::Receiver<QueuedItem>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let queue = Arc::new(Self {
            id: Arc::from(id),
            sender: Mutex::new(Some(tx)),
            aborted: AtomicBool::new(false),
        });
        (queue, rx)
    }

    /// Places an item at the tail of the queue. Never blocks: a closed
    /// queue reports `QueueReleased` and a full buffer reports `QueueFull`.
    pub(crate) fn enqueue(&self, ctx: Context, event: Event, sink: ReplySink) -> Result<(), Error> {
        let guard = self.sender.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(Error::QueueReleased(self.id.to_string()));
        };
        match tx.try_send(QueuedItem { ctx, event, sink }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::QueueFull(self.id.to_string())),
            Err(TrySendError::Closed(_)) => Err(Error::QueueReleased(self.id.to_string())),
        }
    }

    /// Graceful close: stop accepting items, let the consumer drain.
    fn release(&self) {
        self.sender.lock().take();
    }

    /// Forceful close: stop accepting items, discard whatever is buffered.
    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        self.release();
    }
}

/// The per-queue consumer. Items are dispatched one at a time, and the next
/// item is not read until the previous invocation has returned; that is
/// what makes a queue serial.
async fn consume(queue: Arc<Queue>, pool: Arc<WorkerPool>, mut rx: mpsc::Receiver<QueuedItem>) {
    while let Some(item) = rx.recv().await {
        if queue.aborted.load(Ordering::Acquire) {
            tracing::debug!(queue = %queue.id, event = %item.event.id(), "discarding item from aborted queue");
            continue;
        }
        match pool.dispatch(item.ctx, item.event, item.sink.clone()).await {
            Ok(done) => {
                let _ = done.await;
            }
            Err(err) => {
                tracing::debug!(queue = %queue.id, %err, "queue dispatch failed");
                item.sink.send(Err(err));
            }
        }
    }
    tracing::debug!(queue = %queue.id, "queue consumer finished");
}

/// Owns every live queue and remembers the ids of dead ones, so lookups can
/// distinguish "never existed" from "existed and gone".
#[derive(Default)]
pub(crate) struct QueueManager {
    inner: Mutex<Registry>,
    seq: AtomicU64,
    // Consumer tasks currently alive, including ones still draining a
    // released queue that already left the live map.
    consumers: Arc<AtomicUsize>,
}

#[derive(Default)]
struct Registry {
    live: HashMap<String, QueueEntry>,
    released: HashSet<String>,
}

struct QueueEntry {
    queue: Arc<Queue>,
    consumer: JoinHandle<()>,
}

impl QueueManager {
    /// Creates a queue bound to `pool`, returning its id. A caller-chosen
    /// id collides with `QueueExists`; a generated id never collides.
    /// Re-creating a released id revives it as a fresh queue.
    pub(crate) fn create(
        &self,
        id: Option<&str>,
        pool: Arc<WorkerPool>,
        capacity: usize,
    ) -> Result<String, Error> {
        let mut registry = self.inner.lock();
        let id = match id {
            Some(id) => {
                if registry.live.contains_key(id) {
                    return Err(Error::QueueExists(id.to_string()));
                }
                id.to_string()
            }
            None => loop {
                let candidate = format!("queue-{}", self.seq.fetch_add(1, Ordering::Relaxed));
                if !registry.live.contains_key(&candidate) {
                    break candidate;
                }
            },
        };
        registry.released.remove(&id);

        let (queue, rx) = Queue::new(&id, capacity);
        let consumers = self.consumers.clone();
        consumers.fetch_add(1, Ordering::AcqRel);
        let consumer = tokio::spawn({
            let queue = queue.clone();
            async move {
                consume(queue, pool, rx).await;
                consumers.fetch_sub(1, Ordering::AcqRel);
            }
        });
        registry.live.insert(id.clone(), QueueEntry { queue, consumer });
        Ok(id)
    }

    pub(crate) fn get(&self, id: &str) -> Result<Arc<Queue>, Error> {
        let registry = self.inner.lock();
        if let Some(entry) = registry.live.get(id) {
            return Ok(entry.queue.clone());
        }
        if registry.released.contains(id) {
            return Err(Error::QueueReleased(id.to_string()));
        }
        Err(Error::QueueNotFound(id.to_string()))
    }

    /// Gracefully closes a queue: pending items drain before the consumer
    /// exits. Releasing an already-released id is a no-op.
    pub(crate) fn release(&self, id: &str) -> Result<(), Error> {
        if let Some(entry) = self.remove(id)? {
            entry.queue.release();
        }
        Ok(())
    }

    /// Forcefully closes a queue: pending items are discarded. Aborting an
    /// already-closed id is a no-op.
    pub(crate) fn abort(&self, id: &str) -> Result<(), Error> {
        if let Some(entry) = self.remove(id)? {
            entry.queue.abort();
        }
        Ok(())
    }

    // Moves the queue out of the live map into the released set before the
    // queue itself is signalled, so lookups racing a close see a consistent
    // picture.
    fn remove(&self, id: &str) -> Result<Option<QueueEntry>, Error> {
        let mut registry = self.inner.lock();
        match registry.live.remove(id) {
            Some(entry) => {
                registry.released.insert(id.to_string());
                Ok(Some(entry))
            }
            None if registry.released.contains(id) => Ok(None),
            None => Err(Error::QueueNotFound(id.to_string())),
        }
    }

    /// Aborts every live queue and waits for every consumer to exit. The
    /// stop-path hook: afterwards nothing is buffered anywhere.
    pub(crate) async fn abort_all(&self) {
        let entries: Vec<QueueEntry> = {
            let mut registry = self.inner.lock();
            let ids: Vec<String> = registry.live.keys().cloned().collect();
            registry.released.extend(ids);
            registry.live.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            entry.queue.abort();
        }
        let count = entries.len();
        join_all(entries.into_iter().map(|entry| entry.consumer)).await;
        if count > 0 {
            tracing::debug!(queues = count, "aborted all queues");
        }
    }

    pub(crate) fn live_count(&self) -> usize {
        self.inner.lock().live.len()
    }

    pub(crate) fn task_count(&self) -> usize {
        self.consumers.load(Ordering::Acquire)
    }
}
