use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;

use crate::{matcher, sync::RwLock, Event, ObserveOptions};

/// A subscription whose channel was created by the bus, returned by
/// [`subscribe_channel`](crate::subscribe_channel).
///
/// Holds the receive half of the channel; events stop (and
/// [`recv`](Subscription::recv) returns `None`) once the subscription is
/// [unsubscribed](crate::unsubscribe) or the service stops.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    pub(crate) fn new(id: String, rx: mpsc::Receiver<Event>) -> Self {
        Self { id, rx }
    }

    /// The subscription id, for [`unsubscribe`](crate::unsubscribe).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Receives the next matching event, or `None` once detached.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Converts the subscription into a [`Stream`](futures::Stream) of
    /// events, e.g. to bridge into a server-sent-events response.
    pub fn into_stream(self) -> ReceiverStream<Event> {
        ReceiverStream::new(self.rx)
    }
}

/// Holds the dynamically attached subscribers.
///
/// A subscriber is a caller-owned channel: the caller keeps the receive
/// half, the bus holds the send half. Unsubscribing (or the global clear
/// during stop) drops the send half exactly once, so a consumer looping on
/// `recv()` unblocks cleanly. Subscriber lifetimes are unpredictable (a
/// streaming client can disconnect at any moment), so sends never block and
/// a send to a closed channel is silently discarded.
#[derive(Default)]
pub(crate) struct SubscriberManager {
    entries: RwLock<HashMap<String, Entry>>,
    seq: AtomicU64,
}

struct Entry {
    pattern: String,
    opts: ObserveOptions,
    tx: mpsc::Sender<Event>,
}

impl SubscriberManager {
    pub(crate) fn subscribe(
        &self,
        pattern: &str,
        tx: mpsc::Sender<Event>,
        opts: ObserveOptions,
    ) -> String {
        let id = format!("sub-{}", self.seq.fetch_add(1, Ordering::Relaxed));
        self.entries.write().insert(
            id.clone(),
            Entry {
                pattern: pattern.to_string(),
                opts,
                tx,
            },
        );
        tracing::debug!(subscription = %id, %pattern, "subscriber attached");
        id
    }

    /// Detaches a subscriber and closes its channel. Unknown ids are
    /// ignored, so calling twice is safe.
    pub(crate) fn unsubscribe(&self, id: &str) {
        if self.entries.write().remove(id).is_some() {
            tracing::debug!(subscription = %id, "subscriber detached");
        }
    }

    /// Offers `event` to every matching subscriber without blocking. A full
    /// or disconnected channel drops the event for that subscriber only.
    pub(crate) fn notify(&self, event: &Event) {
        let mut hung_up = Vec::new();
        {
            let entries = self.entries.read();
            for (id, entry) in entries.iter() {
                if !matcher::matches(&entry.pattern, event.event_type())
                    || !entry.opts.accepts(event)
                {
                    continue;
                }
                match entry.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(
                            subscription = %id,
                            event = %event.id(),
                            "subscriber channel full; dropping event"
                        );
                    }
                    // The subscriber hung up between the match and the
                    // send. Drop the event silently and prune the entry.
                    Err(TrySendError::Closed(_)) => hung_up.push(id.clone()),
                }
            }
        }
        if !hung_up.is_empty() {
            let mut entries = self.entries.write();
            for id in hung_up {
                entries.remove(&id);
            }
        }
    }

    /// Detaches every subscriber at once, closing all their channels.
    pub(crate) fn clear(&self) {
        let entries = std::mem::take(&mut *self.entries.write());
        if !entries.is_empty() {
            tracing::debug!(subscribers = entries.len(), "cleared all subscribers");
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.entries.read().len()
    }
}
