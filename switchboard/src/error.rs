use thiserror::Error;

/// Errors surfaced through the bus's public entry points.
///
/// These are sentinels: callers match on the variant to decide what to do,
/// and the carried strings exist for display only. A rejection that happens
/// after an event id was minted is wrapped in
/// [`Dispatch`](Error::Dispatch), which keeps the id recoverable next to
/// the sentinel ([`event_id`](Error::event_id) / [`cause`](Error::cause)).
/// Everything that is *not* listed here (observer overflow, a disconnected
/// subscriber, a crashing listener) is logged and isolated rather than
/// reported.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    /// The service is not running (never started, or already stopped).
    #[error("event service is not started")]
    NotStarted,

    /// `start` was called twice without an intervening `stop`.
    #[error("event service is already started")]
    AlreadyStarted,

    /// No handler is registered for the event type's prefix.
    #[error("no handler registered for prefix `{0}`")]
    NoHandler(String),

    /// The queue's bounded buffer is at capacity. Never blocks the producer.
    #[error("queue `{0}` is full")]
    QueueFull(String),

    /// The queue id was never created.
    #[error("queue `{0}` not found")]
    QueueNotFound(String),

    /// The queue id existed and has since been released or aborted.
    #[error("queue `{0}` is released")]
    QueueReleased(String),

    /// `queue_create_named` was given an id already in use.
    #[error("queue `{0}` already exists")]
    QueueExists(String),

    /// The handler panicked while processing the event. Delivered through
    /// the reply sink, so only `call` observes it.
    #[error("handler panicked: {0}")]
    HandlerPanic(String),

    /// Worker admission failed before the event was accepted.
    #[error("no worker available: {0}")]
    WorkerUnavailable(String),

    /// A queue or worker pool rejected an event after its id had already
    /// been minted. Carries the id so the caller can still correlate the
    /// failed emission; the sentinel that caused the rejection is the
    /// source.
    #[error("event `{id}` was not dispatched: {source}")]
    Dispatch {
        /// The id assigned to the event before dispatch failed.
        id: String,
        /// The rejection itself.
        #[source]
        source: Box<Error>,
    },

    /// The caller's context was cancelled while waiting for a reply.
    #[error("call cancelled by caller context")]
    Cancelled,

    /// The handler finished without writing a reply to a `call`.
    #[error("handler finished without replying")]
    NoReply,

    /// A handler-level failure, written to the reply sink by the handler
    /// itself via [`ReplySink::fail`](crate::ReplySink::fail).
    #[error("handler error: {0}")]
    Handler(String),

    /// The event carries no payload.
    #[error("event has no payload")]
    NoPayload,

    /// The payload is not of the requested type.
    #[error("payload is not a `{expected}`")]
    PayloadType {
        /// Type name the caller asked for.
        expected: &'static str,
    },
}

impl Error {
    /// The id minted for the event whose emission failed, when dispatch
    /// got that far. `push` and `call` assign the id before dispatching,
    /// so a rejection after that point still identifies the event.
    pub fn event_id(&self) -> Option<&str> {
        match self {
            Error::Dispatch { id, .. } => Some(id),
            _ => None,
        }
    }

    /// The sentinel underlying a dispatch failure; any other error is
    /// returned as is.
    pub fn cause(&self) -> &Error {
        match self {
            Error::Dispatch { source, .. } => source.as_ref(),
            other => other,
        }
    }
}
