use std::{
    any::Any,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::sync::mpsc;

use crate::{AuthorizedInfo, Context, Error};

/// Process-unique, monotonically increasing event ids. Zero-padded so the
/// string order matches the numeric order.
static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

fn next_event_id() -> String {
    format!("{:020}", NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed))
}

/// An opaque event payload.
///
/// Payloads are cheaply cloneable (reference-counted) type-erased values.
/// Handlers and observers recover the concrete type with
/// [`extract`](Payload::extract) or [`downcast_ref`](Payload::downcast_ref).
#[derive(Clone)]
pub struct Payload(Arc<dyn Any + Send + Sync>);

impl Payload {
    /// Wraps `value` as an opaque payload.
    pub fn new(value: impl Any + Send + Sync) -> Self {
        Self(Arc::new(value))
    }

    /// Returns a reference to the payload as `T`, or `None` if the payload
    /// is of a different type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    /// Returns a reference to the payload as `T`.
    ///
    /// Unlike [`downcast_ref`](Payload::downcast_ref) this reports a type
    /// mismatch as a typed error, so a handler handed a bad upstream payload
    /// can fail its caller cleanly instead of panicking.
    pub fn extract<T: Any>(&self) -> Result<&T, Error> {
        self.0.downcast_ref().ok_or(Error::PayloadType {
            expected: std::any::type_name::<T>(),
        })
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The concrete type is erased; there is nothing more useful to show.
        f.write_str("Payload(..)")
    }
}

/// The unit of dispatch.
///
/// Events are assembled by the bus: callers supply the type and payload,
/// and the bus mints the id and extracts the ambient session id and
/// authorization info from the caller's [`Context`]. Clones share the
/// underlying payload.
#[derive(Clone)]
pub struct Event {
    event_type: Arc<str>,
    id: Arc<str>,
    queue: Option<Arc<str>>,
    is_call: bool,
    payload: Option<Payload>,
    session_id: Option<Arc<str>>,
    authorized: Option<Arc<AuthorizedInfo>>,
}

impl Event {
    pub(crate) fn assemble(
        event_type: &str,
        queue: Option<&str>,
        is_call: bool,
        payload: Option<Payload>,
        ctx: &Context,
    ) -> Self {
        Self {
            event_type: Arc::from(event_type),
            id: Arc::from(next_event_id()),
            queue: queue.map(Arc::from),
            is_call,
            payload,
            session_id: ctx.session_id_shared(),
            authorized: ctx.authorized_shared(),
        }
    }

    /// The event type, e.g. `"job.progress"`.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The bus-assigned id. Monotonically increasing and unique within the
    /// process.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The queue this event was routed through, if any.
    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    /// `true` if the emitter is waiting for a reply.
    pub fn is_call(&self) -> bool {
        self.is_call
    }

    /// The opaque payload, if any.
    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    /// Extracts the payload as `T`.
    ///
    /// Fails with [`Error::NoPayload`] when the event carries none, and
    /// [`Error::PayloadType`] when it is of a different type.
    pub fn extract<T: Any>(&self) -> Result<&T, Error> {
        self.payload.as_ref().ok_or(Error::NoPayload)?.extract()
    }

    /// The session id carried over from the emitter's context, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// The authorization info carried over from the emitter's context, if
    /// any.
    pub fn authorized_info(&self) -> Option<&AuthorizedInfo> {
        self.authorized.as_deref()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("type", &self.event_type)
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("is_call", &self.is_call)
            .field("payload", &self.payload.as_ref().map(|_| ".."))
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// The response to a `call`: optional data, or an error.
pub type Reply = Result<Option<Payload>, Error>;

/// Where a handler writes its reply.
///
/// The sink is a one-slot, non-blocking channel: the first write wins and
/// later writes are dropped. For fire-and-forget dispatch the sink discards
/// everything, so a handler can reply unconditionally without caring how it
/// was invoked.
#[derive(Clone, Debug)]
pub struct ReplySink {
    tx: mpsc::Sender<Reply>,
}

impl ReplySink {
    /// Creates a connected sink/receiver pair for a `call`.
    pub(crate) fn pair() -> (Self, mpsc::Receiver<Reply>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Creates a sink that drops every reply.
    pub(crate) fn discard() -> Self {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        Self { tx }
    }

    /// Writes a raw reply. Never blocks; a full or disconnected sink drops
    /// the reply.
    pub fn send(&self, reply: Reply) {
        let _ = self.tx.try_send(reply);
    }

    /// Replies with `data`.
    pub fn ok(&self, data: impl Any + Send + Sync) {
        self.send(Ok(Some(Payload::new(data))));
    }

    /// Replies with no data.
    pub fn done(&self) {
        self.send(Ok(None));
    }

    /// Replies with an error.
    pub fn err(&self, err: Error) {
        self.send(Err(err));
    }

    /// Replies with a handler-level failure message.
    pub fn fail(&self, message: impl Into<String>) {
        self.send(Err(Error::Handler(message.into())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_increase() {
        let ctx = Context::new();
        let a = Event::assemble("t.a", None, false, None, &ctx);
        let b = Event::assemble("t.b", None, false, None, &ctx);
        assert!(b.id() > a.id());
        assert!(!a.id().is_empty());
    }

    #[test]
    fn ambient_values_copied() {
        let ctx = Context::new()
            .with_session_id("s9")
            .with_authorized_info(AuthorizedInfo::new("svc"));
        let ev = Event::assemble("t.a", Some("q1"), true, None, &ctx);
        assert_eq!(ev.session_id(), Some("s9"));
        assert_eq!(ev.authorized_info().unwrap().subject, "svc");
        assert_eq!(ev.queue(), Some("q1"));
        assert!(ev.is_call());
    }

    #[test]
    fn extraction_failure_modes() {
        let ctx = Context::new();
        let none = Event::assemble("t.a", None, false, None, &ctx);
        assert_eq!(none.extract::<u32>(), Err(Error::NoPayload));

        let ev = Event::assemble("t.a", None, false, Some(Payload::new(7u32)), &ctx);
        assert_eq!(ev.extract::<u32>(), Ok(&7));
        assert!(matches!(
            ev.extract::<String>(),
            Err(Error::PayloadType { .. })
        ));
    }

    #[tokio::test]
    async fn sink_first_write_wins() {
        let (sink, mut rx) = ReplySink::pair();
        sink.ok("first");
        sink.ok("second");
        let reply = rx.recv().await.unwrap().unwrap().unwrap();
        assert_eq!(reply.extract::<&str>().unwrap(), &"first");
    }

    #[test]
    fn discard_sink_never_blocks() {
        let sink = ReplySink::discard();
        for _ in 0..64 {
            sink.done();
        }
    }
}
