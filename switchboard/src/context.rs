use std::{fmt, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

/// Credential attached to a caller's [`Context`] and propagated to every
/// event assembled under it.
///
/// The bus never interprets this value; it only carries it from the emitting
/// side to handlers and observers so authorization decisions can be made
/// where the event is consumed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthorizedInfo {
    /// Authenticated principal, e.g. a user or service account id.
    pub subject: String,
    /// Tenant the principal was authenticated under, if any.
    pub tenant: Option<String>,
    /// Granted scopes.
    pub scopes: Vec<String>,
}

impl AuthorizedInfo {
    /// Creates an `AuthorizedInfo` for `subject` with no tenant or scopes.
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            tenant: None,
            scopes: Vec::new(),
        }
    }
}

/// Ambient caller context.
///
/// A `Context` carries two things across the bus: *values* (an optional
/// session id and an optional [`AuthorizedInfo`]) and a *cancellation
/// signal*. Values always flow from the caller to the handler: they are
/// copied onto every [`Event`](crate::Event) the bus assembles. Whether the
/// cancellation signal flows along depends on the delivery discipline:
/// `call` hands the handler the caller's own context so a deadline shortens
/// the handler's work, while an accepted `push` runs under a
/// [detached](Context::detached) view so a transient caller cancellation
/// cannot drop a fire-and-forget event that was already accepted.
///
/// Contexts are cheap to clone; clones share the same cancellation token.
#[derive(Clone, Default)]
pub struct Context {
    session_id: Option<Arc<str>>,
    authorized: Option<Arc<AuthorizedInfo>>,
    cancel: CancellationToken,
}

impl Context {
    /// Returns an empty, never-cancelled context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns this context with the session id set.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(Arc::from(session_id.into()));
        self
    }

    /// The session id carried by this context, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Returns this context with the authorization info set.
    pub fn with_authorized_info(mut self, info: AuthorizedInfo) -> Self {
        self.authorized = Some(Arc::new(info));
        self
    }

    /// The authorization info carried by this context, if any.
    pub fn authorized_info(&self) -> Option<&AuthorizedInfo> {
        self.authorized.as_deref()
    }

    /// Returns this context driven by the given cancellation token instead
    /// of its current one.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The cancellation token driving this context.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns a child context: same values, cancelled whenever this context
    /// is cancelled, but independently cancellable.
    pub fn child(&self) -> Self {
        Self {
            session_id: self.session_id.clone(),
            authorized: self.authorized.clone(),
            cancel: self.cancel.child_token(),
        }
    }

    /// Returns a child context that is additionally cancelled once `timeout`
    /// elapses.
    ///
    /// Must be called from within a tokio runtime, which arms the deadline
    /// timer.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let ctx = self.child();
        let deadline = ctx.cancel.clone();
        let parent = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => deadline.cancel(),
                _ = parent.cancelled() => {}
            }
        });
        ctx
    }

    /// Returns a view of this context that keeps its values but ignores
    /// cancellation entirely.
    ///
    /// This is how the bus protects accepted fire-and-forget events: the
    /// session id and authorization info still reach the handler, but the
    /// caller tearing down its own scope no longer cancels the work.
    pub fn detached(&self) -> Self {
        Self {
            session_id: self.session_id.clone(),
            authorized: self.authorized.clone(),
            cancel: CancellationToken::new(),
        }
    }

    /// Cancels this context and all contexts derived from it with
    /// [`child`](Context::child) or [`with_timeout`](Context::with_timeout).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns `true` if this context has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes when this context is cancelled. Never completes for a
    /// context that has no cancellation source.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub(crate) fn session_id_shared(&self) -> Option<Arc<str>> {
        self.session_id.clone()
    }

    pub(crate) fn authorized_shared(&self) -> Option<Arc<AuthorizedInfo>> {
        self.authorized.clone()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("session_id", &self.session_id)
            .field("authorized", &self.authorized)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
