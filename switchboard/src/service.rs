use std::{any::Any, collections::HashMap, sync::Arc, sync::OnceLock};

use tokio::sync::mpsc;

use crate::{
    listener::ListenerManager,
    matcher,
    pool::WorkerPool,
    queue::QueueManager,
    subscriber::{SubscriberManager, Subscription},
    sync::RwLock,
    Context, EmitOptions, Error, Event, Handler, HandlerOptions, Listener, ObserveOptions,
    Payload, ReplySink,
};

/// A snapshot of the service's registries, for observability and leak
/// checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Whether the service is currently started.
    pub started: bool,
    /// Registered handler prefixes.
    pub handlers: usize,
    /// Queues that are open or draining.
    pub live_queues: usize,
    /// Registered listeners.
    pub listeners: usize,
    /// Attached subscribers.
    pub subscribers: usize,
    /// Bus-owned tasks currently alive: queue consumers (including ones
    /// still draining a released queue), listener consumers, and in-flight
    /// handler invocations.
    pub tasks: usize,
}

struct Registration {
    handler: Arc<dyn Handler>,
    opts: HandlerOptions,
}

struct Inner {
    started: bool,
    registrations: HashMap<String, Registration>,
    pools: HashMap<String, Arc<WorkerPool>>,
    queues: Arc<QueueManager>,
    listeners: Arc<ListenerManager>,
    subscribers: Arc<SubscriberManager>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            started: false,
            registrations: HashMap::new(),
            pools: HashMap::new(),
            queues: Arc::new(QueueManager::default()),
            listeners: Arc::new(ListenerManager::default()),
            subscribers: Arc::new(SubscriberManager::default()),
        }
    }
}

// What an emission needs once routing succeeds. Snapshotted under the read
// lock so no lock is held during fan-out or dispatch.
struct Routed {
    pool: Arc<WorkerPool>,
    queues: Arc<QueueManager>,
    listeners: Arc<ListenerManager>,
    subscribers: Arc<SubscriberManager>,
}

/// The event service: registries, lifecycle, and the dispatch facade.
///
/// Most programs use the process-wide instance through the crate's
/// top-level functions ([`register`], [`start`], [`push`], ...); `Service`
/// is also directly constructible so tests can run isolated instances.
///
/// The service lock is held exclusively only by lifecycle operations
/// (register/start/stop/reset). The fast paths (`push`, `call`, queue and
/// subscriber operations) take a read lock just long enough to snapshot
/// the routing state, and never across a suspension point.
#[derive(Default)]
pub struct Service {
    inner: RwLock<Inner>,
}

impl Service {
    /// Creates an empty, stopped service.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide service instance.
    pub fn global() -> &'static Service {
        static GLOBAL: OnceLock<Service> = OnceLock::new();
        GLOBAL.get_or_init(Service::new)
    }

    /// Registers `handler` for `prefix` with default options.
    pub fn register(&self, prefix: impl Into<String>, handler: impl Handler) {
        self.register_with(prefix, handler, HandlerOptions::default());
    }

    /// Registers `handler` for `prefix`.
    ///
    /// Registering the same prefix again overwrites the previous entry
    /// silently. Registration is meant to happen before [`start`]; a
    /// registration made afterwards is stored but has no effect until the
    /// service is started again.
    pub fn register_with(
        &self,
        prefix: impl Into<String>,
        handler: impl Handler,
        opts: HandlerOptions,
    ) {
        let prefix = prefix.into();
        let mut inner = self.inner.write();
        if inner.started {
            tracing::warn!(%prefix, "registration while started takes effect at the next start");
        }
        inner.registrations.insert(
            prefix,
            Registration {
                handler: Arc::new(handler),
                opts,
            },
        );
    }

    /// Registers a static listener for events matching `pattern`, with
    /// default options.
    pub fn listen(&self, pattern: &str, listener: impl Listener) {
        self.listen_with(pattern, listener, ObserveOptions::default());
    }

    /// Registers a static listener for events matching `pattern`.
    ///
    /// Like handler registration, listeners are meant to be registered
    /// before [`start`], which spawns their consumer tasks.
    pub fn listen_with(&self, pattern: &str, listener: impl Listener, opts: ObserveOptions) {
        let inner = self.inner.read();
        inner.listeners.register(pattern, Arc::new(listener), opts);
    }

    /// Attaches `sender` as a dynamic subscriber for events matching
    /// `pattern`, returning the subscription id. Safe at any time.
    pub fn subscribe(&self, pattern: &str, sender: mpsc::Sender<Event>) -> String {
        self.subscribe_with(pattern, sender, ObserveOptions::default())
    }

    /// Attaches `sender` as a dynamic subscriber for events matching
    /// `pattern`. The `buffer_size` option is ignored here: the channel,
    /// and therefore its capacity, belongs to the caller.
    pub fn subscribe_with(
        &self,
        pattern: &str,
        sender: mpsc::Sender<Event>,
        opts: ObserveOptions,
    ) -> String {
        self.inner.read().subscribers.subscribe(pattern, sender, opts)
    }

    /// Creates a channel owned by the bus and subscribes its send half,
    /// returning the receive half bundled with the subscription id. The
    /// `buffer_size` option sets the channel capacity.
    pub fn subscribe_channel(&self, pattern: &str, opts: ObserveOptions) -> Subscription {
        let (tx, rx) = mpsc::channel(opts.effective_buffer_size());
        let id = self.subscribe_with(pattern, tx, opts);
        Subscription::new(id, rx)
    }

    /// Detaches a subscriber and closes its channel, unblocking a consumer
    /// looping on the receive half. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: &str) {
        self.inner.read().subscribers.unsubscribe(id);
    }

    /// Starts the service: builds a worker pool per registration and spawns
    /// the listener consumer tasks. Must be called from within a tokio
    /// runtime.
    pub fn start(&self) -> Result<(), Error> {
        let listeners = {
            let mut inner = self.inner.write();
            if inner.started {
                return Err(Error::AlreadyStarted);
            }
            inner.pools = inner
                .registrations
                .iter()
                .map(|(prefix, registration)| {
                    let pool =
                        WorkerPool::new(prefix, registration.handler.clone(), &registration.opts);
                    (prefix.clone(), Arc::new(pool))
                })
                .collect();
            inner.started = true;
            inner.listeners.clone()
        };
        listeners.start();
        tracing::debug!("event service started");
        Ok(())
    }

    /// Stops the service. Idempotent.
    ///
    /// New `push`/`call`/`queue_create` calls fail with
    /// [`Error::NotStarted`] as soon as stopping begins; then every queue is
    /// aborted, every pool drains its in-flight invocations, handler and
    /// listener shutdown hooks run (given `ctx`), and all subscribers are
    /// cleared.
    pub async fn stop(&self, ctx: &Context) -> Result<(), Error> {
        // Snapshot under the write lock, then release it: in-flight
        // handlers may re-enter the service and would deadlock against a
        // held lock.
        let (queues, pools, handlers, listeners, subscribers) = {
            let mut inner = self.inner.write();
            if !inner.started {
                return Ok(());
            }
            inner.started = false;
            (
                inner.queues.clone(),
                std::mem::take(&mut inner.pools),
                inner
                    .registrations
                    .values()
                    .map(|registration| registration.handler.clone())
                    .collect::<Vec<_>>(),
                inner.listeners.clone(),
                inner.subscribers.clone(),
            )
        };

        queues.abort_all().await;
        for pool in pools.values() {
            pool.wait().await;
        }
        for handler in handlers {
            handler.shutdown(ctx.clone()).await;
        }
        listeners.stop(ctx).await;
        subscribers.clear();
        tracing::debug!("event service stopped");
        Ok(())
    }

    /// Hot-reload hook. Currently nothing is reloadable; fails with
    /// [`Error::NotStarted`] when the service is stopped and otherwise does
    /// nothing.
    pub fn reload(&self) -> Result<(), Error> {
        if !self.inner.read().started {
            return Err(Error::NotStarted);
        }
        Ok(())
    }

    /// Discards all registrations, queues, listeners, and subscribers
    /// without draining anything. Test harness use only.
    pub fn reset(&self) {
        *self.inner.write() = Inner::default();
    }

    /// Whether the service is currently started.
    pub fn is_started(&self) -> bool {
        self.inner.read().started
    }

    /// Counts of the live registry entries and bus-owned tasks. The task
    /// count is what leak checks compare against their baseline.
    pub fn stats(&self) -> Stats {
        let inner = self.inner.read();
        let tasks = inner.queues.task_count()
            + inner.listeners.task_count()
            + inner
                .pools
                .values()
                .map(|pool| pool.outstanding_count())
                .sum::<usize>();
        Stats {
            started: inner.started,
            handlers: inner.registrations.len(),
            live_queues: inner.queues.live_count(),
            listeners: inner.listeners.count(),
            subscribers: inner.subscribers.count(),
            tasks,
        }
    }

    /// Emits a fire-and-forget event with default options. See
    /// [`push_with`].
    pub async fn push(
        &self,
        ctx: &Context,
        event_type: &str,
        payload: impl Any + Send + Sync,
    ) -> Result<String, Error> {
        self.push_with(ctx, event_type, payload, EmitOptions::default())
            .await
    }

    /// Emits a fire-and-forget event, returning its id.
    ///
    /// The event is offered to listeners and subscribers first, then
    /// dispatched: directly through the prefix's worker pool, or via the
    /// queue named in `opts`. Once accepted, the event runs under a context
    /// detached from the caller's cancellation, so tearing down the calling
    /// scope cannot drop it.
    ///
    /// The id is minted before dispatch, so a rejection at that stage
    /// returns [`Error::Dispatch`] carrying the assembled id next to the
    /// rejection itself.
    pub async fn push_with(
        &self,
        ctx: &Context,
        event_type: &str,
        payload: impl Any + Send + Sync,
        opts: EmitOptions,
    ) -> Result<String, Error> {
        let routed = self.route(event_type)?;
        let event = Event::assemble(
            event_type,
            opts.queue.as_deref(),
            false,
            Some(Payload::new(payload)),
            ctx,
        );
        let id = event.id().to_string();
        routed.listeners.notify(&event);
        routed.subscribers.notify(&event);

        let accepted = match opts.queue.as_deref() {
            Some(queue_id) => routed
                .queues
                .get(queue_id)
                .and_then(|queue| queue.enqueue(ctx.detached(), event, ReplySink::discard())),
            None => routed
                .pool
                .dispatch(ctx.detached(), event, ReplySink::discard())
                .await
                .map(drop),
        };
        match accepted {
            Ok(()) => Ok(id),
            Err(err) => {
                tracing::debug!(event = %id, %err, "push not accepted");
                Err(Error::Dispatch {
                    id,
                    source: Box::new(err),
                })
            }
        }
    }

    /// Emits a request-response event with default options. See
    /// [`call_with`].
    pub async fn call(
        &self,
        ctx: &Context,
        event_type: &str,
        payload: impl Any + Send + Sync,
    ) -> Result<(String, Option<Payload>), Error> {
        self.call_with(ctx, event_type, payload, EmitOptions::default())
            .await
    }

    /// Emits an event and waits for the handler's reply, returning the
    /// event id and the reply data.
    ///
    /// The handler runs under the caller's own context, so a deadline or
    /// cancellation on `ctx` is visible to it; cancellation while waiting
    /// fails the call with [`Error::Cancelled`] (the handler still runs to
    /// completion). As with [`push_with`](Service::push_with), a dispatch
    /// or enqueue rejection returns [`Error::Dispatch`] carrying the
    /// already-minted event id.
    pub async fn call_with(
        &self,
        ctx: &Context,
        event_type: &str,
        payload: impl Any + Send + Sync,
        opts: EmitOptions,
    ) -> Result<(String, Option<Payload>), Error> {
        let routed = self.route(event_type)?;
        let event = Event::assemble(
            event_type,
            opts.queue.as_deref(),
            true,
            Some(Payload::new(payload)),
            ctx,
        );
        let id = event.id().to_string();
        routed.listeners.notify(&event);
        routed.subscribers.notify(&event);

        let (sink, mut reply_rx) = ReplySink::pair();
        let accepted = match opts.queue.as_deref() {
            Some(queue_id) => routed
                .queues
                .get(queue_id)
                .and_then(|queue| queue.enqueue(ctx.clone(), event, sink)),
            None => routed.pool.dispatch(ctx.clone(), event, sink).await.map(drop),
        };
        if let Err(err) = accepted {
            tracing::debug!(event = %id, %err, "call not accepted");
            return Err(Error::Dispatch {
                id,
                source: Box::new(err),
            });
        }

        tokio::select! {
            reply = reply_rx.recv() => match reply {
                Some(Ok(data)) => Ok((id, data)),
                Some(Err(err)) => Err(err),
                None => Err(Error::NoReply),
            },
            _ = ctx.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Creates a queue bound to `prefix` with a generated id.
    pub fn queue_create(&self, prefix: &str) -> Result<String, Error> {
        self.queue_create_inner(prefix, None)
    }

    /// Creates a queue bound to `prefix` with a caller-chosen id. Fails
    /// with [`Error::QueueExists`] if the id is already in use.
    pub fn queue_create_named(&self, prefix: &str, id: &str) -> Result<String, Error> {
        self.queue_create_inner(prefix, Some(id))
    }

    fn queue_create_inner(&self, prefix: &str, id: Option<&str>) -> Result<String, Error> {
        let (queues, pool, capacity) = {
            let inner = self.inner.read();
            if !inner.started {
                return Err(Error::NotStarted);
            }
            let registration = inner
                .registrations
                .get(prefix)
                .ok_or_else(|| Error::NoHandler(prefix.to_string()))?;
            let pool = inner
                .pools
                .get(prefix)
                .cloned()
                .ok_or_else(|| Error::NoHandler(prefix.to_string()))?;
            (inner.queues.clone(), pool, registration.opts.queue_size)
        };
        queues.create(id, pool, capacity)
    }

    /// Gracefully closes a queue: no new items are accepted, pending items
    /// drain. Closing an already-closed queue is a no-op.
    pub fn queue_release(&self, id: &str) -> Result<(), Error> {
        self.inner.read().queues.release(id)
    }

    /// Forcefully closes a queue: no new items are accepted, pending items
    /// are discarded. Closing an already-closed queue is a no-op.
    pub fn queue_abort(&self, id: &str) -> Result<(), Error> {
        self.inner.read().queues.abort(id)
    }

    fn route(&self, event_type: &str) -> Result<Routed, Error> {
        let inner = self.inner.read();
        if !inner.started {
            return Err(Error::NotStarted);
        }
        let prefix = matcher::prefix_of(event_type);
        let pool = inner
            .pools
            .get(prefix)
            .cloned()
            .ok_or_else(|| Error::NoHandler(prefix.to_string()))?;
        Ok(Routed {
            pool,
            queues: inner.queues.clone(),
            listeners: inner.listeners.clone(),
            subscribers: inner.subscribers.clone(),
        })
    }
}

// Process-wide convenience functions delegating to `Service::global()`.

/// Registers `handler` for `prefix` on the global service. See
/// [`Service::register`].
pub fn register(prefix: impl Into<String>, handler: impl Handler) {
    Service::global().register(prefix, handler);
}

/// Registers `handler` for `prefix` on the global service with options.
/// See [`Service::register_with`].
pub fn register_with(prefix: impl Into<String>, handler: impl Handler, opts: HandlerOptions) {
    Service::global().register_with(prefix, handler, opts);
}

/// Registers a listener on the global service. See [`Service::listen`].
pub fn listen(pattern: &str, listener: impl Listener) {
    Service::global().listen(pattern, listener);
}

/// Registers a listener on the global service with options. See
/// [`Service::listen_with`].
pub fn listen_with(pattern: &str, listener: impl Listener, opts: ObserveOptions) {
    Service::global().listen_with(pattern, listener, opts);
}

/// Attaches a subscriber to the global service. See [`Service::subscribe`].
pub fn subscribe(pattern: &str, sender: mpsc::Sender<Event>) -> String {
    Service::global().subscribe(pattern, sender)
}

/// Attaches a subscriber to the global service with options. See
/// [`Service::subscribe_with`].
pub fn subscribe_with(pattern: &str, sender: mpsc::Sender<Event>, opts: ObserveOptions) -> String {
    Service::global().subscribe_with(pattern, sender, opts)
}

/// Subscribes with a bus-owned channel on the global service. See
/// [`Service::subscribe_channel`].
pub fn subscribe_channel(pattern: &str, opts: ObserveOptions) -> Subscription {
    Service::global().subscribe_channel(pattern, opts)
}

/// Detaches a subscriber from the global service. See
/// [`Service::unsubscribe`].
pub fn unsubscribe(id: &str) {
    Service::global().unsubscribe(id);
}

/// Starts the global service. See [`Service::start`].
pub fn start() -> Result<(), Error> {
    Service::global().start()
}

/// Stops the global service. See [`Service::stop`].
pub async fn stop(ctx: &Context) -> Result<(), Error> {
    Service::global().stop(ctx).await
}

/// Reloads the global service. See [`Service::reload`].
pub fn reload() -> Result<(), Error> {
    Service::global().reload()
}

/// Resets the global service. Test harness use only. See
/// [`Service::reset`].
pub fn reset() {
    Service::global().reset();
}

/// Whether the global service is started.
pub fn is_started() -> bool {
    Service::global().is_started()
}

/// Registry counts of the global service. See [`Service::stats`].
pub fn stats() -> Stats {
    Service::global().stats()
}

/// Emits a fire-and-forget event on the global service. See
/// [`Service::push`].
pub async fn push(
    ctx: &Context,
    event_type: &str,
    payload: impl Any + Send + Sync,
) -> Result<String, Error> {
    Service::global().push(ctx, event_type, payload).await
}

/// Emits a fire-and-forget event on the global service with options. See
/// [`Service::push_with`].
pub async fn push_with(
    ctx: &Context,
    event_type: &str,
    payload: impl Any + Send + Sync,
    opts: EmitOptions,
) -> Result<String, Error> {
    Service::global().push_with(ctx, event_type, payload, opts).await
}

/// Emits a request-response event on the global service. See
/// [`Service::call`].
pub async fn call(
    ctx: &Context,
    event_type: &str,
    payload: impl Any + Send + Sync,
) -> Result<(String, Option<Payload>), Error> {
    Service::global().call(ctx, event_type, payload).await
}

/// Emits a request-response event on the global service with options. See
/// [`Service::call_with`].
pub async fn call_with(
    ctx: &Context,
    event_type: &str,
    payload: impl Any + Send + Sync,
    opts: EmitOptions,
) -> Result<(String, Option<Payload>), Error> {
    Service::global().call_with(ctx, event_type, payload, opts).await
}

/// Creates a queue on the global service with a generated id. See
/// [`Service::queue_create`].
pub fn queue_create(prefix: &str) -> Result<String, Error> {
    Service::global().queue_create(prefix)
}

/// Creates a queue on the global service with a caller-chosen id. See
/// [`Service::queue_create_named`].
pub fn queue_create_named(prefix: &str, id: &str) -> Result<String, Error> {
    Service::global().queue_create_named(prefix, id)
}

/// Gracefully closes a queue on the global service. See
/// [`Service::queue_release`].
pub fn queue_release(id: &str) -> Result<(), Error> {
    Service::global().queue_release(id)
}

/// Forcefully closes a queue on the global service. See
/// [`Service::queue_abort`].
pub fn queue_abort(id: &str) -> Result<(), Error> {
    Service::global().queue_abort(id)
}
