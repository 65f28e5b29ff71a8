use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use futures::FutureExt;
use tokio::{
    sync::{Notify, OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
};

use crate::{Context, Error, Event, Handler, HandlerOptions, ReplySink};

/// Bounded execution fabric for one registered prefix.
///
/// Admission is two-tiered: a `push` must take a token from both the `push`
/// and `total` counters, while a `call` takes only `total`. Since the `push`
/// counter's capacity is `max_workers - reserved_workers`, the reserved
/// slots stay reachable by calls even when push traffic has saturated the
/// pool.
pub(crate) struct WorkerPool {
    prefix: Arc<str>,
    handler: Arc<dyn Handler>,
    total: Arc<Semaphore>,
    push: Arc<Semaphore>,
    outstanding: Arc<Outstanding>,
}

impl WorkerPool {
    pub(crate) fn new(prefix: &str, handler: Arc<dyn Handler>, opts: &HandlerOptions) -> Self {
        let max_workers = opts.max_workers.max(1);
        let push_workers = max_workers.saturating_sub(opts.reserved_workers).max(1);
        Self {
            prefix: Arc::from(prefix),
            handler,
            total: Arc::new(Semaphore::new(max_workers)),
            push: Arc::new(Semaphore::new(push_workers)),
            outstanding: Arc::new(Outstanding::default()),
        }
    }

    /// Schedules one handler invocation, returning a handle that completes
    /// when the invocation returns.
    ///
    /// Waits for admission; `ctx` cancellation during the wait aborts it
    /// with [`Error::WorkerUnavailable`]. If the second acquire of a push
    /// dispatch fails, the first token is returned.
    pub(crate) async fn dispatch(
        &self,
        ctx: Context,
        event: Event,
        sink: ReplySink,
    ) -> Result<JoinHandle<()>, Error> {
        let push_permit = if event.is_call() {
            None
        } else {
            Some(self.acquire(&self.push, &ctx).await?)
        };
        // An error here drops `push_permit`, handing the token back.
        let total_permit = self.acquire(&self.total, &ctx).await?;

        self.outstanding.enter();
        let outstanding = self.outstanding.clone();
        let handler = self.handler.clone();
        let prefix = self.prefix.clone();
        let handle = tokio::spawn(async move {
            let _permits = (total_permit, push_permit);
            let invocation = AssertUnwindSafe(handler.handle(ctx, event, sink.clone()));
            if let Err(panic) = invocation.catch_unwind().await {
                let message = panic_message(panic.as_ref());
                tracing::error!(%prefix, %message, "recovered handler panic");
                sink.send(Err(Error::HandlerPanic(message)));
            }
            outstanding.exit();
        });
        Ok(handle)
    }

    /// Blocks until every outstanding invocation has completed.
    pub(crate) async fn wait(&self) {
        self.outstanding.drained().await;
    }

    /// Invocation tasks currently running.
    pub(crate) fn outstanding_count(&self) -> usize {
        self.outstanding.count.load(Ordering::Acquire)
    }

    async fn acquire(
        &self,
        sem: &Arc<Semaphore>,
        ctx: &Context,
    ) -> Result<OwnedSemaphorePermit, Error> {
        tokio::select! {
            permit = Arc::clone(sem).acquire_owned() => {
                permit.map_err(|_| Error::WorkerUnavailable("worker pool is closed".into()))
            }
            _ = ctx.cancelled() => {
                Err(Error::WorkerUnavailable("caller context cancelled".into()))
            }
        }
    }
}

/// Count of invocations currently running, with a `Notify` for drain waits.
#[derive(Debug, Default)]
struct Outstanding {
    count: AtomicUsize,
    idle: Notify,
}

impl Outstanding {
    fn enter(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn exit(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn drained(&self) {
        loop {
            // Register interest before re-checking so a final `exit` between
            // the load and the await cannot be missed.
            let idle = self.idle.notified();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler_fn;
    use std::time::Duration;

    fn pool(opts: HandlerOptions, handler: impl Handler) -> WorkerPool {
        WorkerPool::new("test", Arc::new(handler), &opts)
    }

    fn event(is_call: bool) -> Event {
        Event::assemble("test.run", None, is_call, None, &Context::new())
    }

    #[tokio::test]
    async fn reserved_slots_stay_reachable_by_call() {
        let opts = HandlerOptions::default().max_workers(4).reserved_workers(2);
        let pool = pool(
            opts,
            handler_fn(|_ctx, event, sink| async move {
                if event.is_call() {
                    sink.ok("pong");
                } else {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }),
        );

        // Saturate the push tier (capacity 4 - 2 = 2).
        for _ in 0..2 {
            pool.dispatch(Context::new(), event(false), ReplySink::discard())
                .await
                .unwrap();
        }

        let (sink, mut rx) = ReplySink::pair();
        let call = pool.dispatch(Context::new(), event(true), sink).await;
        assert!(call.is_ok());
        let reply = tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .expect("call should not wait behind the push flood")
            .unwrap();
        assert_eq!(reply.unwrap().unwrap().extract::<&str>().unwrap(), &"pong");
    }

    #[tokio::test]
    async fn cancelled_admission_returns_first_token() {
        let opts = HandlerOptions::default().max_workers(1).reserved_workers(0);
        let pool = pool(
            opts,
            handler_fn(|_ctx, _event, _sink| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }),
        );

        // Occupy the single worker.
        let first = pool
            .dispatch(Context::new(), event(false), ReplySink::discard())
            .await
            .unwrap();

        // A cancelled push gives its tokens back...
        let ctx = Context::new();
        ctx.cancel();
        let err = pool
            .dispatch(ctx, event(false), ReplySink::discard())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorkerUnavailable(_)));

        // ...so the next dispatch still gets through once the worker frees.
        first.await.unwrap();
        pool.dispatch(Context::new(), event(false), ReplySink::discard())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn panic_is_reported_and_pool_survives() {
        let pool = pool(
            HandlerOptions::default(),
            handler_fn(|_ctx, event, sink| async move {
                if event.is_call() {
                    panic!("boom");
                }
                sink.ok(());
            }),
        );

        let (sink, mut rx) = ReplySink::pair();
        let done = pool.dispatch(Context::new(), event(true), sink).await.unwrap();
        done.await.unwrap();
        let reply = rx.recv().await.unwrap();
        assert!(matches!(reply, Err(Error::HandlerPanic(message)) if message == "boom"));

        // The panic did not poison the pool.
        let done = pool
            .dispatch(Context::new(), event(false), ReplySink::discard())
            .await
            .unwrap();
        done.await.unwrap();
        pool.wait().await;
    }

    #[tokio::test]
    async fn wait_drains_outstanding_invocations() {
        let pool = pool(
            HandlerOptions::default().max_workers(8),
            handler_fn(|_ctx, _event, _sink| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }),
        );
        for _ in 0..8 {
            pool.dispatch(Context::new(), event(false), ReplySink::discard())
                .await
                .unwrap();
        }
        tokio::time::timeout(Duration::from_secs(1), pool.wait())
            .await
            .expect("wait should complete once handlers return");
    }
}
