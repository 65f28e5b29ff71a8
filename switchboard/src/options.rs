use std::{fmt, sync::Arc};

use crate::Event;

/// Predicate deciding whether an observer receives an event.
pub type Filter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Per-registration worker and queue parameters, applied by
/// [`register_with`](crate::register_with).
///
/// ```
/// use switchboard::HandlerOptions;
///
/// let opts = HandlerOptions::default()
///     .max_workers(64)
///     .reserved_workers(4);
/// ```
#[derive(Clone, Debug)]
pub struct HandlerOptions {
    pub(crate) max_workers: usize,
    pub(crate) reserved_workers: usize,
    pub(crate) queue_size: usize,
}

impl HandlerOptions {
    /// Default concurrency cap per registered prefix.
    pub const DEFAULT_MAX_WORKERS: usize = 512;

    /// Default number of workers reachable only by `call`.
    pub const DEFAULT_RESERVED_WORKERS: usize = 10;

    /// Default capacity of each queue bound to the prefix.
    pub const DEFAULT_QUEUE_SIZE: usize = 8192;

    /// Returns options taken from the `SWITCHBOARD_MAX_WORKERS`,
    /// `SWITCHBOARD_RESERVED_WORKERS`, and `SWITCHBOARD_QUEUE_SIZE`
    /// environment variables, falling back on the defaults for variables
    /// that are unset or unparseable.
    pub fn with_default_env() -> Self {
        Self {
            max_workers: env_usize("SWITCHBOARD_MAX_WORKERS", Self::DEFAULT_MAX_WORKERS),
            reserved_workers: env_usize(
                "SWITCHBOARD_RESERVED_WORKERS",
                Self::DEFAULT_RESERVED_WORKERS,
            ),
            queue_size: env_usize("SWITCHBOARD_QUEUE_SIZE", Self::DEFAULT_QUEUE_SIZE),
        }
    }

    /// Sets the concurrency cap for the prefix's worker pool.
    pub fn max_workers(self, max_workers: usize) -> Self {
        Self {
            max_workers,
            ..self
        }
    }

    /// Sets how many workers are reachable only by `call`, guaranteeing
    /// synchronous traffic headroom under a flood of pushes. Clamped so at
    /// least one worker remains reachable by `push`.
    pub fn reserved_workers(self, reserved_workers: usize) -> Self {
        Self {
            reserved_workers,
            ..self
        }
    }

    /// Sets the bounded capacity of every queue created for the prefix.
    pub fn queue_size(self, queue_size: usize) -> Self {
        Self { queue_size, ..self }
    }
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            max_workers: Self::DEFAULT_MAX_WORKERS,
            reserved_workers: Self::DEFAULT_RESERVED_WORKERS,
            queue_size: Self::DEFAULT_QUEUE_SIZE,
        }
    }
}

/// Emission parameters, applied by [`push_with`](crate::push_with) and
/// [`call_with`](crate::call_with).
#[derive(Clone, Debug, Default)]
pub struct EmitOptions {
    pub(crate) queue: Option<String>,
}

impl EmitOptions {
    /// Routes the event through the named queue, serializing it behind
    /// everything already enqueued there.
    pub fn queue(self, id: impl Into<String>) -> Self {
        Self {
            queue: Some(id.into()),
        }
    }
}

/// Observer parameters, applied by [`listen_with`](crate::listen_with) and
/// [`subscribe_with`](crate::subscribe_with).
#[derive(Clone, Default)]
pub struct ObserveOptions {
    pub(crate) filter: Option<Filter>,
    pub(crate) buffer_size: Option<usize>,
}

impl ObserveOptions {
    /// Default capacity of a listener's event buffer.
    pub const DEFAULT_BUFFER_SIZE: usize = 8192;

    /// Skips events for which `filter` returns `false`. The predicate runs
    /// on the emitter's task, so it should be cheap.
    pub fn filter(mut self, filter: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Sets the listener's buffer capacity. Ignored by `subscribe`, where
    /// the channel (and therefore its capacity) belongs to the caller.
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }

    pub(crate) fn effective_buffer_size(&self) -> usize {
        match self.buffer_size {
            Some(n) => n.max(1),
            None => env_usize("SWITCHBOARD_BUFFER_SIZE", Self::DEFAULT_BUFFER_SIZE),
        }
    }

    pub(crate) fn accepts(&self, event: &Event) -> bool {
        self.filter.as_ref().map_or(true, |f| f(event))
    }
}

impl fmt::Debug for ObserveOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserveOptions")
            .field("filter", &self.filter.as_ref().map(|_| ".."))
            .field("buffer_size", &self.buffer_size)
            .finish()
    }
}

fn env_usize(var: &str, default: usize) -> usize {
    match std::env::var(var) {
        Ok(value) => match value.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                tracing::warn!(var, %value, "ignoring unparseable environment variable");
                default
            }
        },
        Err(_) => default,
    }
}
