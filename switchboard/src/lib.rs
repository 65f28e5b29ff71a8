#![doc = include_str!("../README.md")]

mod context;
mod error;
mod event;
mod handler;
mod listener;
mod matcher;
mod options;
mod pool;
mod queue;
mod service;
mod subscriber;
pub(crate) mod sync;

pub use context::{AuthorizedInfo, Context};
pub use error::Error;
pub use event::{Event, Payload, Reply, ReplySink};
pub use handler::{handler_fn, Handler, HandlerFn};
pub use listener::{listener_fn, Listener, ListenerFn};
pub use options::{EmitOptions, Filter, HandlerOptions, ObserveOptions};
pub use service::{
    call, call_with, is_started, listen, listen_with, push, push_with, queue_abort, queue_create,
    queue_create_named, queue_release, register, register_with, reload, reset, start, stats, stop,
    subscribe, subscribe_channel, subscribe_with, unsubscribe, Service, Stats,
};
pub use subscriber::Subscription;
