//! Host runtime model: the recording context, the host cancellation context
//! and the single-threaded consumer loop that listener callbacks run on.
//!
//! Background work never calls user code directly. It reserves a slot with
//! [`Runtime::register_callback`] before it starts waiting, and once it has
//! something to deliver it enqueues a task through that slot. The
//! [`EventLoop`] drains those tasks one at a time, so callbacks never overlap
//! each other or the host's foreground code.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SessionError;
use crate::metrics::SampleSink;

type Task = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), SessionError>> + Send>;

enum Event {
    Run(Task),
    Released,
}

struct Inner {
    sink: RwLock<Option<Arc<dyn SampleSink>>>,
    context: CancellationToken,
    tasks: mpsc::UnboundedSender<Event>,
    pending: AtomicUsize,
}

/// Cloneable handle to the host runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl Runtime {
    /// Create a runtime and the event loop that executes its callbacks.
    pub fn new() -> (Runtime, EventLoop) {
        let (tx, rx) = mpsc::unbounded_channel();
        let runtime = Runtime {
            inner: Arc::new(Inner {
                sink: RwLock::new(None),
                context: CancellationToken::new(),
                tasks: tx,
                pending: AtomicUsize::new(0),
            }),
        };
        let event_loop = EventLoop {
            runtime: runtime.clone(),
            tasks: rx,
        };
        (runtime, event_loop)
    }

    /// Install the recording context.
    pub fn set_sink(&self, sink: Arc<dyn SampleSink>) {
        *self.inner.sink.write().unwrap_or_else(|p| p.into_inner()) = Some(sink);
    }

    /// Remove the recording context; recording becomes a no-op.
    pub fn clear_sink(&self) {
        *self.inner.sink.write().unwrap_or_else(|p| p.into_inner()) = None;
    }

    /// The installed sink while the host context is live.
    pub fn sink(&self) -> Option<Arc<dyn SampleSink>> {
        if self.inner.context.is_cancelled() {
            return None;
        }
        self.inner
            .sink
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Host cancellation context. Session scopes are children of it.
    pub fn context(&self) -> &CancellationToken {
        &self.inner.context
    }

    /// Cancel the host context, stopping every session created under it.
    pub fn shutdown(&self) {
        self.inner.context.cancel();
    }

    /// A recording context is installed and the host has not shut down.
    pub fn is_active(&self) -> bool {
        self.sink().is_some()
    }

    /// Reserve a callback. The event loop keeps running until the slot is
    /// either used or dropped.
    pub fn register_callback(&self) -> CallbackSlot {
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        CallbackSlot {
            tasks: self.inner.tasks.clone(),
            used: false,
        }
    }

    /// Reservations not yet consumed by the event loop.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }
}

/// A reserved place in the event loop's queue.
pub struct CallbackSlot {
    tasks: mpsc::UnboundedSender<Event>,
    used: bool,
}

impl CallbackSlot {
    /// Queue `f` to run on the event loop.
    pub fn enqueue<F, Fut>(mut self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), SessionError>> + Send + 'static,
    {
        self.used = true;
        let task: Task = Box::new(move || Box::pin(f()));
        let _ = self.tasks.send(Event::Run(task));
    }
}

impl Drop for CallbackSlot {
    fn drop(&mut self) {
        if !self.used {
            let _ = self.tasks.send(Event::Released);
        }
    }
}

/// The single consumer context.
pub struct EventLoop {
    runtime: Runtime,
    tasks: mpsc::UnboundedReceiver<Event>,
}

impl EventLoop {
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Run queued callbacks in order until no reservation is outstanding.
    ///
    /// The first callback error is fatal: it is returned immediately and the
    /// remaining queue is left in place.
    pub async fn run(&mut self) -> Result<(), SessionError> {
        while self.runtime.pending() > 0 {
            let Some(event) = self.tasks.recv().await else {
                break;
            };
            self.runtime.inner.pending.fetch_sub(1, Ordering::SeqCst);
            if let Event::Run(task) = event {
                if let Err(e) = task().await {
                    debug!(error = %e, "event loop stopped on fatal error");
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}
