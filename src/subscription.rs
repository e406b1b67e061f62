//! Subscription delivery.
//!
//! A subscription either serves `read()` calls (pull) or pushes messages to
//! a listener. Push delivery is one-shot: each arm waits for one item on a
//! tokio task, then hands the listener call to the host event loop through a
//! reserved callback slot. The wait never runs on the event loop and the
//! listener never runs off it, so at most one listener call per
//! subscription is ever in flight.
//!
//! ```text
//! Idle --arm--> Waiting --item--> Dispatching --settle--> Idle
//!                  |                   |
//!                  +--cancel/close-----+--unsubscribe/abort--> Terminated
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::client::SessionRef;
use crate::connection::{Delivery, SubscriptionHandle};
use crate::error::{BoxError, SessionError};
use crate::message::Message;
use crate::metrics::{Metric, Operation, Tags, destination_tags};
use crate::runtime::CallbackSlot;

/// Push-delivery callback.
pub type Listener = Arc<dyn Fn(Message) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Receives delivery failures instead of the host when registered.
pub type ErrorListener =
    Arc<dyn Fn(ErrorValue) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Structured failure handed to an [`ErrorListener`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorValue {
    pub error: String,
}

pub fn listener<F, Fut>(f: F) -> Listener
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move |m| Box::pin(f(m)))
}

pub fn error_listener<F, Fut>(f: F) -> ErrorListener
where
    F: Fn(ErrorValue) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move |e| Box::pin(f(e)))
}

/// What happens to a subscription whose listener fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListenerErrorPolicy {
    /// Report the failure and keep delivering
    #[default]
    Continue,
    /// Report the failure and unsubscribe
    Terminate,
}

/// Who re-arms push delivery after a successful dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Rearm {
    /// The dispatcher re-arms from the event loop
    #[default]
    Auto,
    /// The consumer calls [`Subscription::continue_delivery`]
    Manual,
}

#[derive(Clone, Default)]
pub struct SubscribeOptions {
    /// `auto`, `client` or `client-individual`; empty means `auto`
    pub ack: String,
    pub headers: BTreeMap<String, String>,
    /// Subscription id; generated when unset
    pub id: Option<String>,
    listener: Option<Listener>,
    error_listener: Option<ErrorListener>,
    pub on_listener_error: ListenerErrorPolicy,
    /// A listener failure cancels the whole session and is fatal on the host
    pub abort_on_failure: bool,
    pub rearm: Rearm,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ack(mut self, ack: impl Into<String>) -> Self {
        self.ack = ack.into();
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn listener<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.listener = Some(listener(f));
        self
    }

    pub fn error_listener<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ErrorValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.error_listener = Some(error_listener(f));
        self
    }

    pub fn on_listener_error(mut self, policy: ListenerErrorPolicy) -> Self {
        self.on_listener_error = policy;
        self
    }

    pub fn abort_on_failure(mut self, abort: bool) -> Self {
        self.abort_on_failure = abort;
        self
    }

    pub fn rearm(mut self, rearm: Rearm) -> Self {
        self.rearm = rearm;
        self
    }

    pub(crate) fn header_pairs(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Idle,
    Waiting,
    Dispatching,
    Terminated,
}

struct Cursor {
    state: DeliveryState,
    /// `continue_delivery` was called while dispatching
    rearm_requested: bool,
}

struct Inner {
    handle: SubscriptionHandle,
    session: SessionRef,
    tags: Tags,
    listener: Option<Listener>,
    error_listener: Option<ErrorListener>,
    policy: ListenerErrorPolicy,
    abort_on_failure: bool,
    rearm: Rearm,
    cursor: Mutex<Cursor>,
    done_tx: mpsc::Sender<()>,
    done_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    unsubscribed: AtomicBool,
}

/// One destination's delivery stream.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<Inner>,
}

impl Subscription {
    pub(crate) fn start(handle: SubscriptionHandle, session: SessionRef, opts: SubscribeOptions) -> Self {
        let (done_tx, done_rx) = mpsc::channel(1);
        let inner = Arc::new(Inner {
            tags: destination_tags(Some(handle.destination())),
            handle,
            session,
            listener: opts.listener,
            error_listener: opts.error_listener,
            policy: opts.on_listener_error,
            abort_on_failure: opts.abort_on_failure,
            rearm: opts.rearm,
            cursor: Mutex::new(Cursor {
                state: DeliveryState::Idle,
                rearm_requested: false,
            }),
            done_tx,
            done_rx: tokio::sync::Mutex::new(done_rx),
            unsubscribed: AtomicBool::new(false),
        });
        if inner.listener.is_some() {
            inner.arm();
        }
        Subscription { inner }
    }

    pub fn id(&self) -> &str {
        self.inner.handle.id()
    }

    pub fn destination(&self) -> &str {
        self.inner.handle.destination()
    }

    pub fn is_active(&self) -> bool {
        self.inner.handle.is_active() && !self.inner.unsubscribed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> DeliveryState {
        self.inner.cursor().state
    }

    /// Block until the next message. Not available when a listener is
    /// attached.
    pub async fn read(&self) -> Result<Message, SessionError> {
        if self.inner.listener.is_some() {
            return Err(SessionError::ListenerAttached);
        }
        let started = Instant::now();
        let result = tokio::select! {
            _ = self.inner.session.scope.cancelled() => Err(SessionError::SubscriptionCompleted),
            item = self.inner.handle.recv() => match item {
                Some(Ok(frame)) => Ok(Message::new(frame)),
                Some(Err(e)) => Err(SessionError::Transport(e)),
                None => Err(SessionError::SubscriptionCompleted),
            },
        };
        self.inner
            .session
            .instruments
            .finish(Operation::Read, &self.inner.tags, started, result.is_ok());
        result
    }

    /// Arm the next push delivery. Needed after every dispatch with
    /// [`Rearm::Manual`], and after a delivery error with either mode.
    /// Returns `false` when nothing was armed.
    ///
    /// Must be called from within the Tokio runtime: arming spawns the wait
    /// task.
    pub fn continue_delivery(&self) -> bool {
        if self.inner.listener.is_none() {
            return false;
        }
        {
            let mut cursor = self.inner.cursor();
            if cursor.state == DeliveryState::Dispatching {
                cursor.rearm_requested = true;
                return true;
            }
        }
        self.inner.arm()
    }

    /// Stop delivery and send UNSUBSCRIBE. A no-op when already inactive.
    pub async fn unsubscribe(&self) -> Result<(), SessionError> {
        if !self.inner.handle.is_active() || self.inner.unsubscribed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.inner.listener.is_some() {
            let _ = self.inner.done_tx.try_send(());
        }
        {
            let mut cursor = self.inner.cursor();
            if cursor.state != DeliveryState::Dispatching {
                cursor.state = DeliveryState::Terminated;
            }
        }
        self.inner.handle.unsubscribe().await?;
        Ok(())
    }
}

impl Inner {
    fn cursor(&self) -> MutexGuard<'_, Cursor> {
        self.cursor.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn stopped(&self) -> bool {
        self.unsubscribed.load(Ordering::SeqCst) || self.session.scope.is_cancelled()
    }

    fn terminate(&self) {
        self.cursor().state = DeliveryState::Terminated;
    }

    /// Idle -> Waiting, then wait for one item on a task.
    fn arm(self: &Arc<Self>) -> bool {
        if self.stopped() {
            return false;
        }
        {
            let mut cursor = self.cursor();
            if cursor.state != DeliveryState::Idle {
                return false;
            }
            cursor.state = DeliveryState::Waiting;
        }
        let slot = self.session.runtime().register_callback();
        let this = self.clone();
        tokio::spawn(async move { this.wait(slot).await });
        true
    }

    async fn wait(self: Arc<Self>, slot: CallbackSlot) {
        let started = Instant::now();
        let next = {
            let mut done = self.done_rx.lock().await;
            tokio::select! {
                biased;
                _ = self.session.scope.cancelled() => None,
                _ = done.recv() => None,
                item = self.handle.recv() => Some(item),
            }
        };

        match next {
            None => {
                self.terminate();
                drop(slot);
            }
            Some(None) => {
                self.terminate();
                if self.stopped() {
                    drop(slot);
                    return;
                }
                let this = self.clone();
                slot.enqueue(move || async move {
                    this.handle_error(SessionError::SubscriptionCompleted).await
                });
            }
            Some(Some(item)) => {
                self.cursor().state = DeliveryState::Dispatching;
                let waited = started.elapsed();
                let this = self.clone();
                slot.enqueue(move || async move { this.dispatch(item, waited).await });
            }
        }
    }

    /// Runs on the event loop.
    async fn dispatch(self: Arc<Self>, item: Delivery, waited: Duration) -> Result<(), SessionError> {
        if self.stopped() || !self.session.runtime().is_active() {
            self.terminate();
            return Ok(());
        }
        let instruments = &self.session.instruments;
        instruments.timing(Metric::ReadTiming, &self.tags, waited);

        let frame = match item {
            Ok(frame) => frame,
            Err(e) => {
                instruments.count(Metric::ReadErrorCount, &self.tags);
                self.settle(false);
                return self.handle_error(SessionError::Transport(e)).await;
            }
        };
        let Some(listener) = self.listener.clone() else {
            self.terminate();
            return Ok(());
        };

        match listener(Message::new(frame)).await {
            Ok(()) => {
                instruments.count(Metric::ReadCount, &self.tags);
                self.settle(self.rearm == Rearm::Auto);
                Ok(())
            }
            Err(e) => {
                instruments.count(Metric::ReadErrorCount, &self.tags);
                warn!(destination = %self.handle.destination(), error = %e, "listener failed");
                let err = SessionError::Listener(e);
                if self.abort_on_failure {
                    // Cancelling the scope also closes the connection.
                    self.terminate();
                    self.session.scope.cancel();
                    return Err(err);
                }
                match self.policy {
                    ListenerErrorPolicy::Continue => {
                        let outcome = self.handle_error(err).await;
                        self.settle(outcome.is_ok() && self.rearm == Rearm::Auto);
                        outcome
                    }
                    ListenerErrorPolicy::Terminate => {
                        self.terminate();
                        self.unsubscribed.store(true, Ordering::SeqCst);
                        if let Err(e) = self.handle.unsubscribe().await {
                            debug!(error = %e, "unsubscribe after listener failure");
                        }
                        self.handle_error(err).await
                    }
                }
            }
        }
    }

    /// Leave Dispatching. Re-arms when `auto` is set or the consumer asked
    /// for it during the dispatch.
    fn settle(self: &Arc<Self>, auto: bool) {
        let requested = {
            let mut cursor = self.cursor();
            if cursor.state != DeliveryState::Dispatching {
                return;
            }
            if self.stopped() {
                cursor.state = DeliveryState::Terminated;
                return;
            }
            cursor.state = DeliveryState::Idle;
            std::mem::take(&mut cursor.rearm_requested)
        };
        if auto || requested {
            self.arm();
        }
    }

    /// Route a delivery failure to the error listener, or return it as fatal
    /// for the host when none is registered.
    async fn handle_error(&self, err: SessionError) -> Result<(), SessionError> {
        let Some(on_error) = &self.error_listener else {
            warn!(destination = %self.handle.destination(), error = %err, "unhandled subscription error");
            return Err(err);
        };
        on_error(ErrorValue {
            error: err.to_string(),
        })
        .await
        .map_err(SessionError::Listener)
    }
}
