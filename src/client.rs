use std::future::Future;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{Options, SendOptions};
use crate::connection::{AckMode, ConnError, Connection};
use crate::error::SessionError;
use crate::frame::{Frame, headers};
use crate::message::Message;
use crate::metrics::{Instrumentation, Operation, Tags, destination_tags};
use crate::runtime::Runtime;
use crate::subscription::{SubscribeOptions, Subscription};
use crate::transaction::Transaction;
use crate::transport;

/// Module instance: one per host runtime. Owns the instrumentation shared by
/// every client it creates.
pub struct Stomp {
    instruments: Instrumentation,
}

impl Stomp {
    pub fn new(runtime: Runtime) -> Self {
        Self {
            instruments: Instrumentation::new(runtime),
        }
    }

    pub fn runtime(&self) -> &Runtime {
        self.instruments.runtime()
    }

    /// An unconnected client.
    pub fn client(&self) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                instruments: self.instruments.clone(),
                state: RwLock::new(None),
            }),
        }
    }

    /// Create a client and connect it.
    pub async fn connect(&self, opts: &Options) -> Result<Client, SessionError> {
        let client = self.client();
        client.connect(opts).await?;
        Ok(client)
    }
}

/// What subscriptions and transactions keep of their session: its
/// cancellation scope and its instrumentation.
#[derive(Clone)]
pub(crate) struct SessionRef {
    pub(crate) scope: CancellationToken,
    pub(crate) instruments: Instrumentation,
}

impl SessionRef {
    /// Fail fast once the session scope has been cancelled.
    pub(crate) fn ensure_live(&self) -> Result<(), SessionError> {
        if self.scope.is_cancelled() {
            return Err(SessionError::NotConnected);
        }
        Ok(())
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        self.instruments.runtime()
    }

    /// Run one engine call and record its terminal metrics before returning.
    pub(crate) async fn track<F>(&self, op: Operation, tags: &Tags, call: F) -> Result<(), SessionError>
    where
        F: Future<Output = Result<(), ConnError>>,
    {
        let started = Instant::now();
        let result = call.await;
        self.instruments.finish(op, tags, started, result.is_ok());
        result.map_err(SessionError::from)
    }
}

/// Fill `id` and `message-id` from the `ack` header when they are missing.
pub(crate) fn normalize_ack_headers(frame: &mut Frame) {
    let Some(ack) = frame.non_empty_header(headers::ACK).map(str::to_string) else {
        return;
    };
    if frame.non_empty_header(headers::ID).is_none() {
        frame.set_header(headers::ID, ack.clone());
    }
    if frame.non_empty_header(headers::MESSAGE_ID).is_none() {
        frame.set_header(headers::MESSAGE_ID, ack);
    }
}

/// `""` selects the default mode.
pub(crate) fn parse_ack_mode(ack: &str) -> Result<AckMode, SessionError> {
    if ack.is_empty() {
        return Ok(AckMode::default());
    }
    ack.parse::<AckMode>().map_err(SessionError::InvalidAckMode)
}

#[derive(Clone)]
struct Connected {
    conn: Connection,
    session: SessionRef,
}

impl Connected {
    fn is_live(&self) -> bool {
        !self.session.scope.is_cancelled()
    }
}

/// Close `conn` once `scope` is cancelled, whether by `Client::disconnect`,
/// an aborting listener or host shutdown.
fn close_with_scope(conn: Connection, scope: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = scope.cancelled() => {
                if let Err(e) = conn.disconnect().await {
                    warn!(error = %e, "disconnect after session cancellation failed");
                }
            }
            _ = conn.closed() => {}
        }
    });
}

struct ClientInner {
    instruments: Instrumentation,
    state: RwLock<Option<Connected>>,
}

/// A STOMP session. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    fn state(&self) -> RwLockReadGuard<'_, Option<Connected>> {
        self.inner.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, Option<Connected>> {
        self.inner.state.write().unwrap_or_else(|p| p.into_inner())
    }

    /// The current session, unless it was never opened or its scope has
    /// been cancelled.
    fn live(&self) -> Result<Connected, SessionError> {
        self.state()
            .clone()
            .filter(Connected::is_live)
            .ok_or(SessionError::NotConnected)
    }

    pub fn is_connected(&self) -> bool {
        self.state().as_ref().is_some_and(Connected::is_live)
    }

    /// Dial the transport, run the CONNECT handshake and open a new
    /// cancellation scope under the host context.
    pub async fn connect(&self, opts: &Options) -> Result<(), SessionError> {
        if self.is_connected() {
            return Err(SessionError::AlreadyConnected);
        }
        let stream = transport::open(opts, &self.inner.instruments)
            .await
            .map_err(SessionError::Connection)?;
        let conn = Connection::connect(stream, opts.connect_options())
            .await
            .map_err(SessionError::Connection)?;

        let connected = Connected {
            session: SessionRef {
                scope: self.inner.instruments.runtime().context().child_token(),
                instruments: self.inner.instruments.clone(),
            },
            conn,
        };
        let raced = {
            let mut state = self.state_mut();
            if state.as_ref().is_some_and(Connected::is_live) {
                Some(connected.conn)
            } else {
                close_with_scope(connected.conn.clone(), connected.session.scope.clone());
                *state = Some(connected);
                None
            }
        };
        if let Some(extra) = raced {
            let _ = extra.disconnect().await;
            return Err(SessionError::AlreadyConnected);
        }
        debug!(address = %opts.address, protocol = opts.protocol(), "session connected");
        Ok(())
    }

    /// Cancel the session scope and disconnect. A no-op when not connected.
    ///
    /// After an aborting listener or host shutdown has cancelled the scope,
    /// this only waits for the connection to finish closing.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let Some(connected) = self.state_mut().take() else {
            return Ok(());
        };
        connected.session.scope.cancel();
        connected.conn.disconnect().await?;
        debug!(session = %connected.conn.session(), "session disconnected");
        Ok(())
    }

    /// `server` header reported by the broker.
    pub fn server(&self) -> Result<String, SessionError> {
        Ok(self.live()?.conn.server().to_string())
    }

    /// `session` header reported by the broker.
    pub fn session(&self) -> Result<String, SessionError> {
        Ok(self.live()?.conn.session().to_string())
    }

    pub async fn send(
        &self,
        destination: &str,
        content_type: &str,
        body: impl Into<Vec<u8>>,
        opts: Option<&SendOptions>,
    ) -> Result<(), SessionError> {
        let Connected { conn, session } = self.live()?;
        let tags = destination_tags(Some(destination));
        let body = body.into();
        session
            .track(Operation::Send, &tags, async {
                let opts = opts.cloned().unwrap_or_default();
                conn.send(destination, content_type, body, &opts.header_pairs(), opts.receipt)
                    .await
            })
            .await
    }

    /// Subscribe to `destination`. The ack mode is validated before anything
    /// reaches the broker. With a listener, delivery starts immediately.
    pub async fn subscribe(
        &self,
        destination: &str,
        opts: SubscribeOptions,
    ) -> Result<Subscription, SessionError> {
        let ack = parse_ack_mode(&opts.ack)?;
        let Connected { conn, session } = self.live()?;
        let handle = conn
            .subscribe(destination, ack, opts.id.clone(), &opts.header_pairs())
            .await?;
        Ok(Subscription::start(handle, session, opts))
    }

    pub async fn ack(&self, message: Option<&mut Message>) -> Result<(), SessionError> {
        let Connected { conn, session } = self.live()?;
        let message = message.ok_or(SessionError::NilMessage)?;
        normalize_ack_headers(message.frame_mut());
        let tags = destination_tags(message.destination());
        session
            .track(Operation::Ack, &tags, conn.ack(message.frame()))
            .await
    }

    pub async fn nack(&self, message: Option<&mut Message>) -> Result<(), SessionError> {
        let Connected { conn, session } = self.live()?;
        let message = message.ok_or(SessionError::NilMessage)?;
        normalize_ack_headers(message.frame_mut());
        let tags = destination_tags(message.destination());
        session
            .track(Operation::Nack, &tags, conn.nack(message.frame()))
            .await
    }

    pub async fn begin(&self) -> Result<Transaction, SessionError> {
        let Connected { conn, session } = self.live()?;
        let handle = conn.begin().await?;
        Ok(Transaction::new(handle, session))
    }
}
