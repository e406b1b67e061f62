use futures::{SinkExt, Stream, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, BufStream};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::{StompCodec, StompItem};
use crate::frame::{Frame, headers};

/// One item on a subscription channel: a MESSAGE frame, or the error that
/// ended the connection.
pub type Delivery = Result<Frame, ConnError>;

/// Server ERROR held for a subscription until its buffered messages drain.
type FaultSlot = Arc<std::sync::Mutex<Option<ServerError>>>;

struct SubscriptionEntry {
    sender: mpsc::Sender<Delivery>,
    cancel: CancellationToken,
    fault: FaultSlot,
}

/// subscription id -> dispatch entry
type Subscriptions = HashMap<String, SubscriptionEntry>;

/// receipt-id -> waiter
type PendingReceipts = HashMap<String, oneshot::Sender<()>>;

/// Body of a server ERROR frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// The `message` header
    pub message: String,
    /// Frame body, when non-empty
    pub body: Option<String>,
}

impl ServerError {
    fn from_frame(frame: &Frame) -> Self {
        let body = (!frame.body.is_empty()).then(|| String::from_utf8_lossy(&frame.body).into_owned());
        Self {
            message: frame
                .get_header(headers::MESSAGE)
                .unwrap_or("unknown error")
                .to_string(),
            body,
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            Some(body) => write!(f, "{}: {}", self.message, body.trim()),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Errors produced by the protocol engine and the transports beneath it.
#[derive(Error, Debug)]
pub enum ConnError {
    /// I/O-level error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Protocol-level error
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The broker answered with an ERROR frame
    #[error("server error: {0}")]
    Server(ServerError),
    /// Receipt timeout error
    #[error("receipt timeout: no RECEIPT received for '{0}' within timeout")]
    ReceiptTimeout(String),
    /// The writer did not accept the frame in time
    #[error("send timeout: frame not accepted within {0:?}")]
    SendTimeout(Duration),
    /// WebSocket transport failure
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// WebSocket upgrade answered with a non-2xx status
    #[error("websocket handshake rejected ({status}): {body}")]
    HandshakeRejected { status: u16, body: String },
    /// TLS configuration or handshake failure
    #[error("tls error: {0}")]
    Tls(String),
    /// The connection has shut down
    #[error("connection closed")]
    Closed,
}

/// Subscription acknowledgement modes as defined by STOMP 1.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    #[default]
    Auto,
    Client,
    ClientIndividual,
}

impl AckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }
}

impl FromStr for AckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(AckMode::Auto),
            "client" => Ok(AckMode::Client),
            "client-individual" => Ok(AckMode::ClientIndividual),
            other => Err(other.to_string()),
        }
    }
}

/// Parse the STOMP `heart-beat` header value (format: "cx,cy", milliseconds).
/// Missing or invalid fields default to `0`.
pub fn parse_heartbeat_header(header: &str) -> (u64, u64) {
    let mut parts = header.split(',');
    let mut next = || {
        parts
            .next()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0)
    };
    let cx = next();
    let cy = next();
    (cx, cy)
}

/// Negotiate heartbeat intervals between client and server.
///
/// Returns `(outgoing, incoming)`. A direction is disabled when either side
/// offers `0`; otherwise the larger of the two intervals is used.
pub fn negotiate_heartbeats(
    client_out: u64,
    client_in: u64,
    server_out: u64,
    server_in: u64,
) -> (Option<Duration>, Option<Duration>) {
    let pick = |ours: u64, theirs: u64| {
        (ours != 0 && theirs != 0).then(|| Duration::from_millis(ours.max(theirs)))
    };
    (pick(client_out, server_in), pick(client_in, server_out))
}

/// Options translated from the session configuration into the CONNECT
/// handshake and the connection's internal buffering.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// login/passcode pair
    pub login: Option<(String, String)>,
    /// Virtual host sent in the `host` header; `/` when unset
    pub host: Option<String>,
    /// Extra CONNECT headers
    pub headers: Vec<(String, String)>,
    /// (outgoing, incoming) heartbeat offer
    pub heartbeat: (Duration, Duration),
    /// Upper bound on waiting for CONNECTED
    pub connect_timeout: Duration,
    /// Upper bound on handing a frame to the writer
    pub msg_send_timeout: Option<Duration>,
    /// Upper bound on waiting for a RECEIPT
    pub receipt_timeout: Duration,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub read_channel_capacity: usize,
    pub write_channel_capacity: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            login: None,
            host: None,
            headers: Vec::new(),
            heartbeat: (Duration::from_secs(60), Duration::from_secs(60)),
            connect_timeout: Duration::from_secs(10),
            msg_send_timeout: Some(Duration::from_secs(10)),
            receipt_timeout: Duration::from_secs(30),
            read_buffer_size: 4096,
            write_buffer_size: 4096,
            read_channel_capacity: 20,
            write_channel_capacity: 20,
        }
    }
}

/// Identification returned by the broker in CONNECTED.
#[derive(Debug, Default)]
struct ServerInfo {
    server: String,
    session: String,
    version: String,
}

/// A live STOMP connection over an arbitrary byte stream.
///
/// `connect` performs the handshake and spawns one background task that owns
/// the framed stream: it writes queued frames, routes MESSAGE frames to
/// subscription channels, completes receipts and maintains heartbeats. The
/// handle is cheap to clone; every clone talks to the same task.
#[derive(Clone)]
pub struct Connection {
    outbound_tx: mpsc::Sender<StompItem>,
    shutdown: CancellationToken,
    closing: Arc<AtomicBool>,
    subscriptions: Arc<Mutex<Subscriptions>>,
    pending_receipts: Arc<Mutex<PendingReceipts>>,
    id_counter: Arc<AtomicU64>,
    info: Arc<ServerInfo>,
    msg_send_timeout: Option<Duration>,
    receipt_timeout: Duration,
    read_channel_capacity: usize,
}

impl Connection {
    /// Run the CONNECT handshake over `stream` and start the I/O task.
    ///
    /// Fails with `ConnError::Server` when the broker answers with ERROR and
    /// with `ConnError::Protocol` when the stream closes or times out before
    /// CONNECTED arrives.
    pub async fn connect<S>(stream: S, options: ConnectOptions) -> Result<Self, ConnError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let stream = BufStream::with_capacity(
            options.read_buffer_size.max(1),
            options.write_buffer_size.max(1),
            stream,
        );
        let mut framed = Framed::new(stream, StompCodec::new());

        let client_out = options.heartbeat.0.as_millis() as u64;
        let client_in = options.heartbeat.1.as_millis() as u64;

        let mut connect = Frame::new("CONNECT")
            .header("accept-version", "1.2")
            .header("host", options.host.as_deref().unwrap_or("/"));
        if let Some((login, passcode)) = &options.login {
            connect = connect.header("login", login).header("passcode", passcode);
        }
        connect = connect.header("heart-beat", format!("{},{}", client_out, client_in));
        for (k, v) in &options.headers {
            connect = connect.header(k, v);
        }
        framed.send(StompItem::Frame(connect)).await?;

        let connected = tokio::time::timeout(options.connect_timeout, await_connected(&mut framed))
            .await
            .map_err(|_| ConnError::Protocol("timed out waiting for CONNECTED".into()))??;

        let (server_out, server_in) =
            parse_heartbeat_header(connected.get_header("heart-beat").unwrap_or("0,0"));
        let (send_interval, recv_interval) =
            negotiate_heartbeats(client_out, client_in, server_out, server_in);

        let info = ServerInfo {
            server: connected.get_header("server").unwrap_or_default().to_string(),
            session: connected.get_header("session").unwrap_or_default().to_string(),
            version: connected.get_header("version").unwrap_or("1.2").to_string(),
        };
        debug!(server = %info.server, session = %info.session, ?send_interval, ?recv_interval, "stomp connected");

        let (outbound_tx, outbound_rx) = mpsc::channel::<StompItem>(options.write_channel_capacity.max(1));
        let conn = Connection {
            outbound_tx,
            shutdown: CancellationToken::new(),
            closing: Arc::new(AtomicBool::new(false)),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            pending_receipts: Arc::new(Mutex::new(HashMap::new())),
            id_counter: Arc::new(AtomicU64::new(1)),
            info: Arc::new(info),
            msg_send_timeout: options.msg_send_timeout,
            receipt_timeout: options.receipt_timeout,
            read_channel_capacity: options.read_channel_capacity.max(1),
        };

        tokio::spawn(run_io(
            framed,
            outbound_rx,
            conn.shutdown.clone(),
            conn.subscriptions.clone(),
            conn.pending_receipts.clone(),
            send_interval,
            recv_interval,
        ));

        Ok(conn)
    }

    /// `server` header from CONNECTED.
    pub fn server(&self) -> &str {
        &self.info.server
    }

    /// `session` header from CONNECTED.
    pub fn session(&self) -> &str {
        &self.info.session
    }

    /// Negotiated protocol version.
    pub fn version(&self) -> &str {
        &self.info.version
    }

    /// `false` once the I/O task has stopped.
    pub fn is_connected(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Resolves once the I/O task has stopped.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.id_counter.fetch_add(1, Ordering::SeqCst))
    }

    /// Hand a frame to the writer task, bounded by the message send timeout.
    async fn enqueue(&self, frame: Frame) -> Result<(), ConnError> {
        if self.shutdown.is_cancelled() {
            return Err(ConnError::Closed);
        }
        let send = self.outbound_tx.send(StompItem::Frame(frame));
        match self.msg_send_timeout {
            Some(limit) => tokio::time::timeout(limit, send)
                .await
                .map_err(|_| ConnError::SendTimeout(limit))?,
            None => send.await,
        }
        .map_err(|_| ConnError::Closed)
    }

    /// Send `frame`, optionally waiting for the broker's RECEIPT.
    async fn transmit(&self, frame: Frame, receipt: bool) -> Result<(), ConnError> {
        if !receipt {
            return self.enqueue(frame).await;
        }

        let receipt_id = self.next_id("rcpt");
        let (tx, rx) = oneshot::channel();
        self.pending_receipts
            .lock()
            .await
            .insert(receipt_id.clone(), tx);

        if let Err(e) = self.enqueue(frame.receipt(&receipt_id)).await {
            self.pending_receipts.lock().await.remove(&receipt_id);
            return Err(e);
        }

        match tokio::time::timeout(self.receipt_timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ConnError::Closed),
            Err(_) => {
                self.pending_receipts.lock().await.remove(&receipt_id);
                Err(ConnError::ReceiptTimeout(receipt_id))
            }
        }
    }

    /// Send a message to `destination`.
    pub async fn send(
        &self,
        destination: &str,
        content_type: &str,
        body: Vec<u8>,
        extra_headers: &[(String, String)],
        receipt: bool,
    ) -> Result<(), ConnError> {
        let frame = send_frame(destination, content_type, body, extra_headers, None);
        self.transmit(frame, receipt).await
    }

    /// Subscribe to `destination`. When `id` is `None` a connection-unique id
    /// is allocated.
    pub async fn subscribe(
        &self,
        destination: &str,
        ack: AckMode,
        id: Option<String>,
        extra_headers: &[(String, String)],
    ) -> Result<SubscriptionHandle, ConnError> {
        let id = id.unwrap_or_else(|| self.next_id("sub"));
        let (tx, rx) = mpsc::channel::<Delivery>(self.read_channel_capacity);
        let cancel = self.shutdown.child_token();
        let fault = FaultSlot::default();
        {
            let mut map = self.subscriptions.lock().await;
            if map.contains_key(&id) {
                return Err(ConnError::Protocol(format!("duplicate subscription id '{}'", id)));
            }
            map.insert(
                id.clone(),
                SubscriptionEntry {
                    sender: tx,
                    cancel: cancel.clone(),
                    fault: fault.clone(),
                },
            );
        }

        let mut f = Frame::new("SUBSCRIBE")
            .header(headers::ID, &id)
            .header(headers::DESTINATION, destination)
            .header(headers::ACK, ack.as_str());
        for (k, v) in extra_headers {
            f = f.header(k, v);
        }
        if let Err(e) = self.enqueue(f).await {
            self.subscriptions.lock().await.remove(&id);
            return Err(e);
        }
        debug!(%id, %destination, ack = ack.as_str(), "subscribed");

        Ok(SubscriptionHandle {
            id,
            destination: destination.to_string(),
            ack,
            receiver: Mutex::new(rx),
            cancel,
            fault,
            conn: self.clone(),
        })
    }

    /// Acknowledge a received MESSAGE frame.
    pub async fn ack(&self, message: &Frame) -> Result<(), ConnError> {
        self.enqueue(ack_frame("ACK", message, None)?).await
    }

    /// Negative-acknowledge a received MESSAGE frame.
    pub async fn nack(&self, message: &Frame) -> Result<(), ConnError> {
        self.enqueue(ack_frame("NACK", message, None)?).await
    }

    /// Start a transaction with a connection-unique id.
    pub async fn begin(&self) -> Result<TransactionHandle, ConnError> {
        let id = self.next_id("tx");
        self.enqueue(Frame::new("BEGIN").header(headers::TRANSACTION, &id))
            .await?;
        Ok(TransactionHandle {
            id,
            conn: self.clone(),
            completed: AtomicBool::new(false),
        })
    }

    /// Send DISCONNECT, wait for its receipt and stop the I/O task.
    ///
    /// Every subscription is released first: the I/O task may be parked on
    /// a full subscription channel, and the RECEIPT is only read once it is
    /// free. A concurrent second call waits for the first to finish; calling
    /// it after shutdown is a no-op.
    pub async fn disconnect(&self) -> Result<(), ConnError> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        if self.closing.swap(true, Ordering::SeqCst) {
            self.closed().await;
            return Ok(());
        }
        for (_, entry) in self.subscriptions.lock().await.drain() {
            entry.cancel.cancel();
        }
        let result = self.transmit(Frame::new("DISCONNECT"), true).await;
        self.shutdown.cancel();
        result
    }
}

async fn await_connected<T>(framed: &mut T) -> Result<Frame, ConnError>
where
    T: Stream<Item = Result<StompItem, std::io::Error>> + Unpin,
{
    loop {
        match framed.next().await {
            Some(Ok(StompItem::Heartbeat)) => {}
            Some(Ok(StompItem::Frame(f))) => match f.command.as_str() {
                "CONNECTED" => return Ok(f),
                "ERROR" => return Err(ConnError::Server(ServerError::from_frame(&f))),
                other => debug!(command = %other, "ignoring frame before CONNECTED"),
            },
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(ConnError::Protocol(
                    "connection closed before CONNECTED".into(),
                ));
            }
        }
    }
}

fn send_frame(
    destination: &str,
    content_type: &str,
    body: Vec<u8>,
    extra_headers: &[(String, String)],
    transaction: Option<&str>,
) -> Frame {
    let mut f = Frame::new("SEND").header(headers::DESTINATION, destination);
    if !content_type.is_empty() {
        f = f.header(headers::CONTENT_TYPE, content_type);
    }
    f = f.header(headers::CONTENT_LENGTH, body.len().to_string());
    for (k, v) in extra_headers {
        f.set_header(k, v.clone());
    }
    if let Some(tx) = transaction {
        f.set_header(headers::TRANSACTION, tx);
    }
    f.set_body(body)
}

/// Build an ACK/NACK frame for `message`. STOMP 1.2 identifies the message by
/// its `ack` header; `id` and `message-id` are accepted as fallbacks.
fn ack_frame(command: &str, message: &Frame, transaction: Option<&str>) -> Result<Frame, ConnError> {
    let id = message
        .non_empty_header(headers::ACK)
        .or_else(|| message.non_empty_header(headers::ID))
        .or_else(|| message.non_empty_header(headers::MESSAGE_ID))
        .ok_or_else(|| {
            ConnError::Protocol(format!("cannot {} a message without an ack or id header", command))
        })?;
    let mut f = Frame::new(command).header(headers::ID, id);
    if let Some(sub) = message.non_empty_header(headers::SUBSCRIPTION) {
        f = f.header(headers::SUBSCRIPTION, sub);
    }
    if let Some(tx) = transaction {
        f = f.header(headers::TRANSACTION, tx);
    }
    Ok(f)
}

/// Forward a MESSAGE to the subscription named in its `subscription` header.
///
/// The dispatch map is not held across the channel send, so a slow consumer
/// never blocks `unsubscribe`.
async fn deliver(subscriptions: &Mutex<Subscriptions>, shutdown: &CancellationToken, frame: Frame) {
    let Some(sub_id) = frame.get_header(headers::SUBSCRIPTION).map(str::to_string) else {
        debug!("dropping MESSAGE without subscription header");
        return;
    };
    let target = {
        let map = subscriptions.lock().await;
        map.get(&sub_id)
            .map(|entry| (entry.sender.clone(), entry.cancel.clone()))
    };
    let Some((sender, cancel)) = target else {
        debug!(subscription = %sub_id, "dropping MESSAGE for unknown subscription");
        return;
    };
    tokio::select! {
        _ = sender.send(Ok(frame)) => {}
        _ = cancel.cancelled() => {}
        _ = shutdown.cancelled() => {}
    }
}

async fn run_io<S>(
    framed: Framed<S, StompCodec>,
    mut outbound_rx: mpsc::Receiver<StompItem>,
    shutdown: CancellationToken,
    subscriptions: Arc<Mutex<Subscriptions>>,
    pending_receipts: Arc<Mutex<PendingReceipts>>,
    send_interval: Option<Duration>,
    recv_interval: Option<Duration>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut sink, mut stream) = framed.split();
    let idle = Duration::from_secs(86400);
    let mut hb_tick = tokio::time::interval(send_interval.unwrap_or(idle));
    hb_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut watchdog = tokio::time::interval(recv_interval.map(|d| d / 2).unwrap_or(idle));
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_sent = Instant::now();
    let mut last_received = Instant::now();
    let mut fault: Option<ServerError> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = sink.close().await;
                break;
            }
            maybe = outbound_rx.recv() => match maybe {
                Some(item) => {
                    if let Err(e) = sink.send(item).await {
                        warn!(error = %e, "stomp write failed");
                        break;
                    }
                    last_sent = Instant::now();
                }
                None => break,
            },
            item = stream.next() => match item {
                Some(Ok(StompItem::Heartbeat)) => last_received = Instant::now(),
                Some(Ok(StompItem::Frame(f))) => {
                    last_received = Instant::now();
                    match f.command.as_str() {
                        "MESSAGE" => deliver(&subscriptions, &shutdown, f).await,
                        "RECEIPT" => {
                            if let Some(receipt_id) = f.get_header(headers::RECEIPT_ID) {
                                if let Some(waiter) = pending_receipts.lock().await.remove(receipt_id) {
                                    let _ = waiter.send(());
                                }
                            }
                        }
                        "ERROR" => {
                            let err = ServerError::from_frame(&f);
                            warn!(error = %err, "broker sent ERROR frame");
                            fault = Some(err);
                            break;
                        }
                        other => debug!(command = %other, "ignoring unexpected frame"),
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "stomp read failed");
                    break;
                }
                None => break,
            },
            _ = hb_tick.tick(), if send_interval.is_some() => {
                if let Some(interval) = send_interval {
                    if last_sent.elapsed() >= interval {
                        if sink.send(StompItem::Heartbeat).await.is_err() {
                            break;
                        }
                        last_sent = Instant::now();
                    }
                }
            }
            _ = watchdog.tick(), if recv_interval.is_some() => {
                if let Some(interval) = recv_interval {
                    if last_received.elapsed() > interval * 2 {
                        warn!(?interval, "no data from broker within heartbeat window");
                        let _ = sink.close().await;
                        break;
                    }
                }
            }
        }
    }

    shutdown.cancel();
    let subs = std::mem::take(&mut *subscriptions.lock().await);
    for (_, entry) in subs {
        if let Some(err) = &fault {
            *entry.fault.lock().unwrap_or_else(|p| p.into_inner()) = Some(err.clone());
        }
        entry.cancel.cancel();
    }
    pending_receipts.lock().await.clear();
    debug!("stomp connection task stopped");
}

/// Engine-side view of one subscription: its receive channel plus the
/// `active` predicate.
pub struct SubscriptionHandle {
    id: String,
    destination: String,
    ack: AckMode,
    receiver: Mutex<mpsc::Receiver<Delivery>>,
    cancel: CancellationToken,
    fault: FaultSlot,
    conn: Connection,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack
    }

    /// `false` after `unsubscribe` or once the connection has stopped.
    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Next delivery, or `None` once the channel is closed and drained.
    /// A broker ERROR that ended the connection is yielded once, after the
    /// messages buffered ahead of it.
    pub async fn recv(&self) -> Option<Delivery> {
        if let Some(item) = self.receiver.lock().await.recv().await {
            return Some(item);
        }
        self.fault
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .map(|err| Err(ConnError::Server(err)))
    }

    /// Remove the subscription and send UNSUBSCRIBE. No-op when inactive.
    pub async fn unsubscribe(&self) -> Result<(), ConnError> {
        if !self.is_active() {
            return Ok(());
        }
        self.cancel.cancel();
        self.conn.subscriptions.lock().await.remove(&self.id);
        debug!(id = %self.id, destination = %self.destination, "unsubscribed");
        self.conn
            .enqueue(Frame::new("UNSUBSCRIBE").header(headers::ID, &self.id))
            .await
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Ok(mut map) = self.conn.subscriptions.try_lock() {
            map.remove(&self.id);
        }
    }
}

/// Engine-side transaction: every frame carries the `transaction` header.
pub struct TransactionHandle {
    id: String,
    conn: Connection,
    completed: AtomicBool,
}

impl TransactionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    fn ensure_open(&self) -> Result<(), ConnError> {
        if self.completed.load(Ordering::SeqCst) {
            return Err(ConnError::Protocol(format!(
                "transaction '{}' already completed",
                self.id
            )));
        }
        Ok(())
    }

    pub async fn send(
        &self,
        destination: &str,
        content_type: &str,
        body: Vec<u8>,
        extra_headers: &[(String, String)],
        receipt: bool,
    ) -> Result<(), ConnError> {
        self.ensure_open()?;
        let frame = send_frame(destination, content_type, body, extra_headers, Some(&self.id));
        self.conn.transmit(frame, receipt).await
    }

    pub async fn ack(&self, message: &Frame) -> Result<(), ConnError> {
        self.ensure_open()?;
        self.conn
            .enqueue(ack_frame("ACK", message, Some(&self.id))?)
            .await
    }

    pub async fn nack(&self, message: &Frame) -> Result<(), ConnError> {
        self.ensure_open()?;
        self.conn
            .enqueue(ack_frame("NACK", message, Some(&self.id))?)
            .await
    }

    async fn finish(&self, command: &str) -> Result<(), ConnError> {
        if self.completed.swap(true, Ordering::SeqCst) {
            return Err(ConnError::Protocol(format!(
                "transaction '{}' already completed",
                self.id
            )));
        }
        self.conn
            .enqueue(Frame::new(command).header(headers::TRANSACTION, &self.id))
            .await
    }

    /// Send COMMIT.
    pub async fn commit(&self) -> Result<(), ConnError> {
        self.finish("COMMIT").await
    }

    /// Send ABORT.
    pub async fn abort(&self) -> Result<(), ConnError> {
        self.finish("ABORT").await
    }
}
