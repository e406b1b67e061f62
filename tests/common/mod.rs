//! In-process STOMP broker used by the integration tests.
//!
//! Supports CONNECT, SEND (queued until a subscriber exists), SUBSCRIBE,
//! UNSUBSCRIBE, BEGIN/COMMIT/ABORT, ACK/NACK and DISCONNECT, answers every
//! `receipt` header, and records every frame it receives.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use stomp_session::{Frame, MemorySink, Options, Runtime, StompCodec, StompItem};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

pub const SERVER_NAME: &str = "mock-broker/1.0";

/// Login that makes the broker answer CONNECT with ERROR.
pub const REJECTED_LOGIN: &str = "reject";

enum Out {
    Frame(Frame),
    Close,
}

struct Sub {
    conn: usize,
    id: String,
    destination: String,
}

#[derive(Default)]
struct State {
    frames: Vec<Frame>,
    subs: Vec<Sub>,
    queued: HashMap<String, VecDeque<Frame>>,
    conns: HashMap<usize, mpsc::UnboundedSender<Out>>,
    next_conn: usize,
    next_msg: u64,
}

impl State {
    fn deliver(&mut self, send: &Frame) {
        let Some(dest) = send.get_header("destination").map(str::to_string) else {
            return;
        };
        let Some(sub) = self.subs.iter().find(|s| s.destination == dest) else {
            self.queued.entry(dest).or_default().push_back(send.clone());
            return;
        };
        let (conn, sub_id) = (sub.conn, sub.id.clone());
        self.push_message(conn, &sub_id, send);
    }

    fn push_message(&mut self, conn: usize, sub_id: &str, send: &Frame) {
        self.next_msg += 1;
        let n = self.next_msg;
        let mut msg = Frame::new("MESSAGE")
            .header("subscription", sub_id)
            .header("message-id", format!("m-{}", n))
            .header("ack", format!("a-{}", n));
        for (k, v) in &send.headers {
            if !matches!(k.as_str(), "receipt" | "transaction" | "content-length") {
                msg = msg.header(k, v);
            }
        }
        msg = msg.set_body(send.body.clone());
        if let Some(tx) = self.conns.get(&conn) {
            let _ = tx.send(Out::Frame(msg));
        }
    }

    fn subscribe(&mut self, conn: usize, id: String, destination: String) {
        let backlog = self.queued.remove(&destination).unwrap_or_default();
        for send in &backlog {
            self.push_message(conn, &id, send);
        }
        self.subs.push(Sub {
            conn,
            id,
            destination,
        });
    }
}

pub struct MockBroker {
    pub addr: SocketAddr,
    state: Arc<Mutex<State>>,
}

impl MockBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(State::default()));
        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                tokio::spawn(serve(sock, accept_state.clone()));
            }
        });
        MockBroker { addr, state }
    }

    pub fn options(&self) -> Options {
        let mut opts = Options::new(self.addr.to_string());
        opts.timeout = Some(Duration::from_secs(5));
        opts.receipt_timeout = Some(Duration::from_secs(5));
        opts
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.state.lock().unwrap().frames.clone()
    }

    pub fn frames_of(&self, command: &str) -> Vec<Frame> {
        self.frames()
            .into_iter()
            .filter(|f| f.command == command)
            .collect()
    }

    /// Wait until at least `count` frames of `command` have arrived.
    pub async fn wait_for(&self, command: &str, count: usize) -> Vec<Frame> {
        for _ in 0..200 {
            let frames = self.frames_of(command);
            if frames.len() >= count {
                return frames;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "timed out waiting for {} {} frames, saw {:?}",
            count,
            command,
            self.frames().iter().map(|f| f.command.clone()).collect::<Vec<_>>()
        );
    }

    /// Send an ERROR frame to every connection and close them.
    pub fn fail_all(&self, message: &str) {
        let state = self.state.lock().unwrap();
        for tx in state.conns.values() {
            let _ = tx.send(Out::Frame(Frame::new("ERROR").header("message", message)));
            let _ = tx.send(Out::Close);
        }
    }
}

async fn serve(sock: TcpStream, state: Arc<Mutex<State>>) {
    let (mut sink, mut stream) = Framed::new(sock, StompCodec::new()).split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Out>();
    let closed = CancellationToken::new();
    let conn = {
        let mut st = state.lock().unwrap();
        st.next_conn += 1;
        let id = st.next_conn;
        st.conns.insert(id, tx.clone());
        id
    };

    let writer_closed = closed.clone();
    let writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Out::Frame(f) => {
                    if sink.send(StompItem::Frame(f)).await.is_err() {
                        break;
                    }
                }
                Out::Close => break,
            }
        }
        let _ = sink.close().await;
        writer_closed.cancel();
    });

    let mut transactions: HashMap<String, Vec<Frame>> = HashMap::new();
    loop {
        let item = tokio::select! {
            _ = closed.cancelled() => break,
            item = stream.next() => item,
        };
        let frame = match item {
            Some(Ok(StompItem::Frame(f))) => f,
            Some(Ok(StompItem::Heartbeat)) => continue,
            _ => break,
        };
        state.lock().unwrap().frames.push(frame.clone());

        match frame.command.as_str() {
            "CONNECT" | "STOMP" => {
                if frame.get_header("login") == Some(REJECTED_LOGIN) {
                    let err = Frame::new("ERROR")
                        .header("message", "bad credentials")
                        .set_body(b"denied".to_vec());
                    let _ = tx.send(Out::Frame(err));
                    let _ = tx.send(Out::Close);
                    continue;
                }
                let connected = Frame::new("CONNECTED")
                    .header("version", "1.2")
                    .header("server", SERVER_NAME)
                    .header("session", format!("sess-{}", conn))
                    .header("heart-beat", "0,0");
                let _ = tx.send(Out::Frame(connected));
            }
            "SEND" => match frame.get_header("transaction") {
                Some(id) => transactions.entry(id.to_string()).or_default().push(frame.clone()),
                None => state.lock().unwrap().deliver(&frame),
            },
            "SUBSCRIBE" => {
                let id = frame.get_header("id").unwrap_or_default().to_string();
                let dest = frame.get_header("destination").unwrap_or_default().to_string();
                state.lock().unwrap().subscribe(conn, id, dest);
            }
            "UNSUBSCRIBE" => {
                let id = frame.get_header("id").unwrap_or_default();
                state
                    .lock()
                    .unwrap()
                    .subs
                    .retain(|s| !(s.conn == conn && s.id == id));
            }
            "BEGIN" => {
                let id = frame.get_header("transaction").unwrap_or_default();
                transactions.insert(id.to_string(), Vec::new());
            }
            "COMMIT" => {
                let id = frame.get_header("transaction").unwrap_or_default();
                let buffered = transactions.remove(id).unwrap_or_default();
                let mut st = state.lock().unwrap();
                for send in &buffered {
                    st.deliver(send);
                }
            }
            "ABORT" => {
                let id = frame.get_header("transaction").unwrap_or_default();
                transactions.remove(id);
            }
            _ => {}
        }

        if let Some(receipt) = frame.get_header("receipt") {
            let _ = tx.send(Out::Frame(Frame::new("RECEIPT").header("receipt-id", receipt)));
        }
        if frame.command == "DISCONNECT" {
            let _ = tx.send(Out::Close);
        }
    }

    {
        let mut st = state.lock().unwrap();
        st.conns.remove(&conn);
        st.subs.retain(|s| s.conn != conn);
    }
    let _ = tx.send(Out::Close);
    let _ = writer.await;
}

/// Runtime with a memory sink installed.
pub fn recording_runtime() -> (Runtime, stomp_session::EventLoop, Arc<MemorySink>) {
    let (runtime, event_loop) = Runtime::new();
    let sink = MemorySink::new();
    runtime.set_sink(sink.clone());
    (runtime, event_loop, sink)
}
