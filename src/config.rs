//! Host-facing configuration bags for `connect` and `send`.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::ConnectOptions;

pub const DEFAULT_PROTOCOL: &str = "tcp";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Heartbeat used for a direction left unset when the other one is given.
const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);

/// Connection options supplied by the host script.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Options {
    /// `host:port` (or a socket path for `unix`)
    #[serde(alias = "addr")]
    pub address: String,

    /// `tcp`, `tcp4`, `tcp6`, `unix`, `ws` or `wss`; `tcp` when empty
    pub protocol: String,

    /// WebSocket path
    pub path: String,

    /// WebSocket query string, without the leading `?`
    pub query: String,

    /// Dial timeout; 10s when unset
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Wrap socket transports in TLS
    pub tls: bool,

    /// Extra CONNECT headers; also sent on the WebSocket upgrade request
    pub headers: BTreeMap<String, String>,

    #[serde(alias = "host")]
    pub virtual_host: String,

    pub user: String,
    pub pass: String,

    #[serde(with = "humantime_serde")]
    pub message_send_timeout: Option<Duration>,

    #[serde(with = "humantime_serde")]
    pub receipt_timeout: Option<Duration>,

    pub heartbeat: HeartbeatOptions,

    pub read_buffer_size: usize,
    pub read_channel_capacity: usize,
    pub write_buffer_size: usize,
    pub write_channel_capacity: usize,

    /// Log every transferred payload
    pub verbose: bool,

    /// Skip server certificate verification for `tls` and `wss`
    #[serde(alias = "insecureSkipTLSVerify")]
    pub insecure_skip_tls_verify: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HeartbeatOptions {
    #[serde(with = "humantime_serde")]
    pub incoming: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub outgoing: Option<Duration>,
}

impl Options {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Protocol with the default applied.
    pub fn protocol(&self) -> &str {
        if self.protocol.is_empty() {
            DEFAULT_PROTOCOL
        } else {
            &self.protocol
        }
    }

    /// Dial timeout with the default applied.
    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }

    /// `true` for `ws` and `wss`.
    pub fn is_websocket(&self) -> bool {
        matches!(self.protocol(), "ws" | "wss")
    }

    /// `(outgoing, incoming)` heartbeat, or `None` to keep the engine default.
    pub fn heartbeat(&self) -> Option<(Duration, Duration)> {
        let HeartbeatOptions { incoming, outgoing } = self.heartbeat;
        if incoming.is_none() && outgoing.is_none() {
            return None;
        }
        Some((
            outgoing.unwrap_or(DEFAULT_HEARTBEAT),
            incoming.unwrap_or(DEFAULT_HEARTBEAT),
        ))
    }

    /// Translate into protocol-engine options. Zero sizes and unset
    /// durations keep the engine defaults.
    pub fn connect_options(&self) -> ConnectOptions {
        let mut opts = ConnectOptions {
            connect_timeout: self.timeout(),
            ..ConnectOptions::default()
        };
        if !self.user.is_empty() || !self.pass.is_empty() {
            opts.login = Some((self.user.clone(), self.pass.clone()));
        }
        if !self.virtual_host.is_empty() {
            opts.host = Some(self.virtual_host.clone());
        }
        opts.headers = self
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(t) = self.message_send_timeout {
            opts.msg_send_timeout = Some(t);
        }
        if let Some(t) = self.receipt_timeout {
            opts.receipt_timeout = t;
        }
        if let Some(hb) = self.heartbeat() {
            opts.heartbeat = hb;
        }
        if self.read_buffer_size > 0 {
            opts.read_buffer_size = self.read_buffer_size;
        }
        if self.read_channel_capacity > 0 {
            opts.read_channel_capacity = self.read_channel_capacity;
        }
        if self.write_buffer_size > 0 {
            opts.write_buffer_size = self.write_buffer_size;
        }
        if self.write_channel_capacity > 0 {
            opts.write_channel_capacity = self.write_channel_capacity;
        }
        opts
    }
}

/// Per-message send options.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SendOptions {
    pub headers: BTreeMap<String, String>,
    /// Wait for the broker's RECEIPT before returning
    pub receipt: bool,
}

impl SendOptions {
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_receipt(mut self) -> Self {
        self.receipt = true;
        self
    }

    pub(crate) fn header_pairs(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
