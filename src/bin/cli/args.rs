use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "stomp")]
#[command(version)]
#[command(about = "Drive an instrumented STOMP send/read scenario against a broker")]
pub struct Cli {
    /// STOMP broker address (host:port, or a socket path for unix)
    #[arg(short, long)]
    pub address: Option<String>,

    /// Transport: tcp, tcp4, tcp6, unix, ws or wss
    #[arg(long)]
    pub protocol: Option<String>,

    /// Login username
    #[arg(short, long)]
    pub login: Option<String>,

    /// Passcode
    #[arg(short, long)]
    pub passcode: Option<String>,

    /// JSON options file; address, protocol and credentials given on the
    /// command line take precedence
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Destination used for both send and subscribe
    #[arg(short, long, default_value = "/queue/stomp-session")]
    pub destination: String,

    /// Number of send/read iterations
    #[arg(short = 'n', long, default_value_t = 10)]
    pub iterations: usize,

    /// Concurrent sessions, each running every iteration
    #[arg(short, long, default_value_t = 1)]
    pub sessions: usize,

    /// Ack mode for the subscription: auto, client or client-individual
    #[arg(long, default_value = "auto")]
    pub ack: String,

    /// Wait for a broker RECEIPT on every send
    #[arg(long)]
    pub receipt: bool,

    /// Deliver through a listener on the event loop instead of read()
    #[arg(long)]
    pub listener: bool,

    /// Message body; `{n}` is replaced with the iteration number
    #[arg(long, default_value = "message {n}")]
    pub body: String,

    /// Log raw frames as they cross the wire
    #[arg(short, long)]
    pub verbose: bool,
}
