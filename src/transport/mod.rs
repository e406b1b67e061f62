//! Transport adapters: dial the configured protocol and wrap the resulting
//! byte stream with byte accounting and, optionally, payload logging.

pub mod stats;
pub mod tls;
pub mod verbose;
pub mod ws;

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, lookup_host};
use tracing::debug;

use crate::config::Options;
use crate::connection::ConnError;
use crate::metrics::Instrumentation;

pub use stats::InstrumentedStream;
pub use verbose::VerboseStream;
pub use ws::WsStream;

/// Any full-duplex byte stream the protocol engine can run over.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

pub type BoxedStream = Box<dyn ByteStream>;

/// Dial `opts` within its timeout and wrap the stream for instrumentation.
///
/// The timeout covers name resolution, the socket connect and any TLS or
/// WebSocket handshake.
pub async fn open(opts: &Options, instruments: &Instrumentation) -> Result<BoxedStream, ConnError> {
    let timeout = opts.timeout();
    let raw = tokio::time::timeout(timeout, dial(opts))
        .await
        .map_err(|_| {
            ConnError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("dial {} timed out after {:?}", opts.address, timeout),
            ))
        })??;
    debug!(address = %opts.address, protocol = opts.protocol(), tls = opts.tls, "transport open");

    let stream: BoxedStream = Box::new(InstrumentedStream::new(raw, instruments.clone()));
    if opts.verbose {
        return Ok(Box::new(VerboseStream::new(stream)));
    }
    Ok(stream)
}

async fn dial(opts: &Options) -> Result<BoxedStream, ConnError> {
    let protocol = opts.protocol();
    let insecure = opts.insecure_skip_tls_verify;
    match protocol {
        "ws" | "wss" => {
            let tcp = tcp_connect(&opts.address, "tcp").await?;
            if protocol == "wss" {
                let tls = tls::connect(tcp, &opts.address, insecure).await?;
                Ok(Box::new(ws::handshake(tls, opts).await?))
            } else {
                Ok(Box::new(ws::handshake(tcp, opts).await?))
            }
        }
        "tcp" | "tcp4" | "tcp6" => {
            let tcp = tcp_connect(&opts.address, protocol).await?;
            if opts.tls {
                Ok(Box::new(tls::connect(tcp, &opts.address, insecure).await?))
            } else {
                Ok(Box::new(tcp))
            }
        }
        #[cfg(unix)]
        "unix" => {
            let sock = tokio::net::UnixStream::connect(&opts.address).await?;
            Ok(Box::new(sock))
        }
        other => Err(ConnError::Protocol(format!("unsupported protocol '{}'", other))),
    }
}

async fn tcp_connect(address: &str, protocol: &str) -> Result<TcpStream, ConnError> {
    let mut last_err = None;
    for addr in lookup_host(address).await? {
        let family_ok = match protocol {
            "tcp4" => addr.is_ipv4(),
            "tcp6" => addr.is_ipv6(),
            _ => true,
        };
        if !family_ok {
            continue;
        }
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.map(ConnError::Io).unwrap_or_else(|| {
        ConnError::Protocol(format!("no {} address found for '{}'", protocol, address))
    }))
}
