use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, Bytes};
use futures::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::warn;

use crate::config::Options;
use crate::connection::ConnError;

fn io_err(e: WsError) -> io::Error {
    io::Error::other(e)
}

/// Byte-stream view of a WebSocket: writes go out as one message each (text
/// when the bytes are valid UTF-8, binary otherwise); reads concatenate
/// message payloads. Control frames are handled by tungstenite.
pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    pending: Bytes,
}

impl<S> WsStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for WsStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                    this.pending = msg.into_data();
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Poll::Ready(Err(io_err(e))),
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for WsStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(io_err)?;
        let msg = match std::str::from_utf8(buf) {
            Ok(text) => Message::text(text.to_owned()),
            Err(_) => Message::binary(buf.to_vec()),
        };
        Pin::new(&mut this.inner).start_send(msg).map_err(io_err)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx).map_err(io_err)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_close(cx).map_err(io_err)
    }
}

/// `protocol://address/path?query`
pub fn url(opts: &Options) -> String {
    let mut url = format!("{}://{}", opts.protocol(), opts.address);
    if !opts.path.is_empty() {
        if !opts.path.starts_with('/') {
            url.push('/');
        }
        url.push_str(&opts.path);
    }
    if !opts.query.is_empty() {
        url.push('?');
        url.push_str(opts.query.trim_start_matches('?'));
    }
    url
}

/// Run the HTTP upgrade over an already-dialed stream. A non-2xx answer is
/// logged and surfaced with its status and body.
pub async fn handshake<S>(stream: S, opts: &Options) -> Result<WsStream<S>, ConnError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = url(opts).into_client_request()?;
    for (k, v) in &opts.headers {
        let name = HeaderName::from_bytes(k.as_bytes())
            .map_err(|e| ConnError::Protocol(format!("invalid header name '{}': {}", k, e)))?;
        let value = HeaderValue::from_str(v)
            .map_err(|e| ConnError::Protocol(format!("invalid header value for '{}': {}", k, e)))?;
        request.headers_mut().insert(name, value);
    }

    match tokio_tungstenite::client_async(request, stream).await {
        Ok((ws, _response)) => Ok(WsStream::new(ws)),
        Err(WsError::Http(response)) => {
            let status = response.status().as_u16();
            let body = response
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b.as_ref()).into_owned())
                .unwrap_or_default();
            warn!(status, %body, "websocket handshake rejected");
            Err(ConnError::HandshakeRejected { status, body })
        }
        Err(e) => Err(e.into()),
    }
}
