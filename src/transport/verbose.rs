use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::info;

/// Byte stream that logs every payload and failure at `info` under the
/// `stomp_session::wire` target. Pure observation: bytes and errors are
/// returned exactly as the inner stream produced them.
pub struct VerboseStream<S> {
    inner: S,
}

impl<S> VerboseStream<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

/// `None` for an empty transfer, such as the zero-byte read at EOF.
fn payload_line(direction: &str, bytes: &[u8]) -> Option<String> {
    (!bytes.is_empty()).then(|| format!("{}: {}", direction, String::from_utf8_lossy(bytes)))
}

impl<S: AsyncRead + Unpin> AsyncRead for VerboseStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let res = Pin::new(&mut this.inner).poll_read(cx, buf);
        match &res {
            Poll::Ready(Ok(())) => {
                if let Some(line) = payload_line("READ", &buf.filled()[before..]) {
                    info!(target: "stomp_session::wire", "{}", line);
                }
            }
            Poll::Ready(Err(e)) => info!(target: "stomp_session::wire", "READ-ERR: {}", e),
            Poll::Pending => {}
        }
        res
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for VerboseStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let res = Pin::new(&mut this.inner).poll_write(cx, buf);
        match &res {
            Poll::Ready(Ok(n)) => {
                if let Some(line) = payload_line("WRITE", &buf[..*n]) {
                    info!(target: "stomp_session::wire", "{}", line);
                }
            }
            Poll::Ready(Err(e)) => info!(target: "stomp_session::wire", "WRITE-ERR: {}", e),
            Poll::Pending => {}
        }
        res
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
