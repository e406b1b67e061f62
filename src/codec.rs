use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{Frame, headers};
use crate::parser::{RawFrame, parse_frame_slice, unescape_header_value};

/// Escape a STOMP 1.2 header name or value for the wire.
fn escape_header_value(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\\' => result.push_str("\\\\"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            ':' => result.push_str("\\c"),
            _ => result.push(ch),
        }
    }
    result
}

fn invalid(what: &str, e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("{}: {}", what, e))
}

/// Items produced or consumed by the codec: a full frame, or a heartbeat
/// (single EOL on the wire).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StompItem {
    Frame(Frame),
    Heartbeat,
}

/// `tokio_util` codec for the STOMP 1.2 wire format.
///
/// Decodes NUL-terminated and `content-length` framed bodies; encodes frames
/// with escaped headers, adding `content-length` when the body could not be
/// NUL-terminated safely.
#[derive(Debug, Default)]
pub struct StompCodec;

impl StompCodec {
    pub fn new() -> Self {
        Self
    }

    fn build_frame(raw: RawFrame) -> io::Result<Frame> {
        let command =
            String::from_utf8(raw.command).map_err(|e| invalid("invalid utf8 in command", e))?;
        let mut hdrs = Vec::with_capacity(raw.headers.len());
        for (k, v) in raw.headers {
            let k = unescape_header_value(&k).map_err(|e| invalid("invalid escape in header key", e))?;
            let v =
                unescape_header_value(&v).map_err(|e| invalid("invalid escape in header value", e))?;
            let k = String::from_utf8(k).map_err(|e| invalid("invalid utf8 in header key", e))?;
            let v = String::from_utf8(v).map_err(|e| invalid("invalid utf8 in header value", e))?;
            hdrs.push((k, v));
        }
        Ok(Frame {
            command,
            headers: hdrs,
            body: raw.body,
        })
    }
}

impl Decoder for StompCodec {
    type Item = StompItem;
    type Error = io::Error;

    /// Returns `Ok(None)` and leaves `src` untouched until a complete item is
    /// buffered.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.first() == Some(&b'\n') {
            src.advance(1);
            return Ok(Some(StompItem::Heartbeat));
        }
        if src.starts_with(b"\r\n") {
            src.advance(2);
            return Ok(Some(StompItem::Heartbeat));
        }

        match parse_frame_slice(src) {
            Ok(Some((raw, consumed))) => {
                src.advance(consumed);
                Self::build_frame(raw).map(|f| Some(StompItem::Frame(f)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(invalid("parse error", e)),
        }
    }
}

impl Encoder<StompItem> for StompCodec {
    type Error = io::Error;

    fn encode(&mut self, item: StompItem, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = match item {
            StompItem::Heartbeat => {
                dst.put_u8(b'\n');
                return Ok(());
            }
            StompItem::Frame(frame) => frame,
        };

        dst.extend_from_slice(frame.command.as_bytes());
        dst.put_u8(b'\n');

        let mut hdrs = frame.headers;
        let has_cl = hdrs
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case(headers::CONTENT_LENGTH));
        if !has_cl && (frame.body.contains(&0) || std::str::from_utf8(&frame.body).is_err()) {
            hdrs.push((
                headers::CONTENT_LENGTH.to_string(),
                frame.body.len().to_string(),
            ));
        }

        for (k, v) in hdrs {
            dst.extend_from_slice(escape_header_value(&k).as_bytes());
            dst.put_u8(b':');
            dst.extend_from_slice(escape_header_value(&v).as_bytes());
            dst.put_u8(b'\n');
        }

        dst.put_u8(b'\n');
        dst.extend_from_slice(&frame.body);
        dst.put_u8(0);
        Ok(())
    }
}
