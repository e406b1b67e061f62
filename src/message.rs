use std::borrow::Cow;
use std::sync::OnceLock;

use serde_json::Value;

use crate::error::SessionError;
use crate::frame::{Frame, headers};

/// A received MESSAGE frame with string and JSON accessors.
///
/// The full-body JSON parse is done once and cached; selector lookups reuse
/// that parse when it exists.
#[derive(Debug, Clone)]
pub struct Message {
    frame: Frame,
    json: OnceLock<Value>,
}

impl Message {
    pub fn new(frame: Frame) -> Self {
        Self {
            frame,
            json: OnceLock::new(),
        }
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub(crate) fn frame_mut(&mut self) -> &mut Frame {
        &mut self.frame
    }

    pub fn into_frame(self) -> Frame {
        self.frame
    }

    pub fn destination(&self) -> Option<&str> {
        self.frame.destination()
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.frame.get_header(key)
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.frame.headers
    }

    pub fn content_type(&self) -> Option<&str> {
        self.frame.get_header(headers::CONTENT_TYPE)
    }

    pub fn body(&self) -> &[u8] {
        &self.frame.body
    }

    /// Body as text; invalid UTF-8 sequences are replaced.
    pub fn as_string(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.frame.body)
    }

    /// Body parsed as JSON.
    ///
    /// Without a selector the whole document is returned and a parse failure
    /// is an error. With a dotted selector (`items.0.name`) the addressed
    /// value is returned, or `None` when the body is not JSON or the path
    /// does not exist. An empty body is always an error.
    pub fn as_json(&self, selector: Option<&str>) -> Result<Option<Value>, SessionError> {
        if self.frame.body.is_empty() {
            return Err(SessionError::Json(
                "the body is empty so it can't be transformed to JSON".into(),
            ));
        }

        let Some(selector) = selector else {
            return self.parsed().map(|v| Some(v.clone()));
        };
        let Ok(doc) = self.parsed() else {
            return Ok(None);
        };
        Ok(doc.pointer(&json_pointer(selector)).cloned())
    }

    fn parsed(&self) -> Result<&Value, SessionError> {
        if let Some(v) = self.json.get() {
            return Ok(v);
        }
        let v: Value = serde_json::from_slice(&self.frame.body)
            .map_err(|e| SessionError::Json(e.to_string()))?;
        Ok(self.json.get_or_init(|| v))
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        Message::new(frame)
    }
}

/// `a.b\.c.0` -> `/a/b.c/0`
fn json_pointer(selector: &str) -> String {
    let mut pointer = String::with_capacity(selector.len() + 1);
    let mut segment = String::new();
    let mut chars = selector.chars().peekable();
    let push = |pointer: &mut String, segment: &mut String| {
        pointer.push('/');
        pointer.push_str(&segment.replace('~', "~0").replace('/', "~1"));
        segment.clear();
    };
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'.') => {
                segment.push('.');
                chars.next();
            }
            '.' => push(&mut pointer, &mut segment),
            _ => segment.push(c),
        }
    }
    push(&mut pointer, &mut segment);
    pointer
}
