//! Server-sent-event framing.
//!
//! Supports the three fields the sync protocol uses (`id:`, `event:`,
//! `data:`), blank-line message separation, and a sentinel message that
//! marks the end of a stream. The decoder tolerates `\n`, `\r\n`, and `\r`
//! line endings; the encoder always emits `\n`.

#![deny(missing_debug_implementations)]

mod decoder;
mod encoder;

pub use decoder::{DecodeError, EventStreamDecoder};
pub use encoder::EventStreamEncoder;

/// MIME type of an event stream.
pub const CONTENT_TYPE: &str = "text/event-stream";

/// Event name used for both errors and the end-of-stream sentinel.
pub const EVENT_ERROR: &str = "error";

/// Data payload of the end-of-stream sentinel.
pub const EOF_DATA: &str = "eof";

/// One server-sent event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub event: String,
    pub data: String,
}

impl Message {
    pub fn new(id: impl Into<String>, event: impl Into<String>, data: impl Into<String>) -> Self {
        Message {
            id: id.into(),
            event: event.into(),
            data: data.into(),
        }
    }

    /// A data-only message with no event name.
    pub fn data(data: impl Into<String>) -> Self {
        Self::new("", "", data)
    }

    /// An error message carrying `data` as its text.
    pub fn error(data: impl Into<String>) -> Self {
        Self::new("", EVENT_ERROR, data)
    }

    /// The sentinel that terminates every stream.
    pub fn eof() -> Self {
        Self::error(EOF_DATA)
    }

    pub fn is_error(&self) -> bool {
        self.event == EVENT_ERROR
    }

    pub fn is_eof(&self) -> bool {
        self.id.is_empty() && self.event == EVENT_ERROR && self.data == EOF_DATA
    }

    /// True when every field is empty; such messages (comments, stray
    /// separators) carry nothing and are dropped by the decoder.
    pub fn is_empty(&self) -> bool {
        self.id.is_empty() && self.event.is_empty() && self.data.is_empty()
    }
}
