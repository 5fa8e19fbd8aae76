use bytes::{Buf, BytesMut};
use snafu::Snafu;
use tokio_util::codec::Decoder;

use super::Message;

/// Frames longer than this are rejected outright.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Errors produced while decoding an event stream.
#[derive(Debug, Snafu)]
pub enum DecodeError {
    /// No message separator showed up within the frame length limit.
    #[snafu(display("event frame exceeds {limit} bytes"))]
    FrameTooLong { limit: usize },

    /// The underlying transport failed.
    #[snafu(display("transport error: {source}"))]
    Io { source: std::io::Error },
}

impl From<std::io::Error> for DecodeError {
    fn from(source: std::io::Error) -> Self {
        DecodeError::Io { source }
    }
}

/// A codec that splits an SSE byte stream into [`Message`]s.
///
/// Messages are separated by a blank line (`\n\n`, `\r\r`, or `\r\n\r\n`).
/// Repeated `data:` fields concatenate with newlines, a bare `data` line
/// contributes an empty data line, and unknown fields are ignored, as are
/// comment-only frames such as the `: ping` a server uses to prime its
/// connection.
#[derive(Clone, Debug)]
pub struct EventStreamDecoder {
    max_frame_length: usize,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        EventStreamDecoder { max_frame_length }
    }
}

impl Default for EventStreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EventStreamDecoder {
    type Item = Message;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, DecodeError> {
        loop {
            let Some((frame_len, delim_len)) = find_separator(src) else {
                if src.len() > self.max_frame_length {
                    return Err(DecodeError::FrameTooLong {
                        limit: self.max_frame_length,
                    });
                }
                return Ok(None);
            };
            if frame_len > self.max_frame_length {
                return Err(DecodeError::FrameTooLong {
                    limit: self.max_frame_length,
                });
            }

            let frame = src.split_to(frame_len);
            src.advance(delim_len);
            let message = parse_frame(&frame);
            if !message.is_empty() {
                return Ok(Some(message));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, DecodeError> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() => Ok(None),
            None => {
                // Final frame with no trailing separator.
                let frame = src.split_to(src.len());
                let message = parse_frame(&frame);
                Ok(if message.is_empty() { None } else { Some(message) })
            }
        }
    }
}

/// Locates the first blank-line separator, returning the frame length and
/// the separator length.
fn find_separator(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 1 < buf.len() {
        match (buf[i], buf[i + 1]) {
            (b'\r', b'\n') => {
                if buf.len() > i + 3 && buf[i + 2] == b'\r' && buf[i + 3] == b'\n' {
                    return Some((i, 4));
                }
                i += 2;
            }
            (b'\n', b'\n') | (b'\r', b'\r') => return Some((i, 2)),
            _ => i += 1,
        }
    }
    None
}

fn parse_frame(frame: &[u8]) -> Message {
    let mut message = Message::default();
    let mut data = String::new();

    for line in frame.split(|&b| b == b'\n' || b == b'\r') {
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = field(line, b"id:") {
            message.id = rest.to_owned();
        } else if let Some(rest) = field(line, b"event:") {
            message.event = rest.to_owned();
        } else if let Some(rest) = field(line, b"data:") {
            data.push_str(rest);
            data.push('\n');
        } else if line == b"data" {
            data.push('\n');
        }
        // Anything else (comments, unknown fields) is ignored.
    }

    if data.ends_with('\n') {
        data.pop();
    }
    message.data = data;
    message
}

/// Strips `prefix` and one optional leading space, lossily as UTF-8.
fn field<'a>(line: &'a [u8], prefix: &[u8]) -> Option<&'a str> {
    let rest = line.strip_prefix(prefix)?;
    let rest = rest.strip_prefix(b" ").unwrap_or(rest);
    std::str::from_utf8(rest).ok()
}
