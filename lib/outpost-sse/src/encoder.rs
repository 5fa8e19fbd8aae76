use bytes::{BufMut, BytesMut};
use tokio_util::codec::Encoder;

use super::Message;

/// Encodes [`Message`]s into SSE frames.
///
/// Fields are emitted in `id`, `event`, `data` order with a trailing blank
/// line. Empty fields are skipped, and a message with no data encodes to
/// nothing at all, mirroring what decoders ignore.
#[derive(Clone, Copy, Debug, Default)]
pub struct EventStreamEncoder;

impl EventStreamEncoder {
    pub fn new() -> Self {
        EventStreamEncoder
    }

    /// The priming comment a server sends before the first real message.
    pub fn ping(&self, dst: &mut BytesMut) {
        dst.put_slice(b": ping\n\n");
    }
}

impl Encoder<Message> for EventStreamEncoder {
    type Error = std::io::Error;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if message.data.is_empty() {
            return Ok(());
        }
        if !message.id.is_empty() {
            dst.put_slice(b"id: ");
            dst.put_slice(message.id.as_bytes());
            dst.put_u8(b'\n');
        }
        if !message.event.is_empty() {
            dst.put_slice(b"event: ");
            dst.put_slice(message.event.as_bytes());
            dst.put_u8(b'\n');
        }
        for line in message.data.split('\n') {
            dst.put_slice(b"data: ");
            dst.put_slice(line.as_bytes());
            dst.put_u8(b'\n');
        }
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::codec::Decoder as _;

    use super::*;
    use crate::EventStreamDecoder;

    fn encode(message: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        EventStreamEncoder::new().encode(message, &mut buf).unwrap();
        buf
    }

    #[test]
    fn encodes_all_fields() {
        let buf = encode(Message::new("3", "error", "boom"));
        assert_eq!(&buf[..], b"id: 3\nevent: error\ndata: boom\n\n");
    }

    #[test]
    fn skips_empty_fields() {
        let buf = encode(Message::data("payload"));
        assert_eq!(&buf[..], b"data: payload\n\n");
    }

    #[test]
    fn empty_data_encodes_nothing() {
        let buf = encode(Message::new("1", "event", ""));
        assert!(buf.is_empty());
    }

    #[test]
    fn multiline_data_round_trips() {
        let mut buf = encode(Message::data("a\nb"));
        let got = EventStreamDecoder::new().decode(&mut buf).unwrap();
        assert_eq!(got, Some(Message::data("a\nb")));
    }

    #[test]
    fn eof_sentinel_round_trips() {
        let mut buf = encode(Message::eof());
        let got = EventStreamDecoder::new().decode(&mut buf).unwrap().unwrap();
        assert!(got.is_eof());
    }

    #[test]
    fn ping_is_invisible_to_the_decoder() {
        let mut buf = BytesMut::new();
        let encoder = EventStreamEncoder::new();
        encoder.ping(&mut buf);
        let mut decoder = EventStreamDecoder::new();
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }
}
