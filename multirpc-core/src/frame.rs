//! Length-prefixed frame codec (spec §4.1, §6).
//!
//! Wire format: `[compressed:1][length:4 big-endian][bytes:length]`, with
//! `compressed` always `0x00` in this core. [`FrameParser`] is resumable:
//! it can be fed arbitrarily fragmented byte slices and yields only
//! complete frames, retaining a trailing partial frame across calls.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolErrorKind, RpcError};

/// Default cap on a single frame's declared length (spec §4.1).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;

/// Encode one application message into a single frame.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(0); // compressed = false, reserved for future use
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// A resumable parser over a rolling byte buffer, owned exclusively by one
/// processor (spec §5: "no cross-stream sharing").
pub struct FrameParser {
    buffer: BytesMut,
    max_message_size: usize,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        FrameParser::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        FrameParser {
            buffer: BytesMut::new(),
            max_message_size,
        }
    }

    /// Feed newly arrived bytes and return every complete message decoded
    /// so far, in arrival order. Any trailing incomplete frame is retained
    /// for the next call.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>, RpcError> {
        self.buffer.extend_from_slice(data);

        let mut out = Vec::new();
        loop {
            if self.buffer.len() < HEADER_LEN {
                break;
            }

            let compressed = self.buffer[0];
            if compressed != 0 {
                return Err(RpcError::protocol(ProtocolErrorKind::UnsupportedCompression));
            }

            let len = u32::from_be_bytes([
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
                self.buffer[4],
            ]) as usize;

            if len > self.max_message_size {
                return Err(RpcError::protocol(ProtocolErrorKind::MessageTooLarge));
            }

            if self.buffer.len() < HEADER_LEN + len {
                break; // wait for more bytes
            }

            self.buffer.advance(HEADER_LEN);
            out.push(self.buffer.split_to(len).freeze());
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_single_frame() {
        let frame = encode_frame(b"hello");
        let mut parser = FrameParser::new();
        let msgs = parser.push(&frame).unwrap();
        assert_eq!(msgs, vec![Bytes::from_static(b"hello")]);
    }

    #[test]
    fn two_frames_concatenated_decode_separately() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode_frame(b"a"));
        wire.extend_from_slice(&encode_frame(b"b"));

        let mut parser = FrameParser::new();
        let msgs = parser.push(&wire).unwrap();
        assert_eq!(msgs, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
    }

    #[test]
    fn tolerates_arbitrary_fragmentation() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode_frame(b"part1"));
        wire.extend_from_slice(&encode_frame(b"part2"));
        let wire = wire.freeze();

        // Split at every possible point and confirm two full passes both
        // yield the same two messages, regardless of split point.
        for split in 0..=wire.len() {
            let (a, b) = wire.split_at(split);
            let mut parser = FrameParser::new();
            let mut msgs = parser.push(a).unwrap();
            msgs.extend(parser.push(b).unwrap());
            assert_eq!(
                msgs,
                vec![Bytes::from_static(b"part1"), Bytes::from_static(b"part2")],
                "failed at split point {split}"
            );
        }
    }

    #[test]
    fn three_way_split_still_yields_two_messages() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode_frame(b"x"));
        wire.extend_from_slice(&encode_frame(b"y"));
        let wire = wire.freeze();

        let mut parser = FrameParser::new();
        let mut msgs = Vec::new();
        for chunk in wire.chunks(3) {
            msgs.extend(parser.push(chunk).unwrap());
        }
        assert_eq!(msgs, vec![Bytes::from_static(b"x"), Bytes::from_static(b"y")]);
    }

    #[test]
    fn rejects_nonzero_compressed_byte() {
        let mut wire = BytesMut::new();
        wire.put_u8(1);
        wire.put_u32(0);
        let mut parser = FrameParser::new();
        let err = parser.push(&wire).unwrap_err();
        assert!(matches!(
            err,
            RpcError::Protocol {
                kind: ProtocolErrorKind::UnsupportedCompression
            }
        ));
    }

    #[test]
    fn rejects_oversize_length() {
        let mut wire = BytesMut::new();
        wire.put_u8(0);
        wire.put_u32(DEFAULT_MAX_MESSAGE_SIZE as u32 + 1);
        let mut parser = FrameParser::new();
        let err = parser.push(&wire).unwrap_err();
        assert!(matches!(
            err,
            RpcError::Protocol {
                kind: ProtocolErrorKind::MessageTooLarge
            }
        ));
    }

    #[test]
    fn empty_payload_frame_round_trips() {
        let frame = encode_frame(b"");
        let mut parser = FrameParser::new();
        let msgs = parser.push(&frame).unwrap();
        assert_eq!(msgs, vec![Bytes::new()]);
    }
}
