//! Frame codec for the wire envelope
//!
//! Handles the length-prefixed envelope shared by every message. The codec
//! knows nothing about message semantics; bodies go in and out as raw bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{ENVELOPE_SIZE, MAX_FRAME_SIZE};

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("Malformed envelope: declared length {0} below minimum {1}")]
    BadLength(usize, usize),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// A decoded envelope: type code plus the raw body bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub type_code: u32,
    pub body: Bytes,
}

/// Encode one frame into the buffer.
///
/// The declared length covers the whole frame, envelope included.
pub fn encode(type_code: u32, body: &[u8], buf: &mut BytesMut) -> CodecResult<()> {
    let total = ENVELOPE_SIZE + body.len();
    if total > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(total, MAX_FRAME_SIZE));
    }

    buf.reserve(total);
    buf.put_u32(total as u32);
    buf.put_u32(type_code);
    buf.put_slice(body);
    Ok(())
}

/// Decodes frames from a byte stream
pub struct Decoder {
    state: DecodeState,
}

#[derive(Default)]
enum DecodeState {
    #[default]
    Envelope,
    Body {
        type_code: u32,
        length: usize,
    },
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Envelope,
        }
    }

    /// Attempt to decode one frame from the buffer.
    ///
    /// Returns `Ok(None)` if more data is needed; the caller buffers further
    /// input and retries. No I/O happens here, so partial input never blocks.
    pub fn decode(&mut self, buf: &mut BytesMut) -> CodecResult<Option<RawFrame>> {
        loop {
            match &self.state {
                DecodeState::Envelope => {
                    if buf.len() < ENVELOPE_SIZE {
                        return Ok(None);
                    }

                    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
                    let type_code = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

                    if length < ENVELOPE_SIZE {
                        return Err(CodecError::BadLength(length, ENVELOPE_SIZE));
                    }
                    if length > MAX_FRAME_SIZE {
                        return Err(CodecError::FrameTooLarge(length, MAX_FRAME_SIZE));
                    }

                    buf.advance(ENVELOPE_SIZE);

                    self.state = DecodeState::Body {
                        type_code,
                        length: length - ENVELOPE_SIZE,
                    };
                }
                DecodeState::Body { type_code, length } => {
                    if buf.len() < *length {
                        return Ok(None);
                    }

                    let body = buf.split_to(*length).freeze();
                    let type_code = *type_code;

                    self.state = DecodeState::Envelope;

                    return Ok(Some(RawFrame { type_code, body }));
                }
            }
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut buf = BytesMut::new();
        encode(4, b"eth0 frame bytes", &mut buf).unwrap();

        let mut decoder = Decoder::new();
        let frame = decoder.decode(&mut buf).unwrap().unwrap();

        assert_eq!(frame.type_code, 4);
        assert_eq!(&frame.body[..], b"eth0 frame bytes");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_declared_length_includes_envelope() {
        let mut buf = BytesMut::new();
        encode(8, b"hello", &mut buf).unwrap();
        assert_eq!(
            u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            (ENVELOPE_SIZE + 5) as u32
        );
    }

    #[test]
    fn test_partial_input_one_byte_at_a_time() {
        let mut full = BytesMut::new();
        encode(2, b"goodbye", &mut full).unwrap();

        let mut decoder = Decoder::new();
        let mut buf = BytesMut::new();
        for (i, byte) in full.iter().enumerate() {
            buf.put_u8(*byte);
            let result = decoder.decode(&mut buf).unwrap();
            if i + 1 < full.len() {
                assert!(result.is_none(), "decoded early at byte {}", i);
            } else {
                let frame = result.unwrap();
                assert_eq!(frame.type_code, 2);
                assert_eq!(&frame.body[..], b"goodbye");
            }
        }
    }

    #[test]
    fn test_multiple_frames_in_one_buffer() {
        let mut buf = BytesMut::new();
        encode(8, b"first", &mut buf).unwrap();
        encode(8, b"second", &mut buf).unwrap();

        let mut decoder = Decoder::new();
        let a = decoder.decode(&mut buf).unwrap().unwrap();
        let b = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&a.body[..], b"first");
        assert_eq!(&b.body[..], b"second");
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_length_below_envelope_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(7); // shorter than the envelope itself
        buf.put_u32(1);

        let mut decoder = Decoder::new();
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(CodecError::BadLength(7, _))
        ));
    }

    #[test]
    fn test_empty_body() {
        let mut buf = BytesMut::new();
        encode(128, b"", &mut buf).unwrap();

        let mut decoder = Decoder::new();
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.type_code, 128);
        assert!(frame.body.is_empty());
    }

    #[test]
    fn test_oversized_encode_rejected() {
        let body = vec![0u8; MAX_FRAME_SIZE];
        let mut buf = BytesMut::new();
        assert!(matches!(
            encode(8, &body, &mut buf),
            Err(CodecError::FrameTooLarge(_, _))
        ));
    }
}
