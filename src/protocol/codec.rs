//! Protocol codec for decoding frames
//!
//! Two entry points share one parser:
//! - [`decode_all`] for a buffer that must hold whole frames only
//! - [`FrameDecoder`] for a TCP byte stream delivered in arbitrary chunks

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use super::{opcode, Frame};

/// Maximum string length in UTF-16 code units (TEXT, NAME, NAME_CONFLICT)
pub const MAX_STRING_UNITS: usize = 64 * 1024;

/// Maximum host length in a PEER_ADVERT frame
pub const MAX_HOST_LEN: usize = 255;

/// Maximum VOICE payload (1 MiB)
pub const MAX_VOICE_BYTES: usize = 1024 * 1024;

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Short frame: opcode {opcode:#04x} needs {needed} bytes, {available} available")]
    ShortFrame {
        opcode: u8,
        needed: usize,
        available: usize,
    },

    #[error("Unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error("Malformed frame: {0}")]
    Malformed(&'static str),

    #[error("Field too large: {len} (max: {max})")]
    TooLarge { len: usize, max: usize },
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Outcome of parsing the front of a buffer
enum Parsed {
    /// A whole frame and the number of bytes it occupied
    Complete(Frame, usize),
    /// The buffer ends inside a frame that needs `needed` bytes in total
    Incomplete { opcode: u8, needed: usize },
}

/// Bounds-checked big-endian reader over a borrowed buffer
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let buf = self.buf;
        let slice = &buf[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn i32(&mut self) -> Option<i32> {
        self.take(4).map(|mut b| b.get_i32())
    }
}

/// Validate a declared length field
fn checked_len(raw: i32, max: usize) -> CodecResult<usize> {
    if raw < 0 {
        return Err(CodecError::Malformed("negative length"));
    }
    let len = raw as usize;
    if len > max {
        return Err(CodecError::TooLarge { len, max });
    }
    Ok(len)
}

fn checked_port(raw: i32) -> CodecResult<u16> {
    u16::try_from(raw).map_err(|_| CodecError::Malformed("port out of range"))
}

/// Parse one frame from the front of `buf`
fn parse(buf: &[u8]) -> CodecResult<Parsed> {
    let mut r = Reader::new(buf);
    let Some(op) = r.u8() else {
        return Ok(Parsed::Incomplete { opcode: 0, needed: 1 });
    };

    // Short-circuit helper: report how many bytes the frame needs so far
    macro_rules! need {
        ($expr:expr, $needed:expr) => {
            match $expr {
                Some(v) => v,
                None => {
                    return Ok(Parsed::Incomplete {
                        opcode: op,
                        needed: $needed,
                    })
                }
            }
        };
    }

    let frame = match op {
        opcode::TEXT | opcode::NAME | opcode::NAME_CONFLICT => {
            let units = checked_len(need!(r.i32(), 5), MAX_STRING_UNITS)?;
            let raw = need!(r.take(units * 2), 5 + units * 2);
            let text = decode_utf16(raw)?;
            match op {
                opcode::TEXT => Frame::Text(text),
                opcode::NAME => Frame::Name(text),
                _ => Frame::NameConflict(text),
            }
        }
        opcode::PORT_ACK => Frame::PortAck(checked_port(need!(r.i32(), 5))?),
        opcode::PEER_ADVERT => {
            let len = checked_len(need!(r.i32(), 5), MAX_HOST_LEN)?;
            let raw = need!(r.take(len), 5 + len);
            let host = std::str::from_utf8(raw)
                .map_err(|_| CodecError::Malformed("host is not UTF-8"))?
                .to_string();
            let port = checked_port(need!(r.i32(), 9 + len))?;
            Frame::PeerAdvert { host, port }
        }
        opcode::PING => Frame::Ping,
        opcode::PONG => Frame::Pong,
        opcode::VOICE => {
            let len = checked_len(need!(r.i32(), 5), MAX_VOICE_BYTES)?;
            let raw = need!(r.take(len), 5 + len);
            Frame::Voice(Bytes::copy_from_slice(raw))
        }
        other => return Err(CodecError::UnknownOpcode(other)),
    };

    Ok(Parsed::Complete(frame, r.pos))
}

fn decode_utf16(raw: &[u8]) -> CodecResult<String> {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| CodecError::Malformed("invalid UTF-16"))
}

/// Decode every frame in a buffer that is expected to hold whole frames only
///
/// Fails with [`CodecError::ShortFrame`] when a declared length runs past the
/// end of the buffer.
pub fn decode_all(mut buf: &[u8]) -> CodecResult<Vec<Frame>> {
    let mut frames = Vec::new();
    while !buf.is_empty() {
        match parse(buf)? {
            Parsed::Complete(frame, used) => {
                frames.push(frame);
                buf = &buf[used..];
            }
            Parsed::Incomplete { opcode, needed } => {
                return Err(CodecError::ShortFrame {
                    opcode,
                    needed,
                    available: buf.len(),
                });
            }
        }
    }
    Ok(frames)
}

/// Reassembles frames from a byte stream that arrives in arbitrary chunks
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
        }
    }

    /// Append freshly read bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Attempt to decode the next frame
    /// Returns Ok(None) if more data is needed
    pub fn next_frame(&mut self) -> CodecResult<Option<Frame>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        match parse(&self.buf)? {
            Parsed::Complete(frame, used) => {
                self.buf.advance(used);
                Ok(Some(frame))
            }
            Parsed::Incomplete { .. } => Ok(None),
        }
    }

    /// Bytes of an unfinished frame still buffered
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Describe the unfinished frame, if any, as a short-frame error
    pub fn finish(&self) -> CodecResult<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        match parse(&self.buf)? {
            Parsed::Complete(..) => Ok(()),
            Parsed::Incomplete { opcode, needed } => Err(CodecError::ShortFrame {
                opcode,
                needed,
                available: self.buf.len(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let bytes = frame.to_bytes();
        let mut frames = decode_all(&bytes).unwrap();
        assert_eq!(frames.len(), 1);
        frames.remove(0)
    }

    #[test]
    fn test_string_frames_roundtrip() {
        for len in [0usize, 1, 2, 255, 4096, 10_000] {
            let text: String = "aé\u{1F600}".chars().cycle().take(len).collect();
            // Keep the code unit count at or under the length being exercised
            let text: String = text
                .chars()
                .scan(0usize, |units, c| {
                    *units += c.len_utf16();
                    (*units <= len).then_some(c)
                })
                .collect();

            assert_eq!(roundtrip(Frame::Text(text.clone())), Frame::Text(text.clone()));
            assert_eq!(roundtrip(Frame::Name(text.clone())), Frame::Name(text.clone()));
            assert_eq!(
                roundtrip(Frame::NameConflict(text.clone())),
                Frame::NameConflict(text)
            );
        }
    }

    #[test]
    fn test_multiple_frames() {
        let frames = vec![
            Frame::Name("alice".to_string()),
            Frame::PortAck(9119),
            Frame::Ping,
            Frame::PeerAdvert {
                host: "192.168.1.4".to_string(),
                port: 4841,
            },
            Frame::Voice(Bytes::from_static(&[1, 2, 3, 4])),
            Frame::Pong,
        ];

        let mut buf = BytesMut::new();
        for frame in &frames {
            frame.encode(&mut buf);
        }

        assert_eq!(decode_all(&buf).unwrap(), frames);
    }

    #[test]
    fn test_empty_buffer() {
        assert!(decode_all(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_short_frame() {
        let mut bytes = Frame::Text("hello".to_string()).to_bytes().to_vec();
        bytes.truncate(7);

        let err = decode_all(&bytes).unwrap_err();
        assert_eq!(
            err,
            CodecError::ShortFrame {
                opcode: opcode::TEXT,
                needed: 15,
                available: 7,
            }
        );
    }

    #[test]
    fn test_short_peer_advert() {
        // Declares a 40 byte host but carries three
        let bytes = [0x1D, 0, 0, 0, 40, b'a', b'b', b'c'];
        assert!(matches!(
            decode_all(&bytes),
            Err(CodecError::ShortFrame { opcode: 0x1D, .. })
        ));
    }

    #[test]
    fn test_oversized_host_rejected() {
        let bytes = [0x1D, 0, 0, 0x10, 0, b'a'];
        assert_eq!(
            decode_all(&bytes).unwrap_err(),
            CodecError::TooLarge {
                len: 4096,
                max: MAX_HOST_LEN
            }
        );
    }

    #[test]
    fn test_negative_length_rejected() {
        let bytes = [0x1A, 0xFF, 0xFF, 0xFF, 0xFF];
        assert!(matches!(decode_all(&bytes), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_unknown_opcode() {
        let bytes = [0x1E, 0x7F];
        assert_eq!(decode_all(&bytes).unwrap_err(), CodecError::UnknownOpcode(0x7F));
    }

    #[test]
    fn test_port_out_of_range() {
        let mut bytes = vec![0x1C];
        bytes.extend_from_slice(&70_000i32.to_be_bytes());
        assert!(matches!(decode_all(&bytes), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_invalid_utf16() {
        // Lone high surrogate
        let bytes = [0x1B, 0, 0, 0, 1, 0xD8, 0x00];
        assert!(matches!(decode_all(&bytes), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_decoder_reassembles_split_frames() {
        let frames = vec![
            Frame::Text("hello there".to_string()),
            Frame::PortAck(9119),
            Frame::Voice(Bytes::from(vec![7u8; 300])),
        ];
        let mut wire = BytesMut::new();
        for frame in &frames {
            frame.encode(&mut wire);
        }

        // Feed in uneven chunks, including one byte at a time
        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        let mut offset = 0;
        for size in [1usize, 1, 3, 7, 2, 64, 5].iter().cycle() {
            if offset >= wire.len() {
                break;
            }
            let end = (offset + size).min(wire.len());
            decoder.extend(&wire[offset..end]);
            offset = end;
            while let Some(frame) = decoder.next_frame().unwrap() {
                decoded.push(frame);
            }
        }

        assert_eq!(decoded, frames);
        assert_eq!(decoder.buffered(), 0);
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn test_decoder_reports_unfinished_frame() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0x21, 0, 0, 0, 10, 1, 2]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        assert!(matches!(
            decoder.finish(),
            Err(CodecError::ShortFrame { opcode: 0x21, needed: 15, available: 7 })
        ));
    }

    #[test]
    fn test_decoder_fails_fast_on_garbage() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0x1D, 0x7F, 0xFF, 0xFF, 0xFF]);
        assert!(matches!(decoder.next_frame(), Err(CodecError::TooLarge { .. })));
    }
}
