//! Protocol frame definitions
//!
//! Defines all frames exchanged between connected peers.

use bytes::{BufMut, Bytes, BytesMut};

use super::{opcode, CodecError, CodecResult, MAX_HOST_LEN, MAX_STRING_UNITS, MAX_VOICE_BYTES};

/// All possible peer protocol frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Chat text
    Text(String),

    /// The sender's display name, sent on connect and on every rename
    Name(String),

    /// The sender's listening port
    PortAck(u16),

    /// Gossip about another peer the sender is connected to
    PeerAdvert {
        host: String,
        port: u16,
    },

    /// Keepalive probe
    Ping,

    /// Keepalive answer
    Pong,

    /// The receiver must adopt this name, its announced one was taken
    NameConflict(String),

    /// Opaque voice payload
    Voice(Bytes),
}

impl Frame {
    /// Get the wire opcode
    pub fn opcode(&self) -> u8 {
        match self {
            Frame::Text(_) => opcode::TEXT,
            Frame::Name(_) => opcode::NAME,
            Frame::PortAck(_) => opcode::PORT_ACK,
            Frame::PeerAdvert { .. } => opcode::PEER_ADVERT,
            Frame::Ping => opcode::PING,
            Frame::Pong => opcode::PONG,
            Frame::NameConflict(_) => opcode::NAME_CONFLICT,
            Frame::Voice(_) => opcode::VOICE,
        }
    }

    /// Human-readable frame name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Text(_) => "TEXT",
            Frame::Name(_) => "NAME",
            Frame::PortAck(_) => "PORT_ACK",
            Frame::PeerAdvert { .. } => "PEER_ADVERT",
            Frame::Ping => "PING",
            Frame::Pong => "PONG",
            Frame::NameConflict(_) => "NAME_CONFLICT",
            Frame::Voice(_) => "VOICE",
        }
    }

    /// Append the wire encoding of this frame to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.opcode());
        match self {
            Frame::Text(text) | Frame::Name(text) | Frame::NameConflict(text) => {
                put_utf16(buf, text);
            }
            Frame::PortAck(port) => buf.put_i32(i32::from(*port)),
            Frame::PeerAdvert { host, port } => {
                buf.put_i32(host.len() as i32);
                buf.put_slice(host.as_bytes());
                buf.put_i32(i32::from(*port));
            }
            Frame::Ping | Frame::Pong => {}
            Frame::Voice(data) => {
                buf.put_i32(data.len() as i32);
                buf.put_slice(data);
            }
        }
    }

    /// Check field sizes against the limits receivers decode with
    pub fn validate(&self) -> CodecResult<()> {
        let (len, max) = match self {
            Frame::Text(text) | Frame::Name(text) | Frame::NameConflict(text) => {
                return check_string(text);
            }
            Frame::PeerAdvert { host, .. } => (host.len(), MAX_HOST_LEN),
            Frame::Voice(data) => (data.len(), MAX_VOICE_BYTES),
            Frame::PortAck(_) | Frame::Ping | Frame::Pong => return Ok(()),
        };
        if len > max {
            return Err(CodecError::TooLarge { len, max });
        }
        Ok(())
    }

    /// Encode into a fresh buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Exact number of bytes [`Frame::encode`] writes
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Frame::Text(text) | Frame::Name(text) | Frame::NameConflict(text) => {
                4 + 2 * text.encode_utf16().count()
            }
            Frame::PortAck(_) => 4,
            Frame::PeerAdvert { host, .. } => 4 + host.len() + 4,
            Frame::Ping | Frame::Pong => 0,
            Frame::Voice(data) => 4 + data.len(),
        }
    }
}

/// Check that a string fits in a TEXT, NAME or NAME_CONFLICT frame
pub fn check_string(text: &str) -> CodecResult<()> {
    let len = text.encode_utf16().count();
    if len > MAX_STRING_UNITS {
        return Err(CodecError::TooLarge {
            len,
            max: MAX_STRING_UNITS,
        });
    }
    Ok(())
}

fn put_utf16(buf: &mut BytesMut, text: &str) {
    let len = text.encode_utf16().count();
    buf.reserve(4 + 2 * len);
    buf.put_i32(len as i32);
    for unit in text.encode_utf16() {
        buf.put_u16(unit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcodes() {
        assert_eq!(Frame::Text(String::new()).opcode(), 0x1A);
        assert_eq!(Frame::Pong.opcode(), 0x1F);
        assert_eq!(Frame::Voice(Bytes::new()).opcode(), 0x21);
    }

    #[test]
    fn test_text_layout() {
        let bytes = Frame::Text("hi".to_string()).to_bytes();
        assert_eq!(&bytes[..], &[0x1A, 0, 0, 0, 2, 0, b'h', 0, b'i']);
    }

    #[test]
    fn test_text_counts_code_units() {
        // U+1F600 is a surrogate pair: two code units, four bytes
        let frame = Frame::Name("\u{1F600}".to_string());
        let bytes = frame.to_bytes();
        assert_eq!(&bytes[1..5], &[0, 0, 0, 2]);
        assert_eq!(bytes.len(), frame.encoded_len());
    }

    #[test]
    fn test_validate_matches_decoder_limits() {
        let longest = Frame::Text("a".repeat(MAX_STRING_UNITS));
        assert!(longest.validate().is_ok());
        assert!(crate::protocol::decode_all(&longest.to_bytes()).is_ok());

        let too_long = Frame::Text("a".repeat(MAX_STRING_UNITS + 1));
        assert_eq!(
            too_long.validate(),
            Err(CodecError::TooLarge {
                len: MAX_STRING_UNITS + 1,
                max: MAX_STRING_UNITS
            })
        );
        assert_eq!(
            crate::protocol::decode_all(&too_long.to_bytes()).unwrap_err(),
            too_long.validate().unwrap_err()
        );

        let voice = Frame::Voice(Bytes::from(vec![0u8; MAX_VOICE_BYTES + 1]));
        assert!(matches!(voice.validate(), Err(CodecError::TooLarge { .. })));

        let advert = Frame::PeerAdvert {
            host: "h".repeat(MAX_HOST_LEN + 1),
            port: 9119,
        };
        assert!(matches!(advert.validate(), Err(CodecError::TooLarge { .. })));
        assert!(Frame::Ping.validate().is_ok());
    }

    #[test]
    fn test_peer_advert_layout() {
        let frame = Frame::PeerAdvert {
            host: "10.0.0.1".to_string(),
            port: 9119,
        };
        let bytes = frame.to_bytes();
        assert_eq!(bytes[0], 0x1D);
        assert_eq!(&bytes[1..5], &[0, 0, 0, 8]);
        assert_eq!(&bytes[5..13], b"10.0.0.1");
        assert_eq!(&bytes[13..17], &9119i32.to_be_bytes());
        assert_eq!(bytes.len(), frame.encoded_len());
    }
}
