//! Envelope: the multiplexing unit carried by every frame
//!
//! Envelope format:
//! ```text
//! +--------+--------+--------+--------+--------+
//! |  Cmd   |          Id (4B, BE)              |
//! +--------+--------+--------+--------+--------+
//! |                  Data                      |
//! +--------+--------+--------+--------+--------+
//! ```

use super::{encode_frame, ensure, ProtocolError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Envelope header size in bytes
pub const ENVELOPE_HEADER_SIZE: usize = 5;

/// Id carried by ping and pong envelopes
pub const HEARTBEAT_ID: u32 = 1;

/// Envelope commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EnvelopeCmd {
    /// Heartbeat request
    Ping = 5,
    /// Heartbeat response
    Pong = 6,
    /// Control message (login, channel setup)
    Rpc = 11,
    /// Virtual channel data
    Flow = 12,
}

impl TryFrom<u8> for EnvelopeCmd {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            5 => Ok(EnvelopeCmd::Ping),
            6 => Ok(EnvelopeCmd::Pong),
            11 => Ok(EnvelopeCmd::Rpc),
            12 => Ok(EnvelopeCmd::Flow),
            _ => Err(ProtocolError::InvalidMessageType(value)),
        }
    }
}

/// A single message on the physical connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Channel id for `Flow`, `HEARTBEAT_ID` for ping/pong, 0 for `Rpc`
    pub id: u32,
    pub cmd: EnvelopeCmd,
    pub data: Bytes,
}

impl Envelope {
    pub fn ping() -> Self {
        Self {
            id: HEARTBEAT_ID,
            cmd: EnvelopeCmd::Ping,
            data: Bytes::new(),
        }
    }

    pub fn pong() -> Self {
        Self {
            id: HEARTBEAT_ID,
            cmd: EnvelopeCmd::Pong,
            data: Bytes::new(),
        }
    }

    /// Wrap an encoded control message
    pub fn rpc(data: Bytes) -> Self {
        Self {
            id: 0,
            cmd: EnvelopeCmd::Rpc,
            data,
        }
    }

    /// Wrap channel data addressed to `channel_id`
    pub fn flow(channel_id: u32, data: Bytes) -> Self {
        Self {
            id: channel_id,
            cmd: EnvelopeCmd::Flow,
            data,
        }
    }

    /// Encode envelope to bytes (without the frame length prefix)
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(ENVELOPE_HEADER_SIZE + self.data.len());
        buf.put_u8(self.cmd as u8);
        buf.put_u32(self.id);
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Encode envelope as a complete frame ready for the physical stream
    pub fn to_frame(&self) -> Result<Bytes, ProtocolError> {
        encode_frame(&self.encode())
    }

    /// Decode envelope from a frame payload
    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        ensure(&buf, ENVELOPE_HEADER_SIZE)?;

        let cmd = EnvelopeCmd::try_from(buf.get_u8())?;
        let id = buf.get_u32();

        Ok(Self { id, cmd, data: buf })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_envelope() {
        let original = Envelope::flow(42, Bytes::from_static(b"payload"));
        let decoded = Envelope::decode(original.encode().freeze()).unwrap();

        assert_eq!(decoded.cmd, EnvelopeCmd::Flow);
        assert_eq!(decoded.id, 42);
        assert_eq!(&decoded.data[..], b"payload");
    }

    #[test]
    fn test_heartbeat_envelopes() {
        let ping = Envelope::decode(Envelope::ping().encode().freeze()).unwrap();
        assert_eq!(ping.cmd, EnvelopeCmd::Ping);
        assert_eq!(ping.id, HEARTBEAT_ID);
        assert!(ping.data.is_empty());

        let encoded = Envelope::pong().encode();
        assert_eq!(encoded.len(), ENVELOPE_HEADER_SIZE);
        assert_eq!(encoded[0], 6);
    }

    #[test]
    fn test_unknown_command() {
        let buf = Bytes::from_static(&[0x63, 0, 0, 0, 1]);
        assert!(matches!(
            Envelope::decode(buf),
            Err(ProtocolError::InvalidMessageType(0x63))
        ));
    }

    #[test]
    fn test_short_header() {
        let buf = Bytes::from_static(&[12, 0, 0]);
        assert!(matches!(
            Envelope::decode(buf),
            Err(ProtocolError::Truncated { needed: 5, available: 3 })
        ));
    }

    #[test]
    fn test_frame_carries_envelope() {
        let frame = Envelope::rpc(Bytes::from_static(b"ctl")).to_frame().unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, ENVELOPE_HEADER_SIZE + 3);
        assert_eq!(frame[4], EnvelopeCmd::Rpc as u8);
    }
}
