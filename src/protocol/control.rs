//! Control messages exchanged inside `Rpc` envelopes
//!
//! Control message format:
//! ```text
//! +--------+--------+--------+--------+--------+--------+
//! |  Kind  |  Cmd   |       Request Id (4B, BE)         |
//! +--------+--------+--------+--------+--------+--------+
//! |                     Payload                         |
//! +--------+--------+--------+--------+--------+--------+
//! ```
//!
//! String fields inside payload bodies are encoded as a 2-byte big endian
//! length followed by UTF-8 bytes.

use super::{ensure, ProtocolError, STATUS_SUCCESS};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Control message header size in bytes
pub const CONTROL_HEADER_SIZE: usize = 6;

/// Request or response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlKind {
    Request = 1,
    Response = 2,
}

impl TryFrom<u8> for ControlKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ControlKind::Request),
            2 => Ok(ControlKind::Response),
            _ => Err(ProtocolError::InvalidMessageType(value)),
        }
    }
}

/// Control operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlCommand {
    Login = 11,
    BuildChannel = 12,
}

impl TryFrom<u8> for ControlCommand {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            11 => Ok(ControlCommand::Login),
            12 => Ok(ControlCommand::BuildChannel),
            _ => Err(ProtocolError::UnknownCommand(value)),
        }
    }
}

/// A control request or response, correlated by `id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub kind: ControlKind,
    pub cmd: ControlCommand,
    /// Request id, echoed unchanged in the response
    pub id: u32,
    pub payload: Bytes,
}

impl ControlMessage {
    pub fn request(cmd: ControlCommand, id: u32, payload: Bytes) -> Self {
        Self {
            kind: ControlKind::Request,
            cmd,
            id,
            payload,
        }
    }

    /// Build the response to this request
    pub fn response(&self, payload: Bytes) -> Self {
        Self {
            kind: ControlKind::Response,
            cmd: self.cmd,
            id: self.id,
            payload,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CONTROL_HEADER_SIZE + self.payload.len());
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.cmd as u8);
        buf.put_u32(self.id);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        ensure(&buf, CONTROL_HEADER_SIZE)?;

        let kind = ControlKind::try_from(buf.get_u8())?;
        let cmd = ControlCommand::try_from(buf.get_u8())?;
        let id = buf.get_u32();

        Ok(Self {
            kind,
            cmd,
            id,
            payload: buf,
        })
    }
}

fn put_string(buf: &mut BytesMut, value: &str) -> Result<(), ProtocolError> {
    if value.len() > u16::MAX as usize {
        return Err(ProtocolError::MessageTooLarge(value.len()));
    }
    buf.put_u16(value.len() as u16);
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

fn get_string(buf: &mut Bytes) -> Result<String, ProtocolError> {
    ensure(buf, 2)?;
    let len = buf.get_u16() as usize;
    ensure(buf, len)?;
    let raw = buf.split_to(len);
    Ok(String::from_utf8(raw.to_vec())?)
}

fn get_u32(buf: &mut Bytes) -> Result<u32, ProtocolError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_i32(buf: &mut Bytes) -> Result<i32, ProtocolError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

/// Login request body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    pub name: String,
    pub pwd: String,
}

impl LoginRequest {
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.name)?;
        put_string(&mut buf, &self.pwd)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        let name = get_string(&mut buf)?;
        let pwd = get_string(&mut buf)?;
        Ok(Self { name, pwd })
    }
}

/// Generic status response body (used by login)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommonResponse {
    pub code: i32,
    pub msg: String,
}

impl CommonResponse {
    pub fn is_success(&self) -> bool {
        self.code == STATUS_SUCCESS
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        buf.put_i32(self.code);
        put_string(&mut buf, &self.msg)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        let code = get_i32(&mut buf)?;
        let msg = get_string(&mut buf)?;
        Ok(Self { code, msg })
    }
}

/// Channel setup request body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildChannelRequest {
    /// Destination as `host:port`
    pub addr: String,
    pub trace_id: String,
}

impl BuildChannelRequest {
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.addr)?;
        put_string(&mut buf, &self.trace_id)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        let addr = get_string(&mut buf)?;
        let trace_id = get_string(&mut buf)?;
        Ok(Self { addr, trace_id })
    }
}

/// Channel setup response body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildChannelResponse {
    pub channel_id: u32,
    pub code: i32,
    pub msg: String,
}

impl BuildChannelResponse {
    pub fn is_success(&self) -> bool {
        self.code == STATUS_SUCCESS
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        buf.put_u32(self.channel_id);
        buf.put_i32(self.code);
        put_string(&mut buf, &self.msg)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        let channel_id = get_u32(&mut buf)?;
        let code = get_i32(&mut buf)?;
        let msg = get_string(&mut buf)?;
        Ok(Self {
            channel_id,
            code,
            msg,
        })
    }
}
