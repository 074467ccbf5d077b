//! Protocol definitions and constants
//!
//! Provides:
//! - Length-delimited frame codec
//! - Envelope (the multiplexing unit, one per frame)
//! - Control messages used for login and channel setup

mod codec;
mod control;
mod envelope;

pub use codec::{encode_frame, read_frame, LENGTH_PREFIX_SIZE};
pub use control::{
    BuildChannelRequest, BuildChannelResponse, CommonResponse, ControlCommand, ControlKind,
    ControlMessage, LoginRequest, CONTROL_HEADER_SIZE,
};
pub use envelope::{Envelope, EnvelopeCmd, ENVELOPE_HEADER_SIZE, HEARTBEAT_ID};

use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("Unknown control command: {0}")]
    UnknownCommand(u8),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Truncated message: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Invalid string field: {0}")]
    InvalidString(#[from] std::string::FromUtf8Error),
}

/// Maximum frame payload size (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1 << 20;

/// Status code carried by successful control responses
pub const STATUS_SUCCESS: i32 = 1;

/// Status code carried by failed control responses
pub const STATUS_FAILURE: i32 = -1;

fn ensure(buf: &[u8], needed: usize) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}
