//! Wire encoding for replica messages.
//!
//! A frame is one version byte followed by the bincode encoding of the
//! sender and the message.

use keel_core::OutboundMessage;
use keel_types::NodeId;

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("empty frame")]
    Empty,

    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),

    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),
}

pub fn encode(from: NodeId, message: &OutboundMessage) -> Result<Vec<u8>, CodecError> {
    let mut frame = vec![WIRE_VERSION];
    bincode::serialize_into(&mut frame, &(from, message))?;
    Ok(frame)
}

pub fn decode(frame: &[u8]) -> Result<(NodeId, OutboundMessage), CodecError> {
    let (&version, body) = frame.split_first().ok_or(CodecError::Empty)?;
    if version != WIRE_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    Ok(bincode::deserialize(body)?)
}
