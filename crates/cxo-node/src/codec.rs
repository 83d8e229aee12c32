//! Frame codec: CBOR-encoded [`Envelope`]s.

use bytes::Bytes;

use crate::error::{NodeError, Result};
use crate::messages::Envelope;

/// Upper bound of a decoded frame.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Encode an envelope into a frame.
pub fn encode(env: &Envelope) -> Result<Bytes> {
    let mut buf = Vec::with_capacity(64);
    ciborium::into_writer(env, &mut buf).map_err(|e| NodeError::Codec(e.to_string()))?;
    Ok(Bytes::from(buf))
}

/// Decode a frame.
pub fn decode(frame: &[u8]) -> Result<Envelope> {
    if frame.len() > MAX_FRAME {
        return Err(NodeError::Codec(format!("frame of {} bytes", frame.len())));
    }
    ciborium::from_reader(frame).map_err(|e| NodeError::Codec(e.to_string()))
}
