//! Frame envelope encoding and incremental decoding.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the frame header: kind byte plus payload length.
const HEADER_LEN: usize = 1 + 4;

/// Maximum accepted payload length for a single frame.
///
/// Anything larger is treated as a corrupt stream rather than an
/// allocation request.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Errors produced while decoding the frame envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The kind byte does not name a known frame kind.
    #[error("unknown frame kind: {0}")]
    UnknownKind(u8),

    /// The declared payload length exceeds [`MAX_FRAME_LEN`].
    #[error("frame payload of {0} bytes exceeds maximum")]
    Oversized(usize),
}

/// Type of stream frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Opaque change data to be applied to local storage.
    Data = 1,
    /// Liveness signal; carries no change data.
    Keepalive = 2,
    /// Marks a consistent point in the change stream.
    Checkpoint = 3,
}

impl FrameKind {
    /// Converts the kind to its wire code.
    #[must_use]
    pub const fn to_code(self) -> u8 {
        self as u8
    }

    /// Converts a wire code to a kind.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Data),
            2 => Some(Self::Keepalive),
            3 => Some(Self::Checkpoint),
            _ => None,
        }
    }
}

/// One decodable unit of server-pushed change data.
///
/// The payload is opaque to this crate; storage adapters decide how to
/// interpret `Data` payloads. `Keepalive` frames usually carry an empty
/// payload but a non-empty one is tolerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind.
    pub kind: FrameKind,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a data frame.
    pub fn data(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Data,
            payload: payload.into(),
        }
    }

    /// Creates an empty keepalive frame.
    pub fn keepalive() -> Self {
        Self {
            kind: FrameKind::Keepalive,
            payload: Bytes::new(),
        }
    }

    /// Creates a checkpoint frame.
    pub fn checkpoint(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Checkpoint,
            payload: payload.into(),
        }
    }

    /// Encodes the frame envelope: `[kind u8][len u32 LE][payload]`.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(self.kind.to_code());
        buf.put_u32_le(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

/// Incremental push-based decoder for the frame envelope.
///
/// Transport adapters feed raw bytes in as they arrive; complete frames
/// are pulled out with [`FrameDecoder::next_frame`]. Partial input is
/// buffered until the rest of the frame arrives.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes from the transport.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Attempts to decode the next complete frame.
    ///
    /// Returns `Ok(None)` when the buffered input does not yet contain a
    /// full frame. A decode error leaves the buffer untouched; the stream
    /// must be considered corrupt from that point on.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let kind_code = self.buf[0];
        let kind = FrameKind::from_code(kind_code).ok_or(FrameError::UnknownKind(kind_code))?;

        let len = u32::from_le_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(FrameError::Oversized(len));
        }

        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(len).freeze();

        Ok(Some(Frame { kind, payload }))
    }

    /// Returns the number of buffered, not-yet-decoded bytes.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
