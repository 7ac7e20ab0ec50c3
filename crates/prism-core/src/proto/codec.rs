//! Length-prefixed JSON frame codec
//!
//! Wire format per frame: a 4-byte unsigned big-endian length `N` followed
//! by `N` bytes of UTF-8 JSON. Frames above [`MAX_FRAME_LEN`] are a
//! protocol fault. Partial reads accumulate in the connection's buffer;
//! `decode` returns `Ok(None)` until a whole frame is available, so no
//! partial frame is ever dispatched.
//!
//! The codec is per-connection state: a [`FrameCodec`] lives and dies with
//! one socket and is never reused across connections.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::message::ServerReply;

/// Maximum frame body size in bytes
pub const MAX_FRAME_LEN: usize = 65_536;

/// Size of the big-endian length prefix
const LENGTH_PREFIX_LEN: usize = 4;

/// Framing faults; all of them are terminal for the connection
#[derive(Error, Debug)]
pub enum FrameError {
    /// Declared frame length exceeds the protocol limit
    #[error("frame length {len} exceeds the {max} byte limit")]
    Oversize { len: usize, max: usize },

    /// Frame body is not valid JSON
    #[error("frame body is not valid JSON: {0}")]
    MalformedJson(#[source] serde_json::Error),

    /// Socket-level I/O error
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Codec for one connection's frame stream
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = serde_json::Value;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX_LEN]);
        let len = u32::from_be_bytes(prefix) as usize;

        if len > MAX_FRAME_LEN {
            return Err(FrameError::Oversize {
                len,
                max: MAX_FRAME_LEN,
            });
        }

        if src.len() < LENGTH_PREFIX_LEN + len {
            // Reserve the remainder so the next read can complete the frame
            src.reserve(LENGTH_PREFIX_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        let body = src.split_to(len);

        serde_json::from_slice(&body)
            .map(Some)
            .map_err(FrameError::MalformedJson)
    }
}

impl Encoder<ServerReply> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, reply: ServerReply, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(&reply).map_err(FrameError::MalformedJson)?;

        if body.len() > MAX_FRAME_LEN {
            return Err(FrameError::Oversize {
                len: body.len(),
                max: MAX_FRAME_LEN,
            });
        }

        dst.reserve(LENGTH_PREFIX_LEN + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}
