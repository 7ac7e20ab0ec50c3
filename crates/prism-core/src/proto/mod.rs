//! Wire protocol: framing and message shapes
//!
//! Agents speak length-prefixed JSON over a long-lived TCP connection.
//! [`codec`] owns the byte-level framing; [`message`] owns the JSON shapes
//! exchanged inside frames.

pub mod codec;
pub mod message;

pub use codec::{FrameCodec, FrameError, MAX_FRAME_LEN};
pub use message::{ClientMessage, ErrorCode, ProtocolViolation, ServerReply};
