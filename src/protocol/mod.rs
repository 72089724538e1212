//! Broker wire protocol
//!
//! Text frames in the STOMP 1.2 dialect: a command line, `name:value` headers,
//! a blank line, an optional body and a NUL terminator. Bare EOLs between
//! frames are heart-beats.

pub mod codec;
pub mod frame;
pub mod heartbeat;

pub use codec::{Decoded, FrameCodec, ProtocolError, DEFAULT_MAX_FRAME_BYTES};
pub use frame::{headers, Command, Frame, PROTOCOL_VERSION};
pub use heartbeat::{HeartBeat, NegotiatedHeartBeat};
