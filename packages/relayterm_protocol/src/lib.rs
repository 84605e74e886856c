//! Wire protocol shared by the relayterm server and clients.
//!
//! A connection carries two kinds of frames: opaque terminal bytes and small
//! JSON control messages. [`FrameCodec`] keeps them apart according to the
//! [`Framing`] negotiated when the connection was opened.

pub mod codec;
pub mod control;

pub use codec::{DecodeError, Frame, FrameCodec, TAG_CONTROL, TAG_DATA, WireMessage, sniff_control};
pub use control::{ConnectParams, ControlMessage, Framing, close_code};
