use thiserror::Error;
use tracing::debug;

use crate::control::{ControlMessage, Framing};

/// First byte of a tagged data frame.
pub const TAG_DATA: u8 = 0x00;
/// First byte of a tagged control frame.
pub const TAG_CONTROL: u8 = 0x01;

/// One WebSocket message, independent of any particular WebSocket crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// A decoded unit of the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(ControlMessage),
    /// Terminal bytes, passed through untouched.
    Data(Vec<u8>),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty frame")]
    EmptyFrame,

    #[error("unknown frame tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("malformed control message: {0}")]
    MalformedControl(#[from] serde_json::Error),

    #[error("text frame on a tagged connection")]
    UnexpectedText,
}

/// Encodes and decodes frames for one connection's negotiated framing.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec {
    framing: Framing,
}

impl FrameCodec {
    pub fn new(framing: Framing) -> Self {
        Self { framing }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Encode a frame. Control messages always become one complete message.
    pub fn encode(&self, frame: &Frame) -> Result<WireMessage, serde_json::Error> {
        match (self.framing, frame) {
            (Framing::Tagged, Frame::Data(bytes)) => {
                let mut out = Vec::with_capacity(bytes.len() + 1);
                out.push(TAG_DATA);
                out.extend_from_slice(bytes);
                Ok(WireMessage::Binary(out))
            }
            (Framing::Tagged, Frame::Control(msg)) => {
                let mut out = vec![TAG_CONTROL];
                serde_json::to_writer(&mut out, msg)?;
                Ok(WireMessage::Binary(out))
            }
            (Framing::Legacy, Frame::Data(bytes)) => Ok(WireMessage::Binary(bytes.clone())),
            (Framing::Legacy, Frame::Control(msg)) => {
                Ok(WireMessage::Text(serde_json::to_string(msg)?))
            }
        }
    }

    pub fn decode(&self, message: WireMessage) -> Result<Frame, DecodeError> {
        match self.framing {
            Framing::Tagged => decode_tagged(message),
            Framing::Legacy => Ok(decode_legacy(message)),
        }
    }
}

fn decode_tagged(message: WireMessage) -> Result<Frame, DecodeError> {
    let mut bytes = match message {
        WireMessage::Binary(bytes) => bytes,
        WireMessage::Text(_) => return Err(DecodeError::UnexpectedText),
    };
    let tag = *bytes.first().ok_or(DecodeError::EmptyFrame)?;
    match tag {
        TAG_DATA => {
            bytes.remove(0);
            Ok(Frame::Data(bytes))
        }
        TAG_CONTROL => Ok(Frame::Control(serde_json::from_slice(&bytes[1..])?)),
        other => Err(DecodeError::UnknownTag(other)),
    }
}

fn decode_legacy(message: WireMessage) -> Frame {
    match message {
        WireMessage::Binary(bytes) => Frame::Data(bytes),
        WireMessage::Text(text) => match sniff_control(&text) {
            Some(msg) => Frame::Control(msg),
            None => {
                if text.trim_start().starts_with('{') {
                    debug!(
                        len = text.len(),
                        "Text frame looks like JSON but is not a control message, treating as input"
                    );
                }
                Frame::Data(text.into_bytes())
            }
        },
    }
}

/// Recognize a legacy text frame as a control message.
///
/// Only a complete JSON object with a known `type` and every required field
/// qualifies, and it must carry no keys the message would drop. Anything else
/// is terminal input.
pub fn sniff_control(text: &str) -> Option<ControlMessage> {
    let trimmed = text.trim();
    if !trimmed.starts_with('{') || !trimmed.ends_with('}') {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
    let msg: ControlMessage = serde_json::from_value(value.clone()).ok()?;
    let canonical = serde_json::to_value(&msg).ok()?;
    let (input, canonical) = (value.as_object()?, canonical.as_object()?);
    // Omitted optional fields are fine; extra or altered ones are not.
    input
        .iter()
        .all(|(key, v)| canonical.get(key) == Some(v))
        .then_some(msg)
}
