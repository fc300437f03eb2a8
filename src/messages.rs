//! Envelope carried by every datagram.
//!
//! Wire format:
//! ```text
//! ┌─────────┬──────────────┬──────────────────────────┐
//! │ Tag (1B)│ Length (2B)  │ postcard payload (N B)   │
//! │         │ LE u16       │                          │
//! └─────────┴──────────────┴──────────────────────────┘
//! ```
//!
//! The tag comes first so a receiver can skip kinds it does not know.
//! Bytes past the declared length are ignored, as are trailing payload
//! fields an older decoder has no slot for.

use serde_derive::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::model::{Device, Portal, Settings, Switch};

/// Largest payload a frame may carry. Keeps every datagram well under a
/// typical MTU.
pub const MAX_PAYLOAD: usize = 1024;

const HEADER_SIZE: usize = 3;

const TAG_PING: u8 = 1;
const TAG_DEVICE: u8 = 2;
const TAG_SETTINGS: u8 = 3;
const TAG_SWITCH: u8 = 4;
const TAG_PORTAL: u8 = 5;

/// "Who's there", or with `respond` set, "please send me your state".
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ping {
    pub respond: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    Ping(Ping),
    Device(Device),
    Settings(Settings),
    Switch(Switch),
    Portal(Portal),
}

impl Msg {
    fn tag(&self) -> u8 {
        match self {
            Msg::Ping(_) => TAG_PING,
            Msg::Device(_) => TAG_DEVICE,
            Msg::Settings(_) => TAG_SETTINGS,
            Msg::Switch(_) => TAG_SWITCH,
            Msg::Portal(_) => TAG_PORTAL,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Ping(_) => "ping",
            Msg::Device(_) => "device",
            Msg::Settings(_) => "settings",
            Msg::Switch(_) => "switch",
            Msg::Portal(_) => "portal",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let payload = match self {
            Msg::Ping(ping) => postcard::to_allocvec(ping)?,
            Msg::Device(device) => postcard::to_allocvec(device)?,
            Msg::Settings(settings) => postcard::to_allocvec(settings)?,
            Msg::Switch(switch) => postcard::to_allocvec(switch)?,
            Msg::Portal(portal) => postcard::to_allocvec(portal)?,
        };
        if payload.len() > MAX_PAYLOAD {
            return Err(CodecError::Oversized(payload.len()));
        }

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        frame.push(self.tag());
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    pub fn decode(frame: &[u8]) -> Result<Msg, CodecError> {
        if frame.len() < HEADER_SIZE {
            return Err(CodecError::MissingHeader);
        }
        let tag = frame[0];
        let expected = u16::from_le_bytes([frame[1], frame[2]]) as usize;
        let body = &frame[HEADER_SIZE..];
        if body.len() < expected {
            return Err(CodecError::Truncated {
                expected,
                actual: body.len(),
            });
        }
        let payload = &body[..expected];

        let msg = match tag {
            TAG_PING => Msg::Ping(postcard::from_bytes(payload)?),
            TAG_DEVICE => Msg::Device(postcard::from_bytes(payload)?),
            TAG_SETTINGS => Msg::Settings(postcard::from_bytes(payload)?),
            TAG_SWITCH => Msg::Switch(postcard::from_bytes(payload)?),
            TAG_PORTAL => Msg::Portal(postcard::from_bytes(payload)?),
            other => return Err(CodecError::UnknownTag(other)),
        };
        Ok(msg)
    }
}
