//! End-to-end path probe extension.
//!
//! Carried on liveness probes and their replies. One line on the wire:
//! `[flags][probe id BE u32]`, where flag bit 0 marks a reply.

use super::codec::{ExtClass, Extension, ExtensionBuf, ExtensionError};
use crate::core::EXT_PATH_PROBE;

const FLAG_REPLY: u8 = 0x01;

/// A probe request or reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathProbe {
    /// Identifier echoed by the reply.
    pub id: u32,
    /// Whether this is the reply.
    pub reply: bool,
}

impl PathProbe {
    /// A new request.
    pub fn request(id: u32) -> Self {
        Self { id, reply: false }
    }

    /// The reply to this request.
    pub fn to_reply(self) -> Self {
        Self {
            id: self.id,
            reply: true,
        }
    }

    /// Encode as an extension.
    pub fn encode(self) -> Result<ExtensionBuf, ExtensionError> {
        let mut payload = Vec::with_capacity(5);
        payload.push(if self.reply { FLAG_REPLY } else { 0 });
        payload.extend_from_slice(&self.id.to_be_bytes());
        ExtensionBuf::new(ExtClass::EndToEnd, EXT_PATH_PROBE, payload)
    }

    /// Decode from a parsed extension.
    pub fn decode(ext: &Extension<'_>) -> Option<Self> {
        if !ext.is(ExtClass::EndToEnd, EXT_PATH_PROBE) {
            return None;
        }
        Self::from_payload(ext.payload())
    }

    /// Decode from an owned extension.
    pub fn decode_buf(ext: &ExtensionBuf) -> Option<Self> {
        if !ext.is(ExtClass::EndToEnd, EXT_PATH_PROBE) {
            return None;
        }
        Self::from_payload(ext.payload())
    }

    fn from_payload(payload: &[u8]) -> Option<Self> {
        let bytes = payload.get(..5)?;
        Some(Self {
            reply: bytes[0] & FLAG_REPLY != 0,
            id: u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
        })
    }
}
