//! CT wire message layout
//!
//! # Purpose
//! Defines the two-word message header shared by both ring directions and
//! the codec for it. The header is the bit-exact contract between host and
//! firmware; the payload is an opaque sequence of 32-bit words.
//!
//! # Layout
//! ```text
//! word 0: [31:24] flags      [23:0] action code
//! word 1: [31:16] payload length (words)   [15:0] fence (request id)
//! ```
//! A word equal to [`WRAP_MARKER`] is never a valid header word 0; writers
//! pad the tail of a ring with it when a message would not fit contiguously,
//! and readers skip marker runs transparently.

use bitflags::bitflags;
use static_assertions::const_assert;

use crate::{CtError, Result};

/// Header size in 32-bit words.
pub const HEADER_WORDS: u32 = 2;

/// Padding word written into unusable tail space of a ring.
///
/// Flags byte 0xFF is not a valid flag combination, so a reader can always
/// distinguish a marker from a committed header.
pub const WRAP_MARKER: u32 = 0xFFFF_FFFF;

/// Widest action code representable in the header (24 bits).
pub const MAX_ACTION: u32 = 0x00FF_FFFF;

/// Widest payload length representable in the header (16 bits).
pub const MAX_PAYLOAD_WORDS: usize = 0xFFFF;

// The wrap marker's flags byte must never decode as a valid flag set.
const_assert!((WRAP_MARKER >> 24) as u8 & !MsgFlags::all().bits() != 0);

bitflags! {
    /// Message class bits. Exactly one of REQUEST/RESPONSE/EVENT is set on
    /// every valid header; HANDLED is a host-local annotation the fast path
    /// stamps onto in-ring events it has already delivered.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsgFlags: u8 {
        /// Host-originated action, fw may reply if a fence is registered.
        const REQUEST  = 1 << 0;
        /// Firmware reply correlated by fence.
        const RESPONSE = 1 << 1;
        /// Unsolicited firmware notification.
        const EVENT    = 1 << 2;
        /// Already delivered by the fast path; the dispatch loop skips it.
        const HANDLED  = 1 << 7;
    }
}

impl MsgFlags {
    /// The protocol class bits, ignoring host-local annotations.
    pub fn class(self) -> MsgFlags {
        self & (MsgFlags::REQUEST | MsgFlags::RESPONSE | MsgFlags::EVENT)
    }
}

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub flags: MsgFlags,
    /// Opaque action code (24 bits used).
    pub action: u32,
    /// Payload length in words, excluding the header.
    pub len: u16,
    /// Request id correlating a response to its request. 0 means untracked.
    pub fence: u16,
}

impl MsgHeader {
    pub fn new(flags: MsgFlags, action: u32, len: u16, fence: u16) -> Self {
        debug_assert!(action <= MAX_ACTION);
        Self {
            flags,
            action: action & MAX_ACTION,
            len,
            fence,
        }
    }

    /// Total message footprint on the ring, header included.
    pub fn msg_words(&self) -> u32 {
        HEADER_WORDS + u32::from(self.len)
    }

    pub fn encode(&self) -> [u32; 2] {
        let w0 = (u32::from(self.flags.bits()) << 24) | (self.action & MAX_ACTION);
        let w1 = (u32::from(self.len) << 16) | u32::from(self.fence);
        [w0, w1]
    }

    /// Decode a header from two ring words.
    ///
    /// Rejects wrap markers, unknown flag bits, and headers that do not
    /// carry exactly one protocol class bit.
    pub fn decode(w0: u32, w1: u32) -> Result<Self> {
        if w0 == WRAP_MARKER {
            return Err(CtError::Protocol("header word is a wrap marker".into()));
        }

        let raw_flags = (w0 >> 24) as u8;
        let flags = MsgFlags::from_bits(raw_flags).ok_or_else(|| {
            CtError::Protocol(format!("unknown header flag bits {raw_flags:#04x}"))
        })?;

        if flags.class().bits().count_ones() != 1 {
            return Err(CtError::Protocol(format!(
                "invalid message class {:#04x}",
                flags.bits()
            )));
        }

        Ok(Self {
            flags,
            action: w0 & MAX_ACTION,
            len: (w1 >> 16) as u16,
            fence: (w1 & 0xFFFF) as u16,
        })
    }
}
