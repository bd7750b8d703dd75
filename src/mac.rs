//! Building and parsing of the protocol's MAC frames
//!
//! Three frame shapes are used on the air, all little-endian:
//!
//! - blink (a tag announcing itself, broadcast):
//!   `[0xC5] [seq] [source long address: 8] [source short address: 2]`
//! - short MAC frame (the ranging exchange itself):
//!   `[0x41] [0x88] [seq] [PAN id: 2] [destination short: 2]
//!   [source short: 2] [kind] [payload...]`
//! - long MAC frame (the ranging initiation, addressed by long address):
//!   `[0x41] [0x8C] [seq] [PAN id: 2] [destination long: 8]
//!   [source short: 2] [kind]`
//!
//! Decoding filters on the destination address: frames meant for another
//! device yield `None` and must be dropped without further processing.
//! Anything that doesn't match one of the three shapes (wrong control bytes,
//! truncated header) classifies as [`FrameClass::Invalid`] and is likewise
//! dropped by the caller.
//!
//! [`FrameClass::Invalid`]: enum.FrameClass.html#variant.Invalid

use core::convert::TryFrom;
use core::num::Wrapping;

use byte::{BytesExt, LE};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

pub use ieee802154::mac::{ExtendedAddress, PanId, ShortAddress};

use crate::time::LEN_STAMP;

/// First frame-control byte of short and long MAC frames
pub const FC_1: u8 = 0x41;

/// Second frame-control byte of a long MAC frame
pub const FC_2: u8 = 0x8C;

/// Second frame-control byte of a short MAC frame
pub const FC_2_SHORT: u8 = 0x88;

/// Frame-control byte of a blink frame
pub const FC_BLINK: u8 = 0xC5;

/// Header length of a short MAC frame; the message kind byte follows it
pub const SHORT_MAC_LEN: usize = 9;

/// Header length of a long MAC frame; the message kind byte follows it
pub const LONG_MAC_LEN: usize = 15;

/// Total length of a blink frame
pub const BLINK_LEN: usize = 12;

/// Offset of the payload of a short MAC frame, behind the kind byte
pub const SHORT_PAYLOAD: usize = SHORT_MAC_LEN + 1;

/// Length of a RANGE payload: three raw timestamps
pub const RANGE_PAYLOAD_LEN: usize = 3 * LEN_STAMP;

/// Length of a RANGE_REPORT payload: two 4-byte floats
pub const RANGE_REPORT_PAYLOAD_LEN: usize = 8;

/// The message vocabulary of the ranging protocol
///
/// `Poll` through `RangeFailed` travel in short MAC frames, `RangingInit` in
/// a long MAC frame; `Blink` is its own frame shape and the value is only
/// used internally.
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MessageKind {
    /// A tag starts a ranging cycle
    Poll = 0,
    /// The anchor's delayed answer to a poll
    PollAck = 1,
    /// The tag's final message, carrying its three local timestamps
    Range = 2,
    /// The anchor's computed range and RX power, sent back to the tag
    RangeReport = 3,
    /// A tag announcing its presence
    Blink = 4,
    /// An anchor inviting a blinking tag to start ranging
    RangingInit = 5,
    /// The exchange was out of sequence; the tag should start over
    RangeFailed = 255,
}

/// The shape of a received frame, determined from its control bytes
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameClass {
    /// A blink frame
    Blink,
    /// A long MAC frame (ranging initiation)
    LongMac,
    /// A short MAC frame (the ranging exchange)
    ShortMac,
    /// None of the known shapes, or too short for the shape it claims
    Invalid,
}

/// Payload of a RANGE_REPORT message
///
/// Serialized with `ssmarshal`, which lays the two floats out as consecutive
/// little-endian 4-byte values.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[repr(C)]
pub struct RangeReportPayload {
    /// The bias-corrected range, in meters
    pub range_m: f32,
    /// The receive power the anchor saw, in dBm
    pub rx_power_dbm: f32,
}

/// Determines the shape of a received frame
///
/// Returns [`FrameClass::Invalid`] for frames that match none of the three
/// known shapes or are too short to contain their fixed header and kind
/// byte. Callers must drop such frames.
///
/// [`FrameClass::Invalid`]: enum.FrameClass.html#variant.Invalid
pub fn classify(frame: &[u8]) -> FrameClass {
    if frame.len() >= BLINK_LEN && frame[0] == FC_BLINK {
        FrameClass::Blink
    } else if frame.len() > LONG_MAC_LEN && frame[0] == FC_1 && frame[1] == FC_2 {
        FrameClass::LongMac
    } else if frame.len() > SHORT_MAC_LEN && frame[0] == FC_1 && frame[1] == FC_2_SHORT {
        FrameClass::ShortMac
    } else {
        FrameClass::Invalid
    }
}

/// Extracts the message kind byte of a classified frame
///
/// Returns `None` if the kind byte does not name a known message.
pub fn message_kind(frame: &[u8], class: FrameClass) -> Option<MessageKind> {
    let kind = match class {
        FrameClass::Blink => return Some(MessageKind::Blink),
        FrameClass::LongMac => *frame.get(LONG_MAC_LEN)?,
        FrameClass::ShortMac => *frame.get(SHORT_MAC_LEN)?,
        FrameClass::Invalid => return None,
    };
    MessageKind::try_from(kind).ok()
}

/// Decodes a short MAC frame
///
/// Returns the sender's short address, or `None` if the frame is not
/// addressed to `own_short` (or is malformed). Frames for other devices
/// must be dropped silently.
pub fn decode_short(frame: &[u8], own_short: ShortAddress) -> Option<ShortAddress> {
    if classify(frame) != FrameClass::ShortMac {
        return None;
    }

    let mut offset = 5;
    let destination: u16 = frame.read_with(&mut offset, LE).ok()?;
    let source: u16 = frame.read_with(&mut offset, LE).ok()?;

    if destination != own_short.0 {
        return None;
    }
    Some(ShortAddress(source))
}

/// Decodes a long MAC frame
///
/// Returns the sender's short address, or `None` if the frame is not
/// addressed to `own_long` (or is malformed).
pub fn decode_long(frame: &[u8], own_long: ExtendedAddress) -> Option<ShortAddress> {
    if classify(frame) != FrameClass::LongMac {
        return None;
    }

    let mut offset = 5;
    let destination: u64 = frame.read_with(&mut offset, LE).ok()?;
    let source: u16 = frame.read_with(&mut offset, LE).ok()?;

    if destination != own_long.0 {
        return None;
    }
    Some(ShortAddress(source))
}

/// Decodes a blink frame
///
/// Blinks are broadcast, so there is no destination to filter on; returns
/// the announcing tag's long and short address.
pub fn decode_blink(frame: &[u8]) -> Option<(ExtendedAddress, ShortAddress)> {
    if classify(frame) != FrameClass::Blink {
        return None;
    }

    let mut offset = 2;
    let long: u64 = frame.read_with(&mut offset, LE).ok()?;
    let short: u16 = frame.read_with(&mut offset, LE).ok()?;

    Some((ExtendedAddress(long), ShortAddress(short)))
}

/// Builds the protocol's frames, keeping the running sequence number
///
/// The sequence number is shared between all frame shapes and wraps at 256.
#[derive(Debug, Default)]
pub struct Framer {
    seq: Wrapping<u8>,
}

impl Framer {
    /// Creates a framer with the sequence number at zero
    pub fn new() -> Self {
        Framer { seq: Wrapping(0) }
    }

    fn next_seq(&mut self) -> u8 {
        let seq = self.seq.0;
        self.seq += Wrapping(1);
        seq
    }

    /// Encodes a blink frame announcing `src_long`/`src_short`
    ///
    /// Returns the frame length.
    pub fn encode_blink(
        &mut self,
        buffer: &mut [u8],
        src_long: ExtendedAddress,
        src_short: ShortAddress,
    ) -> usize {
        buffer[0] = FC_BLINK;
        buffer[1] = self.next_seq();
        buffer[2..10].copy_from_slice(&src_long.0.to_le_bytes());
        buffer[10..12].copy_from_slice(&src_short.0.to_le_bytes());
        BLINK_LEN
    }

    /// Encodes the header and kind byte of a short MAC frame
    ///
    /// Returns the length written so far; any payload goes behind it.
    pub fn encode_short_frame(
        &mut self,
        buffer: &mut [u8],
        pan_id: PanId,
        destination: ShortAddress,
        source: ShortAddress,
        kind: MessageKind,
    ) -> usize {
        buffer[0] = FC_1;
        buffer[1] = FC_2_SHORT;
        buffer[2] = self.next_seq();
        buffer[3..5].copy_from_slice(&pan_id.0.to_le_bytes());
        buffer[5..7].copy_from_slice(&destination.0.to_le_bytes());
        buffer[7..9].copy_from_slice(&source.0.to_le_bytes());
        buffer[SHORT_MAC_LEN] = kind.into();
        SHORT_MAC_LEN + 1
    }

    /// Encodes a long MAC frame, including its kind byte
    ///
    /// Returns the frame length.
    pub fn encode_long_frame(
        &mut self,
        buffer: &mut [u8],
        pan_id: PanId,
        destination: ExtendedAddress,
        source: ShortAddress,
        kind: MessageKind,
    ) -> usize {
        buffer[0] = FC_1;
        buffer[1] = FC_2;
        buffer[2] = self.next_seq();
        buffer[3..5].copy_from_slice(&pan_id.0.to_le_bytes());
        buffer[5..13].copy_from_slice(&destination.0.to_le_bytes());
        buffer[13..15].copy_from_slice(&source.0.to_le_bytes());
        buffer[LONG_MAC_LEN] = kind.into();
        LONG_MAC_LEN + 1
    }
}
