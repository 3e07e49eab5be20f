//! Binary audio frame builder and encoder
//!
//! Every data frame carries two payload slots: the payload of the previous
//! frame and the current one, so the DAC can conceal a single lost datagram.
//! Sequence and timestamp are strictly derived from the prior frame; a frame
//! is never built from scratch except for the session's first.

use crate::constants::{
    FRAME_SIZE, SEQUENCE_INCREMENT, SINGLE_PAYLOAD_SIZE, TIMESTAMP_INCREMENT,
};

/// Magic tag in the first two header bytes of every data frame
const FRAME_MAGIC: u16 = 0x44A0;

/// Set of transmitter channels a frame is addressed to, as a bitmask
/// over channel ids 0..32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelMask(u32);

impl ChannelMask {
    pub const EMPTY: ChannelMask = ChannelMask(0);

    /// Build a mask from channel ids; ids >= 32 are ignored
    pub fn from_channels<I: IntoIterator<Item = u8>>(channels: I) -> Self {
        let mut bits = 0u32;
        for ch in channels {
            if (ch as u32) < 32 {
                bits |= 1 << ch;
            }
        }
        ChannelMask(bits)
    }

    pub fn contains(&self, channel: u8) -> bool {
        (channel as u32) < 32 && self.0 & (1 << channel) != 0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// One outbound audio frame
///
/// Immutable after construction; discarded after encoding except for its
/// role as the `previous` input to the next build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub sequence: u32,
    pub timestamp: u32,
    pub previous_payload: [u8; SINGLE_PAYLOAD_SIZE],
    pub current_payload: [u8; SINGLE_PAYLOAD_SIZE],
    pub channels: ChannelMask,
}

/// Builds and encodes data frames
pub struct FrameCodec;

impl FrameCodec {
    /// Build the next frame in the stream.
    ///
    /// With no previous frame the stream starts at sequence 0 / timestamp 0
    /// with a zero-filled previous slot. Otherwise sequence and timestamp
    /// advance by their fixed increments (wrapping) and the previous slot is
    /// the prior frame's current payload.
    ///
    /// `payload` may be shorter than a full slot (tail of an item); it is
    /// zero-padded. Longer payloads are truncated to one slot.
    pub fn build(
        previous: Option<&AudioFrame>,
        payload: &[u8],
        channels: ChannelMask,
    ) -> AudioFrame {
        let mut current = [0u8; SINGLE_PAYLOAD_SIZE];
        let len = payload.len().min(SINGLE_PAYLOAD_SIZE);
        current[..len].copy_from_slice(&payload[..len]);

        match previous {
            None => AudioFrame {
                sequence: 0,
                timestamp: 0,
                previous_payload: [0u8; SINGLE_PAYLOAD_SIZE],
                current_payload: current,
                channels,
            },
            Some(prev) => AudioFrame {
                sequence: prev.sequence.wrapping_add(SEQUENCE_INCREMENT),
                timestamp: prev.timestamp.wrapping_add(TIMESTAMP_INCREMENT),
                previous_payload: prev.current_payload,
                current_payload: current,
                channels,
            },
        }
    }

    /// Encode a frame into its 340-byte wire form.
    ///
    /// Layout: magic u16 | flags u16 | sequence u32 | timestamp u32 |
    /// channel mask u32 | reserved u32 | previous slot | current slot,
    /// all integers big-endian. Total over valid frames.
    pub fn encode(frame: &AudioFrame) -> [u8; FRAME_SIZE] {
        let mut buf = [0u8; FRAME_SIZE];
        buf[0..2].copy_from_slice(&FRAME_MAGIC.to_be_bytes());
        // flags (buf[2..4]) reserved, zero
        buf[4..8].copy_from_slice(&frame.sequence.to_be_bytes());
        buf[8..12].copy_from_slice(&frame.timestamp.to_be_bytes());
        buf[12..16].copy_from_slice(&frame.channels.bits().to_be_bytes());
        // reserved extension word (buf[16..20]) zero
        buf[20..20 + SINGLE_PAYLOAD_SIZE].copy_from_slice(&frame.previous_payload);
        buf[20 + SINGLE_PAYLOAD_SIZE..].copy_from_slice(&frame.current_payload);
        buf
    }
}
