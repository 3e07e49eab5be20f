//! DAC wire protocol
//!
//! Binary data frames on the data port, ASCII heartbeat/status frames
//! on the control port (data port + 100).

pub mod frame;
pub mod status;

pub use frame::{AudioFrame, ChannelMask, FrameCodec};
pub use status::{parse_status, DacStatus, VoiceState};
