//! Transmit engine
//!
//! One generic data-channel loop parameterized over an [`AudioSource`]
//! capability, with three source implementations: playlist-driven playback,
//! live-broadcast override, and maintenance test playback. The loop itself
//! never changes between variants; only where the bytes come from does.

pub mod live;
pub mod maintenance;
pub mod pause;
pub mod playlist;
pub mod source;
pub mod transmit;

pub use live::{LivePipe, LiveProducer, LiveSource};
pub use maintenance::{MaintenanceHandle, MaintenancePlan, MaintenanceSource};
pub use pause::PauseGate;
pub use playlist::{PlaybackItem, PlaylistCursor, PlaylistSource};
pub use source::{AudioSource, Chunk};
pub use transmit::{EngineShared, TransmitEngine};

use std::io;

/// Capability the transmit loop needs from the data socket.
/// Production uses [`crate::net::UdpFrameSink`]; tests record frames.
pub trait FrameSink: Send {
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// External logging collaborator for playback completion and failure
pub trait PlaybackLog: Send {
    fn item_finished(&self, item_id: &str);
    fn item_failed(&self, item_id: &str, reason: &str);
}

/// Default log sink writing through tracing
pub struct TracingPlaybackLog;

impl PlaybackLog for TracingPlaybackLog {
    fn item_finished(&self, item_id: &str) {
        tracing::info!(item_id, "playback item finished");
    }

    fn item_failed(&self, item_id: &str, reason: &str) {
        tracing::warn!(item_id, reason, "playback item failed");
    }
}
