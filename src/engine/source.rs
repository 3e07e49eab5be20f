//! Audio source capability
//!
//! The transmit loop is generic over where its bytes come from. A source
//! hands out at most one payload slot's worth of audio per call and marks
//! item boundaries explicitly so the loop can report them.

use bytes::Bytes;

use crate::regulate::ChunkClass;

/// What a source produced for one loop cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Up to one payload slot of audio, classified for regulation
    Payload { class: ChunkClass, bytes: Bytes },
    /// The current item just ended; nothing to send this cycle
    ItemEnd { item_id: String },
    /// Nothing available right now, but the source is still alive
    /// (live-broadcast underrun)
    Idle,
    /// The source has no further items; the loop ends
    Exhausted,
}

/// Variant-specific audio supply for the transmit loop
pub trait AudioSource: Send {
    /// Produce the next cycle's chunk
    fn next_chunk(&mut self) -> Chunk;

    /// Restart the current item from its beginning. Called when sync was
    /// regained after a downtime long enough that the DAC flushed its
    /// jitter buffer.
    fn restart_item(&mut self);

    /// Abandon the current item (regulation failure or forced stop).
    /// Returns the item id if one was active.
    fn abort_item(&mut self) -> Option<String>;
}
