//! Playlist-driven playback source
//!
//! The playlist cursor itself is an external collaborator (the scheduler
//! decides what plays next); this source only walks the bytes of whatever
//! the cursor hands out. Interrupt items preempt the current item at the
//! next chunk boundary, and the preempted item resumes from its saved
//! offset afterwards.

use bytes::Bytes;

use crate::constants::SINGLE_PAYLOAD_SIZE;
use crate::engine::source::{AudioSource, Chunk};
use crate::regulate::ChunkClass;

/// One schedulable piece of audio
#[derive(Debug, Clone)]
pub struct PlaybackItem {
    pub id: String,
    pub audio: Bytes,
    pub class: ChunkClass,
    pub is_interrupt: bool,
}

/// External playlist collaborator
pub trait PlaylistCursor: Send {
    /// The next regular item, or `None` when the playlist is exhausted
    fn next_item(&mut self) -> Option<PlaybackItem>;

    /// A pending interrupt item, if one became available. Polled between
    /// chunks; returning one preempts the current item.
    fn take_interrupt(&mut self) -> Option<PlaybackItem> {
        None
    }
}

struct ActiveItem {
    item: PlaybackItem,
    offset: usize,
}

impl ActiveItem {
    fn new(item: PlaybackItem) -> Self {
        Self { item, offset: 0 }
    }

    fn finished(&self) -> bool {
        self.offset >= self.item.audio.len()
    }

    fn next_chunk(&mut self) -> Bytes {
        let end = (self.offset + SINGLE_PAYLOAD_SIZE).min(self.item.audio.len());
        let chunk = self.item.audio.slice(self.offset..end);
        self.offset = end;
        chunk
    }
}

/// Playlist variant of the audio source
pub struct PlaylistSource {
    cursor: Box<dyn PlaylistCursor>,
    current: Option<ActiveItem>,
    preempted: Option<ActiveItem>,
}

impl PlaylistSource {
    pub fn new(cursor: Box<dyn PlaylistCursor>) -> Self {
        Self {
            cursor,
            current: None,
            preempted: None,
        }
    }
}

impl AudioSource for PlaylistSource {
    fn next_chunk(&mut self) -> Chunk {
        // At most one level of preemption: an interrupt is never itself
        // interrupted
        if self.preempted.is_none() {
            if let Some(interrupt) = self.cursor.take_interrupt() {
                tracing::info!(item_id = %interrupt.id, "interrupt item preempts playback");
                self.preempted = self.current.take();
                self.current = Some(ActiveItem::new(interrupt));
            }
        }

        if self.current.is_none() {
            self.current = self
                .preempted
                .take()
                .or_else(|| self.cursor.next_item().map(ActiveItem::new));
        }

        match &mut self.current {
            None => Chunk::Exhausted,
            Some(active) if active.finished() => {
                let item_id = active.item.id.clone();
                self.current = None;
                Chunk::ItemEnd { item_id }
            }
            Some(active) => Chunk::Payload {
                class: active.item.class,
                bytes: active.next_chunk(),
            },
        }
    }

    fn restart_item(&mut self) {
        if let Some(active) = &mut self.current {
            active.offset = 0;
        }
    }

    fn abort_item(&mut self) -> Option<String> {
        self.current.take().map(|active| active.item.id)
    }
}
