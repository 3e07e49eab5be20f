//! Live-broadcast source
//!
//! Audio arrives as arbitrary-size byte chunks from an external live input
//! (a microphone feed relayed by the parent process) through a bounded
//! lock-free pipe. Underrun is not end-of-stream: an empty pipe means
//! "nothing to send this cycle" and the loop keeps waiting. Only closing
//! the producer ends the broadcast.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use crossbeam::queue::ArrayQueue;

use crate::constants::SINGLE_PAYLOAD_SIZE;
use crate::engine::source::{AudioSource, Chunk};
use crate::regulate::ChunkClass;

/// Item id live broadcasts report under
pub const LIVE_ITEM_ID: &str = "live-broadcast";

/// Pipe capacity in producer chunks; at typical 160-byte chunks this is
/// several seconds of cushion
const PIPE_CAPACITY: usize = 512;

/// Bounded SPSC byte-chunk pipe between the live input and the engine
pub struct LivePipe {
    queue: ArrayQueue<Bytes>,
    closed: AtomicBool,
    overflow_count: AtomicUsize,
    underrun_count: AtomicUsize,
}

impl LivePipe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: ArrayQueue::new(PIPE_CAPACITY),
            closed: AtomicBool::new(false),
            overflow_count: AtomicUsize::new(0),
            underrun_count: AtomicUsize::new(0),
        })
    }

    fn push(&self, chunk: Bytes) -> bool {
        match self.queue.push(chunk) {
            Ok(()) => true,
            Err(_) => {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    fn pop(&self) -> Option<Bytes> {
        match self.queue.pop() {
            Some(chunk) => Some(chunk),
            None => {
                self.underrun_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }

    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }
}

/// Producer handle held by the live-input collaborator
pub struct LiveProducer {
    pipe: Arc<LivePipe>,
}

impl LiveProducer {
    /// Feed one chunk of live audio. Returns false (and drops the chunk)
    /// when the pipe is full or already closed.
    pub fn push(&self, chunk: Bytes) -> bool {
        if self.pipe.is_closed() {
            return false;
        }
        self.pipe.push(chunk)
    }

    /// End the broadcast; the engine drains what is buffered and stops
    pub fn close(&self) {
        self.pipe.closed.store(true, Ordering::Release);
    }
}

impl Drop for LiveProducer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Engine-side consumer of the pipe
pub struct LiveSource {
    pipe: Arc<LivePipe>,
    pending: BytesMut,
    ended: bool,
}

impl LiveSource {
    /// Create a connected producer/source pair
    pub fn channel() -> (LiveProducer, LiveSource) {
        let pipe = LivePipe::new();
        (
            LiveProducer { pipe: pipe.clone() },
            LiveSource {
                pipe,
                pending: BytesMut::new(),
                ended: false,
            },
        )
    }

    fn fill_pending(&mut self) {
        while self.pending.len() < SINGLE_PAYLOAD_SIZE {
            match self.pipe.pop() {
                Some(chunk) => self.pending.extend_from_slice(&chunk),
                None => break,
            }
        }
    }
}

impl AudioSource for LiveSource {
    fn next_chunk(&mut self) -> Chunk {
        if self.ended {
            return Chunk::Exhausted;
        }

        self.fill_pending();

        if self.pending.len() >= SINGLE_PAYLOAD_SIZE {
            let bytes = self.pending.split_to(SINGLE_PAYLOAD_SIZE).freeze();
            return Chunk::Payload {
                class: ChunkClass::Content,
                bytes,
            };
        }

        if self.pipe.is_closed() && self.pipe.queue.is_empty() {
            if !self.pending.is_empty() {
                // Tail shorter than a payload slot; the codec pads it
                let bytes = self.pending.split().freeze();
                return Chunk::Payload {
                    class: ChunkClass::Content,
                    bytes,
                };
            }
            self.ended = true;
            return Chunk::ItemEnd {
                item_id: LIVE_ITEM_ID.into(),
            };
        }

        // Underrun: the feed is alive but has nothing buffered
        Chunk::Idle
    }

    fn restart_item(&mut self) {
        // A live feed has no beginning to rewind to; drop stale buffered
        // audio instead so playback resumes at the present
        self.pending.clear();
        while self.pipe.queue.pop().is_some() {}
    }

    fn abort_item(&mut self) -> Option<String> {
        if self.ended {
            return None;
        }
        self.ended = true;
        Some(LIVE_ITEM_ID.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_underrun_is_idle_not_end() {
        let (_producer, mut source) = LiveSource::channel();
        assert_eq!(source.next_chunk(), Chunk::Idle);
        assert_eq!(source.next_chunk(), Chunk::Idle);
        assert!(source.pipe.underrun_count() > 0);
    }

    #[test]
    fn test_chunks_are_resegmented_to_payload_size() {
        let (producer, mut source) = LiveSource::channel();
        // 100 + 100 bytes in, 160 out with 40 pending
        producer.push(Bytes::from(vec![1u8; 100]));
        producer.push(Bytes::from(vec![2u8; 100]));

        match source.next_chunk() {
            Chunk::Payload { bytes, .. } => {
                assert_eq!(bytes.len(), SINGLE_PAYLOAD_SIZE);
                assert_eq!(&bytes[..100], &[1u8; 100][..]);
                assert_eq!(&bytes[100..], &[2u8; 60][..]);
            }
            other => panic!("unexpected chunk: {other:?}"),
        }
        assert_eq!(source.next_chunk(), Chunk::Idle);
    }

    #[test]
    fn test_close_drains_then_ends() {
        let (producer, mut source) = LiveSource::channel();
        producer.push(Bytes::from(vec![7u8; SINGLE_PAYLOAD_SIZE + 10]));
        producer.close();

        assert!(matches!(source.next_chunk(), Chunk::Payload { .. }));
        match source.next_chunk() {
            Chunk::Payload { bytes, .. } => assert_eq!(bytes.len(), 10),
            other => panic!("unexpected chunk: {other:?}"),
        }
        assert_eq!(
            source.next_chunk(),
            Chunk::ItemEnd {
                item_id: LIVE_ITEM_ID.into()
            }
        );
        assert_eq!(source.next_chunk(), Chunk::Exhausted);
    }

    #[test]
    fn test_dropped_producer_closes_pipe() {
        let (producer, mut source) = LiveSource::channel();
        drop(producer);
        assert_eq!(
            source.next_chunk(),
            Chunk::ItemEnd {
                item_id: LIVE_ITEM_ID.into()
            }
        );
    }

    #[test]
    fn test_push_after_close_is_rejected() {
        let (producer, _source) = LiveSource::channel();
        producer.close();
        assert!(!producer.push(Bytes::from_static(b"x")));
    }
}
