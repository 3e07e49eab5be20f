//! Maintenance test playback source
//!
//! Plays a fixed in-memory test recording against the DAC with no playlist,
//! live, or interrupt interaction. The buffer is replicated or truncated to
//! the requested test duration and pre-segmented into payload-size chunks;
//! the leading chunks are classified as alert and SAME tones so each phase
//! regulates to its own decibel target. A supervisory handle can query the
//! remaining packet count and cancel the run early.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::constants::{BYTES_PER_SECOND, SINGLE_PAYLOAD_SIZE};
use crate::engine::source::{AudioSource, Chunk};
use crate::regulate::ChunkClass;

/// Item id maintenance runs report under
pub const MAINTENANCE_ITEM_ID: &str = "maintenance-test";

/// Configuration for one maintenance run
#[derive(Debug, Clone)]
pub struct MaintenancePlan {
    /// Source test recording
    pub audio: Bytes,
    /// Requested playback duration in seconds; a negative duration plays
    /// the source buffer once, unmodified
    pub duration_secs: f64,
    /// Leading chunks regulated to the alert-tone target
    pub alert_chunks: usize,
    /// Chunks after the alert phase regulated to the SAME-tone target
    pub same_chunks: usize,
}

/// Byte count a duration requires, or `None` for "play the buffer as is"
pub fn bytes_for_duration(duration_secs: f64) -> Option<usize> {
    if duration_secs < 0.0 {
        None
    } else {
        Some((duration_secs * BYTES_PER_SECOND as f64).round() as usize)
    }
}

/// Replicate or truncate `audio` to exactly `target_len` bytes
fn replicate_to_length(audio: &[u8], target_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(target_len);
    if audio.is_empty() {
        out.resize(target_len, 0);
        return out;
    }
    while out.len() < target_len {
        let take = (target_len - out.len()).min(audio.len());
        out.extend_from_slice(&audio[..take]);
    }
    out
}

/// Segment `audio`, sized for `target_len` when given, into payload chunks
pub fn segment(audio: &[u8], target_len: Option<usize>) -> Vec<Bytes> {
    let sized: Vec<u8> = match target_len {
        Some(len) => replicate_to_length(audio, len),
        None => audio.to_vec(),
    };
    sized
        .chunks(SINGLE_PAYLOAD_SIZE)
        .map(Bytes::copy_from_slice)
        .collect()
}

/// Supervisory handle to a running maintenance source
#[derive(Clone)]
pub struct MaintenanceHandle {
    remaining: Arc<AtomicUsize>,
    cancel: Arc<AtomicBool>,
}

impl MaintenanceHandle {
    /// Packets not yet handed to the transmit loop
    pub fn remaining_packets(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// End the run before the buffer is exhausted
    pub fn force_stop(&self) {
        self.cancel.store(true, Ordering::Release);
    }
}

/// Maintenance variant of the audio source
pub struct MaintenanceSource {
    chunks: VecDeque<Bytes>,
    alert_chunks: usize,
    same_chunks: usize,
    served: usize,
    remaining: Arc<AtomicUsize>,
    cancel: Arc<AtomicBool>,
    ended: bool,
}

impl MaintenanceSource {
    pub fn new(plan: MaintenancePlan) -> (Self, MaintenanceHandle) {
        let chunks: VecDeque<Bytes> =
            segment(&plan.audio, bytes_for_duration(plan.duration_secs)).into();
        let remaining = Arc::new(AtomicUsize::new(chunks.len()));
        let cancel = Arc::new(AtomicBool::new(false));
        let handle = MaintenanceHandle {
            remaining: remaining.clone(),
            cancel: cancel.clone(),
        };
        (
            Self {
                chunks,
                alert_chunks: plan.alert_chunks,
                same_chunks: plan.same_chunks,
                served: 0,
                remaining,
                cancel,
                ended: false,
            },
            handle,
        )
    }

    fn class_for_index(&self, index: usize) -> ChunkClass {
        if index < self.alert_chunks {
            ChunkClass::AlertTone
        } else if index < self.alert_chunks + self.same_chunks {
            ChunkClass::SameTone
        } else {
            ChunkClass::Content
        }
    }
}

impl AudioSource for MaintenanceSource {
    fn next_chunk(&mut self) -> Chunk {
        if self.ended {
            return Chunk::Exhausted;
        }

        if self.cancel.load(Ordering::Acquire) {
            tracing::info!(
                remaining = self.chunks.len(),
                "maintenance run cancelled early"
            );
            self.chunks.clear();
            self.remaining.store(0, Ordering::Release);
        }

        match self.chunks.pop_front() {
            Some(bytes) => {
                let class = self.class_for_index(self.served);
                self.served += 1;
                self.remaining.fetch_sub(1, Ordering::AcqRel);
                Chunk::Payload { class, bytes }
            }
            None => {
                self.ended = true;
                Chunk::ItemEnd {
                    item_id: MAINTENANCE_ITEM_ID.into(),
                }
            }
        }
    }

    fn restart_item(&mut self) {
        // The test recording is short and the run is supervised; after a
        // long sync outage the remaining chunks simply continue
    }

    fn abort_item(&mut self) -> Option<String> {
        if self.ended {
            return None;
        }
        self.ended = true;
        self.chunks.clear();
        self.remaining.store(0, Ordering::Release);
        Some(MAINTENANCE_ITEM_ID.into())
    }
}
