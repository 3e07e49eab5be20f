//! The data-channel loop
//!
//! One iteration: honor pause, wait for sync (restarting the item when the
//! regain asked for it), pull a chunk, regulate it to the class's decibel
//! target, build the next frame from the previous one, send it, and sleep
//! the pacing interval. Frames leave strictly in sequence order because the
//! whole pipeline runs on this one thread.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::RwLock;

use crate::engine::source::{AudioSource, Chunk};
use crate::engine::{FrameSink, PauseGate, PlaybackLog};
use crate::error::{Error, NetworkError};
use crate::events::{EngineEvent, EventBus, PlaybackOrigin, PlaybackOutcome};
use crate::protocol::{AudioFrame, ChannelMask, FrameCodec};
use crate::regulate::{DecibelTargets, SharedRegulator};
use crate::sync::{bounded_sleep, SyncFlag};

/// Sleep while waiting for sync or for live audio to arrive
const IDLE_WAIT_MILLIS: u64 = 20;

/// State shared between the transmit loop and the directive handler:
/// the transmitter set (frame addressing) and the decibel targets.
/// Written by the supervisor path, read by the data loop.
#[derive(Clone)]
pub struct EngineShared {
    channels: Arc<RwLock<BTreeSet<u8>>>,
    targets: Arc<RwLock<DecibelTargets>>,
}

impl EngineShared {
    pub fn new(channels: BTreeSet<u8>, targets: DecibelTargets) -> Self {
        Self {
            channels: Arc::new(RwLock::new(channels)),
            targets: Arc::new(RwLock::new(targets)),
        }
    }

    pub fn set_channels(&self, channels: BTreeSet<u8>) {
        *self.channels.write() = channels;
    }

    pub fn set_targets(&self, targets: DecibelTargets) {
        *self.targets.write() = targets;
    }

    pub fn channel_mask(&self) -> ChannelMask {
        ChannelMask::from_channels(self.channels.read().iter().copied())
    }

    pub fn targets(&self) -> DecibelTargets {
        *self.targets.read()
    }
}

pub(crate) struct TransmitLoop {
    pub source: Box<dyn AudioSource>,
    pub sink: Box<dyn FrameSink>,
    pub regulator: SharedRegulator,
    pub log: Box<dyn PlaybackLog>,
    pub shared: EngineShared,
    pub sync_flag: Arc<SyncFlag>,
    pub pacing_cell: Arc<AtomicU64>,
    pub pause_gate: Arc<PauseGate>,
    pub bus: EventBus,
    pub keep_running: Arc<AtomicBool>,
    pub stop_after_item: Arc<AtomicBool>,
    /// Stamped on every playback event this loop publishes
    pub origin: PlaybackOrigin,
    /// Publish a graceful shutdown request when the source runs out
    /// (playlist/maintenance sessions end themselves this way)
    pub shutdown_on_exhaust: bool,
}

impl TransmitLoop {
    pub fn run(&mut self) {
        tracing::info!("transmit loop starting");
        let mut previous: Option<AudioFrame> = None;

        while self.keep_running.load(Ordering::Acquire) {
            self.pause_gate.wait_while_paused(&self.keep_running);
            if !self.keep_running.load(Ordering::Acquire) {
                break;
            }

            if !self.wait_for_sync() {
                break;
            }
            if self.sync_flag.take_restart_request() {
                tracing::info!("restarting current item after sync downtime");
                self.source.restart_item();
            }

            match self.source.next_chunk() {
                Chunk::Exhausted => {
                    tracing::info!("audio source exhausted");
                    if self.shutdown_on_exhaust {
                        self.bus
                            .publish(EngineEvent::ShutdownRequested { immediate: false });
                    }
                    break;
                }
                Chunk::ItemEnd { item_id } => {
                    self.log.item_finished(&item_id);
                    self.bus.publish(EngineEvent::PlaybackEnded {
                        item_id,
                        outcome: PlaybackOutcome::Completed,
                        origin: self.origin,
                    });
                    if self.stop_after_item.load(Ordering::Acquire) {
                        break;
                    }
                }
                Chunk::Idle => {
                    if self.stop_after_item.load(Ordering::Acquire) {
                        break;
                    }
                    bounded_sleep(&self.keep_running, Duration::from_millis(IDLE_WAIT_MILLIS));
                }
                Chunk::Payload { class, bytes } => {
                    let target_db = self.shared.targets().target_for(class);
                    let regulated = match self.regulator.regulate(&bytes, target_db) {
                        Ok(regulated) => regulated,
                        Err(e) => {
                            self.abort_current_item(e.to_string());
                            continue;
                        }
                    };

                    let frame =
                        FrameCodec::build(previous.as_ref(), &regulated, self.shared.channel_mask());
                    let wire = FrameCodec::encode(&frame);
                    if let Err(e) = self.sink.send_frame(&wire) {
                        // Transient: the next iteration retries with the
                        // next frame; sync loss covers a dead link
                        tracing::warn!(sequence = frame.sequence, "frame send failed: {e}");
                    }
                    previous = Some(frame);

                    let interval = self.pacing_cell.load(Ordering::Acquire);
                    bounded_sleep(&self.keep_running, Duration::from_millis(interval));
                }
            }
        }
        tracing::info!("transmit loop stopped");
    }

    /// Sleep in small increments until synced. Returns false when asked
    /// to stop instead; a graceful stop also ends the wait, because the
    /// current item cannot complete without sync anyway.
    fn wait_for_sync(&self) -> bool {
        while !self.sync_flag.is_synced() {
            if !self.keep_running.load(Ordering::Acquire)
                || self.stop_after_item.load(Ordering::Acquire)
            {
                return false;
            }
            bounded_sleep(&self.keep_running, Duration::from_millis(IDLE_WAIT_MILLIS));
        }
        true
    }

    fn abort_current_item(&mut self, reason: String) {
        let item_id = self
            .source
            .abort_item()
            .unwrap_or_else(|| "<unknown>".into());
        self.log.item_failed(&item_id, &reason);
        self.bus.publish(EngineEvent::PlaybackEnded {
            item_id,
            outcome: PlaybackOutcome::Aborted { reason },
            origin: self.origin,
        });
    }
}

/// Owns one transmit-loop thread
pub struct TransmitEngine {
    keep_running: Arc<AtomicBool>,
    stop_after_item: Arc<AtomicBool>,
    pause_gate: Arc<PauseGate>,
    handle: Option<JoinHandle<()>>,
}

/// Everything a transmit loop needs besides its lifecycle flags
pub struct TransmitParts {
    pub source: Box<dyn AudioSource>,
    pub sink: Box<dyn FrameSink>,
    pub regulator: SharedRegulator,
    pub log: Box<dyn PlaybackLog>,
    pub shared: EngineShared,
    pub sync_flag: Arc<SyncFlag>,
    pub pacing_cell: Arc<AtomicU64>,
    pub bus: EventBus,
    pub origin: PlaybackOrigin,
    pub shutdown_on_exhaust: bool,
}

impl TransmitEngine {
    /// Spawn the loop on its own named thread
    pub fn start(name: &str, parts: TransmitParts) -> Result<Self, Error> {
        let keep_running = Arc::new(AtomicBool::new(true));
        let stop_after_item = Arc::new(AtomicBool::new(false));
        let pause_gate = Arc::new(PauseGate::new());

        let mut transmit_loop = TransmitLoop {
            source: parts.source,
            sink: parts.sink,
            regulator: parts.regulator,
            log: parts.log,
            shared: parts.shared,
            sync_flag: parts.sync_flag,
            pacing_cell: parts.pacing_cell,
            pause_gate: pause_gate.clone(),
            bus: parts.bus,
            keep_running: keep_running.clone(),
            stop_after_item: stop_after_item.clone(),
            origin: parts.origin,
            shutdown_on_exhaust: parts.shutdown_on_exhaust,
        };

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || transmit_loop.run())
            .map_err(|e| Error::Network(NetworkError::ConnectionFailed(e.to_string())))?;

        Ok(Self {
            keep_running,
            stop_after_item,
            pause_gate,
            handle: Some(handle),
        })
    }

    /// Pause gate handle for the live-broadcast override
    pub fn pause_gate(&self) -> Arc<PauseGate> {
        self.pause_gate.clone()
    }

    /// Ask the loop to stop. Graceful stops complete the current item;
    /// immediate stops abandon it mid-stream.
    pub fn request_stop(&self, immediate: bool) {
        if immediate {
            self.keep_running.store(false, Ordering::Release);
        } else {
            self.stop_after_item.store(true, Ordering::Release);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Stop and join. Idempotent.
    pub fn stop(&mut self, immediate: bool) {
        self.request_stop(immediate);
        // Unpark a paused loop so it can observe the stop
        self.pause_gate.resume();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.keep_running.store(false, Ordering::Release);
    }
}

impl Drop for TransmitEngine {
    fn drop(&mut self) {
        self.stop(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::playlist::{PlaybackItem, PlaylistCursor, PlaylistSource};
    use crate::engine::TracingPlaybackLog;
    use crate::error::RegulationError;
    use crate::regulate::{ChunkClass, LevelRegulator};
    use crate::sync::SyncFlag;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::io;
    use std::time::Instant;

    /// Rejects any chunk whose first byte is the poison marker
    struct PickyRegulator;

    const POISON: u8 = 0xEE;

    impl LevelRegulator for PickyRegulator {
        fn regulate(&self, audio: &[u8], _target_db: f64) -> Result<Bytes, RegulationError> {
            if audio.first() == Some(&POISON) {
                return Err(RegulationError::UnsupportedFormat("poisoned".into()));
            }
            Ok(Bytes::copy_from_slice(audio))
        }
    }

    struct VecCursor {
        items: VecDeque<PlaybackItem>,
    }

    impl PlaylistCursor for VecCursor {
        fn next_item(&mut self) -> Option<PlaybackItem> {
            self.items.pop_front()
        }
    }

    #[derive(Clone)]
    struct RecordingSink {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl FrameSink for RecordingSink {
        fn send_frame(&mut self, frame: &[u8]) -> io::Result<()> {
            self.frames.lock().push(frame.to_vec());
            Ok(())
        }
    }

    fn item(id: &str, fill: u8, chunks: usize) -> PlaybackItem {
        PlaybackItem {
            id: id.into(),
            audio: Bytes::from(vec![fill; chunks * crate::constants::SINGLE_PAYLOAD_SIZE]),
            class: ChunkClass::Content,
            is_interrupt: false,
        }
    }

    /// Item whose chunk n is filled with the byte n
    fn indexed_item(id: &str, chunks: usize) -> PlaybackItem {
        let mut audio = Vec::with_capacity(chunks * crate::constants::SINGLE_PAYLOAD_SIZE);
        for n in 0..chunks {
            audio.extend_from_slice(&[n as u8; crate::constants::SINGLE_PAYLOAD_SIZE]);
        }
        PlaybackItem {
            id: id.into(),
            audio: Bytes::from(audio),
            class: ChunkClass::Content,
            is_interrupt: false,
        }
    }

    /// Fill byte of the current-payload slot of a recorded frame
    fn payload_fill(frame: &[u8]) -> u8 {
        frame[20 + crate::constants::SINGLE_PAYLOAD_SIZE]
    }

    #[test]
    fn test_regulation_failure_aborts_item_and_playback_continues() {
        let cursor = VecCursor {
            items: VecDeque::from([item("bad", POISON, 3), item("good", 1, 2)]),
        };
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sync_flag = Arc::new(SyncFlag::default());
        sync_flag.set_synced(true);
        let bus = EventBus::new();
        let events = bus.subscribe();

        let mut engine = TransmitEngine::start(
            "test-regulate",
            TransmitParts {
                source: Box::new(PlaylistSource::new(Box::new(cursor))),
                sink: Box::new(RecordingSink {
                    frames: frames.clone(),
                }),
                regulator: Arc::new(PickyRegulator),
                log: Box::new(TracingPlaybackLog),
                shared: EngineShared::new(BTreeSet::from([0]), DecibelTargets::default()),
                sync_flag,
                pacing_cell: Arc::new(AtomicU64::new(1)),
                bus,
                origin: PlaybackOrigin::Primary,
                shutdown_on_exhaust: false,
            },
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !engine.is_finished() {
            assert!(Instant::now() < deadline, "engine did not finish");
            thread::sleep(Duration::from_millis(5));
        }
        engine.stop(false);

        // Only the good item's frames went out
        assert_eq!(frames.lock().len(), 2);

        let outcomes: Vec<(String, bool)> = events
            .try_iter()
            .filter_map(|e| match e {
                EngineEvent::PlaybackEnded {
                    item_id, outcome, ..
                } => Some((item_id, matches!(outcome, PlaybackOutcome::Completed))),
                _ => None,
            })
            .collect();
        assert_eq!(
            outcomes,
            vec![("bad".to_string(), false), ("good".to_string(), true)]
        );
    }

    #[test]
    fn test_restart_flag_replays_item_from_start() {
        const CHUNKS: usize = 10;
        let cursor = VecCursor {
            items: VecDeque::from([indexed_item("a", CHUNKS)]),
        };
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sync_flag = Arc::new(SyncFlag::default());
        sync_flag.set_synced(true);
        let bus = EventBus::new();

        let mut engine = TransmitEngine::start(
            "test-restart",
            TransmitParts {
                source: Box::new(PlaylistSource::new(Box::new(cursor))),
                sink: Box::new(RecordingSink {
                    frames: frames.clone(),
                }),
                regulator: Arc::new(crate::regulate::UnityRegulator),
                log: Box::new(TracingPlaybackLog),
                shared: EngineShared::new(BTreeSet::from([0]), DecibelTargets::default()),
                sync_flag: sync_flag.clone(),
                pacing_cell: Arc::new(AtomicU64::new(20)),
                bus,
                origin: PlaybackOrigin::Primary,
                shutdown_on_exhaust: false,
            },
        )
        .unwrap();

        let gate = engine.pause_gate();
        let deadline = Instant::now() + Duration::from_secs(5);
        while frames.lock().is_empty() {
            assert!(Instant::now() < deadline, "no first frame");
            thread::sleep(Duration::from_millis(5));
        }
        gate.pause();
        // Let the in-flight iteration drain
        thread::sleep(Duration::from_millis(60));
        let sent_before = frames.lock().len();
        assert!(sent_before < CHUNKS, "restart must land mid-item");

        // What a sync regain after a long outage does
        sync_flag.request_restart();
        gate.resume();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !engine.is_finished() {
            assert!(Instant::now() < deadline, "engine did not finish");
            thread::sleep(Duration::from_millis(5));
        }
        engine.stop(false);

        // The chunks sent before the restart, then the whole item again
        let fills: Vec<u8> = frames.lock().iter().map(|f| payload_fill(f)).collect();
        assert_eq!(fills.len(), sent_before + CHUNKS);
        for (n, fill) in fills[..sent_before].iter().enumerate() {
            assert_eq!(*fill, n as u8);
        }
        for (n, fill) in fills[sent_before..].iter().enumerate() {
            assert_eq!(*fill, n as u8);
        }
    }
}
