//! Session orchestration
//!
//! A session wires the whole engine together: event bus, supervisor
//! channel, sync controller, transmit engine, and a directive handler
//! that applies supervisor commands while transmission runs. Startup
//! blocks until the first sync with the DAC is established; no audio can
//! leave before that anyway, and the parent learns about a misconfigured
//! DAC address immediately instead of after queueing a playlist.
//!
//! Shutdown is ordered: transmit engine first (so the last item can
//! complete on a graceful stop), then the sync controller, then the
//! supervisor channel, which sends its shutting-down notice on the way
//! out. The orchestrator thread performs the teardown exactly once no
//! matter how many paths request it.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::{Condvar, Mutex};

use crate::config::EngineConfig;
use crate::engine::transmit::TransmitParts;
use crate::engine::{AudioSource, EngineShared, FrameSink, PauseGate, TracingPlaybackLog, TransmitEngine};
use crate::error::{Error, NetworkError};
use crate::events::{EngineEvent, EventBus, PlaybackOrigin, PlaybackOutcome};
use crate::pacing::PacingController;
use crate::regulate::SharedRegulator;
use crate::supervisor::SupervisorChannel;
use crate::sync::{ControlLink, SyncController, SyncFlag};

/// Poll period of the directive handler
const DIRECTIVE_POLL_MILLIS: u64 = 100;

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Ran to completion or was asked to stop
    Completed,
    /// Torn down by an unrecoverable fault
    Failed(String),
}

/// Everything a session needs besides configuration. The collaborators
/// are capabilities so embedding code and tests can substitute them;
/// production wires the UDP types from [`crate::net`].
pub struct SessionDeps {
    /// Control socket for the sync loop
    pub control: Box<dyn ControlLink>,
    /// Audio source driving the main transmit engine
    pub source: Box<dyn AudioSource>,
    /// Level regulator shared by all transmit engines
    pub regulator: SharedRegulator,
    /// Produces a data-channel sink per transmit engine (the main engine
    /// plus one per live broadcast)
    pub data_sinks: Box<dyn FnMut() -> Result<Box<dyn FrameSink>, Error> + Send>,
    /// Produces a live audio source per broadcast; `None` rejects live
    /// broadcast directives outright
    pub live_sources: Option<Box<dyn FnMut() -> Box<dyn AudioSource> + Send>>,
}

/// One running engine session
pub struct Session {
    bus: EventBus,
    finished: Arc<(Mutex<Option<SessionOutcome>>, Condvar)>,
    orchestrator: Option<JoinHandle<()>>,
}

impl Session {
    /// Start every component and block until the DAC answers the initial
    /// sync handshake. Returns once transmission is running (or was shut
    /// down before the first sync).
    pub fn start(config: EngineConfig, mut deps: SessionDeps) -> Result<Self, Error> {
        config.validate()?;

        let bus = EventBus::new();
        // Subscribed before the sync controller starts so the first
        // regain event cannot be missed
        let directives = bus.subscribe();
        let finished = Arc::new((Mutex::new(None), Condvar::new()));

        let mut supervisor = match config.supervisor_port {
            Some(_) => Some(SupervisorChannel::start(&config, bus.clone())?),
            None => None,
        };

        let pacing = Arc::new(PacingController::new(config.pacing, config.watermark_packets));
        let mut sync = SyncController::start(deps.control, bus.clone(), pacing.clone())?;

        if !wait_for_initial_sync(&directives) {
            tracing::info!("shutdown requested before the first sync");
            sync.stop();
            if let Some(channel) = &mut supervisor {
                channel.stop();
            }
            finished.0.lock().replace(SessionOutcome::Completed);
            return Ok(Self {
                bus,
                finished,
                orchestrator: None,
            });
        }

        let shared = EngineShared::new(config.transmitters.clone(), config.decibel_targets);
        let sink = match (deps.data_sinks)() {
            Ok(sink) => sink,
            Err(e) => {
                sync.stop();
                if let Some(channel) = &mut supervisor {
                    channel.stop();
                }
                return Err(e);
            }
        };

        let engine = TransmitEngine::start(
            "dac-transmit",
            TransmitParts {
                source: deps.source,
                sink,
                regulator: deps.regulator.clone(),
                log: Box::new(TracingPlaybackLog),
                shared: shared.clone(),
                sync_flag: sync.sync_flag(),
                pacing_cell: pacing.interval_cell(),
                bus: bus.clone(),
                origin: PlaybackOrigin::Primary,
                shutdown_on_exhaust: true,
            },
        )?;

        let mut orchestrator = Orchestrator {
            directives,
            bus: bus.clone(),
            shared,
            sync_flag: sync.sync_flag(),
            pacing,
            regulator: deps.regulator,
            data_sinks: deps.data_sinks,
            live_sources: deps.live_sources,
            playlist_gate: engine.pause_gate(),
            engine,
            live: None,
            sync,
            supervisor,
            finished: finished.clone(),
        };
        let handle = thread::Builder::new()
            .name("session".into())
            .spawn(move || orchestrator.run())
            .map_err(|e| Error::Network(NetworkError::ConnectionFailed(e.to_string())))?;

        Ok(Self {
            bus,
            finished,
            orchestrator: Some(handle),
        })
    }

    /// Subscription to the session's event stream, for embedding code
    /// that wants playback or sync notifications
    pub fn events(&self) -> Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    /// Ask the session to stop and wait for the teardown to finish.
    /// Graceful stops let the current item complete. Idempotent.
    pub fn shutdown(&mut self, immediate: bool) {
        self.bus.publish(EngineEvent::ShutdownRequested { immediate });
        if let Some(handle) = self.orchestrator.take() {
            let _ = handle.join();
        }
    }

    /// Block until the session has torn itself down, for any reason
    pub fn wait_for_shutdown(&self) -> SessionOutcome {
        let (outcome, condvar) = &*self.finished;
        let mut outcome = outcome.lock();
        while outcome.is_none() {
            condvar.wait(&mut outcome);
        }
        outcome.clone().unwrap_or(SessionOutcome::Completed)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown(true);
    }
}

/// Block until the first sync regain, consuming events as they arrive.
/// Returns false when a shutdown was requested first.
fn wait_for_initial_sync(directives: &Receiver<EngineEvent>) -> bool {
    loop {
        match directives.recv() {
            Ok(EngineEvent::SyncRegained { downtime, .. }) => {
                tracing::info!(
                    wait_millis = downtime.as_millis() as u64,
                    "initial sync established"
                );
                return true;
            }
            Ok(EngineEvent::ShutdownRequested { .. }) => return false,
            Ok(_) => {}
            Err(_) => return false,
        }
    }
}

/// The directive-handling thread. Owns every component and is the only
/// place components are stopped.
struct Orchestrator {
    directives: Receiver<EngineEvent>,
    bus: EventBus,
    shared: EngineShared,
    sync_flag: Arc<SyncFlag>,
    pacing: Arc<PacingController>,
    regulator: SharedRegulator,
    data_sinks: Box<dyn FnMut() -> Result<Box<dyn FrameSink>, Error> + Send>,
    live_sources: Option<Box<dyn FnMut() -> Box<dyn AudioSource> + Send>>,

    playlist_gate: Arc<PauseGate>,
    engine: TransmitEngine,
    live: Option<TransmitEngine>,
    sync: SyncController,
    supervisor: Option<SupervisorChannel>,
    finished: Arc<(Mutex<Option<SessionOutcome>>, Condvar)>,
}

impl Orchestrator {
    fn run(&mut self) {
        tracing::info!("session running");
        let (immediate, outcome) = self.handle_directives();
        self.teardown(immediate, outcome);
    }

    /// Returns (immediate, outcome) once a shutdown condition is reached
    fn handle_directives(&mut self) -> (bool, SessionOutcome) {
        loop {
            match self
                .directives
                .recv_timeout(Duration::from_millis(DIRECTIVE_POLL_MILLIS))
            {
                Ok(event) => match event {
                    EngineEvent::TransmitterChange(transmitters) => {
                        tracing::info!(?transmitters, "transmitter set updated");
                        self.shared.set_channels(transmitters);
                    }
                    EngineEvent::DecibelChange(targets) => {
                        tracing::info!(?targets, "decibel targets updated");
                        self.shared.set_targets(targets);
                    }
                    EngineEvent::LiveBroadcastStart { delay_tones } => {
                        self.start_live_broadcast(delay_tones);
                    }
                    // Matched by origin, not item id: ids come from the
                    // playlist collaborator and may collide with the live
                    // engine's
                    EngineEvent::PlaybackEnded {
                        origin: PlaybackOrigin::Live,
                        outcome,
                        ..
                    } if self.live.is_some() => {
                        self.finish_live_broadcast(&outcome);
                    }
                    EngineEvent::CriticalError { detail } => {
                        tracing::error!(%detail, "critical error, tearing the session down");
                        return (true, SessionOutcome::Failed(detail));
                    }
                    EngineEvent::ShutdownRequested { immediate } => {
                        return (immediate, SessionOutcome::Completed);
                    }
                    _ => {}
                },
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return (true, SessionOutcome::Completed);
                }
            }
        }
    }

    fn start_live_broadcast(&mut self, delay_tones: bool) {
        if self.live.is_some() {
            tracing::warn!("live broadcast already running, directive ignored");
            return;
        }
        // Only the immediate path is wired up. The delayed-tones variant
        // needs the alert-tone generator this process does not carry, so
        // the directive is refused rather than silently downgraded.
        if delay_tones {
            tracing::warn!("delayed-tones live broadcast is not supported");
            self.bus
                .publish(EngineEvent::LiveBroadcastEnded { failed: true });
            return;
        }
        let source = match &mut self.live_sources {
            Some(factory) => factory(),
            None => {
                tracing::warn!("no live input configured, live broadcast refused");
                self.bus
                    .publish(EngineEvent::LiveBroadcastEnded { failed: true });
                return;
            }
        };
        let sink = match (self.data_sinks)() {
            Ok(sink) => sink,
            Err(e) => {
                tracing::warn!("live data sink unavailable: {e}");
                self.bus
                    .publish(EngineEvent::LiveBroadcastEnded { failed: true });
                return;
            }
        };

        self.playlist_gate.pause();
        match TransmitEngine::start(
            "dac-live",
            TransmitParts {
                source,
                sink,
                regulator: self.regulator.clone(),
                log: Box::new(TracingPlaybackLog),
                shared: self.shared.clone(),
                sync_flag: self.sync_flag.clone(),
                pacing_cell: self.pacing.interval_cell(),
                bus: self.bus.clone(),
                origin: PlaybackOrigin::Live,
                shutdown_on_exhaust: false,
            },
        ) {
            Ok(engine) => {
                tracing::info!("live broadcast started, playlist playback paused");
                self.live = Some(engine);
                self.bus.publish(EngineEvent::LiveBroadcastReady);
            }
            Err(e) => {
                tracing::warn!("live engine start failed: {e}");
                self.playlist_gate.resume();
                self.bus
                    .publish(EngineEvent::LiveBroadcastEnded { failed: true });
            }
        }
    }

    fn finish_live_broadcast(&mut self, outcome: &PlaybackOutcome) {
        if let Some(mut live) = self.live.take() {
            live.stop(true);
        }
        self.playlist_gate.resume();
        let failed = matches!(outcome, PlaybackOutcome::Aborted { .. });
        tracing::info!(failed, "live broadcast ended, playlist playback resumed");
        self.bus.publish(EngineEvent::LiveBroadcastEnded { failed });
    }

    fn teardown(&mut self, immediate: bool, outcome: SessionOutcome) {
        tracing::info!(immediate, "session teardown");
        if let Some(mut live) = self.live.take() {
            live.stop(true);
        }
        // Graceful stops need the gate open so the last item can finish
        self.playlist_gate.resume();
        self.engine.stop(immediate);
        self.sync.stop();
        if let Some(channel) = &mut self.supervisor {
            channel.stop();
        }

        let (slot, condvar) = &*self.finished;
        slot.lock().replace(outcome);
        condvar.notify_all();
        tracing::info!("session stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::playlist::{PlaybackItem, PlaylistCursor, PlaylistSource};
    use crate::engine::source::Chunk;
    use crate::regulate::UnityRegulator;
    use crate::sync::RecvOutcome;
    use std::collections::{BTreeSet, VecDeque};
    use std::io;
    use std::time::Instant;

    const GOOD_STATUS: &str = "013.8,13.6,25,0.5,0.5,1.0,0.0,1100,0,0";

    /// Control link that syncs immediately and stays synced
    struct AlwaysSyncedLink;

    impl ControlLink for AlwaysSyncedLink {
        fn send(&mut self, _frame: &[u8]) -> io::Result<()> {
            Ok(())
        }

        fn recv(&mut self) -> io::Result<RecvOutcome> {
            // Mimic the production socket's receive timeout so the
            // control loop does not spin
            thread::sleep(Duration::from_millis(5));
            Ok(RecvOutcome::Data(GOOD_STATUS.into()))
        }
    }

    struct NullSink;

    impl FrameSink for NullSink {
        fn send_frame(&mut self, _frame: &[u8]) -> io::Result<()> {
            Ok(())
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

    /// Source that never produces audio and never ends
    struct IdleSource;

    impl AudioSource for IdleSource {
        fn next_chunk(&mut self) -> Chunk {
            Chunk::Idle
        }

        fn restart_item(&mut self) {}

        fn abort_item(&mut self) -> Option<String> {
            None
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            dac_host: "10.0.0.40".into(),
            data_port: 2000,
            transmitters: BTreeSet::from([0]),
            decibel_targets: Default::default(),
            input_source: "test".into(),
            supervisor_port: None,
            pacing: crate::pacing::PacingStrategy::Stable,
            watermark_packets: 25,
        }
    }

    fn deps_with_source(source: Box<dyn AudioSource>) -> SessionDeps {
        SessionDeps {
            control: Box::new(AlwaysSyncedLink),
            source,
            regulator: Arc::new(UnityRegulator),
            data_sinks: Box::new(|| Ok(Box::new(NullSink) as Box<dyn FrameSink>)),
            live_sources: None,
        }
    }

    fn wait_for<F: FnMut() -> bool>(what: &str, mut condition: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_empty_playlist_completes_the_session() {
        let source = PlaylistSource::new(Box::new(VecCursor {
            items: VecDeque::new(),
        }));
        let mut session = Session::start(test_config(), deps_with_source(Box::new(source))).unwrap();

        assert_eq!(session.wait_for_shutdown(), SessionOutcome::Completed);
        session.shutdown(false);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut session =
            Session::start(test_config(), deps_with_source(Box::new(IdleSource))).unwrap();

        session.shutdown(true);
        session.shutdown(true);
        session.shutdown(false);
        assert_eq!(session.wait_for_shutdown(), SessionOutcome::Completed);
    }

    #[test]
    fn test_delayed_tones_broadcast_is_refused() {
        let mut session =
            Session::start(test_config(), deps_with_source(Box::new(IdleSource))).unwrap();
        let events = session.events();

        session
            .bus
            .publish(EngineEvent::LiveBroadcastStart { delay_tones: true });

        let deadline = Instant::now() + Duration::from_secs(5);
        let refused = loop {
            assert!(Instant::now() < deadline, "no broadcast-ended event");
            match events.recv_timeout(Duration::from_secs(1)) {
                Ok(EngineEvent::LiveBroadcastEnded { failed }) => break failed,
                Ok(_) => {}
                Err(_) => {}
            }
        };
        assert!(refused);
        session.shutdown(true);
    }

    #[test]
    fn test_live_broadcast_pauses_and_resumes_playlist() {
        // A long playlist item so playback is mid-item when the
        // broadcast starts
        let source = PlaylistSource::new(Box::new(VecCursor {
            items: VecDeque::from([PlaybackItem {
                id: "background".into(),
                audio: bytes::Bytes::from(vec![1u8; 10_000 * 160]),
                class: crate::regulate::ChunkClass::Content,
                is_interrupt: false,
            }]),
        }));
        let mut deps = deps_with_source(Box::new(source));
        deps.live_sources = Some(Box::new(|| {
            let (producer, live) = crate::engine::live::LiveSource::channel();
            // Close straight away: the broadcast plays nothing and ends
            producer.close();
            Box::new(live) as Box<dyn AudioSource>
        }));

        let mut session = Session::start(test_config(), deps).unwrap();
        let events = session.events();

        session
            .bus
            .publish(EngineEvent::LiveBroadcastStart { delay_tones: false });

        let mut saw_ready = false;
        let mut saw_clean_end = false;
        wait_for("broadcast lifecycle", || {
            while let Ok(event) = events.try_recv() {
                match event {
                    EngineEvent::LiveBroadcastReady => saw_ready = true,
                    EngineEvent::LiveBroadcastEnded { failed } => saw_clean_end = !failed,
                    _ => {}
                }
            }
            saw_ready && saw_clean_end
        });

        session.shutdown(true);
        assert_eq!(session.wait_for_shutdown(), SessionOutcome::Completed);
    }

    #[test]
    fn test_primary_item_sharing_the_live_id_cannot_end_broadcast() {
        let producer_slot: Arc<Mutex<Option<crate::engine::live::LiveProducer>>> =
            Arc::new(Mutex::new(None));
        let mut deps = deps_with_source(Box::new(IdleSource));
        let slot = producer_slot.clone();
        deps.live_sources = Some(Box::new(move || {
            let (producer, live) = crate::engine::live::LiveSource::channel();
            slot.lock().replace(producer);
            Box::new(live) as Box<dyn AudioSource>
        }));

        let mut session = Session::start(test_config(), deps).unwrap();
        let events = session.events();
        session
            .bus
            .publish(EngineEvent::LiveBroadcastStart { delay_tones: false });

        let mut ready = false;
        wait_for("broadcast ready", || {
            while let Ok(event) = events.try_recv() {
                if matches!(event, EngineEvent::LiveBroadcastReady) {
                    ready = true;
                }
            }
            ready
        });

        // A primary-engine item whose id collides with the live item id
        session.bus.publish(EngineEvent::PlaybackEnded {
            item_id: crate::engine::live::LIVE_ITEM_ID.into(),
            outcome: PlaybackOutcome::Completed,
            origin: PlaybackOrigin::Primary,
        });

        thread::sleep(Duration::from_millis(300));
        assert!(
            !events
                .try_iter()
                .any(|event| matches!(event, EngineEvent::LiveBroadcastEnded { .. })),
            "primary playback end must not end the broadcast"
        );

        // Closing the live feed ends the broadcast for real
        producer_slot.lock().take();
        let mut clean_end = false;
        wait_for("broadcast end", || {
            while let Ok(event) = events.try_recv() {
                if let EngineEvent::LiveBroadcastEnded { failed } = event {
                    clean_end = !failed;
                }
            }
            clean_end
        });

        session.shutdown(true);
    }
}
