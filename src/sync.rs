//! Sync/heartbeat protocol state machine
//!
//! The control loop owns the UDP control socket exclusively. It drives the
//! handshake `Unsynced → Syncing → Synced → (LostSync → Syncing)`:
//! an initial-sync frame is retried with back-off until the DAC answers with
//! a parseable status; while synced, heartbeats go out every 300 ms and each
//! received status resets the missed counter. Sync is declared lost on a
//! malformed status frame (the DAC's "no valid sync" report), on too many
//! consecutive receive timeouts, or when heartbeat sends have not succeeded
//! for too long. Socket errors are logged and counted as a missed heartbeat;
//! only a shutdown request terminates the loop.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::constants::{
    COMPLETE_SYNC_LOST_TIME_MILLIS, HEARTBEAT_FRAME, INITIAL_SYNC_FRAME,
    INITIAL_SYNC_RETRY_DELAY_MILLIS, MAX_SLEEP_GRANULARITY_MILLIS, MILLIS_BETWEEN_HEARTBEAT,
    MISSED_HEARTBEATS_THRESHOLD, SYNC_DOWNTIME_RESTART_THRESHOLD_MILLIS,
};
use crate::error::{Error, NetworkError};
use crate::events::{EngineEvent, EventBus};
use crate::pacing::PacingController;
use crate::protocol::{parse_status, DacStatus};

/// Result of one control-socket receive
pub enum RecvOutcome {
    /// A datagram arrived, decoded as text
    Data(String),
    /// The receive timeout elapsed with nothing on the wire
    Timeout,
}

/// Capability the state machine needs from the control socket.
/// Production uses [`crate::net::UdpControlLink`]; tests script outcomes.
pub trait ControlLink: Send {
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;
    /// Blocks for at most the link's receive timeout
    fn recv(&mut self) -> io::Result<RecvOutcome>;
}

/// Sync snapshot shared with the transmit loop.
/// Written only by the control thread; read anywhere.
#[derive(Default)]
pub struct SyncFlag {
    has_sync: AtomicBool,
    restart_requested: AtomicBool,
}

impl SyncFlag {
    pub fn is_synced(&self) -> bool {
        self.has_sync.load(Ordering::Acquire)
    }

    pub(crate) fn set_synced(&self, synced: bool) {
        self.has_sync.store(synced, Ordering::Release);
    }

    pub(crate) fn request_restart(&self) {
        self.restart_requested.store(true, Ordering::Release);
    }

    /// Consume a pending restart request (the regained-sync downtime
    /// exceeded the DAC's jitter-buffer retention)
    pub fn take_restart_request(&self) -> bool {
        self.restart_requested.swap(false, Ordering::AcqRel)
    }
}

/// Sleep in bounded increments so a shutdown request is honored quickly
pub(crate) fn bounded_sleep(keep_running: &AtomicBool, total: Duration) {
    let granule = Duration::from_millis(MAX_SLEEP_GRANULARITY_MILLIS);
    let deadline = Instant::now() + total;
    while keep_running.load(Ordering::Acquire) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        thread::sleep(remaining.min(granule));
    }
}

/// Whether a regained sync after `downtime` must restart the current item
pub fn downtime_requires_restart(downtime: Duration) -> bool {
    downtime > Duration::from_millis(SYNC_DOWNTIME_RESTART_THRESHOLD_MILLIS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Syncing,
    Synced,
}

/// The control loop proper. Separate from the thread wrapper so tests can
/// drive it with a scripted link.
pub struct ControlLoop {
    link: Box<dyn ControlLink>,
    bus: EventBus,
    pacing: Arc<PacingController>,
    flag: Arc<SyncFlag>,
    keep_running: Arc<AtomicBool>,

    phase: Phase,
    missed_heartbeats: u32,
    last_send_attempt: Instant,
    last_successful_send: Instant,
    lost_at: Option<Instant>,
    sync_started_at: Instant,
    previous_status: Option<DacStatus>,
}

impl ControlLoop {
    pub fn new(
        link: Box<dyn ControlLink>,
        bus: EventBus,
        pacing: Arc<PacingController>,
        flag: Arc<SyncFlag>,
        keep_running: Arc<AtomicBool>,
    ) -> Self {
        let now = Instant::now();
        Self {
            link,
            bus,
            pacing,
            flag,
            keep_running,
            phase: Phase::Syncing,
            missed_heartbeats: 0,
            last_send_attempt: now,
            last_successful_send: now,
            lost_at: None,
            sync_started_at: now,
            previous_status: None,
        }
    }

    /// Run until the keep-running flag clears
    pub fn run(&mut self) {
        tracing::info!("control loop starting");
        while self.keep_running.load(Ordering::Acquire) {
            match self.phase {
                Phase::Syncing => self.syncing_cycle(),
                Phase::Synced => self.synced_cycle(),
            }
        }
        self.flag.set_synced(false);
        tracing::info!("control loop stopped");
    }

    fn syncing_cycle(&mut self) {
        if let Err(e) = self.link.send(INITIAL_SYNC_FRAME) {
            tracing::warn!("initial sync send failed: {e}");
        }

        match self.link.recv() {
            Ok(RecvOutcome::Data(raw)) => match parse_status(&raw) {
                Ok(status) => {
                    self.enter_synced(status);
                    return;
                }
                Err(e) => {
                    tracing::debug!("unparseable response during sync: {e}");
                }
            },
            Ok(RecvOutcome::Timeout) => {}
            Err(e) => {
                tracing::warn!("control receive failed during sync: {e}");
            }
        }

        bounded_sleep(
            &self.keep_running,
            Duration::from_millis(INITIAL_SYNC_RETRY_DELAY_MILLIS),
        );
    }

    fn enter_synced(&mut self, status: DacStatus) {
        let downtime = self
            .lost_at
            .map(|at| at.elapsed())
            .unwrap_or_else(|| self.sync_started_at.elapsed());
        let restart_item = self.lost_at.is_some() && downtime_requires_restart(downtime);

        self.phase = Phase::Synced;
        self.missed_heartbeats = 0;
        let now = Instant::now();
        // Force a heartbeat on the first synced cycle
        self.last_send_attempt = now - Duration::from_millis(MILLIS_BETWEEN_HEARTBEAT);
        self.last_successful_send = now;
        self.lost_at = None;

        self.flag.set_synced(true);
        if restart_item {
            self.flag.request_restart();
        }

        tracing::info!(downtime_millis = downtime.as_millis() as u64, restart_item, "sync regained");
        self.bus.publish(EngineEvent::SyncRegained {
            downtime,
            restart_item,
        });
        self.accept_status(status);
    }

    fn synced_cycle(&mut self) {
        if self.last_send_attempt.elapsed() >= Duration::from_millis(MILLIS_BETWEEN_HEARTBEAT) {
            self.last_send_attempt = Instant::now();
            match self.link.send(HEARTBEAT_FRAME) {
                Ok(()) => self.last_successful_send = Instant::now(),
                Err(e) => {
                    tracing::warn!("heartbeat send failed: {e}");
                    self.missed_heartbeats += 1;
                }
            }
        }

        match self.link.recv() {
            Ok(RecvOutcome::Data(raw)) => match parse_status(&raw) {
                Ok(status) => {
                    self.missed_heartbeats = 0;
                    self.accept_status(status);
                }
                Err(e) => {
                    // The DAC answers with a sentinel frame when it no
                    // longer considers us synced
                    self.lose_sync(format!("malformed status frame: {e}"));
                    return;
                }
            },
            Ok(RecvOutcome::Timeout) => {
                self.missed_heartbeats += 1;
                if self.missed_heartbeats >= MISSED_HEARTBEATS_THRESHOLD {
                    self.lose_sync(format!(
                        "{} consecutive heartbeat timeouts",
                        self.missed_heartbeats
                    ));
                    return;
                }
            }
            Err(e) => {
                tracing::warn!("control receive failed: {e}");
                self.missed_heartbeats += 1;
            }
        }

        if self.last_successful_send.elapsed()
            > Duration::from_millis(COMPLETE_SYNC_LOST_TIME_MILLIS)
        {
            self.lose_sync("no successful heartbeat send".into());
        }
    }

    fn accept_status(&mut self, status: DacStatus) {
        if let Some(previous) = &self.previous_status {
            if status.differs_from(previous) {
                tracing::info!(
                    psu1 = status.psu1_voltage,
                    psu2 = status.psu2_voltage,
                    recoverable = status.recoverable_errors,
                    unrecoverable = status.unrecoverable_errors,
                    "hardware status changed"
                );
            }
        }
        self.pacing.observe(&status);
        self.bus.publish(EngineEvent::StatusReceived(status.clone()));
        self.previous_status = Some(status);
    }

    fn lose_sync(&mut self, reason: String) {
        tracing::warn!("sync lost: {reason}");
        self.phase = Phase::Syncing;
        self.missed_heartbeats = 0;
        self.lost_at = Some(Instant::now());
        self.flag.set_synced(false);
        self.bus.publish(EngineEvent::SyncLost);
    }
}

/// Owns the control-loop thread
pub struct SyncController {
    keep_running: Arc<AtomicBool>,
    flag: Arc<SyncFlag>,
    handle: Option<JoinHandle<()>>,
}

impl SyncController {
    /// Spawn the control loop on its own named thread
    pub fn start(
        link: Box<dyn ControlLink>,
        bus: EventBus,
        pacing: Arc<PacingController>,
    ) -> Result<Self, Error> {
        let keep_running = Arc::new(AtomicBool::new(true));
        let flag = Arc::new(SyncFlag::default());

        let mut control_loop = ControlLoop::new(
            link,
            bus,
            pacing,
            flag.clone(),
            keep_running.clone(),
        );
        let handle = thread::Builder::new()
            .name("dac-control".into())
            .spawn(move || control_loop.run())
            .map_err(|e| Error::Network(NetworkError::ConnectionFailed(e.to_string())))?;

        Ok(Self {
            keep_running,
            flag,
            handle: Some(handle),
        })
    }

    /// Shared sync snapshot for the transmit loop
    pub fn sync_flag(&self) -> Arc<SyncFlag> {
        self.flag.clone()
    }

    /// Stop the loop and join the thread. Idempotent.
    pub fn stop(&mut self) {
        self.keep_running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SyncController {
    fn drop(&mut self) {
        self.stop();
    }
}
