//! Supervisor IPC channel
//!
//! This process is launched by a comms-manager parent and reports back over
//! a loopback TCP connection it initiates itself. The wire format is a
//! 4-byte big-endian length prefix followed by one JSON-encoded tagged
//! message; inbound directives are dispatched by their `type` tag.
//!
//! Outbound notifications flow through a single-threaded dispatcher so the
//! producing threads (control loop, transmit loop) never block on the
//! socket. Connection loss is retried forever with back-off and never
//! terminates transmission.

use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::constants::SUPERVISOR_RECONNECT_DELAY_MILLIS;
use crate::error::{Error, SupervisorError};
use crate::events::{EngineEvent, EventBus, PlaybackOutcome};
use crate::protocol::{DacStatus, VoiceState};
use crate::regulate::DecibelTargets;
use crate::sync::bounded_sleep;

/// Largest accepted IPC message body
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Messages exchanged with the parent process. Each instance travels
/// exactly once across the IPC boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorMessage {
    // -- outbound --
    Register {
        source_id: String,
        data_port: u16,
        dac_host: String,
        transmitters: BTreeSet<u8>,
        decibel_targets: DecibelTargets,
    },
    ConnectionStatus {
        has_sync: bool,
        downtime_millis: Option<u64>,
        at: DateTime<Utc>,
    },
    HardwareStatus {
        psu1_voltage: Option<f64>,
        psu2_voltage: Option<f64>,
        output_gain: [f64; 4],
        voice_status: [u8; 4],
        recoverable_errors: u32,
        unrecoverable_errors: u32,
        at: DateTime<Utc>,
    },
    PlaybackStatus {
        item_id: String,
        completed: bool,
        error: Option<String>,
        at: DateTime<Utc>,
    },
    PlaylistSwitch {
        playlist: String,
        at: DateTime<Utc>,
    },
    CriticalError {
        detail: String,
        at: DateTime<Utc>,
    },
    LiveBroadcastStatus {
        ready: bool,
        failed: bool,
        at: DateTime<Utc>,
    },
    ShuttingDown {
        at: DateTime<Utc>,
    },

    // -- inbound directives --
    Shutdown {
        immediate: bool,
    },
    PlaylistUpdate {
        playlist: String,
    },
    TransmitterChange {
        transmitters: BTreeSet<u8>,
    },
    DecibelChange {
        targets: DecibelTargets,
    },
    LiveBroadcastStart {
        delay_tones: bool,
    },
}

/// Write one length-prefixed message
pub fn write_message<W: Write>(
    writer: &mut W,
    message: &SupervisorMessage,
) -> Result<(), SupervisorError> {
    let body = serde_json::to_vec(message).map_err(|e| SupervisorError::Encode(e.to_string()))?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(SupervisorError::MessageTooLarge(body.len()));
    }
    let len = (body.len() as u32).to_be_bytes();
    writer
        .write_all(&len)
        .and_then(|_| writer.write_all(&body))
        .and_then(|_| writer.flush())
        .map_err(|e| SupervisorError::Io(e.to_string()))
}

/// Read one length-prefixed message
pub fn read_message<R: Read>(reader: &mut R) -> Result<SupervisorMessage, SupervisorError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            SupervisorError::ConnectionClosed
        } else {
            SupervisorError::Io(e.to_string())
        }
    })?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(SupervisorError::MessageTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .map_err(|e| SupervisorError::Io(e.to_string()))?;
    serde_json::from_slice(&body).map_err(|e| SupervisorError::Decode(e.to_string()))
}

/// Directive dispatch: inbound message tag → engine event
pub(crate) fn event_for_directive(message: SupervisorMessage) -> Option<EngineEvent> {
    match message {
        SupervisorMessage::Shutdown { immediate } => {
            Some(EngineEvent::ShutdownRequested { immediate })
        }
        SupervisorMessage::PlaylistUpdate { playlist } => {
            Some(EngineEvent::PlaylistSwitched { playlist })
        }
        SupervisorMessage::TransmitterChange { transmitters } => {
            Some(EngineEvent::TransmitterChange(transmitters))
        }
        SupervisorMessage::DecibelChange { targets } => Some(EngineEvent::DecibelChange(targets)),
        SupervisorMessage::LiveBroadcastStart { delay_tones } => {
            Some(EngineEvent::LiveBroadcastStart { delay_tones })
        }
        other => {
            tracing::warn!(?other, "unexpected inbound supervisor message");
            None
        }
    }
}

fn voice_digit(state: VoiceState) -> u8 {
    match state {
        VoiceState::Silence => 0,
        VoiceState::IpAudio => 1,
        VoiceState::MaintenanceMessage => 2,
    }
}

fn option_voltage(voltage: f64) -> Option<f64> {
    if voltage.is_nan() {
        None
    } else {
        Some(voltage)
    }
}

/// Turns engine events into outbound notifications, deduplicating
/// hardware status against the last validated snapshot.
pub(crate) struct OutboundMapper {
    last_status: Option<DacStatus>,
}

impl OutboundMapper {
    pub fn new() -> Self {
        Self { last_status: None }
    }

    pub fn message_for_event(&mut self, event: &EngineEvent) -> Option<SupervisorMessage> {
        match event {
            EngineEvent::SyncLost => Some(SupervisorMessage::ConnectionStatus {
                has_sync: false,
                downtime_millis: None,
                at: Utc::now(),
            }),
            EngineEvent::SyncRegained { downtime, .. } => {
                Some(SupervisorMessage::ConnectionStatus {
                    has_sync: true,
                    downtime_millis: Some(downtime.as_millis() as u64),
                    at: Utc::now(),
                })
            }
            EngineEvent::StatusReceived(status) => {
                let changed = self
                    .last_status
                    .as_ref()
                    .map_or(true, |last| status.differs_from(last));
                self.last_status = Some(status.clone());
                if !changed {
                    return None;
                }
                Some(SupervisorMessage::HardwareStatus {
                    psu1_voltage: option_voltage(status.psu1_voltage),
                    psu2_voltage: option_voltage(status.psu2_voltage),
                    output_gain: status.output_gain,
                    voice_status: status.voice_status.map(voice_digit),
                    recoverable_errors: status.recoverable_errors,
                    unrecoverable_errors: status.unrecoverable_errors,
                    at: Utc::now(),
                })
            }
            EngineEvent::PlaybackEnded {
                item_id, outcome, ..
            } => {
                let (completed, error) = match outcome {
                    PlaybackOutcome::Completed => (true, None),
                    PlaybackOutcome::Aborted { reason } => (false, Some(reason.clone())),
                };
                Some(SupervisorMessage::PlaybackStatus {
                    item_id: item_id.clone(),
                    completed,
                    error,
                    at: Utc::now(),
                })
            }
            EngineEvent::PlaylistSwitched { playlist } => Some(SupervisorMessage::PlaylistSwitch {
                playlist: playlist.clone(),
                at: Utc::now(),
            }),
            EngineEvent::CriticalError { detail } => Some(SupervisorMessage::CriticalError {
                detail: detail.clone(),
                at: Utc::now(),
            }),
            EngineEvent::LiveBroadcastReady => Some(SupervisorMessage::LiveBroadcastStatus {
                ready: true,
                failed: false,
                at: Utc::now(),
            }),
            EngineEvent::LiveBroadcastEnded { failed } => {
                Some(SupervisorMessage::LiveBroadcastStatus {
                    ready: false,
                    failed: *failed,
                    at: Utc::now(),
                })
            }
            // Inbound-origin events stay inside the process
            EngineEvent::ShutdownRequested { .. }
            | EngineEvent::TransmitterChange(_)
            | EngineEvent::DecibelChange(_)
            | EngineEvent::LiveBroadcastStart { .. } => None,
        }
    }
}

/// IPC client to the supervising comms manager
pub struct SupervisorChannel {
    keep_running: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl SupervisorChannel {
    /// Start the dispatcher, event forwarder, and connection manager.
    /// Requires `config.supervisor_port` to be set.
    pub fn start(config: &EngineConfig, bus: EventBus) -> Result<Self, Error> {
        let port = config
            .supervisor_port
            .ok_or_else(|| Error::Config("supervisor_port is required for supervision".into()))?;

        let register = SupervisorMessage::Register {
            source_id: config.input_source.clone(),
            data_port: config.data_port,
            dac_host: config.dac_host.clone(),
            transmitters: config.transmitters.clone(),
            decibel_targets: config.decibel_targets,
        };

        let keep_running = Arc::new(AtomicBool::new(true));
        let (outbound_tx, outbound_rx) = unbounded::<SupervisorMessage>();

        let forwarder = {
            let keep_running = keep_running.clone();
            let rx = bus.subscribe();
            thread::Builder::new()
                .name("supervisor-events".into())
                .spawn(move || forward_events(rx, outbound_tx, keep_running))
                .map_err(|e| Error::Supervisor(SupervisorError::Io(e.to_string())))?
        };

        let io = {
            let keep_running = keep_running.clone();
            let bus = bus.clone();
            thread::Builder::new()
                .name("supervisor-io".into())
                .spawn(move || connection_loop(port, register, outbound_rx, bus, keep_running))
                .map_err(|e| Error::Supervisor(SupervisorError::Io(e.to_string())))?
        };

        Ok(Self {
            keep_running,
            handles: vec![forwarder, io],
        })
    }

    /// Stop both threads and join them. Idempotent.
    pub fn stop(&mut self) {
        self.keep_running.store(false, Ordering::Release);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for SupervisorChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

fn forward_events(
    rx: Receiver<EngineEvent>,
    outbound_tx: Sender<SupervisorMessage>,
    keep_running: Arc<AtomicBool>,
) {
    let mut mapper = OutboundMapper::new();
    while keep_running.load(Ordering::Acquire) {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => {
                if let Some(message) = mapper.message_for_event(&event) {
                    if outbound_tx.send(message).is_err() {
                        break;
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn connection_loop(
    port: u16,
    register: SupervisorMessage,
    outbound_rx: Receiver<SupervisorMessage>,
    bus: EventBus,
    keep_running: Arc<AtomicBool>,
) {
    // Resent after every (re)registration so the parent never misses a
    // sync transition that happened while disconnected
    let mut last_connection_status: Option<SupervisorMessage> = None;
    let mut resend_pending = false;

    while keep_running.load(Ordering::Acquire) {
        let stream = match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("supervisor connect failed: {e}");
                bounded_sleep(
                    &keep_running,
                    Duration::from_millis(SUPERVISOR_RECONNECT_DELAY_MILLIS),
                );
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!("supervisor TCP_NODELAY failed: {e}");
        }
        tracing::info!(port, "supervisor connected");

        let reader_stream = match stream.try_clone() {
            Ok(clone) => clone,
            Err(e) => {
                tracing::warn!("supervisor stream clone failed: {e}");
                bounded_sleep(
                    &keep_running,
                    Duration::from_millis(SUPERVISOR_RECONNECT_DELAY_MILLIS),
                );
                continue;
            }
        };
        let connection_alive = Arc::new(AtomicBool::new(true));
        let reader = {
            let bus = bus.clone();
            let keep_running = keep_running.clone();
            let connection_alive = connection_alive.clone();
            thread::Builder::new()
                .name("supervisor-in".into())
                .spawn(move || inbound_loop(reader_stream, bus, keep_running, connection_alive))
        };

        let mut writer = stream;
        let session_ok = pump_outbound(
            &mut writer,
            &register,
            &outbound_rx,
            &mut last_connection_status,
            &mut resend_pending,
            &keep_running,
        );

        // Best-effort notice, then tear the connection down
        let _ = write_message(
            &mut writer,
            &SupervisorMessage::ShuttingDown { at: Utc::now() },
        );
        connection_alive.store(false, Ordering::Release);
        let _ = writer.shutdown(Shutdown::Both);
        if let Ok(handle) = reader {
            let _ = handle.join();
        }

        if session_ok {
            // Clean stop, or the dispatcher queue is gone; either way
            // there is nothing left to deliver
            break;
        }
        if keep_running.load(Ordering::Acquire) {
            resend_pending = last_connection_status.is_some();
            bounded_sleep(
                &keep_running,
                Duration::from_millis(SUPERVISOR_RECONNECT_DELAY_MILLIS),
            );
        }
    }
}

/// Returns false when the connection failed (as opposed to a shutdown)
fn pump_outbound(
    writer: &mut TcpStream,
    register: &SupervisorMessage,
    outbound_rx: &Receiver<SupervisorMessage>,
    last_connection_status: &mut Option<SupervisorMessage>,
    resend_pending: &mut bool,
    keep_running: &Arc<AtomicBool>,
) -> bool {
    if let Err(e) = write_message(writer, register) {
        tracing::warn!("supervisor registration failed: {e}");
        return false;
    }
    if *resend_pending {
        if let Some(status) = last_connection_status.clone() {
            if let Err(e) = write_message(writer, &status) {
                tracing::warn!("supervisor status resend failed: {e}");
                return false;
            }
        }
        *resend_pending = false;
    }

    while keep_running.load(Ordering::Acquire) {
        match outbound_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(message) => {
                if matches!(message, SupervisorMessage::ConnectionStatus { .. }) {
                    *last_connection_status = Some(message.clone());
                }
                if let Err(e) = write_message(writer, &message) {
                    tracing::warn!("supervisor send failed: {e}");
                    return false;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return true,
        }
    }
    true
}

fn inbound_loop(
    mut stream: TcpStream,
    bus: EventBus,
    keep_running: Arc<AtomicBool>,
    connection_alive: Arc<AtomicBool>,
) {
    // No read timeout: the writer side unblocks this loop by shutting the
    // socket down, which surfaces here as ConnectionClosed
    while keep_running.load(Ordering::Acquire) && connection_alive.load(Ordering::Acquire) {
        match read_message(&mut stream) {
            Ok(message) => {
                tracing::debug!(?message, "supervisor directive");
                if let Some(event) = event_for_directive(message) {
                    bus.publish(event);
                }
            }
            Err(SupervisorError::ConnectionClosed) => break,
            Err(e) => {
                tracing::warn!("supervisor inbound error: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse_status;
    use std::io::Cursor;
    use std::time::Duration;

    fn sample_status() -> DacStatus {
        parse_status("013.8,13.6,22,0.5,0.5,1.0,0.0,1100,17,2").unwrap()
    }

    #[test]
    fn test_framing_round_trip() {
        let original = SupervisorMessage::Register {
            source_id: "suite-7".into(),
            data_port: 2000,
            dac_host: "10.0.0.40".into(),
            transmitters: BTreeSet::from([0, 1]),
            decibel_targets: DecibelTargets::default(),
        };
        let mut wire = Vec::new();
        write_message(&mut wire, &original).unwrap();

        let decoded = read_message(&mut Cursor::new(wire)).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_messages_are_tagged_by_type() {
        let value = serde_json::to_value(SupervisorMessage::Shutdown { immediate: true }).unwrap();
        assert_eq!(value["type"], "shutdown");
        assert_eq!(value["immediate"], true);

        let value = serde_json::to_value(SupervisorMessage::LiveBroadcastStart {
            delay_tones: false,
        })
        .unwrap();
        assert_eq!(value["type"], "live_broadcast_start");
    }

    #[test]
    fn test_truncated_stream_is_connection_closed() {
        let result = read_message(&mut Cursor::new(Vec::<u8>::new()));
        assert!(matches!(result, Err(SupervisorError::ConnectionClosed)));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes());
        let result = read_message(&mut Cursor::new(wire));
        assert!(matches!(result, Err(SupervisorError::MessageTooLarge(_))));
    }

    #[test]
    fn test_directive_dispatch() {
        assert!(matches!(
            event_for_directive(SupervisorMessage::Shutdown { immediate: true }),
            Some(EngineEvent::ShutdownRequested { immediate: true })
        ));
        assert!(matches!(
            event_for_directive(SupervisorMessage::TransmitterChange {
                transmitters: BTreeSet::from([3])
            }),
            Some(EngineEvent::TransmitterChange(_))
        ));
        assert!(matches!(
            event_for_directive(SupervisorMessage::LiveBroadcastStart { delay_tones: false }),
            Some(EngineEvent::LiveBroadcastStart { delay_tones: false })
        ));
        // Outbound shapes arriving inbound are ignored
        assert!(event_for_directive(SupervisorMessage::ShuttingDown { at: Utc::now() }).is_none());
    }

    #[test]
    fn test_mapper_connection_status() {
        let mut mapper = OutboundMapper::new();
        let lost = mapper.message_for_event(&EngineEvent::SyncLost).unwrap();
        assert!(matches!(
            lost,
            SupervisorMessage::ConnectionStatus {
                has_sync: false,
                ..
            }
        ));

        let regained = mapper
            .message_for_event(&EngineEvent::SyncRegained {
                downtime: Duration::from_millis(1500),
                restart_item: false,
            })
            .unwrap();
        assert!(matches!(
            regained,
            SupervisorMessage::ConnectionStatus {
                has_sync: true,
                downtime_millis: Some(1500),
                ..
            }
        ));
    }

    #[test]
    fn test_mapper_deduplicates_hardware_status() {
        let mut mapper = OutboundMapper::new();
        let status = sample_status();

        let first = mapper.message_for_event(&EngineEvent::StatusReceived(status.clone()));
        assert!(matches!(
            first,
            Some(SupervisorMessage::HardwareStatus { .. })
        ));

        // Identical snapshot: no notification
        let repeat = mapper.message_for_event(&EngineEvent::StatusReceived(status.clone()));
        assert!(repeat.is_none());

        let mut changed = status;
        changed.recoverable_errors += 1;
        let third = mapper.message_for_event(&EngineEvent::StatusReceived(changed));
        assert!(matches!(
            third,
            Some(SupervisorMessage::HardwareStatus {
                recoverable_errors: 18,
                ..
            })
        ));
    }

    #[test]
    fn test_mapper_playback_and_live() {
        let mut mapper = OutboundMapper::new();
        let aborted = mapper
            .message_for_event(&EngineEvent::PlaybackEnded {
                item_id: "msg-4".into(),
                outcome: PlaybackOutcome::Aborted {
                    reason: "overflow".into(),
                },
                origin: crate::events::PlaybackOrigin::Primary,
            })
            .unwrap();
        assert!(matches!(
            aborted,
            SupervisorMessage::PlaybackStatus {
                completed: false,
                ..
            }
        ));

        let ready = mapper
            .message_for_event(&EngineEvent::LiveBroadcastReady)
            .unwrap();
        assert!(matches!(
            ready,
            SupervisorMessage::LiveBroadcastStatus { ready: true, .. }
        ));

        // Directive echoes never leave the process
        assert!(mapper
            .message_for_event(&EngineEvent::ShutdownRequested { immediate: false })
            .is_none());
    }
}
