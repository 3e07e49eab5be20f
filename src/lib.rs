//! # DAC Streamer
//!
//! Real-time audio transmission engine for a UDP-attached hardware DAC.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                         ENGINE PROCESS                             │
//! │                                                                    │
//! │  ┌──────────────┐      events       ┌─────────────────────────┐    │
//! │  │SyncController│◄─────────────────►│        EventBus         │    │
//! │  │(control loop)│  SyncLost/Regain  │  (crossbeam pub/sub)    │    │
//! │  └──────┬───────┘  StatusReceived   └───────────┬─────────────┘    │
//! │         │ heartbeats                            │ directives       │
//! │         ▼                                       ▼                  │
//! │  ┌──────────────┐                   ┌─────────────────────────┐    │
//! │  │ UDP control  │                   │    SupervisorChannel    │    │
//! │  │ port+100     │                   │  (TCP loopback client)  │    │
//! │  └──────────────┘                   └───────────┬─────────────┘    │
//! │                                                 │                  │
//! │  ┌──────────────┐    pacing interval            ▼                  │
//! │  │   Pacing     │───────────────┐     ┌──────────────────┐         │
//! │  │  Controller  │               │     │  parent process  │         │
//! │  └──────────────┘               ▼     │ (comms manager)  │         │
//! │  ┌──────────────────────────────────┐ └──────────────────┘         │
//! │  │          TransmitEngine          │                              │
//! │  │  playlist / live / maintenance   │                              │
//! │  │  AudioSource → regulate → frame  │                              │
//! │  └───────────────┬──────────────────┘                              │
//! │                  │ 340-byte frames                                 │
//! │                  ▼                                                 │
//! │  ┌──────────────────────────────────┐                              │
//! │  │      UDP data port → DAC         │                              │
//! │  └──────────────────────────────────┘                              │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The DAC reports its jitter-buffer depth in every status frame; the pacing
//! controller turns that depth into the next inter-packet delay, keeping the
//! buffer near a configured watermark. Loss of sync pauses transmission until
//! the heartbeat handshake recovers.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod net;
pub mod pacing;
pub mod protocol;
pub mod regulate;
pub mod session;
pub mod supervisor;
pub mod sync;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// One audio payload chunk: 20 ms of 8 kHz G.711 audio
    pub const SINGLE_PAYLOAD_SIZE: usize = 160;

    /// Data frame size: 12-byte header + 8-byte extension + two payload slots
    pub const FRAME_SIZE: usize = 12 + 8 + 2 * SINGLE_PAYLOAD_SIZE;

    /// Sequence number step between consecutive frames
    pub const SEQUENCE_INCREMENT: u32 = 1;

    /// Timestamp step between consecutive frames (one payload of samples)
    pub const TIMESTAMP_INCREMENT: u32 = SINGLE_PAYLOAD_SIZE as u32;

    /// Audio byte rate (8 kHz, one byte per sample)
    pub const BYTES_PER_SECOND: usize = 8_000;

    /// Heartbeat send cadence while synced
    pub const MILLIS_BETWEEN_HEARTBEAT: u64 = 300;

    /// Consecutive receive timeouts before sync is declared lost
    pub const MISSED_HEARTBEATS_THRESHOLD: u32 = 10;

    /// Time without a successful heartbeat send before sync is declared lost
    pub const COMPLETE_SYNC_LOST_TIME_MILLIS: u64 = 5_000;

    /// Downtime beyond which a regained sync restarts the current item
    /// (the DAC flushes its jitter buffer after this long without data)
    pub const SYNC_DOWNTIME_RESTART_THRESHOLD_MILLIS: u64 = 10_000;

    /// Back-off between initial-sync attempts
    pub const INITIAL_SYNC_RETRY_DELAY_MILLIS: u64 = 1_000;

    /// Control socket receive timeout
    pub const CONTROL_RECV_TIMEOUT_MILLIS: u64 = 100;

    /// DAC status report cadence the aggressive pacing strategy spreads
    /// its packets over
    pub const STATUS_INTERVAL_MILLIS: u64 = 100;

    /// Lower bound on the inter-packet send interval
    pub const FAST_CYCLE_TIME_MILLIS: u64 = 5;

    /// Send interval when the jitter buffer sits exactly at the watermark
    pub const DEFAULT_CYCLE_TIME_MILLIS: u64 = 20;

    /// Upper bound on the inter-packet send interval
    pub const SLOW_CYCLE_TIME_MILLIS: u64 = 100;

    /// Target jitter-buffer depth in packets
    pub const DEFAULT_WATERMARK_PACKETS: i32 = 25;

    /// No loop sleeps longer than this in one step, bounding shutdown latency
    pub const MAX_SLEEP_GRANULARITY_MILLIS: u64 = 50;

    /// Control port = data port + this offset
    pub const CONTROL_PORT_OFFSET: u16 = 100;

    /// Delay before the supervisor channel retries a failed connection
    pub const SUPERVISOR_RECONNECT_DELAY_MILLIS: u64 = 3_000;

    /// Outbound sync handshake frame
    pub const INITIAL_SYNC_FRAME: &[u8] = b"01000";

    /// Outbound heartbeat frame
    pub const HEARTBEAT_FRAME: &[u8] = b"00000";

    /// First character of a well-formed DAC status frame
    pub const STATUS_INDICATOR: char = '0';

    /// Delimiter between status frame fields
    pub const STATUS_DELIMITER: char = ',';

    /// Number of fields in a status frame after the indicator
    pub const STATUS_FIELD_COUNT: usize = 10;

    /// PSU voltage sentinel the DAC sends when it has no reading
    pub const NO_VOLTAGE_TOKEN: &str = "NV";

    /// Maximum datagram size accepted on the control socket
    pub const MAX_CONTROL_DATAGRAM: usize = 256;
}
