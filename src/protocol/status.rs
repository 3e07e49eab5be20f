//! DAC heartbeat status frame parser
//!
//! Every heartbeat response is an ASCII frame: a `'0'` indicator followed by
//! ten comma-separated fields: two PSU voltages, the jitter-buffer depth,
//! four per-channel output gains, a four-digit voice-activity code, and the
//! recoverable / unrecoverable packet-error counters. Anything else (the
//! DAC's "no valid sync" sentinel included) fails to parse, and the sync
//! controller treats that as loss of sync.

use crate::constants::{
    NO_VOLTAGE_TOKEN, STATUS_DELIMITER, STATUS_FIELD_COUNT, STATUS_INDICATOR,
};
use crate::error::ProtocolError;

/// Per-channel voice activity reported by the DAC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Silence,
    IpAudio,
    MaintenanceMessage,
}

impl VoiceState {
    fn from_digit(digit: char) -> Option<VoiceState> {
        match digit {
            '0' => Some(VoiceState::Silence),
            '1' => Some(VoiceState::IpAudio),
            '2' => Some(VoiceState::MaintenanceMessage),
            _ => None,
        }
    }
}

/// One parsed heartbeat status snapshot
///
/// Immutable; consumed once by the sync controller, which keeps only the
/// prior snapshot for delta logging.
#[derive(Debug, Clone, PartialEq)]
pub struct DacStatus {
    /// Primary supply voltage; NaN when the DAC reports no reading
    pub psu1_voltage: f64,
    /// Secondary supply voltage; NaN when the DAC reports no reading
    pub psu2_voltage: f64,
    /// Packets currently queued in the DAC's jitter buffer
    pub jitter_buffer_depth: i32,
    pub output_gain: [f64; 4],
    pub voice_status: [VoiceState; 4],
    pub recoverable_errors: u32,
    pub unrecoverable_errors: u32,
}

impl DacStatus {
    /// True when any field a supervisor cares about differs from `other`.
    /// Voltage comparison treats two NaNs as equal.
    pub fn differs_from(&self, other: &DacStatus) -> bool {
        fn voltage_differs(a: f64, b: f64) -> bool {
            !(a.is_nan() && b.is_nan()) && a != b
        }
        voltage_differs(self.psu1_voltage, other.psu1_voltage)
            || voltage_differs(self.psu2_voltage, other.psu2_voltage)
            || self.output_gain != other.output_gain
            || self.voice_status != other.voice_status
            || self.recoverable_errors != other.recoverable_errors
            || self.unrecoverable_errors != other.unrecoverable_errors
    }
}

fn parse_voltage(field: &str, name: &'static str) -> Result<f64, ProtocolError> {
    if field == NO_VOLTAGE_TOKEN {
        return Ok(f64::NAN);
    }
    field
        .parse::<f64>()
        .map_err(|_| ProtocolError::MalformedField { field: name })
}

fn parse_gain(field: &str, name: &'static str) -> Result<f64, ProtocolError> {
    field
        .parse::<f64>()
        .map_err(|_| ProtocolError::MalformedField { field: name })
}

fn parse_voice_code(field: &str) -> Result<[VoiceState; 4], ProtocolError> {
    let malformed = ProtocolError::MalformedField {
        field: "voice_status",
    };
    let mut chars = field.chars();
    let mut states = [VoiceState::Silence; 4];
    for state in states.iter_mut() {
        let digit = chars.next().ok_or(malformed.clone())?;
        *state = VoiceState::from_digit(digit).ok_or(malformed.clone())?;
    }
    if chars.next().is_some() {
        return Err(malformed);
    }
    Ok(states)
}

fn parse_counter(field: &str, name: &'static str) -> Result<u32, ProtocolError> {
    field
        .parse::<u32>()
        .map_err(|_| ProtocolError::MalformedField { field: name })
}

/// Parse a raw control-port datagram into a status snapshot.
///
/// Pure function; the caller decides what a failure means for sync state.
pub fn parse_status(raw: &str) -> Result<DacStatus, ProtocolError> {
    let mut chars = raw.chars();
    if chars.next() != Some(STATUS_INDICATOR) {
        return Err(ProtocolError::NotAStatusMessage);
    }

    let rest = chars.as_str().trim_end();
    let fields: Vec<&str> = rest.split(STATUS_DELIMITER).collect();
    if fields.len() != STATUS_FIELD_COUNT {
        return Err(ProtocolError::FieldCountMismatch {
            expected: STATUS_FIELD_COUNT,
            found: fields.len(),
        });
    }

    Ok(DacStatus {
        psu1_voltage: parse_voltage(fields[0], "psu1_voltage")?,
        psu2_voltage: parse_voltage(fields[1], "psu2_voltage")?,
        jitter_buffer_depth: fields[2]
            .parse::<i32>()
            .map_err(|_| ProtocolError::MalformedField {
                field: "jitter_buffer_depth",
            })?,
        output_gain: [
            parse_gain(fields[3], "output_gain_1")?,
            parse_gain(fields[4], "output_gain_2")?,
            parse_gain(fields[5], "output_gain_3")?,
            parse_gain(fields[6], "output_gain_4")?,
        ],
        voice_status: parse_voice_code(fields[7])?,
        recoverable_errors: parse_counter(fields[8], "recoverable_errors")?,
        unrecoverable_errors: parse_counter(fields[9], "unrecoverable_errors")?,
    })
}
