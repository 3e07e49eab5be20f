//! Adaptive packet pacing
//!
//! The DAC reports its jitter-buffer depth in every status frame; the pacing
//! controller converts the distance from the configured watermark into the
//! next inter-packet delay. Two strategies:
//!
//! - **Aggressive** pushes the buffer back to the watermark within a single
//!   status interval. It overshoots when a status update is missed, because
//!   it keeps sending at the corrective rate until the next report arrives.
//! - **Stable** nudges the interval by the depth error each report and
//!   converges over several intervals; it tolerates missed or late reports.
//!
//! Both are kept selectable; the overshoot is a known trade-off of the
//! aggressive strategy, not a bug.
//!
//! The computed interval lives in an atomic cell: written only by the
//! control-loop thread (single writer), read by the transmit thread before
//! each sleep. A read may be stale by at most one status period.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Deserialize;

use crate::constants::{
    DEFAULT_CYCLE_TIME_MILLIS, FAST_CYCLE_TIME_MILLIS, SLOW_CYCLE_TIME_MILLIS,
    STATUS_INTERVAL_MILLIS,
};
use crate::protocol::DacStatus;

/// Pacing strategy, chosen once at startup from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacingStrategy {
    Aggressive,
    Stable,
}

impl PacingStrategy {
    /// Compute the next inter-packet interval in milliseconds from the
    /// current distance to the watermark (positive = buffer underfull).
    /// Pure; always within `[FAST_CYCLE_TIME, SLOW_CYCLE_TIME]`.
    pub fn next_interval(&self, difference_from_watermark: i32) -> u64 {
        match self {
            PacingStrategy::Aggressive => {
                if difference_from_watermark < 0 {
                    // Buffer overfull: back off hard until the next report
                    SLOW_CYCLE_TIME_MILLIS
                } else {
                    let packets_before_next_status =
                        difference_from_watermark.unsigned_abs() as u64 + 5;
                    (STATUS_INTERVAL_MILLIS / packets_before_next_status)
                        .max(FAST_CYCLE_TIME_MILLIS)
                }
            }
            PacingStrategy::Stable => {
                let raw = DEFAULT_CYCLE_TIME_MILLIS as i64 - difference_from_watermark as i64;
                raw.clamp(FAST_CYCLE_TIME_MILLIS as i64, SLOW_CYCLE_TIME_MILLIS as i64) as u64
            }
        }
    }
}

/// Owns the pacing state; updated from each received status, read by the
/// transmit loop.
pub struct PacingController {
    strategy: PacingStrategy,
    watermark_packets: i32,
    interval_millis: Arc<AtomicU64>,
}

impl PacingController {
    pub fn new(strategy: PacingStrategy, watermark_packets: i32) -> Self {
        Self {
            strategy,
            watermark_packets,
            interval_millis: Arc::new(AtomicU64::new(DEFAULT_CYCLE_TIME_MILLIS)),
        }
    }

    /// Fold one status report into the interval cell.
    /// Called only from the control-loop thread.
    pub fn observe(&self, status: &DacStatus) {
        let difference = self.watermark_packets - status.jitter_buffer_depth;
        let interval = self.strategy.next_interval(difference);
        self.interval_millis.store(interval, Ordering::Release);
        tracing::trace!(
            depth = status.jitter_buffer_depth,
            difference,
            interval,
            "pacing update"
        );
    }

    /// Current interval in milliseconds; safe to call from any thread
    pub fn current_interval_millis(&self) -> u64 {
        self.interval_millis.load(Ordering::Acquire)
    }

    /// Shared read handle for the transmit thread
    pub fn interval_cell(&self) -> Arc<AtomicU64> {
        self.interval_millis.clone()
    }

    pub fn strategy(&self) -> PacingStrategy {
        self.strategy
    }

    pub fn watermark_packets(&self) -> i32 {
        self.watermark_packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::VoiceState;
    use proptest::prelude::*;

    fn status_with_depth(depth: i32) -> DacStatus {
        DacStatus {
            psu1_voltage: 13.8,
            psu2_voltage: 13.8,
            jitter_buffer_depth: depth,
            output_gain: [0.0; 4],
            voice_status: [VoiceState::Silence; 4],
            recoverable_errors: 0,
            unrecoverable_errors: 0,
        }
    }

    #[test]
    fn test_aggressive_backs_off_when_overfull() {
        assert_eq!(
            PacingStrategy::Aggressive.next_interval(-1),
            SLOW_CYCLE_TIME_MILLIS
        );
        assert_eq!(
            PacingStrategy::Aggressive.next_interval(-100),
            SLOW_CYCLE_TIME_MILLIS
        );
    }

    #[test]
    fn test_aggressive_at_watermark() {
        // diff 0 -> 100 / 5 = 20ms, the nominal frame rate
        assert_eq!(
            PacingStrategy::Aggressive.next_interval(0),
            DEFAULT_CYCLE_TIME_MILLIS
        );
    }

    #[test]
    fn test_aggressive_speeds_up_when_underfull() {
        // diff 15 -> 100 / 20 = 5ms, already at the floor
        assert_eq!(
            PacingStrategy::Aggressive.next_interval(15),
            FAST_CYCLE_TIME_MILLIS
        );
        let at_10 = PacingStrategy::Aggressive.next_interval(10);
        let at_2 = PacingStrategy::Aggressive.next_interval(2);
        assert!(at_10 < at_2);
    }

    #[test]
    fn test_stable_converges_linearly() {
        assert_eq!(
            PacingStrategy::Stable.next_interval(0),
            DEFAULT_CYCLE_TIME_MILLIS
        );
        assert_eq!(
            PacingStrategy::Stable.next_interval(5),
            DEFAULT_CYCLE_TIME_MILLIS - 5
        );
        assert_eq!(
            PacingStrategy::Stable.next_interval(-5),
            DEFAULT_CYCLE_TIME_MILLIS + 5
        );
    }

    #[test]
    fn test_controller_updates_cell() {
        let pacing = PacingController::new(PacingStrategy::Stable, 25);
        assert_eq!(pacing.current_interval_millis(), DEFAULT_CYCLE_TIME_MILLIS);

        pacing.observe(&status_with_depth(25));
        assert_eq!(pacing.current_interval_millis(), DEFAULT_CYCLE_TIME_MILLIS);

        pacing.observe(&status_with_depth(40));
        assert_eq!(pacing.current_interval_millis(), DEFAULT_CYCLE_TIME_MILLIS + 15);
    }

    proptest! {
        #[test]
        fn prop_intervals_stay_within_bounds(diff in i32::MIN..i32::MAX) {
            for strategy in [PacingStrategy::Aggressive, PacingStrategy::Stable] {
                let interval = strategy.next_interval(diff);
                prop_assert!(interval >= FAST_CYCLE_TIME_MILLIS);
                prop_assert!(interval <= SLOW_CYCLE_TIME_MILLIS);
            }
        }
    }
}
