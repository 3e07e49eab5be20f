//! Internal publish/subscribe event channel
//!
//! All cross-thread coordination travels through this bus as immutable
//! event values; no component calls into another component's internals.
//! Built on crossbeam channels: each subscriber owns an unbounded receiver
//! and publishers clone the event into every live subscription.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::protocol::DacStatus;
use crate::regulate::DecibelTargets;

/// Outcome of one playback item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    Aborted { reason: String },
}

/// Which transmit engine produced a playback event. Item ids are chosen
/// by the playlist collaborator, so they cannot identify the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOrigin {
    /// The session's main engine (playlist or maintenance)
    Primary,
    /// A live-broadcast override engine
    Live,
}

/// Events exchanged between the engine's threads
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Sync with the DAC was lost; data frames will be ignored until regain
    SyncLost,
    /// Sync handshake recovered after `downtime`. When `restart_item` is
    /// set the DAC flushed its jitter buffer and the current item must
    /// restart from its beginning rather than resume mid-stream.
    SyncRegained {
        downtime: Duration,
        restart_item: bool,
    },
    /// A heartbeat status frame was received and parsed
    StatusReceived(DacStatus),
    /// A playback item finished or was abandoned
    PlaybackEnded {
        item_id: String,
        outcome: PlaybackOutcome,
        origin: PlaybackOrigin,
    },
    /// The active playlist changed (forwarded to the supervisor)
    PlaylistSwitched { playlist: String },
    /// Replace the transmitter set used for subsequent frames
    TransmitterChange(BTreeSet<u8>),
    /// Replace the decibel targets used for subsequent regulation
    DecibelChange(DecibelTargets),
    /// Start a live broadcast, overriding playlist playback.
    /// `delay_tones` requests alert tones before the live audio; only the
    /// immediate path is supported and a delayed request is rejected.
    LiveBroadcastStart { delay_tones: bool },
    /// Live broadcast is running and the parent may open the feed
    LiveBroadcastReady,
    /// Live broadcast finished and playlist playback may resume
    LiveBroadcastEnded { failed: bool },
    /// Unrecoverable fault that the supervisor must hear about
    CriticalError { detail: String },
    /// Tear the session down. `immediate` abandons the in-flight item.
    ShutdownRequested { immediate: bool },
}

/// Multi-producer/multi-consumer event bus
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<EngineEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Open a new subscription receiving every event published after this call
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Publish an event to every live subscriber.
    /// Subscriptions whose receiver was dropped are pruned here.
    pub fn publish(&self, event: EngineEvent) {
        let mut subs = self.subscribers.lock();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscriptions, for diagnostics
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();

        bus.publish(EngineEvent::SyncLost);

        assert!(matches!(rx1.try_recv().unwrap(), EngineEvent::SyncLost));
        assert!(matches!(rx2.try_recv().unwrap(), EngineEvent::SyncLost));
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let rx1 = bus.subscribe();
        {
            let _rx2 = bus.subscribe();
        }
        bus.publish(EngineEvent::SyncLost);
        assert_eq!(bus.subscriber_count(), 1);
        assert!(rx1.try_recv().is_ok());
    }

    #[test]
    fn test_subscription_sees_only_later_events() {
        let bus = EventBus::new();
        bus.publish(EngineEvent::SyncLost);
        let rx = bus.subscribe();
        bus.publish(EngineEvent::ShutdownRequested { immediate: false });
        assert!(matches!(
            rx.try_recv().unwrap(),
            EngineEvent::ShutdownRequested { immediate: false }
        ));
        assert!(rx.try_recv().is_err());
    }
}
