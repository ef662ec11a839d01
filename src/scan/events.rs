//! Scan controller events.
//!
//! Events go out on a `tokio::sync::broadcast` channel; the current state is
//! also kept in a `watch` channel so late subscribers can read it without
//! replaying history. Subscribers that only care about some variants filter by
//! [`EventKind`].

use std::collections::HashSet;
use std::path::PathBuf;

use tokio::sync::{broadcast, watch};

use super::context::StashKey;
use super::state::ScanState;

/// Result of one evaluator for one point.
#[derive(Debug, Clone, PartialEq)]
pub struct PointResult {
    /// Evaluation name.
    pub evaluation: String,
    /// Value written to the trace (after averaging).
    pub value: f64,
    /// Error bar as absolute `(low, high)` bounds.
    pub interval: Option<(f64, f64)>,
}

/// Something the scan controller reports.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// The controller entered a new state.
    StateChanged(ScanState),
    /// Points acquired so far; `total` is `None` for free-running scans.
    Progress {
        /// Points done.
        current: usize,
        /// Points of the run.
        total: Option<usize>,
    },
    /// One point was evaluated.
    PacketEvaluated {
        /// Scan index of the point.
        index: usize,
        /// x of the point.
        x: f64,
        /// Per-evaluation results.
        results: Vec<PointResult>,
    },
    /// Timing violations at program addresses not reported before in this run.
    TimingViolations {
        /// Newly reported addresses.
        new: Vec<u32>,
    },
    /// The run halted; the reason is shown to the user.
    Interrupted {
        /// Reason.
        reason: String,
    },
    /// The trace collection was finalized; `path` is `None` when not saved.
    Finalized {
        /// File the collection was committed to.
        path: Option<PathBuf>,
        /// Finalization reason.
        reason: String,
    },
    /// The stash changed.
    StashChanged(Vec<StashKey>),
}

/// Variant selector for subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`ScanEvent::StateChanged`]
    StateChanged,
    /// [`ScanEvent::Progress`]
    Progress,
    /// [`ScanEvent::PacketEvaluated`]
    PacketEvaluated,
    /// [`ScanEvent::TimingViolations`]
    TimingViolations,
    /// [`ScanEvent::Interrupted`]
    Interrupted,
    /// [`ScanEvent::Finalized`]
    Finalized,
    /// [`ScanEvent::StashChanged`]
    StashChanged,
}

impl ScanEvent {
    /// Variant of the event.
    pub fn kind(&self) -> EventKind {
        match self {
            ScanEvent::StateChanged(_) => EventKind::StateChanged,
            ScanEvent::Progress { .. } => EventKind::Progress,
            ScanEvent::PacketEvaluated { .. } => EventKind::PacketEvaluated,
            ScanEvent::TimingViolations { .. } => EventKind::TimingViolations,
            ScanEvent::Interrupted { .. } => EventKind::Interrupted,
            ScanEvent::Finalized { .. } => EventKind::Finalized,
            ScanEvent::StashChanged(_) => EventKind::StashChanged,
        }
    }
}

/// Publisher side of the controller's events.
#[derive(Debug, Clone)]
pub struct EventBus {
    events: broadcast::Sender<ScanEvent>,
    state: watch::Sender<ScanState>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    /// Bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        let (state, _) = watch::channel(ScanState::Idle);
        Self { events, state }
    }

    /// Publish an event. Events without subscribers are dropped.
    pub fn emit(&self, event: ScanEvent) {
        if let ScanEvent::StateChanged(state) = &event {
            self.state.send_replace(*state);
        }
        let _ = self.events.send(event);
    }

    /// Receive every event.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    /// Receive only events of the given kinds.
    pub fn subscribe_to(&self, kinds: &[EventKind]) -> EventSubscription {
        EventSubscription {
            rx: self.events.subscribe(),
            kinds: kinds.iter().copied().collect(),
        }
    }

    /// Watch the controller state.
    pub fn state(&self) -> watch::Receiver<ScanState> {
        self.state.subscribe()
    }
}

/// Filtered event receiver.
#[derive(Debug)]
pub struct EventSubscription {
    rx: broadcast::Receiver<ScanEvent>,
    kinds: HashSet<EventKind>,
}

impl EventSubscription {
    /// Next matching event; `None` once the bus is gone. Lagged events are
    /// skipped.
    pub async fn next(&mut self) -> Option<ScanEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.kinds.contains(&event.kind()) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscription_filters_by_kind() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe_to(&[EventKind::Finalized]);
        let state = bus.state();
        bus.emit(ScanEvent::StateChanged(ScanState::Running));
        bus.emit(ScanEvent::Progress {
            current: 1,
            total: Some(2),
        });
        bus.emit(ScanEvent::Finalized {
            path: None,
            reason: "aborted".into(),
        });
        assert_eq!(
            sub.next().await,
            Some(ScanEvent::Finalized {
                path: None,
                reason: "aborted".into()
            })
        );
        assert_eq!(*state.borrow(), ScanState::Running);
    }
}
