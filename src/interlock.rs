//! Interlock gate.
//!
//! External lock channels (a wavemeter lock, a cavity lock) report whether they
//! are locked. The gate combines them: the scan may run only while every
//! channel is locked. Any channel unlocking suspends the scan; the scan is
//! released when the last unlocked channel locks again.
//!
//! The combined state is published on a `watch` channel that the scan runner
//! listens to.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

/// Lock state of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockState {
    /// Channel is locked.
    Locked,
    /// Channel lost lock.
    Unlocked,
}

/// Change of the combined gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateTransition {
    /// The first channel unlocked: the scan must halt.
    Suspend,
    /// The last unlocked channel locked: the scan may continue.
    Release,
}

/// Combines lock channels into one go / no-go signal.
#[derive(Debug, Clone)]
pub struct InterlockGate {
    channels: Arc<Mutex<BTreeMap<String, LockState>>>,
    open: watch::Sender<bool>,
}

impl Default for InterlockGate {
    fn default() -> Self {
        Self::new()
    }
}

impl InterlockGate {
    /// Gate without channels (always open).
    pub fn new() -> Self {
        let (open, _) = watch::channel(true);
        Self {
            channels: Arc::new(Mutex::new(BTreeMap::new())),
            open,
        }
    }

    /// Report the state of `channel`. Returns the transition of the combined
    /// state, if any.
    pub fn set(&self, channel: &str, state: LockState) -> Option<GateTransition> {
        let mut channels = self.channels.lock();
        let was_open = channels.values().all(|s| *s == LockState::Locked);
        channels.insert(channel.to_string(), state);
        let is_open = channels.values().all(|s| *s == LockState::Locked);
        drop(channels);
        let transition = match (was_open, is_open) {
            (true, false) => Some(GateTransition::Suspend),
            (false, true) => Some(GateTransition::Release),
            _ => None,
        };
        if let Some(transition) = transition {
            info!(channel, ?state, ?transition, "interlock changed");
            self.open.send_replace(is_open);
        }
        transition
    }

    /// Stop tracking `channel`.
    pub fn remove(&self, channel: &str) -> Option<GateTransition> {
        let mut channels = self.channels.lock();
        let was_open = channels.values().all(|s| *s == LockState::Locked);
        channels.remove(channel);
        let is_open = channels.values().all(|s| *s == LockState::Locked);
        drop(channels);
        if !was_open && is_open {
            self.open.send_replace(true);
            return Some(GateTransition::Release);
        }
        None
    }

    /// Whether every channel is locked.
    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Channels that are currently unlocked.
    pub fn unlocked(&self) -> Vec<String> {
        self.channels
            .lock()
            .iter()
            .filter(|(_, s)| **s == LockState::Unlocked)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Watch the combined state (`true` = all locked).
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.open.subscribe()
    }
}
