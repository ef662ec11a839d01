//! Scan methods: who advances x.
//!
//! Internal scans need nothing from the host beyond update words. External
//! scans move a [`ScanParameter`] before every point; the move is a
//! [`SettleHandshake`] that the controller advances on its settle timer, so a
//! slow parameter never blocks packet handling or an abort.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::descriptor::{ScanDescriptor, ScanTarget};
use super::parameter::{ParameterRegistry, ScanParameter};
use crate::error::{AppResult, DaqError};

/// Phase of a settle handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlePhase {
    /// Reading the value to restore later.
    Snapshotting,
    /// About to request the target value.
    Setting,
    /// Waiting for the parameter to report settled.
    Settling,
    /// Target reached.
    Ready,
    /// Moving back to the snapshot.
    Restoring,
}

/// What one poll found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleStatus {
    /// Still moving.
    Pending,
    /// At the target; the point may run.
    Ready,
    /// Back at the snapshot.
    Restored,
    /// The parameter did not settle in time.
    TimedOut,
}

/// Move-and-settle state of an external parameter.
pub struct SettleHandshake {
    parameter: Arc<dyn ScanParameter>,
    timeout: Duration,
    phase: SettlePhase,
    snapshot: Option<f64>,
    target: f64,
    requested: bool,
    since: Instant,
}

impl std::fmt::Debug for SettleHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettleHandshake")
            .field("parameter", &self.parameter.name())
            .field("phase", &self.phase)
            .field("snapshot", &self.snapshot)
            .field("target", &self.target)
            .finish()
    }
}

impl SettleHandshake {
    /// Handshake that snapshots the current value, then moves to `target`.
    pub fn new(parameter: Arc<dyn ScanParameter>, timeout: Duration) -> Self {
        Self {
            parameter,
            timeout,
            phase: SettlePhase::Snapshotting,
            snapshot: None,
            target: f64::NAN,
            requested: false,
            since: Instant::now(),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> SettlePhase {
        self.phase
    }

    /// Value saved before the first move.
    pub fn snapshot(&self) -> Option<f64> {
        self.snapshot
    }

    /// Parameter name.
    pub fn parameter_name(&self) -> &str {
        self.parameter.name()
    }

    /// Request a move to `target`. The snapshot is taken on the next poll if
    /// there is none yet.
    pub fn move_to(&mut self, target: f64) {
        self.target = target;
        self.requested = false;
        self.phase = if self.snapshot.is_some() {
            SettlePhase::Setting
        } else {
            SettlePhase::Snapshotting
        };
    }

    /// Request a move back to the snapshot. Returns `false` if nothing was
    /// snapshotted, in which case there is nothing to restore.
    pub fn restore(&mut self) -> bool {
        if self.snapshot.is_none() {
            return false;
        }
        self.phase = SettlePhase::Restoring;
        self.requested = false;
        true
    }

    /// Put the snapshot back without waiting for it to settle.
    pub async fn restore_now(&mut self) -> AppResult<()> {
        if let Some(value) = self.snapshot {
            self.phase = SettlePhase::Restoring;
            self.requested = true;
            self.parameter
                .set_value(value)
                .await
                .map_err(|e| self.error(e))?;
        }
        Ok(())
    }

    fn error(&self, e: anyhow::Error) -> DaqError {
        DaqError::Parameter {
            name: self.parameter.name().to_string(),
            message: format!("{e:#}"),
        }
    }

    /// Advance as far as possible without waiting.
    pub async fn poll(&mut self, now: Instant) -> AppResult<SettleStatus> {
        loop {
            match self.phase {
                SettlePhase::Snapshotting => {
                    let value = self.parameter.value().await.map_err(|e| self.error(e))?;
                    debug!(parameter = self.parameter.name(), value, "parameter snapshot");
                    self.snapshot = Some(value);
                    self.phase = SettlePhase::Setting;
                }
                SettlePhase::Setting => {
                    self.parameter
                        .set_value(self.target)
                        .await
                        .map_err(|e| self.error(e))?;
                    self.since = now;
                    self.phase = SettlePhase::Settling;
                }
                SettlePhase::Settling => {
                    if self.parameter.is_settled().await.map_err(|e| self.error(e))? {
                        self.phase = SettlePhase::Ready;
                        return Ok(SettleStatus::Ready);
                    }
                    return Ok(self.pending_or_timeout(now));
                }
                SettlePhase::Ready => return Ok(SettleStatus::Ready),
                SettlePhase::Restoring => {
                    let Some(value) = self.snapshot else {
                        return Ok(SettleStatus::Restored);
                    };
                    if !self.requested {
                        self.parameter
                            .set_value(value)
                            .await
                            .map_err(|e| self.error(e))?;
                        self.requested = true;
                        self.since = now;
                    }
                    if self.parameter.is_settled().await.map_err(|e| self.error(e))? {
                        info!(parameter = self.parameter.name(), value, "parameter restored");
                        return Ok(SettleStatus::Restored);
                    }
                    return Ok(self.pending_or_timeout(now));
                }
            }
        }
    }

    fn pending_or_timeout(&self, now: Instant) -> SettleStatus {
        if now.saturating_duration_since(self.since) > self.timeout {
            warn!(
                parameter = self.parameter.name(),
                timeout_ms = self.timeout.as_millis() as u64,
                "parameter did not settle"
            );
            SettleStatus::TimedOut
        } else {
            SettleStatus::Pending
        }
    }
}

/// How x is advanced for one scan.
#[derive(Debug)]
pub enum ScanMethod {
    /// The pulse program steps x from update words.
    Internal,
    /// The host steps an external parameter.
    External(SettleHandshake),
}

impl ScanMethod {
    /// Method for `scan`, looking up external parameters in `registry`.
    pub fn for_scan(
        scan: &ScanDescriptor,
        registry: &ParameterRegistry,
        default_timeout: Duration,
    ) -> AppResult<Self> {
        match scan.target {
            ScanTarget::Internal => Ok(ScanMethod::Internal),
            ScanTarget::External => {
                let parameter = registry.get(&scan.parameter).ok_or_else(|| {
                    DaqError::Configuration(format!("unknown scan parameter '{}'", scan.parameter))
                })?;
                let timeout = scan
                    .settle_timeout_ms
                    .map(Duration::from_millis)
                    .or_else(|| parameter.settle_timeout())
                    .unwrap_or(default_timeout);
                Ok(ScanMethod::External(SettleHandshake::new(parameter, timeout)))
            }
        }
    }

    /// Whether the host moves x.
    pub fn is_external(&self) -> bool {
        matches!(self, ScanMethod::External(_))
    }

    /// The handshake of an external scan.
    pub fn handshake(&mut self) -> Option<&mut SettleHandshake> {
        match self {
            ScanMethod::Internal => None,
            ScanMethod::External(handshake) => Some(handshake),
        }
    }
}
