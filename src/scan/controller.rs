//! Scan controller: the state machine that drives one sequencer.
//!
//! The controller owns the active [`ScanContext`], the stash of paused scans and
//! the sequencer lease. It is driven from a single task (see
//! [`runner`](super::runner)): control commands, packets from the reader queue,
//! settle ticks for external scans and periodic commits all arrive there and are
//! handled one at a time, so nothing else ever touches a context.
//!
//! On the normal path packet handling only queues refill words through
//! [`PulserTransport::write_data_buffered`]. Packets that end or halt the run
//! do wait on the sequencer: an interrupt stops the program before committing,
//! a stash resets the streams, and a failure stops the program before
//! finalizing.
//!
//! # Failure handling
//!
//! | Cause | State | Trace |
//! |-------|-------|-------|
//! | transport error | interrupted | finalized, not saved |
//! | read queue overrun, CRC rate, error exit, settle timeout | interrupted | kept, committed |
//! | interlock unlock | interrupted | kept |
//! | evaluation error | unchanged | point is `NaN` |

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::context::{ScanContext, Stash, StashKey};
use super::descriptor::ScanDescriptor;
use super::events::{EventBus, ScanEvent};
use super::globals::{GlobalVariables, SharedGlobals};
use super::method::{ScanMethod, SettleStatus};
use super::parameter::ParameterRegistry;
use super::state::ScanState;
use crate::analysis;
use crate::config::EngineConfig;
use crate::error::{AppResult, DaqError, PulserError};
use crate::evaluation::histogram::HistogramSet;
use crate::evaluation::{EvalContext, EvaluationDefinition, EvaluationSet};
use crate::persistence::{CommitRequest, ConfigStore, Snapshotter};
use crate::pulser::framing::CrcRateMonitor;
use crate::pulser::worker::{PacketQueue, ReaderItem};
use crate::pulser::{DataPacket, ExitStatus, PulseProgram, PulserTransport, SequencerLease};
use crate::trace::{MetaValue, SharedCollection};

/// Reason recorded when every point was acquired.
pub const END_OF_SCAN: &str = "end of scan";

/// Reason recorded by [`ScanController::abort`].
pub const ABORTED: &str = "aborted";

/// Reason recorded for a read queue overrun.
pub const READ_PIPE_OVERRUN: &str = "Read Pipe Overrun";

/// What to do once the external parameter reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AfterSettle {
    Nothing,
    StartPoint,
    Finish(String),
    Restored,
}

/// Drives scans on one sequencer.
pub struct ScanController {
    transport: Arc<dyn PulserTransport>,
    queue: Option<PacketQueue>,
    program: PulseProgram,
    config: EngineConfig,
    globals: SharedGlobals,
    parameters: ParameterRegistry,
    events: EventBus,
    snapshotter: Snapshotter,
    store: Option<Arc<ConfigStore>>,
    state: ScanState,
    active: Option<ScanContext>,
    stash: Stash,
    after_settle: AfterSettle,
    crc: CrcRateMonitor,
    interrupt_reason: Option<String>,
    interlock_paused: bool,
    last_collection: Option<SharedCollection>,
    lease: Option<SequencerLease>,
    histograms: HistogramSet,
}

impl std::fmt::Debug for ScanController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanController")
            .field("program", &self.program.name)
            .field("state", &self.state)
            .field("active", &self.active.as_ref().map(ScanContext::key))
            .field("stash", &self.stash.len())
            .field("interrupt_reason", &self.interrupt_reason)
            .finish()
    }
}

impl ScanController {
    /// Controller for `transport` running `program`.
    pub fn new(
        transport: Arc<dyn PulserTransport>,
        program: PulseProgram,
        config: EngineConfig,
    ) -> AppResult<Self> {
        let crc = CrcRateMonitor::new(
            config.pulser.crc_error_limit,
            config.pulser.crc_window(),
            config.pulser.crc_min_records,
        );
        Ok(Self {
            transport,
            queue: None,
            program,
            config,
            globals: GlobalVariables::default().into_shared(),
            parameters: ParameterRegistry::new(),
            events: EventBus::default(),
            snapshotter: Snapshotter::spawn()?,
            store: None,
            state: ScanState::Idle,
            active: None,
            stash: Stash::default(),
            after_settle: AfterSettle::Nothing,
            crc,
            interrupt_reason: None,
            interlock_paused: false,
            last_collection: None,
            lease: None,
            histograms: HistogramSet::default(),
        })
    }

    /// Read packets from `queue`.
    pub fn with_queue(mut self, queue: PacketQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Share a global variable dictionary.
    pub fn with_globals(mut self, globals: SharedGlobals) -> Self {
        self.globals = globals;
        self
    }

    /// External parameters available to external scans.
    pub fn with_parameters(mut self, parameters: ParameterRegistry) -> Self {
        self.parameters = parameters;
        self
    }

    /// Write `store` with every commit.
    pub fn with_store(mut self, store: Arc<ConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Current state.
    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Event publisher.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Global variables.
    pub fn globals(&self) -> &SharedGlobals {
        &self.globals
    }

    /// The scan in flight.
    pub fn active(&self) -> Option<&ScanContext> {
        self.active.as_ref()
    }

    /// Stashed scans.
    pub fn stashed(&self) -> &Stash {
        &self.stash
    }

    /// Keys of the stashed scans.
    pub fn stash_keys(&self) -> Vec<StashKey> {
        self.stash.keys()
    }

    /// Why the controller is interrupted.
    pub fn interrupt_reason(&self) -> Option<&str> {
        self.interrupt_reason.as_deref()
    }

    /// Whether the interlock halted the scan.
    pub fn is_interlock_paused(&self) -> bool {
        self.interlock_paused
    }

    /// Traces of the last finalized scan.
    pub fn last_collection(&self) -> Option<&SharedCollection> {
        self.last_collection.as_ref()
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether this controller holds the sequencer.
    pub fn holds_lease(&self) -> bool {
        self.lease.is_some()
    }

    /// Whether an external parameter is moving.
    pub fn is_settling(&self) -> bool {
        self.after_settle != AfterSettle::Nothing
    }

    /// Replace the pulse program. Only while idle.
    pub fn set_program(&mut self, program: PulseProgram) -> AppResult<()> {
        self.require("set program", self.active.is_none())?;
        info!(program = %program.name, "pulse program loaded");
        self.program = program;
        Ok(())
    }

    fn require(&self, command: &'static str, allowed: bool) -> AppResult<()> {
        if allowed {
            Ok(())
        } else {
            Err(DaqError::InvalidTransition {
                command,
                state: self.state.to_string(),
            })
        }
    }

    fn set_state(&mut self, state: ScanState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "scan state");
            self.state = state;
            self.events.emit(ScanEvent::StateChanged(state));
        }
    }

    fn commit_request(&self, collection: &SharedCollection) -> CommitRequest {
        CommitRequest {
            collection: collection.clone(),
            dir: self.config.storage.output_dir.clone(),
            format: self.config.storage.format,
            store: self.store.clone(),
        }
    }

    // Commands

    /// Start `scan` with `overrides` applied to the globals for its duration.
    pub async fn start(
        &mut self,
        scan: ScanDescriptor,
        evaluations: Vec<EvaluationDefinition>,
        overrides: BTreeMap<String, f64>,
    ) -> AppResult<()> {
        let idle = self.active.is_none()
            && matches!(self.state, ScanState::Idle | ScanState::Interrupted);
        self.require("start", idle)?;
        scan.validate()?;
        let evaluations = EvaluationSet::new(evaluations)?;
        let method = ScanMethod::for_scan(
            &scan,
            &self.parameters,
            self.config.scan.default_settle_timeout(),
        )?;
        let lease = self.transport.try_lease()?;
        let histograms = std::mem::take(&mut self.histograms);
        let context = ScanContext::new(scan, evaluations, overrides, method, histograms);
        info!(
            scan = %context.scan.name,
            run = %context.id,
            points = ?context.total_points(),
            external = context.method.is_external(),
            "starting scan"
        );
        self.globals.write().push_overrides(&context.overrides);
        self.lease = Some(lease);
        self.interrupt_reason = None;
        self.interlock_paused = false;
        self.active = Some(context);
        self.set_state(ScanState::Starting);

        if self.active.as_ref().and_then(ScanContext::total_points) == Some(0) {
            info!("scan has no points");
            self.finish(END_OF_SCAN, true).await;
            return Ok(());
        }
        self.launch(0).await
    }

    /// Revive stash entry `index` (see [`stash_keys`](Self::stash_keys)).
    pub async fn resume(&mut self, index: usize) -> AppResult<()> {
        self.require("resume", self.active.is_none() && self.state != ScanState::Stopping)?;
        if index >= self.stash.len() {
            return Err(DaqError::NoSuchStash(index));
        }
        let lease = self.transport.try_lease()?;
        let context = self.stash.take(index).ok_or(DaqError::NoSuchStash(index))?;
        info!(
            scan = %context.scan.name,
            index = context.index,
            "resuming stashed scan"
        );
        self.globals.write().push_overrides(&context.overrides);
        let start_at = context.index;
        self.lease = Some(lease);
        self.interrupt_reason = None;
        self.interlock_paused = false;
        self.active = Some(context);
        self.set_state(ScanState::Resuming);
        self.events.emit(ScanEvent::StashChanged(self.stash.keys()));
        self.launch(start_at).await
    }

    /// Configure the sequencer and run from point `index`.
    async fn launch(&mut self, index: usize) -> AppResult<()> {
        let result = match self.configure().await {
            Ok(()) => self.run_from(index).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.fail(&e).await;
            return Err(e);
        }
        Ok(())
    }

    async fn configure(&mut self) -> AppResult<()> {
        let transport = self.transport.clone();
        let verify = self.config.pulser.verify_ram;
        transport.upload(&self.program.binary).await?;
        let image = {
            let globals = self.globals.read();
            self.program.ram_image(|name| globals.get(name))?
        };
        if !image.is_empty() {
            transport.write_ram(&image, 0, verify).await?;
        }
        let param_list = match &self.active {
            Some(context) => context.generator.param_list_ram(&self.program)?,
            None => None,
        };
        if let Some((offset, words)) = param_list {
            transport.write_ram(&words, offset, verify).await?;
        }
        transport
            .set_integration_time(self.program.integration_time)
            .await?;
        transport.set_counter_mask(self.program.counter_mask).await?;
        transport.set_adc_mask(self.program.adc_mask).await?;
        Ok(())
    }

    /// Discard stale update words and return data.
    async fn reset_streams(&mut self) -> Result<(), PulserError> {
        self.transport.clear_write_fifo().await?;
        self.transport.flush_data().await?;
        if let Some(queue) = self.queue.as_mut() {
            let dropped = queue.drain();
            if dropped > 0 {
                debug!(dropped, "discarded queued packets");
            }
        }
        Ok(())
    }

    /// Start acquisition at point `index` (internal) or move the external
    /// parameter there.
    async fn run_from(&mut self, index: usize) -> AppResult<()> {
        self.reset_streams().await?;
        self.crc.reset(self.transport.framing_stats());
        let Some(context) = self.active.as_mut() else {
            return Ok(());
        };
        if let Some(handshake) = context.method.handshake() {
            let target = context.generator.x_value(index, None);
            debug!(parameter = handshake.parameter_name(), target, "moving parameter");
            handshake.move_to(target);
            self.after_settle = AfterSettle::StartPoint;
            if self.state == ScanState::Paused || self.state == ScanState::Interrupted {
                self.set_state(ScanState::Running);
            }
            return Ok(());
        }
        let max = self
            .config
            .pulser
            .max_init_updates
            .min(self.config.pulser.fifo_depth);
        let code = if index == 0 {
            context.generator.init_code(&self.program, max)?
        } else {
            context.generator.restart_code(&self.program, index, max)?
        };
        debug!(index, words = code.len(), "writing update words");
        self.transport.write_data_buffered(code)?;
        self.transport.start().await?;
        self.set_state(ScanState::Running);
        Ok(())
    }

    /// One point of an external scan: the parameter is in place.
    async fn start_external_point(&mut self) -> AppResult<()> {
        let Some(context) = self.active.as_ref() else {
            return Ok(());
        };
        let code = context.generator.external_code();
        self.transport.write_data_buffered(code)?;
        self.transport.start().await?;
        self.set_state(ScanState::Running);
        Ok(())
    }

    /// Halt acquisition, keeping the scan.
    pub async fn pause(&mut self) -> AppResult<()> {
        self.require("pause", self.state.can_pause() && self.active.is_some())?;
        self.halt().await?;
        info!(index = self.active.as_ref().map(ScanContext::index), "scan paused");
        self.set_state(ScanState::Paused);
        Ok(())
    }

    /// Stop the program, drop unevaluated packets and put an external
    /// parameter back.
    async fn halt(&mut self) -> AppResult<()> {
        self.transport.stop().await?;
        self.reset_streams().await?;
        self.after_settle = AfterSettle::Nothing;
        if let Some(handshake) = self.active.as_mut().and_then(|c| c.method.handshake()) {
            if handshake.restore() {
                self.after_settle = AfterSettle::Restored;
            }
        }
        Ok(())
    }

    /// Continue a paused or interrupted scan at its current index.
    pub async fn continue_scan(&mut self) -> AppResult<()> {
        self.require("continue", self.state.can_continue() && self.active.is_some())?;
        let index = self.active.as_ref().map_or(0, ScanContext::index);
        info!(index, "continuing scan");
        self.interrupt_reason = None;
        self.interlock_paused = false;
        if let Err(e) = self.run_from(index).await {
            self.fail(&e).await;
            return Err(e);
        }
        Ok(())
    }

    /// Move the running scan to the stash. Internal scans finish the point in
    /// flight first; the stash happens when its final packet arrives.
    pub async fn stash(&mut self) -> AppResult<()> {
        self.require("stash", self.state.can_stash() && self.active.is_some())?;
        let external = self.active.as_ref().is_some_and(|c| c.method.is_external());
        if external {
            self.halt().await?;
            self.wait_for_restore().await;
            self.stash_active();
            return Ok(());
        }
        info!("interrupt requested for stash");
        self.set_state(ScanState::Stashing);
        if let Err(e) = self.transport.interrupt().await {
            let e = DaqError::from(e);
            self.fail(&e).await;
            return Err(e);
        }
        Ok(())
    }

    fn stash_active(&mut self) {
        let Some(context) = self.active.take() else {
            return;
        };
        info!(
            scan = %context.scan.name,
            index = context.index,
            "scan stashed"
        );
        self.globals.write().pop_overrides();
        self.after_settle = AfterSettle::Nothing;
        self.lease = None;
        self.stash.push(context);
        self.set_state(ScanState::Idle);
        self.events.emit(ScanEvent::StashChanged(self.stash.keys()));
    }

    /// Graceful stop: evaluate what is already queued, restore the external
    /// parameter, run analyses and commit. Returns the trace file.
    pub async fn stop(&mut self, reason: &str) -> AppResult<Option<PathBuf>> {
        self.require("stop", self.state.can_stop())?;
        if self.active.is_none() {
            self.set_state(ScanState::Idle);
            return Ok(None);
        }
        info!(reason, "stopping scan");
        self.set_state(ScanState::Stopping);
        if let Err(e) = self.transport.stop().await {
            warn!(error = %e, "stop failed");
        }
        let queued: Vec<ReaderItem> = match self.queue.as_mut() {
            Some(queue) => std::iter::from_fn(|| queue.try_recv()).collect(),
            None => Vec::new(),
        };
        for packet in queued.into_iter().flatten() {
            if !packet.is_final || packet.has_data() {
                self.record(&packet);
            }
        }
        if let Err(e) = self.reset_streams().await {
            warn!(error = %e, "stream reset failed");
        }
        self.wait_for_restore().await;
        Ok(self.finish(reason, true).await)
    }

    /// Poll the external parameter until it is back at its snapshot.
    async fn wait_for_restore(&mut self) {
        let poll = self.config.scan.settle_poll();
        let Some(handshake) = self.active.as_mut().and_then(|c| c.method.handshake()) else {
            return;
        };
        if !handshake.restore() {
            return;
        }
        loop {
            match handshake.poll(Instant::now()).await {
                Ok(SettleStatus::Restored) => break,
                Ok(SettleStatus::TimedOut) => {
                    warn!(parameter = handshake.parameter_name(), "restore timed out");
                    break;
                }
                Ok(_) => tokio::time::sleep(poll).await,
                Err(e) => {
                    warn!(error = %e, "restore failed");
                    break;
                }
            }
        }
        self.after_settle = AfterSettle::Nothing;
    }

    /// Immediate stop: nothing queued is evaluated, no analysis, no commit.
    pub async fn abort(&mut self) -> AppResult<()> {
        if self.active.is_none() {
            self.set_state(ScanState::Idle);
            return Ok(());
        }
        warn!("aborting scan");
        self.set_state(ScanState::Stopping);
        let deadline = self.config.scan.abort_timeout() / 2;
        let transport = self.transport.clone();
        let cleanup = async move {
            transport.stop().await?;
            transport.clear_write_fifo().await
        };
        match tokio::time::timeout(deadline, cleanup).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "abort cleanup failed"),
            Err(_) => warn!(deadline_ms = deadline.as_millis() as u64, "abort cleanup timed out"),
        }
        if let Some(queue) = self.queue.as_mut() {
            queue.drain();
        }
        if let Some(handshake) = self.active.as_mut().and_then(|c| c.method.handshake()) {
            match tokio::time::timeout(deadline, handshake.restore_now()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "parameter restore failed"),
                Err(_) => warn!("parameter restore timed out"),
            }
        }
        self.close(ABORTED, false, false).await;
        self.set_state(ScanState::Idle);
        Ok(())
    }

    /// React to the combined interlock state.
    pub async fn on_interlock(&mut self, locked: bool) -> AppResult<()> {
        if !locked && self.state == ScanState::Running && self.active.is_some() {
            warn!("interlock unlocked, halting scan");
            self.halt().await?;
            self.interlock_paused = true;
            self.interrupt_reason = Some("interlock".into());
            self.set_state(ScanState::Interrupted);
            self.events.emit(ScanEvent::Interrupted {
                reason: "interlock".into(),
            });
        } else if locked && self.interlock_paused && self.state == ScanState::Interrupted {
            info!("interlock locked, continuing scan");
            self.continue_scan().await?;
        }
        Ok(())
    }

    // Run endings

    /// End the run: analyses (optional), finalize, commit. Goes idle.
    async fn finish(&mut self, reason: &str, analyze: bool) -> Option<PathBuf> {
        let path = self.close(reason, analyze, true).await;
        self.set_state(ScanState::Idle);
        path
    }

    /// Finalize the active collection and release the run.
    async fn close(&mut self, reason: &str, analyze: bool, commit: bool) -> Option<PathBuf> {
        let context = self.active.take()?;
        self.after_settle = AfterSettle::Nothing;
        if analyze && !context.scan.analyses.is_empty() {
            let (fit, failed) = {
                let collection = context.collection.read();
                analysis::run_all(&context.scan.analyses, |name| collection.trace(name))
            };
            let mut collection = context.collection.write();
            if !fit.is_empty() {
                collection.description.insert("fit".into(), MetaValue::Dict(fit));
            }
            if !failed.is_empty() {
                collection
                    .description
                    .insert("failedAnalysis".into(), MetaValue::Dict(failed));
            }
        }
        context.collection.write().finalize(reason);
        let path = if commit {
            match self.snapshotter.commit(self.commit_request(&context.collection)).await {
                Ok(path) => Some(path),
                Err(e) => {
                    error!(error = %e, "final commit failed");
                    None
                }
            }
        } else {
            None
        };
        self.globals.write().pop_overrides();
        info!(
            scan = %context.scan.name,
            points = context.index,
            reason,
            saved = path.is_some(),
            "scan finalized"
        );
        self.histograms = context.histograms;
        self.last_collection = Some(context.collection);
        self.lease = None;
        self.events.emit(ScanEvent::Finalized {
            path: path.clone(),
            reason: reason.to_string(),
        });
        path
    }

    /// Fatal error: the run ends without a commit and the controller reports
    /// the error as its interrupt reason.
    async fn fail(&mut self, e: &DaqError) {
        let reason = e.to_string();
        error!(error = %reason, "scan failed");
        if let Err(e) = self.transport.stop().await {
            warn!(error = %e, "stop after failure failed");
        }
        if let Some(queue) = self.queue.as_mut() {
            queue.drain();
        }
        if let Some(handshake) = self.active.as_mut().and_then(|c| c.method.handshake()) {
            if let Err(e) = handshake.restore_now().await {
                warn!(error = %e, "parameter restore failed");
            }
        }
        self.close(&reason, false, false).await;
        self.interrupt_reason = Some(reason.clone());
        self.set_state(ScanState::Interrupted);
        self.events.emit(ScanEvent::Interrupted { reason });
    }

    /// Halt with `reason`, keeping the scan and committing what was acquired.
    async fn interrupt(&mut self, reason: &str) {
        warn!(reason, "scan interrupted");
        if let Err(e) = self.halt().await {
            let e = DaqError::from(e);
            self.fail(&e).await;
            return;
        }
        self.interrupt_reason = Some(reason.to_string());
        self.set_state(ScanState::Interrupted);
        self.events.emit(ScanEvent::Interrupted {
            reason: reason.to_string(),
        });
        if let Some(collection) = self.active.as_ref().map(|c| c.collection.clone()) {
            if let Err(e) = self.snapshotter.commit(self.commit_request(&collection)).await {
                error!(error = %e, "commit after interrupt failed");
            }
        }
    }

    // Packets

    /// Next item from the reader queue. Pending forever without a queue.
    ///
    /// A queue that closes during a run yields one
    /// [`PulserError::WorkerStopped`] so the run fails instead of waiting for
    /// packets that can no longer arrive.
    pub async fn next_packet(&mut self) -> Option<ReaderItem> {
        match self.queue.as_mut() {
            Some(queue) => {
                let item = queue.recv().await;
                if item.is_none() {
                    warn!("reader queue closed");
                    self.queue = None;
                    if self.active.is_some() {
                        return Some(Err(PulserError::WorkerStopped));
                    }
                }
                item
            }
            None => std::future::pending().await,
        }
    }

    /// Handle one item from the reader queue.
    pub async fn handle_packet(&mut self, item: ReaderItem) {
        let packet = match item {
            Ok(packet) => packet,
            Err(e) => {
                if self.active.is_some() {
                    self.fail(&DaqError::from(e)).await;
                } else {
                    warn!(error = %e, "reader error outside a run");
                }
                return;
            }
        };
        if !self.state.accepts_packets() || self.active.is_none() {
            debug!(state = %self.state, is_final = packet.is_final, "packet outside a run dropped");
            return;
        }
        if packet.overrun {
            self.interrupt(READ_PIPE_OVERRUN).await;
            return;
        }
        if self.crc.observe(self.transport.framing_stats(), Instant::now()) {
            self.interrupt("excessive CRC errors").await;
            return;
        }
        let new_violations = match self.active.as_mut() {
            Some(context) => context.note_timing_violations(&packet),
            None => Vec::new(),
        };
        if !new_violations.is_empty() {
            warn!(addresses = ?new_violations, "timing violations");
            self.events.emit(ScanEvent::TimingViolations {
                new: new_violations.clone(),
            });
        }
        if packet.is_final {
            self.on_final(packet).await;
            return;
        }
        self.record(&packet);
        let refill = self
            .active
            .as_mut()
            .filter(|c| !c.method.is_external())
            .and_then(|c| c.generator.next_code().or_else(|| c.generator.on_final()));
        if let Some(word) = refill {
            if let Err(e) = self.transport.write_data_buffered(vec![word]) {
                self.fail(&DaqError::from(e)).await;
                return;
            }
        }
        if self.config.scan.timing_violations_fatal && !new_violations.is_empty() {
            self.interrupt("timing violation").await;
        }
    }

    /// Evaluate `packet` as the next point and publish it.
    fn record(&mut self, packet: &DataPacket) {
        let Some(context) = self.active.as_mut() else {
            return;
        };
        if context.is_complete() {
            warn!(index = context.index, "packet beyond the end of the scan dropped");
            return;
        }
        let index = context.index;
        let (x, results) = {
            let globals = self.globals.read();
            let eval_ctx = EvalContext::new(&globals).with_program(&self.program);
            context.record_point(packet, &eval_ctx)
        };
        context.index += 1;
        let total = context.total_points();
        let current = context.index;
        self.events.emit(ScanEvent::Progress { current, total });
        self.events
            .emit(ScanEvent::PacketEvaluated { index, x, results });
    }

    async fn on_final(&mut self, packet: DataPacket) {
        if packet.has_data() {
            self.record(&packet);
        }
        let Some(context) = self.active.as_mut() else {
            return;
        };
        match packet.exit_status() {
            ExitStatus::Interrupted if self.state == ScanState::Stashing => {
                if let Err(e) = self.reset_streams().await {
                    warn!(error = %e, "stream reset before stash failed");
                }
                self.stash_active();
            }
            ExitStatus::Normal if context.method.is_external() => {
                if context.is_complete() {
                    let restoring = context.method.handshake().is_some_and(|h| h.restore());
                    if restoring {
                        self.after_settle = AfterSettle::Finish(END_OF_SCAN.into());
                    } else {
                        self.finish(END_OF_SCAN, true).await;
                    }
                } else {
                    let target = context.generator.x_value(context.index, None);
                    if let Some(handshake) = context.method.handshake() {
                        handshake.move_to(target);
                    }
                    self.after_settle = AfterSettle::StartPoint;
                }
            }
            ExitStatus::Normal if context.is_complete() => {
                if let Some(word) = context.generator.on_final() {
                    debug!(word = %format!("{word:#018x}"), "end word was still pending");
                }
                self.finish(END_OF_SCAN, true).await;
            }
            ExitStatus::Normal => {
                let reason = format!(
                    "unexpected exit at point {} of {}",
                    context.index,
                    context.total_points().map_or("?".to_string(), |t| t.to_string())
                );
                self.interrupt(&reason).await;
            }
            ExitStatus::Interrupted => {
                self.interrupt("interrupted by sequencer").await;
            }
            ExitStatus::Error(code) => {
                let reason = self.program.exit_name(code);
                self.interrupt(&reason).await;
            }
        }
    }

    // Timers

    /// Advance an external parameter handshake.
    pub async fn tick(&mut self, now: Instant) {
        if self.after_settle == AfterSettle::Nothing {
            return;
        }
        let Some(handshake) = self.active.as_mut().and_then(|c| c.method.handshake()) else {
            self.after_settle = AfterSettle::Nothing;
            return;
        };
        let status = match handshake.poll(now).await {
            Ok(status) => status,
            Err(e) => {
                self.fail(&e).await;
                return;
            }
        };
        match (status, self.after_settle.clone()) {
            (SettleStatus::Pending, _) => {}
            (SettleStatus::Ready, AfterSettle::StartPoint) => {
                self.after_settle = AfterSettle::Nothing;
                if let Err(e) = self.start_external_point().await {
                    self.fail(&e).await;
                }
            }
            (SettleStatus::Restored, AfterSettle::Finish(reason)) => {
                self.finish(&reason, true).await;
            }
            (SettleStatus::TimedOut, AfterSettle::Finish(reason)) => {
                warn!("parameter restore timed out at end of scan");
                self.finish(&reason, true).await;
            }
            (SettleStatus::TimedOut, AfterSettle::Restored) => {
                warn!("parameter restore timed out");
                self.after_settle = AfterSettle::Nothing;
            }
            (SettleStatus::TimedOut, _) => {
                self.after_settle = AfterSettle::Nothing;
                let name = handshake_name(&mut self.active);
                let e = DaqError::SettleTimeout(name);
                warn!(error = %e, "settle timeout");
                self.interrupt("settle timeout").await;
            }
            (_, _) => {
                self.after_settle = AfterSettle::Nothing;
            }
        }
    }

    /// Queue a periodic commit of the active scan.
    pub fn periodic_commit(&self) -> bool {
        match &self.active {
            Some(context) => self.snapshotter.schedule(self.commit_request(&context.collection)),
            None => false,
        }
    }

    /// Commits performed by the snapshotter.
    pub fn commits(&self) -> u64 {
        self.snapshotter.commits()
    }

    /// Period of [`tick`](Self::tick).
    pub fn settle_poll(&self) -> Duration {
        self.config.scan.settle_poll()
    }
}

fn handshake_name(active: &mut Option<ScanContext>) -> String {
    active
        .as_mut()
        .and_then(|c| c.method.handshake())
        .map(|h| h.parameter_name().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::Algorithm;
    use crate::pulser::mock::{MockPulser, PulserCall};
    use crate::pulser::program::{split_update_word, ProgramVariable, ValueEncoding, END_OF_SCAN_ADDRESS};
    use crate::pulser::INTERRUPT_EXIT_CODE;
    use crate::scan::events::EventKind;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn program() -> PulseProgram {
        PulseProgram::new("demo", vec![0xAA; 16])
            .with_variable(
                "t",
                ProgramVariable {
                    address: 4,
                    value: 0.0,
                    encoding: ValueEncoding::Raw,
                },
            )
            .with_exit_code(3, "laser unlocked")
    }

    fn controller(dir: &TempDir) -> (Arc<MockPulser>, ScanController) {
        let pulser = Arc::new(MockPulser::new());
        let mut config = EngineConfig::default();
        config.storage.output_dir = dir.path().to_path_buf();
        let controller = ScanController::new(pulser.clone(), program(), config).unwrap();
        (pulser, controller)
    }

    fn point(counts: u32) -> ReaderItem {
        let mut packet = DataPacket::default();
        packet.counts.insert(0, vec![counts]);
        Ok(packet)
    }

    fn mean() -> Vec<EvaluationDefinition> {
        vec![EvaluationDefinition::new("counts", 0, Algorithm::MeanCount)]
    }

    #[tokio::test]
    async fn internal_scan_runs_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let (pulser, mut controller) = controller(&dir);
        let scan = ScanDescriptor::linear("line", "t", 0.0, 2.0, 3);
        controller.start(scan, mean(), BTreeMap::new()).await.unwrap();
        assert_eq!(controller.state(), ScanState::Running);
        // Three point words and the end word fit into the init block.
        let words = pulser.data_words();
        assert_eq!(words.len(), 4);
        assert_eq!(split_update_word(words[3]).0, END_OF_SCAN_ADDRESS);

        for counts in [1, 2, 3] {
            controller.handle_packet(point(counts)).await;
        }
        controller.handle_packet(Ok(DataPacket::final_with_exit(0))).await;
        assert_eq!(controller.state(), ScanState::Idle);
        let collection = controller.last_collection().unwrap().read();
        assert!(collection.is_saved());
        assert_eq!(collection.trace("counts").unwrap().values("y"), vec![1.0, 2.0, 3.0]);
        assert_eq!(collection.trace("counts").unwrap().values("x"), vec![0.0, 1.0, 2.0]);
    }

    #[tokio::test]
    async fn commands_are_checked_against_state() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut controller) = controller(&dir);
        assert!(matches!(
            controller.pause().await,
            Err(DaqError::InvalidTransition { command: "pause", .. })
        ));
        assert!(matches!(controller.resume(0).await, Err(DaqError::NoSuchStash(0))));
        let scan = ScanDescriptor::linear("line", "t", 0.0, 2.0, 3);
        controller.start(scan.clone(), mean(), BTreeMap::new()).await.unwrap();
        assert!(controller.start(scan, mean(), BTreeMap::new()).await.is_err());
    }

    #[tokio::test]
    async fn overrides_are_reverted_at_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut controller) = controller(&dir);
        controller.globals().write().set("detuning", 1.0);
        let overrides = BTreeMap::from([("detuning".to_string(), 5.0)]);
        let scan = ScanDescriptor::linear("line", "t", 0.0, 1.0, 2);
        controller.start(scan, mean(), overrides).await.unwrap();
        assert_eq!(controller.globals().read().get("detuning"), Some(5.0));
        controller.stop("user").await.unwrap();
        assert_eq!(controller.globals().read().get("detuning"), Some(1.0));
        assert_eq!(controller.state(), ScanState::Idle);
    }

    #[tokio::test]
    async fn zero_repeats_never_start() {
        let dir = tempfile::tempdir().unwrap();
        let (pulser, mut controller) = controller(&dir);
        let scan = ScanDescriptor::linear("empty", "t", 0.0, 1.0, 2).with_repeats(0);
        controller.start(scan, mean(), BTreeMap::new()).await.unwrap();
        assert_eq!(pulser.count(|c| matches!(c, PulserCall::Start)), 0);
        assert_eq!(controller.state(), ScanState::Idle);
        let collection = controller.last_collection().unwrap().read();
        assert!(collection.trace("counts").unwrap().is_empty());
    }

    #[tokio::test]
    async fn transport_failure_interrupts_without_saving() {
        let dir = tempfile::tempdir().unwrap();
        let (pulser, mut controller) = controller(&dir);
        pulser.fail_next_ram_verify();
        let scan = ScanDescriptor::linear("line", "t", 0.0, 1.0, 2);
        let err = controller.start(scan.clone(), mean(), BTreeMap::new()).await.unwrap_err();
        assert!(err.is_fatal_for_run());
        assert_eq!(controller.state(), ScanState::Interrupted);
        assert!(controller.interrupt_reason().unwrap().starts_with("transport:"));
        assert!(!controller.last_collection().unwrap().read().is_saved());
        // A new scan can start after a failed one.
        controller.start(scan, mean(), BTreeMap::new()).await.unwrap();
        assert_eq!(controller.state(), ScanState::Running);
    }

    #[tokio::test]
    #[traced_test]
    async fn refused_stop_during_failure_is_logged() {
        let dir = tempfile::tempdir().unwrap();
        let (pulser, mut controller) = controller(&dir);
        let scan = ScanDescriptor::linear("line", "t", 0.0, 4.0, 5);
        controller.start(scan, mean(), BTreeMap::new()).await.unwrap();
        pulser.fail_next_stop();
        controller
            .handle_packet(Err(PulserError::WriteFailed("link down".into())))
            .await;
        assert_eq!(controller.state(), ScanState::Interrupted);
        assert!(controller.interrupt_reason().unwrap().contains("link down"));
        assert!(logs_contain("stop after failure failed"));
        assert!(!controller.last_collection().unwrap().read().is_saved());
    }

    #[tokio::test]
    async fn error_exit_is_named_from_program_table() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut controller) = controller(&dir);
        let scan = ScanDescriptor::linear("line", "t", 0.0, 3.0, 4);
        controller.start(scan, mean(), BTreeMap::new()).await.unwrap();
        controller.handle_packet(point(1)).await;
        controller.handle_packet(Ok(DataPacket::final_with_exit(3))).await;
        assert_eq!(controller.state(), ScanState::Interrupted);
        assert_eq!(controller.interrupt_reason(), Some("laser unlocked"));
        assert_eq!(controller.active().unwrap().index(), 1);
    }

    #[tokio::test]
    async fn stash_waits_for_interrupt_exit() {
        let dir = tempfile::tempdir().unwrap();
        let (pulser, mut controller) = controller(&dir);
        let scan = ScanDescriptor::linear("line", "t", 0.0, 9.0, 10);
        controller.start(scan, mean(), BTreeMap::new()).await.unwrap();
        controller.handle_packet(point(1)).await;
        controller.stash().await.unwrap();
        assert_eq!(controller.state(), ScanState::Stashing);
        assert_eq!(pulser.count(|c| matches!(c, PulserCall::Interrupt)), 1);

        let mut last = DataPacket::final_with_exit(INTERRUPT_EXIT_CODE);
        last.counts.insert(0, vec![2]);
        controller.handle_packet(Ok(last)).await;
        assert_eq!(controller.state(), ScanState::Idle);
        assert!(!controller.holds_lease());
        let keys = controller.stash_keys();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].current_index, 2);
        assert!(controller.last_collection().is_none());
    }

    #[tokio::test]
    async fn interlock_halts_and_continues() {
        let dir = tempfile::tempdir().unwrap();
        let (pulser, mut controller) = controller(&dir);
        let scan = ScanDescriptor::linear("line", "t", 0.0, 9.0, 10);
        controller.start(scan, mean(), BTreeMap::new()).await.unwrap();
        controller.handle_packet(point(1)).await;
        controller.on_interlock(false).await.unwrap();
        assert_eq!(controller.state(), ScanState::Interrupted);
        assert!(controller.is_interlock_paused());
        pulser.clear();
        controller.on_interlock(true).await.unwrap();
        assert_eq!(controller.state(), ScanState::Running);
        // Restart block begins at point 1.
        let first = pulser.data_words()[0];
        assert_eq!(split_update_word(first), (4, 1));
    }

    #[tokio::test]
    async fn timing_violations_are_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut controller) = controller(&dir);
        let mut events = controller
            .events()
            .subscribe_to(&[EventKind::TimingViolations]);
        let scan = ScanDescriptor::linear("line", "t", 0.0, 9.0, 10);
        controller.start(scan, mean(), BTreeMap::new()).await.unwrap();
        for _ in 0..2 {
            let mut packet = DataPacket::default();
            packet.counts.insert(0, vec![1]);
            packet.timing_violations = vec![0x20];
            controller.handle_packet(Ok(packet)).await;
        }
        assert_eq!(
            events.next().await,
            Some(ScanEvent::TimingViolations { new: vec![0x20] })
        );
        assert_eq!(controller.active().unwrap().timing_violations().len(), 1);
        assert_eq!(controller.state(), ScanState::Running);
    }
}
