//! Control loop around a [`ScanController`].
//!
//! [`ScanRunner::spawn`] moves the controller onto its own task and returns a
//! cloneable [`ScanHandle`]. Control commands travel over an mpsc channel with a
//! oneshot reply each, the same request / response shape the rest of the crate
//! uses for actors.
//!
//! The loop is a biased `select!` over, in priority order:
//! 1. control commands (so abort is never stuck behind a packet backlog)
//! 2. the interlock watch, if one is attached
//! 3. packets from the reader queue
//! 4. the settle poll timer (external scans)
//! 5. the periodic commit timer

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::context::StashKey;
use super::controller::ScanController;
use super::descriptor::ScanDescriptor;
use super::events::{EventBus, EventKind, EventSubscription, ScanEvent};
use super::state::ScanState;
use crate::error::{AppResult, DaqError};
use crate::evaluation::EvaluationDefinition;
use crate::pulser::PulseProgram;

type Reply<T> = oneshot::Sender<AppResult<T>>;

/// Commands accepted by the control loop.
#[derive(Debug)]
pub enum ControlCommand {
    /// Start a scan.
    Start {
        /// Scan to run.
        scan: Box<ScanDescriptor>,
        /// Evaluators of the scan.
        evaluations: Vec<EvaluationDefinition>,
        /// Global overrides for the run.
        overrides: BTreeMap<String, f64>,
        /// Reply channel.
        response: Reply<()>,
    },
    /// Graceful stop.
    Stop {
        /// Finalization reason.
        reason: String,
        /// Reply with the committed file.
        response: Reply<Option<PathBuf>>,
    },
    /// Immediate stop.
    Abort {
        /// Reply channel.
        response: Reply<()>,
    },
    /// Halt acquisition.
    Pause {
        /// Reply channel.
        response: Reply<()>,
    },
    /// Continue after a pause or interrupt.
    Continue {
        /// Reply channel.
        response: Reply<()>,
    },
    /// Move the scan to the stash.
    Stash {
        /// Reply channel.
        response: Reply<()>,
    },
    /// Revive a stashed scan.
    Resume {
        /// Stash index.
        index: usize,
        /// Reply channel.
        response: Reply<()>,
    },
    /// Keys of the stashed scans.
    StashKeys {
        /// Reply channel.
        response: oneshot::Sender<Vec<StashKey>>,
    },
    /// Replace the pulse program.
    SetProgram {
        /// New program.
        program: Box<PulseProgram>,
        /// Reply channel.
        response: Reply<()>,
    },
    /// Leave the loop. A running scan is aborted first.
    Shutdown {
        /// Acknowledgement.
        response: oneshot::Sender<()>,
    },
}

/// Owns the control loop task.
pub struct ScanRunner {
    controller: ScanController,
    commands: mpsc::Receiver<ControlCommand>,
    interlock: Option<watch::Receiver<bool>>,
}

impl ScanRunner {
    /// Spawn the loop for `controller`. `interlock` is the combined lock
    /// state (`true` = all locked), usually from
    /// [`InterlockGate::subscribe`](crate::interlock::InterlockGate::subscribe).
    pub fn spawn(
        controller: ScanController,
        interlock: Option<watch::Receiver<bool>>,
    ) -> (ScanHandle, JoinHandle<ScanController>) {
        let (tx, commands) = mpsc::channel(32);
        let handle = ScanHandle {
            commands: tx,
            events: controller.events().clone(),
            state: controller.events().state(),
        };
        let runner = Self {
            controller,
            commands,
            interlock,
        };
        let task = tokio::spawn(runner.run());
        (handle, task)
    }

    async fn run(mut self) -> ScanController {
        let mut settle = tokio::time::interval(self.controller.settle_poll());
        settle.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let commit_period = self.controller.config().storage.commit_interval();
        let mut commit =
            tokio::time::interval(commit_period.unwrap_or(Duration::from_secs(3600)));
        commit.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick of an interval completes immediately.
        commit.tick().await;
        info!("scan control loop started");

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => {
                    match command {
                        Some(ControlCommand::Shutdown { response }) => {
                            let _ = self.controller.abort().await;
                            let _ = response.send(());
                            break;
                        }
                        Some(command) => self.dispatch(command).await,
                        None => {
                            debug!("all scan handles dropped");
                            let _ = self.controller.abort().await;
                            break;
                        }
                    }
                }

                changed = watch_changed(&mut self.interlock) => {
                    match changed {
                        Some(locked) => {
                            if let Err(e) = self.controller.on_interlock(locked).await {
                                warn!(error = %e, "interlock transition failed");
                            }
                        }
                        None => self.interlock = None,
                    }
                }

                Some(item) = self.controller.next_packet() => {
                    self.controller.handle_packet(item).await;
                }

                _ = settle.tick(), if self.controller.is_settling() => {
                    self.controller.tick(Instant::now()).await;
                }

                _ = commit.tick(), if commit_period.is_some() => {
                    self.controller.periodic_commit();
                }
            }
        }
        info!("scan control loop stopped");
        self.controller
    }

    async fn dispatch(&mut self, command: ControlCommand) {
        let controller = &mut self.controller;
        match command {
            ControlCommand::Start {
                scan,
                evaluations,
                overrides,
                response,
            } => {
                let _ = response.send(controller.start(*scan, evaluations, overrides).await);
            }
            ControlCommand::Stop { reason, response } => {
                let _ = response.send(controller.stop(&reason).await);
            }
            ControlCommand::Abort { response } => {
                let _ = response.send(controller.abort().await);
            }
            ControlCommand::Pause { response } => {
                let _ = response.send(controller.pause().await);
            }
            ControlCommand::Continue { response } => {
                let _ = response.send(controller.continue_scan().await);
            }
            ControlCommand::Stash { response } => {
                let _ = response.send(controller.stash().await);
            }
            ControlCommand::Resume { index, response } => {
                let _ = response.send(controller.resume(index).await);
            }
            ControlCommand::StashKeys { response } => {
                let _ = response.send(controller.stash_keys());
            }
            ControlCommand::SetProgram { program, response } => {
                let _ = response.send(controller.set_program(*program));
            }
            ControlCommand::Shutdown { response } => {
                let _ = response.send(());
            }
        }
    }
}

/// Next interlock value; pending forever without a watch, `None` once the
/// sender is gone.
async fn watch_changed(rx: &mut Option<watch::Receiver<bool>>) -> Option<bool> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

/// Cloneable client of the control loop.
#[derive(Debug, Clone)]
pub struct ScanHandle {
    commands: mpsc::Sender<ControlCommand>,
    events: EventBus,
    state: watch::Receiver<ScanState>,
}

impl ScanHandle {
    async fn call<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> ControlCommand,
    ) -> AppResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| DaqError::ControllerGone)?;
        rx.await.map_err(|_| DaqError::ControllerGone)?
    }

    /// Start `scan`.
    pub async fn start(
        &self,
        scan: ScanDescriptor,
        evaluations: Vec<EvaluationDefinition>,
        overrides: BTreeMap<String, f64>,
    ) -> AppResult<()> {
        self.call(|response| ControlCommand::Start {
            scan: Box::new(scan),
            evaluations,
            overrides,
            response,
        })
        .await
    }

    /// Graceful stop; returns the committed file.
    pub async fn stop(&self, reason: impl Into<String>) -> AppResult<Option<PathBuf>> {
        let reason = reason.into();
        self.call(|response| ControlCommand::Stop { reason, response })
            .await
    }

    /// Immediate stop.
    pub async fn abort(&self) -> AppResult<()> {
        self.call(|response| ControlCommand::Abort { response }).await
    }

    /// Halt acquisition.
    pub async fn pause(&self) -> AppResult<()> {
        self.call(|response| ControlCommand::Pause { response }).await
    }

    /// Continue after a pause or interrupt.
    pub async fn continue_scan(&self) -> AppResult<()> {
        self.call(|response| ControlCommand::Continue { response })
            .await
    }

    /// Move the running scan to the stash.
    pub async fn stash(&self) -> AppResult<()> {
        self.call(|response| ControlCommand::Stash { response }).await
    }

    /// Revive stash entry `index`.
    pub async fn resume(&self, index: usize) -> AppResult<()> {
        self.call(|response| ControlCommand::Resume { index, response })
            .await
    }

    /// Keys of the stashed scans.
    pub async fn stash_keys(&self) -> AppResult<Vec<StashKey>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ControlCommand::StashKeys { response: tx })
            .await
            .map_err(|_| DaqError::ControllerGone)?;
        rx.await.map_err(|_| DaqError::ControllerGone)
    }

    /// Replace the pulse program.
    pub async fn set_program(&self, program: PulseProgram) -> AppResult<()> {
        self.call(|response| ControlCommand::SetProgram {
            program: Box::new(program),
            response,
        })
        .await
    }

    /// Stop the loop; a running scan is aborted.
    pub async fn shutdown(&self) -> AppResult<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ControlCommand::Shutdown { response: tx })
            .await
            .map_err(|_| DaqError::ControllerGone)?;
        rx.await.map_err(|_| DaqError::ControllerGone)
    }

    /// Current controller state.
    pub fn state(&self) -> ScanState {
        *self.state.borrow()
    }

    /// Watch the controller state.
    pub fn watch_state(&self) -> watch::Receiver<ScanState> {
        self.state.clone()
    }

    /// Receive every event.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    /// Receive events of the given kinds.
    pub fn subscribe_to(&self, kinds: &[EventKind]) -> EventSubscription {
        self.events.subscribe_to(kinds)
    }

    /// Wait until the controller reaches `state`.
    pub async fn wait_for(&self, state: ScanState) -> AppResult<()> {
        let mut rx = self.state.clone();
        rx.wait_for(|s| *s == state)
            .await
            .map(drop)
            .map_err(|_| DaqError::ControllerGone)
    }
}
