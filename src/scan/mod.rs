//! Scan execution.
//!
//! A scan is described by a [`ScanDescriptor`] and a list of evaluators. The
//! [`ScanController`] turns it into update words for the sequencer (through a
//! [`ScanGenerator`]), reduces every returned packet to one row per evaluator,
//! and finalizes the traces when the scan ends. [`ScanRunner`] hosts the
//! controller on a task and hands out [`ScanHandle`]s.
//!
//! # Example
//!
//! ```rust,ignore
//! let (handle, _task) = ScanRunner::spawn(controller, Some(gate.subscribe()));
//! handle.start(ScanDescriptor::linear("detuning", "f_det", 0.0, 9.0, 10), evaluations, overrides).await?;
//! handle.wait_for(ScanState::Idle).await?;
//! ```

pub mod context;
pub mod controller;
pub mod descriptor;
pub mod events;
pub mod generator;
pub mod globals;
pub mod method;
pub mod parameter;
pub mod runner;
pub mod state;

pub use context::{ScanContext, Stash, StashKey};
pub use controller::{ScanController, ABORTED, END_OF_SCAN, READ_PIPE_OVERRUN};
pub use descriptor::{GateSequenceInfo, HistogramPolicy, ScanDescriptor, ScanMode, ScanTarget};
pub use events::{EventBus, EventKind, EventSubscription, PointResult, ScanEvent};
pub use generator::ScanGenerator;
pub use globals::{GlobalVariables, SharedGlobals};
pub use method::{ScanMethod, SettleHandshake, SettlePhase, SettleStatus};
pub use parameter::{ParameterRegistry, ScanParameter, SimulatedParameter};
pub use runner::{ControlCommand, ScanHandle, ScanRunner};
pub use state::ScanState;
