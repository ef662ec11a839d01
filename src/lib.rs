//! # Ion DAQ Core Library
//!
//! This crate is the experiment execution engine for a trapped-ion pulse
//! sequencer. It drives a scan through a parameter range, streams update words
//! to the sequencer, reduces every returned data packet to one point per
//! evaluator, and stores the results as trace files. The command line front end
//! (`main.rs`) is a thin layer over this library.
//!
//! ## Crate Structure
//!
//! - **`pulser`**: The sequencer transport. Wire framing with CRC-8, the command
//!   codec, reader and writer worker threads, pulse program metadata and a
//!   software sequencer that speaks the same protocol.
//! - **`scan`**: Scan descriptors, the update-word generator, external scan
//!   parameters, and the `ScanController` state machine with its control loop.
//! - **`evaluation`**: Evaluators that reduce a data packet to a value with an
//!   error interval, histogram buffers and same-x averaging.
//! - **`analysis`**: Post-scan fits whose results are stored with the traces.
//! - **`trace`**: Column store for scan results and its text / zip / HDF5 file
//!   formats.
//! - **`persistence`**: The snapshot thread that commits traces, and the
//!   key-value configuration store.
//! - **`interlock`**: Combines external lock signals into one go / no-go state.
//! - **`config`**: Loads `EngineConfig` from TOML and environment variables.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`error`**: The `DaqError` enum for centralized error handling.
//! - **`timing`**: Sequencer timebase and tick extension.

pub mod analysis;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod interlock;
pub mod logging;
pub mod persistence;
pub mod pulser;
pub mod scan;
pub mod timing;
pub mod trace;

pub use error::{AppResult, DaqError};
