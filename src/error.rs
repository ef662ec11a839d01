//! Custom error types for the execution engine.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failures that can occur while a scan runs, from the
//! sequencer link to the trace files on disk.
//!
//! ## Error Hierarchy
//!
//! `DaqError` consolidates the error enums of the individual subsystems:
//!
//! - **`Pulser`**: Everything the sequencer transport can report: missing device,
//!   rejected upload, reply timeouts and RAM read-back mismatches. These are fatal
//!   to a running scan.
//! - **`Trace`**: Failures while appending to, serializing or loading traces.
//! - **`Evaluation`**: A single point could not be reduced (missing bucket, empty
//!   denominator). These never stop a scan; the point contributes `NaN`.
//! - **`Configuration`**: Semantic errors in configuration or scan descriptors that
//!   parse correctly but are logically invalid.
//! - **`InvalidTransition`**: A control command that is not allowed in the current
//!   scan state.
//! - **`SettleTimeout`**: An external scan parameter did not settle in time.
//!
//! By using `#[from]`, `DaqError` can be seamlessly created from the underlying
//! error types, simplifying error handling with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors raised by the sequencer transport.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PulserError {
    /// No device answered on the configured link.
    #[error("device not available: {0}")]
    DeviceMissing(String),

    /// The device refused the pulse program.
    #[error("upload rejected: {0}")]
    UploadRejected(String),

    /// The device did not reply within the read timeout.
    #[error("timeout waiting for {0}")]
    Timeout(String),

    /// A write to the device failed.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// RAM read-back did not match what was written.
    #[error("RAM verify mismatch at address {address:#08x}: wrote {expected:#018x}, read {actual:#018x}")]
    RamVerify {
        /// Address of the first differing word.
        address: u32,
        /// Word that was written.
        expected: u64,
        /// Word that was read back.
        actual: u64,
    },

    /// The device answered with a malformed or unexpected reply.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The sequencer is already leased to another scan controller.
    #[error("sequencer is busy")]
    Busy,

    /// A transport worker thread is gone.
    #[error("transport worker stopped")]
    WorkerStopped,

    /// Integration time or another setting does not fit its hardware field.
    #[error("value out of range: {0}")]
    OutOfRange(String),
}

/// Errors raised by the trace store and its file formats.
#[derive(Error, Debug)]
pub enum TraceError {
    /// The trace has been finalized and its columns are immutable.
    #[error("trace '{0}' is finalized")]
    Finalized(String),

    /// A column that is required for the operation does not exist.
    #[error("unknown column '{0}'")]
    UnknownColumn(String),

    /// A trace name is not present in the collection.
    #[error("unknown trace '{0}'")]
    UnknownTrace(String),

    /// An appended row did not contain the `x` column.
    #[error("row does not contain an x value")]
    MissingX,

    /// Header or body could not be parsed.
    #[error("malformed trace file: {0}")]
    Format(String),

    /// XML header error.
    #[error("XML header error: {0}")]
    Xml(String),

    /// Structured data (json / yaml / pickle) could not be encoded or decoded.
    #[error("structured data '{name}': {message}")]
    StructuredData {
        /// Key in the structured-data map.
        name: String,
        /// Encoder / decoder message.
        message: String,
    },

    /// ZIP container error.
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// HDF5 error.
    #[error("hdf5 error: {0}")]
    Hdf5(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while reducing one data packet to a scan point.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    /// The packet has no data for the evaluator's bucket.
    #[error("missing bucket {0}")]
    MissingBucket(u8),

    /// The reduction divided by zero (no shots, empty reference channel).
    #[error("division by zero in {0}")]
    DivideByZero(&'static str),

    /// A global variable the evaluator depends on is not defined.
    #[error("unknown global '{0}'")]
    UnknownGlobal(String),
}

/// Primary error type for the crate.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Sequencer transport failure.
    #[error("transport: {0}")]
    Pulser(#[from] PulserError),

    /// Trace store failure.
    #[error("trace store: {0}")]
    Trace(#[from] TraceError),

    /// Point evaluation failure.
    #[error("evaluation: {0}")]
    Evaluation(#[from] EvaluationError),

    /// Configuration file parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration or descriptor validation failed.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The requested control command is not allowed in the current state.
    #[error("cannot {command} while {state}")]
    InvalidTransition {
        /// Name of the rejected command.
        command: &'static str,
        /// State the controller was in.
        state: String,
    },

    /// No stashed scan with the given index exists.
    #[error("no stashed scan at index {0}")]
    NoSuchStash(usize),

    /// An external scan parameter did not settle within its timeout.
    #[error("settle timeout on '{0}'")]
    SettleTimeout(String),

    /// An external scan parameter reported an error.
    #[error("scan parameter '{name}': {message}")]
    Parameter {
        /// Parameter name.
        name: String,
        /// Error reported by the parameter.
        message: String,
    },

    /// I/O error outside the trace store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The control loop is no longer running.
    #[error("scan controller is not running")]
    ControllerGone,

    /// Feature compiled out.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

impl DaqError {
    /// Whether the error ends a running scan.
    ///
    /// Transport failures (including RAM verify mismatches) are fatal; evaluation
    /// failures are absorbed by the controller and never reach this point as run
    /// errors.
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(
            self,
            DaqError::Pulser(_) | DaqError::SettleTimeout(_) | DaqError::Parameter { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_fatal() {
        let err: DaqError = PulserError::UploadRejected("bad checksum".into()).into();
        assert!(err.is_fatal_for_run());
        assert_eq!(err.to_string(), "transport: upload rejected: bad checksum");
    }

    #[test]
    fn evaluation_errors_are_not_fatal() {
        let err: DaqError = EvaluationError::MissingBucket(3).into();
        assert!(!err.is_fatal_for_run());
    }

    #[test]
    fn ram_verify_message_names_first_word() {
        let err = PulserError::RamVerify {
            address: 0x10,
            expected: 1,
            actual: 2,
        };
        let text = err.to_string();
        assert!(text.contains("0x000010"));
        assert!(text.contains("0x0000000000000001"));
    }
}
