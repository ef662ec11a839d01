//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use ion_daq::config::EngineConfig;
use ion_daq::pulser::mock::MockPulser;
use ion_daq::pulser::program::{ProgramVariable, ValueEncoding};
use ion_daq::pulser::worker::ReaderItem;
use ion_daq::pulser::{DataPacket, PulseProgram};
use ion_daq::scan::ScanController;
use tempfile::TempDir;

/// Program with one raw variable `t` at address 4.
pub fn program() -> PulseProgram {
    PulseProgram::new("integration", vec![0x5A; 32]).with_variable(
        "t",
        ProgramVariable {
            address: 4,
            value: 0.0,
            encoding: ValueEncoding::Raw,
        },
    )
}

/// Configuration writing into `dir`.
pub fn config(dir: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.storage.output_dir = dir.path().to_path_buf();
    config.storage.config_store = dir.path().join("store.json");
    config.scan.settle_poll_ms = 10;
    config
}

/// Controller driven by hand over a [`MockPulser`].
pub fn mock_controller(dir: &TempDir) -> (Arc<MockPulser>, ScanController) {
    let pulser = Arc::new(MockPulser::new());
    let controller = ScanController::new(pulser.clone(), program(), config(dir))
        .expect("controller");
    (pulser, controller)
}

/// Point packet with the given counts per bucket.
pub fn packet(counts: &[(u8, u32)]) -> ReaderItem {
    let mut packet = DataPacket::default();
    for &(bucket, count) in counts {
        packet.counts.entry(bucket).or_default().push(count);
    }
    Ok(packet)
}

/// Final packet with `exit_code` and no data.
pub fn final_packet(exit_code: u64) -> ReaderItem {
    Ok(DataPacket::final_with_exit(exit_code))
}
