//! Data packets demultiplexed from the sequencer return stream.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Exit code the sequencer reports after a host-requested interrupt.
pub const INTERRUPT_EXIT_CODE: u64 = 0x1000_0000_0000;

/// Exit codes that mean the program ran to completion.
pub const NORMAL_EXIT_CODES: [u64; 2] = [0, 0xFFFF];

/// Classification of a final packet's exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Program completed (`0` or `0xFFFF`).
    Normal,
    /// Program stopped because the host asked for an interrupt.
    Interrupted,
    /// Any other code; decoded with the program's exit-code table.
    Error(u64),
}

impl ExitStatus {
    /// Classify a raw exit code.
    pub fn from_code(code: u64) -> Self {
        if NORMAL_EXIT_CODES.contains(&code) {
            ExitStatus::Normal
        } else if code == INTERRUPT_EXIT_CODE {
            ExitStatus::Interrupted
        } else {
            ExitStatus::Error(code)
        }
    }
}

/// One unit of sequencer output.
///
/// A non-final packet holds the data of one scan point. A final packet ends the
/// program run; it may still carry the data of the point that was in flight when
/// the program stopped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataPacket {
    /// Whether this packet ends the program run.
    pub is_final: bool,
    /// Exit code of the run (only meaningful when `is_final`).
    pub exit_code: u64,
    /// Scan parameter value echoed by the sequencer, if any.
    pub scan_value: Option<u64>,
    /// Counter values per bucket, one entry per shot, in arrival order.
    pub counts: BTreeMap<u8, Vec<u32>>,
    /// Mean ADC sample per channel.
    pub analog: [f32; 4],
    /// Timestamps per bucket, in arrival order.
    pub timestamps: BTreeMap<u8, Vec<u32>>,
    /// Program addresses that reported a timing violation.
    pub timing_violations: Vec<u32>,
    /// Auxiliary bytes.
    pub other: Vec<u8>,
    /// Extended wall-clock ticks at the start and end of the packet.
    pub time_interval: (u64, u64),
    /// The host buffer overflowed before this packet was delivered.
    pub overrun: bool,
}

impl DataPacket {
    /// A final packet carrying only an exit code.
    pub fn final_with_exit(exit_code: u64) -> Self {
        Self {
            is_final: true,
            exit_code,
            ..Default::default()
        }
    }

    /// Whether the packet contains any measurement data.
    pub fn has_data(&self) -> bool {
        self.counts.values().any(|shots| !shots.is_empty())
            || self.timestamps.values().any(|stamps| !stamps.is_empty())
            || self.analog.iter().any(|value| *value != 0.0)
            || !self.other.is_empty()
    }

    /// Sum of all counts over all buckets.
    pub fn total_counts(&self) -> u64 {
        self.counts
            .values()
            .flat_map(|shots| shots.iter())
            .map(|&count| u64::from(count))
            .sum()
    }

    /// Shots recorded for one bucket.
    pub fn bucket(&self, bucket: u8) -> Option<&[u32]> {
        self.counts.get(&bucket).map(Vec::as_slice)
    }

    /// Exit status of a final packet.
    pub fn exit_status(&self) -> ExitStatus {
        ExitStatus::from_code(self.exit_code)
    }
}
