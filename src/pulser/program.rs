//! Pulse program metadata.
//!
//! The sequencer only sees a binary and a data RAM image. The host keeps the
//! symbolic side: where each variable lives in RAM, how a physical value is turned
//! into a RAM word, and what a non-standard exit code means.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PulserError;
use crate::timing::TIMEBASE_NS;

/// Mask of the 24-bit address field of an update word.
pub const ADDRESS_MASK: u32 = 0x00FF_FFFF;

/// Mask of the 40-bit value field of an update word.
pub const VALUE_MASK: u64 = (1 << 40) - 1;

/// Update address telling the program that the scan is over.
pub const END_OF_SCAN_ADDRESS: u32 = 0xFF_FFFF;

/// Update address that runs one point without changing anything.
pub const NOOP_ADDRESS: u32 = 0xFF_FFFE;

/// Update address that steps a parameter list stored in data RAM.
pub const PARAM_STEP_ADDRESS: u32 = 0xFF_FFFD;

/// Build a 64-bit update word.
pub fn update_word(address: u32, value: u64) -> u64 {
    (u64::from(address & ADDRESS_MASK) << 40) | (value & VALUE_MASK)
}

/// Split an update word into address and value.
pub fn split_update_word(word: u64) -> (u32, u64) {
    ((word >> 40) as u32 & ADDRESS_MASK, word & VALUE_MASK)
}

/// The end-of-scan update word.
pub fn end_of_scan_word() -> u64 {
    update_word(END_OF_SCAN_ADDRESS, 0)
}

/// How a physical value is stored in a RAM word.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueEncoding {
    /// Value is rounded to an integer.
    #[default]
    Raw,
    /// Value is a time in seconds, stored as sequencer ticks.
    Time,
    /// Value is a frequency in Hz, stored as a tuning word of `bits` bits for a
    /// synthesizer clocked at `clock_hz`.
    Frequency {
        /// Synthesizer reference clock.
        clock_hz: f64,
        /// Width of the tuning word.
        bits: u8,
    },
}

impl ValueEncoding {
    /// Physical value → RAM word.
    pub fn encode(&self, value: f64) -> Result<u64, PulserError> {
        if !value.is_finite() || value < 0.0 {
            return Err(PulserError::OutOfRange(format!(
                "cannot encode {value} as an unsigned word"
            )));
        }
        let word = match *self {
            ValueEncoding::Raw => value.round(),
            ValueEncoding::Time => (value * 1e9 / TIMEBASE_NS as f64).round(),
            ValueEncoding::Frequency { clock_hz, bits } => {
                (value / clock_hz * 2f64.powi(i32::from(bits))).round()
            }
        };
        if word >= VALUE_MASK as f64 {
            return Err(PulserError::OutOfRange(format!(
                "{value} does not fit the 40-bit value field"
            )));
        }
        Ok(word as u64)
    }

    /// RAM word → physical value.
    pub fn decode(&self, word: u64) -> f64 {
        match *self {
            ValueEncoding::Raw => word as f64,
            ValueEncoding::Time => word as f64 * TIMEBASE_NS as f64 * 1e-9,
            ValueEncoding::Frequency { clock_hz, bits } => {
                word as f64 * clock_hz / 2f64.powi(i32::from(bits))
            }
        }
    }
}

/// A named variable of the pulse program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramVariable {
    /// Word address in data RAM.
    pub address: u32,
    /// Value used when no global overrides it.
    pub value: f64,
    /// Storage encoding.
    #[serde(default)]
    pub encoding: ValueEncoding,
}

/// A pulse program together with everything the host needs to drive it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulseProgram {
    /// Program name (shows up in trace descriptions).
    pub name: String,
    /// Binary uploaded to the sequencer.
    #[serde(default)]
    pub binary: Vec<u8>,
    /// Initial data RAM image.
    #[serde(default)]
    pub data: Vec<u64>,
    /// Variables by name.
    #[serde(default)]
    pub variables: BTreeMap<String, ProgramVariable>,
    /// Meaning of non-standard exit codes.
    #[serde(default)]
    pub exit_codes: BTreeMap<u64, String>,
    /// Counter buckets the program reports.
    #[serde(default = "default_counter_mask")]
    pub counter_mask: u16,
    /// ADC channels the program reports.
    #[serde(default)]
    pub adc_mask: u8,
    /// Counter integration time.
    #[serde(default = "default_integration", with = "duration_micros")]
    pub integration_time: Duration,
}

fn default_counter_mask() -> u16 {
    0xFFFF
}

fn default_integration() -> Duration {
    Duration::from_micros(100)
}

mod duration_micros {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_micros() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_micros(u64::deserialize(d)?))
    }
}

impl PulseProgram {
    /// Create a program with a binary and no variables.
    pub fn new(name: impl Into<String>, binary: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            binary,
            data: Vec::new(),
            variables: BTreeMap::new(),
            exit_codes: BTreeMap::new(),
            counter_mask: default_counter_mask(),
            adc_mask: 0,
            integration_time: default_integration(),
        }
    }

    /// Add a variable.
    pub fn with_variable(mut self, name: impl Into<String>, variable: ProgramVariable) -> Self {
        self.variables.insert(name.into(), variable);
        self
    }

    /// Add an exit-code name.
    pub fn with_exit_code(mut self, code: u64, name: impl Into<String>) -> Self {
        self.exit_codes.insert(code, name.into());
        self
    }

    /// Human readable name of an exit code.
    pub fn exit_name(&self, code: u64) -> String {
        self.exit_codes
            .get(&code)
            .cloned()
            .unwrap_or_else(|| format!("exit code {code:#x}"))
    }

    /// Look up a variable.
    pub fn variable(&self, name: &str) -> Result<&ProgramVariable, PulserError> {
        self.variables
            .get(name)
            .ok_or_else(|| PulserError::OutOfRange(format!("program has no variable '{name}'")))
    }

    /// Update word that sets variable `name` to `value`.
    pub fn variable_update(&self, name: &str, value: f64) -> Result<u64, PulserError> {
        let variable = self.variable(name)?;
        Ok(update_word(variable.address, variable.encoding.encode(value)?))
    }

    /// Data RAM image with every variable encoded, reading current values
    /// through `lookup` (globals) and falling back to the stored defaults.
    pub fn ram_image(
        &self,
        lookup: impl Fn(&str) -> Option<f64>,
    ) -> Result<Vec<u64>, PulserError> {
        let mut image = self.data.clone();
        for (name, variable) in &self.variables {
            let value = lookup(name).unwrap_or(variable.value);
            let address = variable.address as usize;
            if image.len() <= address {
                image.resize(address + 1, 0);
            }
            image[address] = variable.encoding.encode(value)?;
        }
        Ok(image)
    }
}
