//! Scan descriptors.
//!
//! A [`ScanDescriptor`] is built once when a scan starts and never changes while
//! it runs. It is plain data: it can be read from TOML / JSON and validated
//! before anything touches the hardware.

use serde::{Deserialize, Serialize};

use crate::analysis::AnalysisDefinition;
use crate::error::{AppResult, DaqError};

/// How the x sequence is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// `x[i] = start + i * step` for `steps` points.
    #[default]
    Linear,
    /// Linear, with the indices listed in `gaps` left out.
    LinearGap,
    /// Explicit `values`.
    List,
    /// `values` are stored in sequencer RAM; x is read from the scan echo.
    ParameterList,
    /// Endless; `x[i] = i`.
    FreeRunning,
}

/// Who moves the scan parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanTarget {
    /// A pulse program variable, stepped by update words.
    #[default]
    Internal,
    /// A named external parameter, stepped by the host.
    External,
}

/// Histogram integration policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HistogramPolicy {
    /// Each point replaces the buffer.
    None,
    /// Reset at scan start, accumulate through the run.
    #[default]
    PerRun,
    /// Survive across runs until cleared.
    All,
}

/// Gate sequences of a gate-set tomography scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSequenceInfo {
    /// Name of the gate-sequence list.
    pub name: String,
    /// Sequence per scan point.
    pub sequences: Vec<String>,
}

/// Everything that defines one scan run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanDescriptor {
    /// Scan name; also the collection name.
    pub name: String,
    /// How x values are produced.
    pub mode: ScanMode,
    /// Internal (pulse program) or external parameter.
    pub target: ScanTarget,
    /// Program variable (internal) or registered parameter (external).
    pub parameter: String,
    /// First x of linear scans.
    pub start: f64,
    /// Last x of linear scans.
    pub stop: f64,
    /// Points of linear scans.
    pub steps: usize,
    /// Points of list and parameter-list scans.
    pub values: Vec<f64>,
    /// Indices left out of a linear-gap scan.
    pub gaps: Vec<usize>,
    /// How many times the whole sequence is run.
    pub repeats: usize,
    /// Unit of x, written to the trace description.
    pub x_unit: String,
    /// Base of the trace file name (`<filename>_NNN.<ext>`).
    pub filename: String,
    /// Keep every shot in the collection's structured data.
    pub save_raw_data: bool,
    /// Histogram integration.
    pub histogram_policy: HistogramPolicy,
    /// Gate-sequence info, if this is a gate-sequence scan.
    pub gate_sequence: Option<GateSequenceInfo>,
    /// RAM address of the first entry of a parameter list.
    pub param_list_address: u32,
    /// Settle timeout of the external parameter; the config default if unset.
    pub settle_timeout_ms: Option<u64>,
    /// Analyses run after a scan that ended normally.
    pub analyses: Vec<AnalysisDefinition>,
}

impl Default for ScanDescriptor {
    fn default() -> Self {
        Self {
            name: "scan".to_string(),
            mode: ScanMode::Linear,
            target: ScanTarget::Internal,
            parameter: String::new(),
            start: 0.0,
            stop: 1.0,
            steps: 2,
            values: Vec::new(),
            gaps: Vec::new(),
            repeats: 1,
            x_unit: String::new(),
            filename: String::new(),
            save_raw_data: false,
            histogram_policy: HistogramPolicy::PerRun,
            gate_sequence: None,
            param_list_address: 0,
            settle_timeout_ms: None,
            analyses: Vec::new(),
        }
    }
}

impl ScanDescriptor {
    /// Linear scan of `parameter` from `start` to `stop` in `steps` points.
    pub fn linear(
        name: impl Into<String>,
        parameter: impl Into<String>,
        start: f64,
        stop: f64,
        steps: usize,
    ) -> Self {
        Self {
            name: name.into(),
            parameter: parameter.into(),
            start,
            stop,
            steps,
            ..Default::default()
        }
    }

    /// Scan over explicit values.
    pub fn list(name: impl Into<String>, parameter: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            mode: ScanMode::List,
            parameter: parameter.into(),
            values,
            ..Default::default()
        }
    }

    /// Endless scan; x is the point index.
    pub fn free_running(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: ScanMode::FreeRunning,
            ..Default::default()
        }
    }

    /// Switch to an external parameter.
    pub fn external(mut self) -> Self {
        self.target = ScanTarget::External;
        self
    }

    /// Set the repeat count.
    pub fn with_repeats(mut self, repeats: usize) -> Self {
        self.repeats = repeats;
        self
    }

    /// Leave `gaps` out of a linear scan.
    pub fn with_gaps(mut self, gaps: Vec<usize>) -> Self {
        self.mode = ScanMode::LinearGap;
        self.gaps = gaps;
        self
    }

    /// File name base; the scan name when unset.
    pub fn file_base(&self) -> &str {
        if self.filename.is_empty() {
            &self.name
        } else {
            &self.filename
        }
    }

    /// Step width of linear scans.
    pub fn step(&self) -> f64 {
        if self.steps > 1 {
            (self.stop - self.start) / (self.steps - 1) as f64
        } else {
            0.0
        }
    }

    /// x of linear index `i`.
    pub fn linear_x(&self, i: usize) -> f64 {
        self.start + i as f64 * self.step()
    }

    /// x values of one pass, `None` for free-running scans.
    pub fn base_points(&self) -> Option<Vec<f64>> {
        match self.mode {
            ScanMode::Linear => Some((0..self.steps).map(|i| self.linear_x(i)).collect()),
            ScanMode::LinearGap => Some(
                (0..self.steps)
                    .filter(|i| !self.gaps.contains(i))
                    .map(|i| self.linear_x(i))
                    .collect(),
            ),
            ScanMode::List | ScanMode::ParameterList => Some(self.values.clone()),
            ScanMode::FreeRunning => None,
        }
    }

    /// Check the descriptor for internal consistency.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(DaqError::Configuration(format!("scan '{}': {msg}", self.name)));
        if self.name.is_empty() {
            return Err(DaqError::Configuration("scan without a name".into()));
        }
        match self.mode {
            ScanMode::Linear | ScanMode::LinearGap => {
                if self.steps == 0 {
                    return invalid("steps must be at least 1".into());
                }
                if !self.start.is_finite() || !self.stop.is_finite() {
                    return invalid("start and stop must be finite".into());
                }
                if let Some(gap) = self.gaps.iter().find(|&&g| g >= self.steps) {
                    return invalid(format!("gap index {gap} is beyond {} steps", self.steps));
                }
                if self.mode == ScanMode::LinearGap && self.gaps.len() >= self.steps {
                    return invalid("gaps leave no points".into());
                }
            }
            ScanMode::List | ScanMode::ParameterList => {
                if self.values.is_empty() {
                    return invalid("value list is empty".into());
                }
                if self.values.iter().any(|v| !v.is_finite()) {
                    return invalid("value list contains a non-finite value".into());
                }
            }
            ScanMode::FreeRunning => {}
        }
        if self.target == ScanTarget::External {
            if self.parameter.is_empty() {
                return invalid("external scans need a parameter".into());
            }
            if matches!(self.mode, ScanMode::ParameterList | ScanMode::FreeRunning) {
                return invalid(format!("{:?} scans cannot use an external parameter", self.mode));
            }
        }
        if let Some(gates) = &self.gate_sequence {
            let points = self.base_points().map(|p| p.len());
            if points.is_some_and(|n| n != gates.sequences.len()) {
                return invalid(format!(
                    "gate sequence list '{}' has {} entries for {} points",
                    gates.name,
                    gates.sequences.len(),
                    points.unwrap_or(0)
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_points_hit_both_ends() {
        let scan = ScanDescriptor::linear("s", "t", 0.0, 9.0, 10);
        let points = scan.base_points().unwrap();
        assert_eq!(points.len(), 10);
        assert_eq!(points[0], 0.0);
        assert_eq!(points[9], 9.0);
        assert_eq!(ScanDescriptor::linear("s", "t", 3.0, 7.0, 1).base_points(), Some(vec![3.0]));
    }

    #[test]
    fn gaps_are_skipped() {
        let scan = ScanDescriptor::linear("s", "t", 0.0, 4.0, 5).with_gaps(vec![1, 3]);
        assert_eq!(scan.base_points().unwrap(), vec![0.0, 2.0, 4.0]);
        scan.validate().unwrap();
        let bad = ScanDescriptor::linear("s", "t", 0.0, 4.0, 5).with_gaps(vec![5]);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn validation_rejects_inconsistent_scans() {
        assert!(ScanDescriptor::list("s", "t", vec![]).validate().is_err());
        assert!(ScanDescriptor::linear("s", "t", 0.0, 1.0, 0).validate().is_err());
        assert!(ScanDescriptor::free_running("s").external().validate().is_err());
        assert!(ScanDescriptor::linear("s", "", 0.0, 1.0, 3).external().validate().is_err());
        assert!(ScanDescriptor::free_running("s").validate().is_ok());
    }

    #[test]
    fn reads_from_toml() {
        let scan: ScanDescriptor = toml::from_str(
            r#"
            name = "detuning"
            mode = "list"
            target = "external"
            parameter = "aom_freq"
            values = [1.0, 2.0]
            histogram_policy = "all"
            "#,
        )
        .unwrap();
        assert_eq!(scan.mode, ScanMode::List);
        assert_eq!(scan.target, ScanTarget::External);
        assert_eq!(scan.histogram_policy, HistogramPolicy::All);
        assert_eq!(scan.repeats, 1);
        scan.validate().unwrap();
    }
}
