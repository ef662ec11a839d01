//! Evaluation pipeline: reduce one data packet to one scan point per evaluator.
//!
//! An [`EvaluationDefinition`] names an input bucket, an [`Algorithm`] and a
//! settings map. Every algorithm implements [`evaluate`](EvaluationDefinition::evaluate);
//! some also provide histograms, per-shot qubit outputs for gate-sequence scans,
//! or auxiliary detail streams. Capabilities are dispatched on the algorithm
//! variant and return `None` where they do not apply.
//!
//! Evaluation never stops a scan: errors are reported per evaluator and the
//! controller records a NaN point.
//!
//! # Example
//! ```
//! use ion_daq::evaluation::{Algorithm, EvalContext, EvaluationDefinition};
//! use ion_daq::pulser::DataPacket;
//! use ion_daq::scan::globals::GlobalVariables;
//!
//! let mut packet = DataPacket::default();
//! packet.counts.insert(0, vec![30]);
//! packet.counts.insert(1, vec![100]);
//!
//! let ratio = EvaluationDefinition::new("ratio", 0, Algorithm::Ratio { reference: 1 });
//! let globals = GlobalVariables::default();
//! let result = ratio.evaluate(&packet, &EvalContext::new(&globals)).unwrap();
//! assert_eq!(result.value, 0.3);
//! ```

pub mod averaging;
pub mod histogram;
pub mod stats;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError, EvaluationError};
use crate::pulser::{DataPacket, PulseProgram};
use crate::scan::globals::GlobalVariables;
use histogram::Histogram;

/// Sigma of the Wilson error bars.
const WILSON_Z: f64 = 1.0;

/// Where a threshold comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdSource {
    /// Fixed count threshold.
    Fixed(u32),
    /// Global variable (or pulse program variable) of that name.
    Global(String),
}

/// Reduction algorithm of an evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Algorithm {
    /// Mean counts per shot; standard error of the mean.
    MeanCount,
    /// Fraction of shots above a threshold; Wilson interval.
    Threshold {
        /// Count threshold; a shot is bright when `count > threshold`.
        threshold: ThresholdSource,
        /// Report the dark fraction instead.
        #[serde(default)]
        invert: bool,
    },
    /// Total counts of the input bucket over total counts of `reference`.
    Ratio {
        /// Denominator bucket.
        reference: u8,
    },
    /// Two-qubit parity `P(even) - P(odd)` of the input and `other` bucket.
    Parity {
        /// Second bucket.
        other: u8,
        /// Bright threshold for both buckets.
        threshold: ThresholdSource,
    },
    /// Mean ADC sample of the input channel.
    AdcMean,
}

impl Algorithm {
    /// Short name used in logs and trace descriptions.
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::MeanCount => "mean_count",
            Algorithm::Threshold { .. } => "threshold",
            Algorithm::Ratio { .. } => "ratio",
            Algorithm::Parity { .. } => "parity",
            Algorithm::AdcMean => "adc_mean",
        }
    }
}

/// How repeated x values combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AverageType {
    /// Plain mean.
    #[default]
    Mean,
    /// Inverse-variance weighted mean.
    Weighted,
    /// Median.
    Median,
}

/// Per-evaluator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalSettings {
    /// Combine points that share an x value into one row.
    pub average_same_x: bool,
    /// OR this many consecutive shots together (0 or 1 disables).
    pub combine_points: usize,
    /// Averaging used with `average_same_x`.
    pub average_type: AverageType,
    /// Highest bit (exclusive) kept from a combined shot.
    pub combine_points_mask_top: u32,
    /// Lowest bit kept from a combined shot.
    pub combine_points_mask_bottom: u32,
}

impl Default for EvalSettings {
    fn default() -> Self {
        Self {
            average_same_x: false,
            combine_points: 0,
            average_type: AverageType::Mean,
            combine_points_mask_top: 32,
            combine_points_mask_bottom: 0,
        }
    }
}

impl EvalSettings {
    /// OR groups of `combine_points` shots and keep the masked bit range.
    pub fn combine(&self, shots: &[u32]) -> Vec<u32> {
        if self.combine_points <= 1 {
            return shots.to_vec();
        }
        let bottom = self.combine_points_mask_bottom.min(31);
        let width = self.combine_points_mask_top.saturating_sub(bottom);
        let mask = if width >= 32 { u32::MAX } else { (1u32 << width) - 1 };
        shots
            .chunks(self.combine_points)
            .map(|chunk| {
                let combined = chunk.iter().fold(0u32, |acc, s| acc | s);
                (combined >> bottom) & mask
            })
            .collect()
    }
}

/// Reduced value of one point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalResult {
    /// Point value (NaN when evaluation failed).
    pub value: f64,
    /// Error bar as absolute `(low, high)` bounds.
    pub interval: Option<(f64, f64)>,
    /// Per-shot values the point was reduced from.
    pub raw: Vec<f64>,
}

impl EvalResult {
    /// Placeholder for a point that could not be evaluated.
    pub fn nan() -> Self {
        Self {
            value: f64::NAN,
            interval: None,
            raw: Vec::new(),
        }
    }

    /// `(bottom, top)` error bar lengths for the trace columns.
    pub fn error_bars(&self) -> (f64, f64) {
        match self.interval {
            Some((lo, hi)) => (self.value - lo, hi - self.value),
            None => (f64::NAN, f64::NAN),
        }
    }
}

/// Per-shot outputs for gate-sequence scans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QubitResult {
    /// Bright (1) / dark (0) per shot.
    pub values: Vec<u8>,
    /// Number of shots.
    pub repeats: usize,
    /// Timestamps of the input bucket.
    pub timestamps: Vec<u32>,
}

/// Context an evaluation may read.
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    /// Global variables in effect for the run.
    pub globals: &'a GlobalVariables,
    /// Running pulse program.
    pub program: Option<&'a PulseProgram>,
}

impl<'a> EvalContext<'a> {
    /// Context with globals only.
    pub fn new(globals: &'a GlobalVariables) -> Self {
        Self {
            globals,
            program: None,
        }
    }

    /// Add the pulse program.
    pub fn with_program(mut self, program: &'a PulseProgram) -> Self {
        self.program = Some(program);
        self
    }

    fn threshold(&self, source: &ThresholdSource) -> Result<u32, EvaluationError> {
        match source {
            ThresholdSource::Fixed(t) => Ok(*t),
            ThresholdSource::Global(name) => self
                .globals
                .get(name)
                .or_else(|| {
                    self.program
                        .and_then(|p| p.variables.get(name))
                        .map(|v| v.value)
                })
                .map(|v| v.max(0.0).round() as u32)
                .ok_or_else(|| EvaluationError::UnknownGlobal(name.clone())),
        }
    }
}

/// One evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationDefinition {
    /// Unique name; also the trace name.
    pub name: String,
    /// Input counter bucket or ADC channel.
    pub channel: u8,
    /// Reduction.
    pub algorithm: Algorithm,
    /// Plot the trace is shown in.
    #[serde(default)]
    pub plot_target: String,
    /// Accumulate histograms of the input bucket.
    #[serde(default)]
    pub histogram: bool,
    /// Reduction settings.
    #[serde(default)]
    pub settings: EvalSettings,
}

impl EvaluationDefinition {
    /// Evaluator with default settings, plotted under its own name.
    pub fn new(name: impl Into<String>, channel: u8, algorithm: Algorithm) -> Self {
        let name = name.into();
        Self {
            plot_target: name.clone(),
            name,
            channel,
            algorithm,
            histogram: false,
            settings: EvalSettings::default(),
        }
    }

    /// Replace the settings.
    pub fn with_settings(mut self, settings: EvalSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Enable histogram accumulation.
    pub fn with_histogram(mut self, enabled: bool) -> Self {
        self.histogram = enabled;
        self
    }

    fn shots(&self, packet: &DataPacket, bucket: u8) -> Result<Vec<u32>, EvaluationError> {
        packet
            .bucket(bucket)
            .map(|shots| self.settings.combine(shots))
            .ok_or(EvaluationError::MissingBucket(bucket))
    }

    /// Reduce `packet` to a point.
    pub fn evaluate(&self, packet: &DataPacket, ctx: &EvalContext<'_>) -> Result<EvalResult, EvaluationError> {
        match &self.algorithm {
            Algorithm::MeanCount => {
                let raw: Vec<f64> = self
                    .shots(packet, self.channel)?
                    .into_iter()
                    .map(f64::from)
                    .collect();
                let value = stats::mean(&raw).ok_or(EvaluationError::DivideByZero("mean_count"))?;
                let interval = stats::standard_error(&raw).map(|e| (value - e, value + e));
                Ok(EvalResult { value, interval, raw })
            }
            Algorithm::Threshold { threshold, invert } => {
                let t = ctx.threshold(threshold)?;
                let shots = self.shots(packet, self.channel)?;
                let raw: Vec<f64> = shots
                    .iter()
                    .map(|&s| if (s > t) != *invert { 1.0 } else { 0.0 })
                    .collect();
                let n = raw.len() as f64;
                let k: f64 = raw.iter().sum();
                if raw.is_empty() {
                    return Err(EvaluationError::DivideByZero("threshold"));
                }
                Ok(EvalResult {
                    value: k / n,
                    interval: stats::wilson_interval(k, n, WILSON_Z),
                    raw,
                })
            }
            Algorithm::Ratio { reference } => {
                let k: f64 = self.shots(packet, self.channel)?.iter().map(|&s| f64::from(s)).sum();
                let n: f64 = self.shots(packet, *reference)?.iter().map(|&s| f64::from(s)).sum();
                if n == 0.0 {
                    return Err(EvaluationError::DivideByZero("ratio"));
                }
                Ok(EvalResult {
                    value: k / n,
                    interval: stats::wilson_interval(k, n, WILSON_Z),
                    raw: vec![k, n],
                })
            }
            Algorithm::Parity { other, threshold } => {
                let t = ctx.threshold(threshold)?;
                let a = self.shots(packet, self.channel)?;
                let b = self.shots(packet, *other)?;
                let raw: Vec<f64> = a
                    .iter()
                    .zip(&b)
                    .map(|(&x, &y)| if (x > t) == (y > t) { 1.0 } else { -1.0 })
                    .collect();
                if raw.is_empty() {
                    return Err(EvaluationError::DivideByZero("parity"));
                }
                let n = raw.len() as f64;
                let even = raw.iter().filter(|&&v| v > 0.0).count() as f64;
                let interval = stats::wilson_interval(even, n, WILSON_Z)
                    .map(|(lo, hi)| (2.0 * lo - 1.0, 2.0 * hi - 1.0));
                Ok(EvalResult {
                    value: 2.0 * even / n - 1.0,
                    interval,
                    raw,
                })
            }
            Algorithm::AdcMean => {
                let value = packet
                    .analog
                    .get(usize::from(self.channel))
                    .copied()
                    .map(f64::from)
                    .ok_or(EvaluationError::MissingBucket(self.channel))?;
                Ok(EvalResult {
                    value,
                    interval: None,
                    raw: vec![value],
                })
            }
        }
    }

    /// Shots that feed this evaluator's histogram.
    pub fn histogram_shots(&self, packet: &DataPacket) -> Option<Vec<u32>> {
        match self.algorithm {
            Algorithm::MeanCount | Algorithm::Threshold { .. } | Algorithm::Parity { .. } => {
                self.shots(packet, self.channel).ok()
            }
            Algorithm::Ratio { .. } | Algorithm::AdcMean => None,
        }
    }

    /// Histogram of one point.
    pub fn histogram(&self, packet: &DataPacket, bins: usize) -> Option<Histogram> {
        let shots = self.histogram_shots(packet)?;
        let mut histogram = Histogram::from_shots(&shots, bins);
        if matches!(self.algorithm, Algorithm::Threshold { .. } | Algorithm::Parity { .. }) {
            histogram.fit_hint = Some("double_poisson".to_string());
        }
        Some(histogram)
    }

    /// Bright / dark per shot for gate-sequence scans.
    pub fn qubit_evaluate(
        &self,
        packet: &DataPacket,
        ctx: &EvalContext<'_>,
    ) -> Option<Result<QubitResult, EvaluationError>> {
        let Algorithm::Threshold { threshold, invert } = &self.algorithm else {
            return None;
        };
        Some(self.qubit_states(packet, ctx, threshold, *invert))
    }

    fn qubit_states(
        &self,
        packet: &DataPacket,
        ctx: &EvalContext<'_>,
        threshold: &ThresholdSource,
        invert: bool,
    ) -> Result<QubitResult, EvaluationError> {
        let t = ctx.threshold(threshold)?;
        let shots = self.shots(packet, self.channel)?;
        let values: Vec<u8> = shots.iter().map(|&s| u8::from((s > t) != invert)).collect();
        Ok(QubitResult {
            repeats: values.len(),
            values,
            timestamps: packet
                .timestamps
                .get(&self.channel)
                .cloned()
                .unwrap_or_default(),
        })
    }

    /// Auxiliary stream of ADC evaluators: all channel means and the input
    /// bucket's timestamps.
    pub fn detail_evaluate(&self, packet: &DataPacket) -> Option<(Vec<f64>, Vec<u32>)> {
        match self.algorithm {
            Algorithm::AdcMean => Some((
                packet.analog.iter().map(|&v| f64::from(v)).collect(),
                packet
                    .timestamps
                    .get(&self.channel)
                    .cloned()
                    .unwrap_or_default(),
            )),
            _ => None,
        }
    }
}

/// Ordered list of evaluators of one scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSet {
    evaluations: Vec<EvaluationDefinition>,
}

impl EvaluationSet {
    /// Build a set; names must be unique and non-empty.
    pub fn new(evaluations: Vec<EvaluationDefinition>) -> AppResult<Self> {
        let mut seen = HashSet::new();
        for evaluation in &evaluations {
            if evaluation.name.is_empty() {
                return Err(DaqError::Configuration("evaluation without a name".into()));
            }
            if !seen.insert(evaluation.name.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "duplicate evaluation '{}'",
                    evaluation.name
                )));
            }
            if matches!(evaluation.algorithm, Algorithm::AdcMean) && evaluation.channel >= 4 {
                return Err(DaqError::Configuration(format!(
                    "evaluation '{}': ADC channel {} out of range",
                    evaluation.name, evaluation.channel
                )));
            }
        }
        Ok(Self { evaluations })
    }

    /// Evaluators in order.
    pub fn iter(&self) -> impl Iterator<Item = &EvaluationDefinition> {
        self.evaluations.iter()
    }

    /// Number of evaluators.
    pub fn len(&self) -> usize {
        self.evaluations.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.evaluations.is_empty()
    }

    /// Evaluate every evaluator on `packet`.
    pub fn evaluate_all(
        &self,
        packet: &DataPacket,
        ctx: &EvalContext<'_>,
    ) -> Vec<Result<EvalResult, EvaluationError>> {
        self.evaluations
            .iter()
            .map(|e| e.evaluate(packet, ctx))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(counts: &[(u8, Vec<u32>)]) -> DataPacket {
        let mut packet = DataPacket::default();
        for (bucket, shots) in counts {
            packet.counts.insert(*bucket, shots.clone());
        }
        packet
    }

    #[test]
    fn ratio_and_rate() {
        let globals = GlobalVariables::default();
        let ctx = EvalContext::new(&globals);
        let p = packet(&[(0, vec![30]), (1, vec![100])]);
        let ratio = EvaluationDefinition::new("r", 0, Algorithm::Ratio { reference: 1 });
        let rate = EvaluationDefinition::new("c", 1, Algorithm::MeanCount);
        let r = ratio.evaluate(&p, &ctx).unwrap();
        assert_eq!(r.value, 0.3);
        let (lo, hi) = r.interval.unwrap();
        assert!(lo < 0.3 && hi > 0.3);
        assert_eq!(rate.evaluate(&p, &ctx).unwrap().value, 100.0);
    }

    #[test]
    fn missing_bucket_and_zero_denominator() {
        let globals = GlobalVariables::default();
        let ctx = EvalContext::new(&globals);
        let ratio = EvaluationDefinition::new("r", 0, Algorithm::Ratio { reference: 1 });
        assert_eq!(
            ratio.evaluate(&packet(&[(0, vec![1])]), &ctx),
            Err(EvaluationError::MissingBucket(1))
        );
        assert_eq!(
            ratio.evaluate(&packet(&[(0, vec![1]), (1, vec![0])]), &ctx),
            Err(EvaluationError::DivideByZero("ratio"))
        );
    }

    #[test]
    fn threshold_reads_global() {
        let mut globals = GlobalVariables::default();
        globals.set("discriminator", 2.0);
        let ctx = EvalContext::new(&globals);
        let eval = EvaluationDefinition::new(
            "bright",
            0,
            Algorithm::Threshold {
                threshold: ThresholdSource::Global("discriminator".into()),
                invert: false,
            },
        );
        let result = eval.evaluate(&packet(&[(0, vec![0, 1, 3, 5])]), &ctx).unwrap();
        assert_eq!(result.value, 0.5);
        assert_eq!(result.raw, vec![0.0, 0.0, 1.0, 1.0]);

        let missing = EvaluationDefinition::new(
            "bright",
            0,
            Algorithm::Threshold {
                threshold: ThresholdSource::Global("nope".into()),
                invert: false,
            },
        );
        assert!(matches!(
            missing.evaluate(&packet(&[(0, vec![1])]), &ctx),
            Err(EvaluationError::UnknownGlobal(_))
        ));
    }

    #[test]
    fn parity_of_correlated_shots() {
        let globals = GlobalVariables::default();
        let ctx = EvalContext::new(&globals);
        let eval = EvaluationDefinition::new(
            "parity",
            0,
            Algorithm::Parity {
                other: 1,
                threshold: ThresholdSource::Fixed(1),
            },
        );
        let p = packet(&[(0, vec![5, 0, 5, 0]), (1, vec![5, 0, 0, 5])]);
        assert_eq!(eval.evaluate(&p, &ctx).unwrap().value, 0.0);
        let p = packet(&[(0, vec![5, 0]), (1, vec![5, 0])]);
        assert_eq!(eval.evaluate(&p, &ctx).unwrap().value, 1.0);
    }

    #[test]
    fn combine_points_ors_and_masks() {
        let settings = EvalSettings {
            combine_points: 2,
            combine_points_mask_top: 3,
            combine_points_mask_bottom: 1,
            ..Default::default()
        };
        // (0b0001 | 0b0100) >> 1 & 0b11 = 0b10; (0b1000 | 0b0010) >> 1 & 0b11 = 0b01
        assert_eq!(settings.combine(&[0b0001, 0b0100, 0b1000, 0b0010]), vec![2, 1]);
        assert_eq!(EvalSettings::default().combine(&[7, 8]), vec![7, 8]);
    }

    #[test]
    fn capabilities_follow_algorithm() {
        let globals = GlobalVariables::default();
        let ctx = EvalContext::new(&globals);
        let mut p = packet(&[(0, vec![0, 4])]);
        p.analog = [0.5, 0.0, 0.0, 0.0];
        p.timestamps.insert(0, vec![10, 20]);

        let threshold = EvaluationDefinition::new(
            "q",
            0,
            Algorithm::Threshold {
                threshold: ThresholdSource::Fixed(1),
                invert: false,
            },
        );
        let qubit = threshold.qubit_evaluate(&p, &ctx).unwrap().unwrap();
        assert_eq!(qubit.values, vec![0, 1]);
        assert_eq!(qubit.timestamps, vec![10, 20]);
        assert!(threshold.histogram(&p, 16).is_some());
        assert!(threshold.detail_evaluate(&p).is_none());

        let adc = EvaluationDefinition::new("adc", 0, Algorithm::AdcMean);
        assert_eq!(adc.evaluate(&p, &ctx).unwrap().value, 0.5);
        assert!(adc.qubit_evaluate(&p, &ctx).is_none());
        assert_eq!(adc.detail_evaluate(&p).unwrap().1, vec![10, 20]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let a = EvaluationDefinition::new("a", 0, Algorithm::MeanCount);
        assert!(EvaluationSet::new(vec![a.clone(), a]).is_err());
    }
}
