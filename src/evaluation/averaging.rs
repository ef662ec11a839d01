//! Combining points that share an x value (`averageSameX`).

use std::collections::HashMap;

use super::stats;
use super::{AverageType, EvalResult};

/// Where an averaged point goes in the trace.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Placement {
    /// First point at this x: append a row.
    Append,
    /// Repeated x: overwrite the existing row.
    Update(usize),
}

/// Result of adding one point.
#[derive(Debug, Clone, PartialEq)]
pub struct AveragedPoint {
    /// Target row.
    pub placement: Placement,
    /// Combined value.
    pub value: f64,
    /// Combined error bar as absolute `(low, high)` bounds.
    pub interval: Option<(f64, f64)>,
    /// Points combined so far.
    pub samples: usize,
}

#[derive(Debug, Clone)]
struct Slot {
    row: usize,
    values: Vec<f64>,
    errors: Vec<Option<f64>>,
}

/// Running accumulator for one evaluation.
#[derive(Debug, Clone, Default)]
pub struct Averager {
    slots: HashMap<u64, Slot>,
    rows: usize,
}

impl Averager {
    /// Empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a point evaluated at `x`.
    pub fn add(&mut self, x: f64, result: &EvalResult, average_type: AverageType) -> AveragedPoint {
        let key = x.to_bits();
        let error = result.interval.map(|(lo, hi)| (hi - lo) / 2.0);
        let placement = match self.slots.get_mut(&key) {
            Some(slot) => {
                slot.values.push(result.value);
                slot.errors.push(error);
                Placement::Update(slot.row)
            }
            None => {
                self.slots.insert(
                    key,
                    Slot {
                        row: self.rows,
                        values: vec![result.value],
                        errors: vec![error],
                    },
                );
                self.rows += 1;
                Placement::Append
            }
        };
        let slot = &self.slots[&key];
        if slot.values.len() == 1 {
            return AveragedPoint {
                placement,
                value: result.value,
                interval: result.interval,
                samples: 1,
            };
        }
        let finite: Vec<f64> = slot.values.iter().copied().filter(|v| v.is_finite()).collect();
        let (value, err) = match average_type {
            AverageType::Mean => (
                stats::mean(&finite).unwrap_or(f64::NAN),
                stats::standard_error(&finite),
            ),
            AverageType::Median => (
                stats::median(&finite).unwrap_or(f64::NAN),
                stats::standard_error(&finite),
            ),
            AverageType::Weighted => {
                let pairs: (Vec<f64>, Vec<Option<f64>>) = slot
                    .values
                    .iter()
                    .zip(&slot.errors)
                    .filter(|(v, _)| v.is_finite())
                    .map(|(v, e)| (*v, *e))
                    .unzip();
                match stats::weighted_mean(&pairs.0, &pairs.1) {
                    Some((m, e)) => (m, Some(e)),
                    None => (f64::NAN, None),
                }
            }
        };
        AveragedPoint {
            placement,
            value,
            interval: err.map(|e| (value - e, value + e)),
            samples: slot.values.len(),
        }
    }
}
