//! Post-scan analysis.
//!
//! Runs once a scan finished normally. Results are stored in the trace
//! description under `fit`; failures under `failedAnalysis`. A failed analysis
//! never prevents the trace from being saved.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::trace::{MetaValue, Trace};

/// Why an analysis produced no result.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    /// Not enough finite points.
    #[error("need at least {needed} points, have {have}")]
    TooFewPoints {
        /// Required points.
        needed: usize,
        /// Finite points available.
        have: usize,
    },
    /// All x values are equal.
    #[error("x values are degenerate")]
    Degenerate,
    /// The evaluation has no trace.
    #[error("no trace for evaluation '{0}'")]
    MissingTrace(String),
}

/// Analysis recipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    /// Least-squares line `y = slope * x + intercept`.
    Linear,
    /// Position of the largest y.
    Maximum,
    /// Position of the smallest y.
    Minimum,
}

/// An analysis bound to an evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisDefinition {
    /// Name under which results are stored.
    pub name: String,
    /// Evaluation (trace) to analyze.
    pub evaluation: String,
    /// Recipe.
    pub kind: AnalysisKind,
}

fn finite_points(trace: &Trace) -> Vec<(f64, f64)> {
    trace
        .values("x")
        .into_iter()
        .zip(trace.values("y"))
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .collect()
}

impl AnalysisDefinition {
    /// Run on `trace`.
    pub fn run(&self, trace: &Trace) -> Result<BTreeMap<String, MetaValue>, AnalysisError> {
        let points = finite_points(trace);
        let mut out = BTreeMap::new();
        out.insert("evaluation".to_string(), MetaValue::from(self.evaluation.as_str()));
        match self.kind {
            AnalysisKind::Linear => {
                if points.len() < 2 {
                    return Err(AnalysisError::TooFewPoints {
                        needed: 2,
                        have: points.len(),
                    });
                }
                let n = points.len() as f64;
                let mx = points.iter().map(|p| p.0).sum::<f64>() / n;
                let my = points.iter().map(|p| p.1).sum::<f64>() / n;
                let sxx: f64 = points.iter().map(|p| (p.0 - mx).powi(2)).sum();
                let sxy: f64 = points.iter().map(|p| (p.0 - mx) * (p.1 - my)).sum();
                let syy: f64 = points.iter().map(|p| (p.1 - my).powi(2)).sum();
                if sxx == 0.0 {
                    return Err(AnalysisError::Degenerate);
                }
                let slope = sxy / sxx;
                let intercept = my - slope * mx;
                let r2 = if syy == 0.0 { 1.0 } else { sxy * sxy / (sxx * syy) };
                out.insert("function".into(), MetaValue::from("linear"));
                out.insert("slope".into(), MetaValue::Float(slope));
                out.insert("intercept".into(), MetaValue::Float(intercept));
                out.insert("r2".into(), MetaValue::Float(r2));
            }
            AnalysisKind::Maximum | AnalysisKind::Minimum => {
                let pick = |a: &(f64, f64), b: &(f64, f64)| {
                    if self.kind == AnalysisKind::Maximum {
                        a.1.total_cmp(&b.1)
                    } else {
                        b.1.total_cmp(&a.1)
                    }
                };
                let best = points
                    .iter()
                    .max_by(|a, b| pick(a, b))
                    .ok_or(AnalysisError::TooFewPoints { needed: 1, have: 0 })?;
                let function = if self.kind == AnalysisKind::Maximum { "maximum" } else { "minimum" };
                out.insert("function".into(), MetaValue::from(function));
                out.insert("x".into(), MetaValue::Float(best.0));
                out.insert("y".into(), MetaValue::Float(best.1));
            }
        }
        Ok(out)
    }
}

/// Run `analyses` against the traces they name. Returns `(fit, failed)`:
/// successful results by analysis name, and error messages by analysis name.
pub fn run_all<'a>(
    analyses: &[AnalysisDefinition],
    trace_for: impl Fn(&str) -> Option<&'a Trace>,
) -> (BTreeMap<String, MetaValue>, BTreeMap<String, MetaValue>) {
    let mut fit = BTreeMap::new();
    let mut failed = BTreeMap::new();
    for analysis in analyses {
        let result = trace_for(&analysis.evaluation)
            .ok_or_else(|| AnalysisError::MissingTrace(analysis.evaluation.clone()))
            .and_then(|trace| analysis.run(trace));
        match result {
            Ok(values) => {
                fit.insert(analysis.name.clone(), MetaValue::Dict(values));
            }
            Err(e) => {
                tracing::warn!(analysis = %analysis.name, error = %e, "analysis failed");
                failed.insert(analysis.name.clone(), MetaValue::from(e.to_string()));
            }
        }
    }
    (fit, failed)
}
