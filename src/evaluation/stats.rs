//! Small statistics helpers used by the evaluators.

/// Arithmetic mean; `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Standard error of the mean; `None` with fewer than two values.
pub fn standard_error(values: &[f64]) -> Option<f64> {
    let n = values.len();
    if n < 2 {
        return None;
    }
    let m = mean(values)?;
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (n - 1) as f64;
    Some((variance / n as f64).sqrt())
}

/// Median; `None` for an empty slice. NaN values are ignored.
pub fn median(values: &[f64]) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}

/// Inverse-variance weighted mean and its standard error.
///
/// `errors` are one-sigma uncertainties; values with a zero, NaN or missing
/// error get unit weight.
pub fn weighted_mean(values: &[f64], errors: &[Option<f64>]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let mut sum = 0.0;
    let mut weights = 0.0;
    for (i, v) in values.iter().enumerate() {
        let w = match errors.get(i).copied().flatten() {
            Some(e) if e.is_finite() && e > 0.0 => 1.0 / (e * e),
            _ => 1.0,
        };
        sum += w * v;
        weights += w;
    }
    Some((sum / weights, (1.0 / weights).sqrt()))
}

/// Wilson score interval for `successes` out of `trials` at `z` sigma.
///
/// Returns `(low, high)`; `None` when `trials == 0` or `successes > trials`.
pub fn wilson_interval(successes: f64, trials: f64, z: f64) -> Option<(f64, f64)> {
    if trials <= 0.0 || successes < 0.0 || successes > trials {
        return None;
    }
    let p = successes / trials;
    let z2 = z * z;
    let denom = 1.0 + z2 / trials;
    let center = (p + z2 / (2.0 * trials)) / denom;
    let half = z * ((p * (1.0 - p) / trials + z2 / (4.0 * trials * trials)).sqrt()) / denom;
    Some(((center - half).max(0.0), (center + half).min(1.0)))
}
