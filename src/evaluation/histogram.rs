//! Per-evaluation count histograms.
//!
//! A [`HistogramBuffer`] keeps the raw shots it has seen in arrival order;
//! binning happens on demand so buffers with different count ranges can be
//! merged without re-binning. [`HistogramSet`] holds one buffer per evaluation,
//! in the order evaluations first reported data. Recording under a name that
//! already exists extends that buffer.

use serde::{Deserialize, Serialize};

use crate::scan::descriptor::HistogramPolicy;

/// A binned histogram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    /// Occurrences per bin.
    pub counts: Vec<f64>,
    /// Bin edges, one more than `counts`.
    pub edges: Vec<f64>,
    /// Suggested fit function for the plot, if any.
    pub fit_hint: Option<String>,
}

impl Histogram {
    /// Bin integer shot values into at most `bins` bins of integer width
    /// starting at zero.
    pub fn from_shots(shots: &[u32], bins: usize) -> Self {
        let bins = bins.max(1);
        let max = shots.iter().copied().max().unwrap_or(0) as usize;
        let width = (max + 1).div_ceil(bins).max(1);
        let used = (max / width + 1).min(bins);
        let mut counts = vec![0.0; used];
        for &shot in shots {
            let bin = (shot as usize / width).min(used - 1);
            counts[bin] += 1.0;
        }
        let edges = (0..=used).map(|i| (i * width) as f64).collect();
        Self {
            counts,
            edges,
            fit_hint: Some("poisson".to_string()),
        }
    }

    /// Total number of entries.
    pub fn total(&self) -> f64 {
        self.counts.iter().sum()
    }
}

/// Raw shots accumulated for one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramBuffer {
    shots: Vec<u32>,
}

impl HistogramBuffer {
    /// Shots in arrival order.
    pub fn shots(&self) -> &[u32] {
        &self.shots
    }

    /// Add shots after the existing ones.
    pub fn extend(&mut self, shots: &[u32]) {
        self.shots.extend_from_slice(shots);
    }

    /// Replace the contents.
    pub fn replace(&mut self, shots: &[u32]) {
        self.shots.clear();
        self.shots.extend_from_slice(shots);
    }

    /// Bin the buffer.
    pub fn histogram(&self, bins: usize) -> Histogram {
        Histogram::from_shots(&self.shots, bins)
    }
}

/// Histogram buffers of all evaluations of a scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSet {
    buffers: Vec<(String, HistogramBuffer)>,
}

impl HistogramSet {
    /// Prepare for a new run: everything but the `all` policy starts empty.
    pub fn begin_run(&mut self, policy: HistogramPolicy) {
        if policy != HistogramPolicy::All {
            self.clear();
        }
    }

    /// Record one point's shots for `name` according to `policy`.
    pub fn record(&mut self, name: &str, shots: &[u32], policy: HistogramPolicy) {
        let index = match self.buffers.iter().position(|(n, _)| n == name) {
            Some(i) => i,
            None => {
                self.buffers
                    .push((name.to_string(), HistogramBuffer::default()));
                self.buffers.len() - 1
            }
        };
        let buffer = &mut self.buffers[index].1;
        match policy {
            HistogramPolicy::None => buffer.replace(shots),
            HistogramPolicy::PerRun | HistogramPolicy::All => buffer.extend(shots),
        }
    }

    /// Buffer of one evaluation.
    pub fn get(&self, name: &str) -> Option<&HistogramBuffer> {
        self.buffers.iter().find(|(n, _)| n == name).map(|(_, b)| b)
    }

    /// Evaluation names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.buffers.iter().map(|(n, _)| n.as_str())
    }

    /// Drop every buffer.
    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    /// Whether no evaluation has recorded anything.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binning_covers_every_shot() {
        let shots = [0, 1, 1, 2, 7, 30];
        let h = Histogram::from_shots(&shots, 8);
        assert_eq!(h.total(), shots.len() as f64);
        assert_eq!(h.edges.len(), h.counts.len() + 1);
        assert!(*h.edges.last().unwrap() > 30.0);
        assert_eq!(h.edges[0], 0.0);
    }

    #[test]
    fn small_counts_use_unit_bins() {
        let h = Histogram::from_shots(&[0, 1, 1, 3], 64);
        assert_eq!(h.counts, vec![1.0, 2.0, 0.0, 1.0]);
        assert_eq!(h.edges, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn policies() {
        let mut set = HistogramSet::default();
        set.record("a", &[1, 2], HistogramPolicy::None);
        set.record("a", &[3], HistogramPolicy::None);
        assert_eq!(set.get("a").unwrap().shots(), &[3]);

        set.record("a", &[4], HistogramPolicy::PerRun);
        assert_eq!(set.get("a").unwrap().shots(), &[3, 4]);
        set.begin_run(HistogramPolicy::PerRun);
        assert!(set.is_empty());

        set.record("b", &[1], HistogramPolicy::All);
        set.record("a", &[2], HistogramPolicy::All);
        set.begin_run(HistogramPolicy::All);
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["b", "a"]);
    }
}
