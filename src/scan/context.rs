//! State of one in-flight scan, and the stash of paused scans.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use super::descriptor::ScanDescriptor;
use super::events::PointResult;
use super::generator::ScanGenerator;
use super::method::ScanMethod;
use crate::evaluation::averaging::{Averager, Placement};
use crate::evaluation::histogram::HistogramSet;
use crate::evaluation::{EvalContext, EvalResult, EvaluationSet};
use crate::pulser::DataPacket;
use crate::trace::{MetaValue, SharedCollection, StructuredFormat, Trace, TraceCollection};

/// Structured-data key of per-point shot lists.
pub const RAW_DATA_KEY: &str = "rawData";

/// Structured-data key of gate-sequence qubit outputs.
pub const QUBIT_DATA_KEY: &str = "qubitData";

/// Structured-data key of auxiliary ADC streams.
pub const DETAIL_DATA_KEY: &str = "detailData";

/// Stable identity of a stashed scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StashKey {
    /// Scan name.
    pub scan_name: String,
    /// Index of the next point.
    pub current_index: usize,
    /// Points of the whole run; `None` for free-running scans.
    pub total_points: Option<usize>,
    /// When the scan was started.
    pub start_time: DateTime<Utc>,
}

/// Everything that belongs to one scan run.
#[derive(Debug)]
pub struct ScanContext {
    pub(crate) id: Uuid,
    pub(crate) scan: ScanDescriptor,
    pub(crate) evaluations: EvaluationSet,
    pub(crate) generator: ScanGenerator,
    pub(crate) collection: SharedCollection,
    pub(crate) index: usize,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) timing_violations: BTreeSet<u32>,
    pub(crate) overrides: BTreeMap<String, f64>,
    pub(crate) histograms: HistogramSet,
    pub(crate) method: ScanMethod,
    averagers: HashMap<String, Averager>,
}

impl ScanContext {
    /// Context for a new run. `histograms` are the buffers left by the previous
    /// run; the scan's policy decides what survives.
    pub fn new(
        scan: ScanDescriptor,
        evaluations: EvaluationSet,
        overrides: BTreeMap<String, f64>,
        method: ScanMethod,
        mut histograms: HistogramSet,
    ) -> Self {
        let id = Uuid::new_v4();
        let mut collection = TraceCollection::new(scan.file_base());
        collection
            .description
            .insert("scan".into(), MetaValue::from(scan.name.as_str()));
        collection
            .description
            .insert("runId".into(), MetaValue::from(id.to_string()));
        collection
            .description
            .insert("scanParameter".into(), MetaValue::from(scan.parameter.as_str()));
        collection
            .description
            .insert("xUnit".into(), MetaValue::from(scan.x_unit.as_str()));
        collection
            .description
            .insert("repeats".into(), MetaValue::Int(scan.repeats as i64));
        if !overrides.is_empty() {
            let dict = overrides
                .iter()
                .map(|(k, v)| (k.clone(), MetaValue::Float(*v)))
                .collect();
            collection.description.insert("globalOverrides".into(), MetaValue::Dict(dict));
        }
        for evaluation in evaluations.iter() {
            let mut trace = Trace::for_evaluation(evaluation.name.as_str());
            trace
                .description
                .insert("evaluation".into(), MetaValue::from(evaluation.algorithm.name()));
            trace
                .description
                .insert("plotTarget".into(), MetaValue::from(evaluation.plot_target.as_str()));
            trace
                .description
                .insert("channel".into(), MetaValue::Int(i64::from(evaluation.channel)));
            collection.add_trace(trace);
        }
        histograms.begin_run(scan.histogram_policy);
        Self {
            id,
            generator: ScanGenerator::new(&scan),
            scan,
            evaluations,
            collection: collection.into_shared(),
            index: 0,
            started_at: Utc::now(),
            timing_violations: BTreeSet::new(),
            overrides,
            histograms,
            method,
            averagers: HashMap::new(),
        }
    }

    /// Run identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Scan descriptor.
    pub fn scan(&self) -> &ScanDescriptor {
        &self.scan
    }

    /// Index of the next point.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Points of the run.
    pub fn total_points(&self) -> Option<usize> {
        self.generator.total_points()
    }

    /// Whether every point has been acquired.
    pub fn is_complete(&self) -> bool {
        self.generator.is_complete(self.index)
    }

    /// The run's traces.
    pub fn collection(&self) -> &SharedCollection {
        &self.collection
    }

    /// Histogram buffers.
    pub fn histograms(&self) -> &HistogramSet {
        &self.histograms
    }

    /// Timing-violation addresses seen so far.
    pub fn timing_violations(&self) -> &BTreeSet<u32> {
        &self.timing_violations
    }

    /// Stash identity.
    pub fn key(&self) -> StashKey {
        StashKey {
            scan_name: self.scan.name.clone(),
            current_index: self.index,
            total_points: self.total_points(),
            start_time: self.started_at,
        }
    }

    /// Record the packet's timing violations; returns the addresses not seen
    /// before in this run.
    pub fn note_timing_violations(&mut self, packet: &DataPacket) -> Vec<u32> {
        packet
            .timing_violations
            .iter()
            .copied()
            .filter(|address| self.timing_violations.insert(*address))
            .collect()
    }

    /// Evaluate `packet` as point `self.index` and append it to the traces.
    /// Does not advance the index.
    pub fn record_point(
        &mut self,
        packet: &DataPacket,
        ctx: &EvalContext<'_>,
    ) -> (f64, Vec<PointResult>) {
        let index = self.index;
        let x = self.generator.x_value(index, Some(packet));
        let total = packet.total_counts() as f64;
        let (first_tick, last_tick) = packet.time_interval;
        let policy = self.scan.histogram_policy;
        let sequence = self
            .scan
            .gate_sequence
            .as_ref()
            .and_then(|g| g.sequences.get(index % g.sequences.len().max(1)).cloned());

        let mut collection = self.collection.write();
        let mut results = Vec::with_capacity(self.evaluations.len());
        for evaluation in self.evaluations.iter() {
            let result = evaluation.evaluate(packet, ctx).unwrap_or_else(|e| {
                warn!(evaluation = %evaluation.name, index, error = %e, "evaluation failed");
                EvalResult::nan()
            });
            let (value, interval, placement) = if evaluation.settings.average_same_x {
                let averaged = self
                    .averagers
                    .entry(evaluation.name.clone())
                    .or_default()
                    .add(x, &result, evaluation.settings.average_type);
                (averaged.value, averaged.interval, averaged.placement)
            } else {
                (result.value, result.interval, Placement::Append)
            };
            let (bottom, top) = EvalResult {
                value,
                interval,
                raw: Vec::new(),
            }
            .error_bars();

            let written = collection.trace_mut(&evaluation.name).and_then(|trace| match placement {
                Placement::Append => trace.append(&[
                    ("x", x),
                    ("y", value),
                    ("top", top),
                    ("bottom", bottom),
                    ("raw", total),
                    ("timeTickFirst", first_tick as f64),
                    ("timeTickLast", last_tick as f64),
                ]),
                Placement::Update(row) => {
                    let raw = trace.column("raw").map_or(0.0, |c| c.get(row));
                    let raw = if raw.is_nan() { total } else { raw + total };
                    trace.update_row(
                        row,
                        &[
                            ("y", value),
                            ("top", top),
                            ("bottom", bottom),
                            ("raw", raw),
                            ("timeTickLast", last_tick as f64),
                        ],
                    )
                }
            });
            if let Err(e) = written {
                warn!(evaluation = %evaluation.name, index, error = %e, "point not recorded");
            }

            if evaluation.histogram {
                if let Some(shots) = evaluation.histogram_shots(packet) {
                    self.histograms.record(&evaluation.name, &shots, policy);
                }
            }
            if self.scan.save_raw_data {
                let shots = packet.bucket(evaluation.channel).unwrap_or_default();
                push_entry(
                    &mut collection,
                    RAW_DATA_KEY,
                    &evaluation.name,
                    json!({ "index": index, "x": x, "shots": shots }),
                );
                if let Some((values, timestamps)) = evaluation.detail_evaluate(packet) {
                    push_entry(
                        &mut collection,
                        DETAIL_DATA_KEY,
                        &evaluation.name,
                        json!({ "index": index, "values": values, "timestamps": timestamps }),
                    );
                }
            }
            if let Some(sequence) = &sequence {
                match evaluation.qubit_evaluate(packet, ctx) {
                    Some(Ok(qubit)) => push_entry(
                        &mut collection,
                        QUBIT_DATA_KEY,
                        &evaluation.name,
                        json!({
                            "index": index,
                            "sequence": sequence,
                            "values": qubit.values,
                            "repeats": qubit.repeats,
                            "timestamps": qubit.timestamps,
                        }),
                    ),
                    Some(Err(e)) => {
                        warn!(evaluation = %evaluation.name, index, error = %e, "qubit evaluation failed");
                    }
                    None => {}
                }
            }
            results.push(PointResult {
                evaluation: evaluation.name.clone(),
                value,
                interval,
            });
        }
        (x, results)
    }
}

fn push_entry(collection: &mut TraceCollection, key: &str, evaluation: &str, item: Value) {
    let entry = collection.structured_entry(key, StructuredFormat::Json, || json!({}));
    if !entry.is_object() {
        *entry = json!({});
    }
    if let Some(map) = entry.as_object_mut() {
        let list = map
            .entry(evaluation.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Some(items) = list.as_array_mut() {
            items.push(item);
        }
    }
}

/// Paused scans, newest last.
#[derive(Debug, Default)]
pub struct Stash {
    entries: Vec<ScanContext>,
}

impl Stash {
    /// Add a scan on top.
    pub fn push(&mut self, context: ScanContext) {
        self.entries.push(context);
    }

    /// Remove and return the scan at `index`.
    pub fn take(&mut self, index: usize) -> Option<ScanContext> {
        (index < self.entries.len()).then(|| self.entries.remove(index))
    }

    /// Keys of all stashed scans, oldest first.
    pub fn keys(&self) -> Vec<StashKey> {
        self.entries.iter().map(ScanContext::key).collect()
    }

    /// Number of stashed scans.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the stash is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stashed scan at `index`.
    pub fn get(&self, index: usize) -> Option<&ScanContext> {
        self.entries.get(index)
    }
}
