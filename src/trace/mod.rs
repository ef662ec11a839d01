//! In-memory trace store.
//!
//! A [`Trace`] is an ordered set of equally long columns (`x`, `y`, `top`,
//! `bottom`, `raw`, `timeTickFirst`, `timeTickLast`, ...). Rows are appended
//! while a scan runs; once the trace is finalized its columns are immutable.
//!
//! A [`TraceCollection`] groups the traces of one scan (one per evaluator) with a
//! shared description, optional structured data, and one destination file. All
//! traces of a collection finalize together. Collections are shared between the
//! controller and the snapshotter as [`SharedCollection`]; the snapshotter reads
//! a consistent view under the read lock.
//!
//! # File formats
//!
//! | format | module | contents |
//! |--------|--------|----------|
//! | text   | [`text`] | `# `-prefixed XML header, tab separated body |
//! | zip    | [`zip`](self::zip) | XML + pickled header, text body, structured data |
//! | hdf5   | [`hdf5`](self::hdf5) | `/variables`, `/columns` (feature `storage_hdf5`) |

pub mod hdf5;
pub mod header;
pub mod naming;
pub mod text;
pub mod zip;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::TraceError;
use header::{FileHeader, TraceHeader};

/// Marker for a hole in an integer column.
pub const INT_HOLE: i64 = i64::MIN;

/// Description key holding the creation time.
pub const FILE_CREATION: &str = "fileCreation";

/// Description key holding the finalization time.
pub const FILE_FINALIZED: &str = "fileFinalized";

/// Trace file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TraceFormat {
    /// XML header in comment lines, tab separated body.
    #[default]
    Text,
    /// HDF5 file.
    Hdf5,
    /// ZIP container.
    Zip,
}

impl TraceFormat {
    /// File extension (without dot).
    pub fn extension(self) -> &'static str {
        match self {
            TraceFormat::Text => "txt",
            TraceFormat::Hdf5 => "hdf5",
            TraceFormat::Zip => "zip",
        }
    }

    /// Guess the format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "txt" => Some(TraceFormat::Text),
            "hdf5" | "h5" => Some(TraceFormat::Hdf5),
            "zip" => Some(TraceFormat::Zip),
            _ => None,
        }
    }
}

impl fmt::Display for TraceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TraceFormat::Text => "text",
            TraceFormat::Hdf5 => "hdf5",
            TraceFormat::Zip => "zip",
        })
    }
}

impl std::str::FromStr for TraceFormat {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "txt" => Ok(TraceFormat::Text),
            "hdf5" | "h5" => Ok(TraceFormat::Hdf5),
            "zip" => Ok(TraceFormat::Zip),
            other => Err(TraceError::Format(format!("unknown trace format '{other}'"))),
        }
    }
}

/// A typed description value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetaValue {
    /// Text.
    Str(String),
    /// Integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// Point in time.
    DateTime(DateTime<Utc>),
    /// Nested map.
    Dict(BTreeMap<String, MetaValue>),
}

impl MetaValue {
    /// Type name used in file headers.
    pub fn type_name(&self) -> &'static str {
        match self {
            MetaValue::Str(_) => "str",
            MetaValue::Int(_) => "int",
            MetaValue::Float(_) => "float",
            MetaValue::DateTime(_) => "datetime",
            MetaValue::Dict(_) => "dict",
        }
    }

    /// Text, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric value of ints and floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetaValue::Int(i) => Some(*i as f64),
            MetaValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Nested map, if this is a dict.
    pub fn as_dict(&self) -> Option<&BTreeMap<String, MetaValue>> {
        match self {
            MetaValue::Dict(d) => Some(d),
            _ => None,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::Str(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        MetaValue::Str(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        MetaValue::Int(value)
    }
}

impl From<f64> for MetaValue {
    fn from(value: f64) -> Self {
        MetaValue::Float(value)
    }
}

impl From<DateTime<Utc>> for MetaValue {
    fn from(value: DateTime<Utc>) -> Self {
        MetaValue::DateTime(value)
    }
}

impl From<BTreeMap<String, MetaValue>> for MetaValue {
    fn from(value: BTreeMap<String, MetaValue>) -> Self {
        MetaValue::Dict(value)
    }
}

/// Element type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    /// 64-bit float, holes are NaN.
    Float,
    /// 64-bit integer, holes are [`INT_HOLE`].
    Int,
}

impl ColumnType {
    /// Name used in file headers.
    pub fn name(self) -> &'static str {
        match self {
            ColumnType::Float => "float",
            ColumnType::Int => "int",
        }
    }

    /// Parse a header type name.
    pub fn parse(name: &str) -> Result<Self, TraceError> {
        match name {
            "float" => Ok(ColumnType::Float),
            "int" => Ok(ColumnType::Int),
            other => Err(TraceError::Format(format!("unknown column type '{other}'"))),
        }
    }
}

/// A growable column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Column {
    /// Float values.
    Float(Vec<f64>),
    /// Integer values.
    Int(Vec<i64>),
}

impl Column {
    /// Empty column of `ty`.
    pub fn new(ty: ColumnType) -> Self {
        match ty {
            ColumnType::Float => Column::Float(Vec::new()),
            ColumnType::Int => Column::Int(Vec::new()),
        }
    }

    /// Element type.
    pub fn column_type(&self) -> ColumnType {
        match self {
            Column::Float(_) => ColumnType::Float,
            Column::Int(_) => ColumnType::Int,
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        match self {
            Column::Float(v) => v.len(),
            Column::Int(v) => v.len(),
        }
    }

    /// Whether the column has no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a value; NaN becomes a hole in integer columns.
    pub fn push(&mut self, value: f64) {
        match self {
            Column::Float(v) => v.push(value),
            Column::Int(v) => v.push(to_int(value)),
        }
    }

    /// Overwrite row `index`.
    pub fn set(&mut self, index: usize, value: f64) {
        match self {
            Column::Float(v) => {
                if let Some(slot) = v.get_mut(index) {
                    *slot = value;
                }
            }
            Column::Int(v) => {
                if let Some(slot) = v.get_mut(index) {
                    *slot = to_int(value);
                }
            }
        }
    }

    /// Row `index` as a float (holes and out-of-range rows are NaN).
    pub fn get(&self, index: usize) -> f64 {
        match self {
            Column::Float(v) => v.get(index).copied().unwrap_or(f64::NAN),
            Column::Int(v) => match v.get(index) {
                Some(&INT_HOLE) | None => f64::NAN,
                Some(&i) => i as f64,
            },
        }
    }

    /// Every row as floats.
    pub fn to_f64(&self) -> Vec<f64> {
        (0..self.len()).map(|i| self.get(i)).collect()
    }

    /// Text form of row `index` for the text body.
    pub fn format(&self, index: usize) -> String {
        match self {
            Column::Float(v) => v.get(index).map_or_else(|| "NaN".to_string(), |f| f.to_string()),
            Column::Int(v) => match v.get(index) {
                Some(&INT_HOLE) | None => "NaN".to_string(),
                Some(i) => i.to_string(),
            },
        }
    }

    /// Parse and append one text cell.
    pub fn push_str(&mut self, cell: &str) -> Result<(), TraceError> {
        let cell = cell.trim();
        match self {
            Column::Float(v) => v.push(
                cell.parse::<f64>()
                    .map_err(|_| TraceError::Format(format!("bad float '{cell}'")))?,
            ),
            Column::Int(v) => v.push(if cell.eq_ignore_ascii_case("nan") {
                INT_HOLE
            } else {
                cell.parse::<i64>()
                    .map_err(|_| TraceError::Format(format!("bad int '{cell}'")))?
            }),
        }
        Ok(())
    }

    fn truncate(&mut self, len: usize) {
        match self {
            Column::Float(v) => v.truncate(len),
            Column::Int(v) => v.truncate(len),
        }
    }
}

fn to_int(value: f64) -> i64 {
    if value.is_finite() {
        value.round() as i64
    } else {
        INT_HOLE
    }
}

/// Summary statistics of a column, ignoring holes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColumnStats {
    /// Non-hole values.
    pub count: usize,
    /// Smallest value.
    pub min: f64,
    /// Largest value.
    pub max: f64,
    /// Arithmetic mean.
    pub mean: f64,
}

/// Columns of an evaluator trace, in file order.
pub const EVALUATION_COLUMNS: [(&str, ColumnType); 7] = [
    ("x", ColumnType::Float),
    ("y", ColumnType::Float),
    ("top", ColumnType::Float),
    ("bottom", ColumnType::Float),
    ("raw", ColumnType::Int),
    ("timeTickFirst", ColumnType::Int),
    ("timeTickLast", ColumnType::Int),
];

/// One named trace.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    name: String,
    columns: Vec<(String, Column)>,
    /// Free-form description (comment, plotting hints, fit snapshot, ...).
    pub description: BTreeMap<String, MetaValue>,
    finalized: bool,
}

impl Trace {
    /// Create a trace with the given columns; `x` is added first if missing.
    pub fn new(name: impl Into<String>, spec: &[(&str, ColumnType)]) -> Self {
        let mut columns: Vec<(String, Column)> = Vec::with_capacity(spec.len() + 1);
        if !spec.iter().any(|(n, _)| *n == "x") {
            columns.push(("x".to_string(), Column::new(ColumnType::Float)));
        }
        for (n, ty) in spec {
            if !columns.iter().any(|(existing, _)| existing == n) {
                columns.push((n.to_string(), Column::new(*ty)));
            }
        }
        let mut description = BTreeMap::new();
        description.insert(FILE_CREATION.to_string(), MetaValue::DateTime(Utc::now()));
        Self {
            name: name.into(),
            columns,
            description,
            finalized: false,
        }
    }

    /// Trace with the standard evaluator columns.
    pub fn for_evaluation(name: impl Into<String>) -> Self {
        Self::new(name, &EVALUATION_COLUMNS)
    }

    /// Trace name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.column("x").map_or(0, Column::len)
    }

    /// Whether the trace has no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the columns are frozen.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Column names in order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    /// Column spec (name, type) in order.
    pub fn column_spec(&self) -> Vec<(String, ColumnType)> {
        self.columns
            .iter()
            .map(|(n, c)| (n.clone(), c.column_type()))
            .collect()
    }

    /// Look up a column.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    /// Column values as floats, empty if the column does not exist.
    pub fn values(&self, name: &str) -> Vec<f64> {
        self.column(name).map(Column::to_f64).unwrap_or_default()
    }

    /// Append one row. `row` must contain `x`; columns it does not mention get
    /// a hole.
    pub fn append(&mut self, row: &[(&str, f64)]) -> Result<(), TraceError> {
        self.check_row(row)?;
        for (name, column) in &mut self.columns {
            let value = row
                .iter()
                .find(|(n, _)| n == name)
                .map_or(f64::NAN, |(_, v)| *v);
            column.push(value);
        }
        Ok(())
    }

    /// Overwrite the given columns of row `index` (used while averaging
    /// repeated x values before finalization).
    pub fn update_row(&mut self, index: usize, row: &[(&str, f64)]) -> Result<(), TraceError> {
        if self.finalized {
            return Err(TraceError::Finalized(self.name.clone()));
        }
        for (name, _) in row {
            if self.column(name).is_none() {
                return Err(TraceError::UnknownColumn(name.to_string()));
            }
        }
        for (name, column) in &mut self.columns {
            if let Some((_, v)) = row.iter().find(|(n, _)| n == name) {
                column.set(index, *v);
            }
        }
        Ok(())
    }

    fn check_row(&self, row: &[(&str, f64)]) -> Result<(), TraceError> {
        if self.finalized {
            return Err(TraceError::Finalized(self.name.clone()));
        }
        if !row.iter().any(|(n, _)| *n == "x") {
            return Err(TraceError::MissingX);
        }
        if let Some((n, _)) = row.iter().find(|(n, _)| self.column(n).is_none()) {
            return Err(TraceError::UnknownColumn(n.to_string()));
        }
        Ok(())
    }

    /// Freeze the columns and record the finalization time.
    pub fn finalize(&mut self) {
        if !self.finalized {
            self.finalized = true;
            self.description
                .insert(FILE_FINALIZED.to_string(), MetaValue::DateTime(Utc::now()));
        }
    }

    /// Statistics of a column, ignoring holes.
    pub fn statistics(&self, column: &str) -> Option<ColumnStats> {
        let values: Vec<f64> = self
            .column(column)?
            .to_f64()
            .into_iter()
            .filter(|v| !v.is_nan())
            .collect();
        if values.is_empty() {
            return None;
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        Some(ColumnStats {
            count: values.len(),
            min,
            max,
            mean,
        })
    }

    pub(crate) fn header(&self) -> TraceHeader {
        TraceHeader {
            name: self.name.clone(),
            description: self.description.clone(),
            columns: self.column_spec(),
            rows: self.len(),
            finalized: self.finalized,
        }
    }

    pub(crate) fn from_header(header: &TraceHeader) -> Self {
        Self {
            name: header.name.clone(),
            columns: header
                .columns
                .iter()
                .map(|(n, ty)| (n.clone(), Column::new(*ty)))
                .collect(),
            description: header.description.clone(),
            finalized: header.finalized,
        }
    }

    pub(crate) fn columns_mut(&mut self) -> impl Iterator<Item = (&str, &mut Column)> {
        self.columns.iter_mut().map(|(n, c)| (n.as_str(), c))
    }

    pub(crate) fn columns(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.columns.iter().map(|(n, c)| (n.as_str(), c))
    }

    pub(crate) fn truncate(&mut self, rows: usize) {
        for (_, column) in &mut self.columns {
            column.truncate(rows);
        }
    }
}

/// Encoding of a structured-data entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StructuredFormat {
    /// Python pickle.
    #[default]
    Pkl,
    /// JSON.
    Json,
    /// YAML.
    Yaml,
}

impl StructuredFormat {
    /// Format tag / file extension.
    pub fn tag(self) -> &'static str {
        match self {
            StructuredFormat::Pkl => "pkl",
            StructuredFormat::Json => "json",
            StructuredFormat::Yaml => "yaml",
        }
    }

    /// Parse a format tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "pkl" => Some(StructuredFormat::Pkl),
            "json" => Some(StructuredFormat::Json),
            "yaml" => Some(StructuredFormat::Yaml),
            _ => None,
        }
    }

    /// Serialize `value` in this format.
    pub fn encode(self, name: &str, value: &serde_json::Value) -> Result<Vec<u8>, TraceError> {
        let err = |message: String| TraceError::StructuredData {
            name: name.to_string(),
            message,
        };
        match self {
            StructuredFormat::Pkl => serde_pickle::to_vec(value, serde_pickle::SerOptions::new())
                .map_err(|e| err(e.to_string())),
            StructuredFormat::Json => serde_json::to_vec_pretty(value).map_err(|e| err(e.to_string())),
            StructuredFormat::Yaml => serde_yaml::to_string(value)
                .map(String::into_bytes)
                .map_err(|e| err(e.to_string())),
        }
    }

    /// Parse bytes written by [`encode`](Self::encode).
    pub fn decode(self, name: &str, bytes: &[u8]) -> Result<serde_json::Value, TraceError> {
        let err = |message: String| TraceError::StructuredData {
            name: name.to_string(),
            message,
        };
        match self {
            StructuredFormat::Pkl => serde_pickle::from_slice(bytes, serde_pickle::DeOptions::new())
                .map_err(|e| err(e.to_string())),
            StructuredFormat::Json => serde_json::from_slice(bytes).map_err(|e| err(e.to_string())),
            StructuredFormat::Yaml => serde_yaml::from_slice(bytes).map_err(|e| err(e.to_string())),
        }
    }
}

/// One structured-data entry.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredData {
    /// The data.
    pub value: serde_json::Value,
    /// Encoding used when saved.
    pub format: StructuredFormat,
}

/// The traces of one scan.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceCollection {
    name: String,
    /// Shared description (scan settings, globals, analysis results).
    pub description: BTreeMap<String, MetaValue>,
    traces: Vec<Trace>,
    structured: BTreeMap<String, StructuredData>,
    path: Option<PathBuf>,
    saved: bool,
    finalized: bool,
}

/// Collection shared between the controller and the snapshotter.
pub type SharedCollection = Arc<RwLock<TraceCollection>>;

impl TraceCollection {
    /// Create an empty collection; `name` is the file name stem.
    pub fn new(name: impl Into<String>) -> Self {
        let mut description = BTreeMap::new();
        description.insert(FILE_CREATION.to_string(), MetaValue::DateTime(Utc::now()));
        Self {
            name: name.into(),
            description,
            traces: Vec::new(),
            structured: BTreeMap::new(),
            path: None,
            saved: false,
            finalized: false,
        }
    }

    /// Wrap in a shared handle.
    pub fn into_shared(self) -> SharedCollection {
        Arc::new(RwLock::new(self))
    }

    /// File name stem.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a trace; replaces a trace with the same name.
    pub fn add_trace(&mut self, trace: Trace) {
        match self.traces.iter_mut().find(|t| t.name == trace.name) {
            Some(existing) => *existing = trace,
            None => self.traces.push(trace),
        }
    }

    /// All traces in insertion order.
    pub fn traces(&self) -> &[Trace] {
        &self.traces
    }

    pub(crate) fn traces_mut(&mut self) -> &mut [Trace] {
        &mut self.traces
    }

    /// Look up a trace.
    pub fn trace(&self, name: &str) -> Option<&Trace> {
        self.traces.iter().find(|t| t.name == name)
    }

    /// Look up a trace for modification.
    pub fn trace_mut(&mut self, name: &str) -> Result<&mut Trace, TraceError> {
        self.traces
            .iter_mut()
            .find(|t| t.name == name)
            .ok_or_else(|| TraceError::UnknownTrace(name.to_string()))
    }

    /// Store a structured-data entry.
    pub fn set_structured(
        &mut self,
        name: impl Into<String>,
        value: serde_json::Value,
        format: StructuredFormat,
    ) {
        self.structured
            .insert(name.into(), StructuredData { value, format });
    }

    /// Mutable access to a structured-data entry, creating it with `init`.
    pub fn structured_entry(
        &mut self,
        name: &str,
        format: StructuredFormat,
        init: impl FnOnce() -> serde_json::Value,
    ) -> &mut serde_json::Value {
        &mut self
            .structured
            .entry(name.to_string())
            .or_insert_with(|| StructuredData {
                value: init(),
                format,
            })
            .value
    }

    /// Structured data by name.
    pub fn structured(&self, name: &str) -> Option<&StructuredData> {
        self.structured.get(name)
    }

    /// All structured data.
    pub fn structured_data(&self) -> &BTreeMap<String, StructuredData> {
        &self.structured
    }

    /// Destination file, once assigned.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Assign the destination file.
    pub fn set_path(&mut self, path: impl Into<PathBuf>) {
        self.path = Some(path.into());
    }

    /// Whether the collection is meant to be (and has been) written to disk.
    pub fn is_saved(&self) -> bool {
        self.saved
    }

    /// Whether all traces are frozen.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Finalize every trace at once and record why.
    pub fn finalize(&mut self, reason: &str) {
        if self.finalized {
            return;
        }
        for trace in &mut self.traces {
            trace.finalize();
        }
        self.finalized = true;
        self.description
            .insert(FILE_FINALIZED.to_string(), MetaValue::DateTime(Utc::now()));
        self.description
            .insert("finalizeReason".to_string(), MetaValue::from(reason));
        debug!(collection = %self.name, reason, "traces finalized");
    }

    /// Header written in front of the data.
    pub fn header(&self) -> FileHeader {
        FileHeader {
            variables: self.description.clone(),
            traces: self.traces.iter().map(Trace::header).collect(),
        }
    }

    /// Rebuild an empty collection from a header.
    pub fn from_header(name: impl Into<String>, header: &FileHeader) -> Self {
        Self {
            name: name.into(),
            description: header.variables.clone(),
            traces: header.traces.iter().map(Trace::from_header).collect(),
            structured: BTreeMap::new(),
            path: None,
            saved: true,
            finalized: header.traces.iter().all(|t| t.finalized) && !header.traces.is_empty(),
        }
    }

    /// Write to `path` atomically in `format`.
    pub fn save(&self, path: &Path, format: TraceFormat) -> Result<(), TraceError> {
        match format {
            TraceFormat::Text => naming::atomic_write(path, |file| text::write(self, file)),
            TraceFormat::Zip => naming::atomic_write(path, |file| zip::write(self, file)),
            TraceFormat::Hdf5 => hdf5::save(self, path),
        }
    }

    /// Write to the assigned destination, allocating the next free
    /// `name_NNN.ext` in `dir` on first use. Marks the collection saved.
    pub fn commit(&mut self, dir: &Path, format: TraceFormat) -> Result<PathBuf, TraceError> {
        let path = self.ensure_path(dir, format)?;
        let format = TraceFormat::from_path(&path).unwrap_or(format);
        self.save(&path, format)?;
        self.saved = true;
        info!(path = %path.display(), traces = self.traces.len(), "trace collection committed");
        Ok(path)
    }

    /// Destination file, allocating the next free `<name>_NNN.<ext>` in `dir`
    /// on first use.
    pub(crate) fn ensure_path(&mut self, dir: &Path, format: TraceFormat) -> Result<PathBuf, TraceError> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }
        let base = format!("{}.{}", self.name, format.extension());
        let path = naming::next_sequenced_path(dir, &base)?;
        self.path = Some(path.clone());
        Ok(path)
    }

    pub(crate) fn set_saved(&mut self, saved: bool) {
        self.saved = saved;
    }

    /// Load a collection; the format is taken from the file extension.
    pub fn load(path: &Path) -> Result<Self, TraceError> {
        let format = TraceFormat::from_path(path)
            .ok_or_else(|| TraceError::Format(format!("unknown extension: {}", path.display())))?;
        let mut collection = match format {
            TraceFormat::Text => text::read(path)?,
            TraceFormat::Zip => zip::read(path)?,
            TraceFormat::Hdf5 => hdf5::load(path)?,
        };
        collection.path = Some(path.to_path_buf());
        Ok(collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_fills_missing_columns_with_holes() {
        let mut trace = Trace::for_evaluation("counts");
        trace.append(&[("x", 1.0), ("y", 0.5)]).unwrap();
        trace.append(&[("x", 2.0), ("y", 0.7), ("raw", 12.0)]).unwrap();
        for name in trace.column_names() {
            assert_eq!(trace.column(name).unwrap().len(), 2, "column {name}");
        }
        assert!(trace.column("top").unwrap().get(0).is_nan());
        assert!(trace.column("raw").unwrap().get(0).is_nan());
        assert_eq!(trace.column("raw").unwrap().get(1), 12.0);
    }

    #[test]
    fn append_requires_x_and_known_columns() {
        let mut trace = Trace::for_evaluation("counts");
        assert!(matches!(trace.append(&[("y", 1.0)]), Err(TraceError::MissingX)));
        assert!(matches!(
            trace.append(&[("x", 1.0), ("bogus", 1.0)]),
            Err(TraceError::UnknownColumn(_))
        ));
        assert!(trace.is_empty());
    }

    #[test]
    fn finalized_trace_is_immutable() {
        let mut trace = Trace::for_evaluation("counts");
        trace.append(&[("x", 0.0)]).unwrap();
        trace.finalize();
        assert!(matches!(
            trace.append(&[("x", 1.0)]),
            Err(TraceError::Finalized(_))
        ));
        assert!(trace.update_row(0, &[("y", 1.0)]).is_err());
        assert!(trace.description.contains_key(FILE_FINALIZED));
    }

    #[test]
    fn collection_finalizes_all_traces() {
        let mut collection = TraceCollection::new("scan");
        collection.add_trace(Trace::for_evaluation("a"));
        collection.add_trace(Trace::for_evaluation("b"));
        collection.finalize("end of scan");
        assert!(collection.traces().iter().all(Trace::is_finalized));
        assert_eq!(
            collection.description["finalizeReason"],
            MetaValue::from("end of scan")
        );
    }

    #[test]
    fn statistics_ignore_holes() {
        let mut trace = Trace::for_evaluation("counts");
        for (x, y) in [(0.0, 1.0), (1.0, f64::NAN), (2.0, 3.0)] {
            trace.append(&[("x", x), ("y", y)]).unwrap();
        }
        let stats = trace.statistics("y").unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 3.0);
        assert_eq!(stats.mean, 2.0);
    }

    #[test]
    fn structured_data_encodings_round_trip() {
        let value = serde_json::json!({"sequence": [1, 2, 3], "label": "gst", "p": 0.25});
        for format in [StructuredFormat::Pkl, StructuredFormat::Json, StructuredFormat::Yaml] {
            let bytes = format.encode("gst", &value).unwrap();
            assert_eq!(format.decode("gst", &bytes).unwrap(), value, "{format:?}");
        }
    }

    #[test]
    fn int_columns_round_and_mark_holes() {
        let mut column = Column::new(ColumnType::Int);
        column.push(2.6);
        column.push(f64::NAN);
        assert_eq!(column, Column::Int(vec![3, INT_HOLE]));
        assert_eq!(column.format(1), "NaN");
    }
}
