//! HDF5 trace files (feature `storage_hdf5`).
//!
//! Layout:
//! - `/variables`: one attribute per scalar description entry, one subgroup per
//!   dict entry (plotting hints end up under `/variables/TracePlottingList`)
//! - `/columns/<trace>.<column>`: one dataset per column, `f64` or `i64`
//! - `/header_pkl`: pickled header used to rebuild traces on load

use std::path::Path;

use super::TraceCollection;
use crate::error::TraceError;

/// Save `collection` to `path` atomically.
#[cfg(feature = "storage_hdf5")]
pub fn save(collection: &TraceCollection, path: &Path) -> Result<(), TraceError> {
    use hdf5::types::VarLenUnicode;
    use hdf5::{File, Group};

    use super::{Column, MetaValue};
    use chrono::SecondsFormat;
    use std::collections::BTreeMap;

    fn h5(e: hdf5::Error) -> TraceError {
        TraceError::Hdf5(e.to_string())
    }

    fn unicode(text: &str) -> Result<VarLenUnicode, TraceError> {
        text.parse::<VarLenUnicode>()
            .map_err(|e| TraceError::Hdf5(e.to_string()))
    }

    fn write_variables(group: &Group, vars: &BTreeMap<String, MetaValue>) -> Result<(), TraceError> {
        for (name, value) in vars {
            match value {
                MetaValue::Str(s) => {
                    let text = unicode(s)?;
                    group
                        .new_attr::<VarLenUnicode>()
                        .create(name.as_str())
                        .and_then(|a| a.write_scalar(&text))
                        .map_err(h5)?
                }
                MetaValue::Int(i) => group
                    .new_attr::<i64>()
                    .create(name.as_str())
                    .and_then(|a| a.write_scalar(i))
                    .map_err(h5)?,
                MetaValue::Float(f) => group
                    .new_attr::<f64>()
                    .create(name.as_str())
                    .and_then(|a| a.write_scalar(f))
                    .map_err(h5)?,
                MetaValue::DateTime(t) => {
                    let text = unicode(&t.to_rfc3339_opts(SecondsFormat::AutoSi, true))?;
                    group
                        .new_attr::<VarLenUnicode>()
                        .create(name.as_str())
                        .and_then(|a| a.write_scalar(&text))
                        .map_err(h5)?
                }
                MetaValue::Dict(inner) => {
                    let sub = group.create_group(name).map_err(h5)?;
                    write_variables(&sub, inner)?;
                }
            }
        }
        Ok(())
    }

    super::naming::atomic_write_path(path, |temp| {
        let file = File::create(temp).map_err(h5)?;
        let variables = file.create_group("variables").map_err(h5)?;
        write_variables(&variables, &collection.description)?;

        let columns = file.create_group("columns").map_err(h5)?;
        for trace in collection.traces() {
            for (name, column) in trace.columns() {
                let dataset = format!("{}.{}", trace.name(), name);
                match column {
                    Column::Float(values) => columns
                        .new_dataset_builder()
                        .with_data(values.as_slice())
                        .create(dataset.as_str())
                        .map_err(h5)?,
                    Column::Int(values) => columns
                        .new_dataset_builder()
                        .with_data(values.as_slice())
                        .create(dataset.as_str())
                        .map_err(h5)?,
                };
            }
        }

        let header = serde_pickle::to_vec(&collection.header(), serde_pickle::SerOptions::new())
            .map_err(|e| TraceError::Hdf5(e.to_string()))?;
        file.new_dataset_builder()
            .with_data(header.as_slice())
            .create("header_pkl")
            .map_err(h5)?;
        file.close().map_err(h5)?;
        Ok(())
    })
}

/// Load an HDF5 trace file.
#[cfg(feature = "storage_hdf5")]
pub fn load(path: &Path) -> Result<TraceCollection, TraceError> {
    use super::header::FileHeader;
    use super::{Column, ColumnType};

    let h5 = |e: hdf5::Error| TraceError::Hdf5(e.to_string());
    let file = hdf5::File::open(path).map_err(h5)?;
    let bytes = file
        .dataset("header_pkl")
        .and_then(|d| d.read_raw::<u8>())
        .map_err(h5)?;
    let header: FileHeader = serde_pickle::from_slice(&bytes, serde_pickle::DeOptions::new())
        .map_err(|e| TraceError::Hdf5(e.to_string()))?;

    let mut collection = TraceCollection::from_header(super::text::stem(path), &header);
    let columns = file.group("columns").map_err(h5)?;
    for trace in collection.traces_mut() {
        let trace_name = trace.name().to_string();
        for (name, column) in trace.columns_mut() {
            let dataset = columns
                .dataset(&format!("{trace_name}.{name}"))
                .map_err(h5)?;
            *column = match column.column_type() {
                ColumnType::Float => Column::Float(dataset.read_raw::<f64>().map_err(h5)?),
                ColumnType::Int => Column::Int(dataset.read_raw::<i64>().map_err(h5)?),
            };
        }
    }
    Ok(collection)
}

/// Save `collection` to `path` atomically.
#[cfg(not(feature = "storage_hdf5"))]
pub fn save(_collection: &TraceCollection, _path: &Path) -> Result<(), TraceError> {
    Err(TraceError::Hdf5(
        "built without the storage_hdf5 feature".into(),
    ))
}

/// Load an HDF5 trace file.
#[cfg(not(feature = "storage_hdf5"))]
pub fn load(_path: &Path) -> Result<TraceCollection, TraceError> {
    Err(TraceError::Hdf5(
        "built without the storage_hdf5 feature".into(),
    ))
}
