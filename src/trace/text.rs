//! Text trace files: `# `-prefixed XML header followed by a tab separated body.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use super::header::FileHeader;
use super::{Column, Trace, TraceCollection};
use crate::error::TraceError;

/// Prefix of header lines.
pub const HEADER_PREFIX: &str = "# ";

/// Write the body (no header) of `collection`.
pub fn write_body<W: Write>(collection: &TraceCollection, out: &mut W) -> Result<(), TraceError> {
    let rows = collection.traces().iter().map(Trace::len).max().unwrap_or(0);
    let columns: Vec<&Column> = collection
        .traces()
        .iter()
        .flat_map(|t| t.columns().map(|(_, c)| c))
        .collect();
    let mut line = String::new();
    for row in 0..rows {
        line.clear();
        for (i, column) in columns.iter().enumerate() {
            if i > 0 {
                line.push('\t');
            }
            line.push_str(&column.format(row));
        }
        line.push('\n');
        out.write_all(line.as_bytes())?;
    }
    Ok(())
}

/// Write a complete text file.
pub fn write(collection: &TraceCollection, file: &mut File) -> Result<(), TraceError> {
    let xml = collection.header().to_xml()?;
    let mut out = BufWriter::new(file);
    for line in xml.lines() {
        writeln!(out, "{HEADER_PREFIX}{line}")?;
    }
    write_body(collection, &mut out)?;
    out.flush()?;
    Ok(())
}

/// Fill the traces of `collection` from body lines.
pub fn read_body<R: BufRead>(
    collection: &mut TraceCollection,
    header: &FileHeader,
    lines: R,
) -> Result<(), TraceError> {
    let width = header.column_spec().len();
    let mut row = 0usize;
    for line in lines.lines() {
        let line = line?;
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let cells: Vec<&str> = line.split('\t').collect();
        if cells.len() != width {
            return Err(TraceError::Format(format!(
                "row {row} has {} cells, expected {width}",
                cells.len()
            )));
        }
        let mut cells = cells.into_iter();
        for trace in collection.traces_mut() {
            for (_, column) in trace.columns_mut() {
                if let Some(cell) = cells.next() {
                    column.push_str(cell)?;
                }
            }
        }
        row += 1;
    }
    for (trace, th) in collection.traces_mut().iter_mut().zip(&header.traces) {
        trace.truncate(th.rows);
    }
    Ok(())
}

/// Read a text trace file.
pub fn read(path: &Path) -> Result<TraceCollection, TraceError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut xml = String::new();
    let mut body_start = None;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        match line.strip_prefix('#') {
            Some(rest) => {
                xml.push_str(rest.strip_prefix(' ').unwrap_or(rest));
                if !xml.ends_with('\n') {
                    xml.push('\n');
                }
            }
            None => {
                body_start = Some(line.clone());
                break;
            }
        }
    }
    let header = FileHeader::from_xml(&xml)?;
    let mut collection = TraceCollection::from_header(stem(path), &header);
    let first = body_start.unwrap_or_default();
    read_body(&mut collection, &header, first.as_bytes().chain(reader))?;
    Ok(collection)
}

/// File name stem without the `_NNN` sequence suffix.
pub(crate) fn stem(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("trace");
    match stem.rsplit_once('_') {
        Some((base, digits)) if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => {
            base.to_string()
        }
        _ => stem.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{ColumnType, MetaValue, TraceFormat, FILE_CREATION};

    fn collection() -> TraceCollection {
        let mut collection = TraceCollection::new("rabi");
        collection
            .description
            .insert("scanParameter".into(), MetaValue::from("duration"));
        let mut a = Trace::for_evaluation("counts");
        let mut b = Trace::new("ratio", &[("x", ColumnType::Float), ("y", ColumnType::Float)]);
        for i in 0..5 {
            let x = i as f64 * 0.1;
            a.append(&[("x", x), ("y", x / 3.0), ("raw", (i * 7) as f64)]).unwrap();
            if i < 3 {
                b.append(&[("x", x), ("y", f64::NAN)]).unwrap();
            }
        }
        collection.add_trace(a);
        collection.add_trace(b);
        collection.finalize("end of scan");
        collection
    }

    #[test]
    fn text_round_trip_preserves_columns_and_description() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rabi_001.txt");
        let original = collection();
        original.save(&path, TraceFormat::Text).unwrap();

        let loaded = TraceCollection::load(&path).unwrap();
        assert_eq!(loaded.name(), "rabi");
        assert_eq!(loaded.traces().len(), 2);
        for (a, b) in original.traces().iter().zip(loaded.traces()) {
            assert_eq!(a.len(), b.len());
            for name in a.column_names() {
                let (ca, cb) = (a.column(name).unwrap(), b.column(name).unwrap());
                assert_eq!(ca.column_type(), cb.column_type());
                for (va, vb) in ca.to_f64().iter().zip(cb.to_f64()) {
                    assert!(va.to_bits() == vb.to_bits() || (va.is_nan() && vb.is_nan()));
                }
            }
            assert_eq!(a.description, b.description);
        }
        let mut expected = original.description.clone();
        let mut actual = loaded.description.clone();
        expected.remove(FILE_CREATION);
        actual.remove(FILE_CREATION);
        assert_eq!(expected, actual);
    }

    #[test]
    fn header_lines_are_prefixed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rabi.txt");
        collection().save(&path, TraceFormat::Text).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# <DataFileHeader>"));
        let body: Vec<&str> = text.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(body.len(), 5);
        assert!(body[4].ends_with("NaN\tNaN"));
    }

    #[test]
    fn stem_strips_sequence_suffix() {
        assert_eq!(stem(Path::new("/d/rabi_scan_012.txt")), "rabi_scan");
        assert_eq!(stem(Path::new("plain.txt")), "plain");
    }
}
