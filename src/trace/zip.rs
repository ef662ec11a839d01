//! ZIP trace containers.
//!
//! | entry | contents |
//! |-------|----------|
//! | `header.xml` | pretty-printed XML header |
//! | `header.pkl` | pickled header, preferred on read |
//! | `data.txt` | tab separated body |
//! | `structuredData/<name>.<fmt>` | structured data entries |
//! | `structuredDataFormat.json` | entry name to format tag |

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Write};
use std::path::Path;

use ::zip::write::SimpleFileOptions;
use ::zip::{CompressionMethod, ZipArchive, ZipWriter};
use tracing::debug;

use super::header::FileHeader;
use super::{text, StructuredFormat, TraceCollection};
use crate::error::TraceError;

const HEADER_XML: &str = "header.xml";
const HEADER_PKL: &str = "header.pkl";
const DATA: &str = "data.txt";
const STRUCTURED_DIR: &str = "structuredData";
const STRUCTURED_FORMATS: &str = "structuredDataFormat.json";

/// Write a ZIP container.
pub fn write(collection: &TraceCollection, file: &mut File) -> Result<(), TraceError> {
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let header = collection.header();

    zip.start_file(HEADER_XML, options)?;
    zip.write_all(header.to_xml()?.as_bytes())?;

    let pickled = serde_pickle::to_vec(&header, serde_pickle::SerOptions::new()).map_err(|e| {
        TraceError::StructuredData {
            name: HEADER_PKL.into(),
            message: e.to_string(),
        }
    })?;
    zip.start_file(HEADER_PKL, options)?;
    zip.write_all(&pickled)?;

    zip.start_file(DATA, options)?;
    text::write_body(collection, &mut zip)?;

    let mut formats = BTreeMap::new();
    for (name, data) in collection.structured_data() {
        let bytes = data.format.encode(name, &data.value)?;
        zip.start_file(
            format!("{STRUCTURED_DIR}/{name}.{}", data.format.tag()),
            options,
        )?;
        zip.write_all(&bytes)?;
        formats.insert(name.clone(), data.format.tag());
    }
    let formats = serde_json::to_vec_pretty(&formats).map_err(|e| TraceError::StructuredData {
        name: STRUCTURED_FORMATS.into(),
        message: e.to_string(),
    })?;
    zip.start_file(STRUCTURED_FORMATS, options)?;
    zip.write_all(&formats)?;

    zip.finish()?;
    Ok(())
}

fn read_entry<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Option<Vec<u8>>, TraceError> {
    match archive.by_name(name) {
        Ok(mut entry) => {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            Ok(Some(bytes))
        }
        Err(::zip::result::ZipError::FileNotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn read_header<R: Read + std::io::Seek>(archive: &mut ZipArchive<R>) -> Result<FileHeader, TraceError> {
    if let Some(bytes) = read_entry(archive, HEADER_PKL)? {
        match serde_pickle::from_slice(&bytes, serde_pickle::DeOptions::new()) {
            Ok(header) => return Ok(header),
            Err(e) => debug!(error = %e, "pickled header unreadable, falling back to XML"),
        }
    }
    let xml = read_entry(archive, HEADER_XML)?
        .ok_or_else(|| TraceError::Format("zip container has no header".into()))?;
    let xml = String::from_utf8(xml).map_err(|e| TraceError::Xml(e.to_string()))?;
    FileHeader::from_xml(&xml)
}

/// Read a ZIP container.
pub fn read(path: &Path) -> Result<TraceCollection, TraceError> {
    let mut archive = ZipArchive::new(BufReader::new(File::open(path)?))?;
    let header = read_header(&mut archive)?;
    let mut collection = TraceCollection::from_header(text::stem(path), &header);

    let data = read_entry(&mut archive, DATA)?.unwrap_or_default();
    text::read_body(&mut collection, &header, Cursor::new(data))?;

    if let Some(bytes) = read_entry(&mut archive, STRUCTURED_FORMATS)? {
        let formats: BTreeMap<String, String> =
            serde_json::from_slice(&bytes).map_err(|e| TraceError::StructuredData {
                name: STRUCTURED_FORMATS.into(),
                message: e.to_string(),
            })?;
        for (name, tag) in formats {
            let format = StructuredFormat::from_tag(&tag).ok_or_else(|| TraceError::StructuredData {
                name: name.clone(),
                message: format!("unknown format tag '{tag}'"),
            })?;
            let entry = format!("{STRUCTURED_DIR}/{name}.{tag}");
            let bytes = read_entry(&mut archive, &entry)?.ok_or_else(|| {
                TraceError::StructuredData {
                    name: name.clone(),
                    message: format!("missing entry {entry}"),
                }
            })?;
            let value = format.decode(&name, &bytes)?;
            collection.set_structured(name, value, format);
        }
    }
    Ok(collection)
}
