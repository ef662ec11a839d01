//! Fuzz target for the text trace reader.
//!
//! Tests:
//! - Arbitrary file contents are rejected with an error, never a panic
//! - Whatever loads can be saved and loaded again with the same traces

#![no_main]

use libfuzzer_sys::fuzz_target;
use ion_daq::trace::{TraceCollection, TraceFormat};
use tempfile::TempDir;

fuzz_target!(|data: &[u8]| {
    let temp_dir = match TempDir::new() {
        Ok(d) => d,
        Err(_) => return,
    };
    let path = temp_dir.path().join("fuzz_001.txt");
    if std::fs::write(&path, data).is_err() {
        return;
    }
    let Ok(collection) = TraceCollection::load(&path) else {
        return;
    };

    let again = temp_dir.path().join("fuzz_002.txt");
    collection
        .save(&again, TraceFormat::Text)
        .expect("loaded collection saves");
    let reloaded = TraceCollection::load(&again).expect("saved collection loads");
    assert_eq!(reloaded.traces().len(), collection.traces().len());
    for (a, b) in collection.traces().iter().zip(reloaded.traces()) {
        assert_eq!(a.name(), b.name());
        assert_eq!(a.len(), b.len());
    }
});
