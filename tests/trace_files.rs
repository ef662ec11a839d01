//! Trace files written by finished scans.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{final_packet, packet};
use ion_daq::evaluation::{Algorithm, EvaluationDefinition};
use ion_daq::persistence::ConfigStore;
use ion_daq::scan::{ScanController, ScanDescriptor};
use ion_daq::trace::{StructuredFormat, TraceCollection, TraceFormat};
use serde_json::json;

fn counts() -> Vec<EvaluationDefinition> {
    vec![EvaluationDefinition::new("counts", 0, Algorithm::MeanCount)]
}

#[tokio::test]
async fn zip_keeps_raw_data_under_its_format_tag() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::config(&dir);
    config.storage.format = TraceFormat::Zip;
    let pulser = Arc::new(ion_daq::pulser::mock::MockPulser::new());
    let mut controller = ScanController::new(pulser, common::program(), config).unwrap();

    let mut scan = ScanDescriptor::list("raw", "t", vec![1.0, 2.0]);
    scan.save_raw_data = true;
    controller.start(scan, counts(), BTreeMap::new()).await.unwrap();
    controller.handle_packet(packet(&[(0, 3), (0, 5)])).await;
    controller.handle_packet(packet(&[(0, 7)])).await;
    controller.handle_packet(final_packet(0)).await;

    let path = controller
        .last_collection()
        .unwrap()
        .read()
        .path()
        .unwrap()
        .to_path_buf();
    assert_eq!(path.file_name().unwrap(), "raw_001.zip");
    let loaded = TraceCollection::load(&path).unwrap();
    let raw = loaded.structured("rawData").unwrap();
    assert_eq!(raw.format, StructuredFormat::Json);
    assert_eq!(
        raw.value,
        json!({"counts": [
            {"index": 0, "x": 1.0, "shots": [3, 5]},
            {"index": 1, "x": 2.0, "shots": [7]},
        ]})
    );
    assert_eq!(loaded.trace("counts").unwrap().values("y"), vec![4.0, 7.0]);
}

#[tokio::test]
async fn runs_get_sequenced_names_and_write_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::config(&dir);
    let store = Arc::new(ConfigStore::open(&config.storage.config_store).unwrap());
    store.set("lastProgram", json!("integration"));
    let pulser = Arc::new(ion_daq::pulser::mock::MockPulser::new());
    let mut controller = ScanController::new(pulser, common::program(), config)
        .unwrap()
        .with_store(store.clone());

    let mut names = Vec::new();
    for run in 0..2u32 {
        let scan = ScanDescriptor::list("seq", "t", vec![0.0]);
        controller.start(scan, counts(), BTreeMap::new()).await.unwrap();
        controller.handle_packet(packet(&[(0, run)])).await;
        controller.handle_packet(final_packet(0)).await;
        let collection = controller.last_collection().unwrap().read();
        names.push(collection.path().unwrap().file_name().unwrap().to_owned());
    }
    assert_eq!(names, ["seq_001.txt", "seq_002.txt"]);

    let reopened = ConfigStore::open(dir.path().join("store.json")).unwrap();
    assert_eq!(reopened.get("lastProgram"), Some(json!("integration")));
}

#[tokio::test]
async fn text_file_carries_description_and_columns() {
    let dir = tempfile::tempdir().unwrap();
    let (_, mut controller) = common::mock_controller(&dir);
    let mut scan = ScanDescriptor::linear("described", "t", 0.0, 2.0, 3);
    scan.x_unit = "us".into();
    controller.start(scan, counts(), BTreeMap::new()).await.unwrap();
    for count in [2, 4, 6] {
        controller.handle_packet(packet(&[(0, count)])).await;
    }
    controller.handle_packet(final_packet(0)).await;

    let path = controller
        .last_collection()
        .unwrap()
        .read()
        .path()
        .unwrap()
        .to_path_buf();
    let loaded = TraceCollection::load(&path).unwrap();
    let trace = loaded.trace("counts").unwrap();
    let columns: Vec<&str> = trace.column_names().collect();
    for column in ["x", "y", "top", "bottom", "raw", "timeTickFirst", "timeTickLast"] {
        assert!(columns.contains(&column), "missing column {column}");
    }
    assert_eq!(trace.values("raw"), vec![2.0, 4.0, 6.0]);
    let stats = trace.statistics("y").unwrap();
    assert_eq!(stats.count, 3);
    assert_eq!(stats.mean, 4.0);
    assert!(loaded.description.contains_key("fileCreation"));
    assert_eq!(loaded.description.get("xUnit").and_then(|v| v.as_str()), Some("us"));
    assert_eq!(
        loaded.description.get("finalizeReason").and_then(|v| v.as_str()),
        Some("end of scan")
    );
}
