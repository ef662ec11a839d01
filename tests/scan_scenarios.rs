//! End-to-end scan scenarios driven packet by packet over the mock transport.

mod common;

use std::collections::BTreeMap;

use common::{final_packet, mock_controller, packet};
use ion_daq::evaluation::{Algorithm, EvaluationDefinition};
use ion_daq::pulser::mock::PulserCall;
use ion_daq::pulser::{DataPacket, INTERRUPT_EXIT_CODE};
use ion_daq::scan::{ScanDescriptor, ScanState, END_OF_SCAN, READ_PIPE_OVERRUN};
use ion_daq::trace::TraceCollection;

fn ratio_and_rate() -> Vec<EvaluationDefinition> {
    vec![
        EvaluationDefinition::new("ratio", 0, Algorithm::Ratio { reference: 1 }),
        EvaluationDefinition::new("rate", 1, Algorithm::MeanCount),
    ]
}

fn counts() -> Vec<EvaluationDefinition> {
    vec![EvaluationDefinition::new("counts", 0, Algorithm::MeanCount)]
}

#[tokio::test]
async fn linear_scan_with_two_evaluators() {
    let dir = tempfile::tempdir().unwrap();
    let (_, mut controller) = mock_controller(&dir);
    let scan = ScanDescriptor::linear("two_evals", "t", 0.0, 9.0, 10);
    controller
        .start(scan, ratio_and_rate(), BTreeMap::new())
        .await
        .unwrap();

    for i in 0..10u32 {
        controller.handle_packet(packet(&[(0, i * 10), (1, 100)])).await;
    }
    controller.handle_packet(final_packet(0)).await;
    assert_eq!(controller.state(), ScanState::Idle);

    let collection = controller.last_collection().unwrap().read();
    let x: Vec<f64> = (0..10).map(f64::from).collect();
    let ratio = collection.trace("ratio").unwrap();
    assert_eq!(ratio.values("x"), x);
    let y = ratio.values("y");
    for (i, value) in y.iter().enumerate() {
        assert!((value - i as f64 / 10.0).abs() < 1e-12, "row {i}: {value}");
    }
    assert_eq!(collection.trace("rate").unwrap().values("y"), vec![100.0; 10]);
    assert!(collection.is_saved());

    // What was committed is what is in memory.
    let path = collection.path().unwrap().to_path_buf();
    drop(collection);
    let loaded = TraceCollection::load(&path).unwrap();
    assert_eq!(loaded.trace("rate").unwrap().values("y"), vec![100.0; 10]);
    assert_eq!(
        loaded.description.get("fileFinalized").map(|v| v.type_name()),
        Some("datetime")
    );
}

#[tokio::test]
async fn stash_at_packet_42_and_resume() {
    let dir = tempfile::tempdir().unwrap();
    let (pulser, mut controller) = mock_controller(&dir);
    let scan = ScanDescriptor::linear("long", "t", 0.0, 99.0, 100);
    controller.start(scan, counts(), BTreeMap::new()).await.unwrap();

    for i in 0..42u32 {
        controller.handle_packet(packet(&[(0, i)])).await;
    }
    controller.stash().await.unwrap();
    assert_eq!(pulser.count(|c| matches!(c, PulserCall::Interrupt)), 1);
    // The point in flight completes with the interrupt exit.
    let mut last = DataPacket::final_with_exit(INTERRUPT_EXIT_CODE);
    last.counts.insert(0, vec![42]);
    controller.handle_packet(Ok(last)).await;

    assert_eq!(controller.state(), ScanState::Idle);
    let keys = controller.stash_keys();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].current_index, 43);
    assert_eq!(keys[0].total_points, Some(100));
    assert!(controller.last_collection().is_none());
    let written: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "txt"))
        .collect();
    assert!(written.is_empty(), "nothing is written before the stash is resumed");

    let before: Vec<f64> = controller
        .stashed()
        .get(0)
        .unwrap()
        .collection()
        .read()
        .trace("counts")
        .unwrap()
        .values("y");
    assert_eq!(before.len(), 43);

    controller.resume(0).await.unwrap();
    assert_eq!(controller.state(), ScanState::Running);
    assert!(controller.stash_keys().is_empty());
    for i in 43..100u32 {
        controller.handle_packet(packet(&[(0, i)])).await;
    }
    controller.handle_packet(final_packet(0)).await;
    assert_eq!(controller.state(), ScanState::Idle);

    let collection = controller.last_collection().unwrap().read();
    let y = collection.trace("counts").unwrap().values("y");
    assert_eq!(y.len(), 100);
    assert_eq!(&y[..43], &before[..]);
    let expected: Vec<f64> = (0..100).map(f64::from).collect();
    assert_eq!(y, expected);
    assert_eq!(collection.trace("counts").unwrap().values("x"), expected);
}

#[tokio::test]
async fn overrun_interrupts_and_keeps_partial_trace() {
    let dir = tempfile::tempdir().unwrap();
    let (_, mut controller) = mock_controller(&dir);
    let scan = ScanDescriptor::linear("overrun", "t", 0.0, 9.0, 10);
    controller.start(scan, counts(), BTreeMap::new()).await.unwrap();
    for count in [5, 6, 7] {
        controller.handle_packet(packet(&[(0, count)])).await;
    }
    let mut marked = DataPacket::default();
    marked.counts.insert(0, vec![8]);
    marked.overrun = true;
    controller.handle_packet(Ok(marked)).await;

    assert_eq!(controller.state(), ScanState::Interrupted);
    assert_eq!(controller.interrupt_reason(), Some(READ_PIPE_OVERRUN));
    let active = controller.active().unwrap();
    assert_eq!(active.index(), 3);
    let collection = active.collection().read();
    assert!(collection.is_saved());
    let saved = TraceCollection::load(collection.path().unwrap()).unwrap();
    assert_eq!(saved.trace("counts").unwrap().values("y"), vec![5.0, 6.0, 7.0]);
}

#[tokio::test]
async fn zero_repeats_finalize_without_starting() {
    let dir = tempfile::tempdir().unwrap();
    let (pulser, mut controller) = mock_controller(&dir);
    let scan = ScanDescriptor::linear("nothing", "t", 0.0, 9.0, 10).with_repeats(0);
    controller.start(scan, counts(), BTreeMap::new()).await.unwrap();
    assert_eq!(pulser.count(|c| matches!(c, PulserCall::Start)), 0);
    assert_eq!(controller.state(), ScanState::Idle);
    let collection = controller.last_collection().unwrap().read();
    assert_eq!(collection.trace("counts").unwrap().len(), 0);
    assert!(collection.is_finalized());
}

#[tokio::test]
async fn single_point_scan() {
    let dir = tempfile::tempdir().unwrap();
    let (pulser, mut controller) = mock_controller(&dir);
    let scan = ScanDescriptor::list("one", "t", vec![3.0]);
    controller.start(scan, counts(), BTreeMap::new()).await.unwrap();
    // One point word and the end word.
    assert_eq!(pulser.data_words().len(), 2);
    let mut last = DataPacket::final_with_exit(0);
    last.counts.insert(0, vec![11]);
    controller.handle_packet(Ok(last)).await;
    assert_eq!(controller.state(), ScanState::Idle);
    let collection = controller.last_collection().unwrap().read();
    let trace = collection.trace("counts").unwrap();
    assert_eq!(trace.values("x"), vec![3.0]);
    assert_eq!(trace.values("y"), vec![11.0]);
}

#[tokio::test]
async fn pause_and_continue_keep_the_index() {
    let dir = tempfile::tempdir().unwrap();
    let (pulser, mut controller) = mock_controller(&dir);
    let scan = ScanDescriptor::linear("paused", "t", 0.0, 9.0, 10);
    controller.start(scan, counts(), BTreeMap::new()).await.unwrap();
    for count in 0..4 {
        controller.handle_packet(packet(&[(0, count)])).await;
    }
    controller.pause().await.unwrap();
    assert_eq!(controller.state(), ScanState::Paused);
    // Packets arriving while paused are not evaluated.
    controller.handle_packet(packet(&[(0, 99)])).await;
    assert_eq!(controller.active().unwrap().index(), 4);

    pulser.clear();
    controller.continue_scan().await.unwrap();
    assert_eq!(controller.state(), ScanState::Running);
    assert_eq!(controller.active().unwrap().index(), 4);
    let (address, value) =
        ion_daq::pulser::program::split_update_word(pulser.data_words()[0]);
    assert_eq!((address, value), (4, 4));

    for count in 4..10 {
        controller.handle_packet(packet(&[(0, count)])).await;
    }
    controller.handle_packet(final_packet(0)).await;
    let collection = controller.last_collection().unwrap().read();
    let expected: Vec<f64> = (0..10).map(f64::from).collect();
    assert_eq!(collection.trace("counts").unwrap().values("y"), expected);
}

#[tokio::test]
async fn abort_reaches_idle_quickly_without_saving() {
    let dir = tempfile::tempdir().unwrap();
    let (_, mut controller) = mock_controller(&dir);
    let scan = ScanDescriptor::linear("aborted", "t", 0.0, 9.0, 10);
    controller.start(scan, counts(), BTreeMap::new()).await.unwrap();
    controller.handle_packet(packet(&[(0, 1)])).await;

    let started = std::time::Instant::now();
    controller.abort().await.unwrap();
    assert!(started.elapsed() < std::time::Duration::from_millis(500));
    assert_eq!(controller.state(), ScanState::Idle);
    let collection = controller.last_collection().unwrap().read();
    assert!(!collection.is_saved());
    assert!(collection.is_finalized());
}

#[tokio::test]
async fn repeats_run_the_sequence_again() {
    let dir = tempfile::tempdir().unwrap();
    let (_, mut controller) = mock_controller(&dir);
    let scan = ScanDescriptor::list("twice", "t", vec![1.0, 2.0]).with_repeats(2);
    controller.start(scan, counts(), BTreeMap::new()).await.unwrap();
    for count in [10, 20, 11, 21] {
        controller.handle_packet(packet(&[(0, count)])).await;
    }
    controller.handle_packet(final_packet(0)).await;
    assert_eq!(controller.state(), ScanState::Idle);
    let collection = controller.last_collection().unwrap().read();
    let trace = collection.trace("counts").unwrap();
    assert_eq!(trace.values("x"), vec![1.0, 2.0, 1.0, 2.0]);
    assert_eq!(trace.values("y"), vec![10.0, 20.0, 11.0, 21.0]);
    assert_eq!(
        collection.description.get("finalizeReason").and_then(|v| v.as_str()),
        Some(END_OF_SCAN)
    );
}
