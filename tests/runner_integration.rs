//! Scans run through the control loop against the simulated sequencer.

mod common;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ion_daq::evaluation::{Algorithm, EvaluationDefinition};
use ion_daq::error::PulserError;
use ion_daq::interlock::{InterlockGate, LockState};
use ion_daq::pulser::command::{HostCommand, Reply};
use ion_daq::pulser::link::{PulserLink, StreamLink, StreamSource};
use ion_daq::pulser::simulator::{CountModel, SimPipe, SimulatedSequencer, SimulatorOptions};
use ion_daq::pulser::Pulser;
use ion_daq::scan::{
    EventKind, ParameterRegistry, ScanController, ScanDescriptor, ScanEvent, ScanHandle,
    ScanRunner, ScanState, SimulatedParameter, READ_PIPE_OVERRUN,
};
use ion_daq::trace::TraceCollection;
use tempfile::TempDir;

/// Counts equal to the raw value of the point word.
fn echo_model() -> CountModel {
    Box::new(|ctx| BTreeMap::from([(0u8, vec![ctx.value as u32])]))
}

fn counts() -> Vec<EvaluationDefinition> {
    vec![EvaluationDefinition::new("counts", 0, Algorithm::MeanCount)]
}

fn spawn(
    dir: &TempDir,
    point_duration: Duration,
    parameters: ParameterRegistry,
    gate: Option<&InterlockGate>,
) -> (SimulatedSequencer, ScanHandle, tokio::task::JoinHandle<ScanController>) {
    let simulator = SimulatedSequencer::with_model(
        SimulatorOptions {
            point_duration,
            ..Default::default()
        },
        echo_model(),
    );
    let config = common::config(dir);
    let (pulser, queue) = simulator.connect(&config.pulser).unwrap();
    let controller = ScanController::new(Arc::new(pulser), common::program(), config)
        .unwrap()
        .with_queue(queue)
        .with_parameters(parameters);
    let (handle, task) = ScanRunner::spawn(controller, gate.map(InterlockGate::subscribe));
    (simulator, handle, task)
}

async fn wait_finalized(
    events: &mut ion_daq::scan::EventSubscription,
) -> (Option<PathBuf>, String) {
    let event = tokio::time::timeout(Duration::from_secs(10), events.next())
        .await
        .expect("scan did not finish in time");
    match event {
        Some(ScanEvent::Finalized { path, reason }) => (path, reason),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn internal_scan_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let (simulator, handle, task) = spawn(&dir, Duration::ZERO, ParameterRegistry::new(), None);
    let mut events = handle.subscribe_to(&[EventKind::Finalized]);
    let scan = ScanDescriptor::linear("e2e", "t", 0.0, 19.0, 20);
    handle.start(scan, counts(), BTreeMap::new()).await.unwrap();

    let (path, reason) = wait_finalized(&mut events).await;
    assert_eq!(reason, "end of scan");
    let collection = TraceCollection::load(&path.unwrap()).unwrap();
    let expected: Vec<f64> = (0..20).map(f64::from).collect();
    assert_eq!(collection.trace("counts").unwrap().values("y"), expected);
    assert_eq!(simulator.points_run(), 20);
    assert_eq!(handle.state(), ScanState::Idle);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn external_scan_waits_for_settling_and_restores() {
    let dir = tempfile::tempdir().unwrap();
    let dac = Arc::new(SimulatedParameter::new("dac", 0.25, Duration::from_millis(150)));
    let mut parameters = ParameterRegistry::new();
    parameters.register(dac.clone());
    let (_simulator, handle, task) = spawn(&dir, Duration::ZERO, parameters, None);
    let mut events = handle.subscribe_to(&[EventKind::Finalized]);

    let scan = ScanDescriptor::linear("external", "dac", 1.0, 3.0, 3).external();
    let started = Instant::now();
    handle.start(scan, counts(), BTreeMap::new()).await.unwrap();
    let (path, _) = wait_finalized(&mut events).await;

    assert!(started.elapsed() >= Duration::from_millis(450));
    assert_eq!(dac.visits(), vec![1.0, 2.0, 3.0, 0.25]);
    let collection = TraceCollection::load(&path.unwrap()).unwrap();
    assert_eq!(collection.trace("counts").unwrap().values("x"), vec![1.0, 2.0, 3.0]);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stash_and_resume_match_uninterrupted_run() {
    let dir = tempfile::tempdir().unwrap();
    let scan = ScanDescriptor::linear("stashed", "t", 0.0, 29.0, 30);

    let (_sim, handle, task) = spawn(&dir, Duration::ZERO, ParameterRegistry::new(), None);
    let mut done = handle.subscribe_to(&[EventKind::Finalized]);
    handle.start(scan.clone(), counts(), BTreeMap::new()).await.unwrap();
    let (reference, _) = wait_finalized(&mut done).await;
    handle.shutdown().await.unwrap();
    task.await.unwrap();
    let reference = TraceCollection::load(&reference.unwrap()).unwrap();

    let (_sim, handle, task) =
        spawn(&dir, Duration::from_millis(5), ParameterRegistry::new(), None);
    let mut progress = handle.subscribe_to(&[EventKind::Progress]);
    let mut stash_events = handle.subscribe_to(&[EventKind::StashChanged]);
    let mut done = handle.subscribe_to(&[EventKind::Finalized]);
    handle.start(scan, counts(), BTreeMap::new()).await.unwrap();
    while let Some(ScanEvent::Progress { current, .. }) = progress.next().await {
        if current >= 10 {
            break;
        }
    }
    handle.stash().await.unwrap();
    let keys = match stash_events.next().await {
        Some(ScanEvent::StashChanged(keys)) => keys,
        other => panic!("unexpected event {other:?}"),
    };
    assert_eq!(keys.len(), 1);
    assert!(keys[0].current_index >= 10);
    handle.wait_for(ScanState::Idle).await.unwrap();

    handle.resume(0).await.unwrap();
    let (path, reason) = wait_finalized(&mut done).await;
    assert_eq!(reason, "end of scan");
    let resumed = TraceCollection::load(&path.unwrap()).unwrap();
    assert_eq!(
        resumed.trace("counts").unwrap().values("y"),
        reference.trace("counts").unwrap().values("y")
    );
    assert_eq!(
        resumed.trace("counts").unwrap().values("x"),
        reference.trace("counts").unwrap().values("x")
    );

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abort_is_idle_within_500ms() {
    let dir = tempfile::tempdir().unwrap();
    let (_sim, handle, task) =
        spawn(&dir, Duration::from_millis(10), ParameterRegistry::new(), None);
    let mut done = handle.subscribe_to(&[EventKind::Finalized]);
    let scan = ScanDescriptor::linear("long", "t", 0.0, 999.0, 1000);
    handle.start(scan, counts(), BTreeMap::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    handle.abort().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(handle.state(), ScanState::Idle);
    let (path, reason) = wait_finalized(&mut done).await;
    assert!(path.is_none());
    assert_eq!(reason, "aborted");

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interlock_suspends_and_releases_the_scan() {
    let dir = tempfile::tempdir().unwrap();
    let gate = InterlockGate::new();
    gate.set("cavity", LockState::Locked);
    let (_sim, handle, task) = spawn(
        &dir,
        Duration::from_millis(5),
        ParameterRegistry::new(),
        Some(&gate),
    );
    let mut interrupted = handle.subscribe_to(&[EventKind::Interrupted]);
    let mut done = handle.subscribe_to(&[EventKind::Finalized]);
    let scan = ScanDescriptor::linear("locked", "t", 0.0, 39.0, 40);
    handle.start(scan, counts(), BTreeMap::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    gate.set("cavity", LockState::Unlocked);
    assert_eq!(
        interrupted.next().await,
        Some(ScanEvent::Interrupted {
            reason: "interlock".into()
        })
    );
    assert_eq!(handle.state(), ScanState::Interrupted);
    gate.set("cavity", LockState::Locked);

    let (path, reason) = wait_finalized(&mut done).await;
    assert_eq!(reason, "end of scan");
    let collection = TraceCollection::load(&path.unwrap()).unwrap();
    let expected: Vec<f64> = (0..40).map(f64::from).collect();
    assert_eq!(collection.trace("counts").unwrap().values("y"), expected);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn error_exit_from_sequencer_interrupts() {
    let dir = tempfile::tempdir().unwrap();
    let (simulator, handle, task) =
        spawn(&dir, Duration::ZERO, ParameterRegistry::new(), None);
    simulator.inject_error_exit(4, 7);
    let mut interrupted = handle.subscribe_to(&[EventKind::Interrupted]);
    let scan = ScanDescriptor::linear("faulty", "t", 0.0, 9.0, 10);
    handle.start(scan, counts(), BTreeMap::new()).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), interrupted.next())
        .await
        .unwrap();
    assert_eq!(
        event,
        Some(ScanEvent::Interrupted {
            reason: "exit code 0x7".into()
        })
    );
    let stopped = handle.stop("user").await.unwrap();
    let collection = TraceCollection::load(&stopped.unwrap()).unwrap();
    assert_eq!(collection.trace("counts").unwrap().len(), 5);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Command port whose update-word writes are refused.
struct RejectingWrites(StreamLink<SimPipe>);

impl PulserLink for RejectingWrites {
    fn transact(&mut self, command: &HostCommand) -> Result<Reply, PulserError> {
        match command {
            HostCommand::WriteData(_) => Err(PulserError::WriteFailed("FIFO write refused".into())),
            other => self.0.transact(other),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_update_words_fail_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let simulator = SimulatedSequencer::with_model(SimulatorOptions::default(), echo_model());
    let config = common::config(&dir);
    let (pulser, queue) = Pulser::spawn(
        Box::new(RejectingWrites(StreamLink::new(simulator.command_port()))),
        Box::new(StreamSource::new(simulator.data_port())),
        &config.pulser,
    )
    .unwrap();
    let controller = ScanController::new(Arc::new(pulser), common::program(), config)
        .unwrap()
        .with_queue(queue);
    let (handle, task) = ScanRunner::spawn(controller, None);
    let mut interrupted = handle.subscribe_to(&[EventKind::Interrupted]);
    let mut done = handle.subscribe_to(&[EventKind::Finalized]);

    let scan = ScanDescriptor::linear("starved", "t", 0.0, 4.0, 5);
    handle.start(scan, counts(), BTreeMap::new()).await.unwrap();

    let (path, reason) = wait_finalized(&mut done).await;
    assert!(path.is_none());
    assert!(reason.starts_with("transport: write failed"), "{reason}");
    let event = tokio::time::timeout(Duration::from_secs(5), interrupted.next())
        .await
        .unwrap();
    assert_eq!(event, Some(ScanEvent::Interrupted { reason }));
    assert_eq!(handle.state(), ScanState::Interrupted);
    assert_eq!(simulator.points_run(), 0);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_consumer_overruns_the_read_pipe() {
    let dir = tempfile::tempdir().unwrap();
    let simulator = SimulatedSequencer::with_model(
        SimulatorOptions {
            point_duration: Duration::from_millis(20),
            ..Default::default()
        },
        echo_model(),
    );
    let mut config = common::config(&dir);
    config.pulser.queue_depth = 2;
    let (pulser, queue) = simulator.connect(&config.pulser).unwrap();
    let mut controller = ScanController::new(Arc::new(pulser), common::program(), config)
        .unwrap()
        .with_queue(queue);
    let scan = ScanDescriptor::linear("stalled", "t", 0.0, 99.0, 100);
    controller.start(scan, counts(), BTreeMap::new()).await.unwrap();

    for _ in 0..3 {
        let item = tokio::time::timeout(Duration::from_secs(5), controller.next_packet())
            .await
            .expect("packet in time")
            .expect("queue open");
        controller.handle_packet(item).await;
    }
    assert_eq!(controller.state(), ScanState::Running);

    // The sequencer keeps producing while nobody reads.
    tokio::time::sleep(Duration::from_millis(300)).await;
    while controller.state() == ScanState::Running {
        let item = tokio::time::timeout(Duration::from_secs(5), controller.next_packet())
            .await
            .expect("packet in time")
            .expect("queue open");
        controller.handle_packet(item).await;
    }

    assert_eq!(controller.state(), ScanState::Interrupted);
    assert_eq!(controller.interrupt_reason(), Some(READ_PIPE_OVERRUN));
    assert!(!simulator.is_running());
    let active = controller.active().unwrap();
    assert_eq!(active.index(), 3);
    let collection = active.collection().read();
    assert!(collection.is_saved());
    let saved = TraceCollection::load(collection.path().unwrap()).unwrap();
    assert_eq!(saved.trace("counts").unwrap().values("y"), vec![0.0, 1.0, 2.0]);
}
