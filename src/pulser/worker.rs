//! Transport I/O workers.
//!
//! Two blocking threads sit between the async control loop and the links:
//!
//! - The **writer** owns the command port. Commands have priority over buffered
//!   update words; update words are only written while the hardware FIFO holds
//!   fewer than the configured depth (1020 words).
//! - The **reader** owns the data port. It frames the stream and enqueues packets
//!   on a bounded queue. If the queue is full the packet is dropped and the next
//!   delivered packet carries `overrun = true`.
//!
//! Failures of either port that no command reply can carry (a rejected update
//! word write, a dead data port) go to an unbounded fault channel. The
//! [`PacketQueue`] delivers them ahead of any queued packet.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{select, unbounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use super::command::{parse_level, HostCommand};
use super::framing::{Demultiplexer, FramingStats};
use super::link::{DataSource, PulserLink};
use super::packet::DataPacket;
use crate::error::PulserError;

/// Reply channel of one command.
pub type ReplySender = oneshot::Sender<Result<Bytes, PulserError>>;

/// Work items for the writer thread.
#[derive(Debug)]
pub enum WriterJob {
    /// A command that is answered through `reply`.
    Command {
        /// The command.
        command: HostCommand,
        /// Where the reply goes.
        reply: ReplySender,
    },
    /// Update words for the running program.
    Data {
        /// Words to write.
        words: Vec<u64>,
        /// Write-FIFO generation the words belong to.
        generation: u64,
    },
    /// Leave the worker loop.
    Shutdown,
}

impl WriterJob {
    /// Build a command job and the receiver for its reply.
    pub fn command(command: HostCommand) -> (Self, oneshot::Receiver<Result<Bytes, PulserError>>) {
        let (reply, rx) = oneshot::channel();
        (Self::Command { command, reply }, rx)
    }
}

/// Handle to the writer thread.
pub struct WriterHandle {
    control: Sender<WriterJob>,
    data: Sender<WriterJob>,
    generation: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl WriterHandle {
    /// Spawn the writer thread around `link`. Update-word write failures are
    /// reported on `faults`.
    pub fn spawn(
        link: Box<dyn PulserLink>,
        fifo_depth: usize,
        faults: mpsc::UnboundedSender<PulserError>,
    ) -> Result<Self, PulserError> {
        let (control, control_rx) = unbounded();
        let (data, data_rx) = unbounded();
        let generation = Arc::new(AtomicU64::new(0));
        let worker = WriterWorker {
            link,
            fifo_depth,
            control: control_rx,
            data: data_rx,
            generation: generation.clone(),
            faults,
        };
        let thread = thread::Builder::new()
            .name("pulser-writer".into())
            .spawn(move || worker.run())
            .map_err(|e| PulserError::DeviceMissing(format!("cannot spawn writer: {e}")))?;
        Ok(Self {
            control,
            data,
            generation,
            thread: Some(thread),
        })
    }

    /// Queue a command.
    pub fn command(&self, command: HostCommand) -> Result<oneshot::Receiver<Result<Bytes, PulserError>>, PulserError> {
        let (job, rx) = WriterJob::command(command);
        self.control
            .send(job)
            .map_err(|_| PulserError::WorkerStopped)?;
        Ok(rx)
    }

    /// Queue update words without waiting.
    pub fn data(&self, words: Vec<u64>) -> Result<(), PulserError> {
        let generation = self.generation.load(Ordering::Acquire);
        self.data
            .send(WriterJob::Data { words, generation })
            .map_err(|_| PulserError::WorkerStopped)
    }

    /// Invalidate every queued data job.
    pub fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

impl Drop for WriterHandle {
    fn drop(&mut self) {
        let _ = self.control.send(WriterJob::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct WriterWorker {
    link: Box<dyn PulserLink>,
    fifo_depth: usize,
    control: Receiver<WriterJob>,
    data: Receiver<WriterJob>,
    generation: Arc<AtomicU64>,
    faults: mpsc::UnboundedSender<PulserError>,
}

enum Flow {
    Continue,
    Shutdown,
}

impl WriterWorker {
    fn run(mut self) {
        debug!("writer worker started");
        loop {
            // Commands first.
            let job = match self.control.try_recv() {
                Ok(job) => Some(job),
                Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => select! {
                    recv(self.control) -> job => Some(job.unwrap_or(WriterJob::Shutdown)),
                    recv(self.data) -> job => job.ok(),
                },
            };
            let Some(job) = job else { continue };
            if let Flow::Shutdown = self.handle(job) {
                break;
            }
        }
        debug!("writer worker stopped");
    }

    fn handle(&mut self, job: WriterJob) -> Flow {
        match job {
            WriterJob::Command { command, reply } => {
                let result = self
                    .link
                    .transact(&command)
                    .and_then(|r| r.into_result(&command));
                if let Err(e) = &result {
                    warn!(command = command.name(), error = %e, "command failed");
                }
                let _ = reply.send(result);
                Flow::Continue
            }
            WriterJob::Data { words, generation } => self.write_words(words, generation),
            WriterJob::Shutdown => Flow::Shutdown,
        }
    }

    fn stale(&self, generation: u64) -> bool {
        generation != self.generation.load(Ordering::Acquire)
    }

    /// Write `words` in FIFO-sized chunks, servicing commands while the FIFO is
    /// full.
    fn write_words(&mut self, words: Vec<u64>, generation: u64) -> Flow {
        let mut rest = words.as_slice();
        while !rest.is_empty() {
            if self.stale(generation) {
                trace!(dropped = rest.len(), "discarding stale update words");
                return Flow::Continue;
            }
            let level = match self
                .link
                .transact(&HostCommand::QueryFifoLevel)
                .and_then(|r| r.into_result(&HostCommand::QueryFifoLevel))
                .and_then(|payload| parse_level(&payload))
            {
                Ok(level) => level as usize,
                Err(e) => {
                    error!(error = %e, "FIFO level query failed, dropping update words");
                    self.report(e);
                    return Flow::Continue;
                }
            };
            let room = self.fifo_depth.saturating_sub(level);
            if room == 0 {
                while let Ok(job) = self.control.try_recv() {
                    if let Flow::Shutdown = self.handle(job) {
                        return Flow::Shutdown;
                    }
                }
                thread::sleep(Duration::from_millis(1));
                continue;
            }
            let (chunk, tail) = rest.split_at(room.min(rest.len()));
            let command = HostCommand::WriteData(chunk.to_vec());
            if let Err(e) = self
                .link
                .transact(&command)
                .and_then(|r| r.into_result(&command))
            {
                error!(error = %e, "writing update words failed");
                self.report(e);
                return Flow::Continue;
            }
            rest = tail;
        }
        Flow::Continue
    }

    fn report(&self, e: PulserError) {
        if self.faults.send(e).is_err() {
            debug!("fault channel closed");
        }
    }
}

/// State shared between the reader thread and its consumers.
#[derive(Debug, Default)]
pub struct ReaderShared {
    overrun: AtomicBool,
    reset: AtomicBool,
    stop: AtomicBool,
    stats: Mutex<FramingStats>,
}

impl ReaderShared {
    /// CRC counters of the reader's demultiplexer.
    pub fn stats(&self) -> FramingStats {
        *self.stats.lock()
    }

    /// Ask the reader to drop its partially framed data.
    pub fn request_reset(&self) {
        self.reset.store(true, Ordering::Release);
    }
}

/// Item delivered by the reader.
pub type ReaderItem = Result<DataPacket, PulserError>;

/// Consumer side of the reader queue.
pub struct PacketQueue {
    rx: mpsc::Receiver<ReaderItem>,
    faults: mpsc::UnboundedReceiver<PulserError>,
    shared: Arc<ReaderShared>,
}

impl PacketQueue {
    /// Wait for the next packet or transport fault. `None` once the reader is
    /// gone and no fault is pending.
    pub async fn recv(&mut self) -> Option<ReaderItem> {
        let item = tokio::select! {
            biased;
            Some(e) = self.faults.recv() => return Some(Err(e)),
            item = self.rx.recv() => item,
        };
        match item {
            Some(item) => Some(self.mark(item)),
            None => self.faults.try_recv().ok().map(Err),
        }
    }

    /// Next fault or packet if one is queued.
    pub fn try_recv(&mut self) -> Option<ReaderItem> {
        if let Ok(e) = self.faults.try_recv() {
            return Some(Err(e));
        }
        self.rx.try_recv().ok().map(|item| self.mark(item))
    }

    /// Discard everything queued; returns the number of dropped items.
    pub fn drain(&mut self) -> usize {
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        self.shared.overrun.store(false, Ordering::Release);
        dropped
    }

    /// Shared reader state.
    pub fn shared(&self) -> &Arc<ReaderShared> {
        &self.shared
    }

    fn mark(&self, item: ReaderItem) -> ReaderItem {
        item.map(|mut packet| {
            if self.shared.overrun.swap(false, Ordering::AcqRel) {
                packet.overrun = true;
            }
            packet
        })
    }
}

/// Handle to the reader thread.
pub struct ReaderHandle {
    shared: Arc<ReaderShared>,
    faults: mpsc::UnboundedSender<PulserError>,
    thread: Option<JoinHandle<()>>,
}

impl ReaderHandle {
    /// Spawn the reader thread around `source` with a queue of `depth` packets.
    pub fn spawn(
        source: Box<dyn DataSource>,
        depth: usize,
    ) -> Result<(Self, PacketQueue), PulserError> {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let (faults, faults_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ReaderShared::default());
        let worker_shared = shared.clone();
        let worker_faults = faults.clone();
        let thread = thread::Builder::new()
            .name("pulser-reader".into())
            .spawn(move || read_loop(source, tx, worker_faults, worker_shared))
            .map_err(|e| PulserError::DeviceMissing(format!("cannot spawn reader: {e}")))?;
        Ok((
            Self {
                shared: shared.clone(),
                faults,
                thread: Some(thread),
            },
            PacketQueue {
                rx,
                faults: faults_rx,
                shared,
            },
        ))
    }

    /// Shared reader state.
    pub fn shared(&self) -> &Arc<ReaderShared> {
        &self.shared
    }

    /// Sender for faults that must reach the packet consumer.
    pub fn fault_sender(&self) -> mpsc::UnboundedSender<PulserError> {
        self.faults.clone()
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn read_loop(
    mut source: Box<dyn DataSource>,
    tx: mpsc::Sender<ReaderItem>,
    faults: mpsc::UnboundedSender<PulserError>,
    shared: Arc<ReaderShared>,
) {
    debug!("reader worker started");
    let mut demux = Demultiplexer::new();
    let mut buf = vec![0u8; 16 * 1024];
    let mut packets = Vec::new();
    while !shared.stop.load(Ordering::Acquire) {
        if shared.reset.swap(false, Ordering::AcqRel) {
            demux.reset();
        }
        let n = match source.read_data(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, "data port failed");
                if faults.send(e).is_err() {
                    debug!("fault channel closed");
                }
                break;
            }
        };
        if n == 0 {
            continue;
        }
        demux.push(&buf[..n], &mut packets);
        *shared.stats.lock() = demux.stats();
        for packet in packets.drain(..) {
            match tx.try_send(Ok(packet)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    if !shared.overrun.swap(true, Ordering::AcqRel) {
                        warn!("read pipe overrun, dropping packets");
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("packet queue closed");
                    return;
                }
            }
        }
    }
    debug!("reader worker stopped");
}
