//! Software sequencer.
//!
//! [`SimulatedSequencer`] speaks the same byte protocol as the hardware on both
//! ports, so the complete transport (links, workers, framing) runs against it.
//! Points are produced lazily as the data port is read: every point consumes one
//! update word from the write FIFO, just like the real program does, and the
//! program stalls while the FIFO is empty.
//!
//! Behaviour per update word:
//!
//! - end of scan → final record with exit code 0
//! - no-op → one point without a scan echo
//! - parameter-list step → the word's value is a RAM address; the RAM word there
//!   is echoed and the point runs
//! - anything else → the value is written to RAM at the word's address, echoed,
//!   and the point runs
//!
//! Counts come from a pluggable [`CountModel`]. Faults can be injected: error
//! exits, timing violations, RAM read-back faults, an unresponsive command port
//! and single-bit corruption of the return stream.

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use tracing::{debug, trace, warn};

use super::command::{HostCommand, Reply};
use super::framing::RecordEncoder;
use super::link::{StreamLink, StreamSource};
use super::packet::INTERRUPT_EXIT_CODE;
use super::program::{split_update_word, END_OF_SCAN_ADDRESS, NOOP_ADDRESS, PARAM_STEP_ADDRESS};
use super::worker::PacketQueue;
use super::Pulser;
use crate::config::PulserConfig;
use crate::error::PulserError;

/// Capacity of the simulated write FIFO in words.
pub const SIM_FIFO_CAPACITY: usize = 1020;

/// What the count model learns about a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointContext {
    /// Points run since the last start.
    pub index: u64,
    /// Points run since the simulator was created.
    pub total_index: u64,
    /// Update address of the point (`NOOP_ADDRESS` for no-op points).
    pub address: u32,
    /// Update value (or the RAM word for parameter-list steps).
    pub value: u64,
}

/// Produces the counts of one point: bucket → shots.
pub type CountModel = Box<dyn FnMut(&PointContext) -> BTreeMap<u8, Vec<u32>> + Send>;

/// Simulator timing and defaults.
#[derive(Debug, Clone)]
pub struct SimulatorOptions {
    /// Wall time per point.
    pub point_duration: Duration,
    /// How long a data port read waits before reporting a timeout.
    pub read_timeout: Duration,
    /// Extra ticks per point on top of the integration time.
    pub overhead_ticks: u64,
    /// Shots per point for the default count model.
    pub shots: usize,
    /// Mean count of the default model.
    pub mean_count: u32,
}

impl Default for SimulatorOptions {
    fn default() -> Self {
        Self {
            point_duration: Duration::ZERO,
            read_timeout: Duration::from_millis(20),
            overhead_ticks: 1_000,
            shots: 1,
            mean_count: 10,
        }
    }
}

#[derive(Default)]
struct Faults {
    error_exit: Option<(u64, u64)>,
    timing_violations: BTreeMap<u64, Vec<u32>>,
    ram_fault: Option<u32>,
    unresponsive: bool,
    corrupt_next_point: bool,
}

struct Device {
    options: SimulatorOptions,
    binary: Option<Vec<u8>>,
    ram: Vec<u64>,
    fifo: VecDeque<u64>,
    out: BytesMut,
    running: bool,
    interrupt: bool,
    counter_mask: u16,
    adc_mask: u8,
    integration_ticks: u32,
    tick: u64,
    run_index: u64,
    total_index: u64,
    starts: u64,
    fifo_overflows: u64,
    next_point_at: Instant,
    faults: Faults,
    model: CountModel,
}

impl Device {
    fn handle(&mut self, command: &HostCommand) -> Option<Reply> {
        if self.faults.unresponsive {
            return None;
        }
        trace!(command = command.name(), "simulator command");
        let reply = match command {
            HostCommand::Upload(binary) => {
                if binary.is_empty() {
                    Reply::rejected("empty binary")
                } else {
                    self.binary = Some(binary.clone());
                    Reply::ok()
                }
            }
            HostCommand::WriteRam { offset, words } => {
                let start = *offset as usize;
                if self.ram.len() < start + words.len() {
                    self.ram.resize(start + words.len(), 0);
                }
                self.ram[start..start + words.len()].copy_from_slice(words);
                Reply::ok()
            }
            HostCommand::ReadRam { offset, count } => {
                let words: Vec<u64> = (*offset..offset + count)
                    .map(|address| {
                        let word = self.ram.get(address as usize).copied().unwrap_or(0);
                        if self.faults.ram_fault == Some(address) {
                            word ^ 1
                        } else {
                            word
                        }
                    })
                    .collect();
                Reply::words(&words)
            }
            HostCommand::WriteData(words) => {
                if self.fifo.len() + words.len() > SIM_FIFO_CAPACITY {
                    self.fifo_overflows += 1;
                    warn!(
                        level = self.fifo.len(),
                        incoming = words.len(),
                        "simulated write FIFO overflow"
                    );
                    Reply::failed("write FIFO overflow")
                } else {
                    self.fifo.extend(words.iter().copied());
                    Reply::ok()
                }
            }
            HostCommand::Start => {
                if self.binary.is_none() {
                    Reply::rejected("no program loaded")
                } else {
                    self.running = true;
                    self.interrupt = false;
                    self.run_index = 0;
                    self.starts += 1;
                    self.next_point_at = Instant::now();
                    debug!(fifo = self.fifo.len(), "simulated program started");
                    Reply::ok()
                }
            }
            HostCommand::Stop => {
                self.running = false;
                self.interrupt = false;
                Reply::ok()
            }
            HostCommand::Interrupt => {
                if self.running {
                    self.interrupt = true;
                }
                Reply::ok()
            }
            HostCommand::FlushData => {
                self.out.clear();
                Reply::ok()
            }
            HostCommand::ClearWriteFifo => {
                self.fifo.clear();
                Reply::ok()
            }
            HostCommand::SetIntegrationTime(ticks) => {
                self.integration_ticks = *ticks;
                Reply::ok()
            }
            HostCommand::SetCounterMask(mask) => {
                self.counter_mask = *mask;
                Reply::ok()
            }
            HostCommand::SetAdcMask(mask) => {
                self.adc_mask = *mask;
                Reply::ok()
            }
            HostCommand::QueryFifoLevel => Reply::level(self.fifo.len() as u32),
        };
        Some(reply)
    }

    /// Run the program until it produces output or has to wait.
    ///
    /// Returns `true` if new bytes were appended to the output buffer.
    fn step(&mut self) -> bool {
        if !self.running || Instant::now() < self.next_point_at {
            return false;
        }
        let Some(word) = self.fifo.pop_front() else {
            if self.interrupt {
                self.finish(INTERRUPT_EXIT_CODE, &mut RecordEncoder::new());
                return true;
            }
            return false;
        };
        let (address, value) = split_update_word(word);
        let mut enc = RecordEncoder::new();
        match address {
            END_OF_SCAN_ADDRESS => {
                self.finish(0, &mut enc);
                return true;
            }
            NOOP_ADDRESS => self.point(NOOP_ADDRESS, value, None, &mut enc),
            PARAM_STEP_ADDRESS => {
                let entry = self.ram.get(value as usize).copied().unwrap_or(0);
                self.point(PARAM_STEP_ADDRESS, entry, Some(entry), &mut enc);
            }
            _ => {
                let slot = address as usize;
                if self.ram.len() <= slot {
                    self.ram.resize(slot + 1, 0);
                }
                self.ram[slot] = value;
                self.point(address, value, Some(value), &mut enc);
            }
        }
        self.next_point_at = Instant::now() + self.options.point_duration;
        true
    }

    fn point(&mut self, address: u32, value: u64, echo: Option<u64>, enc: &mut RecordEncoder) {
        let ctx = PointContext {
            index: self.run_index,
            total_index: self.total_index,
            address,
            value,
        };
        enc.wall_clock(self.tick);
        if let Some(echo) = echo {
            enc.scan_echo(address, echo);
        }
        for (bucket, shots) in (self.model)(&ctx) {
            if bucket < 16 && self.counter_mask & (1 << bucket) != 0 {
                for count in shots {
                    enc.counter(bucket, count);
                }
            }
        }
        for channel in 0..4u8 {
            if self.adc_mask & (1 << channel) != 0 {
                enc.adc(channel, 1_000 + ctx.index as u32);
            }
        }
        if let Some(addresses) = self.faults.timing_violations.remove(&ctx.total_index) {
            for address in addresses {
                enc.timing_violation(address);
            }
        }
        self.tick += u64::from(self.integration_ticks) + self.options.overhead_ticks;
        self.run_index += 1;
        self.total_index += 1;

        let error_exit = match self.faults.error_exit {
            Some((at, code)) if at == ctx.total_index => {
                self.faults.error_exit = None;
                Some(code)
            }
            _ => None,
        };
        if let Some(code) = error_exit {
            self.finish(code, enc);
        } else if self.interrupt {
            self.finish(INTERRUPT_EXIT_CODE, enc);
        } else {
            enc.wall_clock(self.tick).point_end();
            self.emit(enc);
        }
    }

    fn finish(&mut self, exit_code: u64, enc: &mut RecordEncoder) {
        let start = self.tick;
        self.tick += 10;
        enc.final_record(exit_code, start, self.tick);
        self.running = false;
        self.interrupt = false;
        debug!(
            exit_code = %format!("{exit_code:#x}"),
            points = self.run_index,
            "simulated program finished"
        );
        self.emit(enc);
    }

    fn emit(&mut self, enc: &mut RecordEncoder) {
        let mut bytes = enc.take();
        if std::mem::take(&mut self.faults.corrupt_next_point) {
            // Lowest bit of the record after the opening wall-clock tick.
            if bytes.len() >= 10 {
                bytes[8] ^= 0x01;
            }
        }
        self.out.extend_from_slice(&bytes);
    }
}

struct Shared {
    device: Mutex<Device>,
    changed: Condvar,
}

/// A software pulse sequencer.
#[derive(Clone)]
pub struct SimulatedSequencer {
    shared: Arc<Shared>,
}

impl SimulatedSequencer {
    /// Create a simulator with the default random count model.
    pub fn new(options: SimulatorOptions) -> Self {
        let shots = options.shots;
        let mean = options.mean_count;
        let model: CountModel = Box::new(move |_ctx| {
            let mut rng = rand::thread_rng();
            let low = mean / 2;
            let high = mean + mean / 2 + 1;
            let counts = (0..shots).map(|_| rng.gen_range(low..high)).collect();
            BTreeMap::from([(0u8, counts)])
        });
        Self::with_model(options, model)
    }

    /// Create a simulator with a custom count model.
    pub fn with_model(options: SimulatorOptions, model: CountModel) -> Self {
        let device = Device {
            options,
            binary: None,
            ram: Vec::new(),
            fifo: VecDeque::new(),
            out: BytesMut::new(),
            running: false,
            interrupt: false,
            counter_mask: 0xFFFF,
            adc_mask: 0,
            integration_ticks: 5_000,
            tick: 0,
            run_index: 0,
            total_index: 0,
            starts: 0,
            fifo_overflows: 0,
            next_point_at: Instant::now(),
            faults: Faults::default(),
            model,
        };
        Self {
            shared: Arc::new(Shared {
                device: Mutex::new(device),
                changed: Condvar::new(),
            }),
        }
    }

    /// Command port.
    pub fn command_port(&self) -> SimPipe {
        SimPipe {
            shared: self.shared.clone(),
            inbox: BytesMut::new(),
            outbox: BytesMut::new(),
        }
    }

    /// Data port.
    pub fn data_port(&self) -> SimDataPort {
        SimDataPort {
            shared: self.shared.clone(),
        }
    }

    /// Wire a [`Pulser`] transport to this simulator.
    pub fn connect(&self, config: &PulserConfig) -> Result<(Pulser, PacketQueue), PulserError> {
        Pulser::spawn(
            Box::new(StreamLink::new(self.command_port())),
            Box::new(StreamSource::new(self.data_port())),
            config,
        )
    }

    fn with_device<T>(&self, f: impl FnOnce(&mut Device) -> T) -> T {
        let mut device = self.shared.device.lock();
        let result = f(&mut *device);
        drop(device);
        self.shared.changed.notify_all();
        result
    }

    /// End the run with `exit_code` after the point with overall index `point`.
    pub fn inject_error_exit(&self, point: u64, exit_code: u64) {
        self.with_device(|d| d.faults.error_exit = Some((point, exit_code)));
    }

    /// Report a timing violation at `address` during overall point `point`.
    pub fn inject_timing_violation(&self, point: u64, address: u32) {
        self.with_device(|d| {
            d.faults
                .timing_violations
                .entry(point)
                .or_default()
                .push(address)
        });
    }

    /// Corrupt RAM read-back at `address`.
    pub fn inject_ram_fault(&self, address: u32) {
        self.with_device(|d| d.faults.ram_fault = Some(address));
    }

    /// Stop answering commands.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.with_device(|d| d.faults.unresponsive = unresponsive);
    }

    /// Flip one bit in the record that follows the opening wall-clock tick of
    /// the next point (the first counter record for no-op points).
    pub fn corrupt_next_point(&self) {
        self.with_device(|d| d.faults.corrupt_next_point = true);
    }

    /// Whether the program is running.
    pub fn is_running(&self) -> bool {
        self.shared.device.lock().running
    }

    /// Points produced since creation.
    pub fn points_run(&self) -> u64 {
        self.shared.device.lock().total_index
    }

    /// Number of accepted start commands.
    pub fn starts(&self) -> u64 {
        self.shared.device.lock().starts
    }

    /// Words waiting in the write FIFO.
    pub fn fifo_level(&self) -> usize {
        self.shared.device.lock().fifo.len()
    }

    /// Number of rejected writes that would have overflowed the FIFO.
    pub fn fifo_overflows(&self) -> u64 {
        self.shared.device.lock().fifo_overflows
    }

    /// Current counter mask.
    pub fn counter_mask(&self) -> u16 {
        self.shared.device.lock().counter_mask
    }

    /// Current integration time in ticks.
    pub fn integration_ticks(&self) -> u32 {
        self.shared.device.lock().integration_ticks
    }

    /// Snapshot of the data RAM.
    pub fn ram(&self) -> Vec<u64> {
        self.shared.device.lock().ram.clone()
    }
}

/// Command port of the simulator.
pub struct SimPipe {
    shared: Arc<Shared>,
    inbox: BytesMut,
    outbox: BytesMut,
}

impl Write for SimPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inbox.extend_from_slice(buf);
        let mut device = self.shared.device.lock();
        loop {
            match HostCommand::decode(&mut self.inbox) {
                Ok(Some(command)) => {
                    if let Some(reply) = device.handle(&command) {
                        reply.encode(&mut self.outbox);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.inbox.clear();
                    return Err(io::Error::new(ErrorKind::InvalidData, e.to_string()));
                }
            }
        }
        drop(device);
        self.shared.changed.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for SimPipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.outbox.is_empty() {
            return Err(io::Error::new(ErrorKind::TimedOut, "no reply"));
        }
        let n = buf.len().min(self.outbox.len());
        buf[..n].copy_from_slice(&self.outbox.split_to(n));
        Ok(n)
    }
}

/// Data port of the simulator.
pub struct SimDataPort {
    shared: Arc<Shared>,
}

impl Read for SimDataPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut device = self.shared.device.lock();
        let deadline = Instant::now() + device.options.read_timeout;
        loop {
            if !device.out.is_empty() {
                let n = buf.len().min(device.out.len());
                buf[..n].copy_from_slice(&device.out.split_to(n));
                return Ok(n);
            }
            if device.step() {
                continue;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::new(ErrorKind::TimedOut, "no data"));
            }
            let mut wake = deadline;
            if device.running && device.next_point_at > now {
                wake = wake.min(device.next_point_at);
            }
            self.shared.changed.wait_for(&mut device, wake - now);
        }
    }
}
