//! Pulse sequencer transport.
//!
//! The [`PulserTransport`] trait is the seam between the scan controller and the
//! hardware. [`Pulser`] implements it on top of a pair of blocking links (command
//! port and data port) driven by dedicated worker threads; see [`worker`].
//!
//! # Data flow
//!
//! ```text
//! ScanController ──commands──> writer thread ──> command port ──> sequencer
//!        ▲                                                            │
//!        └──── PacketQueue <── reader thread (Demultiplexer) <── data port
//! ```
//!
//! Replies to commands are awaited with the configured read timeout. The
//! sequencer is exclusive to one controller at a time; [`PulserTransport::try_lease`]
//! hands out the lock.

pub mod command;
pub mod crc;
pub mod framing;
pub mod link;
pub mod mock;
pub mod packet;
pub mod program;
pub mod simulator;
pub mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, error, info};

use crate::config::PulserConfig;
use crate::error::PulserError;
use crate::timing::duration_to_ticks;
use command::{parse_words, HostCommand};
use framing::FramingStats;
use link::{DataSource, PulserLink};
use worker::{PacketQueue, ReaderHandle, ReaderShared, WriterHandle};

pub use packet::{DataPacket, ExitStatus, INTERRUPT_EXIT_CODE};
pub use program::PulseProgram;

/// Exclusive use of a sequencer; released on drop.
#[derive(Debug)]
pub struct SequencerLease {
    flag: Option<Arc<AtomicBool>>,
}

impl SequencerLease {
    /// A lease that guards nothing (transports without exclusivity).
    pub fn unguarded() -> Self {
        Self { flag: None }
    }

    fn acquire(flag: &Arc<AtomicBool>) -> Result<Self, PulserError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| PulserError::Busy)?;
        Ok(Self {
            flag: Some(flag.clone()),
        })
    }
}

impl Drop for SequencerLease {
    fn drop(&mut self) {
        if let Some(flag) = self.flag.take() {
            flag.store(false, Ordering::Release);
        }
    }
}

/// Operations the scan controller needs from a sequencer.
///
/// Everything except [`write_data_buffered`](Self::write_data_buffered) waits for
/// the device to acknowledge. `write_data_buffered` only queues the words, which
/// lets packet handling refill the FIFO without a round trip.
#[async_trait]
pub trait PulserTransport: Send + Sync {
    /// Load a program binary.
    async fn upload(&self, binary: &[u8]) -> Result<(), PulserError>;

    /// Write data RAM starting at word `offset`, optionally reading it back.
    async fn write_ram(&self, words: &[u64], offset: u32, verify: bool) -> Result<(), PulserError>;

    /// Queue update words for the running program.
    fn write_data_buffered(&self, words: Vec<u64>) -> Result<(), PulserError>;

    /// Start the program.
    async fn start(&self) -> Result<(), PulserError>;

    /// Stop the program.
    async fn stop(&self) -> Result<(), PulserError>;

    /// Ask the program to end at its next packet boundary with
    /// [`INTERRUPT_EXIT_CODE`].
    async fn interrupt(&self) -> Result<(), PulserError>;

    /// Discard return data that has not been read yet.
    async fn flush_data(&self) -> Result<(), PulserError>;

    /// Discard update words that have not been consumed yet.
    async fn clear_write_fifo(&self) -> Result<(), PulserError>;

    /// Set the counter integration time.
    async fn set_integration_time(&self, time: Duration) -> Result<(), PulserError>;

    /// Select reported counter buckets.
    async fn set_counter_mask(&self, mask: u16) -> Result<(), PulserError>;

    /// Select reported ADC channels.
    async fn set_adc_mask(&self, mask: u8) -> Result<(), PulserError>;

    /// Framing counters of the return stream.
    fn framing_stats(&self) -> FramingStats {
        FramingStats::default()
    }

    /// Take exclusive use of the sequencer for one run.
    fn try_lease(&self) -> Result<SequencerLease, PulserError> {
        Ok(SequencerLease::unguarded())
    }
}

/// Sequencer reached through a command link and a data source.
pub struct Pulser {
    writer: WriterHandle,
    reader: ReaderHandle,
    read_timeout: Duration,
    busy: Arc<AtomicBool>,
}

impl Pulser {
    /// Start the worker threads and return the transport together with the
    /// queue of demultiplexed packets.
    pub fn spawn(
        link: Box<dyn PulserLink>,
        source: Box<dyn DataSource>,
        config: &PulserConfig,
    ) -> Result<(Self, PacketQueue), PulserError> {
        let (reader, queue) = ReaderHandle::spawn(source, config.queue_depth)?;
        let writer = WriterHandle::spawn(link, config.fifo_depth, reader.fault_sender())?;
        info!(
            fifo_depth = config.fifo_depth,
            queue_depth = config.queue_depth,
            "pulser transport started"
        );
        Ok((
            Self {
                writer,
                reader,
                read_timeout: config.read_timeout(),
                busy: Arc::new(AtomicBool::new(false)),
            },
            queue,
        ))
    }

    /// Reader state (CRC counters, overrun flag).
    pub fn reader_shared(&self) -> &Arc<ReaderShared> {
        self.reader.shared()
    }

    async fn call(&self, command: HostCommand) -> Result<Bytes, PulserError> {
        let name = command.name();
        debug!(command = name, "sending command");
        let rx = self.writer.command(command)?;
        match tokio::time::timeout(self.read_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PulserError::WorkerStopped),
            Err(_) => Err(PulserError::Timeout(format!("{name} reply"))),
        }
    }
}

#[async_trait]
impl PulserTransport for Pulser {
    async fn upload(&self, binary: &[u8]) -> Result<(), PulserError> {
        self.call(HostCommand::Upload(binary.to_vec())).await?;
        info!(bytes = binary.len(), "program uploaded");
        Ok(())
    }

    async fn write_ram(&self, words: &[u64], offset: u32, verify: bool) -> Result<(), PulserError> {
        self.call(HostCommand::WriteRam {
            offset,
            words: words.to_vec(),
        })
        .await?;
        if !verify || words.is_empty() {
            return Ok(());
        }
        let payload = self
            .call(HostCommand::ReadRam {
                offset,
                count: words.len() as u32,
            })
            .await?;
        let read_back = parse_words(&payload)?;
        let mismatch = words
            .iter()
            .zip(read_back.iter().chain(std::iter::repeat(&0)))
            .enumerate()
            .find(|(_, (written, read))| written != read);
        if let Some((i, (&expected, &actual))) = mismatch {
            let address = offset + i as u32;
            error!(
                address = %format!("{address:#08x}"),
                expected = %format!("{expected:#018x}"),
                actual = %format!("{actual:#018x}"),
                "RAM verify failed"
            );
            return Err(PulserError::RamVerify {
                address,
                expected,
                actual,
            });
        }
        Ok(())
    }

    fn write_data_buffered(&self, words: Vec<u64>) -> Result<(), PulserError> {
        if words.is_empty() {
            return Ok(());
        }
        self.writer.data(words)
    }

    async fn start(&self) -> Result<(), PulserError> {
        self.call(HostCommand::Start).await.map(drop)
    }

    async fn stop(&self) -> Result<(), PulserError> {
        self.call(HostCommand::Stop).await.map(drop)
    }

    async fn interrupt(&self) -> Result<(), PulserError> {
        self.call(HostCommand::Interrupt).await.map(drop)
    }

    async fn flush_data(&self) -> Result<(), PulserError> {
        self.call(HostCommand::FlushData).await?;
        self.reader.shared().request_reset();
        Ok(())
    }

    async fn clear_write_fifo(&self) -> Result<(), PulserError> {
        self.writer.bump_generation();
        self.call(HostCommand::ClearWriteFifo).await.map(drop)
    }

    async fn set_integration_time(&self, time: Duration) -> Result<(), PulserError> {
        let ticks = duration_to_ticks(time)?;
        self.call(HostCommand::SetIntegrationTime(ticks)).await.map(drop)
    }

    async fn set_counter_mask(&self, mask: u16) -> Result<(), PulserError> {
        self.call(HostCommand::SetCounterMask(mask)).await.map(drop)
    }

    async fn set_adc_mask(&self, mask: u8) -> Result<(), PulserError> {
        self.call(HostCommand::SetAdcMask(mask)).await.map(drop)
    }

    fn framing_stats(&self) -> FramingStats {
        self.reader.shared().stats()
    }

    fn try_lease(&self) -> Result<SequencerLease, PulserError> {
        SequencerLease::acquire(&self.busy)
    }
}
