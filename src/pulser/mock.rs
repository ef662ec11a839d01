//! Mock sequencer transport.
//!
//! Accepts every command instantly and records it. It produces no return data;
//! tests feed the controller synthetic [`DataPacket`](super::DataPacket)s directly.
//!
//! # Example
//!
//! ```rust,ignore
//! let pulser = Arc::new(MockPulser::new());
//! controller.start(overrides).await?;
//! assert_eq!(pulser.count(|c| matches!(c, PulserCall::Start)), 1);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{PulserTransport, SequencerLease};
use crate::error::PulserError;

/// One recorded transport call.
#[derive(Debug, Clone, PartialEq)]
pub enum PulserCall {
    /// Program upload with its size in bytes.
    Upload(usize),
    /// RAM write.
    WriteRam {
        /// First word address.
        offset: u32,
        /// Words written.
        words: Vec<u64>,
    },
    /// Buffered update words.
    WriteData(Vec<u64>),
    /// Program start.
    Start,
    /// Program stop.
    Stop,
    /// Interrupt request.
    Interrupt,
    /// Return data flush.
    FlushData,
    /// Write FIFO clear.
    ClearWriteFifo,
    /// Integration time.
    IntegrationTime(Duration),
    /// Counter mask.
    CounterMask(u16),
    /// ADC mask.
    AdcMask(u8),
}

/// Transport that records calls instead of talking to hardware.
#[derive(Debug, Default)]
pub struct MockPulser {
    calls: Mutex<Vec<PulserCall>>,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
    fail_ram_verify: AtomicBool,
    busy: Arc<AtomicBool>,
}

impl MockPulser {
    /// Create a mock that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `start` fail with a timeout.
    pub fn fail_next_start(&self) {
        self.fail_start.store(true, Ordering::Release);
    }

    /// Make the next `stop` fail with a timeout.
    pub fn fail_next_stop(&self) {
        self.fail_stop.store(true, Ordering::Release);
    }

    /// Make the next verified RAM write report a mismatch.
    pub fn fail_next_ram_verify(&self) {
        self.fail_ram_verify.store(true, Ordering::Release);
    }

    /// All calls so far.
    pub fn calls(&self) -> Vec<PulserCall> {
        self.calls.lock().clone()
    }

    /// Number of calls matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&PulserCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| predicate(call)).count()
    }

    /// Every buffered update word, in write order.
    pub fn data_words(&self) -> Vec<u64> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                PulserCall::WriteData(words) => Some(words.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Forget recorded calls.
    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, call: PulserCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl PulserTransport for MockPulser {
    async fn upload(&self, binary: &[u8]) -> Result<(), PulserError> {
        if binary.is_empty() {
            return Err(PulserError::UploadRejected("empty binary".into()));
        }
        self.record(PulserCall::Upload(binary.len()));
        Ok(())
    }

    async fn write_ram(&self, words: &[u64], offset: u32, verify: bool) -> Result<(), PulserError> {
        self.record(PulserCall::WriteRam {
            offset,
            words: words.to_vec(),
        });
        if verify && !words.is_empty() && self.fail_ram_verify.swap(false, Ordering::AcqRel) {
            return Err(PulserError::RamVerify {
                address: offset,
                expected: words[0],
                actual: !words[0],
            });
        }
        Ok(())
    }

    fn write_data_buffered(&self, words: Vec<u64>) -> Result<(), PulserError> {
        if !words.is_empty() {
            self.record(PulserCall::WriteData(words));
        }
        Ok(())
    }

    async fn start(&self) -> Result<(), PulserError> {
        if self.fail_start.swap(false, Ordering::AcqRel) {
            return Err(PulserError::Timeout("start reply".into()));
        }
        self.record(PulserCall::Start);
        Ok(())
    }

    async fn stop(&self) -> Result<(), PulserError> {
        if self.fail_stop.swap(false, Ordering::AcqRel) {
            return Err(PulserError::Timeout("stop reply".into()));
        }
        self.record(PulserCall::Stop);
        Ok(())
    }

    async fn interrupt(&self) -> Result<(), PulserError> {
        self.record(PulserCall::Interrupt);
        Ok(())
    }

    async fn flush_data(&self) -> Result<(), PulserError> {
        self.record(PulserCall::FlushData);
        Ok(())
    }

    async fn clear_write_fifo(&self) -> Result<(), PulserError> {
        self.record(PulserCall::ClearWriteFifo);
        Ok(())
    }

    async fn set_integration_time(&self, time: Duration) -> Result<(), PulserError> {
        self.record(PulserCall::IntegrationTime(time));
        Ok(())
    }

    async fn set_counter_mask(&self, mask: u16) -> Result<(), PulserError> {
        self.record(PulserCall::CounterMask(mask));
        Ok(())
    }

    async fn set_adc_mask(&self, mask: u8) -> Result<(), PulserError> {
        self.record(PulserCall::AdcMask(mask));
        Ok(())
    }

    fn try_lease(&self) -> Result<SequencerLease, PulserError> {
        SequencerLease::acquire(&self.busy)
    }
}
