//! Sequencer timebase helpers.
//!
//! The sequencer counts in 20 ns ticks (50 MHz). Its wall-clock records carry only
//! the low 24 bits of the tick counter, so the host extends them to 64 bits by
//! counting rollovers. Integration times travel to the hardware as a 32-bit tick
//! count.

use std::time::Duration;

use crate::error::PulserError;

/// Length of one sequencer tick in nanoseconds.
pub const TIMEBASE_NS: u64 = 20;

/// Mask of the 24-bit hardware tick counter.
pub const TICK_MASK: u32 = 0x00FF_FFFF;

/// Number of ticks in one full 24-bit period.
pub const TICK_PERIOD: u64 = 1 << 24;

/// Extends the 24-bit hardware tick to a monotone 64-bit count.
///
/// Relies on the stream delivering ticks in non-decreasing order; every time a
/// value smaller than the previous one is seen, one full 24-bit period is added.
#[derive(Debug, Clone, Default)]
pub struct TickExtender {
    last: Option<u32>,
    epoch: u64,
}

impl TickExtender {
    /// Create an extender that has not seen any tick yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next 24-bit tick value and return the extended 64-bit tick.
    pub fn extend(&mut self, raw: u32) -> u64 {
        let raw = raw & TICK_MASK;
        if let Some(last) = self.last {
            if raw < last {
                self.epoch += TICK_PERIOD;
            }
        }
        self.last = Some(raw);
        self.epoch + u64::from(raw)
    }

    /// Last extended value, if any tick was seen.
    pub fn current(&self) -> Option<u64> {
        self.last.map(|raw| self.epoch + u64::from(raw))
    }

    /// Forget all history (new run).
    pub fn reset(&mut self) {
        self.last = None;
        self.epoch = 0;
    }
}

/// Convert a duration to whole sequencer ticks for the 32-bit integration field.
pub fn duration_to_ticks(duration: Duration) -> Result<u32, PulserError> {
    let ticks = duration.as_nanos() / u128::from(TIMEBASE_NS);
    u32::try_from(ticks).map_err(|_| {
        PulserError::OutOfRange(format!(
            "integration time {:?} exceeds 32-bit tick field",
            duration
        ))
    })
}

/// Convert a tick count back to a duration.
pub fn ticks_to_duration(ticks: u64) -> Duration {
    Duration::from_nanos(ticks.saturating_mul(TIMEBASE_NS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extends_across_rollover() {
        let mut ext = TickExtender::new();
        assert_eq!(ext.extend(0xFF_FFFE), 0xFF_FFFE);
        assert_eq!(ext.extend(0xFF_FFFF), 0xFF_FFFF);
        assert_eq!(ext.extend(0x00_0000), 0x100_0000);
        assert_eq!(ext.extend(0x00_0005), 0x100_0005);
    }

    #[test]
    fn extension_is_monotone_over_many_periods() {
        let mut ext = TickExtender::new();
        let mut previous = 0u64;
        for step in 0..10_000u64 {
            let true_tick = step * 7_919;
            let extended = ext.extend((true_tick & u64::from(TICK_MASK)) as u32);
            assert!(extended >= previous);
            assert_eq!(extended, true_tick);
            previous = extended;
        }
    }

    #[test]
    fn equal_ticks_do_not_roll_over() {
        let mut ext = TickExtender::new();
        ext.extend(100);
        assert_eq!(ext.extend(100), 100);
    }

    #[test]
    fn integration_time_conversion() {
        assert_eq!(duration_to_ticks(Duration::from_micros(100)).unwrap(), 5_000);
        assert!(duration_to_ticks(Duration::from_secs(100)).is_err());
        assert_eq!(ticks_to_duration(50), Duration::from_micros(1));
    }
}
