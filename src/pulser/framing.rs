//! Return-stream framing.
//!
//! The sequencer reports its data as a sequence of 5-byte **groups**: four data
//! bytes followed by a CRC-8 over them. A record is one or more groups; the first
//! byte of the first group is the tag.
//!
//! ```text
//! tag    kind               groups  header bytes 1..4       extension payload
//! 0x00   counter            2       bucket, 0, 0            24-bit count
//! 0x01   timestamp          2       bucket, 0, 0            24-bit time
//! 0x02   ADC                2       channel (0..=3), 0, 0   24-bit sample
//! 0x03   scan echo          4       24-bit address          64-bit value
//! 0x04   timing violation   1       24-bit program address  -
//! 0x05   final              10      0, 0, 0                 exit code, start, end
//! 0x06   other              2       n (<= 3), 0, 0          n auxiliary bytes
//! 0x07   point end          1       0, 0, 0                 -
//! 0xFF   wall clock         1       low 24 tick bits        -
//! 0xE0   extension          -       24 payload bits of the record before it
//! ```
//!
//! A 24-bit value takes one extension group, a 64-bit value three (16 + 24 + 24
//! bits, most significant first). Extension groups never start a record, and
//! unused header bytes must be zero.
//!
//! A group with a bad CRC, or a header that does not start a record, makes the
//! demultiplexer shift the stream by one byte and try again. While out of sync a
//! candidate record is only accepted when the group after it also checks out.

use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, BytesMut};
use tracing::debug;

use super::crc::crc8;
use super::packet::DataPacket;
use crate::timing::{TickExtender, TICK_MASK};

/// Bytes per group: 4 data bytes plus the CRC.
pub const GROUP_LEN: usize = 5;

/// Tag of the wall-clock record.
pub const WALL_CLOCK_TAG: u8 = 0xFF;

/// Tag of a group continuing a wide record.
pub const EXTENSION_TAG: u8 = 0xE0;

/// Extension groups per 64-bit value.
const WIDE_GROUPS: usize = 3;

/// Highest counter or timestamp bucket.
const MAX_BUCKET: u8 = 0x0F;

/// Highest ADC channel.
const MAX_ADC_CHANNEL: u8 = 3;

/// Auxiliary bytes per `other` record.
const OTHER_BYTES: usize = 3;

/// Record kinds, one per tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Counter datum.
    Counter,
    /// Timestamp datum.
    Timestamp,
    /// ADC sample.
    Adc,
    /// Scan value echo.
    ScanEcho,
    /// Timing violation report.
    TimingViolation,
    /// Final record with exit code and time interval.
    Final,
    /// Auxiliary bytes.
    Other,
    /// End of a non-final packet.
    PointEnd,
    /// 24-bit wall-clock tick.
    WallClock,
}

impl RecordKind {
    /// Decode a tag byte.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x00 => Some(RecordKind::Counter),
            0x01 => Some(RecordKind::Timestamp),
            0x02 => Some(RecordKind::Adc),
            0x03 => Some(RecordKind::ScanEcho),
            0x04 => Some(RecordKind::TimingViolation),
            0x05 => Some(RecordKind::Final),
            0x06 => Some(RecordKind::Other),
            0x07 => Some(RecordKind::PointEnd),
            WALL_CLOCK_TAG => Some(RecordKind::WallClock),
            _ => None,
        }
    }

    /// Decode the first group of a record, checking its header bytes.
    pub fn from_header(group: &[u8]) -> Option<Self> {
        let kind = Self::from_tag(group[0])?;
        let selector = group[1];
        let padding_clear = group[2] == 0 && group[3] == 0;
        let ok = match kind {
            RecordKind::Counter | RecordKind::Timestamp => {
                selector <= MAX_BUCKET && padding_clear
            }
            RecordKind::Adc => selector <= MAX_ADC_CHANNEL && padding_clear,
            RecordKind::Other => usize::from(selector) <= OTHER_BYTES && padding_clear,
            RecordKind::Final | RecordKind::PointEnd => selector == 0 && padding_clear,
            RecordKind::ScanEcho | RecordKind::TimingViolation | RecordKind::WallClock => true,
        };
        ok.then_some(kind)
    }

    /// Tag byte.
    pub fn tag(self) -> u8 {
        match self {
            RecordKind::Counter => 0x00,
            RecordKind::Timestamp => 0x01,
            RecordKind::Adc => 0x02,
            RecordKind::ScanEcho => 0x03,
            RecordKind::TimingViolation => 0x04,
            RecordKind::Final => 0x05,
            RecordKind::Other => 0x06,
            RecordKind::PointEnd => 0x07,
            RecordKind::WallClock => WALL_CLOCK_TAG,
        }
    }

    /// Number of groups the record occupies.
    pub fn groups(self) -> usize {
        match self {
            RecordKind::Counter | RecordKind::Timestamp | RecordKind::Adc | RecordKind::Other => 2,
            RecordKind::ScanEcho => 1 + WIDE_GROUPS,
            RecordKind::Final => 1 + 3 * WIDE_GROUPS,
            RecordKind::TimingViolation | RecordKind::PointEnd | RecordKind::WallClock => 1,
        }
    }
}

/// Good/bad CRC bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramingStats {
    /// Records accepted.
    pub good_crc: u64,
    /// Losses of sync (consecutive bad bytes count once).
    pub bad_crc: u64,
    /// Bytes discarded while resyncing.
    pub skipped_bytes: u64,
}

#[derive(Debug, Default)]
struct PacketBuilder {
    packet: DataPacket,
    adc_sum: [u64; 4],
    adc_samples: [u32; 4],
    first_tick: Option<u64>,
    last_tick: Option<u64>,
}

impl PacketBuilder {
    fn touch_tick(&mut self, tick: u64) {
        if self.first_tick.is_none() {
            self.first_tick = Some(tick);
        }
        self.last_tick = Some(tick);
    }

    fn close(&mut self, fallback_tick: u64) -> DataPacket {
        let mut builder = std::mem::take(self);
        for channel in 0..4 {
            if builder.adc_samples[channel] > 0 {
                builder.packet.analog[channel] =
                    (builder.adc_sum[channel] as f64 / f64::from(builder.adc_samples[channel])) as f32;
            }
        }
        if !builder.packet.is_final {
            builder.packet.time_interval = (
                builder.first_tick.unwrap_or(fallback_tick),
                builder.last_tick.unwrap_or(fallback_tick),
            );
        }
        builder.packet
    }
}

/// Splits the raw return stream into [`DataPacket`]s.
///
/// Feed arbitrary chunks with [`push`](Self::push); incomplete records stay
/// buffered until the rest arrives.
#[derive(Debug)]
pub struct Demultiplexer {
    pending: BytesMut,
    current: PacketBuilder,
    ticks: TickExtender,
    synced: bool,
    stats: FramingStats,
}

impl Default for Demultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Demultiplexer {
    /// Create a demultiplexer expecting an aligned stream.
    pub fn new() -> Self {
        Self {
            pending: BytesMut::with_capacity(4096),
            current: PacketBuilder::default(),
            ticks: TickExtender::new(),
            synced: true,
            stats: FramingStats::default(),
        }
    }

    /// CRC counters so far.
    pub fn stats(&self) -> FramingStats {
        self.stats
    }

    /// Whether the last decision was an accepted record.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Bytes waiting for the rest of their record.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop buffered bytes and the partial packet (new run).
    pub fn reset(&mut self) {
        self.pending.clear();
        self.current = PacketBuilder::default();
        self.ticks.reset();
        self.synced = true;
    }

    /// Append `data` and move every completed packet into `out`.
    pub fn push(&mut self, data: &[u8], out: &mut Vec<DataPacket>) {
        self.pending.extend_from_slice(data);
        while let Some(kind) = self.next_record() {
            let len = kind.groups() * GROUP_LEN;
            let record = self.pending.split_to(len);
            self.stats.good_crc += 1;
            self.synced = true;
            if let Some(packet) = self.apply(kind, &record) {
                out.push(packet);
            }
        }
    }

    /// Convenience wrapper around [`push`](Self::push).
    pub fn decode(&mut self, data: &[u8]) -> Vec<DataPacket> {
        let mut out = Vec::new();
        self.push(data, &mut out);
        out
    }

    /// Find the next acceptable record at the head of the buffer, discarding
    /// bytes that cannot start one. Returns `None` when more data is needed.
    fn next_record(&mut self) -> Option<RecordKind> {
        loop {
            if self.pending.len() < GROUP_LEN {
                return None;
            }
            match self.candidate() {
                Candidate::Record(kind) => return Some(kind),
                Candidate::NeedMore => return None,
                Candidate::Invalid => {
                    if self.synced {
                        self.stats.bad_crc += 1;
                        self.synced = false;
                        debug!(
                            good = self.stats.good_crc,
                            bad = self.stats.bad_crc,
                            "return stream lost sync, resyncing"
                        );
                    }
                    self.pending.advance(1);
                    self.stats.skipped_bytes += 1;
                }
            }
        }
    }

    fn candidate(&self) -> Candidate {
        if !group_ok(&self.pending[..GROUP_LEN]) {
            return Candidate::Invalid;
        }
        let Some(kind) = RecordKind::from_header(&self.pending[..GROUP_LEN]) else {
            return Candidate::Invalid;
        };
        let len = kind.groups() * GROUP_LEN;
        if self.pending.len() < len {
            return Candidate::NeedMore;
        }
        if !self.pending[GROUP_LEN..len]
            .chunks_exact(GROUP_LEN)
            .all(|group| group_ok(group) && group[0] == EXTENSION_TAG)
        {
            return Candidate::Invalid;
        }
        if !self.synced {
            // Confirm alignment with the group that follows.
            if self.pending.len() < len + GROUP_LEN {
                return Candidate::NeedMore;
            }
            let next = &self.pending[len..len + GROUP_LEN];
            if !group_ok(next) || RecordKind::from_header(next).is_none() {
                return Candidate::Invalid;
            }
        }
        Candidate::Record(kind)
    }

    fn apply(&mut self, kind: RecordKind, record: &[u8]) -> Option<DataPacket> {
        let selector = record[1];
        let header24 = u24(&record[..GROUP_LEN]);
        match kind {
            RecordKind::Counter => {
                self.current
                    .packet
                    .counts
                    .entry(selector)
                    .or_default()
                    .push(u24(&record[GROUP_LEN..]));
            }
            RecordKind::Timestamp => {
                self.current
                    .packet
                    .timestamps
                    .entry(selector)
                    .or_default()
                    .push(u24(&record[GROUP_LEN..]));
            }
            RecordKind::Adc => {
                let channel = usize::from(selector);
                self.current.adc_sum[channel] += u64::from(u24(&record[GROUP_LEN..]));
                self.current.adc_samples[channel] += 1;
            }
            RecordKind::ScanEcho => {
                self.current.packet.scan_value = Some(extension_u64(record, 1));
            }
            RecordKind::TimingViolation => {
                self.current.packet.timing_violations.push(header24);
            }
            RecordKind::Other => {
                let n = usize::from(selector);
                self.current
                    .packet
                    .other
                    .extend_from_slice(&record[GROUP_LEN + 1..GROUP_LEN + 1 + n]);
            }
            RecordKind::WallClock => {
                let tick = self.ticks.extend(header24);
                self.current.touch_tick(tick);
            }
            RecordKind::PointEnd => {
                let fallback = self.ticks.current().unwrap_or(0);
                return Some(self.current.close(fallback));
            }
            RecordKind::Final => {
                let packet = &mut self.current.packet;
                packet.is_final = true;
                packet.exit_code = extension_u64(record, 1);
                packet.time_interval = (
                    extension_u64(record, 1 + WIDE_GROUPS),
                    extension_u64(record, 1 + 2 * WIDE_GROUPS),
                );
                let fallback = self.ticks.current().unwrap_or(0);
                return Some(self.current.close(fallback));
            }
        }
        None
    }
}

enum Candidate {
    Record(RecordKind),
    NeedMore,
    Invalid,
}

fn group_ok(group: &[u8]) -> bool {
    crc8(&group[..4]) == group[4]
}

/// Payload bits of the group at the head of `group`.
fn u24(group: &[u8]) -> u32 {
    u32::from_be_bytes([0, group[1], group[2], group[3]])
}

/// 64-bit value spread over the extension groups starting at group `first`.
fn extension_u64(record: &[u8], first: usize) -> u64 {
    (first..first + WIDE_GROUPS).fold(0u64, |value, group| {
        (value << 24) | u64::from(u24(&record[group * GROUP_LEN..]))
    })
}

/// Writes records in the return-stream format.
///
/// Used by the simulated sequencer and by anything that needs to fabricate a
/// stream (tests, benchmarks, fuzz seeds).
#[derive(Debug, Default)]
pub struct RecordEncoder {
    buf: BytesMut,
}

impl RecordEncoder {
    /// Create an empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    fn group(&mut self, data: [u8; 4]) {
        self.buf.put_slice(&data);
        self.buf.put_u8(crc8(&data));
    }

    fn tagged(&mut self, tag: u8, value24: u32) {
        let [_, a, b, c] = (value24 & TICK_MASK).to_be_bytes();
        self.group([tag, a, b, c]);
    }

    fn header(&mut self, kind: RecordKind, selector: u8) {
        self.group([kind.tag(), selector, 0, 0]);
    }

    fn wide(&mut self, value: u64) {
        for shift in [48, 24, 0] {
            self.tagged(EXTENSION_TAG, ((value >> shift) & 0x00FF_FFFF) as u32);
        }
    }

    /// Counter datum for `bucket`.
    pub fn counter(&mut self, bucket: u8, value: u32) -> &mut Self {
        self.header(RecordKind::Counter, bucket & MAX_BUCKET);
        self.tagged(EXTENSION_TAG, value);
        self
    }

    /// Timestamp datum for `bucket`.
    pub fn timestamp(&mut self, bucket: u8, value: u32) -> &mut Self {
        self.header(RecordKind::Timestamp, bucket & MAX_BUCKET);
        self.tagged(EXTENSION_TAG, value);
        self
    }

    /// ADC sample for `channel` (0..=3).
    pub fn adc(&mut self, channel: u8, value: u32) -> &mut Self {
        self.header(RecordKind::Adc, channel & MAX_ADC_CHANNEL);
        self.tagged(EXTENSION_TAG, value);
        self
    }

    /// Echo of the scan value at `address`.
    pub fn scan_echo(&mut self, address: u32, value: u64) -> &mut Self {
        self.tagged(RecordKind::ScanEcho.tag(), address);
        self.wide(value);
        self
    }

    /// Timing violation at program `address`.
    pub fn timing_violation(&mut self, address: u32) -> &mut Self {
        self.tagged(RecordKind::TimingViolation.tag(), address);
        self
    }

    /// Auxiliary bytes, split into groups of at most three.
    pub fn other(&mut self, bytes: &[u8]) -> &mut Self {
        for chunk in bytes.chunks(OTHER_BYTES) {
            self.header(RecordKind::Other, chunk.len() as u8);
            let mut data = [EXTENSION_TAG, 0, 0, 0];
            data[1..1 + chunk.len()].copy_from_slice(chunk);
            self.group(data);
        }
        self
    }

    /// Low 24 bits of the wall-clock tick.
    pub fn wall_clock(&mut self, tick: u64) -> &mut Self {
        self.tagged(WALL_CLOCK_TAG, (tick & u64::from(TICK_MASK)) as u32);
        self
    }

    /// Close a non-final packet.
    pub fn point_end(&mut self) -> &mut Self {
        self.header(RecordKind::PointEnd, 0);
        self
    }

    /// Final record.
    pub fn final_record(&mut self, exit_code: u64, start: u64, end: u64) -> &mut Self {
        self.header(RecordKind::Final, 0);
        self.wide(exit_code);
        self.wide(start);
        self.wide(end);
        self
    }

    /// Encode every record of `packet`, including its closing record.
    pub fn packet(&mut self, packet: &DataPacket) -> &mut Self {
        let (first, last) = packet.time_interval;
        if !packet.is_final {
            self.wall_clock(first);
        }
        if let Some(value) = packet.scan_value {
            self.scan_echo(0, value);
        }
        for (&bucket, shots) in &packet.counts {
            for &count in shots {
                self.counter(bucket, count);
            }
        }
        for (&bucket, stamps) in &packet.timestamps {
            for &stamp in stamps {
                self.timestamp(bucket, stamp);
            }
        }
        for (channel, &value) in packet.analog.iter().enumerate() {
            if value != 0.0 {
                self.adc(channel as u8, value.round() as u32);
            }
        }
        for &address in &packet.timing_violations {
            self.timing_violation(address);
        }
        self.other(&packet.other);
        if packet.is_final {
            self.final_record(packet.exit_code, first, last)
        } else {
            self.wall_clock(last);
            self.point_end()
        }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing was written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Take the encoded bytes, leaving the encoder empty.
    pub fn take(&mut self) -> Vec<u8> {
        self.buf.split().to_vec()
    }
}

/// Watches the bad-CRC rate over a sliding window.
///
/// The limit only applies once the window holds `min_records` records, so a
/// single flip at the start of a run does not trip it.
#[derive(Debug, Clone)]
pub struct CrcRateMonitor {
    limit: f64,
    window: Duration,
    min_records: u64,
    window_start: Option<Instant>,
    base: FramingStats,
}

impl CrcRateMonitor {
    /// Create a monitor with an error fraction `limit` per `window`.
    pub fn new(limit: f64, window: Duration, min_records: u64) -> Self {
        Self {
            limit,
            window,
            min_records,
            window_start: None,
            base: FramingStats::default(),
        }
    }

    /// Feed the cumulative counters; returns `true` when the rate is exceeded.
    pub fn observe(&mut self, stats: FramingStats, now: Instant) -> bool {
        let start = *self.window_start.get_or_insert(now);
        let good = stats.good_crc.saturating_sub(self.base.good_crc);
        let bad = stats.bad_crc.saturating_sub(self.base.bad_crc);
        let total = good + bad;
        let exceeded = total >= self.min_records && (bad as f64) > self.limit * total as f64;
        if now.duration_since(start) >= self.window {
            self.window_start = Some(now);
            self.base = stats;
        }
        exceeded
    }

    /// Restart the window.
    pub fn reset(&mut self, stats: FramingStats) {
        self.window_start = None;
        self.base = stats;
    }
}
