//! Fuzz target for the return-stream demultiplexer.
//!
//! Tests:
//! - Arbitrary bytes never panic and never grow the pending buffer unbounded
//! - Chunking does not change what is decoded
//! - A valid stream appended after garbage is still recovered

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use ion_daq::pulser::framing::{Demultiplexer, RecordEncoder, GROUP_LEN};

/// Fuzz input for the demultiplexer
#[derive(Debug, Arbitrary)]
struct DemuxInput {
    /// Raw bytes fed first
    garbage: Vec<u8>,
    /// Chunk size for the split feed (1-256)
    chunk: u8,
    /// Counts of a valid point appended after the garbage
    counts: Vec<u16>,
}

fuzz_target!(|input: DemuxInput| {
    let mut whole = Demultiplexer::new();
    let packets = whole.decode(&input.garbage);
    assert!(whole.pending_len() < 11 * GROUP_LEN);

    // Same bytes, different chunking: same packets.
    let chunk = usize::from(input.chunk.max(1));
    let mut split = Demultiplexer::new();
    let mut out = Vec::new();
    for piece in input.garbage.chunks(chunk) {
        split.push(piece, &mut out);
    }
    assert_eq!(out, packets);
    assert_eq!(split.stats(), whole.stats());

    // Two valid points after the garbage: the second always decodes.
    let counts: Vec<u32> = input.counts.iter().take(64).map(|&c| u32::from(c)).collect();
    let mut enc = RecordEncoder::new();
    for tick in [1_000u64, 2_000] {
        enc.wall_clock(tick);
        for &count in &counts {
            enc.counter(3, count);
        }
        enc.wall_clock(tick + 10).point_end();
    }
    let mut tail = Vec::new();
    whole.push(&enc.take(), &mut tail);
    let last = tail.last().expect("valid point after garbage");
    if counts.is_empty() {
        assert!(last.counts.get(&3).is_none());
    } else {
        assert_eq!(last.counts.get(&3), Some(&counts));
    }
});
