//! Scan index → x value and update words.
//!
//! The generator runs ahead of the sequencer: [`init_code`](ScanGenerator::init_code)
//! fills the write FIFO before the program starts, then one word is pushed with
//! [`next_code`](ScanGenerator::next_code) for every point that comes back. Once
//! the last point word is out, [`on_final`](ScanGenerator::on_final) hands out the
//! end-of-scan word exactly once so the program ends with a final packet.
//!
//! Repeats run the whole sequence again: with `n` points per pass, index `i`
//! maps to pass entry `i % n`.

use crate::error::PulserError;
use crate::pulser::program::{
    end_of_scan_word, update_word, ValueEncoding, NOOP_ADDRESS, PARAM_STEP_ADDRESS,
};
use crate::pulser::{DataPacket, PulseProgram};

use super::descriptor::{ScanDescriptor, ScanMode};

/// Mapping between scan index, x value and update words.
#[derive(Debug, Clone)]
pub struct ScanGenerator {
    mode: ScanMode,
    parameter: String,
    points: Option<Vec<f64>>,
    total: Option<usize>,
    param_list_address: u32,
    encoding: ValueEncoding,
    words: Vec<u64>,
    next: usize,
    end_sent: bool,
}

impl ScanGenerator {
    /// Generator for `descriptor`.
    pub fn new(descriptor: &ScanDescriptor) -> Self {
        let points = descriptor.base_points();
        let total = points.as_ref().map(|p| p.len() * descriptor.repeats);
        Self {
            mode: descriptor.mode,
            parameter: descriptor.parameter.clone(),
            points,
            total,
            param_list_address: descriptor.param_list_address,
            encoding: ValueEncoding::Raw,
            words: Vec::new(),
            next: 0,
            end_sent: false,
        }
    }

    /// Points of the whole run (all repeats); `None` for free-running scans.
    pub fn total_points(&self) -> Option<usize> {
        self.total
    }

    /// Whether index `i` is past the end of the run.
    pub fn is_complete(&self, i: usize) -> bool {
        self.total.is_some_and(|total| i >= total)
    }

    /// x coordinate of point `i`. Parameter-list scans read it from the
    /// packet's scan echo when there is one.
    pub fn x_value(&self, i: usize, packet: Option<&DataPacket>) -> f64 {
        if self.mode == ScanMode::ParameterList {
            if let Some(echo) = packet.and_then(|p| p.scan_value) {
                return self.encoding.decode(echo);
            }
        }
        match &self.points {
            Some(points) if !points.is_empty() => points[i % points.len()],
            Some(_) => f64::NAN,
            None => i as f64,
        }
    }

    /// Fixed x range `(lo, hi)`; `None` for free-running scans.
    pub fn x_range(&self) -> Option<(f64, f64)> {
        let points = self.points.as_ref()?;
        let lo = points.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = points.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        (lo <= hi).then_some((lo, hi))
    }

    /// RAM block holding a parameter list: `(offset, words)`.
    pub fn param_list_ram(&self, program: &PulseProgram) -> Result<Option<(u32, Vec<u64>)>, PulserError> {
        if self.mode != ScanMode::ParameterList {
            return Ok(None);
        }
        let encoding = self.resolve_encoding(program);
        let words = self
            .points
            .iter()
            .flatten()
            .map(|&x| encoding.encode(x))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some((self.param_list_address, words)))
    }

    fn resolve_encoding(&self, program: &PulseProgram) -> ValueEncoding {
        program
            .variables
            .get(&self.parameter)
            .map(|v| v.encoding)
            .unwrap_or_default()
    }

    fn prepare(&mut self, program: &PulseProgram) -> Result<(), PulserError> {
        self.encoding = self.resolve_encoding(program);
        let points = self.points.as_deref().unwrap_or_default();
        self.words = match self.mode {
            ScanMode::FreeRunning => Vec::new(),
            ScanMode::ParameterList => (0..points.len() as u32)
                .map(|i| update_word(PARAM_STEP_ADDRESS, u64::from(self.param_list_address + i)))
                .collect(),
            ScanMode::Linear | ScanMode::LinearGap | ScanMode::List => {
                if self.parameter.is_empty() {
                    vec![update_word(NOOP_ADDRESS, 0); points.len()]
                } else {
                    points
                        .iter()
                        .map(|&x| program.variable_update(&self.parameter, x))
                        .collect::<Result<_, _>>()?
                }
            }
        };
        Ok(())
    }

    fn fill(&mut self, max_updates: usize) -> Vec<u64> {
        let mut code = Vec::with_capacity(max_updates.min(self.total.unwrap_or(max_updates)));
        while code.len() < max_updates {
            match self.next_code().or_else(|| self.on_final()) {
                Some(word) => code.push(word),
                None => break,
            }
        }
        code
    }

    /// Update block written before the program starts: at most `max_updates`
    /// words beginning with point 0.
    pub fn init_code(&mut self, program: &PulseProgram, max_updates: usize) -> Result<Vec<u64>, PulserError> {
        self.prepare(program)?;
        self.next = 0;
        self.end_sent = false;
        Ok(self.fill(max_updates))
    }

    /// Update block after a pause or resume so the next packet is point `index`.
    pub fn restart_code(
        &mut self,
        program: &PulseProgram,
        index: usize,
        max_updates: usize,
    ) -> Result<Vec<u64>, PulserError> {
        self.prepare(program)?;
        self.next = index;
        self.end_sent = false;
        Ok(self.fill(max_updates))
    }

    /// Word of the next point, `None` once every point has been handed out.
    pub fn next_code(&mut self) -> Option<u64> {
        if self.is_complete(self.next) {
            return None;
        }
        let word = if self.words.is_empty() {
            update_word(NOOP_ADDRESS, 0)
        } else {
            self.words[self.next % self.words.len()]
        };
        self.next += 1;
        Some(word)
    }

    /// End-of-scan word, once, after the last point word. Never for
    /// free-running scans.
    pub fn on_final(&mut self) -> Option<u64> {
        if self.end_sent || !self.is_complete(self.next) {
            return None;
        }
        self.end_sent = true;
        Some(end_of_scan_word())
    }

    /// Per-point block of externally stepped scans: run one point, then end.
    pub fn external_code(&self) -> Vec<u64> {
        vec![update_word(NOOP_ADDRESS, 0), end_of_scan_word()]
    }

    /// Index of the next point word.
    pub fn next_index(&self) -> usize {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pulser::program::{split_update_word, ProgramVariable, END_OF_SCAN_ADDRESS};

    fn program() -> PulseProgram {
        PulseProgram::new("demo", vec![1]).with_variable(
            "t",
            ProgramVariable {
                address: 7,
                value: 0.0,
                encoding: ValueEncoding::Raw,
            },
        )
    }

    #[test]
    fn short_scan_fits_with_end_word() {
        let mut generator = ScanGenerator::new(&ScanDescriptor::linear("s", "t", 0.0, 2.0, 3));
        let code = generator.init_code(&program(), 100).unwrap();
        let decoded: Vec<_> = code.iter().map(|&w| split_update_word(w)).collect();
        assert_eq!(decoded, vec![(7, 0), (7, 1), (7, 2), (END_OF_SCAN_ADDRESS, 0)]);
        assert_eq!(generator.next_code(), None);
        assert_eq!(generator.on_final(), None);
    }

    #[test]
    fn long_scan_streams_words() {
        let scan = ScanDescriptor::linear("s", "t", 0.0, 9.0, 10).with_repeats(2);
        let mut generator = ScanGenerator::new(&scan);
        assert_eq!(generator.total_points(), Some(20));
        assert_eq!(generator.init_code(&program(), 4).unwrap().len(), 4);
        let mut rest = Vec::new();
        while let Some(word) = generator.next_code() {
            rest.push(split_update_word(word).1);
        }
        assert_eq!(rest.len(), 16);
        assert_eq!(rest[..2], [4, 5]);
        assert_eq!(generator.on_final(), Some(end_of_scan_word()));
        assert_eq!(generator.on_final(), None);
        assert_eq!(generator.x_value(13, None), 3.0);
    }

    #[test]
    fn restart_continues_at_index() {
        let mut generator = ScanGenerator::new(&ScanDescriptor::linear("s", "t", 0.0, 9.0, 10));
        generator.init_code(&program(), 3).unwrap();
        let code = generator.restart_code(&program(), 8, 10).unwrap();
        let decoded: Vec<_> = code.iter().map(|&w| split_update_word(w)).collect();
        assert_eq!(decoded, vec![(7, 8), (7, 9), (END_OF_SCAN_ADDRESS, 0)]);
    }

    #[test]
    fn parameter_list_uses_echo() {
        let mut scan = ScanDescriptor::list("s", "t", vec![5.0, 6.0]);
        scan.mode = ScanMode::ParameterList;
        scan.param_list_address = 100;
        let mut generator = ScanGenerator::new(&scan);
        let (offset, ram) = generator.param_list_ram(&program()).unwrap().unwrap();
        assert_eq!((offset, ram), (100, vec![5, 6]));
        let code = generator.init_code(&program(), 10).unwrap();
        assert_eq!(split_update_word(code[1]), (PARAM_STEP_ADDRESS, 101));

        let packet = DataPacket {
            scan_value: Some(42),
            ..Default::default()
        };
        assert_eq!(generator.x_value(0, Some(&packet)), 42.0);
        assert_eq!(generator.x_value(1, None), 6.0);
    }

    #[test]
    fn free_running_never_ends() {
        let mut generator = ScanGenerator::new(&ScanDescriptor::free_running("s"));
        assert_eq!(generator.total_points(), None);
        assert_eq!(generator.x_range(), None);
        let code = generator.init_code(&program(), 5).unwrap();
        assert_eq!(code.len(), 5);
        assert!(code.iter().all(|&w| split_update_word(w).0 == NOOP_ADDRESS));
        assert_eq!(generator.on_final(), None);
        assert_eq!(generator.x_value(17, None), 17.0);
    }

    #[test]
    fn zero_repeats_yield_only_end() {
        let scan = ScanDescriptor::linear("s", "t", 0.0, 1.0, 2).with_repeats(0);
        let mut generator = ScanGenerator::new(&scan);
        assert_eq!(generator.total_points(), Some(0));
        assert!(generator.is_complete(0));
        assert_eq!(generator.x_range(), Some((0.0, 1.0)));
    }
}
