//! Host → sequencer command codec.
//!
//! Every command travels as `[opcode:u8][len:u32 LE][payload]` and is answered
//! with `[status:u8][len:u32 LE][payload]`. Multi-byte payload fields are little
//! endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::PulserError;

/// Length of the opcode/status byte plus the length field.
pub const FRAME_HEADER_LEN: usize = 5;

/// Upper bound for a single frame payload.
pub const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Load a pulse program binary.
    Upload = 0x01,
    /// Write words to data RAM.
    WriteRam = 0x02,
    /// Read words from data RAM.
    ReadRam = 0x03,
    /// Queue update words for the running program.
    WriteData = 0x04,
    /// Start the program.
    Start = 0x05,
    /// Stop the program.
    Stop = 0x06,
    /// Ask the program to stop at the next packet boundary.
    Interrupt = 0x07,
    /// Discard unread return data.
    FlushData = 0x08,
    /// Discard queued update words.
    ClearWriteFifo = 0x09,
    /// Set the counter integration time in ticks.
    IntegrationTime = 0x0A,
    /// Select reported counter buckets.
    CounterMask = 0x0B,
    /// Select reported ADC channels.
    AdcMask = 0x0C,
    /// Query the number of words in the write FIFO.
    FifoLevel = 0x0D,
}

impl TryFrom<u8> for Opcode {
    type Error = PulserError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => Opcode::Upload,
            0x02 => Opcode::WriteRam,
            0x03 => Opcode::ReadRam,
            0x04 => Opcode::WriteData,
            0x05 => Opcode::Start,
            0x06 => Opcode::Stop,
            0x07 => Opcode::Interrupt,
            0x08 => Opcode::FlushData,
            0x09 => Opcode::ClearWriteFifo,
            0x0A => Opcode::IntegrationTime,
            0x0B => Opcode::CounterMask,
            0x0C => Opcode::AdcMask,
            0x0D => Opcode::FifoLevel,
            other => {
                return Err(PulserError::Protocol(format!(
                    "unknown opcode {other:#04x}"
                )))
            }
        })
    }
}

/// A decoded host command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    /// Load a program binary.
    Upload(Vec<u8>),
    /// Write `words` starting at word `offset`.
    WriteRam {
        /// First word address.
        offset: u32,
        /// Words to write.
        words: Vec<u64>,
    },
    /// Read `count` words starting at `offset`.
    ReadRam {
        /// First word address.
        offset: u32,
        /// Number of words.
        count: u32,
    },
    /// Queue update words.
    WriteData(Vec<u64>),
    /// Start the program.
    Start,
    /// Stop the program.
    Stop,
    /// Interrupt at the next packet boundary.
    Interrupt,
    /// Discard unread return data.
    FlushData,
    /// Discard queued update words.
    ClearWriteFifo,
    /// Integration time in ticks.
    SetIntegrationTime(u32),
    /// Counter bucket mask.
    SetCounterMask(u16),
    /// ADC channel mask.
    SetAdcMask(u8),
    /// Ask for the write FIFO level.
    QueryFifoLevel,
}

impl HostCommand {
    /// Opcode of the command.
    pub fn opcode(&self) -> Opcode {
        match self {
            HostCommand::Upload(_) => Opcode::Upload,
            HostCommand::WriteRam { .. } => Opcode::WriteRam,
            HostCommand::ReadRam { .. } => Opcode::ReadRam,
            HostCommand::WriteData(_) => Opcode::WriteData,
            HostCommand::Start => Opcode::Start,
            HostCommand::Stop => Opcode::Stop,
            HostCommand::Interrupt => Opcode::Interrupt,
            HostCommand::FlushData => Opcode::FlushData,
            HostCommand::ClearWriteFifo => Opcode::ClearWriteFifo,
            HostCommand::SetIntegrationTime(_) => Opcode::IntegrationTime,
            HostCommand::SetCounterMask(_) => Opcode::CounterMask,
            HostCommand::SetAdcMask(_) => Opcode::AdcMask,
            HostCommand::QueryFifoLevel => Opcode::FifoLevel,
        }
    }

    /// Short name for logs and error messages.
    pub fn name(&self) -> &'static str {
        match self.opcode() {
            Opcode::Upload => "upload",
            Opcode::WriteRam => "write RAM",
            Opcode::ReadRam => "read RAM",
            Opcode::WriteData => "write data",
            Opcode::Start => "start",
            Opcode::Stop => "stop",
            Opcode::Interrupt => "interrupt",
            Opcode::FlushData => "flush data",
            Opcode::ClearWriteFifo => "clear write FIFO",
            Opcode::IntegrationTime => "integration time",
            Opcode::CounterMask => "counter mask",
            Opcode::AdcMask => "ADC mask",
            Opcode::FifoLevel => "FIFO level",
        }
    }

    /// Append the encoded frame to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut payload = BytesMut::new();
        match self {
            HostCommand::Upload(binary) => payload.put_slice(binary),
            HostCommand::WriteRam { offset, words } => {
                payload.put_u32_le(*offset);
                for word in words {
                    payload.put_u64_le(*word);
                }
            }
            HostCommand::ReadRam { offset, count } => {
                payload.put_u32_le(*offset);
                payload.put_u32_le(*count);
            }
            HostCommand::WriteData(words) => {
                for word in words {
                    payload.put_u64_le(*word);
                }
            }
            HostCommand::SetIntegrationTime(ticks) => payload.put_u32_le(*ticks),
            HostCommand::SetCounterMask(mask) => payload.put_u16_le(*mask),
            HostCommand::SetAdcMask(mask) => payload.put_u8(*mask),
            HostCommand::Start
            | HostCommand::Stop
            | HostCommand::Interrupt
            | HostCommand::FlushData
            | HostCommand::ClearWriteFifo
            | HostCommand::QueryFifoLevel => {}
        }
        put_frame(buf, self.opcode() as u8, &payload);
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode one command from the head of `buf`.
    ///
    /// Returns `Ok(None)` if the frame is not complete yet; the buffer is left
    /// untouched in that case.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, PulserError> {
        let Some((code, mut payload)) = take_frame(buf)? else {
            return Ok(None);
        };
        let opcode = Opcode::try_from(code)?;
        let command = match opcode {
            Opcode::Upload => HostCommand::Upload(payload.to_vec()),
            Opcode::WriteRam => {
                need(&payload, 4, "write RAM")?;
                let offset = payload.get_u32_le();
                HostCommand::WriteRam {
                    offset,
                    words: words_from(&mut payload, "write RAM")?,
                }
            }
            Opcode::ReadRam => {
                need(&payload, 8, "read RAM")?;
                HostCommand::ReadRam {
                    offset: payload.get_u32_le(),
                    count: payload.get_u32_le(),
                }
            }
            Opcode::WriteData => HostCommand::WriteData(words_from(&mut payload, "write data")?),
            Opcode::Start => HostCommand::Start,
            Opcode::Stop => HostCommand::Stop,
            Opcode::Interrupt => HostCommand::Interrupt,
            Opcode::FlushData => HostCommand::FlushData,
            Opcode::ClearWriteFifo => HostCommand::ClearWriteFifo,
            Opcode::IntegrationTime => {
                need(&payload, 4, "integration time")?;
                HostCommand::SetIntegrationTime(payload.get_u32_le())
            }
            Opcode::CounterMask => {
                need(&payload, 2, "counter mask")?;
                HostCommand::SetCounterMask(payload.get_u16_le())
            }
            Opcode::AdcMask => {
                need(&payload, 1, "ADC mask")?;
                HostCommand::SetAdcMask(payload.get_u8())
            }
            Opcode::FifoLevel => HostCommand::QueryFifoLevel,
        };
        Ok(Some(command))
    }
}

/// Reply status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyStatus {
    /// Command executed.
    Ok = 0,
    /// Device refused the command (payload: UTF-8 reason).
    Rejected = 1,
    /// Device-side failure (payload: UTF-8 reason).
    Failed = 2,
}

/// A device reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Outcome.
    pub status: ReplyStatus,
    /// Command-specific payload.
    pub payload: Bytes,
}

impl Reply {
    /// Successful reply without payload.
    pub fn ok() -> Self {
        Self::ok_with(Bytes::new())
    }

    /// Successful reply with payload.
    pub fn ok_with(payload: impl Into<Bytes>) -> Self {
        Self {
            status: ReplyStatus::Ok,
            payload: payload.into(),
        }
    }

    /// Successful reply carrying RAM words.
    pub fn words(words: &[u64]) -> Self {
        let mut payload = BytesMut::with_capacity(words.len() * 8);
        for word in words {
            payload.put_u64_le(*word);
        }
        Self::ok_with(payload.freeze())
    }

    /// Successful reply carrying a FIFO level.
    pub fn level(level: u32) -> Self {
        Self::ok_with(Bytes::copy_from_slice(&level.to_le_bytes()))
    }

    /// Refusal with a reason.
    pub fn rejected(reason: &str) -> Self {
        Self {
            status: ReplyStatus::Rejected,
            payload: Bytes::copy_from_slice(reason.as_bytes()),
        }
    }

    /// Device failure with a reason.
    pub fn failed(reason: &str) -> Self {
        Self {
            status: ReplyStatus::Failed,
            payload: Bytes::copy_from_slice(reason.as_bytes()),
        }
    }

    /// Append the encoded frame to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        put_frame(buf, self.status as u8, &self.payload);
    }

    /// Decode one reply from the head of `buf`; `Ok(None)` if incomplete.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, PulserError> {
        let Some((code, payload)) = take_frame(buf)? else {
            return Ok(None);
        };
        let status = match code {
            0 => ReplyStatus::Ok,
            1 => ReplyStatus::Rejected,
            2 => ReplyStatus::Failed,
            other => {
                return Err(PulserError::Protocol(format!(
                    "unknown reply status {other:#04x}"
                )))
            }
        };
        Ok(Some(Self { status, payload }))
    }

    /// Turn a reply to `command` into its payload or the matching error.
    pub fn into_result(self, command: &HostCommand) -> Result<Bytes, PulserError> {
        let reason = || String::from_utf8_lossy(&self.payload).into_owned();
        match self.status {
            ReplyStatus::Ok => Ok(self.payload.clone()),
            ReplyStatus::Rejected if matches!(command, HostCommand::Upload(_)) => {
                Err(PulserError::UploadRejected(reason()))
            }
            ReplyStatus::Rejected => Err(PulserError::Protocol(format!(
                "{} rejected: {}",
                command.name(),
                reason()
            ))),
            ReplyStatus::Failed => Err(PulserError::WriteFailed(format!(
                "{}: {}",
                command.name(),
                reason()
            ))),
        }
    }
}

/// Parse a payload of little-endian 64-bit words.
pub fn parse_words(payload: &[u8]) -> Result<Vec<u64>, PulserError> {
    let mut buf = payload;
    words_from(&mut buf, "RAM words")
}

/// Parse a FIFO level payload.
pub fn parse_level(payload: &[u8]) -> Result<u32, PulserError> {
    let mut buf = payload;
    need(&buf, 4, "FIFO level")?;
    Ok(buf.get_u32_le())
}

fn put_frame(buf: &mut BytesMut, code: u8, payload: &[u8]) {
    buf.reserve(FRAME_HEADER_LEN + payload.len());
    buf.put_u8(code);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
}

fn take_frame(buf: &mut BytesMut) -> Result<Option<(u8, Bytes)>, PulserError> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }
    let len = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(PulserError::Protocol(format!(
            "frame payload of {len} bytes exceeds limit"
        )));
    }
    if buf.len() < FRAME_HEADER_LEN + len {
        return Ok(None);
    }
    let code = buf.get_u8();
    buf.advance(4);
    Ok(Some((code, buf.split_to(len).freeze())))
}

fn need(payload: &impl Buf, len: usize, what: &str) -> Result<(), PulserError> {
    if payload.remaining() < len {
        return Err(PulserError::Protocol(format!(
            "{what}: payload too short ({} < {len})",
            payload.remaining()
        )));
    }
    Ok(())
}

fn words_from(payload: &mut impl Buf, what: &str) -> Result<Vec<u64>, PulserError> {
    if payload.remaining() % 8 != 0 {
        return Err(PulserError::Protocol(format!(
            "{what}: payload is not a whole number of words"
        )));
    }
    let mut words = Vec::with_capacity(payload.remaining() / 8);
    while payload.has_remaining() {
        words.push(payload.get_u64_le());
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_ram_frame_layout() {
        let bytes = HostCommand::WriteRam {
            offset: 2,
            words: vec![0x0102],
        }
        .to_bytes();
        assert_eq!(bytes[0], Opcode::WriteRam as u8);
        assert_eq!(&bytes[1..5], &12u32.to_le_bytes());
        assert_eq!(&bytes[5..9], &2u32.to_le_bytes());
        assert_eq!(bytes[9], 0x02);
    }

    #[test]
    fn decodes_back_to_back_commands() {
        let mut buf = BytesMut::new();
        HostCommand::SetCounterMask(0x0003).encode(&mut buf);
        HostCommand::Start.encode(&mut buf);
        HostCommand::WriteData(vec![1, 2]).encode(&mut buf);
        assert_eq!(
            HostCommand::decode(&mut buf).unwrap(),
            Some(HostCommand::SetCounterMask(3))
        );
        assert_eq!(HostCommand::decode(&mut buf).unwrap(), Some(HostCommand::Start));
        assert_eq!(
            HostCommand::decode(&mut buf).unwrap(),
            Some(HostCommand::WriteData(vec![1, 2]))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn incomplete_frame_waits() {
        let full = HostCommand::SetIntegrationTime(5000).to_bytes();
        let mut buf = BytesMut::from(&full[..full.len() - 1]);
        assert_eq!(HostCommand::decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), full.len() - 1);
    }

    #[test]
    fn unknown_opcode_is_protocol_error() {
        let mut buf = BytesMut::from(&[0x7Fu8, 0, 0, 0, 0][..]);
        assert!(matches!(
            HostCommand::decode(&mut buf),
            Err(PulserError::Protocol(_))
        ));
    }

    #[test]
    fn rejected_upload_maps_to_upload_error() {
        let reply = Reply::rejected("empty binary");
        let err = reply
            .into_result(&HostCommand::Upload(Vec::new()))
            .unwrap_err();
        assert_eq!(err, PulserError::UploadRejected("empty binary".into()));
    }

    #[test]
    fn reply_payload_helpers() {
        let mut buf = BytesMut::new();
        Reply::words(&[7, 8]).encode(&mut buf);
        Reply::level(1020).encode(&mut buf);
        let words = Reply::decode(&mut buf).unwrap().unwrap();
        assert_eq!(parse_words(&words.payload).unwrap(), vec![7, 8]);
        let level = Reply::decode(&mut buf).unwrap().unwrap();
        assert_eq!(parse_level(&level.payload).unwrap(), 1020);
    }
}
