//! Byte links to the sequencer.
//!
//! A sequencer has two ports: a command port that answers every command with one
//! reply, and a data port that carries the return stream. Both are blocking and
//! are only ever driven from the transport's worker threads.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use bytes::BytesMut;
use tracing::{debug, info};

use super::command::{HostCommand, Reply};
use crate::error::PulserError;

/// Command port.
pub trait PulserLink: Send {
    /// Send `command` and wait for its reply.
    fn transact(&mut self, command: &HostCommand) -> Result<Reply, PulserError>;
}

/// Return-data port.
pub trait DataSource: Send {
    /// Read available bytes. `Ok(0)` means nothing arrived within the read
    /// timeout; the caller simply tries again.
    fn read_data(&mut self, buf: &mut [u8]) -> Result<usize, PulserError>;
}

/// Command port over any byte stream (TCP socket, simulator pipe).
///
/// The stream is expected to have a read timeout configured; a timed-out read
/// while waiting for a reply becomes [`PulserError::Timeout`].
pub struct StreamLink<S> {
    stream: S,
    inbound: BytesMut,
}

impl<S: Read + Write + Send> StreamLink<S> {
    /// Wrap a stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            inbound: BytesMut::with_capacity(256),
        }
    }

    /// The wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }
}

impl<S: Read + Write + Send> PulserLink for StreamLink<S> {
    fn transact(&mut self, command: &HostCommand) -> Result<Reply, PulserError> {
        let frame = command.to_bytes();
        self.stream
            .write_all(&frame)
            .and_then(|()| self.stream.flush())
            .map_err(|e| PulserError::WriteFailed(format!("{}: {e}", command.name())))?;

        let mut chunk = [0u8; 4096];
        loop {
            if let Some(reply) = Reply::decode(&mut self.inbound)? {
                return Ok(reply);
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(PulserError::DeviceMissing(
                        "command port closed".to_string(),
                    ))
                }
                Ok(n) => self.inbound.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    self.inbound.clear();
                    return Err(PulserError::Timeout(format!("{} reply", command.name())));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(PulserError::DeviceMissing(format!(
                        "command port: {e}"
                    )))
                }
            }
        }
    }
}

/// Data port over any readable stream.
pub struct StreamSource<R> {
    stream: R,
}

impl<R: Read + Send> StreamSource<R> {
    /// Wrap a stream.
    pub fn new(stream: R) -> Self {
        Self { stream }
    }
}

impl<R: Read + Send> DataSource for StreamSource<R> {
    fn read_data(&mut self, buf: &mut [u8]) -> Result<usize, PulserError> {
        match self.stream.read(buf) {
            Ok(0) => Err(PulserError::DeviceMissing("data port closed".to_string())),
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(e) => Err(PulserError::DeviceMissing(format!("data port: {e}"))),
        }
    }
}

/// Connect to a network-attached sequencer bridge with separate command and data
/// sockets.
pub fn connect_tcp(
    control: impl ToSocketAddrs,
    data: impl ToSocketAddrs,
    read_timeout: Duration,
) -> Result<(StreamLink<TcpStream>, StreamSource<TcpStream>), PulserError> {
    let control = open(control, read_timeout, "command")?;
    let data = open(data, read_timeout, "data")?;
    info!(
        control = ?control.peer_addr().ok(),
        data = ?data.peer_addr().ok(),
        "connected to sequencer bridge"
    );
    Ok((StreamLink::new(control), StreamSource::new(data)))
}

fn open(
    addr: impl ToSocketAddrs,
    read_timeout: Duration,
    which: &str,
) -> Result<TcpStream, PulserError> {
    let stream = TcpStream::connect(addr)
        .map_err(|e| PulserError::DeviceMissing(format!("{which} port: {e}")))?;
    stream
        .set_read_timeout(Some(read_timeout))
        .and_then(|()| stream.set_nodelay(true))
        .map_err(|e| PulserError::DeviceMissing(format!("{which} port: {e}")))?;
    debug!(which, "socket configured");
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Replays canned reply bytes and records what was written.
    struct Canned {
        replies: Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl Read for Canned {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.replies.read(buf)?;
            if n == 0 {
                return Err(std::io::Error::new(ErrorKind::TimedOut, "no reply"));
            }
            Ok(n)
        }
    }

    impl Write for Canned {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn transact_reads_one_reply() {
        let mut replies = BytesMut::new();
        Reply::level(12).encode(&mut replies);
        let mut link = StreamLink::new(Canned {
            replies: Cursor::new(replies.to_vec()),
            written: Vec::new(),
        });
        let reply = link.transact(&HostCommand::QueryFifoLevel).unwrap();
        assert_eq!(reply, Reply::level(12));
        assert_eq!(link.get_ref().written, HostCommand::QueryFifoLevel.to_bytes().to_vec());
    }

    #[test]
    fn missing_reply_is_timeout() {
        let mut link = StreamLink::new(Canned {
            replies: Cursor::new(Vec::new()),
            written: Vec::new(),
        });
        assert!(matches!(
            link.transact(&HostCommand::Start),
            Err(PulserError::Timeout(_))
        ));
    }

    #[test]
    fn source_maps_timeouts_to_empty_reads() {
        struct Silent;
        impl Read for Silent {
            fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(ErrorKind::WouldBlock, "idle"))
            }
        }
        let mut source = StreamSource::new(Silent);
        let mut buf = [0u8; 8];
        assert_eq!(source.read_data(&mut buf).unwrap(), 0);
    }
}
