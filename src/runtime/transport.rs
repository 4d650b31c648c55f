//! Non-blocking transport capability shared by the pumps and multiplexers.
//!
//! Every operation reports an explicit `IoStatus`; `WouldBlock` is a normal
//! outcome that means "retry on the next readiness event" and never surfaces
//! as a `SessionError`.

use crate::error::SessionError;
use mio::net::{TcpStream, UdpSocket};
use std::io::{self, Read, Write};
use std::net::Shutdown;

/// Outcome of a single non-blocking send or receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// This many bytes moved.
    Ready(usize),
    /// Nothing can move until the next readiness event.
    WouldBlock,
    /// The peer closed its end of the stream.
    Closed,
}

/// Minimal send/receive/close surface over a connected endpoint.
pub trait Transport {
    fn send(&mut self, buf: &[u8]) -> Result<IoStatus, SessionError>;
    fn receive(&mut self, buf: &mut [u8]) -> Result<IoStatus, SessionError>;
    /// Shut the endpoint down and release its socket.
    fn close(self);
}

/// Map a raw stream result onto `IoStatus`, treating zero bytes as EOF.
fn stream_status(result: io::Result<usize>) -> Result<IoStatus, SessionError> {
    match result {
        Ok(0) => Ok(IoStatus::Closed),
        Ok(n) => Ok(IoStatus::Ready(n)),
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(IoStatus::WouldBlock),
        Err(e) => Err(SessionError::from_io(e)),
    }
}

/// Datagram variant: a zero-length datagram is still a datagram.
fn datagram_status(result: io::Result<usize>) -> Result<IoStatus, SessionError> {
    match result {
        Ok(n) => Ok(IoStatus::Ready(n)),
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(IoStatus::WouldBlock),
        Err(e) => Err(SessionError::from_io(e)),
    }
}

/// Retry a syscall interrupted by a signal.
fn retry_interrupted(mut op: impl FnMut() -> io::Result<usize>) -> io::Result<usize> {
    loop {
        match op() {
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

impl Transport for TcpStream {
    fn send(&mut self, buf: &[u8]) -> Result<IoStatus, SessionError> {
        if buf.is_empty() {
            return Ok(IoStatus::Ready(0));
        }
        stream_status(retry_interrupted(|| self.write(buf)))
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<IoStatus, SessionError> {
        stream_status(retry_interrupted(|| self.read(buf)))
    }

    fn close(self) {
        let _ = self.shutdown(Shutdown::Both);
    }
}

/// A UDP socket that has been `connect`ed to a single peer.
impl Transport for UdpSocket {
    fn send(&mut self, buf: &[u8]) -> Result<IoStatus, SessionError> {
        datagram_status(retry_interrupted(|| UdpSocket::send(self, buf)))
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<IoStatus, SessionError> {
        datagram_status(retry_interrupted(|| self.recv(buf)))
    }

    /// There is nothing to shut down; dropping frees the local port.
    fn close(self) {}
}
