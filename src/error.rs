//! Session termination reasons.

use std::fmt;
use std::io;
use std::time::Duration;

/// Why a client session (or a server connection) stopped.
///
/// `Timeout` and `Closed` are the expected ways a flood ends; the rest are
/// abrupt failures. Either way the error is contained to the one session.
#[derive(Debug)]
pub enum SessionError {
    /// No bytes moved in either direction within the deadline.
    Timeout(Duration),
    /// The peer closed the stream.
    Closed,
    /// Connection reset, aborted, or broken pipe.
    Reset(io::Error),
    /// Any other transport failure.
    Transport(io::Error),
    /// Echoed bytes did not match what was sent.
    Corrupted { offset: u64 },
}

impl SessionError {
    /// Classify an I/O error that is not `WouldBlock`.
    pub fn from_io(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => SessionError::Reset(e),
            _ => SessionError::Transport(e),
        }
    }

    /// Clean terminations are logged at info rather than error.
    pub fn is_expected(&self) -> bool {
        matches!(self, SessionError::Timeout(_) | SessionError::Closed)
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Timeout(d) => write!(f, "no data exchanged for {}ms", d.as_millis()),
            SessionError::Closed => write!(f, "connection closed by peer"),
            SessionError::Reset(e) => write!(f, "connection reset: {e}"),
            SessionError::Transport(e) => write!(f, "transport error: {e}"),
            SessionError::Corrupted { offset } => {
                write!(f, "echoed data does not match payload at byte {offset}")
            }
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Reset(e) | SessionError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        SessionError::from_io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_classification() {
        let reset = SessionError::from_io(io::ErrorKind::ConnectionReset.into());
        assert!(matches!(reset, SessionError::Reset(_)));
        assert!(!reset.is_expected());

        let other = SessionError::from_io(io::ErrorKind::PermissionDenied.into());
        assert!(matches!(other, SessionError::Transport(_)));

        assert!(SessionError::Timeout(Duration::from_secs(5)).is_expected());
        assert!(SessionError::Closed.is_expected());
    }
}
