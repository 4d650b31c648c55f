//! The fixed flood payload and the checker for echoed bytes.

use bytes::Bytes;

/// Text every client sends repeatedly. Its content carries no meaning; it is
/// plain ASCII so corrupted echoes are easy to read in logs.
pub const PAYLOAD: &[u8] = b"Throughput over a loopback echo depends on how much data is allowed \
to sit unacknowledged between the two ends. A sender that never waits fills every buffer on the \
path and then measures nothing but its own queueing; a sender that waits for each byte to come \
back measures only latency. Keeping a bounded amount of data in flight sits between the two: \
the pipe stays full, the buffers stay short, and the rate reported is the rate the path can \
actually sustain. Each side samples how many bytes moved and when, keeps the most recent few \
hundred samples, and divides the bytes by the time they span. Old samples fall off the back of \
the window, so a stall shows up within seconds rather than being averaged away over the whole \
run. TCP hands the bytes back in order, so the echo can be checked position by position; UDP \
may drop, reorder, or repeat datagrams, so the datagram client only counts what arrives.\n";

/// Shared handle to the payload.
pub fn payload() -> Bytes {
    Bytes::from_static(PAYLOAD)
}

/// Checks a TCP echo stream against the repeating payload.
///
/// TCP preserves order, so byte `n` of the echo must equal byte
/// `n % payload.len()` of the payload.
#[derive(Debug, Clone)]
pub struct EchoVerifier {
    payload: Bytes,
    /// Offset into `payload` of the next expected byte.
    position: usize,
    /// Total bytes verified so far.
    checked: u64,
}

impl EchoVerifier {
    pub fn new(payload: Bytes) -> Self {
        Self {
            payload,
            position: 0,
            checked: 0,
        }
    }

    /// Verify the next chunk of echoed bytes.
    ///
    /// On mismatch returns the absolute stream offset of the first bad byte.
    pub fn check(&mut self, data: &[u8]) -> Result<(), u64> {
        if self.payload.is_empty() {
            return Ok(());
        }
        let mut data = data;
        while !data.is_empty() {
            let expected = &self.payload[self.position..];
            let n = expected.len().min(data.len());
            if let Some(i) = expected[..n].iter().zip(&data[..n]).position(|(a, b)| a != b) {
                return Err(self.checked + i as u64);
            }
            self.checked += n as u64;
            self.position = (self.position + n) % self.payload.len();
            data = &data[n..];
        }
        Ok(())
    }
}
