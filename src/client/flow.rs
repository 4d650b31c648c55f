//! Flow-control state for one client session.
//!
//! These types perform no I/O. The mio pump and the tokio tasks feed them
//! the outcome of each send and receive and ask them what to do next, so the
//! pacing rules live in exactly one place.

use crate::config::Config;
use crate::error::SessionError;
use crate::payload::EchoVerifier;
use crate::rate::{MibMilestone, RateWindow, ReportClock};
use bytes::Bytes;
use std::time::{Duration, Instant};

/// Per-session knobs taken from the configuration.
#[derive(Debug, Clone, Copy)]
pub struct FlowSettings {
    pub max_inflight_bytes: usize,
    /// Largest TCP read; datagrams always get a full-size buffer.
    pub recv_chunk_size: usize,
    pub report_interval: Duration,
    pub verify: bool,
    pub limit_bytes: Option<u64>,
}

impl From<&Config> for FlowSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_inflight_bytes: config.max_inflight_bytes,
            recv_chunk_size: config.recv_chunk_size,
            report_interval: config.report_interval,
            verify: config.verify,
            limit_bytes: config.limit_bytes,
        }
    }
}

/// Totals for a finished session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSummary {
    pub sent: u64,
    pub received: u64,
    pub elapsed: Duration,
}

impl SessionSummary {
    /// Average echoed bytes per second over the whole session.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.received as f64 / secs
        } else {
            0.0
        }
    }
}

/// Counters and rate tracking common to both transports.
#[derive(Debug)]
struct Meter {
    sent: u64,
    received: u64,
    started: Instant,
    window: RateWindow,
    clock: ReportClock,
    milestone: MibMilestone,
    limit: Option<u64>,
}

impl Meter {
    fn new(settings: &FlowSettings, now: Instant) -> Self {
        Self {
            sent: 0,
            received: 0,
            started: now,
            window: RateWindow::default(),
            clock: ReportClock::new(now, settings.report_interval),
            milestone: MibMilestone::default(),
            limit: settings.limit_bytes,
        }
    }

    fn on_sent(&mut self, n: usize) -> Option<u64> {
        self.sent += n as u64;
        self.milestone.advance(self.sent)
    }

    fn on_received(&mut self, n: usize, now: Instant) -> Option<f64> {
        self.received += n as u64;
        self.window.record(n, now);
        self.clock.poll(&self.window, now)
    }

    fn is_complete(&self) -> bool {
        self.limit.is_some_and(|limit| self.received >= limit)
    }

    fn summary(&self, now: Instant) -> SessionSummary {
        SessionSummary {
            sent: self.sent,
            received: self.received,
            elapsed: now.saturating_duration_since(self.started),
        }
    }
}

/// TCP pacing: stop sending while more than `max_inflight_bytes` are
/// unacknowledged, and resume partial sends from the exact unsent offset.
#[derive(Debug)]
pub struct TcpFlow {
    payload: Bytes,
    /// Next byte of `payload` to send.
    offset: usize,
    /// Bytes sent minus bytes received.
    backlog: usize,
    max_inflight: usize,
    recv_chunk_size: usize,
    verifier: Option<EchoVerifier>,
    meter: Meter,
}

impl TcpFlow {
    pub fn new(payload: Bytes, settings: &FlowSettings, now: Instant) -> Self {
        let verifier = settings.verify.then(|| EchoVerifier::new(payload.clone()));
        Self {
            payload,
            offset: 0,
            backlog: 0,
            max_inflight: settings.max_inflight_bytes,
            recv_chunk_size: settings.recv_chunk_size,
            verifier,
            meter: Meter::new(settings, now),
        }
    }

    pub fn can_send(&self) -> bool {
        self.backlog <= self.max_inflight
    }

    /// The unsent remainder of the current payload copy.
    pub fn pending(&self) -> &[u8] {
        &self.payload[self.offset..]
    }

    pub fn payload(&self) -> Bytes {
        self.payload.clone()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Size of the buffer each receive reads into.
    pub fn recv_chunk_size(&self) -> usize {
        self.recv_chunk_size
    }

    pub fn backlog(&self) -> usize {
        self.backlog
    }

    /// Account for `n` bytes accepted by the transport.
    ///
    /// Returns the cumulative MiB count when a new MiB boundary was crossed.
    pub fn on_sent(&mut self, n: usize) -> Option<u64> {
        debug_assert!(n <= self.payload.len() - self.offset);
        self.offset += n;
        if self.offset >= self.payload.len() {
            self.offset = 0;
        }
        self.backlog += n;
        self.meter.on_sent(n)
    }

    /// Account for echoed bytes; returns a rate when a report is due.
    pub fn on_received(&mut self, data: &[u8], now: Instant) -> Result<Option<f64>, SessionError> {
        if let Some(verifier) = self.verifier.as_mut() {
            verifier
                .check(data)
                .map_err(|offset| SessionError::Corrupted { offset })?;
        }
        self.backlog = self.backlog.saturating_sub(data.len());
        Ok(self.meter.on_received(data.len(), now))
    }

    /// The configured byte limit has been echoed back.
    pub fn is_complete(&self) -> bool {
        self.meter.is_complete()
    }

    pub fn summary(&self, now: Instant) -> SessionSummary {
        self.meter.summary(now)
    }
}

/// What the UDP flow learned from one received datagram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Received {
    pub rate: Option<f64>,
    /// The datagram matched the payload.
    pub intact: bool,
}

/// UDP pacing: datagrams are always sent, but the receive drain keeps
/// pulling while `datalag` exceeds `max_inflight_bytes`.
#[derive(Debug)]
pub struct UdpFlow {
    payload: Bytes,
    /// Bytes sent minus bytes received. Loss keeps it high, duplicates can
    /// drive it negative.
    datalag: i64,
    max_inflight: i64,
    verify: bool,
    meter: Meter,
}

impl UdpFlow {
    pub fn new(payload: Bytes, settings: &FlowSettings, now: Instant) -> Self {
        Self {
            payload,
            datalag: 0,
            max_inflight: settings.max_inflight_bytes as i64,
            verify: settings.verify,
            meter: Meter::new(settings, now),
        }
    }

    pub fn datagram(&self) -> &[u8] {
        &self.payload
    }

    pub fn datalag(&self) -> i64 {
        self.datalag
    }

    /// Keep draining receives instead of sending the next datagram.
    pub fn keep_draining(&self) -> bool {
        self.datalag > self.max_inflight
    }

    pub fn on_sent(&mut self, n: usize) -> Option<u64> {
        self.datalag += n as i64;
        self.meter.on_sent(n)
    }

    pub fn on_received(&mut self, data: &[u8], now: Instant) -> Received {
        let intact = !self.verify || data == &self.payload[..];
        self.datalag -= data.len() as i64;
        Received {
            rate: self.meter.on_received(data.len(), now),
            intact,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.meter.is_complete()
    }

    pub fn summary(&self, now: Instant) -> SessionSummary {
        self.meter.summary(now)
    }
}
