//! Synchronous single-session client pump.
//!
//! One connected socket is registered with a mio `Poll` for both read and
//! write readiness. Each wakeup the pump moves as many bytes as the flow
//! rules allow until every wanted operation would block, then waits for the
//! next readiness event or the I/O deadline, whichever comes first.

use crate::client::flow::{FlowSettings, SessionSummary, TcpFlow, UdpFlow};
use crate::config::Config;
use crate::error::SessionError;
use crate::payload;
use crate::rate::kb_per_sec;
use crate::runtime::socket::{connect_udp, resolve};
use crate::runtime::{IoStatus, Transport};
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const SESSION_TOKEN: Token = Token(0);

/// Receive buffer large enough for any UDP datagram.
const UDP_RECV_BUF: usize = u16::MAX as usize;

/// Where a call to `advance` left the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Every wanted operation would block. `moved` is true if any bytes
    /// were sent or received during the call.
    Blocked { moved: bool },
    /// The configured byte limit has been echoed back.
    Complete,
}

/// A session that can be advanced on readiness.
pub trait Pump {
    fn advance(&mut self) -> Result<Step, SessionError>;
    /// Close the transport and return the session totals.
    fn close(self) -> SessionSummary;
}

/// TCP pump: drains receives, then sends while the backlog allows.
pub struct TcpPump<T> {
    transport: T,
    flow: TcpFlow,
    buf: Vec<u8>,
}

impl<T: Transport> TcpPump<T> {
    pub fn new(transport: T, flow: TcpFlow) -> Self {
        let buf = vec![0u8; flow.recv_chunk_size()];
        Self {
            transport,
            flow,
            buf,
        }
    }

    #[cfg(test)]
    pub fn flow(&self) -> &TcpFlow {
        &self.flow
    }

    #[cfg(test)]
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Read until the transport would block.
    fn drain(&mut self, moved: &mut bool) -> Result<Option<Step>, SessionError> {
        loop {
            match self.transport.receive(&mut self.buf)? {
                IoStatus::Ready(n) => {
                    *moved = true;
                    if let Some(rate) = self.flow.on_received(&self.buf[..n], Instant::now())? {
                        info!("Data exchange rate: {} kB/s", kb_per_sec(rate));
                    }
                    if self.flow.is_complete() {
                        return Ok(Some(Step::Complete));
                    }
                }
                IoStatus::WouldBlock => return Ok(None),
                IoStatus::Closed => return Err(SessionError::Closed),
            }
        }
    }
}

impl<T: Transport> Pump for TcpPump<T> {
    fn advance(&mut self) -> Result<Step, SessionError> {
        let mut moved = false;
        loop {
            if let Some(step) = self.drain(&mut moved)? {
                return Ok(step);
            }

            if !self.flow.can_send() {
                // Only readable events can unblock us now
                debug!(backlog = self.flow.backlog(), "Backlog full");
                return Ok(Step::Blocked { moved });
            }

            match self.transport.send(self.flow.pending())? {
                IoStatus::Ready(n) => {
                    moved = true;
                    if let Some(mib) = self.flow.on_sent(n) {
                        info!("Exchanged {mib} MiB");
                    }
                }
                IoStatus::WouldBlock => return Ok(Step::Blocked { moved }),
                IoStatus::Closed => return Err(SessionError::Closed),
            }
        }
    }

    fn close(self) -> SessionSummary {
        self.transport.close();
        self.flow.summary(Instant::now())
    }
}

/// UDP pump: always sends the next datagram unless the datalag says to keep
/// draining receives.
pub struct UdpPump<T> {
    transport: T,
    flow: UdpFlow,
    buf: Vec<u8>,
}

impl<T: Transport> UdpPump<T> {
    pub fn new(transport: T, flow: UdpFlow) -> Self {
        Self {
            transport,
            flow,
            buf: vec![0u8; UDP_RECV_BUF],
        }
    }

    #[cfg(test)]
    pub fn flow(&self) -> &UdpFlow {
        &self.flow
    }
}

impl<T: Transport> Pump for UdpPump<T> {
    fn advance(&mut self) -> Result<Step, SessionError> {
        let mut moved = false;
        loop {
            loop {
                match self.transport.receive(&mut self.buf)? {
                    IoStatus::Ready(n) => {
                        moved = true;
                        let received = self.flow.on_received(&self.buf[..n], Instant::now());
                        if !received.intact {
                            warn!(len = n, "Datagram does not match payload");
                        }
                        if let Some(rate) = received.rate {
                            info!("Data exchange rate: {} kB/s", kb_per_sec(rate));
                        }
                        if self.flow.is_complete() {
                            return Ok(Step::Complete);
                        }
                    }
                    IoStatus::WouldBlock if self.flow.keep_draining() => {
                        debug!(datalag = self.flow.datalag(), "Waiting for echoes");
                        return Ok(Step::Blocked { moved });
                    }
                    IoStatus::WouldBlock => break,
                    IoStatus::Closed => return Err(SessionError::Closed),
                }
            }

            match self.transport.send(self.flow.datagram())? {
                IoStatus::Ready(n) => {
                    moved = true;
                    if let Some(mib) = self.flow.on_sent(n) {
                        info!("Exchanged {mib} MiB");
                    }
                }
                IoStatus::WouldBlock => return Ok(Step::Blocked { moved }),
                IoStatus::Closed => return Err(SessionError::Closed),
            }
        }
    }

    fn close(self) -> SessionSummary {
        self.transport.close();
        self.flow.summary(Instant::now())
    }
}

/// Advance `pump` on readiness until it completes, fails, or moves no data
/// for `io_timeout`.
pub fn drive<P: Pump>(poll: &mut Poll, pump: &mut P, io_timeout: Duration) -> Result<(), SessionError> {
    let mut events = Events::with_capacity(16);
    let mut last_progress = Instant::now();

    loop {
        match pump.advance()? {
            Step::Complete => return Ok(()),
            Step::Blocked { moved: true } => last_progress = Instant::now(),
            Step::Blocked { moved: false } => {}
        }

        let idle = last_progress.elapsed();
        if idle >= io_timeout {
            return Err(SessionError::Timeout(io_timeout));
        }

        match poll.poll(&mut events, Some(io_timeout - idle)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(SessionError::from_io(e)),
        }
    }
}

/// Connect to the configured peer and register the stream for readiness.
fn open_tcp(config: &Config) -> io::Result<(Poll, TcpPump<mio::net::TcpStream>)> {
    let peer = resolve(&config.addr())?;
    info!(peer = %peer, "Connecting");

    let stream = std::net::TcpStream::connect_timeout(&peer, config.io_timeout)?;
    stream.set_nodelay(true)?;
    stream.set_nonblocking(true)?;
    let mut stream = mio::net::TcpStream::from_std(stream);

    let poll = Poll::new()?;
    poll.registry().register(
        &mut stream,
        SESSION_TOKEN,
        Interest::READABLE | Interest::WRITABLE,
    )?;

    let settings = FlowSettings::from(config);
    let flow = TcpFlow::new(payload::payload(), &settings, Instant::now());
    Ok((poll, TcpPump::new(stream, flow)))
}

/// Bind an ephemeral UDP socket connected to the configured peer.
fn open_udp(config: &Config) -> io::Result<(Poll, UdpPump<mio::net::UdpSocket>)> {
    let peer = resolve(&config.addr())?;
    info!(peer = %peer, "Connecting");

    let mut socket = mio::net::UdpSocket::from_std(connect_udp(peer)?);

    let poll = Poll::new()?;
    poll.registry().register(
        &mut socket,
        SESSION_TOKEN,
        Interest::READABLE | Interest::WRITABLE,
    )?;

    let settings = FlowSettings::from(config);
    let flow = UdpFlow::new(payload::payload(), &settings, Instant::now());
    Ok((poll, UdpPump::new(socket, flow)))
}

/// Run one TCP session against the configured peer.
pub fn run_tcp(config: &Config) -> io::Result<()> {
    let (mut poll, mut pump) = open_tcp(config)?;
    finish(drive(&mut poll, &mut pump, config.io_timeout), pump);
    Ok(())
}

/// Run one UDP session against the configured peer.
pub fn run_udp(config: &Config) -> io::Result<()> {
    let (mut poll, mut pump) = open_udp(config)?;
    finish(drive(&mut poll, &mut pump, config.io_timeout), pump);
    Ok(())
}

/// Close the transport and log how the session ended.
fn finish<P: Pump>(result: Result<(), SessionError>, pump: P) {
    let summary = pump.close();
    match result {
        Ok(()) => info!(
            sent = summary.sent,
            received = summary.received,
            "Byte limit reached, average rate {} kB/s",
            kb_per_sec(summary.throughput())
        ),
        Err(SessionError::Timeout(_)) => info!(
            sent = summary.sent,
            received = summary.received,
            "Timeout. Close connection."
        ),
        Err(e) if e.is_expected() => info!(
            sent = summary.sent,
            received = summary.received,
            "Session ended: {e}"
        ),
        Err(e) => error!(
            sent = summary.sent,
            received = summary.received,
            error = %e,
            "Session failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;
    use crate::server::tcp::TcpEchoServer;
    use crate::server::udp::UdpEchoServer;
    use bytes::Bytes;
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    /// In-memory echo peer: accepts at most `send_limit` bytes per send
    /// and only returns echoed bytes once `release` moves them to `echo`.
    struct ScriptedTransport {
        send_limit: usize,
        /// Bytes accepted by the transport, in order.
        accepted: Vec<u8>,
        /// Accepted bytes not yet released to the reader.
        in_flight: VecDeque<u8>,
        echo: VecDeque<u8>,
        /// Sends left before the transport starts returning WouldBlock.
        send_budget: usize,
        /// Buffer length offered to each receive call.
        read_sizes: Vec<usize>,
    }

    impl ScriptedTransport {
        fn new(send_limit: usize, send_budget: usize) -> Self {
            Self {
                send_limit,
                accepted: Vec::new(),
                in_flight: VecDeque::new(),
                echo: VecDeque::new(),
                send_budget,
                read_sizes: Vec::new(),
            }
        }

        fn release(&mut self, n: usize) {
            for _ in 0..n.min(self.in_flight.len()) {
                let b = self.in_flight.pop_front().unwrap();
                self.echo.push_back(b);
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn send(&mut self, buf: &[u8]) -> Result<IoStatus, SessionError> {
            if self.send_budget == 0 {
                return Ok(IoStatus::WouldBlock);
            }
            self.send_budget -= 1;
            let n = buf.len().min(self.send_limit);
            self.accepted.extend_from_slice(&buf[..n]);
            self.in_flight.extend(&buf[..n]);
            Ok(IoStatus::Ready(n))
        }

        fn receive(&mut self, buf: &mut [u8]) -> Result<IoStatus, SessionError> {
            self.read_sizes.push(buf.len());
            if self.echo.is_empty() {
                return Ok(IoStatus::WouldBlock);
            }
            let n = buf.len().min(self.echo.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.echo.pop_front().unwrap();
            }
            Ok(IoStatus::Ready(n))
        }

        fn close(self) {}
    }

    fn settings(max_inflight_bytes: usize) -> FlowSettings {
        FlowSettings {
            max_inflight_bytes,
            recv_chunk_size: 1024,
            report_interval: Duration::from_secs(2),
            verify: true,
            limit_bytes: None,
        }
    }

    #[test]
    fn test_partial_sends_reassemble_payload() {
        let payload = Bytes::from_static(b"the quick brown fox jumps over the lazy dog");
        let flow = TcpFlow::new(payload.clone(), &settings(1 << 20), Instant::now());
        // 7 bytes per send, 20 sends before blocking
        let mut pump = TcpPump::new(ScriptedTransport::new(7, 20), flow);

        assert_eq!(pump.advance().unwrap(), Step::Blocked { moved: true });

        // Each copy takes six 7-byte sends plus a 1-byte tail
        let accepted = &pump.transport_mut().accepted;
        assert_eq!(accepted.len(), 2 * payload.len() + 42);
        // Every accepted byte follows the repeating payload: nothing resent, nothing skipped
        for (i, b) in accepted.iter().enumerate() {
            assert_eq!(*b, payload[i % payload.len()], "byte {i}");
        }
    }

    #[test]
    fn test_backlog_stays_bounded() {
        let payload = Bytes::from_static(&[7u8; 300]);
        let max_inflight = 1000;
        let flow = TcpFlow::new(payload.clone(), &settings(max_inflight), Instant::now());
        let mut pump = TcpPump::new(ScriptedTransport::new(usize::MAX, usize::MAX), flow);

        for round in 0..50 {
            let step = pump.advance().unwrap();
            assert_eq!(step, Step::Blocked { moved: true });
            // Nothing echoed yet: the pump must have stopped on the backlog gate
            assert!(!pump.flow().can_send());
            assert!(pump.flow().backlog() <= max_inflight + payload.len());

            let release = 100 + (round * 37) % 500;
            pump.transport_mut().release(release);
        }
    }

    #[test]
    fn test_closed_peer_ends_session() {
        struct Eof;
        impl Transport for Eof {
            fn send(&mut self, buf: &[u8]) -> Result<IoStatus, SessionError> {
                Ok(IoStatus::Ready(buf.len()))
            }
            fn receive(&mut self, _buf: &mut [u8]) -> Result<IoStatus, SessionError> {
                Ok(IoStatus::Closed)
            }
            fn close(self) {}
        }

        let flow = TcpFlow::new(payload::payload(), &settings(8192), Instant::now());
        let mut pump = TcpPump::new(Eof, flow);
        assert!(matches!(pump.advance(), Err(SessionError::Closed)));
    }

    #[test]
    fn test_udp_pump_waits_while_lagging() {
        let payload = Bytes::from_static(&[1u8; 100]);
        let flow = UdpFlow::new(payload, &settings(250), Instant::now());
        let mut pump = UdpPump::new(ScriptedTransport::new(usize::MAX, usize::MAX), flow);

        // No echoes: sends continue until datalag exceeds the threshold
        assert_eq!(pump.advance().unwrap(), Step::Blocked { moved: true });
        assert_eq!(pump.flow().datalag(), 300);

        // A single echoed datagram brings the lag back under the threshold
        pump.transport.release(100);
        assert_eq!(pump.advance().unwrap(), Step::Blocked { moved: true });
        assert_eq!(pump.flow().datalag(), 300);
    }

    #[test]
    fn test_drive_times_out_without_progress() {
        struct Stalled;
        impl Transport for Stalled {
            fn send(&mut self, _buf: &[u8]) -> Result<IoStatus, SessionError> {
                Ok(IoStatus::WouldBlock)
            }
            fn receive(&mut self, _buf: &mut [u8]) -> Result<IoStatus, SessionError> {
                Ok(IoStatus::WouldBlock)
            }
            fn close(self) {}
        }

        let mut poll = Poll::new().unwrap();
        let flow = TcpFlow::new(payload::payload(), &settings(8192), Instant::now());
        let mut pump = TcpPump::new(Stalled, flow);

        let started = Instant::now();
        let result = drive(&mut poll, &mut pump, Duration::from_millis(50));
        assert!(matches!(result, Err(SessionError::Timeout(_))));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_reads_use_configured_chunk_size() {
        let payload = Bytes::from_static(b"the quick brown fox jumps over the lazy dog");
        let flow = TcpFlow::new(
            payload.clone(),
            &FlowSettings {
                recv_chunk_size: 16,
                ..settings(1 << 20)
            },
            Instant::now(),
        );
        // Three whole copies go out before the transport blocks
        let mut pump = TcpPump::new(ScriptedTransport::new(usize::MAX, 3), flow);
        assert_eq!(pump.advance().unwrap(), Step::Blocked { moved: true });
        assert_eq!(pump.flow().backlog(), 3 * payload.len());

        pump.transport_mut().release(3 * payload.len());
        assert_eq!(pump.advance().unwrap(), Step::Blocked { moved: true });
        assert_eq!(pump.flow().backlog(), 0);

        // 129 echoed bytes arrive as eight full chunks and a 1-byte tail
        let read_sizes = &pump.transport_mut().read_sizes;
        assert!(read_sizes.len() >= 10);
        assert!(read_sizes.iter().all(|&n| n == 16));
    }

    #[test]
    fn test_close_releases_transport() {
        struct Tracked(Rc<Cell<bool>>);
        impl Transport for Tracked {
            fn send(&mut self, buf: &[u8]) -> Result<IoStatus, SessionError> {
                Ok(IoStatus::Ready(buf.len()))
            }
            fn receive(&mut self, _buf: &mut [u8]) -> Result<IoStatus, SessionError> {
                Ok(IoStatus::WouldBlock)
            }
            fn close(self) {
                self.0.set(true);
            }
        }

        let closed = Rc::new(Cell::new(false));
        let payload = payload::payload();
        let flow = TcpFlow::new(payload.clone(), &settings(100), Instant::now());
        let mut pump = TcpPump::new(Tracked(Rc::clone(&closed)), flow);

        // One copy overshoots the 100-byte gate
        assert_eq!(pump.advance().unwrap(), Step::Blocked { moved: true });
        let summary = pump.close();

        assert!(closed.get());
        assert_eq!(summary.sent, payload.len() as u64);
        assert_eq!(summary.received, 0);
    }

    /// Run `poll_once` on a background thread until the returned flag is set.
    fn serve(mut poll_once: impl FnMut() + Send + 'static) -> (Arc<AtomicBool>, thread::JoinHandle<()>) {
        let stop = Arc::new(AtomicBool::new(false));
        let server_stop = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !server_stop.load(Ordering::Relaxed) {
                poll_once();
            }
        });
        (stop, handle)
    }

    fn client_config(port: u16, limit_bytes: u64) -> Config {
        Config {
            role: Role::Client,
            host: "127.0.0.1".to_string(),
            port,
            limit_bytes: Some(limit_bytes),
            ..Config::default()
        }
    }

    fn loopback_server_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Config::default()
        }
    }

    #[test]
    fn test_tcp_client_against_loopback_server() {
        let mut server = TcpEchoServer::bind(&loopback_server_config()).unwrap();
        let port = server.local_addr().unwrap().port();
        let (stop, handle) = serve(move || {
            server.poll_once(Some(Duration::from_millis(10))).unwrap();
        });

        let limit = 4 << 20;
        let config = client_config(port, limit);
        let (mut poll, mut pump) = open_tcp(&config).unwrap();
        let result = drive(&mut poll, &mut pump, Duration::from_secs(5));
        let summary = pump.close();

        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();

        assert!(result.is_ok(), "session ended with {result:?}");
        assert!(summary.received >= limit);
        assert!(summary.sent >= summary.received);
        // Never more than the gate plus one partial copy in flight
        let in_flight = summary.sent - summary.received;
        assert!(in_flight <= (config.max_inflight_bytes + payload::payload().len()) as u64);
    }

    #[test]
    fn test_udp_client_against_loopback_server() {
        let mut server = UdpEchoServer::bind(&loopback_server_config()).unwrap();
        let port = server.local_addr().unwrap().port();
        let (stop, handle) = serve(move || {
            server.poll_once(Some(Duration::from_millis(10))).unwrap();
        });

        let limit = 1 << 20;
        let (mut poll, mut pump) = open_udp(&client_config(port, limit)).unwrap();
        let result = drive(&mut poll, &mut pump, Duration::from_secs(5));
        let summary = pump.close();

        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();

        assert!(result.is_ok(), "session ended with {result:?}");
        assert!(summary.received >= limit);
        assert!(summary.sent >= summary.received);
    }
}
